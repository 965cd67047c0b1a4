//! Page sources: turn an input file into per-page image payloads.

mod image;
mod pdf;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use image::ImageFileSource;
pub use pdf::PdfSource;

/// Extensions accepted as input.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "bmp", "gif", "tiff"];

/// Errors that can occur while reading or rendering a document.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Rendering failed: {0}")]
    RenderFailed(String),

    #[error("Page {page} is outside 1..={total_pages}")]
    PageOutOfRange { page: u32, total_pages: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A base64-encoded page image ready to send to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub base64: String,
    pub mime_type: &'static str,
}

impl ImagePayload {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// A document that can be processed page by page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Stable key used to match progress records across runs.
    fn identity(&self) -> &str;

    /// Name shown in output headers and console messages.
    fn display_name(&self) -> &str;

    fn page_count(&self) -> u32;

    /// Render one page (1-based).
    async fn render_page(&self, page: u32) -> Result<ImagePayload, SourceError>;
}

/// Whether `path` has an extension this tool can process.
pub fn is_supported(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Open `path` as a PDF or image source based on its extension.
pub async fn open_source(path: &Path, dpi: u32) -> Result<Box<dyn PageSource>, SourceError> {
    if !path.exists() {
        return Err(SourceError::NotFound(path.to_path_buf()));
    }

    match extension_of(path).as_deref() {
        Some("pdf") => Ok(Box::new(PdfSource::open(path, dpi).await?)),
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext) => Ok(Box::new(ImageFileSource::open(path)?)),
        other => Err(SourceError::UnsupportedFileType(
            other.unwrap_or("(none)").to_string(),
        )),
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Identity derived from the absolute path, so a renamed copy starts fresh.
fn path_identity(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
