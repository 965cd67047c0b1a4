use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;

use super::{file_name_of, path_identity, ImagePayload, PageSource, SourceError};

/// A single image file, processed as a one-page document.
pub struct ImageFileSource {
    path: PathBuf,
    identity: String,
    name: String,
}

impl ImageFileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if !path.is_file() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            identity: path_identity(path),
            name: file_name_of(path),
        })
    }

    fn mime_type(&self) -> &'static str {
        let ext = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            Some("bmp") => "image/bmp",
            Some("tiff") => "image/tiff",
            _ => "image/jpeg",
        }
    }
}

#[async_trait]
impl PageSource for ImageFileSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn page_count(&self) -> u32 {
        1
    }

    async fn render_page(&self, page: u32) -> Result<ImagePayload, SourceError> {
        if page != 1 {
            return Err(SourceError::PageOutOfRange {
                page,
                total_pages: 1,
            });
        }

        let bytes = tokio::fs::read(&self.path).await?;
        Ok(ImagePayload {
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            mime_type: self.mime_type(),
        })
    }
}
