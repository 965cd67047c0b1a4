//! PDF pages rendered with poppler's `pdfinfo` and `pdftoppm`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use super::{file_name_of, path_identity, ImagePayload, PageSource, SourceError};

const PDFINFO: &str = "pdfinfo";
const PDFTOPPM: &str = "pdftoppm";

/// A PDF document. Pages are rasterized one at a time, on demand.
pub struct PdfSource {
    path: PathBuf,
    identity: String,
    name: String,
    page_count: u32,
    dpi: u32,
}

impl PdfSource {
    /// Open `path` and read its page count.
    pub async fn open(path: &Path, dpi: u32) -> Result<Self, SourceError> {
        require_tool(PDFINFO)?;
        require_tool(PDFTOPPM)?;

        let page_count = read_page_count(path).await?;
        debug!("{}: {} pages", path.display(), page_count);

        Ok(Self {
            path: path.to_path_buf(),
            identity: path_identity(path),
            name: file_name_of(path),
            page_count,
            dpi,
        })
    }
}

#[async_trait]
impl PageSource for PdfSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    async fn render_page(&self, page: u32) -> Result<ImagePayload, SourceError> {
        if page == 0 || page > self.page_count {
            return Err(SourceError::PageOutOfRange {
                page,
                total_pages: self.page_count,
            });
        }

        let temp_dir = TempDir::new()?;
        let output_prefix = temp_dir.path().join("page");
        let page_str = page.to_string();
        let dpi_str = self.dpi.to_string();

        let output = Command::new(PDFTOPPM)
            .args(["-jpeg", "-r", &dpi_str, "-f", &page_str, "-l", &page_str, "-singlefile"])
            .arg(&self.path)
            .arg(&output_prefix)
            .output()
            .await
            .map_err(|e| tool_error(PDFTOPPM, e))?;

        if !output.status.success() {
            return Err(SourceError::RenderFailed(format!(
                "pdftoppm failed on page {}: {}",
                page,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // -singlefile writes exactly <prefix>.jpg
        let image_path = output_prefix.with_extension("jpg");
        let bytes = tokio::fs::read(&image_path).await.map_err(|_| {
            SourceError::RenderFailed(format!("No image generated for page {}", page))
        })?;

        Ok(ImagePayload {
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            mime_type: "image/jpeg",
        })
    }
}

fn require_tool(name: &str) -> Result<(), SourceError> {
    which::which(name)
        .map(|_| ())
        .map_err(|_| SourceError::ToolNotFound(format!("{} (install poppler-utils)", name)))
}

fn tool_error(name: &str, e: std::io::Error) -> SourceError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SourceError::ToolNotFound(format!("{} (install poppler-utils)", name))
    } else {
        SourceError::Io(e)
    }
}

async fn read_page_count(path: &Path) -> Result<u32, SourceError> {
    let output = Command::new(PDFINFO)
        .arg(path)
        .output()
        .await
        .map_err(|e| tool_error(PDFINFO, e))?;

    if !output.status.success() {
        return Err(SourceError::RenderFailed(format!(
            "pdfinfo failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_page_count(&String::from_utf8_lossy(&output.stdout))
        .filter(|&n| n > 0)
        .ok_or_else(|| SourceError::RenderFailed("pdfinfo reported no pages".to_string()))
}

fn parse_page_count(pdfinfo_output: &str) -> Option<u32> {
    pdfinfo_output
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|n| n.parse().ok())
}
