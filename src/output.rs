//! Output artifact: the markdown text file a document's OCR result is written to.
//!
//! Layout:
//!
//! ```text
//! # OCR Result: scan.pdf
//!
//! **Total pages**: 3
//! **Mode**: streaming (sentence)
//!
//! ---
//!
//! ## Page 1
//!
//! ...text streamed in as it is flushed...
//!
//! ---
//!
//! ## Page 2
//! ...
//!
//! ---
//!
//! **Total processing time**: 12.34s
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stream::{Durability, SaveMode};

/// Destination for committed page text.
pub trait OutputSink: Send {
    /// Write `text` and persist it according to `durability`.
    fn commit(&mut self, text: &str, durability: Durability) -> io::Result<()>;
}

/// Header values written at the top of a fresh output file.
#[derive(Debug, Clone)]
pub struct DocumentHeader {
    pub title: String,
    pub total_pages: u32,
    pub streaming: bool,
    pub save_mode: SaveMode,
}

impl DocumentHeader {
    pub fn mode_label(&self) -> String {
        if self.streaming {
            format!("streaming ({})", self.save_mode)
        } else {
            "non-streaming".to_string()
        }
    }
}

/// Output path for a source file: `<stem>.md`, or `<stem>.<mode>.md` when
/// streaming with a mode other than token.
pub fn default_output_path(source: &Path, streaming: bool, save_mode: SaveMode) -> PathBuf {
    if streaming && save_mode != SaveMode::Token {
        source.with_extension(format!("{}.md", save_mode))
    } else {
        source.with_extension("md")
    }
}

/// The per-document output file. A disabled document discards everything.
pub struct OutputDocument {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    multi_page: bool,
}

impl OutputDocument {
    /// Truncate `path` and write the document header.
    pub fn create(path: &Path, header: &DocumentHeader) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut doc = Self {
            path: Some(path.to_path_buf()),
            writer: Some(BufWriter::new(file)),
            multi_page: header.total_pages > 1,
        };

        let mut text = format!("# OCR Result: {}\n\n", header.title);
        if doc.multi_page {
            text.push_str(&format!("**Total pages**: {}\n", header.total_pages));
        }
        text.push_str(&format!("**Mode**: {}\n\n---\n\n", header.mode_label()));
        doc.write_block(&text)?;
        Ok(doc)
    }

    /// Reopen an existing output file to continue an interrupted run.
    ///
    /// Falls back to [`OutputDocument::create`] if the file is gone.
    pub fn resume(path: &Path, header: &DocumentHeader) -> io::Result<Self> {
        if !path.exists() {
            return Self::create(path, header);
        }
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Some(BufWriter::new(file)),
            multi_page: header.total_pages > 1,
        })
    }

    /// Output that goes nowhere (`--no-save`).
    pub fn disabled(total_pages: u32) -> Self {
        Self {
            path: None,
            writer: None,
            multi_page: total_pages > 1,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Heading that opens a page section.
    pub fn begin_page(&mut self, page: u32) -> io::Result<()> {
        if self.multi_page {
            self.write_block(&format!("## Page {}\n\n", page))?;
        }
        Ok(())
    }

    /// Note that an attempt failed; whatever it already wrote stays above.
    pub fn annotate_failed_attempt(&mut self, attempt: u32, reason: &str) -> io::Result<()> {
        self.write_block(&format!("\n\n*[Attempt {} failed: {}]*\n\n", attempt, reason))
    }

    /// Placeholder for a page that produced no usable text.
    pub fn mark_empty(&mut self) -> io::Result<()> {
        self.write_block("*[No text extracted]*\n")
    }

    /// Placeholder for a page that was skipped after failing.
    pub fn mark_skipped(&mut self, reason: &str) -> io::Result<()> {
        self.write_block(&format!("*[Text extraction failed, page skipped: {}]*\n", reason))
    }

    /// Placeholder for the page a fatal error stopped the run on.
    pub fn mark_stopped(&mut self, reason: &str) -> io::Result<()> {
        self.write_block(&format!(
            "*[Processing stopped: {}. Run again to resume.]*\n",
            reason
        ))
    }

    /// Separator closing a page section.
    pub fn end_page(&mut self, is_last: bool) -> io::Result<()> {
        if !is_last {
            self.write_block("\n\n---\n\n")?;
        }
        Ok(())
    }

    /// Footer with the processing time of the run that finished the document.
    pub fn finish(&mut self, elapsed: Duration) -> io::Result<()> {
        self.write_block(&format!(
            "\n\n---\n\n**Total processing time**: {:.2}s\n",
            elapsed.as_secs_f64()
        ))
    }

    fn write_block(&mut self, text: &str) -> io::Result<()> {
        self.commit(text, Durability::Buffered)
    }
}

impl OutputSink for OutputDocument {
    fn commit(&mut self, text: &str, durability: Durability) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        if durability == Durability::Synced {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for OutputDocument {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}
