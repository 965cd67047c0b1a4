//! Cross-run progress checkpoints.
//!
//! A [`ProgressRecord`] tracks which pages of a document are resolved so an
//! interrupted run can pick up where it stopped. The record is saved after
//! every page and removed once the document is complete.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Version written into every progress file. Files with another version are rejected.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Page {page} is outside 1..={total_pages}")]
    PageOutOfRange { page: u32, total_pages: u32 },

    #[error("Unsupported progress format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Corrupt progress file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolution state of one document's pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub format_version: u32,
    pub document_identity: String,
    pub total_pages: u32,
    pub completed_pages: BTreeSet<u32>,
    /// Last failure reason per page; kept for skipped pages.
    pub failed_pages: BTreeMap<u32, String>,
    pub skipped_pages: BTreeSet<u32>,
    pub last_update: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(document_identity: impl Into<String>, total_pages: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            document_identity: document_identity.into(),
            total_pages,
            completed_pages: BTreeSet::new(),
            failed_pages: BTreeMap::new(),
            skipped_pages: BTreeSet::new(),
            last_update: Utc::now(),
        }
    }

    pub fn mark_completed(&mut self, page: u32) -> Result<(), ProgressError> {
        self.check_page(page)?;
        self.skipped_pages.remove(&page);
        self.failed_pages.remove(&page);
        self.completed_pages.insert(page);
        self.touch();
        Ok(())
    }

    /// Record a failed attempt. The page stays pending.
    pub fn record_failure(&mut self, page: u32, reason: impl Into<String>) -> Result<(), ProgressError> {
        self.check_page(page)?;
        self.completed_pages.remove(&page);
        self.failed_pages.insert(page, reason.into());
        self.touch();
        Ok(())
    }

    /// Give up on a page; the failure reason stays in `failed_pages`.
    pub fn mark_skipped(&mut self, page: u32, reason: impl Into<String>) -> Result<(), ProgressError> {
        self.check_page(page)?;
        self.completed_pages.remove(&page);
        self.failed_pages.insert(page, reason.into());
        self.skipped_pages.insert(page);
        self.touch();
        Ok(())
    }

    /// Pages neither completed nor skipped, ascending.
    pub fn pending_pages(&self) -> Vec<u32> {
        (1..=self.total_pages)
            .filter(|p| !self.completed_pages.contains(p) && !self.skipped_pages.contains(p))
            .collect()
    }

    pub fn resolved_count(&self) -> usize {
        self.completed_pages.len() + self.skipped_pages.len()
    }

    pub fn is_complete(&self) -> bool {
        self.resolved_count() == self.total_pages as usize
    }

    fn check_page(&self, page: u32) -> Result<(), ProgressError> {
        if page == 0 || page > self.total_pages {
            return Err(ProgressError::PageOutOfRange {
                page,
                total_pages: self.total_pages,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

/// Persistence for progress records, keyed by document identity.
pub trait ProgressStore: Send + Sync {
    /// The stored record for `identity`, or `None` if there is none.
    fn load(&self, identity: &str) -> Result<Option<ProgressRecord>, ProgressError>;
    fn save(&self, record: &ProgressRecord) -> Result<(), ProgressError>;
    fn delete(&self, identity: &str) -> Result<(), ProgressError>;
}

/// Stores one document's record in a JSON file next to the document.
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `scan.pdf` is tracked in `scan.pdf.progress`.
    pub fn for_document(document: &Path) -> Self {
        let mut name = document.as_os_str().to_os_string();
        name.push(".progress");
        Self::new(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, message: impl ToString) -> ProgressError {
        ProgressError::Corrupt {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }
}

/// Only the version, so a future layout can be rejected cleanly.
#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl ProgressStore for FileProgressStore {
    fn load(&self, identity: &str) -> Result<Option<ProgressRecord>, ProgressError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let probe: VersionProbe = serde_json::from_str(&content).map_err(|e| self.corrupt(e))?;
        if probe.format_version != FORMAT_VERSION {
            return Err(ProgressError::UnsupportedVersion {
                found: probe.format_version,
                expected: FORMAT_VERSION,
            });
        }

        let record: ProgressRecord = serde_json::from_str(&content).map_err(|e| self.corrupt(e))?;
        if record.document_identity != identity {
            debug!(
                "Progress file {} belongs to {}, not {}",
                self.path.display(),
                record.document_identity,
                identity
            );
            return Ok(None);
        }

        Ok(Some(record))
    }

    fn save(&self, record: &ProgressRecord) -> Result<(), ProgressError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let json = serde_json::to_string_pretty(record).map_err(|e| self.corrupt(e))?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| ProgressError::Io(e.error))?;

        debug!(
            "Saved progress for {} ({}/{} pages resolved)",
            record.document_identity,
            record.resolved_count(),
            record.total_pages
        );
        Ok(())
    }

    fn delete(&self, _identity: &str) -> Result<(), ProgressError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
