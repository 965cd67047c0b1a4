//! Progress events emitted while a document is processed.
//!
//! The library never prints; front ends subscribe to these instead.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::session::{PageError, SessionStats};

/// Events emitted during OCR processing.
#[derive(Debug, Clone)]
pub enum OcrEvent {
    /// Processing of a document started.
    DocumentStarted {
        name: String,
        total_pages: u32,
        /// Pages already resolved by an earlier run.
        resumed_pages: usize,
        output_path: Option<PathBuf>,
    },
    /// A page attempt started.
    PageStarted { page: u32, total_pages: u32, attempt: u32 },
    /// Incremental text for the page in progress.
    Delta { page: u32, text: String },
    /// Page extracted successfully.
    PageCompleted { page: u32, stats: SessionStats },
    /// A page attempt failed and will be tried again.
    PageRetrying { page: u32, attempt: u32, error: PageError },
    /// Page given up on and recorded as skipped.
    PageSkipped { page: u32, error: PageError },
    /// A page failed fatally; the run stops and can be resumed later.
    DocumentStopped { page: u32, error: PageError },
    /// Every page was completed or skipped.
    DocumentCompleted {
        completed: usize,
        skipped: usize,
        elapsed_secs: f64,
    },
}

/// Optional sending half of the event channel.
///
/// Send failures are ignored: a front end that stopped listening must not
/// stop the document from being processed.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<OcrEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<OcrEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sender that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn emit(&self, event: OcrEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
