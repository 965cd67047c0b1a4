//! Drives a whole document through page sessions.
//!
//! Pages are processed one at a time in ascending order. After each page is
//! resolved the progress record is checkpointed, so a later run resumes at
//! the first unresolved page.

mod policy;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ChatRequest, OcrTransport};
use crate::document::PageSource;
use crate::events::{EventSender, OcrEvent};
use crate::output::{DocumentHeader, OutputDocument};
use crate::progress::{ProgressError, ProgressRecord, ProgressStore};
use crate::session::{PageError, PageOutcome, PageSession, SessionConfig, SessionStats};

pub use policy::{decide, PageDisposition, RetryPolicy};

/// Errors that stop the orchestrator itself, as opposed to page failures.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Progress store error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Output error: {0}")]
    Output(#[from] std::io::Error),
}

/// Model parameters and prompts for each page request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub model: String,
    /// Prompt for single-page documents.
    pub prompt: String,
    /// Prompt for multi-page documents; `{page}` is replaced by the page number.
    pub page_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl RequestOptions {
    pub fn prompt_for(&self, page: u32, total_pages: u32) -> String {
        if total_pages > 1 {
            self.page_prompt.replace("{page}", &page.to_string())
        } else {
            self.prompt.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentStatus {
    /// Every page was completed or skipped.
    Completed,
    /// A page failed fatally; progress is kept for a later run.
    Stopped { page: u32, error: PageError },
}

/// Summary of one orchestrator run.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub total_pages: u32,
    /// Pages completed in this run.
    pub completed: usize,
    /// Pages skipped in this run.
    pub skipped: usize,
    /// Pages already resolved by earlier runs.
    pub resumed: usize,
    /// Tokens received in this run.
    pub tokens: usize,
    pub elapsed: Duration,
    pub status: DocumentStatus,
}

impl DocumentReport {
    pub fn is_completed(&self) -> bool {
        self.status == DocumentStatus::Completed
    }
}

pub struct PageOrchestrator {
    transport: Arc<dyn OcrTransport>,
    session: SessionConfig,
    policy: RetryPolicy,
    request: RequestOptions,
    events: EventSender,
    resume: bool,
}

impl PageOrchestrator {
    pub fn new(
        transport: Arc<dyn OcrTransport>,
        session: SessionConfig,
        policy: RetryPolicy,
        request: RequestOptions,
    ) -> Self {
        Self {
            transport,
            session,
            policy,
            request,
            events: EventSender::disabled(),
            resume: true,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Ignore stored progress and start from page 1.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Process every unresolved page of `source`.
    ///
    /// Page text goes to `output_path` (nothing is written when `None`);
    /// progress is checkpointed in `store`.
    pub async fn run(
        &self,
        source: &dyn PageSource,
        output_path: Option<&Path>,
        store: &dyn ProgressStore,
    ) -> Result<DocumentReport, OrchestratorError> {
        let started = Instant::now();
        let total_pages = source.page_count();
        let identity = source.identity();

        let mut record = self
            .load_progress(store, identity, total_pages)
            .unwrap_or_else(|| ProgressRecord::new(identity, total_pages));
        let resumed = record.resolved_count();
        let pending = record.pending_pages();

        let header = DocumentHeader {
            title: source.display_name().to_string(),
            total_pages,
            streaming: self.request.stream,
            save_mode: self.session.save_mode,
        };
        let mut output = match output_path {
            Some(path) if resumed > 0 => {
                let mut doc = OutputDocument::resume(path, &header)?;
                // Close whatever the interrupted run left open.
                doc.end_page(false)?;
                doc
            }
            Some(path) => OutputDocument::create(path, &header)?,
            None => OutputDocument::disabled(total_pages),
        };

        if resumed > 0 {
            info!(
                "Resuming {}: {}/{} pages already processed",
                source.display_name(),
                resumed,
                total_pages
            );
        }

        self.events
            .emit(OcrEvent::DocumentStarted {
                name: source.display_name().to_string(),
                total_pages,
                resumed_pages: resumed,
                output_path: output_path.map(Path::to_path_buf),
            })
            .await;

        let mut completed = 0;
        let mut skipped = 0;
        let mut tokens = 0;
        let last_page = pending.last().copied();

        for page in pending {
            output.begin_page(page)?;

            let mut attempt = 1;
            loop {
                self.events
                    .emit(OcrEvent::PageStarted {
                        page,
                        total_pages,
                        attempt,
                    })
                    .await;

                let outcome = self.attempt_page(source, page, total_pages, &mut output).await;
                tokens += outcome.stats.token_count;

                let error = match outcome.result {
                    Ok(text) => {
                        if text.trim().is_empty() {
                            output.mark_empty()?;
                        }
                        record.mark_completed(page)?;
                        completed += 1;
                        debug!(
                            "Page {}/{} done: {} tokens in {:.2}s",
                            page,
                            total_pages,
                            outcome.stats.token_count,
                            outcome.stats.elapsed().as_secs_f64()
                        );
                        self.events
                            .emit(OcrEvent::PageCompleted {
                                page,
                                stats: outcome.stats,
                            })
                            .await;
                        break;
                    }
                    Err(error) => error,
                };

                let reason = error.to_string();
                warn!("Page {} attempt {} failed: {}", page, attempt, reason);
                record.record_failure(page, reason.clone())?;
                output.annotate_failed_attempt(attempt, &reason)?;

                match decide(&error, attempt, &self.policy) {
                    PageDisposition::Retry => {
                        self.events
                            .emit(OcrEvent::PageRetrying {
                                page,
                                attempt,
                                error,
                            })
                            .await;
                        let delay = self.policy.backoff(attempt);
                        if !delay.is_zero() {
                            debug!("Waiting {:?} before retrying page {}", delay, page);
                            tokio::time::sleep(delay).await;
                        }
                        attempt += 1;
                    }
                    PageDisposition::Skip => {
                        record.mark_skipped(page, reason.clone())?;
                        output.mark_skipped(&reason)?;
                        skipped += 1;
                        self.events.emit(OcrEvent::PageSkipped { page, error }).await;
                        break;
                    }
                    PageDisposition::Abort => {
                        output.mark_stopped(&reason)?;
                        store.save(&record)?;
                        self.events
                            .emit(OcrEvent::DocumentStopped {
                                page,
                                error: error.clone(),
                            })
                            .await;
                        return Ok(DocumentReport {
                            total_pages,
                            completed,
                            skipped,
                            resumed,
                            tokens,
                            elapsed: started.elapsed(),
                            status: DocumentStatus::Stopped { page, error },
                        });
                    }
                }
            }

            output.end_page(Some(page) == last_page)?;
            store.save(&record)?;
        }

        let elapsed = started.elapsed();
        output.finish(elapsed)?;
        store.delete(identity)?;

        info!(
            "{}: {} pages completed, {} skipped in {:.2}s",
            source.display_name(),
            completed,
            skipped,
            elapsed.as_secs_f64()
        );
        self.events
            .emit(OcrEvent::DocumentCompleted {
                completed,
                skipped,
                elapsed_secs: elapsed.as_secs_f64(),
            })
            .await;

        Ok(DocumentReport {
            total_pages,
            completed,
            skipped,
            resumed,
            tokens,
            elapsed,
            status: DocumentStatus::Completed,
        })
    }

    /// A stored record usable for this document, if any.
    fn load_progress(
        &self,
        store: &dyn ProgressStore,
        identity: &str,
        total_pages: u32,
    ) -> Option<ProgressRecord> {
        if !self.resume {
            return None;
        }

        match store.load(identity) {
            Ok(Some(record)) if record.total_pages == total_pages => Some(record),
            Ok(Some(record)) => {
                warn!(
                    "Page count changed ({} -> {}), starting fresh",
                    record.total_pages, total_pages
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable progress: {}", e);
                None
            }
        }
    }

    async fn attempt_page(
        &self,
        source: &dyn PageSource,
        page: u32,
        total_pages: u32,
        output: &mut OutputDocument,
    ) -> PageOutcome {
        let image = match source.render_page(page).await {
            Ok(image) => image,
            Err(e) => {
                let mut stats = SessionStats::start();
                stats.finish();
                return PageOutcome {
                    result: Err(PageError::Unexpected(format!("failed to render page: {}", e))),
                    stats,
                };
            }
        };

        let request = ChatRequest::vision(
            &self.request.model,
            &self.request.prompt_for(page, total_pages),
            image.data_url(),
            self.request.temperature,
            self.request.max_tokens,
            self.request.stream,
        );

        PageSession::new(self.transport.as_ref(), &self.session, &self.events, page)
            .run(&request, output)
            .await
    }
}
