//! One OCR attempt for one page.
//!
//! A [`PageSession`] issues the request, decodes the streamed deltas, runs
//! them past the repetition guard and the page budgets, and commits text to
//! the output sink according to the flush policy:
//!
//! ```text
//! Idle -> Requesting -> Streaming -> Completed
//!                                 \-> Aborted | Failed
//! ```
//!
//! Sessions are single-use. Retries construct a fresh session.

mod types;

use std::time::Duration;

use tracing::{debug, warn};

use crate::client::{ChatRequest, OcrTransport};
use crate::events::{EventSender, OcrEvent};
use crate::output::OutputSink;
use crate::stream::{GuardVerdict, RepetitionConfig, RepetitionGuard, SaveMode, StreamDecoder};

pub use types::{PageError, SessionStats};

/// Per-page budgets and output behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Flush granularity for streamed text.
    pub save_mode: SaveMode,
    /// Wall-clock budget for one streamed page.
    pub page_timeout: Duration,
    /// Deadline for a single non-streaming request.
    pub request_timeout: Duration,
    /// Maximum deltas accepted for one page.
    pub max_page_tokens: usize,
    pub repetition: RepetitionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_mode: SaveMode::Token,
            page_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(60),
            max_page_tokens: 8192,
            repetition: RepetitionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

/// What a session produced: the page text or the reason it failed, plus counters.
#[derive(Debug)]
pub struct PageOutcome {
    pub result: Result<String, PageError>,
    pub stats: SessionStats,
}

/// Drives one page attempt from request to result.
pub struct PageSession<'a> {
    transport: &'a dyn OcrTransport,
    config: &'a SessionConfig,
    events: &'a EventSender,
    page: u32,
    state: SessionState,
    guard: RepetitionGuard,
    stats: SessionStats,
    buffer: String,
    text: String,
}

impl<'a> PageSession<'a> {
    pub fn new(
        transport: &'a dyn OcrTransport,
        config: &'a SessionConfig,
        events: &'a EventSender,
        page: u32,
    ) -> Self {
        Self {
            transport,
            config,
            events,
            page,
            state: SessionState::Idle,
            guard: RepetitionGuard::new(config.repetition.clone()),
            stats: SessionStats::start(),
            buffer: String::new(),
            text: String::new(),
        }
    }

    /// Run the attempt. Streaming is chosen by `request.stream`.
    pub async fn run(mut self, request: &ChatRequest, sink: &mut dyn OutputSink) -> PageOutcome {
        let result = if request.stream {
            self.run_streaming(request, sink).await
        } else {
            self.run_blocking(request, sink).await
        };

        let result = match result {
            Ok(()) => {
                self.transition(SessionState::Completed);
                Ok(std::mem::take(&mut self.text))
            }
            Err(e) => {
                // Text produced before the failure stays in the output.
                if let Err(io_err) = self.flush_buffer(sink) {
                    warn!("Page {}: failed to write partial output: {}", self.page, io_err);
                }
                let state = match e {
                    PageError::RepetitionDetected { .. } => SessionState::Aborted,
                    _ => SessionState::Failed,
                };
                self.transition(state);
                Err(e)
            }
        };

        self.stats.finish();
        PageOutcome {
            result,
            stats: self.stats,
        }
    }

    async fn run_blocking(
        &mut self,
        request: &ChatRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PageError> {
        self.transition(SessionState::Requesting);

        let text = self
            .transport
            .complete(request, self.config.request_timeout)
            .await?;

        if !text.is_empty() {
            self.stats.record_token();
            self.commit(&text, sink)?;
            self.events
                .emit(OcrEvent::Delta {
                    page: self.page,
                    text: text.clone(),
                })
                .await;
        }
        self.text = text;
        Ok(())
    }

    async fn run_streaming(
        &mut self,
        request: &ChatRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PageError> {
        self.transition(SessionState::Requesting);

        let lines = match tokio::time::timeout(
            self.remaining_budget(),
            self.transport.open_stream(request),
        )
        .await
        {
            Ok(lines) => lines?,
            Err(_) => return Err(self.timeout_error()),
        };

        self.transition(SessionState::Streaming);
        let mut decoder = StreamDecoder::new(lines);

        loop {
            // Reads are bounded by what is left of the page budget, so a
            // stalled connection also ends in a timeout.
            let next = match tokio::time::timeout(self.remaining_budget(), decoder.next_event())
                .await
            {
                Ok(next) => next,
                Err(_) => return Err(self.timeout_error()),
            };

            match next {
                Some(Ok(event)) if event.is_terminal => break,
                Some(Ok(event)) => self.accept_delta(event.content, sink).await?,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    warn!(
                        "Page {}: stream ended without a terminal marker",
                        self.page
                    );
                    break;
                }
            }
        }

        self.flush_buffer(sink)?;
        Ok(())
    }

    async fn accept_delta(
        &mut self,
        delta: String,
        sink: &mut dyn OutputSink,
    ) -> Result<(), PageError> {
        if self.stats.elapsed() > self.config.page_timeout {
            return Err(self.timeout_error());
        }

        if self.stats.token_count >= self.config.max_page_tokens {
            return Err(PageError::TokenLimitExceeded {
                limit: self.config.max_page_tokens,
            });
        }

        if let GuardVerdict::Abort { consecutive } = self.guard.observe(&delta) {
            warn!(
                "Page {}: repetition detected after {} tokens",
                self.page, self.stats.token_count
            );
            return Err(PageError::RepetitionDetected { consecutive });
        }

        self.stats.record_token();
        self.text.push_str(&delta);
        self.buffer.push_str(&delta);

        if self.config.save_mode.should_flush(&self.buffer) {
            self.flush_buffer(sink)?;
        }

        self.events
            .emit(OcrEvent::Delta {
                page: self.page,
                text: delta,
            })
            .await;
        Ok(())
    }

    fn flush_buffer(&mut self, sink: &mut dyn OutputSink) -> Result<(), PageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        self.commit(&pending, sink)
    }

    fn commit(&mut self, text: &str, sink: &mut dyn OutputSink) -> Result<(), PageError> {
        sink.commit(text, self.config.save_mode.durability())
            .map_err(|e| PageError::Unexpected(format!("failed to write output: {}", e)))?;
        self.stats.record_flush();
        Ok(())
    }

    fn remaining_budget(&self) -> Duration {
        self.config.page_timeout.saturating_sub(self.stats.elapsed())
    }

    fn timeout_error(&self) -> PageError {
        PageError::Timeout {
            limit: self.config.page_timeout,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Page {}: {:?} -> {:?}", self.page, self.state, next);
        self.state = next;
    }
}
