//! Page session results, errors and statistics.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::client::TransportError;

/// Why a page attempt did not complete.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PageError {
    /// Server unreachable, non-2xx status, or broken response body.
    #[error("API error: {message}")]
    Api { status: Option<u16>, message: String },

    /// The page exceeded its wall-clock budget.
    #[error("Timed out after {}s", .limit.as_secs_f64())]
    Timeout { limit: Duration },

    /// The model is looping.
    #[error("Repetition detected ({consecutive} consecutive similar windows)")]
    RepetitionDetected { consecutive: usize },

    /// The page produced more tokens than allowed.
    #[error("Token limit exceeded ({limit} tokens)")]
    TokenLimitExceeded { limit: usize },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl PageError {
    /// Failures that indicate a bad page rather than a transient fault.
    /// Retrying the identical request is not expected to help.
    pub fn is_skip_eligible(&self) -> bool {
        matches!(
            self,
            PageError::Timeout { .. }
                | PageError::RepetitionDetected { .. }
                | PageError::TokenLimitExceeded { .. }
        )
    }

    /// Short stable name, used in logs and the progress file.
    pub fn kind(&self) -> &'static str {
        match self {
            PageError::Api { .. } => "api_error",
            PageError::Timeout { .. } => "timeout",
            PageError::RepetitionDetected { .. } => "repetition_detected",
            PageError::TokenLimitExceeded { .. } => "token_limit_exceeded",
            PageError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<TransportError> for PageError {
    fn from(e: TransportError) -> Self {
        PageError::Api {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

/// Counters for one page session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub token_count: usize,
    pub flush_count: usize,
    pub started_at: Instant,
    pub first_token_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl SessionStats {
    pub fn start() -> Self {
        Self {
            token_count: 0,
            flush_count: 0,
            started_at: Instant::now(),
            first_token_at: None,
            finished_at: None,
        }
    }

    pub fn record_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
        self.token_count += 1;
    }

    pub fn record_flush(&mut self) {
        self.flush_count += 1;
    }

    pub fn finish(&mut self) {
        self.finished_at.get_or_insert_with(Instant::now);
    }

    /// Time since the session started, or its total duration once finished.
    pub fn elapsed(&self) -> Duration {
        match self.finished_at {
            Some(end) => end.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token_at
            .map(|t| t.duration_since(self.started_at))
    }

    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.token_count as f64 / secs
        } else {
            0.0
        }
    }
}
