//! Client side of the OCR inference server.
//!
//! The server speaks an OpenAI-compatible chat-completions API (llama.cpp,
//! vLLM and similar). [`OcrTransport`] is the seam the session talks to;
//! [`HttpTransport`] is the real implementation.

mod http;
mod wire;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::LineSplitter;

pub use http::HttpTransport;
pub use wire::{ChatContent, ChatMessage, ChatRequest, ChatResponse, ImageUrl};

/// Lines of a streaming response body, in arrival order.
pub type LineStream = BoxStream<'static, Result<String, TransportError>>;

/// Errors from talking to the inference server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl TransportError {
    /// HTTP status, when the server answered with one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connection(e.to_string())
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Body(e.to_string())
        }
    }
}

/// Where the inference server lives and which model it should run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the server (default: http://localhost:8080)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name sent with every request
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_model() -> String {
    "LightOnOCR-1B-1025".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

impl EndpointConfig {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base())
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base())
    }
}

/// Request/response seam between a page session and the inference server.
#[async_trait]
pub trait OcrTransport: Send + Sync {
    /// Send a non-streaming request and return the full response text.
    async fn complete(&self, request: &ChatRequest, timeout: Duration)
        -> Result<String, TransportError>;

    /// Send a streaming request and return the response body as lines.
    ///
    /// Non-2xx responses are reported as [`TransportError::Status`] here,
    /// before any line is produced.
    async fn open_stream(&self, request: &ChatRequest) -> Result<LineStream, TransportError>;

    /// Whether the server answers its health probe.
    async fn is_healthy(&self) -> bool;
}

struct LineState {
    chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>,
    splitter: LineSplitter,
    ready: VecDeque<String>,
    done: bool,
}

/// Turn a stream of raw body chunks into a stream of lines.
pub fn lines_from_chunks(chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>) -> LineStream {
    let state = LineState {
        chunks,
        splitter: LineSplitter::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.splitter.push(&chunk)),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.splitter.finish());
                }
            }
        }
    })
    .boxed()
}
