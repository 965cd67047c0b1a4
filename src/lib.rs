//! ocrstream - streaming OCR client for OpenAI-compatible vision servers.
//!
//! Drives PDFs and images page by page through a remote OCR model, writes
//! the recognized text to a markdown file as it streams in, and checkpoints
//! progress so interrupted runs resume where they stopped.

pub mod cli;
pub mod client;
pub mod config;
pub mod document;
pub mod events;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod session;
pub mod stream;
