//! Flush policy: decides when accumulated text is committed to the output sink.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Terminators that close a sentence. Wide punctuation closes a sentence on its own.
const SENTENCE_TERMINATORS: &[&str] = &[". ", ".\n", "! ", "!\n", "? ", "?\n", "。", "；"];

/// Granularity at which streamed text is committed to the output file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Every delta is written and synced to disk immediately.
    #[default]
    Token,
    /// Commit once a whitespace boundary is seen.
    Word,
    /// Commit once a sentence terminator is seen.
    Sentence,
    /// Commit once a blank line (two newlines) accumulates.
    Paragraph,
    /// Commit once a newline is seen.
    Line,
}

/// How strongly a committed write must be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Flush userspace buffers only.
    Buffered,
    /// Flush and force the data to stable storage.
    Synced,
}

impl SaveMode {
    pub const ALL: [SaveMode; 5] = [
        SaveMode::Token,
        SaveMode::Word,
        SaveMode::Sentence,
        SaveMode::Paragraph,
        SaveMode::Line,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SaveMode::Token => "token",
            SaveMode::Word => "word",
            SaveMode::Sentence => "sentence",
            SaveMode::Paragraph => "paragraph",
            SaveMode::Line => "line",
        }
    }

    /// Whether `buffer` has reached a boundary for this mode.
    pub fn should_flush(&self, buffer: &str) -> bool {
        match self {
            SaveMode::Token => !buffer.is_empty(),
            SaveMode::Word => buffer.contains([' ', '\n', '\t']),
            SaveMode::Sentence => SENTENCE_TERMINATORS.iter().any(|t| buffer.contains(t)),
            // A blank line is two newlines, so counting covers both triggers.
            SaveMode::Paragraph => buffer.matches('\n').count() >= 2,
            SaveMode::Line => buffer.contains('\n'),
        }
    }

    /// Persistence guarantee for commits made in this mode.
    pub fn durability(&self) -> Durability {
        match self {
            SaveMode::Token => Durability::Synced,
            _ => Durability::Buffered,
        }
    }
}

/// Free-function form of [`SaveMode::should_flush`].
pub fn should_flush(buffer: &str, mode: SaveMode) -> bool {
    mode.should_flush(buffer)
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SaveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "token" => Ok(SaveMode::Token),
            "word" => Ok(SaveMode::Word),
            "sentence" => Ok(SaveMode::Sentence),
            "paragraph" => Ok(SaveMode::Paragraph),
            "line" => Ok(SaveMode::Line),
            other => Err(format!(
                "unknown save mode '{}' (expected one of: token, word, sentence, paragraph, line)",
                other
            )),
        }
    }
}
