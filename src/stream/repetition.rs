//! Detection of degenerate, looping generation.
//!
//! Vision-language models occasionally fall into a loop and emit the same
//! run of tokens until they hit their token budget. The guard compares the
//! most recent window of fragments with the window before it and advises the
//! caller to abort once they stay near-identical for too long.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Tuning for [`RepetitionGuard`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepetitionConfig {
    /// Disable to never abort on repetition.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Number of fragments per comparison window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Windows more similar than this count as a repetition.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Consecutive repetitions tolerated before aborting.
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_window_size() -> usize {
    50
}

fn default_similarity_threshold() -> f64 {
    0.8
}

fn default_max_consecutive() -> usize {
    5
}

impl Default for RepetitionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_size: default_window_size(),
            similarity_threshold: default_similarity_threshold(),
            max_consecutive: default_max_consecutive(),
        }
    }
}

/// Advice returned for each observed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Continue,
    /// Output has been repeating for `consecutive` checks in a row.
    Abort { consecutive: usize },
}

/// Stateful repetition detector for one page's token stream.
#[derive(Debug)]
pub struct RepetitionGuard {
    config: RepetitionConfig,
    fragments: VecDeque<String>,
    consecutive: usize,
}

impl RepetitionGuard {
    pub fn new(config: RepetitionConfig) -> Self {
        // A zero-sized window would compare two empty strings forever.
        let window = config.window_size.max(1);
        Self {
            config: RepetitionConfig {
                window_size: window,
                ..config
            },
            fragments: VecDeque::with_capacity(window * 3 + 1),
            consecutive: 0,
        }
    }

    /// Record a fragment and decide whether generation should stop.
    pub fn observe(&mut self, fragment: &str) -> GuardVerdict {
        if !self.config.enabled {
            return GuardVerdict::Continue;
        }

        let window = self.config.window_size;
        self.fragments.push_back(fragment.to_string());

        if self.fragments.len() > window * 3 {
            let excess = self.fragments.len() - window * 2;
            self.fragments.drain(..excess);
        }

        if self.fragments.len() < window * 2 {
            return GuardVerdict::Continue;
        }

        let len = self.fragments.len();
        let recent = self.join_range(len - window, len);
        let previous = self.join_range(len - window * 2, len - window);

        if similarity_ratio(&recent, &previous) > self.config.similarity_threshold {
            self.consecutive += 1;
            if self.consecutive > self.config.max_consecutive {
                let consecutive = self.consecutive;
                self.consecutive = 0;
                return GuardVerdict::Abort { consecutive };
            }
        } else {
            self.consecutive = 0;
        }

        GuardVerdict::Continue
    }

    /// Current run of consecutive high-similarity checks.
    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    /// Number of fragments currently retained.
    pub fn retained(&self) -> usize {
        self.fragments.len()
    }

    fn join_range(&self, start: usize, end: usize) -> String {
        self.fragments.range(start..end).map(String::as_str).collect()
    }
}

/// Similarity of two strings in `[0, 1]`: `2 * LCS / (len(a) + len(b))` over chars.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }

    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    2.0 * longest_common_subsequence(&a, &b) as f64 / total as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
