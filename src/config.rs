//! Configuration management for ocrstream using the prefer crate.
//!
//! Values are layered: built-in defaults, then a config file (explicit path
//! or discovered by prefer), then `OCR_*` environment variables. CLI flags
//! are applied on top by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::EndpointConfig;
use crate::orchestrator::{RequestOptions, RetryPolicy};
use crate::session::SessionConfig;
use crate::stream::{RepetitionConfig, SaveMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} config {path}: {message}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },
}

/// Per-page OCR settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrSettings {
    /// Flush granularity for streamed text.
    #[serde(default)]
    pub save_mode: SaveMode,
    /// Stream tokens as they are generated.
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Deltas accepted per page before it is abandoned.
    #[serde(default = "default_max_page_tokens")]
    pub max_page_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// `max_tokens` sent to the model.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// PDF rasterization resolution.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// `{page}` is replaced with the page number.
    #[serde(default = "default_page_prompt")]
    pub page_prompt: String,
}

fn default_stream() -> bool {
    true
}

fn default_page_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_page_tokens() -> usize {
    8192
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_dpi() -> u32 {
    200
}

fn default_prompt() -> String {
    "Extract all text from this image.".to_string()
}

fn default_page_prompt() -> String {
    "Extract all text from page {page} of this document.".to_string()
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            save_mode: SaveMode::default(),
            stream: default_stream(),
            page_timeout_secs: default_page_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_page_tokens: default_max_page_tokens(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            dpi: default_dpi(),
            prompt: default_prompt(),
            page_prompt: default_page_prompt(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: EndpointConfig,
    #[serde(default)]
    pub ocr: OcrSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub repetition: RepetitionConfig,

    /// File the configuration was read from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `path`, or discover an `ocrstream` config file
    /// with prefer. Environment overrides are applied in both cases.
    ///
    /// An explicit path that cannot be read is an error; a discovered file
    /// that fails to parse is logged and ignored.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load_from_path(path).await?,
            None => Self::discover().await,
        };
        Ok(config.with_env_overrides())
    }

    async fn discover() -> Self {
        let path = match prefer::load("ocrstream").await {
            Ok(found) => found.source_path().map(|p| p.to_path_buf()),
            Err(_) => None,
        };

        let Some(path) = path else {
            debug!("No config file found, using defaults");
            return Self::default();
        };

        match Self::load_from_path(&path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file path.
    /// The format is chosen by extension: TOML, YAML, otherwise JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).to_string();
        let path = PathBuf::from(expanded);

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parse_error = |format: &'static str, message: String| ConfigError::Parse {
            path: path.clone(),
            format,
            message,
        };

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error("TOML", e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error("YAML", e.to_string()))?
            }
            _ => serde_json::from_str(&contents).map_err(|e| parse_error("JSON", e.to_string()))?,
        };

        debug!("Loaded config from {}", path.display());
        config.source_path = Some(path);
        Ok(config)
    }

    /// Apply `OCR_*` environment variables. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("OCR_SERVER_URL") {
            self.server.base_url = val;
        }
        if let Ok(val) = std::env::var("OCR_MODEL") {
            self.server.model = val;
        }
        if let Some(mode) = env_parse::<SaveMode>("OCR_SAVE_MODE") {
            self.ocr.save_mode = mode;
        }
        if let Some(secs) = env_parse("OCR_PAGE_TIMEOUT_SECS") {
            self.ocr.page_timeout_secs = secs;
        }
        if let Some(tokens) = env_parse("OCR_MAX_PAGE_TOKENS") {
            self.ocr.max_page_tokens = tokens;
        }
        if let Some(retries) = env_parse("OCR_MAX_RETRIES") {
            self.retry.max_retries = retries;
        }
        if let Ok(val) = std::env::var("OCR_SKIP_ERRORS") {
            self.retry.skip_errors = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Some(dpi) = env_parse("OCR_DPI") {
            self.ocr.dpi = dpi;
        }
        self
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            save_mode: self.ocr.save_mode,
            page_timeout: Duration::from_secs(self.ocr.page_timeout_secs),
            request_timeout: Duration::from_secs(self.ocr.request_timeout_secs),
            max_page_tokens: self.ocr.max_page_tokens,
            repetition: self.repetition.clone(),
        }
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            model: self.server.model.clone(),
            prompt: self.ocr.prompt.clone(),
            page_prompt: self.ocr.page_prompt.clone(),
            temperature: self.ocr.temperature,
            max_tokens: self.ocr.max_tokens,
            stream: self.ocr.stream,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid {}={}", name, val);
            None
        }
    }
}
