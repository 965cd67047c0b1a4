//! Command line interface.

mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{HttpTransport, OcrTransport};
use crate::config::Config;
use crate::document::{self, SUPPORTED_EXTENSIONS};
use crate::events::EventSender;
use crate::orchestrator::{DocumentStatus, PageOrchestrator};
use crate::output::default_output_path;
use crate::progress::FileProgressStore;
use crate::stream::SaveMode;

use render::RenderOptions;

/// Inputs tried, in order, when no file is given.
const DEFAULT_TEST_FILES: &[&str] = &[
    "data/test.pdf",
    "data/test_images/sample.png",
    "data/test_images/sample.jpg",
];

#[derive(Parser, Debug)]
#[command(name = "ocrstream")]
#[command(about = "Stream PDF and image OCR from an inference server into markdown")]
#[command(version)]
pub struct Cli {
    /// PDF or image file to process
    file: Option<PathBuf>,

    /// Wait for each page's full response instead of streaming tokens
    #[arg(long)]
    no_stream: bool,

    /// When streamed text is written to the output file
    #[arg(short = 'm', long, value_enum)]
    save_mode: Option<SaveMode>,

    /// Show a progress bar instead of the streamed text
    #[arg(short, long)]
    quiet: bool,

    /// Print token and timing statistics
    #[arg(long)]
    stats: bool,

    /// Do not write an output file
    #[arg(long)]
    no_save: bool,

    /// Inference server base URL
    #[arg(long)]
    server: Option<String>,

    /// Model name sent with each request
    #[arg(long)]
    model: Option<String>,

    /// Config file (default: discovered ocrstream.{toml,yaml,json})
    #[arg(long)]
    config: Option<PathBuf>,

    /// Attempts per page before giving up
    #[arg(long)]
    max_retries: Option<u32>,

    /// Skip pages that keep failing instead of stopping
    #[arg(long)]
    skip_errors: bool,

    /// Time budget per page, in seconds
    #[arg(long)]
    page_timeout: Option<u64>,

    /// Maximum tokens accepted per page
    #[arg(long)]
    max_page_tokens: Option<usize>,

    /// Ignore saved progress and start from the first page
    #[arg(long)]
    no_resume: bool,

    /// Output file (default: <file>.md next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Layer command line flags over the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if self.no_stream {
            config.ocr.stream = false;
        }
        if let Some(mode) = self.save_mode {
            config.ocr.save_mode = mode;
        }
        if let Some(ref server) = self.server {
            config.server.base_url = server.clone();
        }
        if let Some(ref model) = self.model {
            config.server.model = model.clone();
        }
        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }
        if self.skip_errors {
            config.retry.skip_errors = true;
        }
        if let Some(secs) = self.page_timeout {
            config.ocr.page_timeout_secs = secs;
        }
        if let Some(tokens) = self.max_page_tokens {
            config.ocr.max_page_tokens = tokens;
        }
    }

    fn output_path(&self, input: &Path, config: &Config) -> Option<PathBuf> {
        if self.no_save {
            return None;
        }
        Some(self.output.clone().unwrap_or_else(|| {
            default_output_path(input, config.ocr.stream, config.ocr.save_mode)
        }))
    }
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

fn find_default_file() -> Option<PathBuf> {
    DEFAULT_TEST_FILES
        .iter()
        .map(|path| PathBuf::from(*path))
        .find(|path| path.exists())
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    cli.apply(&mut config);
    debug!("Effective config: {:?}", config);

    let Some(input) = cli.file.clone().or_else(find_default_file) else {
        bail!(
            "No input file given and none of the default files exist ({})",
            DEFAULT_TEST_FILES.join(", ")
        );
    };

    if !document::is_supported(&input) {
        bail!(
            "Unsupported file type: {} (supported: {})",
            input.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        );
    }

    let transport = Arc::new(HttpTransport::new(config.server.clone()));
    if !transport.is_healthy().await {
        bail!(
            "OCR server is not available at {}",
            transport.endpoint().health_url()
        );
    }

    let source = document::open_source(&input, config.ocr.dpi)
        .await
        .with_context(|| format!("Failed to open {}", input.display()))?;

    let output_path = cli.output_path(&input, &config);
    let store = FileProgressStore::for_document(&input);

    let (tx, rx) = mpsc::channel(256);
    let renderer = tokio::spawn(render::render_events(
        rx,
        RenderOptions {
            quiet: cli.quiet,
            stats: cli.stats,
        },
    ));

    let orchestrator = PageOrchestrator::new(
        transport,
        config.session_config(),
        config.retry.clone(),
        config.request_options(),
    )
    .with_events(EventSender::new(tx))
    .with_resume(!cli.no_resume);

    let result = orchestrator
        .run(source.as_ref(), output_path.as_deref(), &store)
        .await;

    // Closing the channel lets the renderer drain and exit.
    drop(orchestrator);
    let _ = renderer.await;

    let report = result.context("Processing failed")?;
    if cli.stats {
        render::print_report(&report);
    }

    match report.status {
        DocumentStatus::Completed => Ok(()),
        DocumentStatus::Stopped { page, error } => {
            bail!("Stopped at page {}: {}", page, error)
        }
    }
}
