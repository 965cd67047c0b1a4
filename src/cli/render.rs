//! Console rendering of OCR events.

use std::io::Write;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::events::OcrEvent;
use crate::orchestrator::{DocumentReport, DocumentStatus};
use crate::session::SessionStats;

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Progress bar only; streamed text is not echoed.
    pub quiet: bool,
    /// Per-page token statistics.
    pub stats: bool,
}

/// Consume events until the sending side is dropped.
pub async fn render_events(mut rx: mpsc::Receiver<OcrEvent>, options: RenderOptions) {
    let mut progress: Option<ProgressBar> = None;

    while let Some(event) = rx.recv().await {
        match event {
            OcrEvent::DocumentStarted {
                name,
                total_pages,
                resumed_pages,
                output_path,
            } => {
                println!(
                    "{} Processing {} ({} page{})",
                    style("→").cyan(),
                    style(&name).bold(),
                    total_pages,
                    if total_pages == 1 { "" } else { "s" }
                );
                if resumed_pages > 0 {
                    println!(
                        "  {} Resuming: {} page{} already processed",
                        style("!").yellow(),
                        resumed_pages,
                        if resumed_pages == 1 { "" } else { "s" }
                    );
                }
                if let Some(path) = output_path {
                    println!("  Output: {}", style(path.display()).dim());
                }

                if options.quiet {
                    let bar = ProgressBar::new(total_pages as u64);
                    bar.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
                            .unwrap()
                            .progress_chars("█▓░"),
                    );
                    bar.set_position(resumed_pages as u64);
                    bar.set_message("Running OCR...");
                    progress = Some(bar);
                }
            }
            OcrEvent::PageStarted {
                page,
                total_pages,
                attempt,
            } => {
                if let Some(ref bar) = progress {
                    bar.set_message(format!("Page {}", page));
                } else {
                    let retry = if attempt > 1 {
                        format!(" (attempt {})", attempt)
                    } else {
                        String::new()
                    };
                    println!(
                        "\n{}{}",
                        style(format!("Page {}/{}", page, total_pages)).bold(),
                        retry
                    );
                }
            }
            OcrEvent::Delta { text, .. } => {
                if progress.is_none() {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
            }
            OcrEvent::PageCompleted { page, stats } => {
                if let Some(ref bar) = progress {
                    bar.inc(1);
                } else {
                    println!();
                    if options.stats {
                        println!("  {} Page {}: {}", style("✓").green(), page, page_stats(&stats));
                    }
                }
            }
            OcrEvent::PageRetrying {
                page,
                attempt,
                error,
            } => {
                let line = format!(
                    "{} Page {} attempt {} failed: {}, retrying",
                    style("!").yellow(),
                    page,
                    attempt,
                    error
                );
                match progress {
                    Some(ref bar) => bar.println(line),
                    None => println!("\n{}", line),
                }
            }
            OcrEvent::PageSkipped { page, error } => {
                let line = format!("{} Page {} skipped: {}", style("✗").red(), page, error);
                match progress {
                    Some(ref bar) => {
                        bar.println(line);
                        bar.inc(1);
                    }
                    None => println!("{}", line),
                }
            }
            OcrEvent::DocumentStopped { page, error } => {
                if let Some(bar) = progress.take() {
                    bar.abandon();
                }
                println!(
                    "\n{} Stopped at page {}: {}",
                    style("✗").red(),
                    page,
                    error
                );
                println!("  Run again to resume from page {}.", page);
            }
            OcrEvent::DocumentCompleted {
                completed,
                skipped,
                elapsed_secs,
            } => {
                if let Some(bar) = progress.take() {
                    bar.finish_and_clear();
                }
                let mut msg = format!(
                    "\n{} Done: {} page{} extracted",
                    style("✓").green(),
                    completed,
                    if completed == 1 { "" } else { "s" }
                );
                if skipped > 0 {
                    msg.push_str(&format!(", {} skipped", skipped));
                }
                msg.push_str(&format!(" in {:.2}s", elapsed_secs));
                println!("{}", msg);
            }
        }
    }
}

fn page_stats(stats: &SessionStats) -> String {
    let mut parts = vec![
        format!("{} tokens", stats.token_count),
        format!("{:.2}s", stats.elapsed().as_secs_f64()),
        format!("{:.1} tokens/s", stats.tokens_per_second()),
    ];
    if let Some(ttft) = stats.time_to_first_token() {
        parts.push(format!("first token {:.2}s", ttft.as_secs_f64()));
    }
    parts.join(", ")
}

/// Document summary for `--stats`.
pub fn print_report(report: &DocumentReport) {
    println!("\n{}", style("Statistics").bold());
    println!("  Total pages:     {}", report.total_pages);
    println!("  Completed:       {}", report.completed);
    if report.skipped > 0 {
        println!("  Skipped:         {}", style(report.skipped).yellow());
    }
    if report.resumed > 0 {
        println!("  From earlier run: {}", report.resumed);
    }
    println!("  Tokens:          {}", report.tokens);
    println!("  Elapsed:         {:.2}s", report.elapsed.as_secs_f64());

    let secs = report.elapsed.as_secs_f64();
    if secs > 0.0 {
        println!("  Tokens/second:   {:.1}", report.tokens as f64 / secs);
    }

    let status = match report.status {
        DocumentStatus::Completed => style("Complete").green().to_string(),
        DocumentStatus::Stopped { page, .. } => {
            style(format!("Stopped at page {}", page)).yellow().to_string()
        }
    };
    println!("  Status:          {}", status);
}
