//! Orchestrator scenarios
//!
//! Runs whole documents through the orchestrator with a scripted transport
//! and in-memory page source, checking the output file, the progress file
//! and the emitted events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio::sync::mpsc;

use ocrstream::client::{ChatContent, ChatRequest, LineStream, OcrTransport, TransportError};
use ocrstream::document::{ImagePayload, PageSource, SourceError};
use ocrstream::events::{EventSender, OcrEvent};
use ocrstream::orchestrator::{
    DocumentReport, DocumentStatus, PageOrchestrator, RequestOptions, RetryPolicy,
};
use ocrstream::progress::{FileProgressStore, ProgressRecord, ProgressStore};
use ocrstream::session::{PageError, SessionConfig};
use ocrstream::stream::{RepetitionConfig, SaveMode};

enum Reply {
    Deltas(Vec<String>),
    Fail(u16),
    Stall,
}

/// Answers each request according to a per-page script; unscripted
/// requests get a short successful stream.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<u32, VecDeque<Reply>>>,
    calls: Mutex<Vec<u32>>,
}

impl ScriptedTransport {
    fn script(self, page: u32, replies: Vec<Reply>) -> Self {
        self.scripts.lock().unwrap().insert(page, replies.into());
        self
    }

    fn calls_for(&self, page: u32) -> usize {
        self.calls.lock().unwrap().iter().filter(|&&p| p == page).count()
    }

    fn page_of(request: &ChatRequest) -> u32 {
        request.messages[0]
            .content
            .iter()
            .find_map(|part| match part {
                ChatContent::ImageUrl { image_url } => image_url
                    .url
                    .rsplit("page")
                    .next()
                    .and_then(|n| n.parse().ok()),
                ChatContent::Text { .. } => None,
            })
            .expect("request carries a page image")
    }

    fn next_reply(&self, page: u32) -> Reply {
        self.calls.lock().unwrap().push(page);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(|replies| replies.pop_front())
            .unwrap_or_else(|| {
                Reply::Deltas(vec!["Text of ".to_string(), format!("page {}", page)])
            })
    }
}

fn sse_lines(deltas: Vec<String>) -> Vec<Result<String, TransportError>> {
    let mut lines: Vec<Result<String, TransportError>> = deltas
        .into_iter()
        .map(|d| {
            Ok(format!(
                "data: {}",
                serde_json::json!({"choices": [{"delta": {"content": d}}]})
            ))
        })
        .collect();
    lines.push(Ok("data: [DONE]".to_string()));
    lines
}

#[async_trait]
impl OcrTransport for ScriptedTransport {
    async fn complete(
        &self,
        request: &ChatRequest,
        _timeout: Duration,
    ) -> Result<String, TransportError> {
        match self.next_reply(Self::page_of(request)) {
            Reply::Deltas(deltas) => Ok(deltas.concat()),
            Reply::Fail(status) => Err(TransportError::Status {
                status,
                body: String::new(),
            }),
            Reply::Stall => Err(TransportError::Timeout),
        }
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<LineStream, TransportError> {
        match self.next_reply(Self::page_of(request)) {
            Reply::Deltas(deltas) => Ok(stream::iter(sse_lines(deltas)).boxed()),
            Reply::Fail(status) => Err(TransportError::Status {
                status,
                body: "internal error".to_string(),
            }),
            Reply::Stall => Ok(stream::pending().boxed()),
        }
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// A document whose page images are just their page numbers.
struct FakeSource {
    pages: u32,
    broken_pages: HashSet<u32>,
}

impl FakeSource {
    fn new(pages: u32) -> Self {
        Self {
            pages,
            broken_pages: HashSet::new(),
        }
    }
}

#[async_trait]
impl PageSource for FakeSource {
    fn identity(&self) -> &str {
        "/scans/report.pdf"
    }

    fn display_name(&self) -> &str {
        "report.pdf"
    }

    fn page_count(&self) -> u32 {
        self.pages
    }

    async fn render_page(&self, page: u32) -> Result<ImagePayload, SourceError> {
        if self.broken_pages.contains(&page) {
            return Err(SourceError::RenderFailed(format!("page {} is unreadable", page)));
        }
        Ok(ImagePayload {
            base64: format!("page{}", page),
            mime_type: "image/jpeg",
        })
    }
}

struct Fixture {
    _dir: TempDir,
    output: PathBuf,
    store: FileProgressStore,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("report.md");
        let store = FileProgressStore::for_document(&dir.path().join("report.pdf"));
        Self {
            _dir: dir,
            output,
            store,
        }
    }

    fn output_text(&self) -> String {
        std::fs::read_to_string(&self.output).unwrap()
    }

    fn progress_path(&self) -> &Path {
        self.store.path()
    }
}

fn request_options(stream: bool) -> RequestOptions {
    RequestOptions {
        model: "test-model".to_string(),
        prompt: "Extract all text from this image.".to_string(),
        page_prompt: "Extract all text from page {page} of this document.".to_string(),
        temperature: 0.1,
        max_tokens: 4096,
        stream,
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        save_mode: SaveMode::Word,
        page_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

fn policy(max_retries: u32, skip_errors: bool) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        skip_errors,
        retry_delay: Duration::ZERO,
    }
}

async fn run_document(
    transport: Arc<ScriptedTransport>,
    source: &FakeSource,
    fixture: &Fixture,
    session: SessionConfig,
    policy: RetryPolicy,
) -> (DocumentReport, Vec<OcrEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let orchestrator = PageOrchestrator::new(transport, session, policy, request_options(true))
        .with_events(EventSender::new(tx));

    let report = orchestrator
        .run(source, Some(&fixture.output), &fixture.store)
        .await
        .unwrap();
    drop(orchestrator);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (report, events)
}

#[tokio::test]
async fn test_failing_page_is_skipped_and_document_completes() {
    let fixture = Fixture::new();
    let transport = Arc::new(
        ScriptedTransport::default().script(2, vec![Reply::Fail(500), Reply::Fail(500)]),
    );
    let source = FakeSource::new(3);

    let (report, events) = run_document(
        transport.clone(),
        &source,
        &fixture,
        session_config(),
        policy(2, true),
    )
    .await;

    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.completed, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.resumed, 0);
    assert_eq!(transport.calls_for(1), 1);
    assert_eq!(transport.calls_for(2), 2);
    assert_eq!(transport.calls_for(3), 1);

    let text = fixture.output_text();
    assert!(text.starts_with("# OCR Result: report.pdf\n\n**Total pages**: 3\n"));
    assert!(text.contains("## Page 1\n\nText of page 1"));
    assert!(text.contains("*[Attempt 1 failed: API error: HTTP 500"));
    assert!(text.contains("*[Attempt 2 failed: API error: HTTP 500"));
    assert!(text.contains("*[Text extraction failed, page skipped: API error: HTTP 500"));
    assert!(text.contains("## Page 3\n\nText of page 3"));
    assert!(text.contains("**Total processing time**"));

    // Completed documents leave no progress behind.
    assert!(!fixture.progress_path().exists());

    let retried: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            OcrEvent::PageRetrying { page, attempt, .. } => Some(page * 10 + attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retried, vec![21]);
    assert!(events.iter().any(|e| matches!(
        e,
        OcrEvent::PageSkipped {
            page: 2,
            error: PageError::Api { status: Some(500), .. }
        }
    )));
    assert!(matches!(
        events.last(),
        Some(OcrEvent::DocumentCompleted {
            completed: 2,
            skipped: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn test_stop_then_resume_continues_at_failed_page() {
    let fixture = Fixture::new();
    let source = FakeSource::new(3);

    let failing = Arc::new(
        ScriptedTransport::default().script(2, vec![Reply::Fail(503), Reply::Fail(503)]),
    );
    let (report, events) =
        run_document(failing, &source, &fixture, session_config(), policy(2, false)).await;

    assert!(matches!(
        report.status,
        DocumentStatus::Stopped {
            page: 2,
            error: PageError::Api { status: Some(503), .. }
        }
    ));
    assert_eq!(report.completed, 1);
    assert!(matches!(
        events.last(),
        Some(OcrEvent::DocumentStopped { page: 2, .. })
    ));

    let saved = fixture.store.load("/scans/report.pdf").unwrap().unwrap();
    assert_eq!(saved.completed_pages.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert!(saved.failed_pages[&2].contains("HTTP 503"));
    assert_eq!(saved.pending_pages(), vec![2, 3]);
    assert!(fixture.output_text().contains("*[Processing stopped: API error: HTTP 503"));
    assert!(!fixture.output_text().contains("**Total processing time**"));

    let healthy = Arc::new(ScriptedTransport::default());
    let (report, _) = run_document(
        healthy.clone(),
        &source,
        &fixture,
        session_config(),
        policy(2, false),
    )
    .await;

    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.resumed, 1);
    assert_eq!(report.completed, 2);
    assert_eq!(healthy.calls_for(1), 0);
    assert_eq!(healthy.calls_for(2), 1);
    assert_eq!(healthy.calls_for(3), 1);

    let text = fixture.output_text();
    assert_eq!(text.matches("# OCR Result").count(), 1);
    assert_eq!(text.matches("Text of page 1").count(), 1);
    assert!(text.contains("Text of page 2"));
    assert!(text.contains("Text of page 3"));
    assert_eq!(text.matches("**Total processing time**").count(), 1);
    assert!(!fixture.progress_path().exists());
}

#[tokio::test]
async fn test_repetition_skips_without_retry() {
    let fixture = Fixture::new();
    let looping: Vec<String> = vec!["the same line\n".to_string(); 60];
    let transport =
        Arc::new(ScriptedTransport::default().script(1, vec![Reply::Deltas(looping)]));
    let source = FakeSource::new(2);

    let session = SessionConfig {
        repetition: RepetitionConfig {
            enabled: true,
            window_size: 5,
            similarity_threshold: 0.8,
            max_consecutive: 3,
        },
        ..session_config()
    };
    let (report, events) =
        run_document(transport.clone(), &source, &fixture, session, policy(3, true)).await;

    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.skipped, 1);
    assert_eq!(transport.calls_for(1), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        OcrEvent::PageSkipped {
            page: 1,
            error: PageError::RepetitionDetected { .. }
        }
    )));

    // Text produced before the abort is kept.
    let text = fixture.output_text();
    assert!(text.contains("the same line"));
    assert!(text.contains("page skipped: Repetition detected"));
}

#[tokio::test]
async fn test_timeout_without_skip_stops_immediately() {
    let fixture = Fixture::new();
    let transport = Arc::new(ScriptedTransport::default().script(1, vec![Reply::Stall]));
    let source = FakeSource::new(2);

    let session = SessionConfig {
        page_timeout: Duration::from_millis(100),
        ..session_config()
    };
    let (report, _) =
        run_document(transport.clone(), &source, &fixture, session, policy(3, false)).await;

    assert!(matches!(
        report.status,
        DocumentStatus::Stopped {
            page: 1,
            error: PageError::Timeout { .. }
        }
    ));
    assert_eq!(transport.calls_for(1), 1);
    assert_eq!(transport.calls_for(2), 0);
    assert!(fixture.progress_path().exists());
}

#[tokio::test]
async fn test_render_failure_is_retried_then_skipped() {
    let fixture = Fixture::new();
    let transport = Arc::new(ScriptedTransport::default());
    let mut source = FakeSource::new(2);
    source.broken_pages.insert(1);

    let (report, events) =
        run_document(transport.clone(), &source, &fixture, session_config(), policy(2, true))
            .await;

    assert_eq!(report.skipped, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(transport.calls_for(1), 0);
    assert!(events.iter().any(|e| matches!(
        e,
        OcrEvent::PageSkipped {
            page: 1,
            error: PageError::Unexpected(_)
        }
    )));
    assert!(fixture.output_text().contains("page 1 is unreadable"));
}

#[tokio::test]
async fn test_empty_page_gets_placeholder() {
    let fixture = Fixture::new();
    let transport =
        Arc::new(ScriptedTransport::default().script(1, vec![Reply::Deltas(Vec::new())]));
    let source = FakeSource::new(1);

    let (report, _) =
        run_document(transport, &source, &fixture, session_config(), policy(2, false)).await;

    assert_eq!(report.completed, 1);
    let text = fixture.output_text();
    assert!(!text.contains("## Page"));
    assert!(text.contains("*[No text extracted]*"));
}

#[tokio::test]
async fn test_mismatched_progress_is_ignored() {
    let fixture = Fixture::new();

    let mut stale = ProgressRecord::new("/scans/report.pdf", 5);
    stale.mark_completed(1).unwrap();
    fixture.store.save(&stale).unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    let source = FakeSource::new(3);
    let (report, _) = run_document(
        transport.clone(),
        &source,
        &fixture,
        session_config(),
        policy(2, false),
    )
    .await;

    assert_eq!(report.resumed, 0);
    assert_eq!(report.completed, 3);
    assert_eq!(transport.calls_for(1), 1);
}

#[tokio::test]
async fn test_no_resume_reprocesses_everything() {
    let fixture = Fixture::new();

    let mut record = ProgressRecord::new("/scans/report.pdf", 2);
    record.mark_completed(1).unwrap();
    fixture.store.save(&record).unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    let source = FakeSource::new(2);
    let orchestrator = PageOrchestrator::new(
        transport.clone(),
        session_config(),
        policy(2, false),
        request_options(true),
    )
    .with_resume(false);

    let report = orchestrator
        .run(&source, Some(&fixture.output), &fixture.store)
        .await
        .unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(transport.calls_for(1), 1);
    assert!(!fixture.progress_path().exists());
}

#[tokio::test]
async fn test_non_streaming_document() {
    let fixture = Fixture::new();
    let transport = Arc::new(ScriptedTransport::default());
    let source = FakeSource::new(2);

    let orchestrator = PageOrchestrator::new(
        transport,
        session_config(),
        policy(1, false),
        request_options(false),
    );
    let report = orchestrator
        .run(&source, Some(&fixture.output), &fixture.store)
        .await
        .unwrap();

    assert!(report.is_completed());
    let text = fixture.output_text();
    assert!(text.contains("**Mode**: non-streaming"));
    assert!(text.contains("## Page 2\n\nText of page 2"));
}

#[tokio::test]
async fn test_no_save_still_checkpoints() {
    let fixture = Fixture::new();
    let transport = Arc::new(ScriptedTransport::default().script(2, vec![Reply::Fail(500)]));
    let source = FakeSource::new(2);

    let orchestrator = PageOrchestrator::new(
        transport,
        session_config(),
        policy(1, false),
        request_options(true),
    );
    let report = orchestrator
        .run(&source, None, &fixture.store)
        .await
        .unwrap();

    assert!(!report.is_completed());
    assert!(!fixture.output.exists());
    let saved = fixture.store.load("/scans/report.pdf").unwrap().unwrap();
    assert_eq!(saved.pending_pages(), vec![2]);
}
