//! 端到端集成测试
//!
//! 生产者 → 帧字节（在任意位置切块） → 读端 → 解复用 → 状态机 → 编排器

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jotlin_stream::client::{GenerationSession, SessionReport};
use jotlin_stream::core::{
    CreationOrchestrator, DocumentError, GenerationMachine, GenerationOutcome, GenerationPhase,
    MachineConfig, RecordingObserver,
};
use jotlin_stream::documents::{CreatedDocument, DocumentCreator};
use jotlin_stream::llm::MockLlmClient;
use jotlin_stream::requirements::{
    JobPoller, PollerConfig, ProgressReporter, RequirementService, RequirementWorkflow,
    WorkflowResults,
};
use jotlin_stream::stream::{
    DocumentDraft, FrameReader, FrameWriter, ProducerRequest, StreamProducer,
};

/// 按固定的键产出结果；`error` 非空时工作流失败
struct FixedWorkflow {
    keys: Vec<&'static str>,
    error: Option<&'static str>,
}

#[async_trait]
impl RequirementWorkflow for FixedWorkflow {
    async fn run(
        &self,
        _initial: &str,
        progress: &ProgressReporter,
    ) -> Result<WorkflowResults, String> {
        progress.report("interviews", 30, "Conducting interviews").await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        progress.report("analysis", 70, "Analyzing requirements").await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        if let Some(err) = self.error {
            return Err(err.to_string());
        }
        let mut results = WorkflowResults::new();
        for key in &self.keys {
            results.insert(key.to_string(), serde_json::Value::String(format!("# {}", key)));
        }
        Ok(results)
    }
}

/// 记录调用顺序；标题在 `failing` 中的创建失败
struct RecordingCreator {
    failing: HashSet<&'static str>,
    calls: Mutex<Vec<String>>,
}

impl RecordingCreator {
    fn new(failing: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            failing: failing.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentCreator for RecordingCreator {
    async fn create(
        &self,
        chat_id: &str,
        draft: &DocumentDraft,
    ) -> Result<CreatedDocument, DocumentError> {
        assert_eq!(chat_id, "chat-1");
        self.calls.lock().unwrap().push(draft.title.clone());
        if self.failing.contains(draft.title.as_str()) {
            return Err(DocumentError::Rejected(format!("{} refused", draft.title)));
        }
        Ok(CreatedDocument {
            id: format!("doc-{}", self.calls.lock().unwrap().len()),
            title: draft.title.clone(),
        })
    }
}

struct Harness {
    producer: StreamProducer,
    observer: Arc<RecordingObserver>,
    session: GenerationSession,
    display_rx: mpsc::UnboundedReceiver<String>,
}

fn harness(workflow: FixedWorkflow, creator: Arc<RecordingCreator>, reply: &[&str]) -> Harness {
    let service = Arc::new(RequirementService::new(Arc::new(workflow)));
    let poller = JobPoller::new(
        service.clone(),
        PollerConfig {
            interval: Duration::from_millis(5),
            max_attempts: 200,
            max_consecutive_errors: 3,
            backoff_cap: Duration::from_millis(20),
        },
    );
    let llm = MockLlmClient::scripted(reply.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .with_token_delay(Duration::from_millis(3));
    let producer = StreamProducer::new(Arc::new(llm), service, poller, "You are a test assistant.");

    let observer = Arc::new(RecordingObserver::new());
    let machine = GenerationMachine::new(MachineConfig::default(), observer.clone());
    let orchestrator = CreationOrchestrator::new(creator)
        .with_delays(Duration::from_millis(1), Duration::from_millis(2));
    let (tx, display_rx) = mpsc::unbounded_channel();
    let session = GenerationSession::new(machine, Arc::new(orchestrator)).with_display_sink(tx);

    Harness {
        producer,
        observer,
        session,
        display_rx,
    }
}

/// 线性同余序列决定切块长度，保证复现
fn split_wire(wire: &[u8], seed: u64) -> Vec<Result<Vec<u8>, String>> {
    let mut state = seed;
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < wire.len() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let len = 1 + (state >> 33) as usize % 11;
        let end = (offset + len).min(wire.len());
        chunks.push(Ok(wire[offset..end].to_vec()));
        offset = end;
    }
    chunks
}

async fn run_flow(h: &Harness, generate: bool, seed: u64) -> SessionReport {
    let (writer, mut rx) = FrameWriter::channel(16);
    let request = ProducerRequest {
        chat_id: "chat-1".into(),
        message: "I need a library management system".into(),
        history: vec![],
        generate_documents: generate,
    };
    let produce = h.producer.run(request, writer, CancellationToken::new());
    let collect = async {
        let mut wire = Vec::new();
        while let Some(frame) = rx.recv().await {
            wire.extend_from_slice(frame.as_bytes());
        }
        wire
    };
    let (summary, wire) = tokio::join!(produce, collect);
    summary.unwrap();

    let reader = FrameReader::new(stream::iter(split_wire(&wire, seed)));
    h.session.consume(reader).await.unwrap()
}

#[tokio::test]
async fn test_generation_success_creates_all_documents() {
    let creator = RecordingCreator::new(&[]);
    let mut h = harness(
        FixedWorkflow {
            keys: vec!["srs_document", "interview_record", "user_requirements"],
            error: None,
        },
        creator.clone(),
        &["好的，", "我来分析", "你的需求。\n", "稍等片刻"],
    );

    let report = run_flow(&h, true, 7).await;

    // 信号不会插进回复行的中间
    assert_eq!(report.display_text, "好的，我来分析你的需求。\n稍等片刻\n");
    assert_eq!(report.malformed, 0);
    let creation = report.creation.unwrap();
    assert_eq!((creation.total, creation.created, creation.failed), (3, 3, 0));
    assert_eq!(
        creator.calls(),
        vec![
            "Interview Record",
            "User Requirements",
            "Software Requirements Specification"
        ]
    );
    assert_eq!(report.final_state.phase, GenerationPhase::Completed);
    assert_eq!(report.final_state.created_count, 3);
    assert!(matches!(
        h.observer.outcomes().as_slice(),
        [GenerationOutcome::Completed { created: 3, failed: 0, .. }]
    ));

    let mut lines = Vec::new();
    while let Ok(line) = h.display_rx.try_recv() {
        lines.push(line);
    }
    assert_eq!(lines, vec!["好的，我来分析你的需求。", "稍等片刻"]);
    assert!(lines.iter().all(|l| !l.contains("__")));
}

#[tokio::test]
async fn test_partial_failure_still_completes() {
    let creator = RecordingCreator::new(&["User Requirements"]);
    let h = harness(
        FixedWorkflow {
            keys: vec!["interview_record", "user_requirements", "review_report"],
            error: None,
        },
        creator.clone(),
        &["Working on it.\n"],
    );

    let report = run_flow(&h, true, 42).await;

    let creation = report.creation.unwrap();
    assert_eq!((creation.created, creation.failed), (2, 1));
    assert_eq!(creator.calls().len(), 3);
    assert_eq!(report.final_state.phase, GenerationPhase::Completed);
    assert_eq!(report.final_state.failed_count, 1);
}

#[tokio::test]
async fn test_total_creation_failure_fails_run() {
    let creator = RecordingCreator::new(&["Interview Record", "Software Requirements Specification"]);
    let h = harness(
        FixedWorkflow {
            keys: vec!["interview_record", "srs_document"],
            error: None,
        },
        creator,
        &["ok\n"],
    );

    let report = run_flow(&h, true, 3).await;

    assert_eq!(report.final_state.phase, GenerationPhase::Failed);
    assert_eq!(
        report.final_state.error.as_deref(),
        Some("No documents created (2 failed)")
    );
    assert_eq!(report.final_state.failed_count, 2);
}

#[tokio::test]
async fn test_upstream_failure_reaches_client() {
    let creator = RecordingCreator::new(&[]);
    let h = harness(
        FixedWorkflow {
            keys: vec![],
            error: Some("model quota exceeded"),
        },
        creator.clone(),
        &["Let me think.\n"],
    );

    let report = run_flow(&h, true, 11).await;

    assert_eq!(report.display_text, "Let me think.\n");
    assert!(report.creation.is_none());
    assert!(creator.calls().is_empty());
    assert_eq!(report.final_state.phase, GenerationPhase::Failed);
    let error = report.final_state.error.unwrap();
    assert!(error.contains("model quota exceeded"), "{}", error);
}

#[tokio::test]
async fn test_plain_chat_has_no_generation() {
    let creator = RecordingCreator::new(&[]);
    let h = harness(
        FixedWorkflow {
            keys: vec!["srs_document"],
            error: None,
        },
        creator.clone(),
        &["Hello", " there", "!"],
    );

    let report = run_flow(&h, false, 99).await;

    assert_eq!(report.display_text, "Hello there!\n");
    assert_eq!(report.signals, 0);
    assert_eq!(report.final_state.phase, GenerationPhase::Idle);
    assert!(creator.calls().is_empty());
    assert!(h.observer.outcomes().is_empty());
}
