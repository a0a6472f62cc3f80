//! 客户端生成会话
//!
//! 单个读循环：帧 → 解复用 → 展示文本 / 状态机事件。文档就绪后在独立 task 中启动编排器，
//! 读循环继续消费剩余的流。也提供不经流、直接轮询后台任务的回退路径。

use std::fmt::Display;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{
    CreationOrchestrator, CreationReport, GenerationError, GenerationEvent, GenerationMachine,
    GenerationState, TransportError,
};
use crate::requirements::{JobPoller, TaskStatus};
use crate::stream::{
    ControlSignal, DemuxedLine, FrameKind, FrameReader, LineDemuxer, ProgressSignal,
};

/// 一次会话的汇总
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// 展示给用户的文本（已剔除控制信号）
    pub display_text: String,
    pub signals: usize,
    pub malformed: usize,
    /// 最后一次完成的编排
    pub creation: Option<CreationReport>,
    pub final_state: GenerationState,
}

pub struct GenerationSession {
    machine: Arc<GenerationMachine>,
    orchestrator: Arc<CreationOrchestrator>,
    display: Option<mpsc::UnboundedSender<String>>,
}

impl GenerationSession {
    pub fn new(machine: Arc<GenerationMachine>, orchestrator: Arc<CreationOrchestrator>) -> Self {
        Self {
            machine,
            orchestrator,
            display: None,
        }
    }

    /// 每行展示文本发送到 `sink`
    pub fn with_display_sink(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.display = Some(sink);
        self
    }

    pub fn machine(&self) -> &Arc<GenerationMachine> {
        &self.machine
    }

    /// 读完整条流；传输错误或错误帧会让进行中的生成进入 Failed
    pub async fn consume<S, B, E>(
        &self,
        mut reader: FrameReader<S>,
    ) -> Result<SessionReport, GenerationError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut demux = LineDemuxer::new();
        let mut report = SessionReport::default();
        let mut creations: Vec<JoinHandle<CreationReport>> = Vec::new();

        let failure = loop {
            match reader.read().await {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Text => {
                        for line in demux.push(&frame.payload) {
                            self.handle_line(line, &mut report, &mut creations);
                        }
                    }
                    FrameKind::Done => break None,
                    FrameKind::Error => break Some(TransportError::Remote(frame.payload)),
                },
                // 没有 [DONE] 的 EOF 也按正常结束处理
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        for line in demux.finish() {
            self.handle_line(line, &mut report, &mut creations);
        }
        report.display_text = demux.display_text().to_string();

        if let Some(err) = failure {
            tracing::error!(error = %err, "Chat stream failed");
            let err = GenerationError::Transport(err);
            self.machine.fail(err.to_string());
            self.join_creations(creations, &mut report).await;
            return Err(err);
        }

        self.join_creations(creations, &mut report).await;
        report.final_state = self.machine.snapshot();
        Ok(report)
    }

    fn handle_line(
        &self,
        line: DemuxedLine,
        report: &mut SessionReport,
        creations: &mut Vec<JoinHandle<CreationReport>>,
    ) {
        match line {
            DemuxedLine::Display(text) => {
                if let Some(sink) = &self.display {
                    let _ = sink.send(text);
                }
            }
            DemuxedLine::Malformed(_) => report.malformed += 1,
            DemuxedLine::Signal(signal) => {
                report.signals += 1;
                if let Some(handle) = self.apply_signal(signal) {
                    creations.push(handle);
                }
            }
        }
    }

    /// 信号转为状态机事件；文档就绪时返回编排任务
    fn apply_signal(&self, signal: ControlSignal) -> Option<JoinHandle<CreationReport>> {
        match signal {
            ControlSignal::GenerationStart(s) => {
                let _ = self.machine.apply(GenerationEvent::Started {
                    chat_id: s.chat_id,
                    task_id: s.task_id,
                });
                None
            }
            ControlSignal::Progress(p) => {
                let _ = self.machine.apply(GenerationEvent::Progress(p));
                None
            }
            ControlSignal::DocumentsReady(d) => {
                let state = self
                    .machine
                    .apply(GenerationEvent::DocumentsReady {
                        chat_id: d.chat_id.clone(),
                        documents: d.documents.clone(),
                    })
                    .ok()?;
                let machine = self.machine.clone();
                let orchestrator = self.orchestrator.clone();
                Some(tokio::spawn(async move {
                    orchestrator
                        .run(&machine, state.run, &d.chat_id, &d.documents)
                        .await
                }))
            }
        }
    }

    async fn join_creations(
        &self,
        creations: Vec<JoinHandle<CreationReport>>,
        report: &mut SessionReport,
    ) {
        for handle in creations {
            match handle.await {
                Ok(creation) => report.creation = Some(creation),
                Err(e) => tracing::error!(error = %e, "Creation task panicked"),
            }
        }
        report.final_state = self.machine.snapshot();
    }

    /// 不经流的回退路径：直接轮询已提交的任务，完成后创建文档
    pub async fn follow_task(
        &self,
        poller: &JobPoller,
        chat_id: &str,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, GenerationError> {
        let _ = self.machine.apply(GenerationEvent::Started {
            chat_id: chat_id.to_string(),
            task_id: task_id.to_string(),
        });

        let machine = self.machine.clone();
        let polled = poller
            .poll(
                task_id,
                |status| {
                    if matches!(status.status, TaskStatus::Started | TaskStatus::Running) {
                        let _ = machine.apply(GenerationEvent::Progress(ProgressSignal::new(
                            status.progress.min(99),
                            status.message.clone(),
                            "running",
                        )));
                    }
                },
                cancel,
            )
            .await;

        let result = match polled {
            Ok(result) => result,
            Err(e) => {
                let err = GenerationError::from(e);
                tracing::error!(task_id, error = %err, "Requirement task did not complete");
                self.machine.fail(err.to_string());
                return Err(err);
            }
        };

        let _ = self.machine.apply(GenerationEvent::Progress(ProgressSignal::new(
            100,
            "Requirement generation completed",
            "completed",
        )));
        let mut report = SessionReport::default();
        if let Ok(state) = self.machine.apply(GenerationEvent::DocumentsReady {
            chat_id: chat_id.to_string(),
            documents: result.documents.clone(),
        }) {
            let creation = self
                .orchestrator
                .run(&self.machine, state.run, chat_id, &result.documents)
                .await;
            report.creation = Some(creation);
        }
        report.final_state = self.machine.snapshot();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DocumentError, GenerationPhase, MachineConfig, RecordingObserver};
    use crate::documents::{CreatedDocument, DocumentCreator};
    use crate::stream::{encode_frame, DocumentDraft, StreamFrame};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::time::Duration;

    struct OkCreator;

    #[async_trait]
    impl DocumentCreator for OkCreator {
        async fn create(
            &self,
            _chat_id: &str,
            draft: &DocumentDraft,
        ) -> Result<CreatedDocument, DocumentError> {
            Ok(CreatedDocument {
                id: format!("id-{}", draft.title),
                title: draft.title.clone(),
            })
        }
    }

    fn session() -> GenerationSession {
        let machine = GenerationMachine::new(
            MachineConfig::default(),
            Arc::new(RecordingObserver::new()),
        );
        let orchestrator = CreationOrchestrator::new(Arc::new(OkCreator))
            .with_delays(Duration::from_millis(1), Duration::from_millis(1));
        GenerationSession::new(machine, Arc::new(orchestrator))
    }

    fn reader(frames: &[StreamFrame]) -> FrameReader<impl Stream<Item = Result<Vec<u8>, String>> + Unpin> {
        let wire: String = frames.iter().map(encode_frame).collect();
        let chunks: Vec<Result<Vec<u8>, String>> = wire
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        FrameReader::new(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_plain_chat_leaves_machine_idle() {
        let s = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = s.with_display_sink(tx);
        let report = s
            .consume(reader(&[
                StreamFrame::text("你好，"),
                StreamFrame::text("世界\n"),
                StreamFrame::done(),
            ]))
            .await
            .unwrap();
        assert_eq!(report.display_text, "你好，世界\n");
        assert_eq!(rx.recv().await.as_deref(), Some("你好，世界"));
        assert_eq!(report.final_state.phase, GenerationPhase::Idle);
        assert!(report.creation.is_none());
    }

    #[tokio::test]
    async fn test_error_frame_fails_active_generation() {
        let s = session();
        let err = s
            .consume(reader(&[
                StreamFrame::text("__DOCUMENT_GENERATION_START__:{\"chatId\":\"c1\",\"taskId\":\"t1\"}\n"),
                StreamFrame::error("Stream failed"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Transport(TransportError::Remote(ref m)) if m == "Stream failed"
        ));
        let state = s.machine().snapshot();
        assert_eq!(state.phase, GenerationPhase::Failed);
        assert!(state.error.unwrap().contains("Stream failed"));
    }

    #[tokio::test]
    async fn test_documents_signal_drives_creation() {
        let s = session();
        let report = s
            .consume(reader(&[
                StreamFrame::text("__DOCUMENT_GENERATION_START__:{\"chatId\":\"c1\",\"taskId\":\"t1\"}\n"),
                StreamFrame::text("分析中\n__GENERATION_PROGRESS__:{\"progress\":100,\"message\":\"done\",\"status\":\"completed\"}\n"),
                StreamFrame::text("__DOCUMENTS_GENERATED__:{\"chatId\":\"c1\",\"documents\":[{\"title\":\"A\",\"content\":\"x\",\"type\":\"t\",\"generated_at\":\"now\",\"ready_for_save\":true}]}\n"),
                StreamFrame::done(),
            ]))
            .await
            .unwrap();
        assert_eq!(report.signals, 3);
        assert_eq!(report.display_text, "分析中\n");
        assert_eq!(report.creation.unwrap().created, 1);
        assert_eq!(report.final_state.phase, GenerationPhase::Completed);
    }
}
