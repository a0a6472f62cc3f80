//! 流生产者（服务端）
//!
//! 一个请求一个生产者：同一个 task 里用 `select!` 交替处理 LLM Token 与后台任务轮询的更新，
//! 所有帧都经同一个 `FrameWriter` 写出，天然串行。控制信号总是独占一行。

use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::{build_prompt, Message};
use crate::core::{GenerationError, LlmError, PollError, TransportError};
use crate::llm::LlmClient;
use crate::requirements::{FormattedResult, JobPoller, RequirementClient, TaskStatus, TaskStatusReport};
use crate::stream::frame::FrameWriter;
use crate::stream::signal::{ControlSignal, DocumentsSignal, GenerationStartSignal, ProgressSignal};

/// 生产者失败
#[derive(Error, Debug)]
pub enum ProducerError {
    /// 客户端断开（响应体被丢弃）
    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// 已写出错误帧
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Producer cancelled")]
    Cancelled,
}

impl From<TransportError> for ProducerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => ProducerError::ClientDisconnected,
            other => ProducerError::Transport(other),
        }
    }
}

/// 一次流式回复的请求
#[derive(Debug, Clone)]
pub struct ProducerRequest {
    pub chat_id: String,
    pub message: String,
    /// 已截取好的历史窗口
    pub history: Vec<Message>,
    pub generate_documents: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    /// LLM 回复全文（不含控制信号），供写回聊天历史
    pub reply: String,
    pub task_id: Option<String>,
    pub documents: usize,
    pub generation_error: Option<String>,
}

enum JobUpdate {
    Progress(TaskStatusReport),
    Finished(Result<FormattedResult, PollError>),
}

/// 帧写端 + 行首跟踪 + 进度去重
///
/// 回复停在行中间时信号先排队，等到换行或回复结束再写出，不拆开用户看到的行。
struct Emitter {
    writer: FrameWriter,
    at_line_start: bool,
    reply: String,
    last_progress: Option<(u8, String)>,
    held: Vec<String>,
}

impl Emitter {
    fn new(writer: FrameWriter) -> Self {
        Self {
            writer,
            at_line_start: true,
            reply: String::new(),
            last_progress: None,
            held: Vec::new(),
        }
    }

    async fn token(&mut self, token: &str) -> Result<(), TransportError> {
        if token.is_empty() {
            return Ok(());
        }
        match token.rfind('\n') {
            // 有排队信号时在最后一个换行处切开，换行之后立即写出信号
            Some(pos) if !self.held.is_empty() && pos + 1 < token.len() => {
                let (head, tail) = token.split_at(pos + 1);
                self.write_token(head).await?;
                self.flush_held().await?;
                self.write_token(tail).await
            }
            _ => {
                self.write_token(token).await?;
                if self.at_line_start {
                    self.flush_held().await?;
                }
                Ok(())
            }
        }
    }

    async fn write_token(&mut self, token: &str) -> Result<(), TransportError> {
        self.writer.text(token).await?;
        self.reply.push_str(token);
        self.at_line_start = token.ends_with('\n');
        Ok(())
    }

    async fn signal(&mut self, signal: &ControlSignal) -> Result<(), TransportError> {
        self.held.push(signal.to_line());
        if self.at_line_start {
            self.flush_held().await?;
        }
        Ok(())
    }

    /// 写出排队的信号；回复停在行中间时先补一个换行
    async fn flush(&mut self) -> Result<(), TransportError> {
        if self.held.is_empty() {
            return Ok(());
        }
        if !self.at_line_start {
            self.writer.text("\n").await?;
            self.at_line_start = true;
        }
        self.flush_held().await
    }

    async fn flush_held(&mut self) -> Result<(), TransportError> {
        for line in std::mem::take(&mut self.held) {
            self.writer.text(&line).await?;
        }
        Ok(())
    }

    /// 只在进度或消息变化时发送，且不回退
    async fn progress(&mut self, progress: u8, message: &str, status: &str) -> Result<(), TransportError> {
        if let Some((last, last_message)) = &self.last_progress {
            if progress < *last || (progress == *last && message == last_message) {
                return Ok(());
            }
        }
        self.last_progress = Some((progress, message.to_string()));
        self.signal(&ControlSignal::Progress(ProgressSignal::new(progress, message, status)))
            .await
    }

    async fn failed(&mut self, message: &str) -> Result<(), TransportError> {
        let progress = self.last_progress.as_ref().map(|(p, _)| *p).unwrap_or(0);
        self.last_progress = Some((progress, message.to_string()));
        self.signal(&ControlSignal::Progress(ProgressSignal::new(progress, message, "failed")))
            .await
    }
}

pub struct StreamProducer {
    llm: Arc<dyn LlmClient>,
    requirements: Arc<dyn RequirementClient>,
    poller: JobPoller,
    system_prompt: String,
}

impl StreamProducer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        requirements: Arc<dyn RequirementClient>,
        poller: JobPoller,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            requirements,
            poller,
            system_prompt: system_prompt.into(),
        }
    }

    /// 生成一次流式回复；成功路径以 `[DONE]` 结束
    pub async fn run(
        &self,
        request: ProducerRequest,
        writer: FrameWriter,
        cancel: CancellationToken,
    ) -> Result<ProducerSummary, ProducerError> {
        let chat_id = request.chat_id.clone();
        let mut emitter = Emitter::new(writer);
        let mut summary = ProducerSummary::default();

        // 任何方式退出都会取消后台轮询
        let poll_cancel = cancel.child_token();
        let _poll_guard = poll_cancel.clone().drop_guard();

        let (updates_tx, mut updates_rx) = mpsc::channel::<JobUpdate>(64);
        let mut job_done = true;

        if request.generate_documents {
            match self.requirements.submit(&request.message).await {
                Ok(submitted) => {
                    tracing::info!(chat_id = %chat_id, task_id = %submitted.task_id, "Requirement task submitted");
                    let start = ControlSignal::GenerationStart(GenerationStartSignal {
                        chat_id: chat_id.clone(),
                        task_id: submitted.task_id.clone(),
                    });
                    self.write_or_log(emitter.signal(&start).await)?;
                    summary.task_id = Some(submitted.task_id.clone());
                    self.spawn_poller(submitted.task_id, updates_tx, poll_cancel.clone());
                    job_done = false;
                }
                Err(e) => {
                    tracing::error!(chat_id = %chat_id, error = %e, "Failed to submit requirement task");
                    summary.generation_error = Some(e.to_string());
                }
            }
        } else {
            drop(updates_tx);
        }

        let prompt = build_prompt(&self.system_prompt, &request.history, &request.message);
        let mut tokens = match self.llm.complete_stream(&prompt).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!(chat_id = %chat_id, error = %e, "LLM stream failed to start");
                let _ = emitter.writer.error("Stream failed").await;
                return Err(e.into());
            }
        };
        let mut llm_done = false;
        let disconnected = emitter.writer.closed();
        tokio::pin!(disconnected);

        while !(llm_done && job_done) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(chat_id = %chat_id, "Producer cancelled");
                    if !job_done {
                        let _ = emitter.failed("Generation cancelled").await;
                    }
                    let _ = emitter.flush().await;
                    let _ = emitter.writer.done().await;
                    return Err(ProducerError::Cancelled);
                }
                _ = &mut disconnected => {
                    tracing::info!(chat_id = %chat_id, "Client disconnected, stopping producer");
                    return Err(ProducerError::ClientDisconnected);
                }
                token = tokens.next(), if !llm_done => match token {
                    Some(Ok(token)) => self.write_or_log(emitter.token(&token).await)?,
                    Some(Err(e)) => {
                        tracing::error!(chat_id = %chat_id, error = %e, "LLM stream error");
                        let _ = emitter.writer.error("Stream failed").await;
                        return Err(e.into());
                    }
                    None => {
                        llm_done = true;
                        self.write_or_log(emitter.flush().await)?;
                    }
                },
                update = updates_rx.recv(), if !job_done => match update {
                    Some(JobUpdate::Progress(report)) => {
                        // 完成/失败由 Finished 统一处理；运行中不发 100，避免客户端提前进入创建阶段
                        if matches!(report.status, TaskStatus::Started | TaskStatus::Running) {
                            let progress = report.progress.min(99);
                            self.write_or_log(emitter.progress(progress, &report.message, "running").await)?;
                        }
                    }
                    Some(JobUpdate::Finished(Ok(result))) => {
                        job_done = true;
                        summary.documents = result.documents.len();
                        self.write_or_log(
                            emitter.progress(100, "Requirement generation completed", "completed").await,
                        )?;
                        let documents = ControlSignal::DocumentsReady(DocumentsSignal {
                            chat_id: chat_id.clone(),
                            documents: result.documents,
                        });
                        self.write_or_log(emitter.signal(&documents).await)?;
                    }
                    Some(JobUpdate::Finished(Err(e))) => {
                        job_done = true;
                        let message = match e {
                            PollError::UpstreamTaskFailure(msg) => msg,
                            other => GenerationError::from(other).to_string(),
                        };
                        tracing::error!(chat_id = %chat_id, error = %message, "Requirement task failed");
                        self.write_or_log(emitter.failed(&message).await)?;
                        summary.generation_error = Some(message);
                    }
                    None => job_done = true,
                },
            }
        }

        self.write_or_log(emitter.flush().await)?;
        self.write_or_log(emitter.writer.done().await)?;
        summary.reply = emitter.reply;
        Ok(summary)
    }

    fn spawn_poller(
        &self,
        task_id: String,
        updates: mpsc::Sender<JobUpdate>,
        cancel: CancellationToken,
    ) {
        let poller = self.poller.clone();
        tokio::spawn(async move {
            let progress_tx = updates.clone();
            let result = poller
                .poll(
                    &task_id,
                    |report| {
                        // 满了就丢：只要最终结果不丢，中间进度可以跳过
                        let _ = progress_tx.try_send(JobUpdate::Progress(report.clone()));
                    },
                    &cancel,
                )
                .await;
            if matches!(result, Err(PollError::Cancelled)) {
                tracing::debug!(task_id = %task_id, "Poller stopped");
                return;
            }
            let _ = updates.send(JobUpdate::Finished(result)).await;
        });
    }

    fn write_or_log(&self, result: Result<(), TransportError>) -> Result<(), ProducerError> {
        result.map_err(|e| {
            let err = ProducerError::from(e);
            if matches!(err, ProducerError::ClientDisconnected) {
                tracing::info!("Client disconnected, stopping producer");
            }
            err
        })
    }
}
