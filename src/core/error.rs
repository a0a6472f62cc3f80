//! 错误类型
//!
//! 各层错误就地处理：传输/解析错误不会拆掉整条流水线，只有整轮失败
//! （上游任务失败、零文档创建、轮询耗尽、全局超时）才会让生成状态进入 Failed。

use thiserror::Error;

use crate::core::GenerationPhase;
use crate::stream::SignalKind;

/// 帧流读写失败
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// 对端已关闭（客户端断开 / 响应体被丢弃）
    #[error("Stream closed by peer")]
    Closed,

    #[error("Stream read failed: {0}")]
    Read(String),

    /// 服务端写出的错误帧
    #[error("Server reported stream error: {0}")]
    Remote(String),
}

/// 命中哨兵但 JSON 解码失败：记录日志、丢弃该行，流继续处理
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to parse {kind:?} signal: {reason}")]
pub struct SignalParseError {
    pub kind: SignalKind,
    /// 原始行
    pub line: String,
    /// 哨兵之后截取的数据
    pub data: String,
    pub reason: String,
}

/// 后台任务 REST 调用失败
#[derive(Error, Debug)]
pub enum RequirementError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Requirement service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {task_id} is not completed (status: {status})")]
    NotCompleted { task_id: String, status: String },

    #[error("Decode error: {0}")]
    Decode(String),
}

impl RequirementError {
    /// 网络抖动、5xx、429 可重试；其余视为终态
    pub fn is_transient(&self) -> bool {
        match self {
            RequirementError::Http(_) => true,
            RequirementError::Status { status, .. } => *status >= 500 || *status == 429,
            RequirementError::NotCompleted { .. } => true,
            RequirementError::NotFound(_) | RequirementError::Decode(_) => false,
        }
    }
}

/// 轮询后台任务失败
#[derive(Error, Debug)]
pub enum PollError {
    /// 后台任务自身报告 failed
    #[error("{0}")]
    UpstreamTaskFailure(String),

    #[error("Polling exhausted after {attempts} attempts ({consecutive_errors} consecutive errors)")]
    PollingExhausted {
        attempts: u32,
        consecutive_errors: u32,
    },

    #[error("Polling cancelled")]
    Cancelled,

    #[error("Polling aborted: {0}")]
    Fatal(RequirementError),
}

/// 文档创建协作方失败（单项失败，不致命）
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Document service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Document rejected: {0}")]
    Rejected(String),
}

/// LLM 调用失败
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM stream error: {0}")]
    Stream(String),
}

/// 状态机拒绝的事件（仅记录，不致命）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{event} is not accepted in phase {phase:?}")]
    InvalidPhase {
        phase: GenerationPhase,
        event: &'static str,
    },

    #[error("Progress regressed from {previous} to {received}")]
    ProgressRegressed { previous: u8, received: u8 },

    #[error("Event for run {event_run} does not match current run {current_run}")]
    StaleRun { current_run: u64, event_run: u64 },

    #[error("Item index {index} out of order (current {current})")]
    IndexOutOfOrder { index: usize, current: usize },

    #[error("Creation not finished: {current} of {total} documents processed")]
    Unfinished { current: usize, total: usize },
}

/// 整轮生成失败，以单条消息呈现给用户
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Requirement generation failed: {0}")]
    UpstreamTaskFailure(String),

    #[error("No documents created ({failed} failed)")]
    TotalCreationFailure { failed: usize },

    #[error("{0}")]
    PollingExhausted(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),
}

impl From<PollError> for GenerationError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::UpstreamTaskFailure(msg) => GenerationError::UpstreamTaskFailure(msg),
            other => GenerationError::PollingExhausted(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_error_transience() {
        assert!(RequirementError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(RequirementError::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!RequirementError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!RequirementError::NotFound("t".into()).is_transient());
    }

    #[test]
    fn test_poll_error_maps_to_generation_error() {
        let err: GenerationError = PollError::UpstreamTaskFailure("boom".into()).into();
        assert!(matches!(err, GenerationError::UpstreamTaskFailure(ref m) if m == "boom"));

        let err: GenerationError = PollError::PollingExhausted {
            attempts: 3,
            consecutive_errors: 6,
        }
        .into();
        assert!(err.to_string().contains("3 attempts"));
    }
}
