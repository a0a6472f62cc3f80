//! 生成结束通知
//!
//! 核心不直接触碰宿主的缓存；每轮进入终态时通知一次，宿主据 `invalidated_keys` 自行失效。

use std::sync::Mutex;

use crate::core::{GenerationPhase, GenerationState};

/// 一轮生成的终态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed {
        chat_id: Option<String>,
        created: usize,
        failed: usize,
    },
    Failed {
        chat_id: Option<String>,
        error: String,
    },
}

impl GenerationOutcome {
    /// 由终态构造；非终态返回 None
    pub fn from_state(state: &GenerationState) -> Option<Self> {
        match state.phase {
            GenerationPhase::Completed => Some(GenerationOutcome::Completed {
                chat_id: state.chat_id.clone(),
                created: state.created_count,
                failed: state.failed_count,
            }),
            GenerationPhase::Failed => Some(GenerationOutcome::Failed {
                chat_id: state.chat_id.clone(),
                error: state
                    .error
                    .clone()
                    .unwrap_or_else(|| "Generation failed".to_string()),
            }),
            _ => None,
        }
    }

    /// 宿主需要失效的缓存键；失败时没有新文档，不需要失效
    pub fn invalidated_keys(&self) -> Vec<String> {
        match self {
            GenerationOutcome::Completed { chat_id, .. } => {
                let mut keys = Vec::with_capacity(3);
                if let Some(id) = chat_id {
                    keys.push(format!("chat:{}", id));
                }
                keys.push("documents".to_string());
                keys.push("chats".to_string());
                keys
            }
            GenerationOutcome::Failed { .. } => Vec::new(),
        }
    }
}

/// 宿主订阅的终态回调
pub trait GenerationObserver: Send + Sync {
    fn on_outcome(&self, outcome: &GenerationOutcome);
}

/// 默认实现：只写日志
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl GenerationObserver for LoggingObserver {
    fn on_outcome(&self, outcome: &GenerationOutcome) {
        match outcome {
            GenerationOutcome::Completed {
                chat_id,
                created,
                failed,
            } => tracing::info!(
                chat_id = chat_id.as_deref().unwrap_or("-"),
                created,
                failed,
                invalidate = ?outcome.invalidated_keys(),
                "Document generation completed"
            ),
            GenerationOutcome::Failed { chat_id, error } => tracing::error!(
                chat_id = chat_id.as_deref().unwrap_or("-"),
                error = %error,
                "Document generation failed"
            ),
        }
    }
}

/// 记录所有终态，供测试与 CLI 汇总使用
#[derive(Debug, Default)]
pub struct RecordingObserver {
    outcomes: Mutex<Vec<GenerationOutcome>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<GenerationOutcome> {
        self.outcomes
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}

impl GenerationObserver for RecordingObserver {
    fn on_outcome(&self, outcome: &GenerationOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_outcome_invalidates_caches() {
        let outcome = GenerationOutcome::Completed {
            chat_id: Some("c1".into()),
            created: 2,
            failed: 0,
        };
        assert_eq!(
            outcome.invalidated_keys(),
            vec!["chat:c1".to_string(), "documents".into(), "chats".into()]
        );
    }

    #[test]
    fn test_outcome_only_for_terminal_states() {
        let mut state = GenerationState::default();
        assert!(GenerationOutcome::from_state(&state).is_none());
        state.phase = GenerationPhase::Failed;
        state.error = Some("boom".into());
        assert_eq!(
            GenerationOutcome::from_state(&state),
            Some(GenerationOutcome::Failed {
                chat_id: None,
                error: "boom".into()
            })
        );
    }
}
