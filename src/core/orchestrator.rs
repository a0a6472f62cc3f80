//! 文档创建编排
//!
//! 收到文档就绪信号后按顺序逐个创建，每次至多一个请求在途。
//! 单项失败只记日志并计数；全部处理完后发出 `Finished`，零成功时由状态机判定整轮失败。

use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationSection;
use crate::core::{GenerationEvent, GenerationMachine, GenerationPhase};
use crate::documents::DocumentCreator;
use crate::stream::DocumentDraft;

/// 一轮创建的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreationReport {
    pub total: usize,
    pub created: usize,
    pub failed: usize,
    /// 中途被新一轮取代或被 reset，未发出 Finished
    pub superseded: bool,
}

pub struct CreationOrchestrator {
    creator: Arc<dyn DocumentCreator>,
    /// 每项之后的短暂停顿，让 UI 有机会渲染
    progress_delay: Duration,
    /// 全部处理完、宣布完成前的停顿
    settle_delay: Duration,
}

impl CreationOrchestrator {
    pub fn new(creator: Arc<dyn DocumentCreator>) -> Self {
        Self {
            creator,
            progress_delay: Duration::from_millis(100),
            settle_delay: Duration::from_millis(200),
        }
    }

    pub fn from_config(creator: Arc<dyn DocumentCreator>, section: &GenerationSection) -> Self {
        Self::new(creator).with_delays(
            Duration::from_millis(section.progress_update_ms),
            Duration::from_millis(section.state_sync_ms),
        )
    }

    pub fn with_delays(mut self, progress_delay: Duration, settle_delay: Duration) -> Self {
        self.progress_delay = progress_delay;
        self.settle_delay = settle_delay;
        self
    }

    /// 逐个创建 `drafts`；`run` 必须是 DocumentsReady 之后状态机的当前轮
    pub async fn run(
        &self,
        machine: &Arc<GenerationMachine>,
        run: u64,
        chat_id: &str,
        drafts: &[DocumentDraft],
    ) -> CreationReport {
        let mut report = CreationReport {
            total: drafts.len(),
            ..CreationReport::default()
        };
        tracing::info!(chat_id, run, total = drafts.len(), "Creating documents");

        for (index, draft) in drafts.iter().enumerate() {
            if machine.apply(GenerationEvent::ItemStarted { run, index }).is_err() {
                report.superseded = true;
                break;
            }

            let event = match self.creator.create(chat_id, draft).await {
                Ok(doc) => {
                    tracing::debug!(index, document_id = %doc.id, title = %draft.title, "Document created");
                    report.created += 1;
                    GenerationEvent::ItemCreated { run }
                }
                Err(e) => {
                    tracing::error!(index, title = %draft.title, error = %e, "Failed to create document");
                    report.failed += 1;
                    GenerationEvent::ItemFailed {
                        run,
                        error: e.to_string(),
                    }
                }
            };
            if machine.apply(event).is_err() {
                report.superseded = true;
                break;
            }

            tokio::time::sleep(self.progress_delay).await;
        }

        if report.superseded {
            tracing::info!(run, "Creation run superseded, stopping");
            return report;
        }

        tokio::time::sleep(self.settle_delay).await;
        let state = machine.snapshot();
        if state.run != run || state.phase != GenerationPhase::Creating {
            report.superseded = true;
            return report;
        }
        if machine.apply(GenerationEvent::Finished { run }).is_err() {
            report.superseded = true;
        }
        tracing::info!(
            run,
            created = report.created,
            failed = report.failed,
            "Document creation finished"
        );
        report
    }
}
