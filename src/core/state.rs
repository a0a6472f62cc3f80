//! 生成状态机：纯转移函数
//!
//! `Idle → Analyzing → Creating → Completed`，`Analyzing`/`Creating` 可进入 `Failed`，
//! 任何状态可 `Reset` 回 `Idle`。`GenerationState::apply` 不做 IO，便于确定性测试；
//! 对外暴露与超时等副作用见 `core::machine`。

use serde::Serialize;

use crate::core::{GenerationError, TransitionError};
use crate::stream::{DocumentDraft, ProgressSignal};

/// 分析阶段的占位步骤（来自多智能体需求分析流程）
pub const ANALYSIS_STEPS: [&str; 6] = [
    "识别最终用户和利益相关者",
    "进行用户访谈和收集需求",
    "分析部署环境和约束",
    "分析需求并生成用例模型",
    "生成IEEE 29148兼容的SRS文档",
    "进行SRS文档质量审查",
];

/// 生成阶段
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum GenerationPhase {
    #[default]
    Idle,
    Analyzing,
    Creating,
    Completed,
    Failed,
}

impl GenerationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationPhase::Completed | GenerationPhase::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, GenerationPhase::Analyzing | GenerationPhase::Creating)
    }
}

/// 单个文档条目的创建状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ItemStatus {
    #[default]
    Pending,
    Creating,
    Created,
    Failed,
}

/// 进度列表中的一项（占位步骤或真实文档）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DocumentProgressItem {
    pub title: String,
    pub content: String,
    pub progress: u8,
    pub status: ItemStatus,
}

impl DocumentProgressItem {
    fn placeholder(title: String, progress: u8) -> Self {
        Self {
            title,
            content: String::new(),
            progress,
            status: if progress >= 100 {
                ItemStatus::Created
            } else {
                ItemStatus::Pending
            },
        }
    }

    fn from_draft(draft: &DocumentDraft) -> Self {
        Self {
            title: draft.title.clone(),
            content: draft.content.clone(),
            progress: 0,
            status: ItemStatus::Pending,
        }
    }
}

/// 驱动状态机的事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationEvent {
    Started {
        chat_id: String,
        task_id: String,
    },
    Progress(ProgressSignal),
    DocumentsReady {
        chat_id: String,
        documents: Vec<DocumentDraft>,
    },
    ItemStarted {
        run: u64,
        index: usize,
    },
    ItemCreated {
        run: u64,
    },
    ItemFailed {
        run: u64,
        error: String,
    },
    Finished {
        run: u64,
    },
    Fail(String),
    Reset,
}

impl GenerationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GenerationEvent::Started { .. } => "Started",
            GenerationEvent::Progress(_) => "Progress",
            GenerationEvent::DocumentsReady { .. } => "DocumentsReady",
            GenerationEvent::ItemStarted { .. } => "ItemStarted",
            GenerationEvent::ItemCreated { .. } => "ItemCreated",
            GenerationEvent::ItemFailed { .. } => "ItemFailed",
            GenerationEvent::Finished { .. } => "Finished",
            GenerationEvent::Fail(_) => "Fail",
            GenerationEvent::Reset => "Reset",
        }
    }
}

/// 一次生成的完整状态；只能通过 `apply` 变更
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GenerationState {
    /// 每次 Started / DocumentsReady 递增，用于识别被取代的编排任务
    pub run: u64,
    pub chat_id: Option<String>,
    pub task_id: Option<String>,
    pub phase: GenerationPhase,
    pub documents: Vec<DocumentProgressItem>,
    pub current_index: usize,
    pub overall_progress: Option<ProgressSignal>,
    pub error: Option<String>,
    pub created_count: usize,
    pub failed_count: usize,
}

impl GenerationState {
    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn processed(&self) -> usize {
        self.created_count + self.failed_count
    }

    /// 纯转移：合法事件返回新状态，否则返回拒绝原因（原状态不变）
    pub fn apply(&self, event: GenerationEvent) -> Result<GenerationState, TransitionError> {
        let phase = self.phase;
        let invalid = |event: &GenerationEvent| TransitionError::InvalidPhase {
            phase,
            event: event.name(),
        };

        match event {
            GenerationEvent::Reset => Ok(GenerationState {
                run: self.run,
                ..GenerationState::default()
            }),

            // 第二次 Started 直接整体替换当前轮
            GenerationEvent::Started { chat_id, task_id } => Ok(GenerationState {
                run: self.run + 1,
                chat_id: Some(chat_id),
                task_id: Some(task_id),
                phase: GenerationPhase::Analyzing,
                documents: default_analysis_documents(),
                ..GenerationState::default()
            }),

            GenerationEvent::Progress(signal) => {
                if phase != GenerationPhase::Analyzing {
                    return Err(invalid(&GenerationEvent::Progress(signal)));
                }
                if let Some(prev) = &self.overall_progress {
                    if signal.progress < prev.progress {
                        return Err(TransitionError::ProgressRegressed {
                            previous: prev.progress,
                            received: signal.progress,
                        });
                    }
                }
                let mut next = self.clone();
                if signal.is_failed() {
                    let message = if signal.message.is_empty() {
                        "Requirement generation failed".to_string()
                    } else {
                        signal.message.clone()
                    };
                    next.overall_progress = Some(signal);
                    return Ok(next.into_failed(message));
                }
                next.documents = progress_documents(signal.progress, &signal.message);
                if signal.progress >= 100 {
                    next.phase = GenerationPhase::Creating;
                }
                next.overall_progress = Some(signal);
                Ok(next)
            }

            // 无论当前处于哪个阶段都整体替换，不与旧列表合并
            GenerationEvent::DocumentsReady { chat_id, documents } => Ok(GenerationState {
                run: self.run + 1,
                chat_id: Some(chat_id),
                task_id: self.task_id.clone(),
                phase: GenerationPhase::Creating,
                documents: documents.iter().map(DocumentProgressItem::from_draft).collect(),
                ..GenerationState::default()
            }),

            GenerationEvent::ItemStarted { run, index } => {
                self.check_creating(run, "ItemStarted")?;
                if index != self.current_index || index >= self.documents.len() {
                    return Err(TransitionError::IndexOutOfOrder {
                        index,
                        current: self.current_index,
                    });
                }
                let mut next = self.clone();
                let total = next.documents.len();
                let item = &mut next.documents[index];
                item.status = ItemStatus::Creating;
                next.overall_progress = Some(ProgressSignal::new(
                    percent(index + 1, total),
                    format!("正在创建文档: {}", item.title),
                    "creating",
                ));
                Ok(next)
            }

            GenerationEvent::ItemCreated { run } => self.finish_item(run, true, "ItemCreated"),
            GenerationEvent::ItemFailed { run, .. } => self.finish_item(run, false, "ItemFailed"),

            GenerationEvent::Finished { run } => {
                self.check_creating(run, "Finished")?;
                if self.current_index < self.documents.len() {
                    return Err(TransitionError::Unfinished {
                        current: self.current_index,
                        total: self.documents.len(),
                    });
                }
                let mut next = self.clone();
                next.overall_progress = None;
                if next.created_count == 0 {
                    let message = GenerationError::TotalCreationFailure {
                        failed: next.failed_count,
                    }
                    .to_string();
                    return Ok(next.into_failed(message));
                }
                next.phase = GenerationPhase::Completed;
                Ok(next)
            }

            GenerationEvent::Fail(message) => {
                if !phase.is_active() {
                    return Err(invalid(&GenerationEvent::Fail(message)));
                }
                Ok(self.clone().into_failed(message))
            }
        }
    }

    fn check_creating(&self, run: u64, event: &'static str) -> Result<(), TransitionError> {
        if run != self.run {
            return Err(TransitionError::StaleRun {
                current_run: self.run,
                event_run: run,
            });
        }
        if self.phase != GenerationPhase::Creating {
            return Err(TransitionError::InvalidPhase {
                phase: self.phase,
                event,
            });
        }
        Ok(())
    }

    /// 无论成功失败都推进 current_index
    fn finish_item(
        &self,
        run: u64,
        created: bool,
        event: &'static str,
    ) -> Result<GenerationState, TransitionError> {
        self.check_creating(run, event)?;
        if self.current_index >= self.documents.len() {
            return Err(TransitionError::IndexOutOfOrder {
                index: self.current_index,
                current: self.current_index,
            });
        }
        let mut next = self.clone();
        let item = &mut next.documents[next.current_index];
        if created {
            item.status = ItemStatus::Created;
            item.progress = 100;
            next.created_count += 1;
        } else {
            item.status = ItemStatus::Failed;
            next.failed_count += 1;
        }
        next.current_index += 1;
        Ok(next)
    }

    /// 进入 Failed 并保持计数守恒
    fn into_failed(mut self, message: String) -> GenerationState {
        match self.phase {
            GenerationPhase::Analyzing => {
                // 分析阶段只有占位步骤，没有真实文档
                self.documents.clear();
                self.current_index = 0;
            }
            GenerationPhase::Creating => {
                for item in self.documents.iter_mut().skip(self.current_index) {
                    item.status = ItemStatus::Failed;
                }
                self.failed_count += self.documents.len() - self.current_index;
                self.current_index = self.documents.len();
            }
            _ => {}
        }
        self.phase = GenerationPhase::Failed;
        self.error = Some(message);
        self
    }
}

/// 初始占位步骤，全部为 0
pub fn default_analysis_documents() -> Vec<DocumentProgressItem> {
    ANALYSIS_STEPS
        .iter()
        .map(|step| DocumentProgressItem::placeholder(format!("{}...", step), 0))
        .collect()
}

/// 按总进度把占位步骤分为 已完成 / 进行中 / 未开始
///
/// 第 i 步的边界为 `(i+1) * 100 / N`；进度严格超过边界才算完成，100% 时全部完成。
pub fn progress_documents(progress: u8, message: &str) -> Vec<DocumentProgressItem> {
    let n = ANALYSIS_STEPS.len() as f64;
    let p = f64::from(progress);
    ANALYSIS_STEPS
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let lower = i as f64 * 100.0 / n;
            let upper = (i + 1) as f64 * 100.0 / n;
            if p > upper || progress >= 100 {
                DocumentProgressItem::placeholder(format!("✓ {}", step), 100)
            } else if p > lower {
                let title = if message.is_empty() {
                    format!("{}...", step)
                } else {
                    message.to_string()
                };
                DocumentProgressItem::placeholder(title, p.min(upper).floor() as u8)
            } else {
                DocumentProgressItem::placeholder(format!("{}...", step), 0)
            }
        })
        .collect()
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(title: &str) -> DocumentDraft {
        DocumentDraft {
            title: title.to_string(),
            content: format!("# {}", title),
            doc_type: "srs-document".into(),
            generated_at: "now".into(),
            ready_for_save: true,
        }
    }

    fn started() -> GenerationState {
        GenerationState::default()
            .apply(GenerationEvent::Started {
                chat_id: "c1".into(),
                task_id: "t1".into(),
            })
            .unwrap()
    }

    fn progress(p: u8) -> GenerationEvent {
        GenerationEvent::Progress(ProgressSignal::new(p, "", "running"))
    }

    #[test]
    fn test_start_initializes_placeholders() {
        let s = started();
        assert_eq!(s.phase, GenerationPhase::Analyzing);
        assert_eq!(s.documents.len(), 6);
        assert!(s.documents.iter().all(|d| d.progress == 0));
        assert_eq!(s.run, 1);
    }

    #[test]
    fn test_progress_buckets_steps() {
        let docs = progress_documents(40, "访谈中");
        assert_eq!(docs[0].progress, 100);
        assert!(docs[0].title.starts_with('✓'));
        assert_eq!(docs[1].progress, 100);
        assert_eq!(docs[2].title, "访谈中");
        assert_eq!(docs[2].progress, 40);
        assert_eq!(docs[3].progress, 0);
        assert!(progress_documents(100, "").iter().all(|d| d.progress == 100));
    }

    #[test]
    fn test_progress_must_not_regress() {
        let s = started().apply(progress(40)).unwrap();
        let err = s.apply(progress(20)).unwrap_err();
        assert_eq!(
            err,
            TransitionError::ProgressRegressed {
                previous: 40,
                received: 20
            }
        );
        assert!(s.apply(progress(40)).is_ok());
    }

    #[test]
    fn test_full_progress_moves_to_creating() {
        let s = started().apply(progress(100)).unwrap();
        assert_eq!(s.phase, GenerationPhase::Creating);
        assert!(s.documents.iter().all(|d| d.progress == 100));
        assert!(s.apply(progress(100)).is_err());
    }

    #[test]
    fn test_failed_progress_fails_run() {
        let s = started()
            .apply(GenerationEvent::Progress(ProgressSignal::new(30, "LLM down", "failed")))
            .unwrap();
        assert_eq!(s.phase, GenerationPhase::Failed);
        assert_eq!(s.error.as_deref(), Some("LLM down"));
        assert_eq!(s.processed(), s.documents.len());
    }

    #[test]
    fn test_documents_ready_replaces_placeholders() {
        let s = started()
            .apply(progress(100))
            .unwrap()
            .apply(GenerationEvent::DocumentsReady {
                chat_id: "c1".into(),
                documents: vec![draft("A"), draft("B")],
            })
            .unwrap();
        assert_eq!(s.phase, GenerationPhase::Creating);
        assert_eq!(s.documents.len(), 2);
        assert_eq!(s.documents[0].title, "A");
        assert_eq!(s.current_index, 0);
        assert_eq!(s.run, 2);
        assert_eq!(s.task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_documents_ready_out_of_order_replaces_run() {
        let s = GenerationState::default()
            .apply(GenerationEvent::DocumentsReady {
                chat_id: "other".into(),
                documents: vec![draft("A")],
            })
            .unwrap();
        assert_eq!(s.phase, GenerationPhase::Creating);
        assert_eq!(s.chat_id.as_deref(), Some("other"));
    }

    #[test]
    fn test_item_events_advance_and_count() {
        let mut s = started()
            .apply(GenerationEvent::DocumentsReady {
                chat_id: "c1".into(),
                documents: vec![draft("A"), draft("B")],
            })
            .unwrap();
        let run = s.run;
        s = s.apply(GenerationEvent::ItemStarted { run, index: 0 }).unwrap();
        assert_eq!(s.documents[0].status, ItemStatus::Creating);
        assert_eq!(s.overall_progress.as_ref().unwrap().progress, 50);
        s = s
            .apply(GenerationEvent::ItemFailed {
                run,
                error: "boom".into(),
            })
            .unwrap();
        assert_eq!(s.current_index, 1);
        assert!(s.apply(GenerationEvent::Finished { run }).is_err());
        s = s.apply(GenerationEvent::ItemStarted { run, index: 1 }).unwrap();
        s = s.apply(GenerationEvent::ItemCreated { run }).unwrap();
        s = s.apply(GenerationEvent::Finished { run }).unwrap();
        assert_eq!(s.phase, GenerationPhase::Completed);
        assert_eq!((s.created_count, s.failed_count), (1, 1));
    }

    #[test]
    fn test_stale_run_is_rejected() {
        let s = started()
            .apply(GenerationEvent::DocumentsReady {
                chat_id: "c1".into(),
                documents: vec![draft("A")],
            })
            .unwrap();
        let err = s
            .apply(GenerationEvent::ItemStarted {
                run: s.run - 1,
                index: 0,
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::StaleRun { .. }));
    }

    #[test]
    fn test_zero_documents_finish_fails() {
        let s = started()
            .apply(GenerationEvent::DocumentsReady {
                chat_id: "c1".into(),
                documents: vec![],
            })
            .unwrap();
        let s = s.apply(GenerationEvent::Finished { run: s.run }).unwrap();
        assert_eq!(s.phase, GenerationPhase::Failed);
        assert!(s.error.unwrap().contains("No documents created"));
    }

    #[test]
    fn test_fail_during_creation_conserves_counts() {
        let s = started()
            .apply(GenerationEvent::DocumentsReady {
                chat_id: "c1".into(),
                documents: vec![draft("A"), draft("B"), draft("C")],
            })
            .unwrap();
        let run = s.run;
        let s = s
            .apply(GenerationEvent::ItemStarted { run, index: 0 })
            .unwrap()
            .apply(GenerationEvent::ItemCreated { run })
            .unwrap()
            .apply(GenerationEvent::Fail("timeout".into()))
            .unwrap();
        assert_eq!(s.phase, GenerationPhase::Failed);
        assert_eq!(s.current_index, 3);
        assert_eq!((s.created_count, s.failed_count), (1, 2));
    }

    #[test]
    fn test_fail_rejected_when_idle_and_reset_from_anywhere() {
        assert!(GenerationState::default()
            .apply(GenerationEvent::Fail("x".into()))
            .is_err());
        let s = started().apply(GenerationEvent::Reset).unwrap();
        assert_eq!(s.phase, GenerationPhase::Idle);
        assert!(s.documents.is_empty());
        assert_eq!(s.run, 1);
    }
}
