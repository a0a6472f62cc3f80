//! 进程内后台任务宿主
//!
//! 任务以 UUID 为键保存在内存中，状态 `started → running → completed | failed`。
//! 工作流在独立 task 中运行，阶段之间通过 `ProgressReporter` 回写进度。
//! 同时实现 `RequirementClient`，生产者可以不经 HTTP 直接使用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::chat::Message;
use crate::core::RequirementError;
use crate::llm::LlmClient;
use crate::requirements::client::RequirementClient;
use crate::requirements::types::{FormattedResult, SubmitResponse, TaskStatus, TaskStatusReport};
use crate::stream::DocumentDraft;

/// 工作流产物：结果键 → Markdown 文本（另含 `conversations` 数组）
pub type WorkflowResults = Map<String, Value>;

/// 结果键、文档标题、文档类型；顺序即文档创建顺序
pub const DOCUMENTS_MAPPING: [(&str, &str, &str); 7] = [
    ("interview_record", "Interview Record", "interview-record"),
    ("user_requirements", "User Requirements", "user-requirements"),
    ("operation_environment", "Operation Environment", "operation-environment"),
    ("system_requirements", "System Requirements", "system-requirements"),
    ("requirement_model", "Use Case Model (PlantUML)", "use-case-model"),
    ("srs_document", "Software Requirements Specification", "srs-document"),
    ("review_report", "SRS Review Report", "review-report"),
];

struct TaskRecord {
    report: TaskStatusReport,
    results: Option<WorkflowResults>,
}

type TaskMap = Arc<RwLock<HashMap<String, TaskRecord>>>;

/// 工作流向任务记录回写进度
#[derive(Clone)]
pub struct ProgressReporter {
    tasks: TaskMap,
    task_id: String,
}

impl ProgressReporter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn report(&self, step: &str, progress: u8, message: &str) {
        if let Some(record) = self.tasks.write().await.get_mut(&self.task_id) {
            record.report.progress = progress.min(100);
            record.report.message = message.to_string();
            record.report.current_step = Some(step.to_string());
        }
        tracing::info!(task_id = %self.task_id, step, progress, "{}", message);
    }
}

/// 需求分析工作流
#[async_trait]
pub trait RequirementWorkflow: Send + Sync {
    async fn run(
        &self,
        initial_requirements: &str,
        progress: &ProgressReporter,
    ) -> Result<WorkflowResults, String>;
}

#[derive(Clone)]
pub struct RequirementService {
    tasks: TaskMap,
    workflow: Arc<dyn RequirementWorkflow>,
}

impl RequirementService {
    pub fn new(workflow: Arc<dyn RequirementWorkflow>) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            workflow,
        }
    }

    /// 登记任务并在后台启动工作流，立即返回任务 id
    pub async fn start(&self, initial_requirements: &str) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.tasks.write().await.insert(
            task_id.clone(),
            TaskRecord {
                report: TaskStatusReport {
                    id: task_id.clone(),
                    status: TaskStatus::Started,
                    progress: 0,
                    message: "Multi-agent requirement generation process has been initiated"
                        .to_string(),
                    current_step: None,
                },
                results: None,
            },
        );
        tracing::info!(task_id = %task_id, "Requirement generation task started");

        let reporter = ProgressReporter {
            tasks: self.tasks.clone(),
            task_id: task_id.clone(),
        };
        let workflow = self.workflow.clone();
        let initial = initial_requirements.to_string();
        tokio::spawn(async move {
            Self::run_workflow(workflow, reporter, initial).await;
        });
        task_id
    }

    async fn run_workflow(
        workflow: Arc<dyn RequirementWorkflow>,
        reporter: ProgressReporter,
        initial_requirements: String,
    ) {
        let tasks = reporter.tasks.clone();
        let task_id = reporter.task_id.clone();
        if let Some(record) = tasks.write().await.get_mut(&task_id) {
            record.report.status = TaskStatus::Running;
            record.report.progress = 5;
            record.report.message = "Running multi-agent requirement analysis".to_string();
        }

        let outcome = workflow.run(&initial_requirements, &reporter).await;

        let mut guard = tasks.write().await;
        let Some(record) = guard.get_mut(&task_id) else {
            return;
        };
        match outcome {
            Ok(results) => {
                record.report.status = TaskStatus::Completed;
                record.report.progress = 100;
                record.report.message = "Requirement generation completed successfully".to_string();
                record.report.current_step = Some("completed".to_string());
                record.results = Some(results);
                tracing::info!(task_id = %task_id, "Requirement workflow completed");
            }
            Err(e) => {
                record.report.status = TaskStatus::Failed;
                record.report.message = format!("Error during requirement generation: {}", e);
                tracing::error!(task_id = %task_id, error = %e, "Requirement workflow failed");
            }
        }
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatusReport> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|r| r.report.clone())
    }

    /// 原始结果；未知任务 `NotFound`，未完成 `NotCompleted`
    pub async fn results(&self, task_id: &str) -> Result<WorkflowResults, RequirementError> {
        let tasks = self.tasks.read().await;
        let record = tasks
            .get(task_id)
            .ok_or_else(|| RequirementError::NotFound(task_id.to_string()))?;
        match (&record.report.status, &record.results) {
            (TaskStatus::Completed, Some(results)) => Ok(results.clone()),
            (status, _) => Err(RequirementError::NotCompleted {
                task_id: task_id.to_string(),
                status: status.as_str().to_string(),
            }),
        }
    }
}

/// 把工作流产物整理为文档草稿；空值或缺失的键跳过
pub fn format_results(results: &WorkflowResults) -> FormattedResult {
    let generated_at = chrono::Utc::now().to_rfc3339();
    let documents: Vec<DocumentDraft> = DOCUMENTS_MAPPING
        .iter()
        .filter_map(|(key, title, doc_type)| {
            let content = results.get(*key)?.as_str()?.trim();
            if content.is_empty() {
                return None;
            }
            Some(DocumentDraft {
                title: title.to_string(),
                content: content.to_string(),
                doc_type: doc_type.to_string(),
                generated_at: generated_at.clone(),
                ready_for_save: true,
            })
        })
        .collect();

    let conversations = results
        .get("conversations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    FormattedResult {
        summary: format!("Generated {} requirement documents", documents.len()),
        documents,
        conversations,
    }
}

#[async_trait]
impl RequirementClient for RequirementService {
    async fn submit(&self, initial_requirements: &str) -> Result<SubmitResponse, RequirementError> {
        let task_id = self.start(initial_requirements).await;
        Ok(SubmitResponse {
            task_id,
            status: TaskStatus::Started,
            message: "Requirement generation process has been initiated".to_string(),
        })
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatusReport, RequirementError> {
        self.task_status(task_id)
            .await
            .ok_or_else(|| RequirementError::NotFound(task_id.to_string()))
    }

    async fn formatted_result(&self, task_id: &str) -> Result<FormattedResult, RequirementError> {
        self.results(task_id).await.map(|r| format_results(&r))
    }

    async fn raw_result(&self, task_id: &str) -> Result<Value, RequirementError> {
        self.results(task_id).await.map(Value::Object)
    }
}

struct StageOutput {
    key: &'static str,
    instruction: &'static str,
}

struct Stage {
    step: &'static str,
    progress: u8,
    message: &'static str,
    outputs: &'static [StageOutput],
}

const STAGES: &[Stage] = &[
    Stage {
        step: "initialize",
        progress: 10,
        message: "Initializing and identifying end users...",
        outputs: &[StageOutput {
            key: "end_users",
            instruction: "List the end users and stakeholders of this system, one per line.",
        }],
    },
    Stage {
        step: "interviews",
        progress: 30,
        message: "Conducting user interviews and gathering requirements...",
        outputs: &[
            StageOutput {
                key: "interview_record",
                instruction: "Simulate an interview with each end user and write the interview record in Markdown.",
            },
            StageOutput {
                key: "user_requirements",
                instruction: "Write the user requirements list derived from the interview record in Markdown.",
            },
        ],
    },
    Stage {
        step: "deployment",
        progress: 50,
        message: "Analyzing deployment environment and constraints...",
        outputs: &[StageOutput {
            key: "operation_environment",
            instruction: "Describe the operation environment, deployment constraints and assumptions in Markdown.",
        }],
    },
    Stage {
        step: "analysis",
        progress: 70,
        message: "Analyzing requirements and generating use case models...",
        outputs: &[
            StageOutput {
                key: "system_requirements",
                instruction: "Write the system requirements (functional and non-functional) in Markdown.",
            },
            StageOutput {
                key: "requirement_model",
                instruction: "Write a PlantUML use case diagram for the system inside a ```plantuml block.",
            },
        ],
    },
    Stage {
        step: "srs_generation",
        progress: 80,
        message: "Generating IEEE 29148 compliant SRS document...",
        outputs: &[StageOutput {
            key: "srs_document",
            instruction: "Write an IEEE 29148 compliant Software Requirements Specification in Markdown.",
        }],
    },
    Stage {
        step: "review",
        progress: 90,
        message: "Conducting quality review of SRS document...",
        outputs: &[StageOutput {
            key: "review_report",
            instruction: "Review the SRS for completeness, consistency and verifiability; write the review report in Markdown.",
        }],
    },
];

const ANALYST_PROMPT: &str =
    "You are a senior requirements engineer. Produce only the requested artifact.";

/// 每个分析阶段调用一次 LLM，前序产物作为上下文
pub struct LlmRequirementWorkflow {
    llm: Arc<dyn LlmClient>,
}

impl LlmRequirementWorkflow {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl RequirementWorkflow for LlmRequirementWorkflow {
    async fn run(
        &self,
        initial_requirements: &str,
        progress: &ProgressReporter,
    ) -> Result<WorkflowResults, String> {
        let mut results = WorkflowResults::new();
        let mut context = String::new();

        for stage in STAGES {
            progress
                .report(stage.step, stage.progress, stage.message)
                .await;
            for output in stage.outputs {
                let prompt = format!(
                    "Initial requirements:\n{}\n\nPrior artifacts:\n{}\n\nTask: {}",
                    initial_requirements, context, output.instruction
                );
                let text = self
                    .llm
                    .complete(&[Message::system(ANALYST_PROMPT), Message::user(prompt)])
                    .await
                    .map_err(|e| format!("{} failed: {}", output.key, e))?;
                context.push_str(&format!("## {}\n{}\n\n", output.key, text));
                results.insert(output.key.to_string(), Value::String(text));
            }
        }

        results.insert("conversations".to_string(), Value::Array(Vec::new()));
        Ok(results)
    }
}
