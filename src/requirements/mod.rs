//! 后台需求生成任务：REST 负载、客户端、轮询器、进程内宿主

pub mod client;
pub mod poller;
pub mod service;
pub mod types;

pub use client::{HttpRequirementClient, RequirementClient, DEFAULT_REQUIREMENTS_URL};
pub use poller::{JobPoller, PollerConfig};
pub use service::{
    format_results, LlmRequirementWorkflow, ProgressReporter, RequirementService,
    RequirementWorkflow, WorkflowResults, DOCUMENTS_MAPPING,
};
pub use types::{FormattedResult, RequirementRequest, SubmitResponse, TaskStatus, TaskStatusReport};
