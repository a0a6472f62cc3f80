//! 后台需求生成任务的 REST 负载

use serde::{Deserialize, Deserializer, Serialize};

use crate::stream::DocumentDraft;

/// 任务状态：`started → running → completed | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Started,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Started => "started",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// `POST /generate` 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementRequest {
    pub initial_requirements: String,
}

/// `POST /generate` 响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
}

/// `GET /status/{task_id}` 响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

/// `GET /result/{task_id}?formatted=true` 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedResult {
    #[serde(default)]
    pub documents: Vec<DocumentDraft>,
    #[serde(default)]
    pub conversations: Vec<serde_json::Value>,
    #[serde(default)]
    pub summary: String,
}

fn deserialize_progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    if raw.is_nan() {
        return Ok(0);
    }
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_tolerates_loose_progress() {
        let report: TaskStatusReport = serde_json::from_str(
            r#"{"id":"t1","status":"running","progress":37.5,"message":"interviews","results":{}}"#,
        )
        .unwrap();
        assert_eq!(report.status, TaskStatus::Running);
        assert_eq!(report.progress, 38);
        assert_eq!(report.current_step, None);

        let report: TaskStatusReport =
            serde_json::from_str(r#"{"id":"t1","status":"started"}"#).unwrap();
        assert_eq!(report.progress, 0);
    }

    #[test]
    fn test_submit_response_wire_shape() {
        let resp: SubmitResponse = serde_json::from_str(
            r#"{"task_id":"abc","status":"started","message":"initiated"}"#,
        )
        .unwrap();
        assert_eq!(resp.task_id, "abc");
        assert!(!resp.status.is_terminal());
    }
}
