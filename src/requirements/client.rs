//! 后台任务客户端
//!
//! 轮询器与生产者只依赖 `RequirementClient`；任务可以跑在远端服务，也可以跑在本进程
//! （见 `requirements::service`）。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::RequirementError;
use crate::requirements::types::{
    FormattedResult, RequirementRequest, SubmitResponse, TaskStatusReport,
};

pub const DEFAULT_REQUIREMENTS_URL: &str = "http://localhost:8000/api/requirements";

#[async_trait]
pub trait RequirementClient: Send + Sync {
    /// 提交需求，返回任务 id
    async fn submit(&self, initial_requirements: &str) -> Result<SubmitResponse, RequirementError>;

    async fn status(&self, task_id: &str) -> Result<TaskStatusReport, RequirementError>;

    /// 整理为文档草稿的结果；任务未完成时返回 `NotCompleted`
    async fn formatted_result(&self, task_id: &str) -> Result<FormattedResult, RequirementError>;

    /// 原始结果（各阶段产物的键值）
    async fn raw_result(&self, task_id: &str) -> Result<serde_json::Value, RequirementError>;
}

/// 基于 reqwest 的 REST 客户端
pub struct HttpRequirementClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRequirementClient {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_REQUIREMENTS_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        task_id: &str,
        url: String,
    ) -> Result<T, RequirementError> {
        let resp = self.http.get(url).send().await?;
        let resp = check_status(task_id, resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| RequirementError::Decode(e.to_string()))
    }
}

/// 404 → NotFound，400 → NotCompleted（服务端以 400 表示任务尚未完成）
async fn check_status(
    task_id: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, RequirementError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        404 => RequirementError::NotFound(task_id.to_string()),
        400 => RequirementError::NotCompleted {
            task_id: task_id.to_string(),
            status: body,
        },
        code => RequirementError::Status { status: code, body },
    })
}

#[async_trait]
impl RequirementClient for HttpRequirementClient {
    async fn submit(&self, initial_requirements: &str) -> Result<SubmitResponse, RequirementError> {
        let body = RequirementRequest {
            initial_requirements: initial_requirements.to_string(),
        };
        let resp = self.http.post(self.url("generate")).json(&body).send().await?;
        let resp = check_status("", resp).await?;
        resp.json::<SubmitResponse>()
            .await
            .map_err(|e| RequirementError::Decode(e.to_string()))
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatusReport, RequirementError> {
        self.get_json(task_id, self.url(&format!("status/{}", task_id)))
            .await
    }

    async fn formatted_result(&self, task_id: &str) -> Result<FormattedResult, RequirementError> {
        self.get_json(task_id, self.url(&format!("result/{}?formatted=true", task_id)))
            .await
    }

    async fn raw_result(&self, task_id: &str) -> Result<serde_json::Value, RequirementError> {
        self.get_json(task_id, self.url(&format!("result/{}?formatted=false", task_id)))
            .await
    }
}
