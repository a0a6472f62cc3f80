//! 文档创建协作方
//!
//! 编排器只依赖 `DocumentCreator`；默认实现把 Markdown 草稿 POST 到文档服务。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DocumentsSection;
use crate::core::DocumentError;
use crate::stream::DocumentDraft;

/// 文档服务返回的新文档
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CreatedDocument {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// 把单个草稿持久化为文档
#[async_trait]
pub trait DocumentCreator: Send + Sync {
    async fn create(
        &self,
        chat_id: &str,
        draft: &DocumentDraft,
    ) -> Result<CreatedDocument, DocumentError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFromMarkdown<'a> {
    title: &'a str,
    markdown_content: &'a str,
    parent_document: Option<&'a str>,
    chat_id: &'a str,
}

/// 通过 HTTP 调用 `create-from-markdown` 接口
pub struct HttpDocumentCreator {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpDocumentCreator {
    pub fn new(base_url: &str, create_path: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                create_path.trim_start_matches('/')
            ),
        }
    }

    pub fn from_config(section: &DocumentsSection) -> Self {
        Self::new(
            &section.base_url,
            &section.create_path,
            Duration::from_secs(section.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DocumentCreator for HttpDocumentCreator {
    async fn create(
        &self,
        chat_id: &str,
        draft: &DocumentDraft,
    ) -> Result<CreatedDocument, DocumentError> {
        let body = CreateFromMarkdown {
            title: &draft.title,
            markdown_content: &draft.content,
            parent_document: None,
            chat_id,
        };
        let resp = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DocumentError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let created: CreatedDocument = resp.json().await?;
        if created.id.is_empty() {
            return Err(DocumentError::Rejected(format!(
                "empty id for \"{}\"",
                draft.title
            )));
        }
        Ok(created)
    }
}
