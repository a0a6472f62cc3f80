//! 流式对话请求
//!
//! `POST {server}/api/chats/{chat_id}/stream`，响应体按帧读取。

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::core::TransportError;
use crate::stream::FrameReader;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub message: String,
    #[serde(default)]
    pub generate_documents: bool,
}

pub struct ChatStreamClient {
    http: reqwest::Client,
    server_url: String,
}

impl ChatStreamClient {
    pub fn new(server_url: &str) -> Self {
        // 流可能持续数分钟，只限制建连时间
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, chat_id: &str) -> String {
        format!("{}/api/chats/{}/stream", self.server_url, chat_id)
    }

    /// 发起请求；非 2xx 状态直接返回 `TransportError::Status`
    pub async fn open(
        &self,
        chat_id: &str,
        message: &str,
        generate_documents: bool,
    ) -> Result<FrameReader<ByteStream>, TransportError> {
        let body = StreamRequest {
            message: message.to_string(),
            generate_documents,
        };
        let resp = self
            .http
            .post(self.stream_url(chat_id))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(chat_id, "Chat stream opened");
        let stream: ByteStream = resp.bytes_stream().boxed();
        Ok(FrameReader::new(stream))
    }
}
