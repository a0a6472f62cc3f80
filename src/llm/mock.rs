//! Mock LLM 客户端（用于测试与本地演示，无需 API）
//!
//! 默认把最后一条 User 消息拆成若干 Token 回显；也可指定固定脚本或在第 N 个 Token 后出错。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::chat::{Message, Role};
use crate::core::LlmError;
use crate::llm::{LlmClient, TokenStream};

#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    script: Option<Vec<String>>,
    fail_after: Option<usize>,
    token_delay: Duration,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按给定 Token 序列输出
    pub fn scripted<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Some(tokens.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// 输出 n 个 Token 后以错误结束
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    fn tokens_for(&self, messages: &[Message]) -> Vec<String> {
        if let Some(script) = &self.script {
            return script.clone();
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        format!("Echo from Mock: {}", last_user)
            .split_inclusive(' ')
            .map(String::from)
            .collect()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if self.fail_after.is_some() {
            return Err(LlmError::Api("mock failure".into()));
        }
        Ok(self.tokens_for(messages).concat())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let mut items: Vec<Result<String, LlmError>> =
            self.tokens_for(messages).into_iter().map(Ok).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(LlmError::Stream("mock stream interrupted".into())));
        }
        let delay = self.token_delay;
        let tokens = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(tokens))
    }
}
