//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, TokenStream};

use crate::config::LlmSection;

/// 按 [llm] 段选择后端；未知 provider 回退到 DeepSeek
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::info!("Using mock LLM backend");
            Arc::new(MockLlmClient::new())
        }
        "openai" => {
            let model = section.model.as_deref().unwrap_or("gpt-4o-mini");
            tracing::info!(model, "Using OpenAI-compatible LLM backend");
            Arc::new(OpenAiClient::new(section.base_url.as_deref(), model, None))
        }
        other => {
            if other != "deepseek" {
                tracing::warn!(provider = other, "Unknown LLM provider, falling back to deepseek");
            }
            let client =
                create_deepseek_client(section.model.as_deref(), section.base_url.as_deref());
            tracing::info!(model = client.model(), "Using DeepSeek LLM backend");
            Arc::new(client)
        }
    }
}
