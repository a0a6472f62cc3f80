//! 内存中的聊天仓库：chat_id → 历史

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::chat::{ChatHistory, Message};

#[derive(Debug, Default)]
pub struct ChatStore {
    chats: RwLock<HashMap<String, ChatHistory>>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最近 `limit` 条消息的副本；未知聊天返回空
    pub async fn recent(&self, chat_id: &str, limit: usize) -> Vec<Message> {
        self.chats
            .read()
            .await
            .get(chat_id)
            .map(|h| h.recent(limit).to_vec())
            .unwrap_or_default()
    }

    pub async fn append(&self, chat_id: &str, message: Message) {
        self.chats
            .write()
            .await
            .entry(chat_id.to_string())
            .or_default()
            .push(message);
    }

    pub async fn len(&self, chat_id: &str) -> usize {
        self.chats
            .read()
            .await
            .get(chat_id)
            .map(ChatHistory::len)
            .unwrap_or(0)
    }
}
