//! 对话历史
//!
//! 保存一个聊天的全部消息；发给 LLM 时只取最近 N 条，并在最前面放系统提示词。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChatHistory {
    messages: Vec<Message>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// 最近 `limit` 条消息（时间正序）
    pub fn recent(&self, limit: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(limit);
        &self.messages[start..]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// 组装发送给 LLM 的消息：系统提示词 + 历史窗口 + 本轮用户消息
pub fn build_prompt(system_prompt: &str, history: &[Message], message: &str) -> Vec<Message> {
    let mut out = Vec::with_capacity(history.len() + 2);
    if !system_prompt.is_empty() {
        out.push(Message::system(system_prompt));
    }
    out.extend(
        history
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned(),
    );
    out.push(Message::user(message));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_window() {
        let mut h = ChatHistory::new();
        for i in 0..10 {
            h.push(Message::user(format!("m{}", i)));
        }
        let recent = h.recent(8);
        assert_eq!(recent.len(), 8);
        assert_eq!(recent[0].content, "m2");
        assert_eq!(recent[7].content, "m9");
        assert_eq!(ChatHistory::new().recent(8).len(), 0);
    }

    #[test]
    fn test_build_prompt_order() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let prompt = build_prompt("be brief", &history, "next");
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0], Message::system("be brief"));
        assert_eq!(prompt[3], Message::user("next"));
        assert_eq!(build_prompt("", &[], "x").len(), 1);
    }
}
