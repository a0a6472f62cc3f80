//! 对话：消息、历史窗口、按聊天 id 存放的内存仓库

pub mod history;
pub mod store;

pub use history::{build_prompt, ChatHistory, Message, Role};
pub use store::ChatStore;
