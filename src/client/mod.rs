//! 客户端：发起流式对话请求，并把帧流驱动进生成状态机

pub mod chat;
pub mod session;

pub use chat::{ByteStream, ChatStreamClient, StreamRequest};
pub use session::{GenerationSession, SessionReport};
