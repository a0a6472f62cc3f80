//! Jotlin 流式对话与需求文档生成核心
//!
//! 模块划分：
//! - **stream**: 帧传输、控制信号、行缓冲解复用、服务端流生产者
//! - **core**: 生成状态机、文档创建编排、错误类型、关闭管理
//! - **requirements**: 后台需求任务（客户端、轮询器、进程内任务宿主）
//! - **documents**: 文档创建接口与 HTTP 实现
//! - **client**: 客户端会话（读流 → 状态机 → 编排）
//! - **chat**: 聊天历史与 Prompt 组装
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod chat;
pub mod client;
pub mod config;
pub mod core;
pub mod documents;
pub mod llm;
pub mod observability;
pub mod requirements;
pub mod stream;
