//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `JOTLIN__*` 覆盖
//! （双下划线表示嵌套，如 `JOTLIN__REQUIREMENTS__POLL_INTERVAL_MS=500`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub requirements: RequirementsSection,
    pub generation: GenerationSection,
    pub documents: DocumentsSection,
    pub web: WebSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与对话窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// deepseek / openai / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub system_prompt: String,
    /// 发送给 LLM 的历史消息条数
    pub history_messages: usize,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            system_prompt: "You are a helpful requirements analyst. Answer in the user's language."
                .to_string(),
            history_messages: 8,
        }
    }
}

/// [requirements] 段：后台需求生成任务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequirementsSection {
    /// 远端任务服务地址（如 http://localhost:8000/api/requirements）；未设置则在进程内运行
    pub base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub max_consecutive_errors: u32,
    pub backoff_cap_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RequirementsSection {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: 2000,
            max_attempts: 300,
            max_consecutive_errors: 5,
            backoff_cap_ms: 30_000,
            request_timeout_secs: 120,
        }
    }
}

/// [generation] 段：全局超时与 UI 节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub timeout_secs: u64,
    pub progress_update_ms: u64,
    pub state_sync_ms: u64,
    pub auto_reset_secs: Option<u64>,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            progress_update_ms: 100,
            state_sync_ms: 200,
            auto_reset_secs: None,
        }
    }
}

/// [documents] 段：文档创建服务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentsSection {
    pub base_url: String,
    pub create_path: String,
    pub timeout_secs: u64,
}

impl Default for DocumentsSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            create_path: "/api/documents/create-from-markdown".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl WebSection {
    /// `JOTLIN_WEB_PORT` 优先于配置文件
    pub fn effective_port(&self) -> u16 {
        std::env::var("JOTLIN_WEB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub server_url: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 JOTLIN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 JOTLIN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("JOTLIN")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.history_messages, 8);
        assert_eq!(cfg.requirements.poll_interval_ms, 2000);
        assert_eq!(cfg.generation.timeout_secs, 1800);
        assert_eq!(cfg.generation.progress_update_ms, 100);
        assert_eq!(cfg.generation.state_sync_ms, 200);
        assert_eq!(cfg.web.port, 8080);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[requirements]
base_url = "http://jobs:8000/api/requirements"
poll_interval_ms = 500

[generation]
auto_reset_secs = 5
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(
            cfg.requirements.base_url.as_deref(),
            Some("http://jobs:8000/api/requirements")
        );
        assert_eq!(cfg.requirements.poll_interval_ms, 500);
        // 未写的键保持默认
        assert_eq!(cfg.requirements.max_consecutive_errors, 5);
        assert_eq!(cfg.generation.auto_reset_secs, Some(5));
        assert_eq!(cfg.documents.timeout_secs, 30);
    }
}
