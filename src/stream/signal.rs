//! 带内控制信号：哨兵前缀 + JSON 负载
//!
//! 信号以独立一行的形式混在 `content` 文本里：`<哨兵><JSON>\n`。
//! 三种信号：生成开始、分析进度、文档就绪。

use serde::{Deserialize, Deserializer, Serialize};

pub const PROGRESS_SENTINEL: &str = "__GENERATION_PROGRESS__:";
pub const GENERATION_START_SENTINEL: &str = "__DOCUMENT_GENERATION_START__:";
pub const DOCUMENTS_SENTINEL: &str = "__DOCUMENTS_GENERATED__:";

/// 信号种类；`SCAN_ORDER` 即解复用时的匹配优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Progress,
    GenerationStart,
    DocumentsReady,
}

impl SignalKind {
    pub const SCAN_ORDER: [SignalKind; 3] = [
        SignalKind::Progress,
        SignalKind::GenerationStart,
        SignalKind::DocumentsReady,
    ];

    pub fn sentinel(self) -> &'static str {
        match self {
            SignalKind::Progress => PROGRESS_SENTINEL,
            SignalKind::GenerationStart => GENERATION_START_SENTINEL,
            SignalKind::DocumentsReady => DOCUMENTS_SENTINEL,
        }
    }
}

/// 分析进度；progress 接受任意 JSON 数字，四舍五入并截断到 0..=100
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSignal {
    #[serde(deserialize_with = "deserialize_percent")]
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

impl ProgressSignal {
    pub fn new(progress: u8, message: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            progress: progress.min(100),
            message: message.into(),
            status: status.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("failed")
    }
}

/// 生成开始：后台任务已提交
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStartSignal {
    pub chat_id: String,
    pub task_id: String,
}

/// 后台任务产出的文档草稿，收到后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDraft {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub doc_type: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub ready_for_save: bool,
}

/// 文档就绪：真实文档列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentsSignal {
    pub chat_id: String,
    #[serde(default)]
    pub documents: Vec<DocumentDraft>,
}

/// 从文本行中解析出的控制信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    GenerationStart(GenerationStartSignal),
    Progress(ProgressSignal),
    DocumentsReady(DocumentsSignal),
}

impl ControlSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            ControlSignal::GenerationStart(_) => SignalKind::GenerationStart,
            ControlSignal::Progress(_) => SignalKind::Progress,
            ControlSignal::DocumentsReady(_) => SignalKind::DocumentsReady,
        }
    }

    /// 按种类解码哨兵之后的 JSON
    pub fn decode(kind: SignalKind, data: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            SignalKind::Progress => ControlSignal::Progress(serde_json::from_str(data)?),
            SignalKind::GenerationStart => {
                ControlSignal::GenerationStart(serde_json::from_str(data)?)
            }
            SignalKind::DocumentsReady => {
                ControlSignal::DocumentsReady(serde_json::from_str(data)?)
            }
        })
    }

    /// 渲染为一整行：`<哨兵><JSON>\n`
    pub fn to_line(&self) -> String {
        let json = match self {
            ControlSignal::GenerationStart(s) => serde_json::to_string(s),
            ControlSignal::Progress(s) => serde_json::to_string(s),
            ControlSignal::DocumentsReady(s) => serde_json::to_string(s),
        }
        // 纯数据结构序列化不会失败
        .unwrap_or_default();
        format!("{}{}\n", self.kind().sentinel(), json)
    }
}

fn deserialize_percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.is_nan() {
        return Ok(0);
    }
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_clamps_and_rounds() {
        let p: ProgressSignal =
            serde_json::from_str(r#"{"progress": 42.6, "message": "m", "status": "running"}"#)
                .unwrap();
        assert_eq!(p.progress, 43);

        let p: ProgressSignal = serde_json::from_str(r#"{"progress": 250}"#).unwrap();
        assert_eq!(p.progress, 100);
        assert_eq!(p.message, "");

        let p: ProgressSignal = serde_json::from_str(r#"{"progress": -3}"#).unwrap();
        assert_eq!(p.progress, 0);
    }

    #[test]
    fn test_start_signal_wire_names() {
        let s = ControlSignal::GenerationStart(GenerationStartSignal {
            chat_id: "c1".into(),
            task_id: "t1".into(),
        });
        assert_eq!(
            s.to_line(),
            "__DOCUMENT_GENERATION_START__:{\"chatId\":\"c1\",\"taskId\":\"t1\"}\n"
        );
    }

    #[test]
    fn test_documents_signal_decodes_wire_shape() {
        let data = r#"{"chatId":"c1","documents":[{"title":"SRS","content":"body","type":"srs-document","generated_at":"now","ready_for_save":true}]}"#;
        let signal = ControlSignal::decode(SignalKind::DocumentsReady, data).unwrap();
        match signal {
            ControlSignal::DocumentsReady(d) => {
                assert_eq!(d.chat_id, "c1");
                assert_eq!(d.documents.len(), 1);
                assert_eq!(d.documents[0].doc_type, "srs-document");
                assert!(d.documents[0].ready_for_save);
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        assert!(ControlSignal::decode(SignalKind::GenerationStart, r#"{"chatId":"c"}"#).is_err());
        assert!(ControlSignal::decode(SignalKind::Progress, "not json").is_err());
    }
}
