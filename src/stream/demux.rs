//! 行缓冲解复用器
//!
//! 把任意切分的文本块重组为完整行，再把每行分类为展示文本或控制信号。
//! 结果只取决于已见过的输入，与切分位置无关。

use crate::core::SignalParseError;
use crate::stream::signal::{ControlSignal, SignalKind};

/// 一条完整行的分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxedLine {
    /// 展示文本（已去掉结尾换行，非空）
    Display(String),
    Signal(ControlSignal),
    /// 命中哨兵但解析失败：同样不展示
    Malformed(SignalParseError),
}

#[derive(Debug, Default)]
pub struct LineDemuxer {
    pending: String,
    display: String,
}

impl LineDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一块文本，返回本次凑齐的完整行
    pub fn push(&mut self, chunk: &str) -> Vec<DemuxedLine> {
        self.pending.push_str(chunk);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        let mut out = Vec::new();
        // complete 以 '\n' 结尾，最后一个切片为空，不是行
        for line in complete[..complete.len() - 1].split('\n') {
            if let Some(item) = self.classify(line) {
                out.push(item);
            }
        }
        out
    }

    /// 流结束：把没有换行结尾的残余当作最后一行处理
    pub fn finish(&mut self) -> Vec<DemuxedLine> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return Vec::new();
        }
        self.classify(&rest).into_iter().collect()
    }

    /// 累计的展示文本（每行后带 `\n`）
    pub fn display_text(&self) -> &str {
        &self.display
    }

    fn classify(&mut self, line: &str) -> Option<DemuxedLine> {
        if let Some(result) = classify_signal(line) {
            return Some(match result {
                Ok(signal) => {
                    tracing::info!(kind = ?signal.kind(), "Signal received");
                    DemuxedLine::Signal(signal)
                }
                Err(err) => {
                    tracing::error!(
                        line = %err.line,
                        signal_data = %err.data,
                        reason = %err.reason,
                        "Failed to parse {:?} signal",
                        err.kind
                    );
                    DemuxedLine::Malformed(err)
                }
            });
        }

        if line.trim().is_empty() {
            return None;
        }
        self.display.push_str(line);
        self.display.push('\n');
        Some(DemuxedLine::Display(line.to_string()))
    }
}

/// 按固定优先级查找哨兵；未命中返回 None
pub fn classify_signal(line: &str) -> Option<Result<ControlSignal, SignalParseError>> {
    SignalKind::SCAN_ORDER.iter().find_map(|&kind| {
        let sentinel = kind.sentinel();
        let start = line.find(sentinel)?;
        let data = line[start + sentinel.len()..].trim();
        Some(
            ControlSignal::decode(kind, data).map_err(|e| SignalParseError {
                kind,
                line: line.to_string(),
                data: data.to_string(),
                reason: e.to_string(),
            }),
        )
    })
}
