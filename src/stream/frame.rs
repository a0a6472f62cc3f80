//! 帧传输：`data: <payload>\n\n` 行式分帧
//!
//! - 文本帧：`data: {"content":"..."}\n\n`
//! - 错误帧：`data: {"error":"..."}\n\n`
//! - 结束帧：`data: [DONE]\n\n`
//!
//! 写端每帧一次发送（即一次响应体 chunk），不做额外缓冲；读端按字节缓冲，
//! 遇到 `\n\n` 才解出完整帧，多字节 UTF-8 被网络切开也不会乱码。

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::TransportError;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";
const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";
const FRAME_DELIMITER: &[u8] = b"\n\n";

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Done,
    Error,
}

/// 传输层单元，读出即消费，不持久化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub kind: FrameKind,
    pub payload: String,
}

impl StreamFrame {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload: payload.into(),
        }
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Error,
            payload: payload.into(),
        }
    }

    pub fn done() -> Self {
        Self {
            kind: FrameKind::Done,
            payload: String::new(),
        }
    }
}

#[derive(Serialize)]
struct ContentBody<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Deserialize)]
struct IncomingBody {
    content: Option<String>,
    error: Option<String>,
}

/// 编码单帧
pub fn encode_frame(frame: &StreamFrame) -> String {
    let json = match frame.kind {
        FrameKind::Done => return DONE_FRAME.to_string(),
        FrameKind::Text => serde_json::to_string(&ContentBody {
            content: &frame.payload,
        }),
        FrameKind::Error => serde_json::to_string(&ErrorBody {
            error: &frame.payload,
        }),
    }
    .unwrap_or_default();
    format!("{}{}\n\n", DATA_PREFIX, json)
}

/// 帧写端：接收端即 HTTP 响应体；接收端被丢弃说明客户端已断开
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<String>,
    finished: bool,
}

impl FrameWriter {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            finished: false,
        }
    }

    /// 创建写端与对应的接收端
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub async fn write(&mut self, kind: FrameKind, payload: &str) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        let encoded = encode_frame(&StreamFrame {
            kind,
            payload: payload.to_string(),
        });
        self.tx
            .send(encoded)
            .await
            .map_err(|_| TransportError::Closed)?;
        if kind == FrameKind::Done {
            self.finished = true;
        }
        Ok(())
    }

    pub async fn text(&mut self, payload: &str) -> Result<(), TransportError> {
        self.write(FrameKind::Text, payload).await
    }

    pub async fn error(&mut self, message: &str) -> Result<(), TransportError> {
        self.write(FrameKind::Error, message).await
    }

    pub async fn done(&mut self) -> Result<(), TransportError> {
        self.write(FrameKind::Done, "").await
    }

    /// 接收端被丢弃时完成；不借用写端，可与写入并发等待
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }
}

/// 增量解帧：喂入任意切分的字节，吐出完整帧
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        self.buf.extend_from_slice(bytes);

        while let Some(pos) = find_delimiter(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..pos + FRAME_DELIMITER.len()).collect();
            let block = String::from_utf8_lossy(&raw[..pos]);
            if let Some(frame) = decode_block(&block) {
                let is_done = frame.kind == FrameKind::Done;
                frames.push(frame);
                if is_done {
                    // [DONE] 之后的内容一律忽略
                    self.done = true;
                    self.buf.clear();
                    break;
                }
            }
        }
        frames
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

fn decode_block(block: &str) -> Option<StreamFrame> {
    let data = block
        .lines()
        .find_map(|line| line.strip_prefix(DATA_PREFIX))?;
    if data.trim() == DONE_MARKER {
        return Some(StreamFrame::done());
    }
    match serde_json::from_str::<IncomingBody>(data) {
        Ok(IncomingBody {
            error: Some(error), ..
        }) => Some(StreamFrame::error(error)),
        Ok(IncomingBody {
            content: Some(content),
            ..
        }) => Some(StreamFrame::text(content)),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed frame payload");
            None
        }
    }
}

/// 帧读端：包装任意字节流（如 reqwest 的 bytes_stream）
pub struct FrameReader<S> {
    stream: S,
    decoder: FrameDecoder,
    queue: VecDeque<StreamFrame>,
    eof: bool,
}

impl<S, B, E> FrameReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
            eof: false,
        }
    }

    /// 读取下一帧；EOF 或 [DONE] 之后恒返回 Ok(None)
    pub async fn read(&mut self) -> Result<Option<StreamFrame>, TransportError> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof || self.decoder.is_done() {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    let frames = self.decoder.push(chunk.as_ref());
                    self.queue.extend(frames);
                }
                Some(Err(e)) => {
                    self.eof = true;
                    return Err(TransportError::Read(e.to_string()));
                }
                None => {
                    self.eof = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_encode_is_byte_exact() {
        assert_eq!(
            encode_frame(&StreamFrame::text("hi\nthere")),
            "data: {\"content\":\"hi\\nthere\"}\n\n"
        );
        assert_eq!(
            encode_frame(&StreamFrame::error("Stream failed")),
            "data: {\"error\":\"Stream failed\"}\n\n"
        );
        assert_eq!(encode_frame(&StreamFrame::done()), "data: [DONE]\n\n");
    }

    #[test]
    fn test_decoder_handles_split_utf8_and_delimiters() {
        let wire = format!(
            "{}{}",
            encode_frame(&StreamFrame::text("需求分析")),
            encode_frame(&StreamFrame::done())
        );
        let bytes = wire.as_bytes();
        for split in 1..bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push(&bytes[..split]);
            frames.extend(decoder.push(&bytes[split..]));
            assert_eq!(
                frames,
                vec![StreamFrame::text("需求分析"), StreamFrame::done()],
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_decoder_ignores_frames_after_done() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: [DONE]\n\ndata: {\"content\":\"late\"}\n\n");
        assert_eq!(frames, vec![StreamFrame::done()]);
        assert!(decoder.push(b"data: [DONE]\n\n").is_empty());
    }

    #[test]
    fn test_decoder_skips_non_data_and_malformed() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b": keepalive\n\ndata: {oops\n\ndata: {\"error\":\"x\"}\n\n");
        assert_eq!(frames, vec![StreamFrame::error("x")]);
    }

    #[tokio::test]
    async fn test_reader_eof_and_done_are_terminal() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"content\":\"a\"}\n".to_vec()),
            Ok(b"\ndata: [DO".to_vec()),
            Ok(b"NE]\n\n".to_vec()),
        ];
        let mut reader = FrameReader::new(stream::iter(chunks));
        assert_eq!(reader.read().await.unwrap(), Some(StreamFrame::text("a")));
        assert_eq!(reader.read().await.unwrap(), Some(StreamFrame::done()));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_surfaces_stream_error() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Err("reset".to_string())];
        let mut reader = FrameReader::new(stream::iter(chunks));
        assert!(matches!(reader.read().await, Err(TransportError::Read(_))));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_detects_closed_receiver() {
        let (mut writer, rx) = FrameWriter::channel(4);
        writer.text("hello").await.unwrap();
        drop(rx);
        assert!(matches!(writer.text("again").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_resolves_without_a_write() {
        let (writer, rx) = FrameWriter::channel(4);
        let closed = writer.closed();
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(1), closed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_is_noop_after_done() {
        let (mut writer, mut rx) = FrameWriter::channel(4);
        writer.done().await.unwrap();
        writer.text("ignored").await.unwrap();
        writer.done().await.unwrap();
        drop(writer);
        assert_eq!(rx.recv().await.as_deref(), Some(DONE_FRAME));
        assert_eq!(rx.recv().await, None);
    }
}
