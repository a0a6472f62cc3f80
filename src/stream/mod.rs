//! 流层：帧传输、带内控制信号、行缓冲解复用、服务端流生产者

pub mod demux;
pub mod frame;
pub mod producer;
pub mod signal;

pub use demux::{classify_signal, DemuxedLine, LineDemuxer};
pub use frame::{encode_frame, FrameDecoder, FrameKind, FrameReader, FrameWriter, StreamFrame, DONE_FRAME};
pub use producer::{ProducerError, ProducerRequest, ProducerSummary, StreamProducer};
pub use signal::{
    ControlSignal, DocumentDraft, DocumentsSignal, GenerationStartSignal, ProgressSignal,
    SignalKind, DOCUMENTS_SENTINEL, GENERATION_START_SENTINEL, PROGRESS_SENTINEL,
};
