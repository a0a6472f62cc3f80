//! 核心层：错误、生成状态机、状态投影与超时、文档创建编排、关闭信号

pub mod error;
pub mod machine;
pub mod observer;
pub mod orchestrator;
pub mod shutdown;
pub mod state;

pub use error::{
    DocumentError, GenerationError, LlmError, PollError, RequirementError, SignalParseError,
    TransitionError, TransportError,
};
pub use machine::{GenerationMachine, MachineConfig};
pub use observer::{GenerationObserver, GenerationOutcome, LoggingObserver, RecordingObserver};
pub use orchestrator::{CreationOrchestrator, CreationReport};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{
    DocumentProgressItem, GenerationEvent, GenerationPhase, GenerationState, ItemStatus,
    ANALYSIS_STEPS,
};
