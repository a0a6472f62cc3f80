//! 状态机适配层：对外暴露当前状态，并负责全局超时与失败自动恢复
//!
//! 状态通过 watch 通道投影给调用方（UI/CLI 只读）；所有变更都经过 `apply`。
//! 全局超时是单个可取消定时器：一轮开始时挂上，进入终态或 reset 时摘掉，
//! 不随消息数量续期。

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::GenerationSection;
use crate::core::{
    GenerationError, GenerationEvent, GenerationObserver, GenerationOutcome, GenerationPhase,
    GenerationState, LoggingObserver, TransitionError,
};

/// 超时与自动恢复参数
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub timeout: Duration,
    /// Failed 之后多久自动回到 Idle；None 表示保持 Failed 直到调用方 reset
    pub auto_reset: Option<Duration>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            auto_reset: None,
        }
    }
}

impl From<&GenerationSection> for MachineConfig {
    fn from(section: &GenerationSection) -> Self {
        Self {
            timeout: Duration::from_secs(section.timeout_secs),
            auto_reset: section.auto_reset_secs.map(Duration::from_secs),
        }
    }
}

/// 单个会话（一个聊天的当前生成）独占的状态机
pub struct GenerationMachine {
    state_tx: watch::Sender<GenerationState>,
    config: MachineConfig,
    watchdog: Mutex<Option<CancellationToken>>,
    observer: Arc<dyn GenerationObserver>,
}

impl GenerationMachine {
    pub fn new(config: MachineConfig, observer: Arc<dyn GenerationObserver>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(GenerationState::default());
        Arc::new(Self {
            state_tx,
            config,
            watchdog: Mutex::new(None),
            observer,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(MachineConfig::default(), Arc::new(LoggingObserver))
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> GenerationState {
        self.state_tx.borrow().clone()
    }

    pub fn phase(&self) -> GenerationPhase {
        self.state_tx.borrow().phase
    }

    /// 应用事件；被拒绝的事件只记录 debug 日志，状态不变
    pub fn apply(
        self: &Arc<Self>,
        event: GenerationEvent,
    ) -> Result<GenerationState, TransitionError> {
        let restarts_run = matches!(event, GenerationEvent::Started { .. });
        let opens_run = matches!(event, GenerationEvent::DocumentsReady { .. });
        let is_reset = matches!(event, GenerationEvent::Reset);
        let event_name = event.name();

        let mut previous_phase = GenerationPhase::Idle;
        // 新状态在写锁内取出，并发 apply 各自拿到自己的结果
        let mut outcome = None;
        self.state_tx.send_if_modified(|state| match state.apply(event) {
            Ok(next) => {
                previous_phase = state.phase;
                *state = next.clone();
                outcome = Some(Ok(next));
                true
            }
            Err(e) => {
                outcome = Some(Err(e));
                false
            }
        });

        let next = match outcome {
            Some(Ok(next)) => next,
            Some(Err(err)) => {
                tracing::debug!(event = event_name, error = %err, "Transition rejected");
                return Err(err);
            }
            None => return Ok(self.snapshot()),
        };
        if is_reset {
            self.disarm_watchdog();
        } else if restarts_run {
            self.disarm_watchdog();
            self.arm_watchdog();
        } else if opens_run && !self.watchdog_armed() {
            self.arm_watchdog();
        }

        if next.phase.is_terminal() && !previous_phase.is_terminal() {
            self.disarm_watchdog();
            if let Some(outcome) = GenerationOutcome::from_state(&next) {
                self.observer.on_outcome(&outcome);
            }
            if next.phase == GenerationPhase::Failed {
                self.schedule_auto_reset(next.run);
            }
        }
        Ok(next)
    }

    /// 调用方显式复位（例如离开页面）
    pub fn reset(self: &Arc<Self>) {
        let _ = self.apply(GenerationEvent::Reset);
    }

    pub fn fail(self: &Arc<Self>, message: impl Into<String>) {
        let _ = self.apply(GenerationEvent::Fail(message.into()));
    }

    fn watchdog_armed(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn arm_watchdog(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut slot = self.watchdog.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = slot.replace(token.clone()) {
                old.cancel();
            }
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(machine) = weak.upgrade() {
                        tracing::warn!(timeout_secs = timeout.as_secs(), "Generation watchdog fired");
                        machine.fail(GenerationError::Timeout(timeout.as_secs()).to_string());
                    }
                }
            }
        });
    }

    fn disarm_watchdog(&self) {
        let mut slot = self.watchdog.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = slot.take() {
            token.cancel();
        }
    }

    fn schedule_auto_reset(self: &Arc<Self>, run: u64) {
        let Some(delay) = self.config.auto_reset else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(machine) = weak.upgrade() {
                let current = machine.snapshot();
                // 期间若已开始新一轮则不动
                if current.run == run && current.phase == GenerationPhase::Failed {
                    tracing::info!("Auto-recovering from failed generation");
                    machine.reset();
                }
            }
        });
    }
}

impl Drop for GenerationMachine {
    fn drop(&mut self) {
        self.disarm_watchdog();
    }
}
