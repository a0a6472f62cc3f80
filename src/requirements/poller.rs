//! 后台任务轮询
//!
//! 固定间隔查询状态直到终态；瞬时错误按 `min(interval * 2^n, cap)` 退避，
//! 连续错误超过阈值或次数用尽即放弃。整个轮询只用一个定时器，每轮 `reset`。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RequirementsSection;
use crate::core::{PollError, RequirementError};
use crate::requirements::client::RequirementClient;
use crate::requirements::types::{FormattedResult, TaskStatus, TaskStatusReport};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub max_consecutive_errors: u32,
    pub backoff_cap: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 300,
            max_consecutive_errors: 5,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl From<&RequirementsSection> for PollerConfig {
    fn from(section: &RequirementsSection) -> Self {
        Self {
            interval: Duration::from_millis(section.poll_interval_ms),
            max_attempts: section.max_attempts,
            max_consecutive_errors: section.max_consecutive_errors,
            backoff_cap: Duration::from_millis(section.backoff_cap_ms),
        }
    }
}

impl PollerConfig {
    /// 第 n 次连续错误后的等待时间
    pub fn backoff(&self, consecutive_errors: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_errors.min(31));
        self.interval.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// 单次查询的结果
enum Step {
    Done(FormattedResult),
    Pending,
    Transient(RequirementError),
}

#[derive(Clone)]
pub struct JobPoller {
    client: Arc<dyn RequirementClient>,
    config: PollerConfig,
}

impl JobPoller {
    pub fn new(client: Arc<dyn RequirementClient>, config: PollerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// 轮询直到任务完成并取回整理后的结果；每次成功查询都回调 `on_progress`
    pub async fn poll<F>(
        &self,
        task_id: &str,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<FormattedResult, PollError>
    where
        F: FnMut(&TaskStatusReport) + Send,
    {
        let sleep = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(sleep);

        let mut attempts: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = &mut sleep => {}
            }

            if attempts >= self.config.max_attempts {
                tracing::warn!(task_id, attempts, "Polling attempts exhausted");
                return Err(PollError::PollingExhausted {
                    attempts,
                    consecutive_errors,
                });
            }
            attempts += 1;

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                step = self.step(task_id, &mut on_progress) => step?,
            };

            let delay = match step {
                Step::Done(result) => {
                    tracing::info!(task_id, attempts, documents = result.documents.len(), "Task completed");
                    return Ok(result);
                }
                Step::Pending => {
                    consecutive_errors = 0;
                    self.config.interval
                }
                Step::Transient(err) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.config.max_consecutive_errors {
                        tracing::error!(task_id, attempts, error = %err, "Too many consecutive polling errors");
                        return Err(PollError::PollingExhausted {
                            attempts,
                            consecutive_errors,
                        });
                    }
                    let delay = self.config.backoff(consecutive_errors);
                    tracing::warn!(
                        task_id,
                        consecutive_errors,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Polling error, backing off"
                    );
                    delay
                }
            };
            sleep.as_mut().reset(Instant::now() + delay);
        }
    }

    async fn step<F>(&self, task_id: &str, on_progress: &mut F) -> Result<Step, PollError>
    where
        F: FnMut(&TaskStatusReport) + Send,
    {
        let report = match self.client.status(task_id).await {
            Ok(report) => report,
            Err(e) if e.is_transient() => return Ok(Step::Transient(e)),
            Err(e) => return Err(PollError::Fatal(e)),
        };
        on_progress(&report);

        match report.status {
            TaskStatus::Completed => match self.client.formatted_result(task_id).await {
                Ok(result) => Ok(Step::Done(result)),
                Err(e) if e.is_transient() => Ok(Step::Transient(e)),
                Err(e) => Err(PollError::Fatal(e)),
            },
            TaskStatus::Failed => {
                let message = if report.message.is_empty() {
                    "Requirement generation failed".to_string()
                } else {
                    report.message
                };
                Err(PollError::UpstreamTaskFailure(message))
            }
            TaskStatus::Started | TaskStatus::Running => Ok(Step::Pending),
        }
    }
}
