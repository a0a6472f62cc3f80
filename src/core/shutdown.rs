//! 优雅关闭
//!
//! Web 服务收到 Ctrl+C / SIGTERM 后停止接收新请求；正在进行的流通过子 token 取消，
//! 取消后生产者会关闭后台轮询并写出结束帧。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 单个流的取消 token：服务关闭时一并取消，单独取消不影响其他流
    pub fn stream_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(reason = ?reason, "Shutting down");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_stream_tokens() {
        let manager = ShutdownManager::new();
        let a = manager.stream_token();
        let b = manager.stream_token();
        a.cancel();
        assert!(!b.is_cancelled());
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(b.is_cancelled());
        assert!(manager.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_resolves_after_signal() {
        let manager = Arc::new(ShutdownManager::new());
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_for_shutdown().await })
        };
        manager.shutdown(ShutdownReason::Signal);
        waiter.await.unwrap();
        assert!(manager.is_shutdown());
    }
}
