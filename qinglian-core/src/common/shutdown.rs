use std::future::Future;

use log::{error, trace, warn};
use tokio::sync::{mpsc, watch};

/// 包含了用于在异步任务中，等待 "关闭信号" 的方法
#[derive(Clone, Debug)]
pub struct ShutdownReceiver {
    /// 关闭信号接收端
    shutdown_rx: watch::Receiver<bool>,
    /// 确认关闭发送端
    /// ShutdownReceiver drop 时，该通道接收端自动关闭。
    _shutdown_confirm_tx: mpsc::Sender<bool>,
}

impl ShutdownReceiver {
    /// 等待 ShutdownSender 发出的关闭信号
    pub async fn watch(mut self) {
        if let Err(e) = self.shutdown_rx.changed().await {
            error!("Error watching shutdown_rx : {:?}", e);
        }
    }

    /// 非阻塞检查是否已经收到关闭信号
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// 包含了将"关闭信号"，发送给异步任务的方法
pub struct ShutdownSender {
    shutdown_tx: watch::Sender<bool>,
    shutdown_confirm_rx: mpsc::Receiver<bool>,
}

impl ShutdownSender {
    /// 发送关闭信号给所有在等待 [ShutdownReceiver] 的异步任务，
    /// 并等待那些异步任务全部退出（ShutdownReceiver 全部被 drop）
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.shutdown_tx.send(true) {
            warn!("Failed to send shutdown signal: {:?}", e);
        }

        let _ = self.shutdown_confirm_rx.recv().await;
    }
}

/// 生成可优雅关闭的异步任务：任务在 future 完成或收到关闭信号时退出
pub fn spawn_with_shutdown<T>(
    shutdown: ShutdownReceiver,
    future: T,
    task_name: impl std::fmt::Display + Send + Sync + 'static,
) where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    tokio::spawn(async move {
        trace!("Task '{}' starting up", task_name);
        tokio::select! {
            _ = shutdown.watch() => (),
            _ = future => (),
        }
    });
}

/// 创建一对关联的 ShutdownSender 和 ShutdownReceiver 。
///
/// 在异步任务中应当使用 ShutdownReceiver 克隆体
pub fn create_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 使用该通道来确认所有异步任务都关闭了
    let (shutdown_confirm_tx, shutdown_confirm_rx) = mpsc::channel::<bool>(1);

    (
        ShutdownSender {
            shutdown_tx,
            shutdown_confirm_rx,
        },
        ShutdownReceiver {
            shutdown_rx,
            _shutdown_confirm_tx: shutdown_confirm_tx,
        },
    )
}
