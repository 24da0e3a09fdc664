use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::common::Node;

use super::NodeSource;

/// Fair round-robin composition of several node sources.
///
/// 每轮按顺序问下一个 source，每个 source 给一个"耐心"窗口；
/// 窗口内没产出就看下一个，耐心减半。一整轮都饿着时改为同时等
/// 所有 source，谁先产出取谁。产出成功后该 source 的耐心恢复初始值。
/// 耐心为零（测试模式）时退化为"谁有就取谁"。
pub struct FairMix {
    sources: Vec<MixSource>,
    initial_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    last: usize,
}

struct MixSource {
    rx: mpsc::Receiver<Node>,
    timeout: Duration,
}

impl FairMix {
    pub fn new(starvation_timeout: Duration) -> FairMix {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        FairMix {
            sources: Vec::new(),
            initial_timeout: starvation_timeout,
            shutdown_tx,
            shutdown_rx,
            last: 0,
        }
    }

    /// 挂一个 source 并立即开始消费它：每个 source 一个生产任务，
    /// 产出的节点放进容量为 1 的槽位等混流器来取
    pub fn add_source(&mut self, mut source: Box<dyn NodeSource>) {
        if *self.shutdown_rx.borrow() {
            source.close();
            return;
        }
        let (tx, rx) = mpsc::channel(1);
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                let node = tokio::select! {
                    n = source.next() => match n {
                        Some(n) => n,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };

                tokio::select! {
                    r = tx.send(node) => {
                        if r.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            source.close();
        });

        self.sources.push(MixSource {
            rx,
            timeout: self.initial_timeout,
        });
    }

    async fn next_node(&mut self) -> Option<Node> {
        'restart: loop {
            if *self.shutdown_rx.borrow() || self.sources.is_empty() {
                return None;
            }

            // 轮转：每个 source 一个耐心窗口
            let n = self.sources.len();
            for k in 0..n {
                let i = (self.last + 1 + k) % n;
                let patience = self.sources[i].timeout;
                let result = tokio::time::timeout(patience, self.sources[i].rx.recv()).await;

                match result {
                    Ok(Some(node)) => {
                        self.sources[i].timeout = self.initial_timeout;
                        self.last = i;
                        return Some(node);
                    }
                    Ok(None) => {
                        // 断流的 source 摘掉，下标变了，整轮重来
                        self.sources.remove(i);
                        if self.last >= self.sources.len() {
                            self.last = 0;
                        }
                        continue 'restart;
                    }
                    Err(_) => {
                        self.sources[i].timeout /= 2;
                    }
                }
            }

            // 一整轮都饿着：同时等所有 source，谁先有拿谁的
            let recvs: Vec<_> = self
                .sources
                .iter_mut()
                .map(|s| Box::pin(s.rx.recv()))
                .collect();
            let (result, idx, _) = futures::future::select_all(recvs).await;
            match result {
                Some(node) => {
                    self.sources[idx].timeout = self.initial_timeout;
                    self.last = idx;
                    return Some(node);
                }
                None => {
                    self.sources.remove(idx);
                    if self.last >= self.sources.len() {
                        self.last = 0;
                    }
                }
            }
        }
    }
}

impl NodeSource for FairMix {
    fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
        Box::pin(self.next_node())
    }

    fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
