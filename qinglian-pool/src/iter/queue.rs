use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::{
    common::{Id, Node},
    nodestate::{NodeStateMachine, StateMask},
};

use super::NodeSource;

/// 和加权选择器同一套契约，但按节点首次满足 include 掩码的顺序出队。
/// 信任节点（alwaysConnect）走这个通道。
pub struct QueueIterator {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    // 弱引用，原因同加权选择器：状态机拿着我们的订阅回调
    ns: Weak<NodeStateMachine>,
    require: StateMask,
    avoid: StateMask,
    selected: StateMask,
    notify: Notify,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    queue: VecDeque<Id>,
    queued: HashSet<Id>,
    closed: bool,
}

impl QueueIterator {
    pub fn new(
        ns: Arc<NodeStateMachine>,
        require: StateMask,
        avoid: StateMask,
        selected: StateMask,
    ) -> QueueIterator {
        let shared = Arc::new(QueueShared {
            ns: Arc::downgrade(&ns),
            require,
            avoid,
            selected,
            notify: Notify::new(),
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                closed: false,
            }),
        });

        let s = shared.clone();
        ns.subscribe_state(require | avoid, move |node, old, new| {
            s.on_state_change(node, old, new);
        });

        QueueIterator { shared }
    }
}

impl QueueShared {
    fn matches(&self, state: StateMask) -> bool {
        state & self.require == self.require && state & self.avoid == 0
    }

    fn on_state_change(&self, node: &Node, _old: StateMask, new: StateMask) {
        let new_match = self.matches(new);
        let mut inner = self.inner.lock().unwrap();

        if new_match {
            if inner.queued.insert(node.id) {
                inner.queue.push_back(node.id);
                drop(inner);
                self.notify.notify_waiters();
            }
        } else {
            // 节点退出候选集。selected 的清理交给过滤器在置 dialed 的
            // 同一次调用里完成，这里回清会打断 next_node 自己的认领
            if inner.queued.remove(&node.id) {
                inner.queue.retain(|id| id != &node.id);
            }
        }
    }

    async fn next_node(&self) -> Option<Node> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let picked = {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return None;
                }
                match inner.queue.pop_front() {
                    Some(id) => {
                        inner.queued.remove(&id);
                        Some(id)
                    }
                    None => None,
                }
            };

            match picked {
                Some(id) => {
                    let ns = match self.ns.upgrade() {
                        Some(ns) => ns,
                        None => return None,
                    };
                    let node = match ns.get_node(&id) {
                        Some(node) => node,
                        None => continue,
                    };
                    if ns.set_state(&node, self.selected, 0, Duration::ZERO).is_err() {
                        return None;
                    }
                    // 认领后核对，同加权选择器：出队和认领之间失去资格的
                    // 节点撤销认领换下一个
                    let state = ns.node_state(&id);
                    if state & self.require == self.require
                        && state & self.avoid == self.selected
                    {
                        return Some(node);
                    }
                    let _ = ns.set_state(&node, 0, self.selected, Duration::ZERO);
                }
                None => notified.await,
            }
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

impl NodeSource for QueueIterator {
    fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
        let shared = self.shared.clone();
        Box::pin(async move { shared.next_node().await })
    }

    fn close(&mut self) {
        self.shared.close();
    }
}
