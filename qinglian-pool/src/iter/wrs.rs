use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Notify;

use crate::{
    common::{Id, Node},
    nodestate::{NodeStateMachine, StateMask},
};

use super::NodeSource;

/// 按需计算的节点选择权重
pub type WeightFn = Arc<dyn Fn(&Id) -> u64 + Send + Sync>;

/// Weighted random selector over the state machine's tracked nodes.
///
/// A candidate matches `require`, avoids `avoid` and has positive weight.
/// Emitting a node sets its `selected` flag, which is part of `avoid`, so
/// a node is returned at most once until something clears the flag again.
/// The selector never polls: it is driven by state subscriptions on one
/// side and by the consumer's pull rate on the other.
pub struct WrsIterator {
    shared: Arc<WrsShared>,
}

struct WrsShared {
    // 弱引用：状态机持有本迭代器的订阅回调，回指必须打破环
    ns: Weak<NodeStateMachine>,
    require: StateMask,
    avoid: StateMask,
    selected: StateMask,
    weight_fn: WeightFn,
    notify: Notify,
    inner: Mutex<WrsInner>,
}

struct WrsInner {
    // 候选池：线性表加索引，池子以已知节点集为上界，采样用线性扫描足够
    items: Vec<(Id, u64)>,
    index: HashMap<Id, usize>,
    total: u64,
    closed: bool,
}

impl WrsIterator {
    pub fn new(
        ns: Arc<NodeStateMachine>,
        require: StateMask,
        avoid: StateMask,
        selected: StateMask,
        weight_fn: WeightFn,
    ) -> WrsIterator {
        let shared = Arc::new(WrsShared {
            ns: Arc::downgrade(&ns),
            require,
            avoid,
            selected,
            weight_fn,
            notify: Notify::new(),
            inner: Mutex::new(WrsInner {
                items: Vec::new(),
                index: HashMap::new(),
                total: 0,
                closed: false,
            }),
        });

        let s = shared.clone();
        ns.subscribe_state(require | avoid, move |node, old, new| {
            s.on_state_change(node, old, new);
        });

        WrsIterator { shared }
    }
}

impl WrsShared {
    fn matches(&self, state: StateMask) -> bool {
        state & self.require == self.require && state & self.avoid == 0
    }

    fn on_state_change(&self, node: &Node, old: StateMask, new: StateMask) {
        let old_match = self.matches(old);
        let new_match = self.matches(new);

        if new_match {
            // 进入（或留在）候选集：重新拉取权重
            let weight = (self.weight_fn)(&node.id);
            let mut inner = self.inner.lock().unwrap();
            if weight > 0 {
                inner.update(node.id, weight);
                drop(inner);
                self.notify.notify_waiters();
            } else {
                inner.remove(&node.id);
            }
        } else if old_match {
            // 节点退出候选集。selected 不在这里摘：这个分支也会被
            // next_node 自己的认领触发，同步回清会让认领立刻失效；
            // 过滤器置 dialed 时会在同一次调用里原子地清掉 selected
            self.inner.lock().unwrap().remove(&node.id);
        }
    }

    async fn next_node(&self) -> Option<Node> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let picked = {
                let inner = self.inner.lock().unwrap();
                if inner.closed {
                    return None;
                }
                inner.sample()
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
                    // 认领后核对：除了我们刚置的 selected，节点必须仍是
                    // 合格候选。采样和认领之间失去资格的，撤销认领换一个
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

impl WrsInner {
    fn update(&mut self, id: Id, weight: u64) {
        match self.index.get(&id) {
            Some(&pos) => {
                self.total = self.total - self.items[pos].1 + weight;
                self.items[pos].1 = weight;
            }
            None => {
                self.index.insert(id, self.items.len());
                self.items.push((id, weight));
                self.total += weight;
            }
        }
    }

    fn remove(&mut self, id: &Id) {
        if let Some(pos) = self.index.remove(id) {
            self.total -= self.items[pos].1;
            let last = self.items.len() - 1;
            self.items.swap(pos, last);
            self.items.pop();
            if pos < self.items.len() {
                self.index.insert(self.items[pos].0, pos);
            }
        }
    }

    fn sample(&self) -> Option<Id> {
        if self.total == 0 {
            return None;
        }
        let mut r = rand::thread_rng().gen_range(0..self.total);
        for (id, weight) in &self.items {
            if r < *weight {
                return Some(*id);
            }
            r -= weight;
        }

        None
    }
}

impl NodeSource for WrsIterator {
    fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
        let shared = self.shared.clone();
        Box::pin(async move { shared.next_node().await })
    }

    fn close(&mut self) {
        self.shared.close();
    }
}
