mod filter;
mod mixer;
mod queue;
mod wrs;

pub use filter::FilterIter;
pub use mixer::FairMix;
pub use queue::QueueIterator;
pub use wrs::{WeightFn, WrsIterator};

use futures::future::BoxFuture;

use crate::common::Node;

/// 拨号候选节点的惰性序列。`next` 在没有候选时挂起，
/// 迭代器被关闭后返回 None（哨兵值，不是错误）。
pub trait NodeSource: Send + 'static {
    fn next(&mut self) -> BoxFuture<'_, Option<Node>>;

    /// 关闭迭代器，让挂起的 next 尽快返回 None。幂等。
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use qinglian_core::{common::clock::SimulatedClock, kv::MemoryStore};

    use crate::{
        common::{Id, ID_SIZE},
        nodestate::{FlagDef, NodeStateMachine},
    };

    use super::*;

    fn test_node(b: u8) -> Node {
        let id = Id::from_bytes(&[b; ID_SIZE]).unwrap();
        Node::new(id, format!("127.0.0.1:{}", 30000 + b as u16).parse().unwrap())
    }

    fn new_machine() -> Arc<NodeStateMachine> {
        NodeStateMachine::new(
            Arc::new(MemoryStore::new()),
            b"-ns",
            Arc::new(SimulatedClock::new()),
        )
    }

    /// 先吐完给定节点，然后一直挂起（模拟活着但暂时没有产出的发现源）
    struct VecSource {
        nodes: VecDeque<Node>,
    }

    impl VecSource {
        fn new(nodes: Vec<Node>) -> VecSource {
            VecSource {
                nodes: nodes.into(),
            }
        }
    }

    impl NodeSource for VecSource {
        fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
            let node = self.nodes.pop_front();
            Box::pin(async move {
                match node {
                    Some(node) => Some(node),
                    None => futures::future::pending::<Option<Node>>().await,
                }
            })
        }

        fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_queue_order() {
        let ns = new_machine();
        let trusted = ns.state_mask(&FlagDef::new("trusted")).unwrap();
        let selected = ns.state_mask(&FlagDef::new("selected")).unwrap();

        let mut queue = QueueIterator::new(ns.clone(), trusted, selected, selected);
        ns.start().unwrap();

        for b in [1, 2, 3] {
            ns.set_state(&test_node(b), trusted, 0, Duration::ZERO).unwrap();
        }

        for b in [1, 2, 3] {
            let got = queue.next().await.unwrap();
            assert_eq!(got.id, test_node(b).id);
            assert_ne!(ns.node_state(&got.id) & selected, 0);
        }

        // selected 清掉后重新排队
        ns.set_state(&test_node(2), 0, selected, Duration::ZERO).unwrap();
        let got = queue.next().await.unwrap();
        assert_eq!(got.id, test_node(2).id);

        queue.close();
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_wrs_skips_zero_weight() {
        let ns = new_machine();
        let has_value = ns.state_mask(&FlagDef::new("hasValue")).unwrap();
        let selected = ns.state_mask(&FlagDef::new("selected")).unwrap();

        // 节点 1 权重 0，节点 2 权重 5
        let weight_fn: WeightFn = Arc::new(|id: &Id| if id.as_bytes()[0] == 2 { 5 } else { 0 });
        let mut wrs = WrsIterator::new(ns.clone(), has_value, selected, selected, weight_fn);
        ns.start().unwrap();

        ns.set_state(&test_node(1), has_value, 0, Duration::ZERO).unwrap();
        ns.set_state(&test_node(2), has_value, 0, Duration::ZERO).unwrap();

        let got = wrs.next().await.unwrap();
        assert_eq!(got.id, test_node(2).id);
        assert_ne!(ns.node_state(&got.id) & selected, 0);

        // 权重为 0 的节点永远不会被吐出来
        let pending = tokio::time::timeout(Duration::from_millis(50), wrs.next()).await;
        assert!(pending.is_err());

        // selected 清掉后节点 2 重新可选
        ns.set_state(&test_node(2), 0, selected, Duration::ZERO).unwrap();
        let got = wrs.next().await.unwrap();
        assert_eq!(got.id, test_node(2).id);

        wrs.close();
        assert!(wrs.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mixer_yields_all_sources() {
        // 测试模式：饥饿超时为零，退化为谁有就取谁
        let mut mixer = FairMix::new(Duration::ZERO);
        mixer.add_source(Box::new(VecSource::new(vec![test_node(1), test_node(2)])));
        mixer.add_source(Box::new(VecSource::new(vec![test_node(3), test_node(4)])));

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(mixer.next().await.unwrap().id.as_bytes()[0]);
        }
        got.sort_unstable();
        assert_eq!(got, vec![1, 2, 3, 4]);

        mixer.close();
        assert!(mixer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mixer_removes_finished_source() {
        struct Finite(VecDeque<Node>);
        impl NodeSource for Finite {
            fn next(&mut self) -> BoxFuture<'_, Option<Node>> {
                let node = self.0.pop_front();
                Box::pin(async move { node })
            }
            fn close(&mut self) {}
        }

        let mut mixer = FairMix::new(Duration::ZERO);
        mixer.add_source(Box::new(Finite(vec![test_node(1)].into())));
        mixer.add_source(Box::new(VecSource::new(vec![test_node(2), test_node(3)])));

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(mixer.next().await.unwrap().id.as_bytes()[0]);
        }
        got.sort_unstable();
        assert_eq!(got, vec![1, 2, 3]);
        mixer.close();
    }

    #[tokio::test]
    async fn test_filter_side_effect() {
        let source = VecSource::new(vec![test_node(1), test_node(2), test_node(3), test_node(4)]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_c = seen.clone();
        let mut filter = FilterIter::new(Box::new(source), move |node: &Node| {
            seen_c.lock().unwrap().push(node.id.as_bytes()[0]);
            node.id.as_bytes()[0] % 2 == 0
        });

        assert_eq!(filter.next().await.unwrap().id, test_node(2).id);
        assert_eq!(filter.next().await.unwrap().id, test_node(4).id);
        // 谓词对每个经过的节点都执行过
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }
}
