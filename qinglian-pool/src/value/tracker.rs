use std::{collections::HashMap, sync::{Arc, Mutex}, time::Duration};

use qinglian_core::common::{
    clock::Clock,
    expiry::{ExpirationFactor, Expirer},
};

use crate::common::Id;

use super::rt_stats::ResponseTimeStats;

/// Tracks the service value of individual servers: a global response time
/// distribution plus one per known node. Entries survive disconnection so
/// that redial decisions can still price a node after the session ended.
pub struct ValueTracker {
    clock: Arc<dyn Clock>,
    stats_expirer: Expirer,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    global: ResponseTimeStats,
    nodes: HashMap<Id, Arc<NodeValueTracker>>,
}

pub struct NodeValueTracker {
    inner: Mutex<NodeVtInner>,
}

struct NodeVtInner {
    rt_stats: ResponseTimeStats,
    connected: bool,
}

impl NodeValueTracker {
    fn new() -> Arc<NodeValueTracker> {
        Arc::new(NodeValueTracker {
            inner: Mutex::new(NodeVtInner {
                rt_stats: ResponseTimeStats::default(),
                connected: false,
            }),
        })
    }

    /// 该节点响应时间分布的快照
    pub fn rt_stats(&self) -> ResponseTimeStats {
        self.inner.lock().unwrap().rt_stats
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }
}

impl ValueTracker {
    /// half_life 是统计量的半衰期，老样本按指数折价
    pub fn new(clock: Arc<dyn Clock>, half_life: Duration) -> ValueTracker {
        ValueTracker {
            clock,
            stats_expirer: Expirer::new(half_life),
            inner: Mutex::new(TrackerInner {
                global: ResponseTimeStats::default(),
                nodes: HashMap::new(),
            }),
        }
    }

    /// 连接建立时登记节点，已有统计的节点继续累计
    pub fn register(&self, id: &Id) -> Arc<NodeValueTracker> {
        let mut inner = self.inner.lock().unwrap();
        let nvt = inner
            .nodes
            .entry(*id)
            .or_insert_with(NodeValueTracker::new)
            .clone();
        nvt.inner.lock().unwrap().connected = true;

        nvt
    }

    /// 断开时登记；统计保留，后续权重计算还要用
    pub fn unregister(&self, id: &Id) {
        let inner = self.inner.lock().unwrap();
        if let Some(nvt) = inner.nodes.get(id) {
            nvt.inner.lock().unwrap().connected = false;
        }
    }

    pub fn get_node(&self, id: &Id) -> Option<Arc<NodeValueTracker>> {
        self.inner.lock().unwrap().nodes.get(id).cloned()
    }

    /// 全局响应时间分布的快照
    pub fn rt_stats(&self) -> ResponseTimeStats {
        self.inner.lock().unwrap().global
    }

    pub fn stats_expirer(&self) -> Expirer {
        self.stats_expirer
    }

    /// 当前时刻的衰减因子
    pub fn stats_exp_factor(&self) -> ExpirationFactor {
        ExpirationFactor::from_log_offset(self.stats_expirer.log_offset(self.clock.now()))
    }

    /// 外围客户端上报一次请求的响应时间
    pub fn add_sample(&self, id: &Id, resp_time: Duration) {
        let exp_factor = self.stats_exp_factor();
        let mut inner = self.inner.lock().unwrap();
        inner.global.add(resp_time, 1.0, exp_factor);
        if let Some(nvt) = inner.nodes.get(id) {
            nvt.inner.lock().unwrap().rt_stats.add(resp_time, 1.0, exp_factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use qinglian_core::common::clock::SimulatedClock;

    use crate::value::timeout_weights;

    use super::*;

    #[test]
    fn test_register_and_sample() {
        let clock = Arc::new(SimulatedClock::new());
        let vt = ValueTracker::new(clock, Duration::from_secs(3600));
        let id = Id::from_bytes(&[1u8; 32]).unwrap();

        assert!(vt.get_node(&id).is_none());

        let nvt = vt.register(&id);
        assert!(nvt.is_connected());
        vt.add_sample(&id, Duration::from_millis(30));

        let weights = timeout_weights(Duration::from_secs(1));
        let ef = vt.stats_exp_factor();
        assert!(nvt.rt_stats().value(&weights, ef) > 0.0);
        assert!(vt.rt_stats().value(&weights, ef) > 0.0);

        // 断开后统计保留
        vt.unregister(&id);
        let nvt = vt.get_node(&id).unwrap();
        assert!(!nvt.is_connected());
        assert!(!nvt.rt_stats().is_empty());
    }

    #[test]
    fn test_sample_for_unknown_node_counts_globally() {
        let clock = Arc::new(SimulatedClock::new());
        let vt = ValueTracker::new(clock, Duration::from_secs(3600));
        let id = Id::from_bytes(&[2u8; 32]).unwrap();

        vt.add_sample(&id, Duration::from_millis(30));
        assert!(vt.get_node(&id).is_none());
        assert!(!vt.rt_stats().is_empty());
    }
}
