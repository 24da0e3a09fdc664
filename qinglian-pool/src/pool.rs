use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use bytes::BytesMut;
use qinglian_core::{
    common::{
        clock::{AbsTime, Clock},
        error::Result,
        expiry::ExpiredValue,
        shutdown::{create_shutdown, spawn_with_shutdown, ShutdownSender},
    },
    data::codec::{get_uvarint, put_uvarint},
    kv::KvStore,
};
use tokio::{sync::watch, time::sleep};

use crate::{
    common::{parse_node_url, Node},
    iter::{FairMix, FilterIter, NodeSource, QueueIterator, WeightFn, WrsIterator},
    nodestate::{FieldDef, FlagDef, NodeStateMachine, StateMask},
    value::{timeout_weights, ResponseTimeStats, ResponseTimeWeights, ValueTracker},
};

/// 服务池建议的最小软超时
const MIN_TIMEOUT: Duration = Duration::from_millis(500);
/// 软超时的重算间隔
const TIMEOUT_REFRESH: Duration = Duration::from_secs(5);
/// 超时漂移超过该阈值时重算节点价值
const TIMEOUT_CHANGE_THRESHOLD: Duration = Duration::from_millis(10);
/// 一次 TCP 拨号的成本（已知节点权重计算用）
const DIAL_COST: u64 = 10000;
/// 节点权重计算的乘数常量
const NODE_WEIGHT_MUL: u64 = 1_000_000;
/// 留在"有价值"集合里所需的最小权重
const NODE_WEIGHT_THRESHOLD: u64 = 100;
const REDIAL_WAIT_STEP: f64 = 2.0;
const MIN_REDIAL_WAIT: Duration = Duration::from_secs(10);
/// dialed 标志的自动清除时限
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MIXER_STARVATION_TIMEOUT: Duration = Duration::from_secs(1);
const CLOCK_PERSIST_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// nodeHistory 字段：拨号成本累计和重拨退避。
/// 只有 dial_cost、wait_factor、wait_until 落盘，其余按需重算。
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeHistory {
    dial_cost: ExpiredValue,
    wait_factor: f64,
    wait_until: AbsTime,
    total_value: f64,
    last_timeout: Duration,
}

impl NodeHistory {
    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, self.dial_cost.base);
        put_uvarint(&mut buf, self.dial_cost.exp);
        put_uvarint(&mut buf, (self.wait_factor * 256.0) as u64);
        put_uvarint(&mut buf, self.wait_until.as_nanos() as u64);
        buf.to_vec()
    }

    fn decode(mut data: &[u8]) -> Result<NodeHistory> {
        let base = get_uvarint(&mut data)?;
        let exp = get_uvarint(&mut data)?;
        let wait_factor = get_uvarint(&mut data)? as f64 / 256.0;
        let wait_until = AbsTime::from_nanos(get_uvarint(&mut data)? as i64);

        Ok(NodeHistory {
            dial_cost: ExpiredValue { base, exp },
            wait_factor,
            wait_until,
            total_value: 0.0,
            last_timeout: Duration::ZERO,
        })
    }

    pub fn wait_factor(&self) -> f64 {
        self.wait_factor
    }

    pub fn wait_until(&self) -> AbsTime {
        self.wait_until
    }
}

fn node_history_field() -> FieldDef {
    FieldDef::persistent::<NodeHistory, _, _>("nodeHistory", |n| Ok(n.encode()), NodeHistory::decode)
}

struct TimeoutInfo {
    timeout: Duration,
    weights: ResponseTimeWeights,
    refreshed: Option<AbsTime>,
}

/// Provides a node iterator for dial candidates: a fair mix of newly
/// discovered nodes, a weighted random selection of known-valuable nodes
/// and trusted always-connect nodes.
///
/// 权重正比于 历史服务价值 / 衰减后的拨号成本；一次失败或结束的会话
/// 会把节点放进 redialWait 退避，近期表现比历史差得越多退避越长。
pub struct ServerPool {
    clock: Arc<dyn Clock>,
    clock_offset: Mutex<i64>,
    db: Arc<dyn KvStore>,
    db_clock_key: Vec<u8>,
    ns: Arc<NodeStateMachine>,
    vt: Arc<ValueTracker>,
    weak: Weak<ServerPool>,

    st_has_value: StateMask,
    st_selected: StateMask,
    st_dialed: StateMask,
    st_connected: StateMask,
    st_redial_wait: StateMask,
    st_always_connect: StateMask,
    node_history_field: usize,
    conn_stats_field: usize,

    trusted: Vec<Node>,
    mixer_timeout: Duration,

    // start 之前暂存的各个 source，启动时一次性挂进 mixer
    known_selector: Mutex<Option<Box<dyn NodeSource>>>,
    always_connect: Mutex<Option<Box<dyn NodeSource>>>,
    discovery: Mutex<Option<Box<dyn NodeSource>>>,
    dial_iter: Mutex<Option<FilterIter>>,

    timeout_info: Mutex<TimeoutInfo>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    shutdown: Mutex<Option<ShutdownSender>>,
}

impl ServerPool {
    /// 状态机负责节点簿记，value tracker 负责服务价值统计，两者由调用方
    /// 创建并先行 start（状态机）。testing 模式下 mixer 的饥饿超时为零。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn KvStore>,
        db_key_prefix: &[u8],
        ns: Arc<NodeStateMachine>,
        vt: Arc<ValueTracker>,
        discovery: Option<Box<dyn NodeSource>>,
        clock: Arc<dyn Clock>,
        trusted_urls: &[String],
        testing: bool,
    ) -> Result<Arc<ServerPool>> {
        let st_has_value = ns.state_mask(&FlagDef::persistent("hasValue"))?;
        let st_selected = ns.state_mask(&FlagDef::new("selected"))?;
        let st_dialed = ns.state_mask(&FlagDef::new("dialed"))?;
        let st_connected = ns.state_mask(&FlagDef::new("connected"))?;
        let st_redial_wait = ns.state_mask(&FlagDef::new("redialWait"))?;
        let st_always_connect = ns.state_mask(&FlagDef::new("alwaysConnect"))?;
        let disable_mask = st_selected | st_dialed | st_connected | st_redial_wait;

        let node_history_field = ns.field_index(&node_history_field())?;
        let conn_stats_field =
            ns.field_index(&FieldDef::new::<ResponseTimeStats>("connectedStats"))?;

        let mut trusted = Vec::new();
        for url in trusted_urls {
            match parse_node_url(url) {
                Ok(node) => trusted.push(node),
                Err(e) => {
                    log::error!(target: "qinglian_pool::pool::new", "Invalid trusted server url {:?}: {:?}", url, e);
                }
            }
        }

        let mut db_clock_key = db_key_prefix.to_vec();
        db_clock_key.extend_from_slice(b"persistentClock");

        let (quit_tx, quit_rx) = watch::channel(false);

        let pool = Arc::new_cyclic(|weak| ServerPool {
            clock,
            clock_offset: Mutex::new(0),
            db,
            db_clock_key,
            ns: ns.clone(),
            vt,
            weak: weak.clone(),
            st_has_value,
            st_selected,
            st_dialed,
            st_connected,
            st_redial_wait,
            st_always_connect,
            node_history_field,
            conn_stats_field,
            trusted,
            mixer_timeout: if testing {
                Duration::ZERO
            } else {
                MIXER_STARVATION_TIMEOUT
            },
            known_selector: Mutex::new(None),
            always_connect: Mutex::new(None),
            discovery: Mutex::new(discovery),
            dial_iter: Mutex::new(None),
            timeout_info: Mutex::new(TimeoutInfo {
                timeout: Duration::ZERO,
                weights: [0.0; crate::value::TIME_STAT_LENGTH],
                refreshed: None,
            }),
            quit_tx,
            quit_rx,
            shutdown: Mutex::new(None),
        });

        // 有价值节点走加权随机选择，权重回调按需计算
        let weight_weak = pool.weak.clone();
        let weight_fn: WeightFn = Arc::new(move |id| match weight_weak.upgrade() {
            Some(pool) => pool.known_select_weight(id),
            None => 0,
        });
        let known = WrsIterator::new(
            ns.clone(),
            st_has_value,
            disable_mask,
            st_selected,
            weight_fn,
        );
        *pool.known_selector.lock().unwrap() = Some(Box::new(known));

        // 信任节点按登记顺序轮询
        let always = QueueIterator::new(ns.clone(), st_always_connect, disable_mask, st_selected);
        *pool.always_connect.lock().unwrap() = Some(Box::new(always));

        // dialed 超时落空（10s 内没有 register_peer）→ 进入 redialWait
        let weak = pool.weak.clone();
        ns.subscribe_state(st_dialed | st_connected, move |node, old, new| {
            if old == st_dialed && new == 0 {
                if let Some(pool) = weak.upgrade() {
                    pool.on_dial_timeout(node);
                }
            }
        });

        pool.get_timeout();

        Ok(pool)
    }

    /// 启动服务池。状态机必须已经 start。
    pub fn start(&self) {
        // mixer 一启动就会去读 source，所以 source 在这里统一挂载
        let mut mixer = FairMix::new(self.mixer_timeout);
        if let Some(source) = self.known_selector.lock().unwrap().take() {
            mixer.add_source(source);
        }
        if let Some(source) = self.always_connect.lock().unwrap().take() {
            mixer.add_source(source);
        }
        if let Some(source) = self.discovery.lock().unwrap().take() {
            mixer.add_source(source);
        }

        // 节点流出迭代器的瞬间标记 dialed（带 10s 超时），同时摘掉 selected
        let ns = self.ns.clone();
        let st_dialed = self.st_dialed;
        let st_selected = self.st_selected;
        let filter = FilterIter::new(Box::new(mixer), move |node| {
            ns.set_state(node, st_dialed, st_selected, DIAL_TIMEOUT).is_ok()
        });
        *self.dial_iter.lock().unwrap() = Some(filter);

        for node in &self.trusted {
            if let Err(e) = self.ns.set_state(node, self.st_always_connect, 0, Duration::ZERO) {
                log::error!(target: "qinglian_pool::pool::start", "Marking trusted node {} failed: {:?}", node.id, e);
            }
        }

        // 持久化的绝对时间基于上次运行的时钟，换算出本次运行的偏移
        let clock_start = match self.db.get(&self.db_clock_key) {
            Ok(Some(enc)) if enc.len() == 8 => {
                i64::from_be_bytes(enc.try_into().unwrap_or([0; 8]))
            }
            Ok(_) => 0,
            Err(e) => {
                log::error!(target: "qinglian_pool::pool::start", "Loading persistent clock failed: {:?}", e);
                0
            }
        };
        *self.clock_offset.lock().unwrap() = clock_start - self.clock.now().as_nanos();

        // 上次运行没耗完的 redialWait 接着等
        self.ns.for_each(self.st_has_value, 0, |node, _| {
            if let Some(n) = self
                .ns
                .get_field_as::<NodeHistory>(&node.id, self.node_history_field)
            {
                if n.wait_until.as_nanos() > clock_start {
                    let remain = Duration::from_nanos((n.wait_until.as_nanos() - clock_start) as u64);
                    if let Err(e) = self.ns.set_state(node, self.st_redial_wait, 0, remain) {
                        log::error!(target: "qinglian_pool::pool::start", "Restoring redial wait of {} failed: {:?}", node.id, e);
                    }
                }
            }
        });

        let (sender, receiver) = create_shutdown();
        *self.shutdown.lock().unwrap() = Some(sender);
        let weak = self.weak.clone();
        spawn_with_shutdown(
            receiver,
            async move {
                loop {
                    sleep(CLOCK_PERSIST_INTERVAL).await;
                    match weak.upgrade() {
                        Some(pool) => pool.persist_clock(),
                        None => break,
                    }
                }
            },
            "server_pool::persist_clock",
        );
    }

    /// 停止服务池：关闭拨号迭代器，给仍在连接的节点结算价值，
    /// 等后台任务退出后把时钟落盘。之后由调用方 stop 状态机。
    pub async fn stop(&self) {
        let _ = self.quit_tx.send(true);
        if let Some(mut iter) = self.dial_iter.lock().unwrap().take() {
            iter.close();
        }

        self.ns.for_each(self.st_connected, 0, |node, _| {
            let (weight, _) = self.calculate_node(node, false, false);
            if weight >= NODE_WEIGHT_THRESHOLD {
                let _ = self.ns.set_state(node, self.st_has_value, 0, Duration::ZERO);
                if let Err(e) = self.ns.persist(&node.id) {
                    log::error!(target: "qinglian_pool::pool::stop", "Persisting {} failed: {:?}", node.id, e);
                }
            }
        });

        let sender = self.shutdown.lock().unwrap().take();
        if let Some(mut sender) = sender {
            sender.shutdown().await;
        }
        self.persist_clock();
    }

    /// Pulls the next dial candidate. Blocks while every known node is
    /// backing off (that is not an error) and returns None once the pool
    /// has been stopped. Single consumer.
    pub async fn next_candidate(&self) -> Option<Node> {
        let iter = self.dial_iter.lock().unwrap().take()?;

        // 等待被取消（比如外面包了 timeout）时把迭代器放回去，
        // 拨号流不因一次取消而断掉
        struct PutBack<'a> {
            pool: &'a ServerPool,
            iter: Option<FilterIter>,
        }
        impl Drop for PutBack<'_> {
            fn drop(&mut self) {
                if let Some(iter) = self.iter.take() {
                    *self.pool.dial_iter.lock().unwrap() = Some(iter);
                }
            }
        }
        let mut guard = PutBack {
            pool: self,
            iter: Some(iter),
        };

        let mut quit_rx = self.quit_rx.clone();
        let result = tokio::select! {
            node = guard.iter.as_mut().unwrap().next() => node,
            _ = quit_rx.changed() => None,
        };

        if *quit_rx.borrow() {
            if let Some(mut iter) = guard.iter.take() {
                iter.close();
            }
            None
        } else {
            result
        }
    }

    /// 对端完成握手：dialed → connected，登记 value tracker 并快照
    /// 连接时刻的响应时间统计
    pub fn register_peer(&self, node: &Node) {
        if let Err(e) = self.ns.set_state(node, self.st_connected, self.st_dialed, Duration::ZERO) {
            log::error!(target: "qinglian_pool::pool::register_peer", "Marking {} connected failed: {:?}", node.id, e);
            return;
        }
        let nvt = self.vt.register(&node.id);
        if let Err(e) = self.ns.set_field(node, self.conn_stats_field, Some(Arc::new(nvt.rt_stats()))) {
            log::error!(target: "qinglian_pool::pool::register_peer", "Storing connected stats of {} failed: {:?}", node.id, e);
        }
    }

    /// 会话结束：结算本次会话的服务价值，connected → redialWait，
    /// 权重够的节点进（或留在）有价值集合
    pub fn unregister_peer(&self, node: &Node) {
        let (weight, wait) = self.calculate_node(node, false, true);
        if let Err(e) = self.ns.set_field(node, self.conn_stats_field, None) {
            log::error!(target: "qinglian_pool::pool::unregister_peer", "Clearing connected stats of {} failed: {:?}", node.id, e);
        }
        if let Err(e) = self.ns.set_state(node, self.st_redial_wait, self.st_connected, wait) {
            log::error!(target: "qinglian_pool::pool::unregister_peer", "Marking {} redial wait failed: {:?}", node.id, e);
        }
        if weight >= NODE_WEIGHT_THRESHOLD {
            let _ = self.ns.set_state(node, self.st_has_value, 0, Duration::ZERO);
            if let Err(e) = self.ns.persist(&node.id) {
                log::error!(target: "qinglian_pool::pool::unregister_peer", "Persisting {} failed: {:?}", node.id, e);
            }
        }
        self.vt.unregister(&node.id);
    }

    /// The recommended soft request timeout, recomputed at most once per
    /// five seconds from the global response time distribution.
    pub fn get_timeout(&self) -> Duration {
        let now = self.clock.now();
        {
            let info = self.timeout_info.lock().unwrap();
            if let Some(refreshed) = info.refreshed {
                if now.saturating_duration_since(refreshed) < TIMEOUT_REFRESH {
                    return info.timeout;
                }
            }
        }

        // 空分布会让分位数失真，先垫 10 个 2s 的合成样本
        let mut rts = self.vt.rt_stats();
        rts.add(Duration::from_secs(2), 10.0, self.vt.stats_exp_factor());

        let mut timeout = MIN_TIMEOUT;
        let t = rts.timeout(0.1);
        if t > timeout {
            timeout = t;
        }
        let t = rts.timeout(0.5) * 2;
        if t > timeout {
            timeout = t;
        }

        let mut info = self.timeout_info.lock().unwrap();
        if info.timeout != timeout {
            info.timeout = timeout;
            info.weights = timeout_weights(timeout);
        }
        info.refreshed = Some(now);

        timeout
    }

    fn persist_clock(&self) {
        let offset = *self.clock_offset.lock().unwrap();
        let enc = (self.clock.now().as_nanos() + offset).to_be_bytes();
        if let Err(e) = self.db.put(&self.db_clock_key, &enc) {
            log::error!(target: "qinglian_pool::pool::persist_clock", "Persisting clock failed: {:?}", e);
        }
    }

    // dialed 超时落空，按失败连接计算退避
    fn on_dial_timeout(&self, node: &Node) {
        let (_, wait) = self.calculate_node(node, true, false);
        if let Err(e) = self.ns.set_state(node, self.st_redial_wait, 0, wait) {
            log::error!(target: "qinglian_pool::pool::dial_timeout", "Marking {} redial wait failed: {:?}", node.id, e);
        }
    }

    /// Calculates the selection weight and the proposed redial wait of a
    /// node. `failed_connection` accounts a dial that never produced a
    /// session, `remote_disconnect` settles a session that just ended.
    fn calculate_node(&self, node: &Node, failed_connection: bool, remote_disconnect: bool) -> (u64, Duration) {
        let mut n = self
            .ns
            .get_field_as::<NodeHistory>(&node.id, self.node_history_field)
            .unwrap_or_default();

        let nvt = match self.vt.get_node(&node.id) {
            Some(nvt) => nvt,
            // 没有任何服务记录的节点无从定价
            None => return (0, Duration::ZERO),
        };
        let current_stats = nvt.rt_stats();
        let weights = self.timeout_info.lock().unwrap().weights;
        let exp_factor = self.vt.stats_exp_factor();

        let mut current_value = 0.0;
        if remote_disconnect {
            match self
                .ns
                .get_field_as::<ResponseTimeStats>(&node.id, self.conn_stats_field)
            {
                Some(conn_stats) => {
                    // 本次会话新增的价值 = 当前统计减去连接时刻的快照
                    let mut diff = current_stats;
                    diff.sub_stats(&conn_stats);
                    current_value = diff.value(&weights, exp_factor);
                }
                None => {
                    log::error!(target: "qinglian_pool::pool::calculate", "Missing connected statistics field, id: {}", node.id);
                }
            }
        }

        let log_offset = self.vt.stats_expirer().log_offset(self.clock.now());
        if failed_connection || remote_disconnect {
            n.dial_cost.add(DIAL_COST as i64, log_offset);
        }
        let mut total_dial_cost = n.dial_cost.value(log_offset);
        if total_dial_cost < DIAL_COST {
            total_dial_cost = DIAL_COST;
        }

        let mut store_field = false;
        let timeout = self.get_timeout();
        let drifted = timeout > n.last_timeout + TIMEOUT_CHANGE_THRESHOLD
            || timeout + TIMEOUT_CHANGE_THRESHOLD < n.last_timeout;
        if remote_disconnect || drifted {
            n.total_value = current_stats.value(&weights, exp_factor);
            n.last_timeout = timeout;
            store_field = true;
        }

        let mut wait = Duration::ZERO;
        if failed_connection || remote_disconnect {
            // 退避系数每次翻倍，但近期价值占历史价值的比例会把它压回来：
            // 表现稳定的节点始终只等最小时长
            let a = n.total_value * DIAL_COST as f64;
            let b = total_dial_cost as f64 * current_value;
            if n.wait_factor < 1.0 {
                n.wait_factor = 1.0;
            }
            n.wait_factor *= REDIAL_WAIT_STEP;
            if a < b * n.wait_factor {
                n.wait_factor = a / b;
            }
            if n.wait_factor < 1.0 {
                n.wait_factor = 1.0;
            }
            wait = MIN_REDIAL_WAIT.mul_f64(n.wait_factor);
            let offset = *self.clock_offset.lock().unwrap();
            n.wait_until =
                AbsTime::from_nanos(self.clock.now().as_nanos() + offset + wait.as_nanos() as i64);
            store_field = true;
        }

        if store_field {
            if let Err(e) = self.ns.set_field(node, self.node_history_field, Some(Arc::new(n))) {
                log::error!(target: "qinglian_pool::pool::calculate", "Storing history of {} failed: {:?}", node.id, e);
            }
        }

        let weight = (n.total_value * NODE_WEIGHT_MUL as f64 / total_dial_cost as f64) as u64;
        (weight, wait)
    }

    // 加权选择器的权重回调。顺手把价值过期的节点移出有价值集合；
    // 摘除是异步的，权重回调本身跑在选择器装的订阅回调里，不能同步再入
    fn known_select_weight(&self, id: &crate::common::Id) -> u64 {
        let node = match self.ns.get_node(id) {
            Some(node) => node,
            None => return 0,
        };
        let (weight, _) = self.calculate_node(&node, false, false);
        if weight < NODE_WEIGHT_THRESHOLD {
            let ns = self.ns.clone();
            let mask = self.st_has_value;
            let id = *id;
            tokio::spawn(async move {
                if let Some(node) = ns.get_node(&id) {
                    let _ = ns.set_state(&node, 0, mask, Duration::ZERO);
                    if let Err(e) = ns.persist(&id) {
                        log::error!(target: "qinglian_pool::pool::weight", "Persisting demoted node {} failed: {:?}", id, e);
                    }
                }
            });
            return 0;
        }

        weight
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::future::BoxFuture;
    use qinglian_core::{common::clock::SimulatedClock, kv::MemoryStore};

    use crate::common::{Id, ID_SIZE};

    use super::*;

    fn test_node(b: u8) -> Node {
        let id = Id::from_bytes(&[b; ID_SIZE]).unwrap();
        Node::new(id, format!("127.0.0.1:{}", 30000 + b as u16).parse().unwrap())
    }

    /// 先吐完给定节点然后一直挂起的发现源
    struct StubDiscovery {
        nodes: VecDeque<Node>,
    }

    impl StubDiscovery {
        fn new(nodes: Vec<Node>) -> Box<StubDiscovery> {
            Box::new(StubDiscovery {
                nodes: nodes.into(),
            })
        }
    }

    impl NodeSource for StubDiscovery {
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

    fn setup(
        db: Arc<MemoryStore>,
        clock: Arc<SimulatedClock>,
        discovery: Option<Box<dyn NodeSource>>,
        trusted: &[String],
    ) -> (Arc<NodeStateMachine>, Arc<ValueTracker>, Arc<ServerPool>) {
        let ns = NodeStateMachine::new(db.clone(), b"ns-", clock.clone());
        let vt = Arc::new(ValueTracker::new(clock.clone(), Duration::from_secs(3600)));
        let pool = ServerPool::new(db, b"sp-", ns.clone(), vt.clone(), discovery, clock, trusted, true)
            .unwrap();
        ns.start().unwrap();
        pool.start();

        (ns, vt, pool)
    }

    #[tokio::test]
    async fn test_dial_timeout_starts_redial_wait() {
        let db = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedClock::new());
        let node = test_node(1);

        let (ns, vt, pool) = setup(
            db,
            clock.clone(),
            Some(StubDiscovery::new(vec![node.clone()])),
            &[],
        );
        // 节点曾经和我们打过交道，value tracker 里有记录
        vt.register(&node.id);
        vt.unregister(&node.id);

        let got = pool.next_candidate().await.unwrap();
        assert_eq!(got.id, node.id);

        let state = ns.node_state(&node.id);
        assert_ne!(state & pool.st_dialed, 0);
        // selected 不许和 dialed 并存
        assert_eq!(state & pool.st_selected, 0);

        // 10s 内没有 register_peer，dialed 落空转入 redialWait
        clock.run(DIAL_TIMEOUT);
        let state = ns.node_state(&node.id);
        assert_eq!(state & pool.st_dialed, 0);
        assert_ne!(state & pool.st_redial_wait, 0);

        // 没有任何服务价值的节点：退避系数翻倍到 2，等待 2 × minRedialWait
        clock.run(MIN_REDIAL_WAIT.mul_f64(2.0) - Duration::from_secs(1));
        assert_ne!(ns.node_state(&node.id) & pool.st_redial_wait, 0);
        clock.run(Duration::from_secs(2));
        assert_eq!(ns.node_state(&node.id) & pool.st_redial_wait, 0);

        pool.stop().await;
        ns.stop();
    }

    #[tokio::test]
    async fn test_session_lifecycle_marks_valuable() {
        let db = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedClock::new());
        let node = test_node(2);

        let (ns, vt, pool) = setup(
            db,
            clock.clone(),
            Some(StubDiscovery::new(vec![node.clone()])),
            &[],
        );

        let got = pool.next_candidate().await.unwrap();
        assert_eq!(got.id, node.id);

        pool.register_peer(&node);
        let state = ns.node_state(&node.id);
        assert_ne!(state & pool.st_connected, 0);
        assert_eq!(state & pool.st_dialed, 0);

        // 会话期间给了不少响应快的服务
        for _ in 0..10 {
            vt.add_sample(&node.id, Duration::from_millis(30));
        }

        pool.unregister_peer(&node);
        let state = ns.node_state(&node.id);
        assert_eq!(state & pool.st_connected, 0);
        assert_ne!(state & pool.st_redial_wait, 0);
        // 价值够了，进入已知有价值集合
        assert_ne!(state & pool.st_has_value, 0);

        // 近期表现和历史一致，退避系数压回 1，等待就是最小时长
        let history = ns
            .get_field_as::<NodeHistory>(&node.id, pool.node_history_field)
            .unwrap();
        assert_eq!(history.wait_factor(), 1.0);
        assert!(history.wait_until() > clock.now());

        clock.run(MIN_REDIAL_WAIT - Duration::from_secs(1));
        assert_ne!(ns.node_state(&node.id) & pool.st_redial_wait, 0);
        clock.run(Duration::from_secs(2));
        assert_eq!(ns.node_state(&node.id) & pool.st_redial_wait, 0);

        // 退避结束后节点重新成为拨号候选（这次走的是加权选择器）
        let got = pool.next_candidate().await.unwrap();
        assert_eq!(got.id, node.id);

        pool.stop().await;
        ns.stop();
    }

    #[tokio::test]
    async fn test_known_set_demotion() {
        let db = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedClock::new());
        let node = test_node(3);

        let (ns, vt, pool) = setup(db, clock.clone(), None, &[]);

        // 有 value tracker 记录但没有任何服务价值的节点
        vt.register(&node.id);
        vt.unregister(&node.id);
        ns.set_state(&node, pool.st_has_value, 0, Duration::ZERO).unwrap();

        // 权重回调发现权重跌破阈值，异步摘除 hasValue
        let mut demoted = false;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if ns.node_state(&node.id) & pool.st_has_value == 0 {
                demoted = true;
                break;
            }
        }
        assert!(demoted, "hasValue should be stripped asynchronously");

        // 选择器此后不会再吐出该节点
        let pulled = tokio::time::timeout(Duration::from_millis(50), pool.next_candidate()).await;
        assert!(pulled.is_err());

        pool.stop().await;
        ns.stop();
    }

    #[tokio::test]
    async fn test_trusted_nodes_always_dialable() {
        let db = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedClock::new());
        let id = Id::from_bytes(&[7u8; ID_SIZE]).unwrap();
        let url = format!("qln://{}@127.0.0.1:30307", hex::encode(id.as_bytes()));

        let (ns, _vt, pool) = setup(
            db,
            clock,
            None,
            &[url, "garbage-url".to_owned()],
        );

        // 信任列表里合法的节点直接成为拨号候选，坏 URL 跳过
        let got = pool.next_candidate().await.unwrap();
        assert_eq!(got.id, id);
        assert_ne!(ns.node_state(&id) & pool.st_dialed, 0);

        pool.stop().await;
        ns.stop();
    }

    #[tokio::test]
    async fn test_get_timeout() {
        let db = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedClock::new());
        let (ns, vt, pool) = setup(db, clock.clone(), None, &[]);

        let t0 = pool.get_timeout();
        assert!(t0 >= MIN_TIMEOUT);
        // 刷新间隔内走缓存
        assert_eq!(pool.get_timeout(), t0);

        // 全局统计里塞进一批慢响应，超时上调
        let id = Id::from_bytes(&[8u8; ID_SIZE]).unwrap();
        for _ in 0..50 {
            vt.add_sample(&id, Duration::from_secs(8));
        }
        clock.run(TIMEOUT_REFRESH);
        let t1 = pool.get_timeout();
        assert!(t1 > t0, "t0={:?} t1={:?}", t0, t1);

        pool.stop().await;
        ns.stop();
    }

    #[tokio::test]
    async fn test_restart_restores_redial_wait() {
        let db = Arc::new(MemoryStore::new());
        let clock = Arc::new(SimulatedClock::new());
        let node = test_node(5);

        {
            let (ns, vt, pool) = setup(
                db.clone(),
                clock.clone(),
                Some(StubDiscovery::new(vec![node.clone()])),
                &[],
            );

            let got = pool.next_candidate().await.unwrap();
            assert_eq!(got.id, node.id);
            pool.register_peer(&node);
            for _ in 0..10 {
                vt.add_sample(&node.id, Duration::from_millis(30));
            }
            pool.unregister_peer(&node);
            assert_ne!(ns.node_state(&node.id) & pool.st_has_value, 0);

            pool.stop().await;
            ns.stop();
        }

        // 重启：redialWait 的剩余时长按持久化时钟折算后继续生效
        let (ns2, _vt2, pool2) = setup(db, clock.clone(), None, &[]);
        let state = ns2.node_state(&node.id);
        assert_ne!(state & pool2.st_has_value, 0);
        assert_ne!(state & pool2.st_redial_wait, 0);

        clock.run(MIN_REDIAL_WAIT + Duration::from_secs(1));
        assert_eq!(ns2.node_state(&node.id) & pool2.st_redial_wait, 0);

        pool2.stop().await;
        ns2.stop();
    }
}
