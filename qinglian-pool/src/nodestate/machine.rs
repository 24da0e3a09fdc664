use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use qinglian_core::{
    common::{
        clock::{Clock, TimerToken},
        error::{Error, Result},
    },
    kv::KvStore,
};

use crate::common::{Id, Node};

use super::{
    persist::NodeRecord,
    setup::{FieldDef, FieldValue, FlagDef, StateMask},
};

/// 内部保留的 offline 标志位：start/stop 合成的字段事件用它作为节点状态上报
pub const OFFLINE_STATE: StateMask = 1;

pub type SaveHook = Arc<dyn Fn(&Id) + Send + Sync>;

type StateSubscriber = Arc<dyn Fn(&Node, StateMask, StateMask) + Send + Sync>;
type FieldSubscriber =
    Arc<dyn Fn(&Node, StateMask, Option<FieldValue>, Option<FieldValue>) + Send + Sync>;

/// Generic node state machine: attaches a bitmask of named flags and a set
/// of typed fields to every tracked node, publishes changes to subscribers
/// and persists the selected subset across restarts.
///
/// 公开接口全部线程安全。订阅回调在发起变更的线程上同步派发；
/// 回调内部再调用 `set_state` / `set_field` 是允许的：变更立即生效，
/// 其通知排到当前派发队列尾部，在最外层调用返回前送达（见 DESIGN.md）。
pub struct NodeStateMachine {
    db: Arc<dyn KvStore>,
    prefix: Vec<u8>,
    clock: Arc<dyn Clock>,
    // 定时器回调经由弱引用回到状态机，机器被丢弃后回调静默失效
    weak: Weak<NodeStateMachine>,
    inner: Mutex<Inner>,
}

struct Inner {
    started: bool,
    stopped: bool,
    flags: Vec<FlagDef>,
    fields: Vec<FieldDef>,
    persistent_mask: StateMask,
    state_subs: Vec<(StateMask, StateSubscriber)>,
    field_subs: Vec<(usize, FieldSubscriber)>,
    nodes: HashMap<Id, NodeInfo>,
    pending: VecDeque<Event>,
    dispatching: bool,
    timeout_seq: u64,
    save_hook: Option<SaveHook>,
}

struct NodeInfo {
    node: Node,
    state: StateMask,
    timeouts: Vec<NodeTimeout>,
    fields: Vec<Option<FieldValue>>,
    /// 恢复时没解析出来的持久化标志名，原样保留
    unknown_flags: Vec<String>,
    /// 恢复时没解析出来的字段，原样保留
    unknown_fields: Vec<(String, Vec<u8>)>,
    /// 数据库中已有该节点的记录
    db: bool,
    dirty: bool,
}

struct NodeTimeout {
    id: u64,
    mask: StateMask,
    token: TimerToken,
}

enum Event {
    State {
        node: Node,
        old: StateMask,
        new: StateMask,
    },
    Field {
        node: Node,
        state: StateMask,
        index: usize,
        old: Option<FieldValue>,
        new: Option<FieldValue>,
    },
}

impl NodeStateMachine {
    /// 所有持久化 key 都以 prefix 开头；同一个库上可以用不同前缀挂多台状态机
    pub fn new(db: Arc<dyn KvStore>, prefix: &[u8], clock: Arc<dyn Clock>) -> Arc<NodeStateMachine> {
        Arc::new_cyclic(|weak| NodeStateMachine {
            db,
            prefix: prefix.to_vec(),
            clock,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                started: false,
                stopped: false,
                // 0 号位留给内部 offline 标志
                flags: vec![FlagDef::new("offline")],
                fields: Vec::new(),
                persistent_mask: 0,
                state_subs: Vec::new(),
                field_subs: Vec::new(),
                nodes: HashMap::new(),
                pending: VecDeque::new(),
                dispatching: false,
                timeout_seq: 0,
                save_hook: None,
            }),
        })
    }

    /// Registers a flag (idempotent by name) and returns its bitmask.
    /// Registration is only possible before `start`.
    pub fn state_mask(&self, flag: &FlagDef) -> Result<StateMask> {
        let mut inner = self.inner.lock().unwrap();
        if inner.started {
            Err(Error::new_setup("Flag registration after start"))?;
        }
        if let Some(idx) = inner.flags.iter().position(|f| f.name() == flag.name()) {
            if inner.flags[idx].is_persistent() != flag.is_persistent() {
                Err(Error::new_setup(&format!(
                    "Flag {} re-registered with different persistence",
                    flag.name()
                )))?;
            }
            return Ok(1 << idx);
        }
        let idx = inner.flags.len();
        if idx >= StateMask::BITS as usize {
            Err(Error::new_setup("Too many flags registered"))?;
        }
        if flag.is_persistent() {
            inner.persistent_mask |= 1 << idx;
        }
        inner.flags.push(flag.clone());

        Ok(1 << idx)
    }

    /// 多个标志的掩码并集
    pub fn states_mask(&self, flags: &[&FlagDef]) -> Result<StateMask> {
        let mut mask = 0;
        for flag in flags {
            mask |= self.state_mask(flag)?;
        }

        Ok(mask)
    }

    /// Registers a field (idempotent by name) and returns its index.
    pub fn field_index(&self, field: &FieldDef) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.started {
            Err(Error::new_setup("Field registration after start"))?;
        }
        if let Some(idx) = inner.fields.iter().position(|f| f.name() == field.name()) {
            if inner.fields[idx].type_id() != field.type_id() {
                Err(Error::new_setup(&format!(
                    "Field {} re-registered with different type",
                    field.name()
                )))?;
            }
            return Ok(idx);
        }
        let idx = inner.fields.len();
        inner.fields.push(field.clone());
        for info in inner.nodes.values_mut() {
            info.fields.push(None);
        }

        Ok(idx)
    }

    /// handler 在 mask 内任何位变化时收到 (node, old & mask, new & mask)
    pub fn subscribe_state<F>(&self, mask: StateMask, handler: F)
    where
        F: Fn(&Node, StateMask, StateMask) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .state_subs
            .push((mask, Arc::new(handler)));
    }

    /// handler 在字段每次变化时收到 (node, state, old, new)，
    /// 包括 start 恢复（old=None）和 stop 清场（new=None）的合成事件
    pub fn subscribe_field<F>(&self, index: usize, handler: F)
    where
        F: Fn(&Node, StateMask, Option<FieldValue>, Option<FieldValue>) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .field_subs
            .push((index, Arc::new(handler)));
    }

    /// 每次持久化写盘时回调，测试用来观察落盘行为
    pub fn set_save_node_hook(&self, hook: SaveHook) {
        self.inner.lock().unwrap().save_hook = Some(hook);
    }

    /// Loads persisted nodes, replays their persistent flags and restores
    /// persistent fields. Restored fields are announced to field
    /// subscribers as `old=None, new=restored` with the offline state.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.started {
            Err(Error::new_general("State machine already started"))?;
        }
        inner.started = true;

        let entries = match self.db.scan_prefix(&self.prefix) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!(target: "qinglian_pool::nodestate::start", "Loading node records failed: {:?}", e);
                Vec::new()
            }
        };

        for (key, raw) in entries {
            let id = match Id::from_bytes(&key[self.prefix.len()..]) {
                Ok(id) => id,
                Err(_) => {
                    log::error!(target: "qinglian_pool::nodestate::start", "Invalid node key in db, skipped");
                    continue;
                }
            };
            let record = match NodeRecord::decode(&raw) {
                Ok(record) => record,
                Err(e) => {
                    log::error!(target: "qinglian_pool::nodestate::start", "Decoding node {} failed: {:?}", id, e);
                    continue;
                }
            };
            let address = match record.address.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    log::error!(target: "qinglian_pool::nodestate::start", "Node {} has invalid address {:?}", id, record.address);
                    continue;
                }
            };

            let node = Node::new(id, address);
            let mut info = NodeInfo {
                node: node.clone(),
                state: 0,
                timeouts: Vec::new(),
                fields: vec![None; inner.fields.len()],
                unknown_flags: Vec::new(),
                unknown_fields: Vec::new(),
                db: true,
                dirty: false,
            };

            // 按名字解析标志位，位次和上次运行无关
            for name in record.flags {
                match inner.flags.iter().position(|f| f.name() == name) {
                    Some(idx) => info.state |= 1 << idx,
                    None => info.unknown_flags.push(name),
                }
            }

            let mut restored = Vec::new();
            for (name, bytes) in record.fields {
                let reg = inner
                    .fields
                    .iter()
                    .position(|f| f.name() == name)
                    .and_then(|idx| inner.fields[idx].codec().map(|codec| (idx, codec)));
                match reg {
                    Some((idx, (_, decode))) => match decode(&bytes) {
                        Ok(value) => {
                            info.fields[idx] = Some(value.clone());
                            restored.push((idx, value));
                        }
                        Err(e) => {
                            log::error!(target: "qinglian_pool::nodestate::start", "Decoding field {} of node {} failed: {:?}", name, id, e);
                        }
                    },
                    None => info.unknown_fields.push((name, bytes)),
                }
            }

            if info.state == 0
                && restored.is_empty()
                && info.unknown_flags.is_empty()
                && info.unknown_fields.is_empty()
            {
                // 空壳记录，顺手清掉
                if let Err(e) = self.db.delete(&key) {
                    log::warn!(target: "qinglian_pool::nodestate::start", "Deleting stale record failed: {:?}", e);
                }
                continue;
            }

            let state = info.state;
            inner.nodes.insert(id, info);
            // 恢复的标志以一次 0 → 持久化状态 的跳变公告出去，
            // 让订阅方（比如选择器）重建自己的候选集
            if state != 0 {
                inner.pending.push_back(Event::State {
                    node: node.clone(),
                    old: 0,
                    new: state,
                });
            }
            for (index, value) in restored {
                inner.pending.push_back(Event::Field {
                    node: node.clone(),
                    state: OFFLINE_STATE,
                    index,
                    old: None,
                    new: Some(value),
                });
            }
        }

        self.dispatch(inner);

        Ok(())
    }

    /// Flushes dirty nodes, emits teardown field events (`new=None`, offline
    /// state) and rejects any further mutation.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.started || inner.stopped {
            return;
        }

        let ids: Vec<Id> = inner.nodes.keys().copied().collect();
        for id in &ids {
            let dirty = {
                let info = &inner.nodes[id];
                for t in &info.timeouts {
                    t.token.cancel();
                }
                info.dirty
            };
            if dirty {
                self.save_node(&mut inner, id);
            }
        }

        for id in &ids {
            let (node, fields) = {
                let info = &inner.nodes[id];
                (info.node.clone(), info.fields.clone())
            };
            for (index, value) in fields.into_iter().enumerate() {
                if let Some(value) = value {
                    inner.pending.push_back(Event::Field {
                        node: node.clone(),
                        state: OFFLINE_STATE,
                        index,
                        old: Some(value),
                        new: None,
                    });
                }
            }
        }

        inner.stopped = true;
        self.dispatch(inner);
    }

    /// Atomically clears `reset` bits then sets `set` bits on the node. If
    /// `timeout` is nonzero the bits set by this call are cleared again
    /// once it elapses, unless a later call touches them first. A call that
    /// leaves the state unchanged is a complete no-op.
    pub fn set_state(
        &self,
        node: &Node,
        set: StateMask,
        reset: StateMask,
        timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            Err(Error::new_after_stop("set_state after stop"))?;
        }
        if !inner.started {
            Err(Error::new_general("State machine not started"))?;
        }

        if !inner.nodes.contains_key(&node.id) {
            if set == 0 {
                return Ok(());
            }
            let fields = vec![None; inner.fields.len()];
            inner.nodes.insert(
                node.id,
                NodeInfo {
                    node: node.clone(),
                    state: 0,
                    timeouts: Vec::new(),
                    fields,
                    unknown_flags: Vec::new(),
                    unknown_fields: Vec::new(),
                    db: false,
                    dirty: false,
                },
            );
        }

        let persistent_mask = inner.persistent_mask;
        let info = inner.nodes.get_mut(&node.id).unwrap();
        // 节点换地址后记录最新的
        info.node = node.clone();

        let old = info.state;
        let new = (old & !reset) | set;
        if new == old {
            return Ok(());
        }

        // 本次触碰到的位，从所有挂起的定时器里摘掉；
        // 掩码清空的定时器整个取消
        let touched = set | reset;
        for t in info.timeouts.iter_mut() {
            t.mask &= !touched;
            if t.mask == 0 {
                t.token.cancel();
            }
        }
        info.timeouts.retain(|t| t.mask != 0);

        info.state = new;
        if (old ^ new) & persistent_mask != 0 {
            info.dirty = true;
        }

        if timeout > Duration::ZERO && set != 0 {
            inner.timeout_seq += 1;
            let timeout_id = inner.timeout_seq;
            let weak = self.weak.clone();
            let id = node.id;
            let token = self.clock.after_func(
                timeout,
                Box::new(move || {
                    if let Some(ns) = weak.upgrade() {
                        ns.handle_timeout(id, timeout_id);
                    }
                }),
            );
            let info = inner.nodes.get_mut(&node.id).unwrap();
            info.timeouts.push(NodeTimeout {
                id: timeout_id,
                mask: set,
                token,
            });
        }

        inner.pending.push_back(Event::State {
            node: node.clone(),
            old,
            new,
        });

        if new == 0 {
            // 最后一个标志被清掉：有持久化数据先落盘，然后从内存移除
            self.save_node(&mut inner, &node.id);
            let info = inner.nodes.remove(&node.id).unwrap();
            for t in &info.timeouts {
                t.token.cancel();
            }
            for (index, value) in info.fields.into_iter().enumerate() {
                if let Some(value) = value {
                    inner.pending.push_back(Event::Field {
                        node: node.clone(),
                        state: 0,
                        index,
                        old: Some(value),
                        new: None,
                    });
                }
            }
        }

        self.dispatch(inner);

        Ok(())
    }

    // 定时器到点：把当初设置的位里仍然有效的部分清掉。
    // 位如果已被后来的调用清掉或重置过，对应定时器早被摘除，这里不会看到。
    fn handle_timeout(&self, id: Id, timeout_id: u64) {
        let target = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return;
            }
            match inner.nodes.get_mut(&id) {
                Some(info) => {
                    match info.timeouts.iter().position(|t| t.id == timeout_id) {
                        Some(pos) => {
                            let t = info.timeouts.remove(pos);
                            Some((info.node.clone(), t.mask))
                        }
                        None => None,
                    }
                }
                None => None,
            }
        };

        if let Some((node, mask)) = target {
            if let Err(e) = self.set_state(&node, 0, mask, Duration::ZERO) {
                log::error!(target: "qinglian_pool::nodestate::timeout", "Clearing timed state failed: {:?}", e);
            }
        }
    }

    /// Sets a typed field. The write is silently discarded when the node
    /// has no flag bit set; a wrong dynamic type is an `InvalidField`
    /// error. `None` clears the field.
    pub fn set_field(&self, node: &Node, index: usize, value: Option<FieldValue>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            Err(Error::new_after_stop("set_field after stop"))?;
        }
        if !inner.started {
            Err(Error::new_general("State machine not started"))?;
        }
        let def = inner
            .fields
            .get(index)
            .ok_or_else(|| Error::new_invalid_field("Field index out of range"))?;
        if let Some(value) = &value {
            if !def.check_type(value) {
                Err(Error::new_invalid_field(&format!(
                    "Field {} expects {}",
                    def.name(),
                    def.type_name()
                )))?;
            }
        }
        let persistent = def.is_persistent();

        let info = match inner.nodes.get_mut(&node.id) {
            Some(info) if info.state != 0 => info,
            // 没有任何标志位的节点不保留字段
            _ => return Ok(()),
        };

        let old = info.fields[index].take();
        if old.is_none() && value.is_none() {
            return Ok(());
        }
        info.fields[index] = value.clone();
        if persistent {
            info.dirty = true;
        }
        let state = info.state;
        let node = info.node.clone();

        inner.pending.push_back(Event::Field {
            node,
            state,
            index,
            old,
            new: value,
        });

        self.dispatch(inner);

        Ok(())
    }

    /// 当前字段值，未设置或节点未被跟踪时返回 None
    pub fn get_field(&self, id: &Id, index: usize) -> Option<FieldValue> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(id)
            .and_then(|info| info.fields.get(index))
            .and_then(|v| v.clone())
    }

    /// get_field 的带类型版本
    pub fn get_field_as<T: Clone + Send + Sync + 'static>(
        &self,
        id: &Id,
        index: usize,
    ) -> Option<T> {
        self.get_field(id, index)
            .and_then(|v| v.as_ref().downcast_ref::<T>().cloned())
    }

    /// 被跟踪节点的规范记录
    pub fn get_node(&self, id: &Id) -> Option<Node> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(id)
            .map(|info| info.node.clone())
    }

    /// 节点当前状态掩码，未跟踪时为 0
    pub fn node_state(&self, id: &Id) -> StateMask {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(id)
            .map(|info| info.state)
            .unwrap_or(0)
    }

    /// Synchronously invokes `f` over a snapshot of every tracked node
    /// whose state contains `require` and avoids `disallow`.
    pub fn for_each<F>(&self, require: StateMask, disallow: StateMask, mut f: F)
    where
        F: FnMut(&Node, StateMask),
    {
        let snapshot: Vec<(Node, StateMask)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .nodes
                .values()
                .filter(|info| {
                    info.state & require == require && info.state & disallow == 0
                })
                .map(|info| (info.node.clone(), info.state))
                .collect()
        };

        for (node, state) in snapshot {
            f(&node, state);
        }
    }

    /// 立即把该节点的持久化标志和字段写盘，并清除 dirty 位
    pub fn persist(&self, id: &Id) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            Err(Error::new_after_stop("persist after stop"))?;
        }
        if !inner.nodes.contains_key(id) {
            return Ok(());
        }
        self.save_node(&mut inner, id);

        Ok(())
    }

    fn node_key(&self, id: &Id) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(id.as_bytes());
        key
    }

    // 持久化是尽力而为：失败只记日志，内存状态仍是权威数据
    fn save_node(&self, inner: &mut Inner, id: &Id) {
        let (record, key) = {
            let info = match inner.nodes.get(id) {
                Some(info) => info,
                None => return,
            };

            // 挂着定时器的位不落盘
            let timed: StateMask = info.timeouts.iter().fold(0, |m, t| m | t.mask);
            let persisted = info.state & inner.persistent_mask & !timed;

            let mut record = NodeRecord {
                address: info.node.address.to_string(),
                flags: Vec::new(),
                fields: Vec::new(),
            };
            for (idx, flag) in inner.flags.iter().enumerate() {
                if persisted & (1 << idx) != 0 {
                    record.flags.push(flag.name().to_owned());
                }
            }
            record.flags.extend(info.unknown_flags.iter().cloned());

            for (idx, value) in info.fields.iter().enumerate() {
                let (value, codec) = match (value, inner.fields[idx].codec()) {
                    (Some(value), Some(codec)) => (value, codec),
                    _ => continue,
                };
                match (codec.0)(value) {
                    Ok(bytes) => record.fields.push((inner.fields[idx].name().to_owned(), bytes)),
                    Err(e) => {
                        log::error!(target: "qinglian_pool::nodestate::save", "Encoding field {} of node {} failed: {:?}", inner.fields[idx].name(), id, e);
                    }
                }
            }
            record
                .fields
                .extend(info.unknown_fields.iter().cloned());

            (record, self.node_key(id))
        };

        if record.is_empty() {
            let info = inner.nodes.get_mut(id).unwrap();
            info.dirty = false;
            if info.db {
                info.db = false;
                if let Err(e) = self.db.delete(&key) {
                    log::warn!(target: "qinglian_pool::nodestate::save", "Deleting record of node {} failed: {:?}", id, e);
                }
            }
            return;
        }

        if let Err(e) = self.db.put(&key, &record.encode()) {
            log::error!(target: "qinglian_pool::nodestate::save", "Saving node {} failed: {:?}", id, e);
            return;
        }

        let info = inner.nodes.get_mut(id).unwrap();
        info.db = true;
        info.dirty = false;
        if let Some(hook) = &inner.save_hook {
            hook(id);
        }
    }

    // 通知派发循环。锁内只取事件和订阅者快照，回调一律在锁外执行，
    // 所以回调里可以安全地读状态、再发起变更（变更的通知排队到本循环尾部）。
    fn dispatch<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) {
        if inner.dispatching {
            return;
        }
        inner.dispatching = true;

        loop {
            let event = match inner.pending.pop_front() {
                Some(event) => event,
                None => break,
            };

            match event {
                Event::State { node, old, new } => {
                    let subs: Vec<(StateMask, StateSubscriber)> = inner
                        .state_subs
                        .iter()
                        .filter(|(mask, _)| (old ^ new) & mask != 0)
                        .cloned()
                        .collect();
                    drop(inner);
                    for (mask, sub) in subs {
                        sub(&node, old & mask, new & mask);
                    }
                    inner = self.inner.lock().unwrap();
                }
                Event::Field {
                    node,
                    state,
                    index,
                    old,
                    new,
                } => {
                    let subs: Vec<FieldSubscriber> = inner
                        .field_subs
                        .iter()
                        .filter(|(idx, _)| *idx == index)
                        .map(|(_, sub)| sub.clone())
                        .collect();
                    drop(inner);
                    for sub in subs {
                        sub(&node, state, old.clone(), new.clone());
                    }
                    inner = self.inner.lock().unwrap();
                }
            }
        }

        inner.dispatching = false;
    }
}
