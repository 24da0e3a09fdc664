use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    ops::{Add, Sub},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

/// 单调时钟的绝对时间点，进程启动后经过的纳秒数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsTime(i64);

impl AbsTime {
    pub fn from_nanos(nanos: i64) -> AbsTime {
        AbsTime(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// self - earlier，如果 earlier 在 self 之后则返回零时长
    pub fn saturating_duration_since(self, earlier: AbsTime) -> Duration {
        if self.0 > earlier.0 {
            Duration::from_nanos((self.0 - earlier.0) as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl Add<Duration> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: Duration) -> AbsTime {
        AbsTime(self.0 + rhs.as_nanos() as i64)
    }
}

impl Sub<AbsTime> for AbsTime {
    /// 有符号纳秒差
    type Output = i64;

    fn sub(self, rhs: AbsTime) -> i64 {
        self.0 - rhs.0
    }
}

type TimerFn = Box<dyn FnOnce() + Send + 'static>;

/// Handle for a scheduled callback. Cancelling is best-effort: a callback
/// that already started running is not interrupted.
#[derive(Clone, Debug)]
pub struct TimerToken {
    cancelled: Arc<AtomicBool>,
}

impl TimerToken {
    fn new() -> TimerToken {
        TimerToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

/// 单调时钟抽象。生产环境用 [SystemClock]，测试用 [SimulatedClock]（由测试代码推进）。
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> AbsTime;

    /// 在 delay 之后调用 f，返回可取消的句柄
    fn after_func(&self, delay: Duration, f: TimerFn) -> TimerToken;
}

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// System monotonic clock. `after_func` relies on the tokio runtime, so it
/// must be called from within one.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> AbsTime {
        AbsTime(process_start().elapsed().as_nanos() as i64)
    }

    fn after_func(&self, delay: Duration, f: TimerFn) -> TimerToken {
        let token = TimerToken::new();
        let cancelled = token.cancelled.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !cancelled.load(AtomicOrdering::SeqCst) {
                f();
            }
        });

        token
    }
}

struct SimTimer {
    at: AbsTime,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    f: Option<TimerFn>,
}

impl PartialEq for SimTimer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for SimTimer {}

impl PartialOrd for SimTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTimer {
    // BinaryHeap 是大顶堆，这里反转让最早到期的定时器先弹出
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SimInner {
    now: AbsTime,
    seq: u64,
    timers: BinaryHeap<SimTimer>,
}

/// 受程序控制推进的模拟时钟。[SimulatedClock::run] 推进时间并同步触发到期的回调。
pub struct SimulatedClock {
    inner: Mutex<SimInner>,
}

impl SimulatedClock {
    pub fn new() -> SimulatedClock {
        SimulatedClock {
            inner: Mutex::new(SimInner {
                now: AbsTime(0),
                seq: 0,
                timers: BinaryHeap::new(),
            }),
        }
    }

    /// Advances the clock by `d`, firing every scheduled callback whose
    /// deadline falls inside the window, in deadline order, on the calling
    /// thread.
    pub fn run(&self, d: Duration) {
        let target = {
            let inner = self.inner.lock().unwrap();
            inner.now + d
        };

        loop {
            let timer = {
                let mut inner = self.inner.lock().unwrap();
                match inner.timers.peek() {
                    Some(t) if t.at <= target => {
                        let t = inner.timers.pop().unwrap();
                        inner.now = t.at;
                        Some(t)
                    }
                    _ => None,
                }
            };

            match timer {
                // 回调在锁外执行，允许它重新调度或取消其他定时器
                Some(mut t) => {
                    if !t.cancelled.load(AtomicOrdering::SeqCst) {
                        if let Some(f) = t.f.take() {
                            f();
                        }
                    }
                }
                None => break,
            }
        }

        self.inner.lock().unwrap().now = target;
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        SimulatedClock::new()
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> AbsTime {
        self.inner.lock().unwrap().now
    }

    fn after_func(&self, delay: Duration, f: TimerFn) -> TimerToken {
        let token = TimerToken::new();
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let timer = SimTimer {
            at: inner.now + delay,
            seq: inner.seq,
            cancelled: token.cancelled.clone(),
            f: Some(f),
        };
        inner.timers.push(timer);

        token
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_simulated_run_order() {
        let clock = SimulatedClock::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (name, delay) in [("b", 2), ("a", 1), ("c", 3)] {
            let fired = fired.clone();
            clock.after_func(
                Duration::from_secs(delay),
                Box::new(move || fired.lock().unwrap().push(name)),
            );
        }

        clock.run(Duration::from_secs(2));
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(clock.now(), AbsTime::from_nanos(2_000_000_000));

        clock.run(Duration::from_secs(1));
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancel() {
        let clock = SimulatedClock::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_c = count.clone();
        let token = clock.after_func(
            Duration::from_secs(1),
            Box::new(move || {
                count_c.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );
        token.cancel();

        clock.run(Duration::from_secs(2));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_callback_reschedules() {
        let clock = SimulatedClock::new();
        let clock = Arc::new(clock);
        let count = Arc::new(AtomicUsize::new(0));

        let clock_c = clock.clone();
        let count_c = count.clone();
        clock.after_func(
            Duration::from_secs(1),
            Box::new(move || {
                count_c.fetch_add(1, AtomicOrdering::SeqCst);
                let count_cc = count_c.clone();
                clock_c.after_func(
                    Duration::from_secs(1),
                    Box::new(move || {
                        count_cc.fetch_add(1, AtomicOrdering::SeqCst);
                    }),
                );
            }),
        );

        clock.run(Duration::from_secs(2));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }
}
