use std::time::Duration;

use qinglian_core::common::expiry::ExpirationFactor;

pub const TIME_STAT_LENGTH: usize = 32;

/// 每个桶的权重向量，由 [timeout_weights] 根据当前软超时生成
pub type ResponseTimeWeights = [f64; TIME_STAT_LENGTH];

// 0 号桶覆盖 [0, 1ms)，之后每个桶的时间上界翻倍
const MIN_SCALE_NANOS: f64 = 1_000_000.0;

const WEIGHT_SCALE_FACTOR: f64 = 1_000_000.0;

/// 响应时间到桶坐标的映射：1ms 以下线性，以上按 log2
pub fn time_to_stat_scale(d: Duration) -> f64 {
    let r = d.as_nanos() as f64 / MIN_SCALE_NANOS;
    let r = if r > 1.0 { r.log2() + 1.0 } else { r };
    r.min((TIME_STAT_LENGTH - 1) as f64)
}

pub fn stat_scale_to_time(r: f64) -> Duration {
    let t = if r > 1.0 { (r - 1.0).exp2() } else { r };
    Duration::from_nanos((t * MIN_SCALE_NANOS) as u64)
}

/// Per-node (or global) response time distribution over an exponential
/// time scale. Bucket contents decay together: values are normalized to
/// the shared exponent `exp` so that newer samples weigh more.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseTimeStats {
    stats: [u64; TIME_STAT_LENGTH],
    exp: u64,
}

impl ResponseTimeStats {
    fn set_exp(&mut self, exp: u64) {
        if exp > self.exp {
            let shift = exp - self.exp;
            for v in self.stats.iter_mut() {
                *v = if shift < 64 { *v >> shift } else { 0 };
            }
            self.exp = exp;
        } else if exp < self.exp {
            let shift = self.exp - exp;
            for v in self.stats.iter_mut() {
                *v = if shift < 64 { *v << shift } else { 0 };
            }
            self.exp = exp;
        }
    }

    /// 按当前衰减因子记入一个响应时间样本，样本按桶坐标小数部分线性分摊到相邻两桶
    pub fn add(&mut self, resp_time: Duration, weight: f64, exp_factor: ExpirationFactor) {
        self.set_exp(exp_factor.exp);
        let w = weight * exp_factor.factor * WEIGHT_SCALE_FACTOR;
        let r = time_to_stat_scale(resp_time);
        let i = r as usize;
        let frac = r - i as f64;
        self.stats[i] += (w * (1.0 - frac)) as u64;
        if i < TIME_STAT_LENGTH - 1 {
            self.stats[i + 1] += (w * frac) as u64;
        }
    }

    /// 逐桶减去 other（饱和到 0），用于求一次会话期间新增的部分
    pub fn sub_stats(&mut self, other: &ResponseTimeStats) {
        if other.exp > self.exp {
            self.set_exp(other.exp);
        }
        let shift = self.exp - other.exp;
        for (v, o) in self.stats.iter_mut().zip(other.stats.iter()) {
            let o = if shift < 64 { *o >> shift } else { 0 };
            *v = v.saturating_sub(o);
        }
    }

    /// 加权服务价值，负值截断为 0
    pub fn value(&self, weights: &ResponseTimeWeights, exp_factor: ExpirationFactor) -> f64 {
        let mut v = 0.0;
        for (s, w) in self.stats.iter().zip(weights.iter()) {
            v += *s as f64 * w;
        }
        if v <= 0.0 {
            return 0.0;
        }

        exp_factor.value(v, self.exp) / WEIGHT_SCALE_FACTOR
    }

    /// The response time that `fail_ratio` of the accumulated weight is
    /// slower than, interpolated inside the boundary bucket.
    pub fn timeout(&self, fail_ratio: f64) -> Duration {
        let total: u64 = self.stats.iter().sum();
        let mut s = (total as f64 * fail_ratio) as u64;

        let mut i = TIME_STAT_LENGTH - 1;
        while i > 0 && s >= self.stats[i] {
            s -= self.stats[i];
            i -= 1;
        }
        let mut r = i as f64 + 0.5;
        if self.stats[i] > 0 {
            r -= s as f64 / self.stats[i] as f64;
        }
        if r < 0.0 {
            r = 0.0;
        }

        stat_scale_to_time(r)
    }

    pub fn is_empty(&self) -> bool {
        self.stats.iter().all(|v| *v == 0)
    }
}

/// 软超时对应的价值权重曲线：0 处为 1，超时点为 0，远超时时趋于 -1
pub fn timeout_weights(timeout: Duration) -> ResponseTimeWeights {
    let timeout = timeout.as_nanos() as f64;
    let mut res = [0.0; TIME_STAT_LENGTH];
    for (i, w) in res.iter_mut().enumerate() {
        let t = stat_scale_to_time(i as f64).as_nanos() as f64;
        let ratio = t / timeout;
        *w = (1.0 - ratio) / (1.0 + ratio);
    }

    res
}

#[cfg(test)]
mod tests {
    use qinglian_core::common::expiry::Fixed64;

    use super::*;

    fn exp_factor(log_offset: f64) -> ExpirationFactor {
        ExpirationFactor::from_log_offset(Fixed64::from_f64(log_offset))
    }

    #[test]
    fn test_scale_roundtrip() {
        for d in [
            Duration::ZERO,
            Duration::from_micros(300),
            Duration::from_millis(1),
            Duration::from_millis(100),
            Duration::from_secs(2),
        ] {
            let r = time_to_stat_scale(d);
            let back = stat_scale_to_time(r);
            let diff = back.as_secs_f64() - d.as_secs_f64();
            assert!(diff.abs() < 1e-6, "{:?} -> {} -> {:?}", d, r, back);
        }
        // 超出范围截断到最后一个桶
        assert_eq!(
            time_to_stat_scale(Duration::from_secs(1 << 30)),
            (TIME_STAT_LENGTH - 1) as f64
        );
    }

    #[test]
    fn test_value_prefers_fast_responses() {
        let ef = exp_factor(0.0);
        let weights = timeout_weights(Duration::from_secs(1));

        let mut fast = ResponseTimeStats::default();
        fast.add(Duration::from_millis(50), 1.0, ef);
        let mut slow = ResponseTimeStats::default();
        slow.add(Duration::from_secs(10), 1.0, ef);

        assert!(fast.value(&weights, ef) > 0.0);
        // 远超时的响应价值为负，截断为 0
        assert_eq!(slow.value(&weights, ef), 0.0);
    }

    #[test]
    fn test_sub_stats() {
        let ef = exp_factor(0.0);
        let weights = timeout_weights(Duration::from_secs(1));

        let mut base = ResponseTimeStats::default();
        base.add(Duration::from_millis(100), 1.0, ef);
        let snapshot = base;
        base.add(Duration::from_millis(100), 1.0, ef);

        let mut diff = base;
        diff.sub_stats(&snapshot);
        let whole = base.value(&weights, ef);
        let part = diff.value(&weights, ef);
        assert!(part > 0.0 && part < whole);

        // 自己减自己归零
        let mut zero = base;
        zero.sub_stats(&base);
        assert!(zero.is_empty());
    }

    #[test]
    fn test_timeout_quantiles() {
        let ef = exp_factor(0.0);
        let mut stats = ResponseTimeStats::default();
        for _ in 0..10 {
            stats.add(Duration::from_secs(2), 1.0, ef);
        }

        let t10 = stats.timeout(0.1);
        let t50 = stats.timeout(0.5);
        let t90 = stats.timeout(0.9);
        // 分位越高，对应的超时越短
        assert!(t10 >= t50 && t50 >= t90);
        // 全部样本都是 2s，分位点都应落在 2s 的邻近区间
        assert!(t50 > Duration::from_millis(500) && t50 < Duration::from_secs(8));
    }

    #[test]
    fn test_decay_across_exp() {
        let weights = timeout_weights(Duration::from_secs(1));
        let mut stats = ResponseTimeStats::default();
        stats.add(Duration::from_millis(10), 1.0, exp_factor(0.0));
        let v0 = stats.value(&weights, exp_factor(0.0));

        // 两个半衰期之后，老样本的相对价值缩小到约四分之一
        let v2 = stats.value(&weights, exp_factor(2.0));
        assert!(v2 < v0 * 0.3 && v2 > v0 * 0.2, "v0={} v2={}", v0, v2);
    }
}
