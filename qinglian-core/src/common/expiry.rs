use std::time::Duration;

use super::clock::AbsTime;

const FIXED_BITS: u32 = 24;
const FIXED_FACTOR: f64 = (1u64 << FIXED_BITS) as f64;

/// log2 标度的定点数，整数部分 40 位，小数部分 24 位。
/// 用作衰减累加器的对数时间偏移。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed64(i64);

impl Fixed64 {
    pub fn from_f64(f: f64) -> Fixed64 {
        Fixed64((f * FIXED_FACTOR) as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / FIXED_FACTOR
    }

    /// 整数部分（偏移为负时截断为 0，对数偏移在实际使用中单调非负）
    pub fn int_part(self) -> u64 {
        if self.0 < 0 {
            0
        } else {
            (self.0 >> FIXED_BITS) as u64
        }
    }

    /// 小数部分
    pub fn fraction(self) -> Fixed64 {
        Fixed64(self.0 & ((1 << FIXED_BITS) - 1))
    }

    /// 2 的 self 次方
    pub fn pow2(self) -> f64 {
        self.to_f64().exp2()
    }
}

/// Scalar accumulator that decays exponentially with the log offset: a
/// contribution loses half its weight every time the offset grows by one.
/// `base` is stored normalized to `2^exp` so that long runtimes do not
/// overflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpiredValue {
    pub base: u64,
    pub exp: u64,
}

impl ExpiredValue {
    /// 在 log_offset 时刻读取当前值
    pub fn value(&self, log_offset: Fixed64) -> u64 {
        if self.base == 0 {
            return 0;
        }
        let offset = self.exp as f64 - log_offset.to_f64();
        (self.base as f64 * offset.exp2()) as u64
    }

    /// Adds `amount` at `log_offset`: reading the value back at the same
    /// offset yields the previous value plus `amount`. Negative amounts
    /// saturate at zero.
    pub fn add(&mut self, amount: i64, log_offset: Fixed64) -> i64 {
        let integer = log_offset.int_part();
        if integer > self.exp {
            let shift = integer - self.exp;
            if shift < 64 {
                self.base >>= shift;
            } else {
                self.base = 0;
            }
            self.exp = integer;
        }

        // exp 可能仍然领先于 log_offset（时钟回读旧偏移），此时贡献按比例缩小
        let scale = (integer as f64 - self.exp as f64).exp2() * log_offset.fraction().pow2();
        let delta = amount as f64 * scale;
        if delta >= 0.0 {
            self.base = self.base.saturating_add(delta as u64);
            amount
        } else {
            let dec = (-delta) as u64;
            if dec >= self.base {
                let removed = (self.base as f64 / scale) as i64;
                self.base = 0;
                -removed
            } else {
                self.base -= dec;
                amount
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.base == 0
    }
}

/// Converts absolute time into the log offset consumed by [ExpiredValue]:
/// the offset grows by one per half-life.
#[derive(Clone, Copy, Debug)]
pub struct Expirer {
    // 每纳秒增长的 log2 偏移
    rate: f64,
}

impl Expirer {
    pub fn new(half_life: Duration) -> Expirer {
        Expirer {
            rate: 1.0 / half_life.as_nanos() as f64,
        }
    }

    pub fn log_offset(&self, now: AbsTime) -> Fixed64 {
        Fixed64::from_f64(now.as_nanos() as f64 * self.rate)
    }
}

/// 对数偏移的展开形式：总权重 = factor * 2^exp ，factor ∈ [1, 2)
#[derive(Clone, Copy, Debug)]
pub struct ExpirationFactor {
    pub exp: u64,
    pub factor: f64,
}

impl ExpirationFactor {
    pub fn from_log_offset(log_offset: Fixed64) -> ExpirationFactor {
        ExpirationFactor {
            exp: log_offset.int_part(),
            factor: log_offset.fraction().pow2(),
        }
    }

    /// 将以 `2^exp` 为基准存储的 `base` 换算为相对当前偏移的值
    pub fn value(&self, base: f64, exp: u64) -> f64 {
        base / self.factor * (exp as f64 - self.exp as f64).exp2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_life_decay() {
        let mut v = ExpiredValue::default();
        v.add(1024, Fixed64::from_f64(0.0));
        assert_eq!(v.value(Fixed64::from_f64(0.0)), 1024);
        assert_eq!(v.value(Fixed64::from_f64(1.0)), 512);
        assert_eq!(v.value(Fixed64::from_f64(10.0)), 1);
    }

    #[test]
    fn test_add_at_later_offset() {
        let mut v = ExpiredValue::default();
        v.add(1000, Fixed64::from_f64(0.0));
        v.add(1000, Fixed64::from_f64(2.0));

        // 第一笔衰减到 250，第二笔刚加上
        let got = v.value(Fixed64::from_f64(2.0));
        assert!((got as i64 - 1250).abs() <= 2, "got {}", got);
    }

    #[test]
    fn test_sub_saturates() {
        let mut v = ExpiredValue::default();
        v.add(100, Fixed64::from_f64(0.0));
        v.add(-1000, Fixed64::from_f64(0.0));
        assert_eq!(v.value(Fixed64::from_f64(0.0)), 0);
        assert!(v.is_zero());
    }

    #[test]
    fn test_expirer_offset() {
        let expirer = Expirer::new(Duration::from_secs(10));
        let off = expirer.log_offset(AbsTime::from_nanos(20_000_000_000));
        assert!((off.to_f64() - 2.0).abs() < 1e-6);
    }
}
