//! 重试策略：有界次数、指数退避、随机抖动
//!
//! delay = min(max_delay, base_delay * 2^(attempt-1))，再加上 [0, jitter_ratio] 比例的随机抖动；
//! 服务端给出 retry-after 时取两者较大值。

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次），至少 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// 第 attempt 次（从 1 开始）失败后是否还能再试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// 第 attempt 次失败后的等待时间
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jittered = if self.jitter_ratio > 0.0 {
            let factor = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
            capped + capped.mul_f64(factor)
        } else {
            capped
        };
        match retry_after {
            Some(hint) => jittered.max(hint),
            None => jittered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u128> = (1..=5)
            .map(|a| policy.delay_for(a, None).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000), Duration::from_secs(10))
            .with_jitter(0.2);
        for _ in 0..50 {
            let d = policy.delay_for(1, None).as_millis();
            assert!((1000..=1200).contains(&d), "delay {d}");
        }
    }

    #[test]
    fn test_retry_after_hint_wins_when_longer() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_attempts_are_bounded() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
