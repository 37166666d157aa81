//! 重连退避与超时策略

use imcp_config::ReconnectConfig;
use rand_core::{OsRng, RngCore};
use std::time::Duration;

/// 连接策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 抖动比例 [0, 1]：实际等待在 `[d × (1 − jitter), d]` 内
    pub jitter: f64,
    /// 连续失败达到该次数后进入 Unreachable
    pub failure_threshold: u32,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// 同时在途的线上操作上限
    pub concurrency: usize,
}

impl ConnectionPolicy {
    pub fn from_config(config: &ReconnectConfig, concurrency: usize) -> Self {
        Self {
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff.max(config.base_backoff),
            jitter: config.jitter.clamp(0.0, 1.0),
            failure_threshold: config.failure_threshold.max(1),
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 第 `failures` 次连续失败后的等待时间。
    ///
    /// `fraction` ∈ [0, 1) 是抖动随机量，结果不超过 `max_backoff`。
    pub fn delay_for(&self, failures: u32, fraction: f64) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let raw = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let cut = (self.jitter * fraction.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        raw.mul_f64(1.0 - cut)
    }

    /// Unreachable 状态下的后台重试间隔
    pub fn unreachable_delay(&self, fraction: f64) -> Duration {
        let cut = (self.jitter * fraction.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        self.max_backoff.mul_f64(1.0 - cut)
    }

    pub(crate) fn next_delay(&self, failures: u32, unreachable: bool) -> Duration {
        let fraction = jitter_fraction();
        if unreachable {
            self.unreachable_delay(fraction)
        } else {
            self.delay_for(failures, fraction)
        }
    }
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default(), 1)
    }
}

fn jitter_fraction() -> f64 {
    f64::from(OsRng.next_u32()) / (f64::from(u32::MAX) + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> ConnectionPolicy {
        ConnectionPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            jitter,
            failure_threshold: 3,
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            concurrency: 1,
        }
    }

    #[test]
    fn delay_doubles_until_cap() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for(1, 0.5), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, 0.5), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4, 0.5), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5, 0.5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40, 0.5), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = policy(0.5);
        for failures in 1..12 {
            for fraction in [0.0, 0.25, 0.5, 0.99] {
                let delay = policy.delay_for(failures, fraction);
                assert!(delay <= policy.max_backoff);
                let floor = policy.delay_for(failures, 0.0).mul_f64(0.5);
                assert!(delay >= floor);
            }
        }
    }

    #[test]
    fn random_delays_stay_in_bounds() {
        let policy = policy(0.3);
        for _ in 0..64 {
            assert!(policy.next_delay(10, false) <= policy.max_backoff);
            assert!(policy.next_delay(1, true) <= policy.max_backoff);
            assert!(policy.next_delay(1, true) >= policy.max_backoff.mul_f64(0.7));
        }
    }

    #[test]
    fn from_config_clamps_inputs() {
        let config = ReconnectConfig {
            jitter: 4.0,
            failure_threshold: 0,
            ..ReconnectConfig::default()
        };
        let policy = ConnectionPolicy::from_config(&config, 0);
        assert_eq!(policy.jitter, 1.0);
        assert_eq!(policy.failure_threshold, 1);
        assert_eq!(policy.concurrency, 1);
    }
}
