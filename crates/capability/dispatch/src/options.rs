//! 单次调用参数与结果

use domain::TagValue;
use imcp_adapter::SubscriptionHandle;
use imcp_config::DispatchConfig;
use std::time::Duration;

/// 单次调用参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// 单次尝试超时（排队取许可 + 设备解析 + 适配器调用）
    pub attempt_timeout: Duration,
    /// 瞬时错误的最大重试次数
    pub max_retries: u32,
    /// 线性退避步长：第 n 次重试前等待 `retry_backoff × n`
    pub retry_backoff: Duration,
    /// 整体截止时间（含排队、重试与退避）
    pub deadline: Option<Duration>,
}

impl ExecuteOptions {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            attempt_timeout: config.attempt_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            deadline: None,
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 第 `attempt` 次尝试失败后的等待时间
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// 操作结果
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    Value(TagValue),
    Written,
    Subscribed(SubscriptionHandle),
}

impl OperationOutcome {
    pub fn value(&self) -> Option<&TagValue> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_subscription(self) -> Option<SubscriptionHandle> {
        match self {
            Self::Subscribed(handle) => Some(handle),
            _ => None,
        }
    }
}
