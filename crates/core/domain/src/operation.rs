//! 逻辑操作与订阅回调

use crate::device::DeviceId;
use crate::value::TagValue;
use std::fmt;
use std::sync::Arc;

/// 订阅变化通知
#[derive(Debug, Clone, PartialEq)]
pub struct TagChange {
    pub device_id: DeviceId,
    pub tag: String,
    pub value: TagValue,
    /// 观测时间戳（毫秒）
    pub observed_at_ms: i64,
}

/// 值变化回调
pub type ChangeCallback = Arc<dyn Fn(TagChange) + Send + Sync>;

/// 操作类型
#[derive(Clone)]
pub enum OperationKind {
    Read,
    Write(TagValue),
    Subscribe(ChangeCallback),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write(_) => "write",
            Self::Subscribe(_) => "subscribe",
        }
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("Read"),
            Self::Write(value) => f.debug_tuple("Write").field(value).finish(),
            Self::Subscribe(_) => f.write_str("Subscribe(..)"),
        }
    }
}

/// 一次逻辑操作（按调用创建，完成后丢弃）。
///
/// 除 `correlation_id` 外没有身份，关联 ID 只用于追踪与超时记账。
#[derive(Debug, Clone)]
pub struct Operation {
    pub correlation_id: String,
    pub device_id: DeviceId,
    pub tag: String,
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(device_id: impl Into<String>, tag: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            correlation_id: String::new(),
            device_id: device_id.into(),
            tag: tag.into(),
            kind,
        }
    }

    pub fn read(device_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::new(device_id, tag, OperationKind::Read)
    }

    pub fn write(device_id: impl Into<String>, tag: impl Into<String>, value: TagValue) -> Self {
        Self::new(device_id, tag, OperationKind::Write(value))
    }

    pub fn subscribe(
        device_id: impl Into<String>,
        tag: impl Into<String>,
        on_change: ChangeCallback,
    ) -> Self {
        Self::new(device_id, tag, OperationKind::Subscribe(on_change))
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// 设备健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Degraded,
    Unreachable,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
