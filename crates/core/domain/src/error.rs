//! 注册与查找错误

/// 设备注册输入错误（只影响本次注册，不影响进程）。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("device already registered: {0}")]
    DuplicateDevice(String),
    #[error("unknown protocol kind: {0}")]
    UnknownProtocol(String),
    #[error("no transport available for protocol {protocol}: {reason}")]
    UnsupportedTransport { protocol: String, reason: String },
    #[error("invalid tag {tag}: {reason}")]
    InvalidTag { tag: String, reason: String },
    #[error("invalid device config: {0}")]
    Invalid(String),
}

/// 设备 ID 未注册。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device not found: {device_id}")]
pub struct NotFoundError {
    pub device_id: String,
}

impl NotFoundError {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}
