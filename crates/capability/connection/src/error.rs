//! 连接级操作错误

use crate::state::ConnectionState;
use std::time::Duration;

/// 单次线上操作失败原因
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationError {
    /// 连接不在 Connected 状态，快速失败
    #[error("device not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// 线上调用超过 io_timeout，链路按失败处理
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// 链路级故障，连接进入重连
    #[error("link failure: {0}")]
    Transport(String),

    /// 设备应答了协议异常，链路保持可用
    #[error("protocol fault: {0}")]
    ProtocolFault(String),
}

impl OperationError {
    /// 是否值得重试（链路恢复后可能成功）
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ProtocolFault(_))
    }
}
