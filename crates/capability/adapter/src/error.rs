//! 适配器错误

use domain::ValueError;
use imcp_connection::OperationError;

/// 适配器操作错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    /// 连接不可用或链路在操作中断开
    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("operation timed out")]
    Timeout,

    /// 设备拒绝请求或返回了无法按声明类型解释的数据
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// 写入值不满足点位声明类型，未发生任何线上 I/O
    #[error("type mismatch on tag {tag}: {source}")]
    TypeMismatch {
        tag: String,
        #[source]
        source: ValueError,
    },

    /// 只读点位或只读数据区
    #[error("tag is not writable: {0}")]
    NotWritable(String),
}

impl AdapterError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::Timeout)
    }
}

impl From<OperationError> for AdapterError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::NotConnected(state) => Self::NotConnected(format!("state {}", state)),
            OperationError::Timeout(_) => Self::Timeout,
            OperationError::Transport(reason) => Self::NotConnected(reason),
            OperationError::ProtocolFault(reason) => Self::ProtocolFault(reason),
        }
    }
}

impl From<imcp_protocol::CodecError> for AdapterError {
    fn from(err: imcp_protocol::CodecError) -> Self {
        Self::ProtocolFault(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imcp_connection::ConnectionState;
    use std::time::Duration;

    #[test]
    fn operation_errors_map_to_adapter_kinds() {
        assert!(matches!(
            AdapterError::from(OperationError::NotConnected(ConnectionState::Reconnecting)),
            AdapterError::NotConnected(_)
        ));
        assert_eq!(
            AdapterError::from(OperationError::Timeout(Duration::from_secs(1))),
            AdapterError::Timeout
        );
        assert!(AdapterError::from(OperationError::Transport("reset".into())).is_transient());
        assert!(!AdapterError::from(OperationError::ProtocolFault("exception".into())).is_transient());
    }
}
