//! 传输错误类型定义

/// 传输层错误
///
/// 区分链路级故障（连接需要重建）与协议级故障（设备应答了异常，链路仍然可用）。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 连接错误
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 会话未建立
    #[error("transport not open")]
    NotOpen,

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 设备返回的协议异常（Modbus 异常码、OPC UA Bad 状态码等）
    #[error("device fault: {0}")]
    Fault(String),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),
}

impl TransportError {
    /// 是否需要重建链路
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Io(_) | Self::NotOpen | Self::Timeout(_)
        )
    }
}

/// 编解码错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 数据类型不受该协议支持
    #[error("unsupported data type for {protocol}: {data_type}")]
    Unsupported {
        protocol: &'static str,
        data_type: domain::DataType,
    },
}
