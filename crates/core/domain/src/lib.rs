//! 工业网关领域模型：设备、点位、类型化数值、操作与健康状态。

pub mod device;
pub mod error;
pub mod operation;
pub mod value;

pub use device::{
    Access, ConnectionParams, DeviceConfig, DeviceId, ModbusTable, ProtocolKind, TagAddress,
    TagSpec, WordOrder,
};
pub use error::{ConfigError, NotFoundError};
pub use operation::{ChangeCallback, Health, Operation, OperationKind, TagChange};
pub use value::{DataType, TagValue, ValueError};

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
