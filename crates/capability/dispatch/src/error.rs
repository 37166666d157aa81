//! 分发错误

use imcp_adapter::AdapterError;

/// 分发错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// 适配器错误（瞬时错误已按策略重试）
    #[error("device {device_id} failed after {attempts} attempt(s): {source}")]
    Adapter {
        device_id: String,
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    /// 操作任务异常终止，不影响同批次其他操作
    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Adapter { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// 适配器层错误
    pub fn adapter_error(&self) -> Option<&AdapterError> {
        match self {
            Self::Adapter { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Adapter { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}
