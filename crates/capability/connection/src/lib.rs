//! # 设备连接能力模块
//!
//! 每个已注册设备持有一个 [`DeviceConnection`]：
//! - **状态机**：Disconnected / Connecting / Connected / Reconnecting / Unreachable / Closed，
//!   所有迁移经 [`ConnectionState::can_transition_to`] 校验
//! - **重连**：指数退避 + 抖动，连续失败达到阈值后进入 Unreachable 并继续低频重试
//! - **并发**：按协议限制在途操作数，排队按到达顺序
//! - **关闭**：等待在途操作结束后再释放传输
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let connection = DeviceConnection::new("plc-1", transport, ConnectionPolicy::default());
//! connection.start();
//! let response = connection.perform(request).await?;
//! connection.close().await;
//! ```

mod connection;
mod error;
mod policy;
mod state;

pub use connection::{DeviceConnection, LinkControl};
pub use error::OperationError;
pub use policy::ConnectionPolicy;
pub use state::{ConnectionState, LinkStatus};
