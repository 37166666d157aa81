//! # 请求分发能力模块
//!
//! 把外部调用映射为设备操作：
//! - **解析**：每次尝试向注册表查找设备，未注册返回 `DeviceNotFound`
//! - **超时**：单次尝试超时 + 可选整体截止时间
//! - **重试**：仅 `Timeout` / `NotConnected`，线性退避，与连接层的重连退避相互独立
//! - **并发**：全局在途上限 + 单设备在途上限，设备之间互不阻塞
//! - **批量**：结果与输入按位置对齐，单个失败不影响其他操作
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::from_config(registry, &config.dispatch);
//! let options = dispatcher.default_options();
//! let outcome = dispatcher.execute(Operation::read("plc-1", "speed"), options).await?;
//! let results = dispatcher.execute_batch(ops, options).await;
//! ```

mod dispatcher;
mod error;
mod options;

pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use options::{ExecuteOptions, OperationOutcome};
