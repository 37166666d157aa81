//! # 设备注册表能力模块
//!
//! 持有全部已注册设备的适配器与连接，是分发器查找设备的唯一入口：
//! - **注册**：校验定义 → 向传输工厂索取传输 → 按协议组装适配器与连接 → 后台握手
//! - **注销**：移除条目 → 取消订阅 → 排空在途操作后关闭连接
//! - **健康**：由连接状态推导 Healthy / Degraded / Unreachable
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let registry = Registry::new(Arc::new(NativeTransportFactory::new()), RegistrySettings::default());
//! let device_id = registry.register(device).await?;
//! let entry = registry.lookup(&device_id)?;
//! let value = entry.adapter.read("speed").await?;
//! registry.shutdown().await;
//! ```

mod factory;
mod registry;

pub use factory::{NativeTransportFactory, StaticTransportFactory, TransportFactory};
pub use registry::{Registry, RegistryEntry, RegistrySettings, health_of};
