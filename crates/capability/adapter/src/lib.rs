//! # 协议适配能力模块
//!
//! 把 Modbus / OPC UA / MQTT 统一成一个 read / write / subscribe 契约：
//! - 点位名到协议地址的解析只发生在适配器内部
//! - 写入先按声明类型校验，不合法的值不会产生线上 I/O
//! - 没有原生推送的协议（Modbus）用轮询 + 变化检测模拟订阅
//! - 有地址空间的协议（OPC UA）另外通过 [`NodeBrowser`] 提供节点浏览
//!
//! ## 架构设计
//!
//! ```text
//! Dispatcher
//!       │  read / write / subscribe (tag)
//!       ▼
//! Adapter
//!       ├── ModbusAdapter  ─ 寄存器编解码、轮询订阅
//!       ├── OpcUaAdapter   ─ 原生值收敛、监控项订阅
//!       └── MqttAdapter    ─ 负载解析、主题订阅
//!       │  协议请求
//!       ▼
//! DeviceConnection
//! ```

mod error;
mod modbus;
mod mqtt;
mod opcua;
mod subscription;

pub use error::AdapterError;
pub use modbus::ModbusAdapter;
pub use mqtt::MqttAdapter;
pub use opcua::OpcUaAdapter;
pub use imcp_protocol::NodeInfo;
pub use subscription::{SubscriptionHandle, SubscriptionSet};

use async_trait::async_trait;
use domain::{Access, ChangeCallback, DeviceConfig, ProtocolKind, TagSpec, TagValue};

/// 协议适配器
#[async_trait]
pub trait Adapter: Send + Sync {
    fn protocol(&self) -> ProtocolKind;

    async fn read(&self, tag: &str) -> Result<TagValue, AdapterError>;

    /// 值先按点位声明类型校验，失败返回 `TypeMismatch` 且不发起任何 I/O
    async fn write(&self, tag: &str, value: TagValue) -> Result<(), AdapterError>;

    /// 值变化时调用 `on_change`，直到句柄被取消
    async fn subscribe(
        &self,
        tag: &str,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, AdapterError>;

    /// 取消订阅（幂等）
    fn unsubscribe(&self, handle: &SubscriptionHandle);

    /// 取消全部订阅，设备移除时调用
    fn cancel_all(&self) -> usize;

    fn active_subscriptions(&self) -> usize;

    /// 节点浏览能力，协议没有地址空间时为 `None`
    fn browser(&self) -> Option<&dyn NodeBrowser> {
        None
    }
}

/// 地址空间浏览
#[async_trait]
pub trait NodeBrowser: Send + Sync {
    /// 列出子节点，`None` 为根节点
    async fn browse(&self, node_id: Option<&str>) -> Result<Vec<NodeInfo>, AdapterError>;

    async fn node_info(&self, node_id: &str) -> Result<NodeInfo, AdapterError>;
}

/// 点位定义
pub(crate) fn tag_spec<'a>(device: &'a DeviceConfig, tag: &str) -> Result<&'a TagSpec, AdapterError> {
    device
        .tag(tag)
        .ok_or_else(|| AdapterError::UnknownTag(tag.to_string()))
}

/// 写入前校验：权限 + 类型收敛
pub(crate) fn checked_value(
    tag: &str,
    spec: &TagSpec,
    value: &TagValue,
) -> Result<TagValue, AdapterError> {
    if spec.access == Access::ReadOnly {
        return Err(AdapterError::NotWritable(tag.to_string()));
    }
    spec.data_type
        .coerce(value)
        .map_err(|source| AdapterError::TypeMismatch {
            tag: tag.to_string(),
            source,
        })
}
