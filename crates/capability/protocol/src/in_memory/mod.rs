//! 内存传输实现
//!
//! 不触网的 Modbus 从站、OPC UA 服务端与 MQTT broker，用于测试与联调。
//! 每个实现都带一个 [`LinkProbe`]，可以注入握手失败、调用故障与线上耗时，
//! 并记录每次调用的起止时刻与最大在途数。

mod modbus;
mod mqtt;
mod opcua;
mod probe;

pub use modbus::InMemoryModbus;
pub use mqtt::{InMemoryMqtt, PublishedMessage};
pub use opcua::InMemoryOpcUa;
pub use probe::{CallRecord, LinkProbe, ScriptedFailure};
