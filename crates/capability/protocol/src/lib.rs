//! # 协议传输能力模块
//!
//! 设备连接之下的最底层：把协议客户端抽象为 [`Transport`]，核心只依赖
//! `open` / `close` / `call` 三个原语，字节级编码留在各实现内部。
//!
//! - **Transport**：传输能力 trait，以及 Modbus / OPC UA / MQTT 的请求响应类型
//! - **Modbus TCP / RTU**：基于 tokio-modbus 的客户端实现，RTU 经 tokio-serial 打开串口
//! - **MQTT**：基于 rumqttc 的 broker 会话实现（最新值缓存 + 主题推送）
//! - **编解码**：Modbus 寄存器与 MQTT 负载到类型化值的转换
//! - **内存实现**：测试用的 Modbus 从站、OPC UA 服务端、MQTT broker
//!
//! ## 架构设计
//!
//! ```text
//! Adapter (tag → 协议地址)
//!       │  ModbusRequest / OpcUaRequest / MqttRequest
//!       ▼
//! DeviceConnection (串行化、超时、重连)
//!       │
//!       ▼
//! Transport
//!       ├── ModbusTcpTransport / ModbusRtuTransport
//!       ├── MqttTransport
//!       └── InMemoryModbus / InMemoryOpcUa / InMemoryMqtt
//! ```

mod error;
pub mod in_memory;
mod modbus_client;
pub mod modbus_codec;
mod modbus_rtu;
mod modbus_tcp;
mod mqtt;
pub mod mqtt_codec;
mod transport;

pub use error::{CodecError, TransportError};
pub use modbus_rtu::{ModbusRtuConfig, ModbusRtuTransport};
pub use modbus_tcp::{ModbusTcpConfig, ModbusTcpTransport};
pub use mqtt::{MqttConfig, MqttTransport};
pub use transport::*;
