//! 传输能力抽象
//!
//! 每种协议的底层客户端（Modbus 客户端、OPC UA 会话、MQTT 会话）都以
//! [`Transport`] 的形式注入，核心只依赖 `open` / `close` / `call` 三个原语。

use crate::error::TransportError;
use async_trait::async_trait;
use domain::{ModbusTable, TagValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// 协议传输能力
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Request: Send + fmt::Debug + 'static;
    type Response: Send + 'static;

    /// 建立会话（握手）
    async fn open(&self) -> Result<(), TransportError>;

    /// 释放会话句柄，可重复调用
    async fn close(&self);

    /// 单次请求 / 响应
    async fn call(&self, request: Self::Request) -> Result<Self::Response, TransportError>;
}

/// Modbus 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { unit_id: u8, address: u16, count: u16 },
    ReadDiscreteInputs { unit_id: u8, address: u16, count: u16 },
    ReadHoldingRegisters { unit_id: u8, address: u16, count: u16 },
    ReadInputRegisters { unit_id: u8, address: u16, count: u16 },
    WriteSingleCoil { unit_id: u8, address: u16, value: bool },
    /// 多寄存器值整体写入（功能码 0x10），不拆分
    WriteMultipleRegisters { unit_id: u8, address: u16, values: Vec<u16> },
}

impl ModbusRequest {
    /// 按数据区构造读请求
    pub fn read(table: ModbusTable, unit_id: u8, address: u16, count: u16) -> Self {
        match table {
            ModbusTable::Coil => Self::ReadCoils { unit_id, address, count },
            ModbusTable::DiscreteInput => Self::ReadDiscreteInputs { unit_id, address, count },
            ModbusTable::HoldingRegister => Self::ReadHoldingRegisters { unit_id, address, count },
            ModbusTable::InputRegister => Self::ReadInputRegisters { unit_id, address, count },
        }
    }
}

/// Modbus 响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
    Written,
}

/// OPC UA 地址空间根节点
pub const OPCUA_ROOT_NODE: &str = "i=84";

/// 地址空间中的节点描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub namespace: u16,
}

impl NodeInfo {
    /// 以节点 ID 的标识符部分作为浏览名和显示名
    pub fn from_node_id(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let name = node_identifier(&node_id).to_string();
        Self {
            namespace: node_namespace(&node_id),
            browse_name: name.clone(),
            display_name: name,
            node_id,
        }
    }
}

/// `ns=2;s=Level` 中的命名空间索引，缺省为 0
pub fn node_namespace(node_id: &str) -> u16 {
    node_id
        .strip_prefix("ns=")
        .and_then(|rest| rest.split(';').next())
        .and_then(|index| index.parse().ok())
        .unwrap_or(0)
}

/// `ns=2;s=Level` 中的标识符部分
pub fn node_identifier(node_id: &str) -> &str {
    node_id
        .rsplit(';')
        .next()
        .and_then(|part| part.split_once('='))
        .map(|(_, identifier)| identifier)
        .unwrap_or(node_id)
}

/// OPC UA 请求
#[derive(Debug, Clone, PartialEq)]
pub enum OpcUaRequest {
    Read { node_id: String },
    Write { node_id: String, value: TagValue },
    /// 建立监控项，数据变化通过返回的通道推送
    Monitor {
        node_id: String,
        sampling_interval: Duration,
    },
    /// 列出子节点，`None` 为根节点
    Browse { node_id: Option<String> },
    NodeInfo { node_id: String },
}

/// OPC UA 响应
#[derive(Debug)]
pub enum OpcUaResponse {
    /// 服务端原生类型的值，由适配器按声明类型收敛
    Value(TagValue),
    Written,
    Monitored(mpsc::UnboundedReceiver<TagValue>),
    Children(Vec<NodeInfo>),
    Node(NodeInfo),
}

/// MQTT 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttRequest {
    /// 主题最近一次收到的负载
    Latest { topic: String },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
    /// 订阅主题的后续消息
    Watch { topic: String },
}

/// MQTT 响应
#[derive(Debug)]
pub enum MqttResponse {
    Payload(Option<Vec<u8>>),
    Published,
    Watching(mpsc::UnboundedReceiver<Vec<u8>>),
}

/// Modbus 传输（TCP / RTU 共用）
pub type ModbusLink = dyn Transport<Request = ModbusRequest, Response = ModbusResponse>;

/// OPC UA 传输
pub type OpcUaLink = dyn Transport<Request = OpcUaRequest, Response = OpcUaResponse>;

/// MQTT 传输
pub type MqttLink = dyn Transport<Request = MqttRequest, Response = MqttResponse>;
