//! 设备定义
//!
//! 设备在注册时一次性给出，生命周期内不可变（运行期健康状态除外）。
//! 配置文件的读取与解析在核心之外完成，这里只消费已经结构化的定义。

use crate::error::ConfigError;
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 设备唯一标识
pub type DeviceId = String;

/// 协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    #[serde(rename = "modbus-tcp")]
    ModbusTcp,
    #[serde(rename = "modbus-rtu")]
    ModbusRtu,
    #[serde(rename = "opc-ua")]
    OpcUa,
    #[serde(rename = "mqtt")]
    Mqtt,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModbusTcp => "modbus-tcp",
            Self::ModbusRtu => "modbus-rtu",
            Self::OpcUa => "opc-ua",
            Self::Mqtt => "mqtt",
        }
    }

    pub fn is_modbus(&self) -> bool {
        matches!(self, Self::ModbusTcp | Self::ModbusRtu)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "modbus-tcp" | "modbus_tcp" => Ok(Self::ModbusTcp),
            "modbus-rtu" | "modbus_rtu" => Ok(Self::ModbusRtu),
            "opc-ua" | "opc_ua" | "opcua" => Ok(Self::OpcUa),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

/// 连接参数（对核心不透明，原样交给传输工厂）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    /// TCP 主机与端口（Modbus TCP）
    Tcp { host: String, port: u16 },
    /// 串口（Modbus RTU）
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// 端点 URL（OPC UA，例如 `opc.tcp://10.0.0.5:4840`）
    Endpoint { url: String },
    /// MQTT broker
    Broker {
        host: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Modbus 数据区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusTable {
    /// 线圈 (0x01 / 0x05)
    Coil,
    /// 离散输入 (0x02)，只读
    DiscreteInput,
    /// 保持寄存器 (0x03 / 0x10)
    HoldingRegister,
    /// 输入寄存器 (0x04)，只读
    InputRegister,
}

impl Default for ModbusTable {
    fn default() -> Self {
        Self::HoldingRegister
    }
}

impl ModbusTable {
    /// 位类数据区（线圈、离散输入）
    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }
}

/// 多寄存器数值的字序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// 高字在前（ABCD）
    #[default]
    BigEndian,
    /// 低字在前（CDAB）
    LittleEndian,
}

/// 协议地址描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum TagAddress {
    Modbus {
        #[serde(default)]
        table: ModbusTable,
        address: u16,
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        #[serde(default)]
        word_order: WordOrder,
    },
    OpcUa {
        /// 节点 ID（例如 `ns=2;s=Pump.Speed`）
        node_id: String,
    },
    Mqtt {
        /// 状态主题（读取 / 订阅）
        topic: String,
        /// 命令主题（写入），缺省时写回状态主题
        #[serde(default)]
        command_topic: Option<String>,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
}

fn default_unit_id() -> u8 {
    1
}

/// 读写权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// 点位定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSpec {
    pub address: TagAddress,
    pub data_type: DataType,
    #[serde(default)]
    pub access: Access,
}

impl TagSpec {
    pub fn new(address: TagAddress, data_type: DataType) -> Self {
        Self {
            address,
            data_type,
            access: Access::ReadWrite,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }
}

/// 设备定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub protocol: ProtocolKind,
    pub params: ConnectionParams,
    #[serde(default)]
    pub tags: BTreeMap<String, TagSpec>,
    /// 轮询订阅间隔覆盖（毫秒），仅对纯轮询协议生效
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, protocol: ProtocolKind, params: ConnectionParams) -> Self {
        Self {
            id: id.into(),
            protocol,
            params,
            tags: BTreeMap::new(),
            poll_interval_ms: None,
            description: None,
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, spec: TagSpec) -> Self {
        self.tags.insert(name.into(), spec);
        self
    }

    pub fn tag(&self, name: &str) -> Option<&TagSpec> {
        self.tags.get(name)
    }

    /// 校验设备定义与点位表是否自洽。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("device id must not be empty".to_string()));
        }
        for (name, spec) in &self.tags {
            validate_tag(self.protocol, name, spec)?;
        }
        Ok(())
    }
}

fn validate_tag(protocol: ProtocolKind, name: &str, spec: &TagSpec) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTag {
        tag: name.to_string(),
        reason: reason.to_string(),
    };

    match (&spec.address, protocol) {
        (TagAddress::Modbus { table, .. }, p) if p.is_modbus() => {
            if table.is_bit() && spec.data_type != DataType::Bool {
                return Err(invalid("coil and discrete input tags must be bool"));
            }
            if !table.is_bit()
                && matches!(
                    spec.data_type,
                    DataType::Bool | DataType::String | DataType::Bytes
                )
            {
                return Err(invalid("register tags must be numeric"));
            }
            Ok(())
        }
        (TagAddress::OpcUa { node_id }, ProtocolKind::OpcUa) => {
            if node_id.trim().is_empty() {
                return Err(invalid("node_id must not be empty"));
            }
            Ok(())
        }
        (TagAddress::Mqtt { topic, qos, .. }, ProtocolKind::Mqtt) => {
            if topic.trim().is_empty() {
                return Err(invalid("topic must not be empty"));
            }
            if topic.contains(['+', '#']) {
                return Err(invalid("tag topic must not contain wildcards"));
            }
            if *qos > 2 {
                return Err(invalid("qos must be 0, 1 or 2"));
            }
            Ok(())
        }
        _ => Err(invalid(&format!(
            "address kind does not match protocol {}",
            protocol
        ))),
    }
}
