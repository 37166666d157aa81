//! 传输工厂
//!
//! 注册表不直接创建协议客户端，而是按设备定义向工厂索取传输：
//! - [`NativeTransportFactory`]：内置的 Modbus TCP / RTU（tokio-modbus、tokio-serial）与 MQTT（rumqttc）
//! - [`StaticTransportFactory`]：预先注入的传输，按设备 ID 取用（测试与自定义编解码）

use domain::{ConfigError, ConnectionParams, DeviceConfig, DeviceId, ProtocolKind, TagAddress};
use imcp_protocol::{
    ModbusLink, ModbusRtuConfig, ModbusRtuTransport, ModbusTcpConfig, ModbusTcpTransport,
    MqttConfig, MqttLink, MqttTransport, OpcUaLink,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// 传输工厂
///
/// 只构造传输对象，不发起任何线上 I/O；握手由设备连接的监督任务完成。
pub trait TransportFactory: Send + Sync {
    fn modbus(&self, device: &DeviceConfig) -> Result<Arc<ModbusLink>, ConfigError>;

    fn opcua(&self, device: &DeviceConfig) -> Result<Arc<OpcUaLink>, ConfigError>;

    fn mqtt(&self, device: &DeviceConfig) -> Result<Arc<MqttLink>, ConfigError>;
}

fn unsupported(protocol: ProtocolKind, reason: &str) -> ConfigError {
    ConfigError::UnsupportedTransport {
        protocol: protocol.to_string(),
        reason: reason.to_string(),
    }
}

fn params_mismatch(device: &DeviceConfig) -> ConfigError {
    ConfigError::Invalid(format!(
        "connection params do not fit protocol {} for device {}",
        device.protocol, device.id
    ))
}

/// 内置传输
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTransportFactory;

impl NativeTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for NativeTransportFactory {
    fn modbus(&self, device: &DeviceConfig) -> Result<Arc<ModbusLink>, ConfigError> {
        match (device.protocol, &device.params) {
            (ProtocolKind::ModbusTcp, ConnectionParams::Tcp { host, port }) => {
                Ok(Arc::new(ModbusTcpTransport::new(ModbusTcpConfig {
                    host: host.clone(),
                    port: *port,
                })))
            }
            (ProtocolKind::ModbusRtu, ConnectionParams::Serial { path, baud_rate }) => {
                Ok(Arc::new(ModbusRtuTransport::new(ModbusRtuConfig {
                    path: path.clone(),
                    baud_rate: *baud_rate,
                })))
            }
            _ => Err(params_mismatch(device)),
        }
    }

    fn opcua(&self, _device: &DeviceConfig) -> Result<Arc<OpcUaLink>, ConfigError> {
        Err(unsupported(
            ProtocolKind::OpcUa,
            "no OPC UA client bundled, inject one through a custom factory",
        ))
    }

    fn mqtt(&self, device: &DeviceConfig) -> Result<Arc<MqttLink>, ConfigError> {
        let ConnectionParams::Broker {
            host,
            port,
            client_id,
            username,
            password,
        } = &device.params
        else {
            return Err(params_mismatch(device));
        };

        // 会话建立后预先订阅全部状态主题，读取时才有最新值
        let topics: BTreeSet<String> = device
            .tags
            .values()
            .filter_map(|spec| match &spec.address {
                TagAddress::Mqtt { topic, .. } => Some(topic.clone()),
                _ => None,
            })
            .collect();

        let mut config = MqttConfig::new(host.clone(), *port);
        config.client_id = client_id.clone();
        config.username = username.clone();
        config.password = password.clone();
        config.topics = topics.into_iter().collect();
        Ok(Arc::new(MqttTransport::new(config)))
    }
}

#[derive(Clone)]
enum StaticLink {
    Modbus(Arc<ModbusLink>),
    OpcUa(Arc<OpcUaLink>),
    Mqtt(Arc<MqttLink>),
}

/// 预先注入的传输
#[derive(Default)]
pub struct StaticTransportFactory {
    links: Mutex<HashMap<DeviceId, StaticLink>>,
}

impl StaticTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, device_id: impl Into<DeviceId>, link: StaticLink) {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device_id.into(), link);
    }

    fn get(&self, device: &DeviceConfig) -> Result<StaticLink, ConfigError> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&device.id)
            .cloned()
            .ok_or_else(|| unsupported(device.protocol, "no transport injected for device"))
    }

    pub fn insert_modbus(&self, device_id: impl Into<DeviceId>, link: Arc<ModbusLink>) {
        self.insert(device_id, StaticLink::Modbus(link));
    }

    pub fn insert_opcua(&self, device_id: impl Into<DeviceId>, link: Arc<OpcUaLink>) {
        self.insert(device_id, StaticLink::OpcUa(link));
    }

    pub fn insert_mqtt(&self, device_id: impl Into<DeviceId>, link: Arc<MqttLink>) {
        self.insert(device_id, StaticLink::Mqtt(link));
    }
}

impl TransportFactory for StaticTransportFactory {
    fn modbus(&self, device: &DeviceConfig) -> Result<Arc<ModbusLink>, ConfigError> {
        match self.get(device)? {
            StaticLink::Modbus(link) => Ok(link),
            _ => Err(params_mismatch(device)),
        }
    }

    fn opcua(&self, device: &DeviceConfig) -> Result<Arc<OpcUaLink>, ConfigError> {
        match self.get(device)? {
            StaticLink::OpcUa(link) => Ok(link),
            _ => Err(params_mismatch(device)),
        }
    }

    fn mqtt(&self, device: &DeviceConfig) -> Result<Arc<MqttLink>, ConfigError> {
        match self.get(device)? {
            StaticLink::Mqtt(link) => Ok(link),
            _ => Err(params_mismatch(device)),
        }
    }
}
