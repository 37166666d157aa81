//! 设备注册表
//!
//! 注册表是设备连接的唯一所有者。调用方通过 [`Registry::lookup`] 取得
//! 一次性快照，不应跨操作缓存其中的连接句柄。

use crate::factory::TransportFactory;
use domain::{
    ConfigError, DeviceConfig, DeviceId, Health, NotFoundError, ProtocolKind,
};
use imcp_adapter::{Adapter, ModbusAdapter, MqttAdapter, OpcUaAdapter};
use imcp_config::{ConcurrencyConfig, GatewayConfig, ReconnectConfig};
use imcp_connection::{
    ConnectionPolicy, ConnectionState, DeviceConnection, LinkControl, LinkStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// 注册表参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrySettings {
    pub reconnect: ReconnectConfig,
    pub concurrency: ConcurrencyConfig,
    /// 轮询订阅默认间隔，也是监控项 / 主题订阅的重建间隔
    pub poll_interval: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            reconnect: config.reconnect,
            concurrency: config.concurrency,
            poll_interval: config.poll_interval,
        }
    }

    /// 协议对应的连接策略
    pub fn policy_for(&self, protocol: ProtocolKind) -> ConnectionPolicy {
        let concurrency = match protocol {
            ProtocolKind::ModbusTcp | ProtocolKind::ModbusRtu => self.concurrency.modbus,
            ProtocolKind::OpcUa => self.concurrency.opcua,
            ProtocolKind::Mqtt => self.concurrency.mqtt,
        };
        ConnectionPolicy::from_config(&self.reconnect, concurrency)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// 注册表条目快照
#[derive(Clone)]
pub struct RegistryEntry {
    pub device: Arc<DeviceConfig>,
    pub adapter: Arc<dyn Adapter>,
    pub connection: Arc<dyn LinkControl>,
    pub health: Health,
}

impl RegistryEntry {
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("device_id", &self.device.id)
            .field("protocol", &self.device.protocol)
            .field("state", &self.connection.state())
            .field("health", &self.health)
            .finish()
    }
}

/// 连接状态到健康状态的映射
///
/// 首次握手尚未完成（Connecting 且无失败）仍视为 Healthy。
pub fn health_of(status: &LinkStatus) -> Health {
    match status.state {
        ConnectionState::Disconnected | ConnectionState::Connected => Health::Healthy,
        ConnectionState::Connecting if status.consecutive_failures == 0 => Health::Healthy,
        ConnectionState::Connecting | ConnectionState::Reconnecting => Health::Degraded,
        ConnectionState::Unreachable | ConnectionState::Closed => Health::Unreachable,
    }
}

struct Slot {
    device: Arc<DeviceConfig>,
    adapter: Arc<dyn Adapter>,
    connection: Arc<dyn LinkControl>,
}

impl Slot {
    fn snapshot(&self) -> RegistryEntry {
        RegistryEntry {
            device: Arc::clone(&self.device),
            adapter: Arc::clone(&self.adapter),
            connection: Arc::clone(&self.connection),
            health: health_of(&self.connection.status()),
        }
    }
}

/// 设备注册表
///
/// 每个实例独立持有自己的设备集合，生命周期由调用方显式管理：
/// 启动时构造，退出前调用 [`Registry::shutdown`] 排空在途操作。
pub struct Registry {
    entries: RwLock<HashMap<DeviceId, Slot>>,
    factory: Arc<dyn TransportFactory>,
    settings: RegistrySettings,
}

impl Registry {
    pub fn new(factory: Arc<dyn TransportFactory>, settings: RegistrySettings) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            factory,
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// 注册设备。
    ///
    /// 校验定义、构造适配器与连接、写入注册表，然后在后台发起握手；
    /// 调用方任务上不发生任何线上 I/O。
    pub async fn register(&self, device: DeviceConfig) -> Result<DeviceId, ConfigError> {
        device.validate()?;
        if self.contains(&device.id) {
            return Err(ConfigError::DuplicateDevice(device.id));
        }

        let device = Arc::new(device);
        let slot = self.assemble(&device)?;
        {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // 构造期间可能有并发注册抢先写入
            if entries.contains_key(&device.id) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
            slot.connection.start();
            entries.insert(device.id.clone(), slot);
        }

        info!(
            target: "imcp.registry",
            device_id = %device.id,
            protocol = %device.protocol,
            tags = device.tags.len(),
            "device_registered"
        );
        Ok(device.id.clone())
    }

    fn assemble(&self, device: &Arc<DeviceConfig>) -> Result<Slot, ConfigError> {
        let policy = self.settings.policy_for(device.protocol);
        let interval = self.settings.poll_interval;
        let device_id = device.id.clone();

        let (adapter, connection): (Arc<dyn Adapter>, Arc<dyn LinkControl>) =
            match device.protocol {
                ProtocolKind::ModbusTcp | ProtocolKind::ModbusRtu => {
                    let link = self.factory.modbus(device)?;
                    let connection = DeviceConnection::new(device_id, link, policy);
                    (
                        Arc::new(ModbusAdapter::new(
                            Arc::clone(device),
                            connection.clone(),
                            interval,
                        )),
                        Arc::new(connection),
                    )
                }
                ProtocolKind::OpcUa => {
                    let link = self.factory.opcua(device)?;
                    let connection = DeviceConnection::new(device_id, link, policy);
                    (
                        Arc::new(OpcUaAdapter::new(
                            Arc::clone(device),
                            connection.clone(),
                            interval,
                        )),
                        Arc::new(connection),
                    )
                }
                ProtocolKind::Mqtt => {
                    let link = self.factory.mqtt(device)?;
                    let connection = DeviceConnection::new(device_id, link, policy);
                    (
                        Arc::new(MqttAdapter::new(
                            Arc::clone(device),
                            connection.clone(),
                            interval,
                        )),
                        Arc::new(connection),
                    )
                }
            };

        Ok(Slot {
            device: Arc::clone(device),
            adapter,
            connection,
        })
    }

    /// 注销设备：先从注册表移除，再取消订阅并排空关闭连接
    pub async fn deregister(&self, device_id: &str) -> Result<(), NotFoundError> {
        let slot = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(device_id)
            .ok_or_else(|| NotFoundError::new(device_id))?;

        release(slot).await;
        info!(
            target: "imcp.registry",
            device_id = %device_id,
            "device_deregistered"
        );
        Ok(())
    }

    pub fn lookup(&self, device_id: &str) -> Result<RegistryEntry, NotFoundError> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .map(Slot::snapshot)
            .ok_or_else(|| NotFoundError::new(device_id))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(device_id)
    }

    /// 当前时刻的健康快照（按设备 ID 排序）
    pub fn list_health(&self) -> impl Iterator<Item = (DeviceId, Health)> + use<> {
        let mut health: Vec<(DeviceId, Health)> = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, slot)| (id.clone(), health_of(&slot.connection.status())))
            .collect();
        health.sort_by(|a, b| a.0.cmp(&b.0));
        health.into_iter()
    }

    /// 人工复位 Unreachable 设备，返回是否生效
    pub fn reset(&self, device_id: &str) -> Result<bool, NotFoundError> {
        let entry = self.lookup(device_id)?;
        Ok(entry.connection.reset())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 注销全部设备并排空在途操作，返回注销数量
    pub async fn shutdown(&self) -> usize {
        let slots: Vec<Slot> = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let count = slots.len();

        let mut closing = tokio::task::JoinSet::new();
        for slot in slots {
            closing.spawn(release(slot));
        }
        while let Some(result) = closing.join_next().await {
            if let Err(err) = result {
                warn!(target: "imcp.registry", error = %err, "device_release_failed");
            }
        }

        info!(target: "imcp.registry", devices = count, "registry_shutdown");
        count
    }
}

async fn release(slot: Slot) {
    let cancelled = slot.adapter.cancel_all();
    if cancelled > 0 {
        info!(
            target: "imcp.registry",
            device_id = %slot.device.id,
            subscriptions = cancelled,
            "subscriptions_cancelled"
        );
    }
    slot.connection.close().await;
}
