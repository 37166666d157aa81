//! Modbus 适配器
//!
//! 寄存器个数与解释方式由点位声明类型决定；Modbus 没有推送能力，
//! 订阅以固定间隔轮询并只在值变化时回调。

use crate::subscription::{ChangeFilter, SubscriptionSet, notify};
use crate::{Adapter, AdapterError, SubscriptionHandle, checked_value, tag_spec};
use async_trait::async_trait;
use domain::{
    ChangeCallback, DataType, DeviceConfig, ModbusTable, ProtocolKind, TagAddress, TagValue,
    WordOrder,
};
use imcp_connection::DeviceConnection;
use imcp_protocol::modbus_codec::{decode_registers, encode_registers, register_count};
use imcp_protocol::{ModbusLink, ModbusRequest, ModbusResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// 已解析的 Modbus 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModbusPoint {
    table: ModbusTable,
    address: u16,
    unit_id: u8,
    word_order: WordOrder,
    data_type: DataType,
}

/// Modbus 适配器
pub struct ModbusAdapter {
    device: Arc<DeviceConfig>,
    connection: DeviceConnection<ModbusLink>,
    poll_interval: Duration,
    subscriptions: SubscriptionSet,
}

impl ModbusAdapter {
    /// `default_poll_interval` 可被设备定义的 `poll_interval_ms` 覆盖
    pub fn new(
        device: Arc<DeviceConfig>,
        connection: DeviceConnection<ModbusLink>,
        default_poll_interval: Duration,
    ) -> Self {
        let poll_interval = device
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default_poll_interval)
            .max(Duration::from_millis(1));
        Self {
            device,
            connection,
            poll_interval,
            subscriptions: SubscriptionSet::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn point(&self, tag: &str) -> Result<ModbusPoint, AdapterError> {
        let spec = tag_spec(&self.device, tag)?;
        match spec.address {
            TagAddress::Modbus {
                table,
                address,
                unit_id,
                word_order,
            } => Ok(ModbusPoint {
                table,
                address,
                unit_id,
                word_order,
                data_type: spec.data_type,
            }),
            _ => Err(AdapterError::UnknownTag(tag.to_string())),
        }
    }
}

async fn read_point(
    connection: &DeviceConnection<ModbusLink>,
    point: ModbusPoint,
) -> Result<TagValue, AdapterError> {
    let count = if point.table.is_bit() {
        1
    } else {
        register_count(point.data_type).ok_or_else(|| {
            AdapterError::ProtocolFault(format!(
                "{} cannot be read from {:?}",
                point.data_type, point.table
            ))
        })?
    };

    let request = ModbusRequest::read(point.table, point.unit_id, point.address, count);
    match connection.perform(request).await? {
        ModbusResponse::Bits(bits) => bits
            .first()
            .copied()
            .map(TagValue::Bool)
            .ok_or_else(|| AdapterError::ProtocolFault("empty bit response".to_string())),
        ModbusResponse::Registers(registers) => {
            Ok(decode_registers(&registers, point.data_type, point.word_order)?)
        }
        ModbusResponse::Written => Err(AdapterError::ProtocolFault(
            "unexpected write acknowledgement".to_string(),
        )),
    }
}

#[async_trait]
impl Adapter for ModbusAdapter {
    fn protocol(&self) -> ProtocolKind {
        self.device.protocol
    }

    async fn read(&self, tag: &str) -> Result<TagValue, AdapterError> {
        let point = self.point(tag)?;
        read_point(&self.connection, point).await
    }

    async fn write(&self, tag: &str, value: TagValue) -> Result<(), AdapterError> {
        let point = self.point(tag)?;
        let spec = tag_spec(&self.device, tag)?;
        if !point.table.is_writable() {
            return Err(AdapterError::NotWritable(tag.to_string()));
        }
        let value = checked_value(tag, spec, &value)?;

        let request = match (point.table, &value) {
            (ModbusTable::Coil, TagValue::Bool(on)) => ModbusRequest::WriteSingleCoil {
                unit_id: point.unit_id,
                address: point.address,
                value: *on,
            },
            // 多寄存器值一次写入，不拆分
            _ => ModbusRequest::WriteMultipleRegisters {
                unit_id: point.unit_id,
                address: point.address,
                values: encode_registers(&value, point.word_order)?,
            },
        };

        match self.connection.perform(request).await? {
            ModbusResponse::Written => Ok(()),
            other => Err(AdapterError::ProtocolFault(format!(
                "unexpected write response: {:?}",
                other
            ))),
        }
    }

    async fn subscribe(
        &self,
        tag: &str,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let point = self.point(tag)?;
        let connection = self.connection.clone();
        let interval = self.poll_interval;
        let device_id = self.device.id.clone();
        let tag_name = tag.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut filter = ChangeFilter::default();
            loop {
                ticker.tick().await;
                match read_point(&connection, point).await {
                    Ok(value) => {
                        if filter.changed(&value) {
                            notify(&on_change, &device_id, &tag_name, value);
                        }
                    }
                    Err(err) => {
                        debug!(
                            target: "imcp.adapter",
                            device_id = %device_id,
                            tag = %tag_name,
                            error = %err,
                            "poll_failed"
                        );
                    }
                }
            }
        });

        let handle = self.subscriptions.track(&self.device.id, tag, task);
        info!(
            target: "imcp.adapter",
            device_id = %self.device.id,
            tag = %tag,
            interval_ms = interval.as_millis() as u64,
            subscription_id = %handle.id(),
            "poll_subscription_started"
        );
        Ok(handle)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.subscriptions.remove(handle);
    }

    fn cancel_all(&self) -> usize {
        self.subscriptions.cancel_all()
    }

    fn active_subscriptions(&self) -> usize {
        self.subscriptions.active()
    }
}
