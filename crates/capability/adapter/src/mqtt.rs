//! MQTT 适配器
//!
//! 读取返回状态主题最近一次收到的负载；写入发布到命令主题（缺省为状态主题）。

use crate::subscription::{ChangeFilter, SubscriptionSet, notify};
use crate::{Adapter, AdapterError, SubscriptionHandle, checked_value, tag_spec};
use async_trait::async_trait;
use domain::{ChangeCallback, DataType, DeviceConfig, ProtocolKind, TagAddress, TagValue};
use imcp_connection::DeviceConnection;
use imcp_protocol::mqtt_codec::{decode_payload, encode_payload};
use imcp_protocol::{MqttLink, MqttRequest, MqttResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 已解析的主题配置
#[derive(Debug, Clone)]
struct TopicPoint {
    topic: String,
    command_topic: Option<String>,
    qos: u8,
    retain: bool,
    data_type: DataType,
}

/// MQTT 适配器
pub struct MqttAdapter {
    device: Arc<DeviceConfig>,
    connection: DeviceConnection<MqttLink>,
    resubscribe_interval: Duration,
    subscriptions: SubscriptionSet,
}

impl MqttAdapter {
    pub fn new(
        device: Arc<DeviceConfig>,
        connection: DeviceConnection<MqttLink>,
        resubscribe_interval: Duration,
    ) -> Self {
        Self {
            device,
            connection,
            resubscribe_interval: resubscribe_interval.max(Duration::from_millis(1)),
            subscriptions: SubscriptionSet::new(),
        }
    }

    fn point(&self, tag: &str) -> Result<TopicPoint, AdapterError> {
        let spec = tag_spec(&self.device, tag)?;
        match &spec.address {
            TagAddress::Mqtt {
                topic,
                command_topic,
                qos,
                retain,
            } => Ok(TopicPoint {
                topic: topic.clone(),
                command_topic: command_topic.clone(),
                qos: *qos,
                retain: *retain,
                data_type: spec.data_type,
            }),
            _ => Err(AdapterError::UnknownTag(tag.to_string())),
        }
    }
}

async fn watch(
    connection: &DeviceConnection<MqttLink>,
    topic: &str,
) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError> {
    let request = MqttRequest::Watch {
        topic: topic.to_string(),
    };
    match connection.perform(request).await? {
        MqttResponse::Watching(receiver) => Ok(receiver),
        _ => Err(AdapterError::ProtocolFault(
            "unexpected watch response".to_string(),
        )),
    }
}

#[async_trait]
impl Adapter for MqttAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Mqtt
    }

    async fn read(&self, tag: &str) -> Result<TagValue, AdapterError> {
        let point = self.point(tag)?;
        let request = MqttRequest::Latest {
            topic: point.topic.clone(),
        };
        match self.connection.perform(request).await? {
            MqttResponse::Payload(Some(payload)) => Ok(decode_payload(&payload, point.data_type)?),
            MqttResponse::Payload(None) => Err(AdapterError::ProtocolFault(format!(
                "no value received on topic {}",
                point.topic
            ))),
            _ => Err(AdapterError::ProtocolFault(
                "unexpected read response".to_string(),
            )),
        }
    }

    async fn write(&self, tag: &str, value: TagValue) -> Result<(), AdapterError> {
        let point = self.point(tag)?;
        let spec = tag_spec(&self.device, tag)?;
        let value = checked_value(tag, spec, &value)?;

        let request = MqttRequest::Publish {
            topic: point.command_topic.unwrap_or(point.topic),
            payload: encode_payload(&value),
            qos: point.qos,
            retain: point.retain,
        };
        match self.connection.perform(request).await? {
            MqttResponse::Published => Ok(()),
            _ => Err(AdapterError::ProtocolFault(
                "unexpected publish response".to_string(),
            )),
        }
    }

    async fn subscribe(
        &self,
        tag: &str,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let point = self.point(tag)?;
        let mut receiver = watch(&self.connection, &point.topic).await?;

        let connection = self.connection.clone();
        let retry = self.resubscribe_interval;
        let device_id = self.device.id.clone();
        let tag_name = tag.to_string();
        let task = tokio::spawn(async move {
            let mut filter = ChangeFilter::default();
            loop {
                while let Some(payload) = receiver.recv().await {
                    match decode_payload(&payload, point.data_type) {
                        Ok(value) => {
                            if filter.changed(&value) {
                                notify(&on_change, &device_id, &tag_name, value);
                            }
                        }
                        Err(err) => warn!(
                            target: "imcp.adapter",
                            device_id = %device_id,
                            tag = %tag_name,
                            topic = %point.topic,
                            error = %err,
                            "payload_rejected"
                        ),
                    }
                }

                // 会话重建后重新订阅
                receiver = loop {
                    tokio::time::sleep(retry).await;
                    match watch(&connection, &point.topic).await {
                        Ok(receiver) => break receiver,
                        Err(err) => debug!(
                            target: "imcp.adapter",
                            device_id = %device_id,
                            tag = %tag_name,
                            error = %err,
                            "resubscribe_failed"
                        ),
                    }
                };
            }
        });

        let handle = self.subscriptions.track(&self.device.id, tag, task);
        info!(
            target: "imcp.adapter",
            device_id = %self.device.id,
            tag = %tag,
            subscription_id = %handle.id(),
            "topic_subscription_started"
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
