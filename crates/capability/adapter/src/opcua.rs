//! OPC UA 适配器
//!
//! 服务端返回原生类型的值，按点位声明类型收敛；收敛失败视为协议故障。
//! 订阅使用服务端监控项，会话重建后自动重新建立。
//! 浏览与节点信息直接按节点 ID 访问地址空间，不经过点位表。

use crate::subscription::{ChangeFilter, SubscriptionSet, notify};
use crate::{Adapter, AdapterError, NodeBrowser, SubscriptionHandle, checked_value, tag_spec};
use async_trait::async_trait;
use domain::{ChangeCallback, DataType, DeviceConfig, ProtocolKind, TagAddress, TagValue};
use imcp_connection::DeviceConnection;
use imcp_protocol::{NodeInfo, OpcUaLink, OpcUaRequest, OpcUaResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// OPC UA 适配器
pub struct OpcUaAdapter {
    device: Arc<DeviceConfig>,
    connection: DeviceConnection<OpcUaLink>,
    sampling_interval: Duration,
    subscriptions: SubscriptionSet,
}

impl OpcUaAdapter {
    pub fn new(
        device: Arc<DeviceConfig>,
        connection: DeviceConnection<OpcUaLink>,
        default_sampling_interval: Duration,
    ) -> Self {
        let sampling_interval = device
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default_sampling_interval)
            .max(Duration::from_millis(1));
        Self {
            device,
            connection,
            sampling_interval,
            subscriptions: SubscriptionSet::new(),
        }
    }

    fn node(&self, tag: &str) -> Result<(String, DataType), AdapterError> {
        let spec = tag_spec(&self.device, tag)?;
        match &spec.address {
            TagAddress::OpcUa { node_id } => Ok((node_id.clone(), spec.data_type)),
            _ => Err(AdapterError::UnknownTag(tag.to_string())),
        }
    }
}

/// 原生值收敛到声明类型
fn converge(node_id: &str, data_type: DataType, raw: &TagValue) -> Result<TagValue, AdapterError> {
    data_type.coerce(raw).map_err(|err| {
        AdapterError::ProtocolFault(format!("node {} returned {}", node_id, err))
    })
}

async fn monitor(
    connection: &DeviceConnection<OpcUaLink>,
    node_id: &str,
    sampling_interval: Duration,
) -> Result<mpsc::UnboundedReceiver<TagValue>, AdapterError> {
    let request = OpcUaRequest::Monitor {
        node_id: node_id.to_string(),
        sampling_interval,
    };
    match connection.perform(request).await? {
        OpcUaResponse::Monitored(receiver) => Ok(receiver),
        _ => Err(AdapterError::ProtocolFault(
            "unexpected monitor response".to_string(),
        )),
    }
}

#[async_trait]
impl Adapter for OpcUaAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::OpcUa
    }

    async fn read(&self, tag: &str) -> Result<TagValue, AdapterError> {
        let (node_id, data_type) = self.node(tag)?;
        let request = OpcUaRequest::Read {
            node_id: node_id.clone(),
        };
        match self.connection.perform(request).await? {
            OpcUaResponse::Value(raw) => converge(&node_id, data_type, &raw),
            _ => Err(AdapterError::ProtocolFault(
                "unexpected read response".to_string(),
            )),
        }
    }

    async fn write(&self, tag: &str, value: TagValue) -> Result<(), AdapterError> {
        let (node_id, _) = self.node(tag)?;
        let spec = tag_spec(&self.device, tag)?;
        let value = checked_value(tag, spec, &value)?;

        match self
            .connection
            .perform(OpcUaRequest::Write { node_id, value })
            .await?
        {
            OpcUaResponse::Written => Ok(()),
            _ => Err(AdapterError::ProtocolFault(
                "unexpected write response".to_string(),
            )),
        }
    }

    async fn subscribe(
        &self,
        tag: &str,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let (node_id, data_type) = self.node(tag)?;
        let sampling_interval = self.sampling_interval;
        // 首次建立失败直接返回给调用方
        let mut receiver = monitor(&self.connection, &node_id, sampling_interval).await?;

        let connection = self.connection.clone();
        let device_id = self.device.id.clone();
        let tag_name = tag.to_string();
        let task = tokio::spawn(async move {
            let mut filter = ChangeFilter::default();
            loop {
                while let Some(raw) = receiver.recv().await {
                    match converge(&node_id, data_type, &raw) {
                        Ok(value) => {
                            if filter.changed(&value) {
                                notify(&on_change, &device_id, &tag_name, value);
                            }
                        }
                        Err(err) => warn!(
                            target: "imcp.adapter",
                            device_id = %device_id,
                            tag = %tag_name,
                            error = %err,
                            "monitored_value_rejected"
                        ),
                    }
                }

                // 会话断开后监控项失效，等待链路恢复重新建立
                receiver = loop {
                    tokio::time::sleep(sampling_interval).await;
                    match monitor(&connection, &node_id, sampling_interval).await {
                        Ok(receiver) => break receiver,
                        Err(err) => debug!(
                            target: "imcp.adapter",
                            device_id = %device_id,
                            tag = %tag_name,
                            error = %err,
                            "monitor_reestablish_failed"
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
            "monitored_item_created"
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

    fn browser(&self) -> Option<&dyn NodeBrowser> {
        Some(self)
    }
}

#[async_trait]
impl NodeBrowser for OpcUaAdapter {
    async fn browse(&self, node_id: Option<&str>) -> Result<Vec<NodeInfo>, AdapterError> {
        let request = OpcUaRequest::Browse {
            node_id: node_id.map(str::to_string),
        };
        match self.connection.perform(request).await? {
            OpcUaResponse::Children(children) => {
                debug!(
                    target: "imcp.adapter",
                    device_id = %self.device.id,
                    node_id = node_id.unwrap_or("root"),
                    children = children.len(),
                    "nodes_browsed"
                );
                Ok(children)
            }
            _ => Err(AdapterError::ProtocolFault(
                "unexpected browse response".to_string(),
            )),
        }
    }

    async fn node_info(&self, node_id: &str) -> Result<NodeInfo, AdapterError> {
        let request = OpcUaRequest::NodeInfo {
            node_id: node_id.to_string(),
        };
        match self.connection.perform(request).await? {
            OpcUaResponse::Node(info) => Ok(info),
            _ => Err(AdapterError::ProtocolFault(
                "unexpected node info response".to_string(),
            )),
        }
    }
}
