//! 内存 MQTT broker（回环）

use super::probe::LinkProbe;
use crate::error::TransportError;
use crate::transport::{MqttRequest, MqttResponse, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// 已发布的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct Broker {
    latest: HashMap<String, Vec<u8>>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    published: Vec<PublishedMessage>,
}

impl Broker {
    fn route(&mut self, topic: &str, payload: Vec<u8>) {
        if let Some(senders) = self.watchers.get_mut(topic) {
            senders.retain(|sender| sender.send(payload.clone()).is_ok());
        }
        self.latest.insert(topic.to_string(), payload);
    }
}

/// 内存 MQTT broker，发布的消息回环给同主题的订阅方
#[derive(Debug, Default)]
pub struct InMemoryMqtt {
    probe: LinkProbe,
    broker: Mutex<Broker>,
}

impl InMemoryMqtt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> &LinkProbe {
        &self.probe
    }

    fn with<R>(&self, f: impl FnOnce(&mut Broker) -> R) -> R {
        let mut broker = self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut broker)
    }

    /// 模拟设备侧上报
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let payload = payload.into();
        self.with(|broker| broker.route(topic, payload));
    }

    /// 模拟 broker 侧会话中断：链路失效，所有订阅方被断开
    pub fn drop_session(&self) {
        self.probe.drop_link();
        self.with(|broker| broker.watchers.clear());
    }

    /// 当前仍在接收的订阅方数量
    pub fn watcher_count(&self) -> usize {
        self.with(|broker| {
            broker
                .watchers
                .values()
                .flatten()
                .filter(|sender| !sender.is_closed())
                .count()
        })
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.with(|broker| broker.published.clone())
    }

    fn apply(&self, request: MqttRequest) -> Result<MqttResponse, TransportError> {
        self.with(|broker| match request {
            MqttRequest::Latest { topic } => {
                Ok(MqttResponse::Payload(broker.latest.get(&topic).cloned()))
            }
            MqttRequest::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                broker.published.push(PublishedMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    qos,
                    retain,
                });
                broker.route(&topic, payload);
                Ok(MqttResponse::Published)
            }
            MqttRequest::Watch { topic } => {
                let (sender, receiver) = mpsc::unbounded_channel();
                broker.watchers.entry(topic).or_default().push(sender);
                Ok(MqttResponse::Watching(receiver))
            }
        })
    }
}

#[async_trait]
impl Transport for InMemoryMqtt {
    type Request = MqttRequest;
    type Response = MqttResponse;

    async fn open(&self) -> Result<(), TransportError> {
        self.probe.open().await
    }

    async fn close(&self) {
        self.probe.close();
        self.with(|broker| broker.watchers.clear());
    }

    async fn call(&self, request: MqttRequest) -> Result<MqttResponse, TransportError> {
        self.probe.call(|| self.apply(request)).await
    }
}
