//! MQTT 传输实现
//!
//! 基于 rumqttc 异步客户端。一个设备对应一个 broker 会话：
//! - 事件循环在后台任务中驱动，收到的消息写入最新值缓存并推送给订阅方
//! - 事件循环出错后会话标记为失效并断开所有订阅方，后续调用返回 `NotOpen`，
//!   由设备连接负责重建，订阅方在新会话上重新订阅
//!
//! ## 配置格式
//!
//! ```json
//! { "host": "broker.local", "port": 1883, "topics": ["plant/line1/temp"] }
//! ```

use crate::error::TransportError;
use crate::transport::{MqttRequest, MqttResponse, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// MQTT 会话配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// 缺省时自动生成 `imcp-{uuid}`
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 会话建立后立即订阅的主题
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: None,
            username: None,
            password: None,
            topics: Vec::new(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// 会话内共享的接收侧状态
#[derive(Default)]
struct Inbox {
    latest: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    watchers: std::sync::Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    alive: AtomicBool,
    /// 会话代次，旧事件循环的失败不影响新会话
    generation: AtomicU64,
}

impl Inbox {
    fn deliver(&self, topic: &str, payload: Vec<u8>) {
        if let Some(senders) = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(topic)
        {
            senders.retain(|sender| sender.send(payload.clone()).is_ok());
        }
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic.to_string(), payload);
    }

    fn latest(&self, topic: &str) -> Option<Vec<u8>> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .cloned()
    }

    fn watch(&self, topic: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    fn reset(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        // 丢弃发送端，订阅方的转发任务随之结束
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// 开启新会话，返回其代次
    fn begin(&self) -> u64 {
        self.reset();
        self.alive.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 事件循环失败：仅当仍是当前会话时失效
    fn fail(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.reset();
        true
    }
}

struct Session {
    client: AsyncClient,
    pump: JoinHandle<()>,
    subscribed: HashSet<String>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// MQTT 传输
pub struct MqttTransport {
    config: MqttConfig,
    session: Mutex<Option<Session>>,
    inbox: Arc<Inbox>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            inbox: Arc::new(Inbox::default()),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let config: MqttConfig =
            serde_json::from_str(json).map_err(|e| TransportError::ConfigParse(e.to_string()))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("imcp-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        if let (Some(username), Some(password)) =
            (self.config.username.as_ref(), self.config.password.as_ref())
        {
            options.set_credentials(username, password);
        }
        options
    }

    async fn ensure_subscribed(session: &mut Session, topic: &str) -> Result<(), TransportError> {
        if session.subscribed.contains(topic) {
            return Ok(());
        }
        session
            .client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        session.subscribed.insert(topic.to_string());
        debug!(target: "imcp.protocol", topic = %topic, "mqtt topic subscribed");
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Request = MqttRequest;
    type Response = MqttResponse;

    async fn open(&self) -> Result<(), TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 64);

        // 等待 ConnAck，握手超时由上层连接控制
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(err) => return Err(TransportError::Connection(err.to_string())),
            }
        }

        let mut guard = self.session.lock().await;
        // 旧会话的事件循环随 Session 析构中止
        drop(guard.take());
        let generation = self.inbox.begin();

        let pump = tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&self.inbox),
            generation,
        ));
        let mut session = Session {
            client,
            pump,
            subscribed: HashSet::new(),
        };
        for topic in &self.config.topics {
            Self::ensure_subscribed(&mut session, topic).await?;
        }
        *guard = Some(session);

        info!(
            target: "imcp.protocol",
            host = %self.config.host,
            port = self.config.port,
            topics = self.config.topics.len(),
            "connected to mqtt broker"
        );
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            let _ = session.client.disconnect().await;
            debug!(target: "imcp.protocol", host = %self.config.host, "mqtt session released");
        }
        self.inbox.reset();
    }

    async fn call(&self, request: MqttRequest) -> Result<MqttResponse, TransportError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(TransportError::NotOpen)?;
        if !self.inbox.alive.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }

        match request {
            MqttRequest::Latest { topic } => {
                Self::ensure_subscribed(session, &topic).await?;
                Ok(MqttResponse::Payload(self.inbox.latest(&topic)))
            }
            MqttRequest::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                session
                    .client
                    .publish(topic, qos_from_u8(qos), retain, payload)
                    .await
                    .map_err(|e| TransportError::Connection(e.to_string()))?;
                Ok(MqttResponse::Published)
            }
            MqttRequest::Watch { topic } => {
                Self::ensure_subscribed(session, &topic).await?;
                Ok(MqttResponse::Watching(self.inbox.watch(&topic)))
            }
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, inbox: Arc<Inbox>, generation: u64) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inbox.deliver(&publish.topic, publish.payload.to_vec());
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target: "imcp.protocol", "mqtt eventloop error: {}", err);
                inbox.fail(generation);
                return;
            }
        }
    }
}

fn qos_from_u8(value: u8) -> QoS {
    match value {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_with_defaults() {
        let transport =
            MqttTransport::from_json(r#"{"host": "broker.local", "topics": ["a/b"]}"#).unwrap();
        assert_eq!(transport.config().port, 1883);
        assert_eq!(transport.config().keep_alive_secs, 30);
        assert_eq!(transport.config().topics, vec!["a/b".to_string()]);
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtMostOnce);
    }

    #[test]
    fn inbox_keeps_latest_and_fans_out() {
        let inbox = Inbox::default();
        let mut watcher = inbox.watch("line/temp");
        inbox.deliver("line/temp", b"21.5".to_vec());
        inbox.deliver("line/other", b"1".to_vec());

        assert_eq!(inbox.latest("line/temp"), Some(b"21.5".to_vec()));
        assert_eq!(watcher.try_recv().unwrap(), b"21.5".to_vec());
        assert!(watcher.try_recv().is_err());

        inbox.reset();
        assert_eq!(inbox.latest("line/temp"), None);
    }

    #[test]
    fn stale_event_loop_failure_spares_new_session() {
        let inbox = Inbox::default();
        let stale = inbox.begin();
        let current = inbox.begin();
        let mut watcher = inbox.watch("line/temp");

        assert!(!inbox.fail(stale));
        inbox.deliver("line/temp", b"1".to_vec());
        assert_eq!(watcher.try_recv().unwrap(), b"1".to_vec());

        assert!(inbox.fail(current));
        assert!(!inbox.alive.load(Ordering::SeqCst));
        // 发送端已丢弃，订阅方感知到会话结束
        assert!(matches!(
            watcher.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn dropped_session_stops_event_loop() {
        let options = MqttOptions::new("imcp-test", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 10);
        let pump = tokio::spawn(std::future::pending::<()>());
        let abort = pump.abort_handle();
        let session = Session {
            client,
            pump,
            subscribed: HashSet::new(),
        };

        drop(session);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !abort.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("event loop aborted");
    }

    #[tokio::test]
    async fn call_before_open_fails() {
        let transport = MqttTransport::new(MqttConfig::new("127.0.0.1", 1883));
        let err = transport
            .call(MqttRequest::Latest {
                topic: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }
}
