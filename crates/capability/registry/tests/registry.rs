use domain::{
    ConfigError, ConnectionParams, DataType, DeviceConfig, Health, ModbusTable, ProtocolKind,
    TagAddress, TagSpec, TagValue, WordOrder,
};
use imcp_config::{ConcurrencyConfig, ReconnectConfig};
use imcp_connection::ConnectionState;
use imcp_protocol::in_memory::{InMemoryModbus, InMemoryMqtt, InMemoryOpcUa};
use imcp_protocol::{ModbusLink, MqttLink, OpcUaLink};
use imcp_registry::{
    NativeTransportFactory, Registry, RegistrySettings, StaticTransportFactory,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn settings() -> RegistrySettings {
    RegistrySettings {
        reconnect: ReconnectConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: 0.2,
            failure_threshold: 3,
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
        },
        concurrency: ConcurrencyConfig::default(),
        poll_interval: Duration::from_millis(100),
    }
}

fn plc(id: &str) -> DeviceConfig {
    DeviceConfig::new(
        id,
        ProtocolKind::ModbusTcp,
        ConnectionParams::Tcp {
            host: "127.0.0.1".to_string(),
            port: 502,
        },
    )
    .with_tag(
        "speed",
        TagSpec::new(
            TagAddress::Modbus {
                table: ModbusTable::HoldingRegister,
                address: 0,
                unit_id: 1,
                word_order: WordOrder::BigEndian,
            },
            DataType::Uint16,
        ),
    )
}

fn opcua(id: &str) -> DeviceConfig {
    DeviceConfig::new(
        id,
        ProtocolKind::OpcUa,
        ConnectionParams::Endpoint {
            url: "opc.tcp://127.0.0.1:4840".to_string(),
        },
    )
    .with_tag(
        "level",
        TagSpec::new(
            TagAddress::OpcUa {
                node_id: "ns=2;s=Level".to_string(),
            },
            DataType::Float64,
        ),
    )
}

fn broker(id: &str) -> DeviceConfig {
    DeviceConfig::new(
        id,
        ProtocolKind::Mqtt,
        ConnectionParams::Broker {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
        },
    )
    .with_tag(
        "temp",
        TagSpec::new(
            TagAddress::Mqtt {
                topic: "site/temp".to_string(),
                command_topic: None,
                qos: 0,
                retain: false,
            },
            DataType::Float64,
        ),
    )
}

fn static_registry() -> (Registry, Arc<StaticTransportFactory>) {
    let factory = Arc::new(StaticTransportFactory::new());
    let registry = Registry::new(factory.clone(), settings());
    (registry, factory)
}

async fn wait_for_state(registry: &Registry, device_id: &str, state: ConnectionState) {
    let entry = registry.lookup(device_id).expect("registered");
    let mut status = entry.connection.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(60),
        status.wait_for(|status| status.state == state),
    )
    .await
    .expect("state reached in time")
    .expect("status channel open");
}

#[tokio::test(start_paused = true)]
async fn lookup_after_register_starts_connecting() {
    let (registry, factory) = static_registry();
    let slave = Arc::new(InMemoryModbus::new());
    let link: Arc<ModbusLink> = slave.clone();
    factory.insert_modbus("plc-1", link);

    let device_id = registry.register(plc("plc-1")).await.expect("register");
    assert_eq!(device_id, "plc-1");

    let entry = registry.lookup("plc-1").expect("lookup");
    assert_eq!(entry.state(), ConnectionState::Connecting);
    assert_eq!(entry.health, Health::Healthy);
    assert_eq!(entry.adapter.protocol(), ProtocolKind::ModbusTcp);
    // 握手在后台进行，注册本身不触碰传输
    assert_eq!(slave.probe().open_attempts(), 0);

    wait_for_state(&registry, "plc-1", ConnectionState::Connected).await;
    assert_eq!(slave.probe().open_attempts(), 1);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn opcua_entry_exposes_node_browsing() {
    let (registry, factory) = static_registry();
    let server = Arc::new(InMemoryOpcUa::new());
    server.set_node("ns=2;s=Level", TagValue::Float64(0.0));
    let link: Arc<OpcUaLink> = server.clone();
    factory.insert_opcua("ua-1", link);
    registry.register(opcua("ua-1")).await.expect("register");
    wait_for_state(&registry, "ua-1", ConnectionState::Connected).await;

    let entry = registry.lookup("ua-1").expect("lookup");
    let browser = entry.adapter.browser().expect("browsable");
    let nodes = browser.browse(None).await.expect("browse root");
    assert_eq!(nodes.len(), 1);
    let info = browser.node_info(&nodes[0].node_id).await.expect("node info");
    assert_eq!(info.node_id, "ns=2;s=Level");
    assert_eq!(info.browse_name, "Level");

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn register_rejects_bad_definitions() {
    let (registry, factory) = static_registry();
    let link: Arc<ModbusLink> = Arc::new(InMemoryModbus::new());
    factory.insert_modbus("plc-1", link);
    registry.register(plc("plc-1")).await.expect("register");

    assert_eq!(
        registry.register(plc("plc-1")).await,
        Err(ConfigError::DuplicateDevice("plc-1".to_string()))
    );

    let bad = plc("plc-2").with_tag(
        "valve",
        TagSpec::new(
            TagAddress::Modbus {
                table: ModbusTable::Coil,
                address: 1,
                unit_id: 1,
                word_order: WordOrder::BigEndian,
            },
            DataType::Float32,
        ),
    );
    assert!(matches!(
        registry.register(bad).await,
        Err(ConfigError::InvalidTag { .. })
    ));

    // 没有注入传输
    assert!(matches!(
        registry.register(broker("broker-1")).await,
        Err(ConfigError::UnsupportedTransport { .. })
    ));

    assert_eq!(registry.len(), 1);
    registry.shutdown().await;
}

#[test]
fn unknown_protocol_kind_is_rejected_when_parsing() {
    let json = r#"{
        "id": "bus-1",
        "protocol": "profinet",
        "params": {"kind": "tcp", "host": "127.0.0.1", "port": 102}
    }"#;
    assert!(serde_json::from_str::<DeviceConfig>(json).is_err());
    assert!(matches!(
        "profinet".parse::<ProtocolKind>(),
        Err(ConfigError::UnknownProtocol(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn native_factory_refuses_opcua_without_injected_client() {
    let registry = Registry::new(Arc::new(NativeTransportFactory::new()), settings());
    assert!(matches!(
        registry.register(opcua("ua-1")).await,
        Err(ConfigError::UnsupportedTransport { .. })
    ));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn list_health_reports_every_device() {
    let (registry, factory) = static_registry();
    let healthy = Arc::new(InMemoryModbus::new());
    let dead = Arc::new(InMemoryOpcUa::new());
    dead.probe().fail_all_opens();
    let brokered = Arc::new(InMemoryMqtt::new());
    let healthy_link: Arc<ModbusLink> = healthy.clone();
    let dead_link: Arc<OpcUaLink> = dead.clone();
    let broker_link: Arc<MqttLink> = brokered.clone();
    factory.insert_modbus("plc-1", healthy_link);
    factory.insert_opcua("ua-1", dead_link);
    factory.insert_mqtt("broker-1", broker_link);

    registry.register(plc("plc-1")).await.unwrap();
    registry.register(opcua("ua-1")).await.unwrap();
    registry.register(broker("broker-1")).await.unwrap();

    wait_for_state(&registry, "plc-1", ConnectionState::Connected).await;
    wait_for_state(&registry, "broker-1", ConnectionState::Connected).await;
    wait_for_state(&registry, "ua-1", ConnectionState::Unreachable).await;

    let health: Vec<_> = registry.list_health().collect();
    assert_eq!(
        health,
        vec![
            ("broker-1".to_string(), Health::Healthy),
            ("plc-1".to_string(), Health::Healthy),
            ("ua-1".to_string(), Health::Unreachable),
        ]
    );

    // 人工复位后重新尝试
    dead.probe().heal();
    assert!(registry.reset("ua-1").unwrap());
    wait_for_state(&registry, "ua-1", ConnectionState::Connected).await;
    assert_eq!(registry.lookup("ua-1").unwrap().health, Health::Healthy);
    assert!(registry.reset("missing").is_err());

    assert_eq!(registry.shutdown().await, 3);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn deregister_drains_in_flight_operation() {
    let (registry, factory) = static_registry();
    let slave = Arc::new(InMemoryModbus::new());
    slave.set_holding(0, &[42]);
    let link: Arc<ModbusLink> = slave.clone();
    factory.insert_modbus("plc-1", link);
    registry.register(plc("plc-1")).await.unwrap();
    wait_for_state(&registry, "plc-1", ConnectionState::Connected).await;

    slave.probe().set_latency(Duration::from_millis(300));
    let adapter = registry.lookup("plc-1").unwrap().adapter;
    let in_flight = tokio::spawn(async move { adapter.read("speed").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(slave.probe().in_flight(), 1);

    registry.deregister("plc-1").await.expect("deregister");
    assert!(registry.lookup("plc-1").is_err());

    let value = in_flight.await.expect("join").expect("operation completes");
    assert_eq!(value, TagValue::Uint16(42));
    let finished = slave.probe().calls()[0].finished;
    let closed_at = slave.probe().closed_at().expect("transport released");
    assert!(closed_at >= finished);

    assert!(registry.deregister("plc-1").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn deregister_cancels_subscriptions() {
    let (registry, factory) = static_registry();
    let slave = Arc::new(InMemoryModbus::new());
    let link: Arc<ModbusLink> = slave.clone();
    factory.insert_modbus("plc-1", link);
    registry.register(plc("plc-1")).await.unwrap();
    wait_for_state(&registry, "plc-1", ConnectionState::Connected).await;

    let seen = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&seen);
    let entry = registry.lookup("plc-1").unwrap();
    let handle = entry
        .adapter
        .subscribe(
            "speed",
            Arc::new(move |_| {
                *counter.lock().unwrap() += 1;
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), 1);

    registry.deregister("plc-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!handle.is_active());
    assert_eq!(entry.adapter.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn registries_are_independent() {
    let (first, first_factory) = static_registry();
    let (second, second_factory) = static_registry();
    let a: Arc<ModbusLink> = Arc::new(InMemoryModbus::new());
    let b: Arc<ModbusLink> = Arc::new(InMemoryModbus::new());
    first_factory.insert_modbus("plc-1", a);
    second_factory.insert_modbus("plc-1", b);

    first.register(plc("plc-1")).await.unwrap();
    second.register(plc("plc-1")).await.unwrap();
    first.deregister("plc-1").await.unwrap();

    assert!(first.lookup("plc-1").is_err());
    assert!(second.lookup("plc-1").is_ok());
    second.shutdown().await;
}
