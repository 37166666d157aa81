use domain::{
    ChangeCallback, ConnectionParams, DataType, DeviceConfig, ModbusTable, Operation,
    ProtocolKind, TagAddress, TagSpec, TagValue, WordOrder,
};
use imcp_adapter::AdapterError;
use imcp_config::{ConcurrencyConfig, ReconnectConfig};
use imcp_connection::ConnectionState;
use imcp_dispatch::{DispatchError, Dispatcher, ExecuteOptions, OperationOutcome};
use imcp_protocol::in_memory::{InMemoryModbus, InMemoryMqtt, InMemoryOpcUa, ScriptedFailure};
use imcp_protocol::{ModbusLink, MqttLink, OpcUaLink};
use imcp_registry::{Registry, RegistrySettings, StaticTransportFactory};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn settings() -> RegistrySettings {
    RegistrySettings {
        reconnect: ReconnectConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: 0.2,
            failure_threshold: 3,
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_secs(5),
        },
        concurrency: ConcurrencyConfig::default(),
        poll_interval: Duration::from_millis(100),
    }
}

fn options() -> ExecuteOptions {
    ExecuteOptions::default()
        .with_attempt_timeout(Duration::from_secs(1))
        .with_retries(2, Duration::from_millis(100))
}

fn plc(id: &str) -> DeviceConfig {
    let register = |address: u16, data_type: DataType| {
        TagSpec::new(
            TagAddress::Modbus {
                table: ModbusTable::HoldingRegister,
                address,
                unit_id: 1,
                word_order: WordOrder::BigEndian,
            },
            data_type,
        )
    };
    DeviceConfig::new(
        id,
        ProtocolKind::ModbusTcp,
        ConnectionParams::Tcp {
            host: "127.0.0.1".to_string(),
            port: 502,
        },
    )
    .with_tag("speed", register(0, DataType::Int32))
    .with_tag("ratio", register(10, DataType::Float32))
}

fn opcua(id: &str) -> DeviceConfig {
    let node = |node_id: &str, data_type: DataType| {
        TagSpec::new(
            TagAddress::OpcUa {
                node_id: node_id.to_string(),
            },
            data_type,
        )
    };
    DeviceConfig::new(
        id,
        ProtocolKind::OpcUa,
        ConnectionParams::Endpoint {
            url: "opc.tcp://127.0.0.1:4840".to_string(),
        },
    )
    .with_tag("level", node("ns=2;s=Level", DataType::Float64))
    .with_tag("ghost", node("ns=2;s=Ghost", DataType::Float64))
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
        "valve",
        TagSpec::new(
            TagAddress::Mqtt {
                topic: "site/valve".to_string(),
                command_topic: None,
                qos: 1,
                retain: false,
            },
            DataType::Bool,
        ),
    )
}

struct Gateway {
    registry: Arc<Registry>,
    factory: Arc<StaticTransportFactory>,
}

impl Gateway {
    fn new() -> Self {
        let factory = Arc::new(StaticTransportFactory::new());
        let registry = Arc::new(Registry::new(factory.clone(), settings()));
        Self { registry, factory }
    }

    async fn modbus(&self, id: &str) -> Arc<InMemoryModbus> {
        let slave = Arc::new(InMemoryModbus::new());
        let link: Arc<ModbusLink> = slave.clone();
        self.factory.insert_modbus(id, link);
        self.registry.register(plc(id)).await.expect("register plc");
        slave
    }

    async fn opcua(&self, id: &str) -> Arc<InMemoryOpcUa> {
        let server = Arc::new(InMemoryOpcUa::new());
        server.set_node("ns=2;s=Level", TagValue::Float64(0.0));
        let link: Arc<OpcUaLink> = server.clone();
        self.factory.insert_opcua(id, link);
        self.registry.register(opcua(id)).await.expect("register opcua");
        server
    }

    async fn mqtt(&self, id: &str) -> Arc<InMemoryMqtt> {
        let broker_link = Arc::new(InMemoryMqtt::new());
        let link: Arc<MqttLink> = broker_link.clone();
        self.factory.insert_mqtt(id, link);
        self.registry.register(broker(id)).await.expect("register broker");
        broker_link
    }

    async fn wait_for(&self, id: &str, state: ConnectionState) {
        let entry = self.registry.lookup(id).expect("registered");
        let mut status = entry.connection.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(60),
            status.wait_for(|status| status.state == state),
        )
        .await
        .expect("state reached in time")
        .expect("status channel open");
    }
}

#[tokio::test(start_paused = true)]
async fn write_then_read_round_trips_each_type() {
    let gateway = Gateway::new();
    gateway.modbus("plc-1").await;
    gateway.opcua("ua-1").await;
    gateway.mqtt("broker-1").await;
    for id in ["plc-1", "ua-1", "broker-1"] {
        gateway.wait_for(id, ConnectionState::Connected).await;
    }
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    let cases = [
        ("plc-1", "speed", TagValue::Int32(-123_456)),
        ("plc-1", "ratio", TagValue::Float32(0.75)),
        ("ua-1", "level", TagValue::Float64(3.25)),
        ("broker-1", "valve", TagValue::Bool(true)),
    ];
    for (device, tag, value) in cases {
        let written = dispatcher
            .execute(Operation::write(device, tag, value.clone()), options())
            .await
            .expect("write");
        assert!(matches!(written, OperationOutcome::Written));

        let read = dispatcher
            .execute(Operation::read(device, tag), options())
            .await
            .expect("read");
        assert_eq!(read.value(), Some(&value), "{device}/{tag}");
    }

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_isolates_unreachable_device() {
    let gateway = Gateway::new();
    let slave = gateway.modbus("plc-1").await;
    slave.set_holding(0, &[0, 7]);
    let server = gateway.opcua("ua-1").await;
    server.set_node("ns=2;s=Level", TagValue::Float64(1.5));
    let dead = gateway.mqtt("broker-1").await;
    dead.probe().fail_all_opens();

    gateway.wait_for("plc-1", ConnectionState::Connected).await;
    gateway.wait_for("ua-1", ConnectionState::Connected).await;
    gateway.wait_for("broker-1", ConnectionState::Unreachable).await;

    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);
    let results = dispatcher
        .execute_batch(
            vec![
                Operation::read("plc-1", "speed"),
                Operation::read("broker-1", "valve"),
                Operation::read("ua-1", "level"),
            ],
            options(),
        )
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|result| result.is_err()).count(), 1);
    assert_eq!(
        results[0].as_ref().unwrap().value(),
        Some(&TagValue::Int32(7))
    );
    let err = results[1].as_ref().unwrap_err();
    assert!(matches!(err.adapter_error(), Some(AdapterError::NotConnected(_))));
    assert_eq!(err.attempts(), 3);
    assert_eq!(
        results[2].as_ref().unwrap().value(),
        Some(&TagValue::Float64(1.5))
    );

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_device_fails_without_retry() {
    let gateway = Gateway::new();
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    let err = dispatcher
        .execute(Operation::read("nowhere", "speed"), options())
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::DeviceNotFound("nowhere".to_string()));
    assert!(!err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn application_errors_are_not_retried() {
    let gateway = Gateway::new();
    let slave = gateway.modbus("plc-1").await;
    gateway.opcua("ua-1").await;
    gateway.wait_for("plc-1", ConnectionState::Connected).await;
    gateway.wait_for("ua-1", ConnectionState::Connected).await;
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    let err = dispatcher
        .execute(Operation::read("plc-1", "missing"), options())
        .await
        .unwrap_err();
    assert!(matches!(err.adapter_error(), Some(AdapterError::UnknownTag(_))));
    assert_eq!(err.attempts(), 1);

    let err = dispatcher
        .execute(
            Operation::write("plc-1", "speed", TagValue::Float64(1.5)),
            options(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.adapter_error(), Some(AdapterError::TypeMismatch { .. })));
    assert_eq!(err.attempts(), 1);
    assert_eq!(slave.probe().call_count(), 0);

    let err = dispatcher
        .execute(Operation::read("ua-1", "ghost"), options())
        .await
        .unwrap_err();
    assert!(matches!(err.adapter_error(), Some(AdapterError::ProtocolFault(_))));
    assert_eq!(err.attempts(), 1);

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_after_reconnect() {
    let gateway = Gateway::new();
    let slave = gateway.modbus("plc-1").await;
    slave.set_holding(0, &[0, 9]);
    gateway.wait_for("plc-1", ConnectionState::Connected).await;
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    slave.probe().fail_next_call(ScriptedFailure::Link);
    let options = options().with_retries(3, Duration::from_millis(300));
    let outcome = dispatcher
        .execute(Operation::read("plc-1", "speed"), options)
        .await
        .expect("retry succeeds");

    assert_eq!(outcome.value(), Some(&TagValue::Int32(9)));
    assert_eq!(slave.probe().open_attempts(), 2);

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_is_retried_then_reported() {
    let gateway = Gateway::new();
    let slave = gateway.modbus("plc-1").await;
    gateway.wait_for("plc-1", ConnectionState::Connected).await;
    slave.probe().set_latency(Duration::from_secs(2));
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    let options = ExecuteOptions::default()
        .with_attempt_timeout(Duration::from_millis(200))
        .with_retries(1, Duration::from_millis(100));
    let started = Instant::now();
    let err = dispatcher
        .execute(Operation::read("plc-1", "speed"), options)
        .await
        .unwrap_err();

    assert_eq!(err.adapter_error(), Some(&AdapterError::Timeout));
    assert_eq!(err.attempts(), 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(520));

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overall_deadline_cuts_retries_short() {
    let gateway = Gateway::new();
    let slave = gateway.modbus("plc-1").await;
    slave.probe().fail_all_opens();
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    let options = options()
        .with_retries(10, Duration::from_millis(100))
        .with_deadline(Duration::from_millis(250));
    let started = Instant::now();
    let err = dispatcher
        .execute(Operation::read("plc-1", "speed"), options)
        .await
        .unwrap_err();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(270));
    assert_eq!(err.adapter_error(), Some(&AdapterError::Timeout));
    assert_eq!(err.attempts(), 2);

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn per_device_cap_bounds_parallel_attempts() {
    let gateway = Gateway::new();
    let server = gateway.opcua("ua-1").await;
    gateway.wait_for("ua-1", ConnectionState::Connected).await;
    server.probe().set_latency(Duration::from_millis(50));
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 2);

    let ops = (0..8).map(|_| Operation::read("ua-1", "level")).collect();
    let results = dispatcher.execute_batch(ops, options()).await;

    assert!(results.iter().all(Result::is_ok));
    // 连接允许 4 个并发，分发器单设备上限更小
    assert_eq!(server.probe().max_in_flight(), 2);
    assert_eq!(dispatcher.in_flight(), 0);

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn global_cap_bounds_all_devices() {
    let gateway = Gateway::new();
    let first = gateway.opcua("ua-1").await;
    let second = gateway.opcua("ua-2").await;
    gateway.wait_for("ua-1", ConnectionState::Connected).await;
    gateway.wait_for("ua-2", ConnectionState::Connected).await;
    first.probe().set_latency(Duration::from_millis(50));
    second.probe().set_latency(Duration::from_millis(50));
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 1, 4);

    let started = Instant::now();
    let ops = vec![
        Operation::read("ua-1", "level"),
        Operation::read("ua-2", "level"),
        Operation::read("ua-1", "level"),
        Operation::read("ua-2", "level"),
    ];
    let results = dispatcher.execute_batch(ops, options()).await;

    assert!(results.iter().all(Result::is_ok));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(first.probe().max_in_flight(), 1);
    assert_eq!(second.probe().max_in_flight(), 1);

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_device_does_not_starve_others() {
    let gateway = Gateway::new();
    let slow = gateway.opcua("ua-slow").await;
    let fast = gateway.modbus("plc-1").await;
    fast.set_holding(0, &[0, 1]);
    gateway.wait_for("ua-slow", ConnectionState::Connected).await;
    gateway.wait_for("plc-1", ConnectionState::Connected).await;
    slow.probe().set_latency(Duration::from_secs(1));
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 4, 2);

    let stalled = {
        let dispatcher = dispatcher.clone();
        let ops = (0..10).map(|_| Operation::read("ua-slow", "level")).collect();
        tokio::spawn(async move {
            let options = ExecuteOptions::default().with_attempt_timeout(Duration::from_secs(30));
            dispatcher.execute_batch(ops, options).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(dispatcher.in_flight(), 2);

    let started = Instant::now();
    let outcome = dispatcher
        .execute(Operation::read("plc-1", "speed"), options())
        .await
        .expect("fast device answers");
    assert_eq!(outcome.value(), Some(&TagValue::Int32(1)));
    assert!(started.elapsed() < Duration::from_millis(100));

    let results = stalled.await.expect("join");
    assert!(results.iter().all(Result::is_ok));
    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn queued_attempt_is_bounded_by_timeout() {
    let gateway = Gateway::new();
    let server = gateway.opcua("ua-1").await;
    gateway.wait_for("ua-1", ConnectionState::Connected).await;
    server.probe().set_latency(Duration::from_secs(2));
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 1);

    let slow = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let options = ExecuteOptions::default().with_attempt_timeout(Duration::from_secs(10));
            dispatcher.execute(Operation::read("ua-1", "level"), options).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let options = ExecuteOptions::default()
        .with_attempt_timeout(Duration::from_millis(100))
        .with_retries(0, Duration::from_millis(100));
    let started = Instant::now();
    let err = dispatcher
        .execute(Operation::read("ua-1", "level"), options)
        .await
        .unwrap_err();

    assert_eq!(err.adapter_error(), Some(&AdapterError::Timeout));
    assert_eq!(err.attempts(), 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(120));

    slow.await.expect("join").expect("slow read completes");
    assert_eq!(server.probe().calls().len(), 1);
    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_batch_never_reaches_the_wire() {
    let gateway = Gateway::new();
    let slave = gateway.modbus("plc-1").await;
    gateway.wait_for("plc-1", ConnectionState::Connected).await;
    slave.probe().set_latency(Duration::from_millis(500));
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 1);

    let slow = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .execute(Operation::read("plc-1", "speed"), options())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let options = ExecuteOptions::default()
        .with_attempt_timeout(Duration::from_secs(10))
        .with_retries(0, Duration::from_millis(100));
    let batch = dispatcher.execute_batch(
        vec![Operation::write("plc-1", "speed", TagValue::Int32(7))],
        options,
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(100), batch)
            .await
            .is_err()
    );

    slow.await.expect("join").expect("slow read completes");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(slave.writes().is_empty());
    assert_eq!(dispatcher.in_flight(), 0);

    gateway.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_and_unsubscribe_through_dispatcher() {
    let gateway = Gateway::new();
    let broker_link = gateway.mqtt("broker-1").await;
    gateway.wait_for("broker-1", ConnectionState::Connected).await;
    let dispatcher = Dispatcher::new(Arc::clone(&gateway.registry), 16, 4);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ChangeCallback = Arc::new(move |change| {
        sink.lock().unwrap().push(change.value);
    });
    let handle = dispatcher
        .execute(
            Operation::subscribe("broker-1", "valve", callback)
                .with_correlation_id("sub-1"),
            options(),
        )
        .await
        .expect("subscribe")
        .into_subscription()
        .expect("subscription handle");
    assert_eq!(handle.device_id(), "broker-1");

    broker_link.inject("site/valve", "on");
    broker_link.inject("site/valve", "off");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![TagValue::Bool(true), TagValue::Bool(false)]
    );

    dispatcher.unsubscribe(&handle);
    dispatcher.unsubscribe(&handle);
    tokio::time::sleep(Duration::from_millis(10)).await;
    broker_link.inject("site/valve", "on");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);

    gateway.registry.shutdown().await;
}
