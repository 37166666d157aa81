use imcp_config::GatewayConfig;
use std::time::Duration;

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("IMCP_RECONNECT_BASE_MS", "250");
        std::env::set_var("IMCP_UNREACHABLE_THRESHOLD", "3");
        std::env::set_var("IMCP_MODBUS_CONCURRENCY", "2");
        std::env::set_var("IMCP_RETRY_BACKOFF_MS", "50");
    }

    let config = GatewayConfig::from_env().expect("config");
    assert_eq!(config.reconnect.base_backoff, Duration::from_millis(250));
    assert_eq!(config.reconnect.failure_threshold, 3);
    assert_eq!(config.concurrency.modbus, 2);
    assert_eq!(config.concurrency.opcua, 4);
    assert_eq!(config.dispatch.retry_backoff, Duration::from_millis(50));
    assert_eq!(config.poll_interval, Duration::from_secs(1));
}

#[test]
fn defaults_match_protocol_limits() {
    let config = GatewayConfig::defaults();
    assert_eq!(config.concurrency.modbus, 1);
    assert_eq!(config.concurrency.opcua, 4);
    assert_eq!(config.concurrency.mqtt, 8);
    assert!(config.reconnect.max_backoff >= config.reconnect.base_backoff);
}
