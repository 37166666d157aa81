//! 网关运行参数加载。
//!
//! 所有参数都有默认值，环境变量 `IMCP_*` 可逐项覆盖。设备定义文件的
//! 读取不在这里，调用方直接提供结构化的 `DeviceConfig`。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 重连退避参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 抖动比例，取值 [0, 1]
    pub jitter: f64,
    /// 连续失败达到该次数后进入 Unreachable
    pub failure_threshold: u32,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
            failure_threshold: 5,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(3),
        }
    }
}

/// 单连接并发上限（按协议）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub modbus: usize,
    pub opcua: usize,
    pub mqtt: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            modbus: 1,
            opcua: 4,
            mqtt: 8,
        }
    }
}

/// 分发器参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// 全局在途上限
    pub max_in_flight: usize,
    /// 单设备在途上限
    pub max_in_flight_per_device: usize,
    pub attempt_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            max_in_flight_per_device: 16,
            attempt_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// 网关运行配置。
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub reconnect: ReconnectConfig,
    pub concurrency: ConcurrencyConfig,
    /// 轮询模拟订阅的默认间隔
    pub poll_interval: Duration,
    pub dispatch: DispatchConfig,
}

impl GatewayConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::defaults();

        let reconnect = ReconnectConfig {
            base_backoff: read_ms_with_default(
                "IMCP_RECONNECT_BASE_MS",
                defaults.reconnect.base_backoff,
            )?,
            max_backoff: read_ms_with_default(
                "IMCP_RECONNECT_MAX_MS",
                defaults.reconnect.max_backoff,
            )?,
            jitter: read_f64_with_default("IMCP_RECONNECT_JITTER", defaults.reconnect.jitter)?,
            failure_threshold: read_u32_with_default(
                "IMCP_UNREACHABLE_THRESHOLD",
                defaults.reconnect.failure_threshold,
            )?,
            connect_timeout: read_ms_with_default(
                "IMCP_CONNECT_TIMEOUT_MS",
                defaults.reconnect.connect_timeout,
            )?,
            io_timeout: read_ms_with_default("IMCP_IO_TIMEOUT_MS", defaults.reconnect.io_timeout)?,
        };
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::Invalid(
                "IMCP_RECONNECT_JITTER".to_string(),
                reconnect.jitter.to_string(),
            ));
        }
        if reconnect.max_backoff < reconnect.base_backoff {
            return Err(ConfigError::Invalid(
                "IMCP_RECONNECT_MAX_MS".to_string(),
                format!("{}ms is below base", reconnect.max_backoff.as_millis()),
            ));
        }

        let concurrency = ConcurrencyConfig {
            modbus: read_limit_with_default(
                "IMCP_MODBUS_CONCURRENCY",
                defaults.concurrency.modbus,
            )?,
            opcua: read_limit_with_default("IMCP_OPCUA_CONCURRENCY", defaults.concurrency.opcua)?,
            mqtt: read_limit_with_default("IMCP_MQTT_CONCURRENCY", defaults.concurrency.mqtt)?,
        };

        let poll_interval = read_ms_with_default("IMCP_POLL_INTERVAL_MS", defaults.poll_interval)?;

        let dispatch = DispatchConfig {
            max_in_flight: read_limit_with_default(
                "IMCP_DISPATCH_MAX_IN_FLIGHT",
                defaults.dispatch.max_in_flight,
            )?,
            max_in_flight_per_device: read_limit_with_default(
                "IMCP_DISPATCH_MAX_IN_FLIGHT_PER_DEVICE",
                defaults.dispatch.max_in_flight_per_device,
            )?,
            attempt_timeout: read_ms_with_default(
                "IMCP_ATTEMPT_TIMEOUT_MS",
                defaults.dispatch.attempt_timeout,
            )?,
            max_retries: read_u32_with_default("IMCP_MAX_RETRIES", defaults.dispatch.max_retries)?,
            retry_backoff: read_ms_with_default(
                "IMCP_RETRY_BACKOFF_MS",
                defaults.dispatch.retry_backoff,
            )?,
        };

        Ok(Self {
            reconnect,
            concurrency,
            poll_interval,
            dispatch,
        })
    }

    /// 全部使用默认值。
    pub fn defaults() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            poll_interval: Duration::from_secs(1),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_f64_with_default(key: &str, default: f64) -> Result<f64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<f64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_ms_with_default(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    read_u64_with_default(key, default.as_millis() as u64).map(Duration::from_millis)
}

/// 并发上限必须 ≥ 1。
fn read_limit_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = read_u64_with_default(key, default as u64)?;
    if value == 0 {
        return Err(ConfigError::Invalid(key.to_string(), value.to_string()));
    }
    Ok(value as usize)
}
