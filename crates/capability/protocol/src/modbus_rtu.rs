//! Modbus RTU 传输实现
//!
//! 串口经 tokio-serial 打开后交给 tokio-modbus 的 RTU 帧编码。总线同一时刻
//! 只能有一个请求在途，串行化由上层设备连接保证。
//!
//! ## 配置格式
//!
//! ```json
//! { "path": "/dev/ttyUSB0", "baud_rate": 19200 }
//! ```

use crate::error::TransportError;
use crate::modbus_client;
use crate::transport::{ModbusRequest, ModbusResponse, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

/// Modbus RTU 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusRtuConfig {
    /// 串口设备路径
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

/// Modbus RTU 传输
pub struct ModbusRtuTransport {
    config: ModbusRtuConfig,
    ctx: Mutex<Option<tokio_modbus::client::Context>>,
}

impl ModbusRtuTransport {
    pub fn new(config: ModbusRtuConfig) -> Self {
        Self {
            config,
            ctx: Mutex::new(None),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let config: ModbusRtuConfig =
            serde_json::from_str(json).map_err(|e| TransportError::ConfigParse(e.to_string()))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ModbusRtuConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for ModbusRtuTransport {
    type Request = ModbusRequest;
    type Response = ModbusResponse;

    async fn open(&self) -> Result<(), TransportError> {
        debug!(
            target: "imcp.protocol",
            path = %self.config.path,
            baud_rate = self.config.baud_rate,
            "opening serial port"
        );
        let port = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        // 从站地址在每次请求时设置
        let ctx = rtu::attach_slave(port, Slave(1));

        let mut guard = self.ctx.lock().await;
        if let Some(mut stale) = guard.replace(ctx) {
            let _ = stale.disconnect().await;
        }
        info!(
            target: "imcp.protocol",
            path = %self.config.path,
            baud_rate = self.config.baud_rate,
            "serial modbus link opened"
        );
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.ctx.lock().await;
        if let Some(mut ctx) = guard.take() {
            let _ = ctx.disconnect().await;
            debug!(target: "imcp.protocol", path = %self.config.path, "serial modbus link released");
        }
    }

    async fn call(&self, request: ModbusRequest) -> Result<ModbusResponse, TransportError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::NotOpen)?;
        modbus_client::execute(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{"path": "/dev/ttyUSB0", "baud_rate": 19200}"#;
        let transport = ModbusRtuTransport::from_json(json).unwrap();
        assert_eq!(transport.config().path, "/dev/ttyUSB0");
        assert_eq!(transport.config().baud_rate, 19200);
    }

    #[test]
    fn test_default_baud_rate() {
        let transport = ModbusRtuTransport::from_json(r#"{"path": "COM3"}"#).unwrap();
        assert_eq!(transport.config().baud_rate, 9600);
    }

    #[test]
    fn test_missing_path_is_rejected() {
        let err = ModbusRtuTransport::from_json(r#"{"baud_rate": 9600}"#)
            .err()
            .expect("path is required");
        assert!(matches!(err, TransportError::ConfigParse(_)));
    }

    #[tokio::test]
    async fn test_call_before_open_fails() {
        let transport = ModbusRtuTransport::new(ModbusRtuConfig {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
        });
        let err = transport
            .call(ModbusRequest::ReadCoils {
                unit_id: 3,
                address: 0,
                count: 8,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_open_missing_port_is_link_failure() {
        let transport = ModbusRtuTransport::new(ModbusRtuConfig {
            path: "/dev/imcp-no-such-port".to_string(),
            baud_rate: 9600,
        });
        let err = transport.open().await.unwrap_err();
        assert!(err.is_link_failure());
    }
}
