//! Modbus TCP 传输实现
//!
//! 基于 tokio-modbus 客户端。Modbus TCP 连接不支持请求复用，
//! 同一时刻只能有一个请求在途，串行化由上层设备连接保证。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let transport = ModbusTcpTransport::from_json(r#"{"host": "192.168.1.100", "port": 502}"#)?;
//! transport.open().await?;
//! let response = transport
//!     .call(ModbusRequest::ReadHoldingRegisters { unit_id: 1, address: 100, count: 2 })
//!     .await?;
//! ```

use crate::error::TransportError;
use crate::modbus_client;
use crate::transport::{ModbusRequest, ModbusResponse, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

/// Modbus TCP 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusTcpConfig {
    /// Modbus 服务器主机地址
    pub host: String,
    /// Modbus 服务器端口（默认 502）
    #[serde(default = "default_modbus_port")]
    pub port: u16,
}

fn default_modbus_port() -> u16 {
    502
}

/// Modbus TCP 传输
pub struct ModbusTcpTransport {
    config: ModbusTcpConfig,
    ctx: Mutex<Option<tokio_modbus::client::Context>>,
}

impl ModbusTcpTransport {
    /// 创建新的 Modbus TCP 传输
    pub fn new(config: ModbusTcpConfig) -> Self {
        Self {
            config,
            ctx: Mutex::new(None),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let config: ModbusTcpConfig =
            serde_json::from_str(json).map_err(|e| TransportError::ConfigParse(e.to_string()))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ModbusTcpConfig {
        &self.config
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await?
            .next()
            .ok_or_else(|| {
                TransportError::ConfigParse(format!(
                    "invalid address: {}:{}",
                    self.config.host, self.config.port
                ))
            })
    }
}

#[async_trait]
impl Transport for ModbusTcpTransport {
    type Request = ModbusRequest;
    type Response = ModbusResponse;

    async fn open(&self) -> Result<(), TransportError> {
        let addr = self.resolve().await?;
        debug!(target: "imcp.protocol", %addr, "connecting to modbus server");

        let ctx = tcp::connect(addr)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut guard = self.ctx.lock().await;
        if let Some(mut stale) = guard.replace(ctx) {
            let _ = stale.disconnect().await;
        }
        info!(target: "imcp.protocol", %addr, "connected to modbus server");
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.ctx.lock().await;
        if let Some(mut ctx) = guard.take() {
            let _ = ctx.disconnect().await;
            debug!(
                target: "imcp.protocol",
                host = %self.config.host,
                port = self.config.port,
                "modbus connection released"
            );
        }
    }

    async fn call(&self, request: ModbusRequest) -> Result<ModbusResponse, TransportError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::NotOpen)?;
        modbus_client::execute(ctx, request).await
    }
}
