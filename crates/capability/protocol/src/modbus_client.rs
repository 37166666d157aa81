//! tokio-modbus 客户端共用的请求映射
//!
//! TCP 与 RTU 只在建链方式上不同，建链后都得到同一种 `client::Context`。

use crate::error::TransportError;
use crate::transport::{ModbusRequest, ModbusResponse};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

/// 在已建立的上下文上执行一次请求
pub(crate) async fn execute(
    ctx: &mut Context,
    request: ModbusRequest,
) -> Result<ModbusResponse, TransportError> {
    let response = match request {
        ModbusRequest::ReadCoils {
            unit_id,
            address,
            count,
        } => {
            ctx.set_slave(Slave(unit_id));
            let bits = ctx
                .read_coils(address, count)
                .await
                .map_err(link_error)?
                .map_err(exception)?;
            ModbusResponse::Bits(bits)
        }
        ModbusRequest::ReadDiscreteInputs {
            unit_id,
            address,
            count,
        } => {
            ctx.set_slave(Slave(unit_id));
            let bits = ctx
                .read_discrete_inputs(address, count)
                .await
                .map_err(link_error)?
                .map_err(exception)?;
            ModbusResponse::Bits(bits)
        }
        ModbusRequest::ReadHoldingRegisters {
            unit_id,
            address,
            count,
        } => {
            // 读保持寄存器
            ctx.set_slave(Slave(unit_id));
            let registers = ctx
                .read_holding_registers(address, count)
                .await
                .map_err(link_error)?
                .map_err(exception)?;
            ModbusResponse::Registers(registers)
        }
        ModbusRequest::ReadInputRegisters {
            unit_id,
            address,
            count,
        } => {
            // 读输入寄存器
            ctx.set_slave(Slave(unit_id));
            let registers = ctx
                .read_input_registers(address, count)
                .await
                .map_err(link_error)?
                .map_err(exception)?;
            ModbusResponse::Registers(registers)
        }
        ModbusRequest::WriteSingleCoil {
            unit_id,
            address,
            value,
        } => {
            ctx.set_slave(Slave(unit_id));
            ctx.write_single_coil(address, value)
                .await
                .map_err(link_error)?
                .map_err(exception)?;
            ModbusResponse::Written
        }
        ModbusRequest::WriteMultipleRegisters {
            unit_id,
            address,
            values,
        } => {
            ctx.set_slave(Slave(unit_id));
            ctx.write_multiple_registers(address, &values)
                .await
                .map_err(link_error)?
                .map_err(exception)?;
            ModbusResponse::Written
        }
    };

    Ok(response)
}

/// 传输 / 帧错误：响应流可能已经错位，只能重建连接
fn link_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Connection(err.to_string())
}

/// 从站异常码：链路正常，请求被设备拒绝
fn exception(code: impl std::fmt::Debug) -> TransportError {
    TransportError::Fault(format!("exception: {:?}", code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_is_a_device_fault() {
        let err = exception(tokio_modbus::ExceptionCode::IllegalDataAddress);
        assert!(matches!(err, TransportError::Fault(_)));
        assert!(!err.is_link_failure());
    }

    #[test]
    fn framing_error_drops_the_link() {
        let err = link_error("invalid frame");
        assert!(err.is_link_failure());
    }
}
