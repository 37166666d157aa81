//! 内存 Modbus 从站

use super::probe::LinkProbe;
use crate::error::TransportError;
use crate::transport::{ModbusRequest, ModbusResponse, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct DataBank {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    writes: Vec<ModbusRequest>,
}

/// 内存 Modbus 从站，未写入的地址读出 0 / false
#[derive(Debug, Default)]
pub struct InMemoryModbus {
    probe: LinkProbe,
    bank: Mutex<DataBank>,
}

impl InMemoryModbus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> &LinkProbe {
        &self.probe
    }

    fn with<R>(&self, f: impl FnOnce(&mut DataBank) -> R) -> R {
        let mut bank = self.bank.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut bank)
    }

    /// 从 `address` 开始连续写入保持寄存器
    pub fn set_holding(&self, address: u16, values: &[u16]) {
        self.with(|bank| {
            for (offset, value) in values.iter().enumerate() {
                bank.holding.insert(address.wrapping_add(offset as u16), *value);
            }
        });
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        self.with(|bank| {
            for (offset, value) in values.iter().enumerate() {
                bank.input.insert(address.wrapping_add(offset as u16), *value);
            }
        });
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.with(|bank| bank.coils.insert(address, value));
    }

    pub fn set_discrete(&self, address: u16, value: bool) {
        self.with(|bank| bank.discrete_inputs.insert(address, value));
    }

    pub fn holding(&self, address: u16, count: u16) -> Vec<u16> {
        self.with(|bank| read_words(&bank.holding, address, count))
    }

    /// 收到的写请求（按到达顺序）
    pub fn writes(&self) -> Vec<ModbusRequest> {
        self.with(|bank| bank.writes.clone())
    }

    fn apply(&self, request: ModbusRequest) -> Result<ModbusResponse, TransportError> {
        self.with(|bank| match request {
            ModbusRequest::ReadCoils { address, count, .. } => {
                Ok(ModbusResponse::Bits(read_bits(&bank.coils, address, count)))
            }
            ModbusRequest::ReadDiscreteInputs { address, count, .. } => Ok(ModbusResponse::Bits(
                read_bits(&bank.discrete_inputs, address, count),
            )),
            ModbusRequest::ReadHoldingRegisters { address, count, .. } => Ok(
                ModbusResponse::Registers(read_words(&bank.holding, address, count)),
            ),
            ModbusRequest::ReadInputRegisters { address, count, .. } => Ok(
                ModbusResponse::Registers(read_words(&bank.input, address, count)),
            ),
            ModbusRequest::WriteSingleCoil { address, value, .. } => {
                bank.coils.insert(address, value);
                bank.writes.push(request);
                Ok(ModbusResponse::Written)
            }
            ModbusRequest::WriteMultipleRegisters {
                address,
                ref values,
                ..
            } => {
                for (offset, value) in values.iter().enumerate() {
                    bank.holding.insert(address.wrapping_add(offset as u16), *value);
                }
                bank.writes.push(request);
                Ok(ModbusResponse::Written)
            }
        })
    }
}

fn read_words(table: &HashMap<u16, u16>, address: u16, count: u16) -> Vec<u16> {
    (0..count)
        .map(|offset| {
            table
                .get(&address.wrapping_add(offset))
                .copied()
                .unwrap_or_default()
        })
        .collect()
}

fn read_bits(table: &HashMap<u16, bool>, address: u16, count: u16) -> Vec<bool> {
    (0..count)
        .map(|offset| {
            table
                .get(&address.wrapping_add(offset))
                .copied()
                .unwrap_or_default()
        })
        .collect()
}

#[async_trait]
impl Transport for InMemoryModbus {
    type Request = ModbusRequest;
    type Response = ModbusResponse;

    async fn open(&self) -> Result<(), TransportError> {
        self.probe.open().await
    }

    async fn close(&self) {
        self.probe.close();
    }

    async fn call(&self, request: ModbusRequest) -> Result<ModbusResponse, TransportError> {
        self.probe.call(|| self.apply(request)).await
    }
}
