//! Modbus 寄存器编解码
//!
//! 寄存器个数与解释方式完全由点位声明的数据类型决定。

use crate::error::CodecError;
use domain::{DataType, TagValue, WordOrder};

/// 数据类型占用的寄存器个数
pub fn register_count(data_type: DataType) -> Option<u16> {
    match data_type {
        DataType::Int16 | DataType::Uint16 => Some(1),
        DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
        DataType::Int64 | DataType::Float64 => Some(4),
        DataType::Bool | DataType::String | DataType::Bytes => None,
    }
}

/// 解析寄存器数据为类型化值
pub fn decode_registers(
    registers: &[u16],
    data_type: DataType,
    order: WordOrder,
) -> Result<TagValue, CodecError> {
    let count = register_count(data_type).ok_or_else(|| unsupported(data_type))? as usize;
    if registers.len() < count {
        return Err(CodecError::DataParse(format!(
            "need {} registers for {}, got {}",
            count,
            data_type,
            registers.len()
        )));
    }

    let bits = combine(&registers[..count], order);
    let value = match data_type {
        DataType::Int16 => TagValue::Int16(bits as u16 as i16),
        DataType::Uint16 => TagValue::Uint16(bits as u16),
        DataType::Int32 => TagValue::Int32(bits as u32 as i32),
        DataType::Uint32 => TagValue::Uint32(bits as u32),
        DataType::Float32 => TagValue::Float32(f32::from_bits(bits as u32)),
        DataType::Int64 => TagValue::Int64(bits as i64),
        DataType::Float64 => TagValue::Float64(f64::from_bits(bits)),
        _ => return Err(unsupported(data_type)),
    };
    Ok(value)
}

/// 将类型化值编码为寄存器序列（线上顺序）
pub fn encode_registers(value: &TagValue, order: WordOrder) -> Result<Vec<u16>, CodecError> {
    let (bits, count): (u64, u32) = match value {
        TagValue::Int16(v) => (u64::from(*v as u16), 1),
        TagValue::Uint16(v) => (u64::from(*v), 1),
        TagValue::Int32(v) => (u64::from(*v as u32), 2),
        TagValue::Uint32(v) => (u64::from(*v), 2),
        TagValue::Float32(v) => (u64::from(v.to_bits()), 2),
        TagValue::Int64(v) => (*v as u64, 4),
        TagValue::Float64(v) => (v.to_bits(), 4),
        other => return Err(unsupported(other.data_type())),
    };

    let mut words: Vec<u16> = (0..count)
        .rev()
        .map(|index| (bits >> (16 * index)) as u16)
        .collect();
    if order == WordOrder::LittleEndian {
        words.reverse();
    }
    Ok(words)
}

fn combine(registers: &[u16], order: WordOrder) -> u64 {
    let fold = |acc: u64, word: &u16| (acc << 16) | u64::from(*word);
    match order {
        WordOrder::BigEndian => registers.iter().fold(0, fold),
        WordOrder::LittleEndian => registers.iter().rev().fold(0, fold),
    }
}

fn unsupported(data_type: DataType) -> CodecError {
    CodecError::Unsupported {
        protocol: "modbus",
        data_type,
    }
}
