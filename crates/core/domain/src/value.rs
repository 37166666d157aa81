//! 点位数据类型与类型化数值
//!
//! 所有跨越适配器边界的标量都以 [`TagValue`] 表示，位宽与符号由点位
//! 声明的 [`DataType`] 决定，而不是从原始报文字节推断。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 点位声明的数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    /// 16位有符号整数
    Int16,
    /// 16位无符号整数
    Uint16,
    /// 32位有符号整数
    Int32,
    /// 32位无符号整数
    Uint32,
    /// 64位有符号整数
    Int64,
    /// 32位浮点数
    Float32,
    /// 64位浮点数
    Float64,
    String,
    Bytes,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Int16 | Self::Uint16 | Self::Int32 | Self::Uint32 | Self::Int64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// 将任意来源的数值收敛到本类型。
    ///
    /// 整数只接受整数值且必须落在位宽范围内；浮点接受整数与浮点，
    /// `float32` 额外校验有限值不超出 f32 范围；bool / string / bytes 只接受同类。
    pub fn coerce(&self, value: &TagValue) -> Result<TagValue, ValueError> {
        let mismatch = || ValueError::Mismatch {
            expected: *self,
            found: value.describe(),
        };
        let out_of_range = || ValueError::OutOfRange {
            expected: *self,
            found: value.describe(),
        };

        match self {
            Self::Bool => match value {
                TagValue::Bool(v) => Ok(TagValue::Bool(*v)),
                _ => Err(mismatch()),
            },
            Self::Int16 | Self::Uint16 | Self::Int32 | Self::Uint32 | Self::Int64 => {
                let raw = value.as_i128().ok_or_else(mismatch)?;
                let coerced = match self {
                    Self::Int16 => i16::try_from(raw).map(TagValue::Int16).ok(),
                    Self::Uint16 => u16::try_from(raw).map(TagValue::Uint16).ok(),
                    Self::Int32 => i32::try_from(raw).map(TagValue::Int32).ok(),
                    Self::Uint32 => u32::try_from(raw).map(TagValue::Uint32).ok(),
                    _ => i64::try_from(raw).map(TagValue::Int64).ok(),
                };
                coerced.ok_or_else(out_of_range)
            }
            Self::Float32 => {
                let raw = value.as_f64().ok_or_else(mismatch)?;
                if raw.is_finite() && raw.abs() > f32::MAX as f64 {
                    return Err(out_of_range());
                }
                Ok(TagValue::Float32(raw as f32))
            }
            Self::Float64 => value
                .as_f64()
                .map(TagValue::Float64)
                .ok_or_else(mismatch),
            Self::String => match value {
                TagValue::String(v) => Ok(TagValue::String(v.clone())),
                _ => Err(mismatch()),
            },
            Self::Bytes => match value {
                TagValue::Bytes(v) => Ok(TagValue::Bytes(v.clone())),
                _ => Err(mismatch()),
            },
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 类型化点位值
///
/// 每个变体携带显式的位宽与符号，序列化为 `{"type": "int16", "value": 42}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TagValue {
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl TagValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int16(_) => DataType::Int16,
            Self::Uint16(_) => DataType::Uint16,
            Self::Int32(_) => DataType::Int32,
            Self::Uint32(_) => DataType::Uint32,
            Self::Int64(_) => DataType::Int64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::String(_) => DataType::String,
            Self::Bytes(_) => DataType::Bytes,
        }
    }

    /// 整数变体的宽整型视图。
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int16(v) => Some(i128::from(*v)),
            Self::Uint16(v) => Some(i128::from(*v)),
            Self::Int32(v) => Some(i128::from(*v)),
            Self::Uint32(v) => Some(i128::from(*v)),
            Self::Int64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// 数值变体的浮点视图（整数按值转换）。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(f64::from(*v)),
            Self::Float64(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String(_) | Self::Bytes(_) => self.data_type().to_string(),
            Self::Bool(v) => format!("bool {}", v),
            other => match other.as_f64() {
                Some(v) => format!("{} {}", other.data_type(), v),
                None => other.data_type().to_string(),
            },
        }
    }
}

/// 数值不满足点位声明类型。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: DataType, found: String },
    #[error("{found} is out of range for {expected}")]
    OutOfRange { expected: DataType, found: String },
}
