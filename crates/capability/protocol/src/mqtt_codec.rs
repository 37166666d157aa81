//! MQTT 负载编解码
//!
//! 设备上报格式不统一，解析时依次尝试：
//! - 纯数值 / 布尔文本：`25.5`、`true`、`on`
//! - JSON：`25.5`、`"text"`、`{"value": 25.5}`
//! - key=value：`temp=25.5`

use crate::error::CodecError;
use domain::{DataType, TagValue};

/// 按声明类型解析负载
pub fn decode_payload(payload: &[u8], data_type: DataType) -> Result<TagValue, CodecError> {
    if data_type == DataType::Bytes {
        return Ok(TagValue::Bytes(payload.to_vec()));
    }

    let text = std::str::from_utf8(payload)
        .map_err(|e| CodecError::DataParse(format!("payload is not utf-8: {}", e)))?
        .trim();

    if data_type == DataType::String {
        return Ok(TagValue::String(parse_text(text)));
    }

    let scalar = parse_scalar(text)
        .ok_or_else(|| CodecError::DataParse(format!("no scalar value in payload: {}", text)))?;
    let candidate = match (data_type, scalar) {
        (DataType::Bool, Scalar::Int(0)) => TagValue::Bool(false),
        (DataType::Bool, Scalar::Int(1)) => TagValue::Bool(true),
        (_, Scalar::Int(v)) => TagValue::Int64(v),
        (_, Scalar::Float(v)) => TagValue::Float64(v),
        (_, Scalar::Bool(v)) => TagValue::Bool(v),
    };
    data_type
        .coerce(&candidate)
        .map_err(|e| CodecError::DataParse(e.to_string()))
}

/// 编码为发布负载
pub fn encode_payload(value: &TagValue) -> Vec<u8> {
    match value {
        TagValue::Bool(v) => v.to_string().into_bytes(),
        TagValue::Int16(v) => v.to_string().into_bytes(),
        TagValue::Uint16(v) => v.to_string().into_bytes(),
        TagValue::Int32(v) => v.to_string().into_bytes(),
        TagValue::Uint32(v) => v.to_string().into_bytes(),
        TagValue::Int64(v) => v.to_string().into_bytes(),
        TagValue::Float32(v) => v.to_string().into_bytes(),
        TagValue::Float64(v) => v.to_string().into_bytes(),
        TagValue::String(v) => v.clone().into_bytes(),
        TagValue::Bytes(v) => v.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
}

fn parse_text(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::String(inner)) => inner,
        Ok(serde_json::Value::Object(map)) => match map.get("value") {
            Some(serde_json::Value::String(inner)) => inner.clone(),
            _ => text.to_string(),
        },
        _ => text.to_string(),
    }
}

fn parse_scalar(text: &str) -> Option<Scalar> {
    // 格式1：纯数值 / 布尔文本
    if let Some(scalar) = parse_plain(text) {
        return Some(scalar);
    }

    // 格式2：JSON {"value": 123.45}
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
        let value = json.get("value").cloned().unwrap_or(json);
        if let Some(scalar) = from_json(&value) {
            return Some(scalar);
        }
    }

    // 格式3：key=value
    text.split(['=', ':', ','])
        .skip(1)
        .find_map(|part| parse_plain(part.trim()))
}

fn parse_plain(text: &str) -> Option<Scalar> {
    if let Ok(value) = text.parse::<i64>() {
        return Some(Scalar::Int(value));
    }
    if let Ok(value) = text.parse::<f64>() {
        return Some(Scalar::Float(value));
    }
    match text.to_ascii_lowercase().as_str() {
        "true" | "on" => Some(Scalar::Bool(true)),
        "false" | "off" => Some(Scalar::Bool(false)),
        _ => None,
    }
}

fn from_json(value: &serde_json::Value) -> Option<Scalar> {
    match value {
        serde_json::Value::Bool(v) => Some(Scalar::Bool(*v)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Scalar::Int)
            .or_else(|| n.as_f64().map(Scalar::Float)),
        serde_json::Value::String(s) => parse_plain(s.trim()),
        _ => None,
    }
}
