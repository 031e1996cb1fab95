//! MySQL 바이너리 JSON 디코딩
//!
//! binlog의 JSON 컬럼은 텍스트가 아니라 타입 태그 + 오프셋 테이블 형식으로 저장됩니다.
//!
//! | type | 의미 |
//! |------|------|
//! | 0x00 / 0x01 | small / large object |
//! | 0x02 / 0x03 | small / large array |
//! | 0x04 | literal (null, true, false) |
//! | 0x05 ~ 0x0a | int16, uint16, int32, uint32, int64, uint64 |
//! | 0x0b | double |
//! | 0x0c | utf8 string |
//! | 0x0f | opaque (MySQL 타입 + 바이트) |

use crate::error::{BinlogError, Result};
use crate::types::decimal::decode_decimal;
use byteorder::{ByteOrder, LittleEndian};
use serde_json::{Map, Number, Value};
use std::fmt;

const JSONB_SMALL_OBJECT: u8 = 0x00;
const JSONB_LARGE_OBJECT: u8 = 0x01;
const JSONB_SMALL_ARRAY: u8 = 0x02;
const JSONB_LARGE_ARRAY: u8 = 0x03;
const JSONB_LITERAL: u8 = 0x04;
const JSONB_INT16: u8 = 0x05;
const JSONB_UINT16: u8 = 0x06;
const JSONB_INT32: u8 = 0x07;
const JSONB_UINT32: u8 = 0x08;
const JSONB_INT64: u8 = 0x09;
const JSONB_UINT64: u8 = 0x0a;
const JSONB_DOUBLE: u8 = 0x0b;
const JSONB_STRING: u8 = 0x0c;
const JSONB_OPAQUE: u8 = 0x0f;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

fn truncated(what: &str) -> BinlogError {
    BinlogError::BinlogParseError(format!("truncated json {}", what))
}

/// 바이너리 JSON → serde_json::Value. 빈 입력은 null.
pub fn decode_json_binary(data: &[u8]) -> Result<Value> {
    match data.split_first() {
        None => Ok(Value::Null),
        Some((&ty, rest)) => parse_value(ty, rest),
    }
}

/// 바이너리 JSON → 텍스트
pub fn json_binary_to_string(data: &[u8], float_trailing_zero: bool) -> Result<String> {
    let value = decode_json_binary(data)?;
    Ok(render_json(&value, float_trailing_zero))
}

fn parse_value(ty: u8, data: &[u8]) -> Result<Value> {
    match ty {
        JSONB_SMALL_OBJECT => parse_container(data, false, true),
        JSONB_LARGE_OBJECT => parse_container(data, true, true),
        JSONB_SMALL_ARRAY => parse_container(data, false, false),
        JSONB_LARGE_ARRAY => parse_container(data, true, false),
        JSONB_LITERAL => Ok(literal(*data.first().ok_or_else(|| truncated("literal"))?)),
        JSONB_INT16 => fixed(data, 2).map(|b| Value::from(LittleEndian::read_i16(b))),
        JSONB_UINT16 => fixed(data, 2).map(|b| Value::from(LittleEndian::read_u16(b))),
        JSONB_INT32 => fixed(data, 4).map(|b| Value::from(LittleEndian::read_i32(b))),
        JSONB_UINT32 => fixed(data, 4).map(|b| Value::from(LittleEndian::read_u32(b))),
        JSONB_INT64 => fixed(data, 8).map(|b| Value::from(LittleEndian::read_i64(b))),
        JSONB_UINT64 => fixed(data, 8).map(|b| Value::from(LittleEndian::read_u64(b))),
        JSONB_DOUBLE => fixed(data, 8).map(|b| float_value(LittleEndian::read_f64(b))),
        JSONB_STRING => {
            let (len, n) = read_variable_length(data)?;
            let bytes = data.get(n..n + len).ok_or_else(|| truncated("string"))?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        JSONB_OPAQUE => parse_opaque(data),
        other => Err(BinlogError::BinlogParseError(format!(
            "unknown json binary type 0x{:02x}",
            other
        ))),
    }
}

fn fixed(data: &[u8], n: usize) -> Result<&[u8]> {
    data.get(..n).ok_or_else(|| truncated("number"))
}

fn literal(code: u8) -> Value {
    match code {
        LITERAL_TRUE => Value::Bool(true),
        LITERAL_FALSE => Value::Bool(false),
        _ => Value::Null,
    }
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// object / array 공통: element_count, size, (key entries), value entries
fn parse_container(data: &[u8], large: bool, is_object: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let read_offset = |pos: usize| -> Result<usize> {
        let b = data.get(pos..pos + offset_size).ok_or_else(|| truncated("offset"))?;
        Ok(if large {
            LittleEndian::read_u32(b) as usize
        } else {
            LittleEndian::read_u16(b) as usize
        })
    };

    let count = read_offset(0)?;
    let size = read_offset(offset_size)?;
    if size > data.len() {
        return Err(truncated("container"));
    }
    let header = offset_size * 2;
    let key_entry = offset_size + 2;
    let value_entry = offset_size + 1;
    let values_start = header + if is_object { count * key_entry } else { 0 };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let pos = values_start + i * value_entry;
        let ty = *data.get(pos).ok_or_else(|| truncated("value entry"))?;
        let inline = matches!(ty, JSONB_LITERAL | JSONB_INT16 | JSONB_UINT16)
            || (large && matches!(ty, JSONB_INT32 | JSONB_UINT32));
        let value = if inline {
            let slot = data.get(pos + 1..pos + 1 + offset_size).ok_or_else(|| truncated("inline"))?;
            parse_value(ty, slot)?
        } else {
            let offset = read_offset(pos + 1)?;
            let start = data.get(offset..size).ok_or_else(|| truncated("value offset"))?;
            parse_value(ty, start)?
        };
        values.push(value);
    }

    if !is_object {
        return Ok(Value::Array(values));
    }

    let mut map = Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let pos = header + i * key_entry;
        let key_offset = read_offset(pos)?;
        let len_bytes = data
            .get(pos + offset_size..pos + offset_size + 2)
            .ok_or_else(|| truncated("key entry"))?;
        let key_len = LittleEndian::read_u16(len_bytes) as usize;
        let key = data
            .get(key_offset..key_offset + key_len)
            .ok_or_else(|| truncated("key"))?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(Value::Object(map))
}

/// 7비트씩 이어지는 가변 길이 정수 (최대 5 bytes)
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for i in 0..5 {
        let b = *data.get(i).ok_or_else(|| truncated("length"))? as usize;
        length |= (b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(BinlogError::BinlogParseError("json variable length too long".to_string()))
}

/// opaque: MySQL 필드 타입 + 가변 길이 + 바이트
fn parse_opaque(data: &[u8]) -> Result<Value> {
    let (&field_type, rest) = data.split_first().ok_or_else(|| truncated("opaque"))?;
    let (len, n) = read_variable_length(rest)?;
    let bytes = rest.get(n..n + len).ok_or_else(|| truncated("opaque data"))?;

    match field_type {
        // NEWDECIMAL: precision, scale, 값
        246 if bytes.len() >= 2 => {
            let (text, _) = decode_decimal(&bytes[2..], bytes[0] as usize, bytes[1] as usize)?;
            Ok(text.parse::<f64>().map(float_value).unwrap_or(Value::String(text)))
        }
        // TIME
        11 if bytes.len() >= 8 => Ok(Value::String(packed_time(LittleEndian::read_i64(bytes)))),
        // DATE, DATETIME, TIMESTAMP
        10 | 12 | 7 if bytes.len() >= 8 => {
            let text = packed_datetime(LittleEndian::read_i64(bytes));
            if field_type == 10 {
                Ok(Value::String(text[..10].to_string()))
            } else {
                Ok(Value::String(text))
            }
        }
        _ => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}

fn packed_time(v: i64) -> String {
    if v == 0 {
        return "00:00:00".to_string();
    }
    let sign = if v < 0 { "-" } else { "" };
    let v = v.unsigned_abs();
    let int_part = v >> 24;
    format!(
        "{}{:02}:{:02}:{:02}.{:06}",
        sign,
        (int_part >> 12) % (1 << 10),
        (int_part >> 6) % (1 << 6),
        int_part % (1 << 6),
        v % (1 << 24)
    )
}

fn packed_datetime(v: i64) -> String {
    if v == 0 {
        return "0000-00-00 00:00:00".to_string();
    }
    let v = v.unsigned_abs();
    let int_part = v >> 24;
    let ymd = int_part >> 17;
    let ym = ymd >> 5;
    let hms = int_part % (1 << 17);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
        ym / 13,
        ym % 13,
        ymd % (1 << 5),
        hms >> 12,
        (hms >> 6) % (1 << 6),
        hms % (1 << 6),
        v % (1 << 24)
    )
}

/// 정수값 double을 "5.0"처럼 소수점과 함께 출력하는 래퍼
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatWithTrailingZero(pub f64);

impl fmt::Display for FloatWithTrailingZero {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_json_float(self.0, true))
    }
}

/// JSON double 출력. trailing_zero가 false면 정수값은 "5", true면 "5.0"
pub fn format_json_float(v: f64, trailing_zero: bool) -> String {
    if trailing_zero && v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

/// serde_json::Value를 텍스트로. double 표현만 serde_json과 다름
pub fn render_json(value: &Value, float_trailing_zero: bool) -> String {
    let mut out = String::new();
    write_json(&mut out, value, float_trailing_zero);
    out
}

fn write_json(out: &mut String, value: &Value, trailing_zero: bool) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => out.push_str(&i.to_string()),
            (_, Some(u), _) => out.push_str(&u.to_string()),
            (_, _, Some(f)) => out.push_str(&format_json_float(f, trailing_zero)),
            _ => out.push_str(&n.to_string()),
        },
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_json(out, item, trailing_zero);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push_str(": ");
                write_json(out, item, trailing_zero);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// {"a": 1, "b": "xy"} (small object)
    fn small_object() -> Vec<u8> {
        let mut data = vec![JSONB_SMALL_OBJECT];
        // count=2, size
        let body_len: u16 = 4 + 2 * 4 + 2 * 3 + 2 + 3;
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&body_len.to_le_bytes());
        // key entries: offset, len
        data.extend_from_slice(&18u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&19u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        // value entries
        data.push(JSONB_INT16);
        data.extend_from_slice(&1i16.to_le_bytes());
        data.push(JSONB_STRING);
        data.extend_from_slice(&20u16.to_le_bytes());
        // keys
        data.extend_from_slice(b"ab");
        // string value
        data.push(2);
        data.extend_from_slice(b"xy");
        data
    }

    #[test]
    fn test_small_object() {
        let value = decode_json_binary(&small_object()).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1, "b": "xy"}));
        assert_eq!(
            json_binary_to_string(&small_object(), false).unwrap(),
            r#"{"a": 1, "b": "xy"}"#
        );
    }

    #[test]
    fn test_scalars() {
        assert_eq!(decode_json_binary(&[]).unwrap(), Value::Null);
        assert_eq!(decode_json_binary(&[JSONB_LITERAL, LITERAL_TRUE]).unwrap(), Value::Bool(true));
        let mut data = vec![JSONB_INT64];
        data.extend_from_slice(&(-7i64).to_le_bytes());
        assert_eq!(decode_json_binary(&data).unwrap(), serde_json::json!(-7));
        assert!(decode_json_binary(&[0x42]).is_err());
        assert!(decode_json_binary(&[JSONB_INT32, 1]).is_err());
    }

    #[test]
    fn test_double_trailing_zero() {
        let mut data = vec![JSONB_DOUBLE];
        data.extend_from_slice(&5.0f64.to_le_bytes());
        assert_eq!(json_binary_to_string(&data, false).unwrap(), "5");
        assert_eq!(json_binary_to_string(&data, true).unwrap(), "5.0");
        assert_eq!(FloatWithTrailingZero(5.0).to_string(), "5.0");
        assert_eq!(FloatWithTrailingZero(2.5).to_string(), "2.5");
        assert_eq!(format_json_float(5.0, false), "5");
    }

    #[test]
    fn test_array_with_inline_literal() {
        // [null, true]
        let mut data = vec![JSONB_SMALL_ARRAY];
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&10u16.to_le_bytes());
        data.push(JSONB_LITERAL);
        data.extend_from_slice(&[LITERAL_NULL, 0]);
        data.push(JSONB_LITERAL);
        data.extend_from_slice(&[LITERAL_TRUE, 0]);
        assert_eq!(decode_json_binary(&data).unwrap(), serde_json::json!([null, true]));
    }

    #[test]
    fn test_opaque_decimal() {
        // opaque NEWDECIMAL(5,2) 12.50
        let dec = crate::types::decimal::encode_decimal("12.50", 5, 2).unwrap();
        let mut payload = vec![5u8, 2];
        payload.extend_from_slice(&dec);
        let mut data = vec![JSONB_OPAQUE, 246, payload.len() as u8];
        data.extend_from_slice(&payload);
        assert_eq!(json_binary_to_string(&data, true).unwrap(), "12.5");
    }
}
