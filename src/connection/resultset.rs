//! 결과셋: 컬럼 정의, 텍스트/바이너리 행 인코딩·디코딩

use crate::error::{BinlogError, Result};
use crate::protocol::codec::{bitmap_len, put_lenenc_bytes, put_lenenc_int, ReadMysqlExt};
use crate::protocol::handshake::OkPacket;
use crate::protocol::status;
use crate::types::temporal::{
    encode_binary_datetime, format_binary_date, format_binary_datetime, format_binary_time,
};
use crate::types::{ColumnType, FieldValue};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use serde::Serialize;
use std::io::Cursor;

/// 컬럼 플래그
pub mod field_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRI_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
}

/// 컬럼 정의 (Protocol::ColumnDefinition41)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    /// 테스트 서버 등에서 간단히 컬럼을 만들 때 사용
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Field {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            charset: 45,
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & field_flags::UNSIGNED != 0
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        // catalog ("def")
        cursor.read_lenenc_bytes()?;
        let schema = cursor.read_lenenc_string()?;
        let table = cursor.read_lenenc_string()?;
        let org_table = cursor.read_lenenc_string()?;
        let name = cursor.read_lenenc_string()?;
        let org_name = cursor.read_lenenc_string()?;
        // 고정 길이 필드 길이 (0x0c)
        cursor.read_lenenc_int()?;
        let charset = cursor.read_u16::<LittleEndian>()?;
        let column_length = cursor.read_u32::<LittleEndian>()?;
        let column_type = ColumnType::try_from(cursor.read_u8()?)
            .map_err(|e| BinlogError::MalformedPacket(e.to_string()))?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let decimals = cursor.read_u8()?;

        Ok(Field {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        put_lenenc_bytes(&mut buf, b"def");
        put_lenenc_bytes(&mut buf, self.schema.as_bytes());
        put_lenenc_bytes(&mut buf, self.table.as_bytes());
        put_lenenc_bytes(&mut buf, self.org_table.as_bytes());
        put_lenenc_bytes(&mut buf, self.name.as_bytes());
        put_lenenc_bytes(&mut buf, self.org_name.as_bytes());
        put_lenenc_int(&mut buf, 0x0c);
        buf.put_u16_le(self.charset);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type as u8);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);
        buf
    }
}

/// 컬럼 + 행
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<FieldValue>>,
}

impl ResultSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// (행, 컬럼 이름) 값
    pub fn get(&self, row: usize, name: &str) -> Option<&FieldValue> {
        let col = self.column_index(name)?;
        self.rows.get(row)?.get(col)
    }
}

/// 쿼리 결과. OK 패킷이면 result_set이 None
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub status: u16,
    pub warnings: u16,
    pub affected_rows: u64,
    pub insert_id: u64,
    pub info: String,
    pub result_set: Option<ResultSet>,
}

impl QueryResult {
    pub fn from_ok(ok: &OkPacket) -> Self {
        QueryResult {
            status: ok.status,
            warnings: ok.warnings,
            affected_rows: ok.affected_rows,
            insert_id: ok.last_insert_id,
            info: ok.info.clone(),
            result_set: None,
        }
    }

    pub fn has_more_results(&self) -> bool {
        self.status & status::MORE_RESULTS_EXISTS != 0
    }

    pub fn rows(&self) -> &[Vec<FieldValue>] {
        self.result_set.as_ref().map(|r| r.rows.as_slice()).unwrap_or(&[])
    }
}

/// 행 복사본 만들기 (스트리밍 중 빌린 행을 보관할 때)
pub fn copy_out(row: &[FieldValue]) -> Vec<FieldValue> {
    row.to_vec()
}

/// 텍스트 프로토콜 행 디코딩
pub fn parse_text_row(data: &[u8], fields: &[Field]) -> Result<Vec<FieldValue>> {
    let mut cursor = Cursor::new(data);
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        let value = match cursor.read_lenenc_bytes()? {
            None => FieldValue::Null,
            Some(bytes) => text_value(field, bytes),
        };
        values.push(value);
    }
    Ok(values)
}

fn text_value(field: &Field, bytes: &[u8]) -> FieldValue {
    let text = std::str::from_utf8(bytes).ok();
    let ty = field.column_type;
    let parsed = if ty.is_integer() {
        text.and_then(|s| {
            if field.is_unsigned() {
                s.parse().ok().map(FieldValue::Unsigned)
            } else {
                s.parse().ok().map(FieldValue::Signed)
            }
        })
    } else if ty.is_float() {
        text.and_then(|s| s.parse().ok()).map(FieldValue::Float)
    } else {
        None
    };
    parsed.unwrap_or_else(|| FieldValue::String(bytes.to_vec()))
}

/// 텍스트 프로토콜 행 인코딩
pub fn encode_text_row(values: &[FieldValue]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for value in values {
        match value {
            FieldValue::Null => buf.put_u8(0xFB),
            FieldValue::String(b) => put_lenenc_bytes(&mut buf, b),
            other => put_lenenc_bytes(&mut buf, other.to_string().as_bytes()),
        }
    }
    buf
}

/// 바이너리 프로토콜 행 디코딩: 0x00, null bitmap (offset 2), 값
pub fn parse_binary_row(data: &[u8], fields: &[Field]) -> Result<Vec<FieldValue>> {
    let mut cursor = Cursor::new(data);
    if cursor.read_u8()? != 0x00 {
        return Err(BinlogError::MalformedPacket("invalid binary row header".to_string()));
    }
    let null_bitmap = cursor.take_bytes(bitmap_len(fields.len() + 2))?;

    let mut values = Vec::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
        let bit = i + 2;
        if null_bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(FieldValue::Null);
            continue;
        }
        values.push(read_binary_value(&mut cursor, field)?);
    }
    Ok(values)
}

pub(crate) fn read_binary_value(cursor: &mut Cursor<&[u8]>, field: &Field) -> Result<FieldValue> {
    let unsigned = field.is_unsigned();
    let value = match field.column_type {
        ColumnType::Null => FieldValue::Null,
        ColumnType::Tiny => {
            let v = cursor.read_u8()?;
            if unsigned {
                FieldValue::Unsigned(v as u64)
            } else {
                FieldValue::Signed(v as i8 as i64)
            }
        }
        ColumnType::Short | ColumnType::Year => {
            let v = cursor.read_u16::<LittleEndian>()?;
            if unsigned || field.column_type == ColumnType::Year {
                FieldValue::Unsigned(v as u64)
            } else {
                FieldValue::Signed(v as i16 as i64)
            }
        }
        ColumnType::Int24 | ColumnType::Long => {
            let v = cursor.read_u32::<LittleEndian>()?;
            if unsigned {
                FieldValue::Unsigned(v as u64)
            } else {
                FieldValue::Signed(v as i32 as i64)
            }
        }
        ColumnType::LongLong => {
            let v = cursor.read_u64::<LittleEndian>()?;
            if unsigned {
                FieldValue::Unsigned(v)
            } else {
                FieldValue::Signed(v as i64)
            }
        }
        ColumnType::Float => FieldValue::Float(cursor.read_f32::<LittleEndian>()? as f64),
        ColumnType::Double => FieldValue::Float(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Date | ColumnType::NewDate => {
            let len = cursor.read_u8()? as usize;
            FieldValue::String(format_binary_date(cursor.take_bytes(len)?)?.into_bytes())
        }
        ColumnType::DateTime | ColumnType::Timestamp | ColumnType::DateTime2 | ColumnType::Timestamp2 => {
            let len = cursor.read_u8()? as usize;
            FieldValue::String(format_binary_datetime(cursor.take_bytes(len)?)?.into_bytes())
        }
        ColumnType::Time | ColumnType::Time2 => {
            let len = cursor.read_u8()? as usize;
            FieldValue::String(format_binary_time(cursor.take_bytes(len)?)?.into_bytes())
        }
        _ => FieldValue::String(cursor.read_lenenc_bytes()?.unwrap_or_default().to_vec()),
    };
    Ok(value)
}

/// 바이너리 프로토콜 행 인코딩 (테스트 서버용)
pub fn encode_binary_row(values: &[FieldValue], fields: &[Field]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(values.len() * 8 + 8);
    buf.put_u8(0x00);
    let bitmap_start = buf.len();
    buf.put_bytes(0, bitmap_len(fields.len() + 2));

    for (i, (value, field)) in values.iter().zip(fields.iter()).enumerate() {
        if value.is_null() {
            let bit = i + 2;
            buf[bitmap_start + bit / 8] |= 1 << (bit % 8);
            continue;
        }
        let int = || {
            value
                .as_i64()
                .or_else(|| value.as_u64().map(|v| v as i64))
                .ok_or_else(|| BinlogError::ProtocolError(format!("value {} is not an integer", value)))
        };
        match field.column_type {
            ColumnType::Tiny => buf.put_u8(int()? as u8),
            ColumnType::Short | ColumnType::Year => buf.put_u16_le(int()? as u16),
            ColumnType::Int24 | ColumnType::Long => buf.put_u32_le(int()? as u32),
            ColumnType::LongLong => buf.put_u64_le(int()? as u64),
            ColumnType::Float => buf.put_f32_le(value.as_f64().unwrap_or_default() as f32),
            ColumnType::Double => buf.put_f64_le(value.as_f64().unwrap_or_default()),
            ColumnType::Date
            | ColumnType::NewDate
            | ColumnType::DateTime
            | ColumnType::Timestamp
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => {
                let text = value.to_string();
                buf.put_slice(&encode_binary_datetime(&text)?);
            }
            _ => match value {
                FieldValue::String(b) => put_lenenc_bytes(&mut buf, b),
                other => put_lenenc_bytes(&mut buf, other.to_string().as_bytes()),
            },
        }
    }
    Ok(buf)
}
