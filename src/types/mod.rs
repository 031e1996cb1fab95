//! MySQL 컬럼 타입과 값 표현
//!
//! - `ColumnType`: 프로토콜/binlog 공통 타입 코드
//! - `FieldValue`: 결과셋(텍스트/바이너리 프로토콜) 값
//! - `CellValue`: binlog 행 이벤트에서 디코딩한 값

pub mod decimal;
pub mod json;
pub mod temporal;

use crate::error::{BinlogError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// MySQL 컬럼 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    VarChar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    TypedArray = 20,
    Vector = 242,
    Invalid = 243,
    Bool = 244,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl TryFrom<u8> for ColumnType {
    type Error = BinlogError;

    fn try_from(val: u8) -> Result<Self> {
        let ty = match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::VarChar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            20 => ColumnType::TypedArray,
            242 => ColumnType::Vector,
            243 => ColumnType::Invalid,
            244 => ColumnType::Bool,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            other => {
                return Err(BinlogError::BinlogParseError(format!(
                    "unknown column type {}",
                    other
                )))
            }
        };
        Ok(ty)
    }
}

impl ColumnType {
    /// 정수 계열 여부
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Int24
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Year
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ColumnType::Float | ColumnType::Double)
    }

    /// TABLE_MAP 이벤트에서 이 타입의 메타데이터가 차지하는 바이트 수
    pub fn metadata_len(self) -> usize {
        match self {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Geometry
            | ColumnType::Json
            | ColumnType::Vector
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => 1,
            ColumnType::VarChar
            | ColumnType::VarString
            | ColumnType::Bit
            | ColumnType::NewDecimal
            | ColumnType::String
            | ColumnType::Enum
            | ColumnType::Set => 2,
            _ => 0,
        }
    }
}

/// 결과셋 값 (텍스트/바이너리 프로토콜 공통)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    String(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::String(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Signed(v) => Some(*v),
            FieldValue::Unsigned(v) => i64::try_from(*v).ok(),
            FieldValue::String(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned(v) => Some(*v),
            FieldValue::Signed(v) => u64::try_from(*v).ok(),
            FieldValue::String(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Signed(v) => Some(*v as f64),
            FieldValue::Unsigned(v) => Some(*v as f64),
            FieldValue::String(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            FieldValue::Null => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Unsigned(v) => write!(f, "{}", v),
            FieldValue::Signed(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// binlog 행 이벤트 셀 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Signed(i64),
    Unsigned(u64),
    Float(f32),
    Double(f64),
    /// DECIMAL 문자열 ("-12.340")
    Decimal(String),
    /// UTF-8로 해석 가능한 문자열
    String(String),
    /// 바이너리 문자열, BLOB, GEOMETRY
    Bytes(Vec<u8>),
    Date(String),
    Time(String),
    DateTime(String),
    Timestamp(String),
    Year(u16),
    Bit(u64),
    /// ENUM 인덱스 (1부터)
    Enum(u16),
    /// SET 비트마스크
    Set(u64),
    /// JSON 텍스트
    Json(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// 숫자 비교용 값
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Signed(v) => Some(*v as f64),
            CellValue::Unsigned(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v as f64),
            CellValue::Double(v) => Some(*v),
            CellValue::Decimal(s) => s.parse().ok(),
            CellValue::Year(v) => Some(*v as f64),
            CellValue::Bit(v) | CellValue::Set(v) => Some(*v as f64),
            CellValue::Enum(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "NULL"),
            CellValue::Signed(v) => write!(f, "{}", v),
            CellValue::Unsigned(v) => write!(f, "{}", v),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Double(v) => write!(f, "{}", v),
            CellValue::Year(v) => write!(f, "{}", v),
            CellValue::Bit(v) | CellValue::Set(v) => write!(f, "{}", v),
            CellValue::Enum(v) => write!(f, "{}", v),
            CellValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            CellValue::Decimal(s)
            | CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::DateTime(s)
            | CellValue::Timestamp(s)
            | CellValue::Json(s) => write!(f, "{}", s),
        }
    }
}
