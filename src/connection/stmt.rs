//! Prepared statement (바이너리 프로토콜)

use super::resultset::{Field, QueryResult};
use super::Connection;
use crate::error::{BinlogError, Result};
use crate::protocol::codec::{bitmap_len, put_lenenc_bytes};
use crate::protocol::Command;
use crate::types::ColumnType;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use std::collections::HashSet;
use std::io::Cursor;
use tracing::debug;

/// COM_STMT_EXECUTE flags
pub const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;

const UNSIGNED_FLAG: u8 = 0x80;

/// 바인드 파라미터
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Param {
    /// (MySQL 타입, unsigned 여부)
    pub fn column_type(&self) -> (ColumnType, bool) {
        match self {
            Param::Null => (ColumnType::Null, false),
            Param::I8(_) | Param::Bool(_) => (ColumnType::Tiny, false),
            Param::I16(_) => (ColumnType::Short, false),
            Param::I32(_) => (ColumnType::Long, false),
            Param::I64(_) => (ColumnType::LongLong, false),
            Param::U8(_) => (ColumnType::Tiny, true),
            Param::U16(_) => (ColumnType::Short, true),
            Param::U32(_) => (ColumnType::Long, true),
            Param::U64(_) => (ColumnType::LongLong, true),
            Param::F32(_) => (ColumnType::Float, false),
            Param::F64(_) => (ColumnType::Double, false),
            Param::Str(_) | Param::Bytes(_) | Param::Json(_) => (ColumnType::String, false),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    /// 값 바이트 (NULL은 아무것도 쓰지 않음)
    pub fn encode_value<B: BufMut>(&self, buf: &mut B) {
        match self {
            Param::Null => {}
            Param::I8(v) => buf.put_i8(*v),
            Param::I16(v) => buf.put_i16_le(*v),
            Param::I32(v) => buf.put_i32_le(*v),
            Param::I64(v) => buf.put_i64_le(*v),
            Param::U8(v) => buf.put_u8(*v),
            Param::U16(v) => buf.put_u16_le(*v),
            Param::U32(v) => buf.put_u32_le(*v),
            Param::U64(v) => buf.put_u64_le(*v),
            Param::F32(v) => buf.put_f32_le(*v),
            Param::F64(v) => buf.put_f64_le(*v),
            Param::Bool(v) => buf.put_u8(u8::from(*v)),
            Param::Str(s) => put_lenenc_bytes(buf, s.as_bytes()),
            Param::Bytes(b) => put_lenenc_bytes(buf, b),
            Param::Json(v) => put_lenenc_bytes(buf, v.to_string().as_bytes()),
        }
    }
}

macro_rules! impl_param_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Param {
            fn from(v: $ty) -> Self {
                Param::$variant(v)
            }
        })*
    };
}

impl_param_from! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64, bool => Bool,
    String => Str, Vec<u8> => Bytes, serde_json::Value => Json,
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Str(v.to_string())
    }
}

impl From<&[u8]> for Param {
    fn from(v: &[u8]) -> Self {
        Param::Bytes(v.to_vec())
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Param::Null)
    }
}

/// null bitmap + new_params_bound + 타입 + 값 (COM_STMT_EXECUTE / 쿼리 속성 공통)
pub(crate) fn encode_params(buf: &mut Vec<u8>, params: &[Param], skip_values: &HashSet<usize>) {
    let bitmap_start = buf.len();
    buf.put_bytes(0, bitmap_len(params.len()));
    for (i, p) in params.iter().enumerate() {
        if p.is_null() {
            buf[bitmap_start + i / 8] |= 1 << (i % 8);
        }
    }
    // new_params_bound_flag
    buf.put_u8(1);
    for p in params {
        let (ty, unsigned) = p.column_type();
        buf.put_u8(ty as u8);
        buf.put_u8(if unsigned { UNSIGNED_FLAG } else { 0 });
    }
    for (i, p) in params.iter().enumerate() {
        if !skip_values.contains(&i) {
            p.encode_value(buf);
        }
    }
}

/// COM_STMT_PREPARE 응답 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub columns: u16,
    pub params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if cursor.read_u8()? != 0x00 {
            return Err(BinlogError::MalformedPacket("invalid prepare response".to_string()));
        }
        let statement_id = cursor.read_u32::<LittleEndian>()?;
        let columns = cursor.read_u16::<LittleEndian>()?;
        let params = cursor.read_u16::<LittleEndian>()?;
        // reserved
        cursor.read_u8()?;
        let warnings = cursor.read_u16::<LittleEndian>().unwrap_or(0);
        Ok(PrepareOk {
            statement_id,
            columns,
            params,
            warnings,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.put_u8(0x00);
        buf.put_u32_le(self.statement_id);
        buf.put_u16_le(self.columns);
        buf.put_u16_le(self.params);
        buf.put_u8(0);
        buf.put_u16_le(self.warnings);
        buf
    }
}

/// 서버에 준비된 statement 핸들
#[derive(Debug, Clone)]
pub struct Stmt {
    id: u32,
    sql: String,
    params: Vec<Field>,
    columns: Vec<Field>,
    param_count: usize,
    long_data: HashSet<usize>,
    closed: bool,
}

impl Stmt {
    pub(crate) fn new(sql: &str, ok: PrepareOk, params: Vec<Field>, columns: Vec<Field>) -> Self {
        Stmt {
            id: ok.statement_id,
            sql: sql.to_string(),
            params,
            columns,
            param_count: ok.params as usize,
            long_data: HashSet::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn param_fields(&self) -> &[Field] {
        &self.params
    }

    pub fn columns(&self) -> &[Field] {
        &self.columns
    }

    /// COM_STMT_EXECUTE 패킷 본문 (커맨드 바이트 제외)
    pub fn build_execute(&self, params: &[Param]) -> Result<Vec<u8>> {
        if params.len() != self.param_count {
            return Err(BinlogError::ProtocolError(format!(
                "statement expects {} parameters, got {}",
                self.param_count,
                params.len()
            )));
        }
        let mut buf = Vec::with_capacity(16 + params.len() * 9);
        buf.put_u32_le(self.id);
        buf.put_u8(CURSOR_TYPE_NO_CURSOR);
        // iteration count
        buf.put_u32_le(1);
        if !params.is_empty() {
            encode_params(&mut buf, params, &self.long_data);
        }
        Ok(buf)
    }

    /// 파라미터 실행
    pub async fn execute(&mut self, conn: &mut Connection, params: &[Param]) -> Result<QueryResult> {
        self.ensure_open()?;
        let body = self.build_execute(params)?;
        conn.send_command(Command::StmtExecute, &body).await?;
        self.long_data.clear();
        conn.read_result(true).await
    }

    /// 긴 파라미터 값을 나누어 전송 (서버 응답 없음)
    pub async fn send_long_data(&mut self, conn: &mut Connection, param: u16, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if param as usize >= self.param_count {
            return Err(BinlogError::ProtocolError(format!(
                "parameter index {} out of range",
                param
            )));
        }
        let mut body = Vec::with_capacity(6 + data.len());
        body.put_u32_le(self.id);
        body.put_u16_le(param);
        body.put_slice(data);
        conn.send_command(Command::StmtSendLongData, &body).await?;
        self.long_data.insert(param as usize);
        Ok(())
    }

    /// 누적된 long data 초기화
    pub async fn reset(&mut self, conn: &mut Connection) -> Result<()> {
        self.ensure_open()?;
        conn.send_command(Command::StmtReset, &self.id.to_le_bytes()).await?;
        self.long_data.clear();
        conn.read_ok().await.map(|_| ())
    }

    /// statement 해제 (서버 응답 없음)
    pub async fn close(&mut self, conn: &mut Connection) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        conn.send_command(Command::StmtClose, &self.id.to_le_bytes()).await?;
        self.closed = true;
        debug!("Closed statement {}", self.id);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BinlogError::ProtocolError(format!("statement {} is closed", self.id)))
        } else {
            Ok(())
        }
    }
}
