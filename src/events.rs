//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 행 이벤트를 제외한 이벤트 본문 디코딩도 여기서 합니다.
//! (행 이벤트는 `binlog::rows`)

use crate::error::{BinlogError, Result};
use crate::gtid::{MariadbGtid, MysqlGtidSet};
use crate::protocol::codec::{bit_is_set, put_lenenc_int, ReadMysqlExt};
use crate::types::{CellValue, ColumnType};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use bytes::BufMut;
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::sync::Arc;
use uuid::Uuid;

/// 이벤트 헤더 크기
pub const EVENT_HEADER_SIZE: usize = 19;

/// CRC32 체크섬 크기
pub const CHECKSUM_SIZE: usize = 4;

/// binlog 파일 매직 넘버
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, b'b', b'i', b'n'];

/// 이벤트 헤더 플래그
pub mod event_flags {
    pub const BINLOG_IN_USE: u16 = 0x0001;
    pub const THREAD_SPECIFIC: u16 = 0x0004;
    pub const SUPPRESS_USE: u16 = 0x0008;
    pub const ARTIFICIAL: u16 = 0x0020;
    pub const RELAY_LOG: u16 = 0x0040;
}

/// 행 이벤트 플래그
pub mod rows_flags {
    pub const STMT_END: u16 = 0x0001;
    pub const NO_FOREIGN_KEY_CHECKS: u16 = 0x0002;
    pub const RELAXED_UNIQUE_CHECKS: u16 = 0x0004;
    pub const COMPLETE_ROWS: u16 = 0x0008;
}

/// MySQL / MariaDB Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Unknown(u8),
    StartV3,
    Query,
    Stop,
    Rotate,
    Intvar,
    Rand,
    UserVar,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV0,
    UpdateRowsV0,
    DeleteRowsV0,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Incident,
    Heartbeat,
    Ignorable,
    RowsQuery,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    TransactionContext,
    ViewChange,
    XaPrepareLog,
    PartialUpdateRows,
    TransactionPayload,
    HeartbeatV2,
    GtidTagged,
    MariadbAnnotateRows,
    MariadbBinlogCheckpoint,
    MariadbGtid,
    MariadbGtidList,
    MariadbStartEncryption,
    MariadbQueryCompressed,
    MariadbWriteRowsCompressedV1,
    MariadbUpdateRowsCompressedV1,
    MariadbDeleteRowsCompressedV1,
    MariadbWriteRowsCompressed,
    MariadbUpdateRowsCompressed,
    MariadbDeleteRowsCompressed,
    /// 파일 하나를 다 읽었음을 알리는 합성 이벤트
    FakeDone,
}

/// 행 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

impl RowsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RowsKind::Write => "insert",
            RowsKind::Update => "update",
            RowsKind::Delete => "delete",
        }
    }
}

impl std::str::FromStr for RowsKind {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" | "write" => Ok(RowsKind::Write),
            "update" => Ok(RowsKind::Update),
            "delete" => Ok(RowsKind::Delete),
            other => Err(BinlogError::ConfigError(format!("Unknown rows event type '{}'", other))),
        }
    }
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::StartV3,
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            5 => EventType::Intvar,
            13 => EventType::Rand,
            14 => EventType::UserVar,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            20 => EventType::WriteRowsV0,
            21 => EventType::UpdateRowsV0,
            22 => EventType::DeleteRowsV0,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            26 => EventType::Incident,
            27 => EventType::Heartbeat,
            28 => EventType::Ignorable,
            29 => EventType::RowsQuery,
            30 => EventType::WriteRowsV2,
            31 => EventType::UpdateRowsV2,
            32 => EventType::DeleteRowsV2,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            36 => EventType::TransactionContext,
            37 => EventType::ViewChange,
            38 => EventType::XaPrepareLog,
            39 => EventType::PartialUpdateRows,
            40 => EventType::TransactionPayload,
            41 => EventType::HeartbeatV2,
            42 => EventType::GtidTagged,
            160 => EventType::MariadbAnnotateRows,
            161 => EventType::MariadbBinlogCheckpoint,
            162 => EventType::MariadbGtid,
            163 => EventType::MariadbGtidList,
            164 => EventType::MariadbStartEncryption,
            165 => EventType::MariadbQueryCompressed,
            166 => EventType::MariadbWriteRowsCompressedV1,
            167 => EventType::MariadbUpdateRowsCompressedV1,
            168 => EventType::MariadbDeleteRowsCompressedV1,
            169 => EventType::MariadbWriteRowsCompressed,
            170 => EventType::MariadbUpdateRowsCompressed,
            171 => EventType::MariadbDeleteRowsCompressed,
            0xFF => EventType::FakeDone,
            other => EventType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            EventType::Unknown(v) => v,
            EventType::StartV3 => 1,
            EventType::Query => 2,
            EventType::Stop => 3,
            EventType::Rotate => 4,
            EventType::Intvar => 5,
            EventType::Rand => 13,
            EventType::UserVar => 14,
            EventType::FormatDescription => 15,
            EventType::Xid => 16,
            EventType::TableMap => 19,
            EventType::WriteRowsV0 => 20,
            EventType::UpdateRowsV0 => 21,
            EventType::DeleteRowsV0 => 22,
            EventType::WriteRowsV1 => 23,
            EventType::UpdateRowsV1 => 24,
            EventType::DeleteRowsV1 => 25,
            EventType::Incident => 26,
            EventType::Heartbeat => 27,
            EventType::Ignorable => 28,
            EventType::RowsQuery => 29,
            EventType::WriteRowsV2 => 30,
            EventType::UpdateRowsV2 => 31,
            EventType::DeleteRowsV2 => 32,
            EventType::Gtid => 33,
            EventType::AnonymousGtid => 34,
            EventType::PreviousGtids => 35,
            EventType::TransactionContext => 36,
            EventType::ViewChange => 37,
            EventType::XaPrepareLog => 38,
            EventType::PartialUpdateRows => 39,
            EventType::TransactionPayload => 40,
            EventType::HeartbeatV2 => 41,
            EventType::GtidTagged => 42,
            EventType::MariadbAnnotateRows => 160,
            EventType::MariadbBinlogCheckpoint => 161,
            EventType::MariadbGtid => 162,
            EventType::MariadbGtidList => 163,
            EventType::MariadbStartEncryption => 164,
            EventType::MariadbQueryCompressed => 165,
            EventType::MariadbWriteRowsCompressedV1 => 166,
            EventType::MariadbUpdateRowsCompressedV1 => 167,
            EventType::MariadbDeleteRowsCompressedV1 => 168,
            EventType::MariadbWriteRowsCompressed => 169,
            EventType::MariadbUpdateRowsCompressed => 170,
            EventType::MariadbDeleteRowsCompressed => 171,
            EventType::FakeDone => 0xFF,
        }
    }

    /// 행 이벤트면 (종류, 버전, 압축 여부)
    pub fn rows_info(self) -> Option<(RowsKind, u8, bool)> {
        use EventType::*;
        let info = match self {
            WriteRowsV0 => (RowsKind::Write, 0, false),
            UpdateRowsV0 => (RowsKind::Update, 0, false),
            DeleteRowsV0 => (RowsKind::Delete, 0, false),
            WriteRowsV1 => (RowsKind::Write, 1, false),
            UpdateRowsV1 | PartialUpdateRows => (RowsKind::Update, 1, false),
            DeleteRowsV1 => (RowsKind::Delete, 1, false),
            WriteRowsV2 => (RowsKind::Write, 2, false),
            UpdateRowsV2 => (RowsKind::Update, 2, false),
            DeleteRowsV2 => (RowsKind::Delete, 2, false),
            MariadbWriteRowsCompressedV1 => (RowsKind::Write, 1, true),
            MariadbUpdateRowsCompressedV1 => (RowsKind::Update, 1, true),
            MariadbDeleteRowsCompressedV1 => (RowsKind::Delete, 1, true),
            MariadbWriteRowsCompressed => (RowsKind::Write, 2, true),
            MariadbUpdateRowsCompressed => (RowsKind::Update, 2, true),
            MariadbDeleteRowsCompressed => (RowsKind::Delete, 2, true),
            _ => return None,
        };
        Some(info)
    }

    pub fn is_rows_event(self) -> bool {
        self.rows_info().is_some()
    }

    /// 같은 버전의 비압축 행 이벤트 타입
    pub fn rows_event_type(kind: RowsKind, version: u8) -> EventType {
        use EventType::*;
        match (kind, version) {
            (RowsKind::Write, 0) => WriteRowsV0,
            (RowsKind::Update, 0) => UpdateRowsV0,
            (RowsKind::Delete, 0) => DeleteRowsV0,
            (RowsKind::Write, 1) => WriteRowsV1,
            (RowsKind::Update, 1) => UpdateRowsV1,
            (RowsKind::Delete, 1) => DeleteRowsV1,
            (RowsKind::Write, _) => WriteRowsV2,
            (RowsKind::Update, _) => UpdateRowsV2,
            (RowsKind::Delete, _) => DeleteRowsV2,
        }
    }
}

/// Binlog 이벤트 헤더 (19 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 헤더 포함 이벤트 전체 길이
    pub event_size: u32,
    /// 다음 이벤트 위치
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(BinlogError::BinlogParseError(format!(
                "Invalid event header: {} bytes",
                data.len()
            )));
        }
        let header = EventHeader {
            timestamp: LittleEndian::read_u32(&data[0..4]),
            event_type: EventType::from_u8(data[4]),
            server_id: LittleEndian::read_u32(&data[5..9]),
            event_size: LittleEndian::read_u32(&data[9..13]),
            log_pos: LittleEndian::read_u32(&data[13..17]),
            flags: LittleEndian::read_u16(&data[17..19]),
        };
        if (header.event_size as usize) < EVENT_HEADER_SIZE {
            return Err(BinlogError::BinlogParseError(format!(
                "Invalid event size {}",
                header.event_size
            )));
        }
        Ok(header)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.timestamp);
        buf.put_u8(self.event_type.as_u8());
        buf.put_u32_le(self.server_id);
        buf.put_u32_le(self.event_size);
        buf.put_u32_le(self.log_pos);
        buf.put_u16_le(self.flags);
    }

    /// 이 이벤트가 시작하는 위치
    pub fn start_pos(&self) -> u32 {
        self.log_pos.saturating_sub(self.event_size)
    }
}

/// 체크섬 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[default]
    Off,
    Crc32,
    Undefined,
}

impl ChecksumAlgorithm {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ChecksumAlgorithm::Off,
            1 => ChecksumAlgorithm::Crc32,
            _ => ChecksumAlgorithm::Undefined,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ChecksumAlgorithm::Off => 0,
            ChecksumAlgorithm::Crc32 => 1,
            ChecksumAlgorithm::Undefined => 255,
        }
    }

    pub fn is_crc32(self) -> bool {
        self == ChecksumAlgorithm::Crc32
    }
}

/// FORMAT_DESCRIPTION 이벤트: 이후 이벤트 해석의 기준
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub event_header_length: u8,
    /// 인덱스 = 이벤트 타입 코드 - 1
    pub post_header_lengths: Vec<u8>,
    pub checksum_algorithm: ChecksumAlgorithm,
}

/// (major, minor, patch)를 하나의 수로
fn version_product(version: &str) -> u32 {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major * 256 + minor) * 256 + patch
}

impl FormatDescriptionEvent {
    /// 5.0 이후 기본 FDE (파일 앞에 FDE가 없을 때)
    pub fn default_v4() -> Self {
        FormatDescriptionEvent {
            binlog_version: 4,
            server_version: "5.0.0".to_string(),
            create_timestamp: 0,
            event_header_length: EVENT_HEADER_SIZE as u8,
            post_header_lengths: Vec::new(),
            checksum_algorithm: ChecksumAlgorithm::Off,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let binlog_version = cursor.read_u16::<LittleEndian>()?;
        let raw_version = cursor.take_bytes(50)?;
        let end = raw_version.iter().position(|&b| b == 0).unwrap_or(raw_version.len());
        let server_version = String::from_utf8_lossy(&raw_version[..end]).into_owned();
        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_header_length = cursor.read_u8()?;
        let rest = cursor.rest();

        let product = version_product(&server_version);
        let has_checksum = if server_version.contains("MariaDB") || server_version.contains("mariadb") {
            product >= version_product("5.3.0")
        } else {
            product >= version_product("5.6.1")
        };
        let (post_header_lengths, checksum_algorithm) = if has_checksum && rest.len() >= 1 + CHECKSUM_SIZE {
            let split = rest.len() - 1 - CHECKSUM_SIZE;
            (rest[..split].to_vec(), ChecksumAlgorithm::from_u8(rest[split]))
        } else {
            (rest.to_vec(), ChecksumAlgorithm::Off)
        };
        Ok(FormatDescriptionEvent {
            binlog_version,
            server_version,
            create_timestamp,
            event_header_length,
            post_header_lengths,
            checksum_algorithm,
        })
    }

    /// 체크섬 제외 본문 인코딩
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.binlog_version);
        let mut version = [0u8; 50];
        let n = self.server_version.len().min(50);
        version[..n].copy_from_slice(&self.server_version.as_bytes()[..n]);
        buf.put_slice(&version);
        buf.put_u32_le(self.create_timestamp);
        buf.put_u8(self.event_header_length);
        buf.put_slice(&self.post_header_lengths);
        buf.put_u8(self.checksum_algorithm.as_u8());
    }

    pub fn post_header_len(&self, event_type: EventType) -> Option<u8> {
        let code = event_type.as_u8() as usize;
        if code == 0 {
            return None;
        }
        self.post_header_lengths.get(code - 1).copied()
    }

    /// 행/테이블맵 이벤트의 table_id 크기 (post header 6이면 4바이트)
    pub fn table_id_size(&self, event_type: EventType) -> usize {
        if self.post_header_len(event_type) == Some(6) {
            4
        } else {
            6
        }
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.to_ascii_lowercase().contains("mariadb")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEvent {
    pub position: u64,
    pub next_log_name: String,
}

impl RotateEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let position = cursor.read_u64::<LittleEndian>()?;
        let next_log_name = String::from_utf8_lossy(cursor.rest()).into_owned();
        Ok(RotateEvent {
            position,
            next_log_name,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.position);
        buf.put_slice(self.next_log_name.as_bytes());
    }
}

/// QUERY 이벤트 (DDL, BEGIN 등)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub slave_proxy_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    #[serde(skip)]
    pub status_vars: Vec<u8>,
    pub schema: String,
    pub query: String,
    /// DDL 필터와 일치했는지 (필터가 없으면 true)
    pub matched: bool,
}

impl QueryEvent {
    pub fn parse(data: &[u8], compressed: bool) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let slave_proxy_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let schema_len = cursor.read_u8()? as usize;
        let error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as usize;
        let status_vars = cursor.take_bytes(status_len)?.to_vec();
        let schema = String::from_utf8_lossy(cursor.take_bytes(schema_len)?).into_owned();
        // schema 뒤 NUL
        cursor.skip(1)?;
        let rest = cursor.rest();
        let query = if compressed {
            String::from_utf8_lossy(&decompress_mariadb(rest)?).into_owned()
        } else {
            String::from_utf8_lossy(rest).into_owned()
        };
        Ok(QueryEvent {
            slave_proxy_id,
            exec_time,
            error_code,
            status_vars,
            schema,
            query,
            matched: true,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.slave_proxy_id);
        buf.put_u32_le(self.exec_time);
        buf.put_u8(self.schema.len() as u8);
        buf.put_u16_le(self.error_code);
        buf.put_u16_le(self.status_vars.len() as u16);
        buf.put_slice(&self.status_vars);
        buf.put_slice(self.schema.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.query.as_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidEvent {
    pub xid: u64,
}

impl XidEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(XidEvent {
            xid: Cursor::new(data).read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntvarEvent {
    /// 1 = LAST_INSERT_ID, 2 = INSERT_ID
    pub kind: u8,
    pub value: u64,
}

impl IntvarEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        Ok(IntvarEvent {
            kind: cursor.read_u8()?,
            value: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandEvent {
    pub seed1: u64,
    pub seed2: u64,
}

impl RandEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        Ok(RandEvent {
            seed1: cursor.read_u64::<LittleEndian>()?,
            seed2: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// HEARTBEAT (v1은 파일명만, v2는 TLV)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub log_ident: String,
    pub position: Option<u64>,
}

impl HeartbeatEvent {
    pub fn parse(data: &[u8], v2: bool) -> Result<Self> {
        if !v2 {
            return Ok(HeartbeatEvent {
                log_ident: String::from_utf8_lossy(data).into_owned(),
                position: None,
            });
        }
        let mut event = HeartbeatEvent {
            log_ident: String::new(),
            position: None,
        };
        let mut cursor = Cursor::new(data);
        while cursor.remaining() > 0 {
            let field = cursor.read_lenenc_int()?.unwrap_or(0);
            let len = cursor.read_lenenc_int()?.unwrap_or(0) as usize;
            let value = cursor.take_bytes(len)?;
            match field {
                0 => event.log_ident = String::from_utf8_lossy(value).into_owned(),
                1 => event.position = Cursor::new(value).read_lenenc_int()?,
                _ => {}
            }
        }
        Ok(event)
    }
}

/// GTID / ANONYMOUS_GTID 이벤트
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEvent {
    pub commit_flag: bool,
    pub sid: Uuid,
    pub gno: u64,
    pub lt_type: u8,
    pub last_committed: i64,
    pub sequence_number: i64,
    /// 마이크로초
    pub immediate_commit_timestamp: u64,
    pub original_commit_timestamp: u64,
    pub transaction_length: u64,
    pub immediate_server_version: u32,
    pub original_server_version: u32,
}

const LOGICAL_TIMESTAMP_TYPECODE: u8 = 2;

impl GtidEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let commit_flag = cursor.read_u8()? == 1;
        let sid = Uuid::from_slice(cursor.take_bytes(16)?)
            .map_err(|e| BinlogError::BinlogParseError(e.to_string()))?;
        let gno = cursor.read_u64::<LittleEndian>()?;
        let mut event = GtidEvent {
            commit_flag,
            sid,
            gno,
            lt_type: 0,
            last_committed: 0,
            sequence_number: 0,
            immediate_commit_timestamp: 0,
            original_commit_timestamp: 0,
            transaction_length: 0,
            immediate_server_version: 0,
            original_server_version: 0,
        };

        if cursor.remaining() >= 1 + 16 {
            event.lt_type = cursor.read_u8()?;
            if event.lt_type == LOGICAL_TIMESTAMP_TYPECODE {
                event.last_committed = cursor.read_i64::<LittleEndian>()?;
                event.sequence_number = cursor.read_i64::<LittleEndian>()?;
            }
        }
        if cursor.remaining() >= 7 {
            let immediate = cursor.read_uint::<LittleEndian>(7)?;
            if immediate & (1 << 55) != 0 {
                event.immediate_commit_timestamp = immediate & !(1 << 55);
                event.original_commit_timestamp = cursor.read_uint::<LittleEndian>(7)?;
            } else {
                event.immediate_commit_timestamp = immediate;
                event.original_commit_timestamp = immediate;
            }
        }
        if cursor.remaining() > 0 {
            event.transaction_length = cursor.read_lenenc_int()?.unwrap_or(0);
        }
        if cursor.remaining() >= 4 {
            let immediate = cursor.read_u32::<LittleEndian>()?;
            if immediate & (1 << 31) != 0 {
                event.immediate_server_version = immediate & !(1 << 31);
                event.original_server_version = cursor.read_u32::<LittleEndian>()?;
            } else {
                event.immediate_server_version = immediate;
                event.original_server_version = immediate;
            }
        }
        Ok(event)
    }

    /// "uuid:gno"
    pub fn gtid(&self) -> String {
        format!("{}:{}", self.sid, self.gno)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousGtidsEvent {
    pub gtid_set: MysqlGtidSet,
}

/// MariaDB GTID 이벤트 (트랜잭션 시작)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidEvent {
    pub gtid: MariadbGtid,
    pub flags: u8,
    pub commit_id: Option<u64>,
}

const MARIADB_FL_STANDALONE: u8 = 1;
const MARIADB_FL_GROUP_COMMIT_ID: u8 = 2;

impl MariadbGtidEvent {
    pub fn parse(data: &[u8], server_id: u32) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let sequence = cursor.read_u64::<LittleEndian>()?;
        let domain_id = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u8()?;
        let commit_id = if flags & MARIADB_FL_GROUP_COMMIT_ID != 0 {
            Some(cursor.read_u64::<LittleEndian>()?)
        } else {
            None
        };
        Ok(MariadbGtidEvent {
            gtid: MariadbGtid {
                domain_id,
                server_id,
                sequence,
            },
            flags,
            commit_id,
        })
    }

    /// 단독 문장(트랜잭션 아님)인지
    pub fn is_standalone(&self) -> bool {
        self.flags & MARIADB_FL_STANDALONE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MariadbGtidListEvent {
    pub gtids: Vec<MariadbGtid>,
}

impl MariadbGtidListEvent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let count = cursor.read_u32::<LittleEndian>()? & ((1 << 28) - 1);
        let mut gtids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let domain_id = cursor.read_u32::<LittleEndian>()?;
            let server_id = cursor.read_u32::<LittleEndian>()?;
            let sequence = cursor.read_u64::<LittleEndian>()?;
            gtids.push(MariadbGtid {
                domain_id,
                server_id,
                sequence,
            });
        }
        Ok(MariadbGtidListEvent { gtids })
    }
}

/// TABLE_MAP 이벤트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema: String,
    pub table: String,
    pub column_count: usize,
    pub column_types: Vec<u8>,
    /// 타입별 메타데이터 (없으면 0)
    pub column_meta: Vec<u16>,
    pub null_bitmap: Vec<u8>,
    /// 숫자 컬럼의 unsigned 비트맵 (MSB 우선, 숫자 컬럼만 셈)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signedness: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub column_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub set_values: Vec<Vec<String>>,
    /// 옵션 메타데이터 원본 (재인코딩용)
    #[serde(skip)]
    pub optional_metadata: Vec<u8>,
}

mod table_meta {
    pub const SIGNEDNESS: u8 = 1;
    pub const COLUMN_NAME: u8 = 4;
    pub const SET_STR_VALUE: u8 = 5;
    pub const ENUM_STR_VALUE: u8 = 6;
    pub const SIMPLE_PRIMARY_KEY: u8 = 8;
}

fn read_table_id(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<u64> {
    Ok(if size == 4 {
        cursor.read_u32::<LittleEndian>()? as u64
    } else {
        cursor.read_u48::<LittleEndian>()?
    })
}

pub(crate) fn put_table_id<B: BufMut>(buf: &mut B, table_id: u64, size: usize) {
    if size == 4 {
        buf.put_u32_le(table_id as u32);
    } else {
        buf.put_uint_le(table_id, 6);
    }
}

impl TableMapEvent {
    pub fn parse(data: &[u8], table_id_size: usize) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let table_id = read_table_id(&mut cursor, table_id_size)?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        let schema_len = cursor.read_u8()? as usize;
        let schema = String::from_utf8_lossy(cursor.take_bytes(schema_len)?).into_owned();
        cursor.skip(1)?;
        let table_len = cursor.read_u8()? as usize;
        let table = String::from_utf8_lossy(cursor.take_bytes(table_len)?).into_owned();
        cursor.skip(1)?;

        let column_count = cursor
            .read_lenenc_int()?
            .ok_or_else(|| BinlogError::BinlogParseError("NULL column count".to_string()))?
            as usize;
        let column_types = cursor.take_bytes(column_count)?.to_vec();

        let meta_len = cursor.read_lenenc_int()?.unwrap_or(0) as usize;
        let meta = cursor.take_bytes(meta_len)?;
        let column_meta = decode_column_meta(&column_types, meta)?;

        let null_bitmap = cursor.take_bytes((column_count + 7) / 8)?.to_vec();

        let mut event = TableMapEvent {
            table_id,
            flags,
            schema,
            table,
            column_count,
            column_types,
            column_meta,
            null_bitmap,
            signedness: None,
            column_names: Vec::new(),
            primary_key: Vec::new(),
            enum_values: Vec::new(),
            set_values: Vec::new(),
            optional_metadata: cursor.rest().to_vec(),
        };
        event.decode_optional_metadata()?;
        Ok(event)
    }

    fn decode_optional_metadata(&mut self) -> Result<()> {
        let data = std::mem::take(&mut self.optional_metadata);
        let mut cursor = Cursor::new(data.as_slice());
        while cursor.remaining() > 0 {
            let kind = cursor.read_u8()?;
            let len = cursor.read_lenenc_int()?.unwrap_or(0) as usize;
            let value = cursor.take_bytes(len)?;
            let mut field = Cursor::new(value);
            match kind {
                table_meta::SIGNEDNESS => self.signedness = Some(value.to_vec()),
                table_meta::COLUMN_NAME => {
                    while field.remaining() > 0 {
                        self.column_names.push(field.read_lenenc_string()?);
                    }
                }
                table_meta::SIMPLE_PRIMARY_KEY => {
                    while field.remaining() > 0 {
                        self.primary_key.push(field.read_lenenc_int()?.unwrap_or(0));
                    }
                }
                table_meta::ENUM_STR_VALUE | table_meta::SET_STR_VALUE => {
                    let mut all = Vec::new();
                    while field.remaining() > 0 {
                        let n = field.read_lenenc_int()?.unwrap_or(0);
                        let mut values = Vec::with_capacity(n as usize);
                        for _ in 0..n {
                            values.push(field.read_lenenc_string()?);
                        }
                        all.push(values);
                    }
                    if kind == table_meta::ENUM_STR_VALUE {
                        self.enum_values = all;
                    } else {
                        self.set_values = all;
                    }
                }
                _ => {}
            }
        }
        self.optional_metadata = data;
        Ok(())
    }

    /// 본문 인코딩 (schema 변경 후 재작성용)
    pub fn encode<B: BufMut>(&self, buf: &mut B, table_id_size: usize) {
        put_table_id(buf, self.table_id, table_id_size);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.schema.len() as u8);
        buf.put_slice(self.schema.as_bytes());
        buf.put_u8(0);
        buf.put_u8(self.table.len() as u8);
        buf.put_slice(self.table.as_bytes());
        buf.put_u8(0);
        crate::protocol::codec::put_lenenc_int(buf, self.column_count as u64);
        buf.put_slice(&self.column_types);
        let meta = encode_column_meta(&self.column_types, &self.column_meta);
        crate::protocol::codec::put_lenenc_bytes(buf, &meta);
        buf.put_slice(&self.null_bitmap);
        buf.put_slice(&self.optional_metadata);
    }

    /// 컬럼의 실제 타입 (STRING 메타에 숨은 ENUM/SET 포함)
    pub fn real_type(&self, i: usize) -> Result<(ColumnType, u16)> {
        let raw = *self.column_types.get(i).ok_or_else(|| {
            BinlogError::BinlogParseError(format!("column {} out of range", i))
        })?;
        let meta = self.column_meta.get(i).copied().unwrap_or(0);
        let ty = ColumnType::try_from(raw)?;
        if ty == ColumnType::String && meta >= 256 {
            let byte0 = (meta >> 8) as u8;
            if byte0 & 0x30 != 0x30 {
                // 긴 CHAR: 길이 상위 비트가 byte0에 섞여 있음
                let length = (meta & 0xFF) | ((((byte0 & 0x30) ^ 0x30) as u16) << 4);
                return Ok((ColumnType::String, length));
            }
            let real = ColumnType::try_from(byte0)?;
            if matches!(real, ColumnType::Enum | ColumnType::Set) {
                return Ok((real, meta & 0xFF));
            }
            return Ok((ColumnType::String, meta & 0xFF));
        }
        Ok((ty, meta))
    }

    pub fn is_nullable(&self, i: usize) -> bool {
        bit_is_set(&self.null_bitmap, i)
    }

    /// signedness 메타데이터 기준 unsigned 여부
    pub fn is_unsigned(&self, i: usize) -> bool {
        let Some(bits) = &self.signedness else {
            return false;
        };
        let mut numeric_index = 0;
        for (col, &raw) in self.column_types.iter().enumerate() {
            let numeric = matches!(
                ColumnType::try_from(raw),
                Ok(ColumnType::Tiny
                    | ColumnType::Short
                    | ColumnType::Int24
                    | ColumnType::Long
                    | ColumnType::LongLong
                    | ColumnType::Float
                    | ColumnType::Double
                    | ColumnType::NewDecimal)
            );
            if !numeric {
                continue;
            }
            if col == i {
                return bits
                    .get(numeric_index / 8)
                    .map(|b| b & (0x80 >> (numeric_index % 8)) != 0)
                    .unwrap_or(false);
            }
            numeric_index += 1;
        }
        false
    }

    pub fn column_name(&self, i: usize) -> Option<&str> {
        self.column_names.get(i).map(String::as_str)
    }

    /// 이름으로 컬럼 인덱스 찾기 (옵션 메타데이터가 있을 때만)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|n| n.eq_ignore_ascii_case(name))
    }
}

fn decode_column_meta(types: &[u8], meta: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::with_capacity(types.len());
    let mut pos = 0usize;
    let need = |pos: usize, n: usize| -> Result<()> {
        if pos + n > meta.len() {
            Err(BinlogError::BinlogParseError("table map metadata truncated".to_string()))
        } else {
            Ok(())
        }
    };
    for &raw in types {
        let ty = ColumnType::try_from(raw)?;
        let value = match ty {
            ColumnType::String | ColumnType::NewDecimal | ColumnType::Enum | ColumnType::Set => {
                need(pos, 2)?;
                let v = BigEndian::read_u16(&meta[pos..]);
                pos += 2;
                v
            }
            ColumnType::VarChar | ColumnType::VarString | ColumnType::Bit => {
                need(pos, 2)?;
                let v = LittleEndian::read_u16(&meta[pos..]);
                pos += 2;
                v
            }
            _ if ty.metadata_len() == 1 => {
                need(pos, 1)?;
                let v = meta[pos] as u16;
                pos += 1;
                v
            }
            _ => 0,
        };
        out.push(value);
    }
    Ok(out)
}

fn encode_column_meta(types: &[u8], meta: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(types.len() * 2);
    for (&raw, &value) in types.iter().zip(meta) {
        let Ok(ty) = ColumnType::try_from(raw) else {
            continue;
        };
        match ty {
            ColumnType::String | ColumnType::NewDecimal | ColumnType::Enum | ColumnType::Set => {
                out.put_u16(value)
            }
            ColumnType::VarChar | ColumnType::VarString | ColumnType::Bit => out.put_u16_le(value),
            _ if ty.metadata_len() == 1 => out.put_u8(value as u8),
            _ => {}
        }
    }
    out
}

/// 행 이벤트
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowsEvent {
    pub kind: RowsKind,
    /// 0, 1, 2
    pub version: u8,
    pub table_id: u64,
    pub flags: u16,
    #[serde(skip)]
    pub extra_data: Vec<u8>,
    pub column_count: usize,
    #[serde(skip)]
    pub columns_before: Vec<u8>,
    #[serde(skip)]
    pub columns_after: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<Arc<TableMapEvent>>,
    /// UPDATE는 (before, after) 순서로 두 행씩
    pub rows: Vec<Vec<CellValue>>,
    pub rows_count: usize,
    pub rows_matched: usize,
}

impl RowsEvent {
    pub fn is_stmt_end(&self) -> bool {
        self.flags & rows_flags::STMT_END != 0
    }

    /// UPDATE 행을 (before, after) 쌍으로
    pub fn update_pairs(&self) -> impl Iterator<Item = (&[CellValue], &[CellValue])> {
        self.rows.chunks_exact(2).map(|pair| (pair[0].as_slice(), pair[1].as_slice()))
    }
}

/// TRANSACTION_PAYLOAD 이벤트 (MySQL 8.0.20+)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionPayloadEvent {
    pub size: u64,
    pub uncompressed_size: u64,
    /// 0 = zstd, 255 = none
    pub compression_type: u64,
    pub events: Vec<BinlogEvent>,
}

pub const PAYLOAD_COMPRESSION_ZSTD: u64 = 0;
pub const PAYLOAD_COMPRESSION_NONE: u64 = 255;

/// TRANSACTION_PAYLOAD 헤더 필드와 페이로드 (내부 이벤트 파싱 전)
pub(crate) fn parse_payload_header(data: &[u8]) -> Result<(u64, u64, u64, &[u8])> {
    let mut cursor = Cursor::new(data);
    let (mut size, mut uncompressed_size, mut compression_type) = (0, 0, PAYLOAD_COMPRESSION_NONE);
    loop {
        let field = cursor.read_lenenc_int()?.unwrap_or(0);
        if field == 0 {
            break;
        }
        let len = cursor.read_lenenc_int()?.unwrap_or(0) as usize;
        let value = cursor.take_bytes(len)?;
        let number = Cursor::new(value).read_lenenc_int()?.unwrap_or(0);
        match field {
            1 => size = number,
            2 => compression_type = number,
            3 => uncompressed_size = number,
            _ => {}
        }
    }
    Ok((size, uncompressed_size, compression_type, cursor.rest()))
}

/// TRANSACTION_PAYLOAD 헤더 필드 (size, compression, uncompressed size, 끝 표시)
pub(crate) fn encode_payload_header(out: &mut Vec<u8>, size: u64, uncompressed_size: u64, compression_type: u64) {
    for (field, value) in [(1u64, size), (2, compression_type), (3, uncompressed_size)] {
        let mut encoded = Vec::with_capacity(9);
        put_lenenc_int(&mut encoded, value);
        put_lenenc_int(out, field);
        put_lenenc_int(out, encoded.len() as u64);
        out.extend_from_slice(&encoded);
    }
    out.push(0);
}

/// MariaDB 압축 이벤트 본문 해제: 첫 바이트 하위 3비트 = 길이 바이트 수, BE 길이, zlib 데이터
pub fn decompress_mariadb(data: &[u8]) -> Result<Vec<u8>> {
    let header = *data
        .first()
        .ok_or_else(|| BinlogError::BinlogParseError("empty compressed event body".to_string()))?;
    let lenlen = (header & 0x07) as usize;
    if lenlen == 0 || lenlen > 4 || data.len() < 1 + lenlen {
        return Err(BinlogError::BinlogParseError(format!(
            "invalid compressed header 0x{:02x}",
            header
        )));
    }
    let expected = BigEndian::read_uint(&data[1..], lenlen) as usize;
    let mut out = Vec::with_capacity(expected);
    ZlibDecoder::new(&data[1 + lenlen..])
        .read_to_end(&mut out)
        .map_err(|e| BinlogError::BinlogParseError(format!("zlib: {}", e)))?;
    if out.len() != expected {
        return Err(BinlogError::BinlogParseError(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}

/// 디코딩된 이벤트 본문
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EventData {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    Intvar(IntvarEvent),
    Rand(RandEvent),
    TableMap(Arc<TableMapEvent>),
    Rows(RowsEvent),
    RowsQuery(String),
    Gtid(GtidEvent),
    AnonymousGtid(GtidEvent),
    PreviousGtids(PreviousGtidsEvent),
    MariadbGtid(MariadbGtidEvent),
    MariadbGtidList(MariadbGtidListEvent),
    MariadbAnnotateRows(String),
    MariadbBinlogCheckpoint(String),
    TransactionPayload(TransactionPayloadEvent),
    Heartbeat(HeartbeatEvent),
    Stop,
    FakeDone,
    /// 디코딩하지 않는 이벤트
    Generic {
        #[serde(skip)]
        body: Vec<u8>,
    },
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: EventData,
    /// 재인코딩된 원본 바이트 (필터에 걸리면 헤더 19바이트만 남음)
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl BinlogEvent {
    /// 필터에 의해 본문이 비워진 이벤트인지
    pub fn is_skipped(&self) -> bool {
        self.raw.len() == EVENT_HEADER_SIZE && self.header.event_type != EventType::FakeDone
    }

    /// 파일 하나가 끝났음을 알리는 합성 이벤트
    pub fn fake_done(timestamp: u32, server_id: u32, log_pos: u32) -> Self {
        let header = EventHeader {
            timestamp,
            event_type: EventType::FakeDone,
            server_id,
            event_size: EVENT_HEADER_SIZE as u32,
            log_pos,
            flags: event_flags::ARTIFICIAL,
        };
        let mut raw = Vec::with_capacity(EVENT_HEADER_SIZE);
        header.encode(&mut raw);
        BinlogEvent {
            header,
            data: EventData::FakeDone,
            raw,
        }
    }
}
