//! Binlog 이벤트 파서
//!
//! 바이너리 이벤트 스트림을 타입이 있는 이벤트로 디코딩합니다.
//! 이벤트 구조:
//!   - 헤더 (19 bytes): timestamp, type, server id, event size, next position, flags
//!   - 본문 (타입별)
//!   - CRC32 (4 bytes, FORMAT_DESCRIPTION 에서 켜진 경우)
//!
//! 파서는 FORMAT_DESCRIPTION 컨텍스트와 table id → TABLE_MAP 레지스트리를 가지고
//! 있습니다. 레지스트리는 ROTATE 와 STMT_END 플래그가 있는 행 이벤트에서 비워집니다.

pub mod expr;
pub mod file;
pub mod filter;
pub mod rows;

use crate::error::{BinlogError, EventError, Result};
use crate::events::*;
use crate::gtid::MysqlGtidSet;
use crate::protocol::codec::ReadMysqlExt;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, trace};

pub use expr::RowFilter;
pub use file::{next_file_name, FileParser, ParseOutcome, TimeFilter};
pub use filter::{DdlFilter, SimpleStatementParser, StatementParser, TableRef};
use rows::{decode_rows_event, RowsContext};

/// 디코더 옵션
#[derive(Clone)]
pub struct ParseOptions {
    /// 행 이벤트를 역연산으로 변환
    pub flashback: bool,
    /// UPDATE 를 after 이미지만 가진 WRITE 로 변환
    pub convert_update_to_write: bool,
    /// TABLE_MAP / QUERY 의 schema 이름 변경
    pub rewrite_db: HashMap<String, String>,
    pub ddl_filter: Option<DdlFilter>,
    pub row_filter: Option<RowFilter>,
    /// None 이면 모든 행 이벤트 종류
    pub rows_event_types: Option<HashSet<RowsKind>>,
    /// JSON 의 정수값 double 을 "5.0" 으로
    pub json_trailing_zero: bool,
    pub verify_checksum: bool,
    /// QUERY 이벤트의 참조 테이블 추출기 (없으면 기본 정규식 파서)
    pub statement_parser: Option<Arc<dyn StatementParser>>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            flashback: false,
            convert_update_to_write: false,
            rewrite_db: HashMap::new(),
            ddl_filter: None,
            row_filter: None,
            rows_event_types: None,
            json_trailing_zero: false,
            verify_checksum: true,
            statement_parser: None,
        }
    }
}

impl fmt::Debug for ParseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseOptions")
            .field("flashback", &self.flashback)
            .field("convert_update_to_write", &self.convert_update_to_write)
            .field("rewrite_db", &self.rewrite_db)
            .field("ddl_filter", &self.ddl_filter)
            .field("row_filter", &self.row_filter.as_ref().map(RowFilter::source))
            .field("rows_event_types", &self.rows_event_types)
            .field("json_trailing_zero", &self.json_trailing_zero)
            .field("verify_checksum", &self.verify_checksum)
            .field("statement_parser", &self.statement_parser.is_some())
            .finish()
    }
}

impl ParseOptions {
    /// `insert,update` 같은 목록으로 행 이벤트 종류 제한
    pub fn with_rows_event_types(mut self, list: &str) -> Result<Self> {
        let kinds = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<RowsKind>)
            .collect::<Result<HashSet<_>>>()?;
        self.rows_event_types = if kinds.is_empty() { None } else { Some(kinds) };
        Ok(self)
    }

    /// `from:to` 형식의 rewrite-db 규칙 추가
    pub fn with_rewrite_db(mut self, rule: &str) -> Result<Self> {
        for pair in rule.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (from, to) = pair
                .split_once(':')
                .or_else(|| pair.split_once("->"))
                .ok_or_else(|| BinlogError::ConfigError(format!("Invalid rewrite-db rule '{}'", pair)))?;
            self.rewrite_db.insert(from.trim().to_string(), to.trim().to_string());
        }
        Ok(self)
    }
}

/// 헤더의 event_size 를 고치고 CRC32 를 붙임
pub(crate) fn seal_event(mut raw: Vec<u8>, checksum: bool) -> Vec<u8> {
    let size = raw.len() + if checksum { CHECKSUM_SIZE } else { 0 };
    raw[9..13].copy_from_slice(&(size as u32).to_le_bytes());
    if checksum {
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());
    }
    raw
}

/// 마지막 4바이트가 앞부분의 CRC32 인지
pub fn verify_checksum(raw: &[u8]) -> bool {
    if raw.len() < EVENT_HEADER_SIZE + CHECKSUM_SIZE {
        return false;
    }
    let (payload, crc) = raw.split_at(raw.len() - CHECKSUM_SIZE);
    crc32fast::hash(payload).to_le_bytes() == crc
}

/// 상태를 가진 이벤트 디코더
pub struct BinlogParser {
    options: ParseOptions,
    statement_parser: Arc<dyn StatementParser>,
    fde: FormatDescriptionEvent,
    tables: HashMap<u64, Arc<TableMapEvent>>,
    /// 원래 schema 기준으로 필터에 걸린 table id
    excluded_tables: HashSet<u64>,
}

impl fmt::Debug for BinlogParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinlogParser")
            .field("options", &self.options)
            .field("fde", &self.fde)
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl BinlogParser {
    pub fn new(options: ParseOptions) -> Result<Self> {
        let statement_parser = match &options.statement_parser {
            Some(parser) => parser.clone(),
            None => filter::default_statement_parser()?,
        };
        Ok(BinlogParser {
            options,
            statement_parser,
            fde: FormatDescriptionEvent::default_v4(),
            tables: HashMap::new(),
            excluded_tables: HashSet::new(),
        })
    }

    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(BinlogError::BinlogParseError("Invalid binlog: too short".to_string()));
        }
        if data[..BINLOG_MAGIC.len()] == BINLOG_MAGIC {
            Ok(())
        } else {
            Err(BinlogError::BinlogParseError("Invalid binlog magic number".to_string()))
        }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    pub fn format_description(&self) -> &FormatDescriptionEvent {
        &self.fde
    }

    /// FORMAT_DESCRIPTION 을 받기 전에 체크섬 설정을 알고 있을 때
    pub fn set_format_description(&mut self, fde: FormatDescriptionEvent) {
        self.fde = fde;
        self.clear_tables();
    }

    fn clear_tables(&mut self) {
        self.tables.clear();
        self.excluded_tables.clear();
    }

    pub fn table(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    /// 새 파일/스트림 시작
    pub fn reset(&mut self) {
        self.fde = FormatDescriptionEvent::default_v4();
        self.clear_tables();
    }

    /// 헤더를 포함한 이벤트 하나 디코딩
    pub fn parse_event(&mut self, raw: &[u8]) -> Result<BinlogEvent> {
        self.parse_with_checksum(raw, true)
    }

    fn parse_with_checksum(&mut self, raw: &[u8], checksum_allowed: bool) -> Result<BinlogEvent> {
        let header = EventHeader::parse(raw)?;
        let fail = |message: String| -> BinlogError {
            EventError {
                header,
                message,
                raw: raw.to_vec(),
            }
            .into()
        };
        if raw.len() != header.event_size as usize {
            return Err(fail(format!(
                "event size {} does not match {} bytes received",
                header.event_size,
                raw.len()
            )));
        }

        let checksum = checksum_allowed
            && if header.event_type == EventType::FormatDescription {
                // FDE 자신의 체크섬은 자기 본문이 결정
                FormatDescriptionEvent::parse(&raw[EVENT_HEADER_SIZE..])
                    .map(|fde| fde.checksum_algorithm.is_crc32())
                    .unwrap_or(false)
            } else {
                self.fde.checksum_algorithm.is_crc32()
            };
        let body_end = if checksum {
            if raw.len() < EVENT_HEADER_SIZE + CHECKSUM_SIZE {
                return Err(fail("event too short for checksum".to_string()));
            }
            if self.options.verify_checksum && !verify_checksum(raw) {
                return Err(fail("CRC32 checksum mismatch".to_string()));
            }
            raw.len() - CHECKSUM_SIZE
        } else {
            raw.len()
        };
        let body = &raw[EVENT_HEADER_SIZE..body_end];

        self.dispatch(header, raw, body, checksum)
            .map_err(|e| match e {
                BinlogError::Decode(_) => e,
                other => fail(other.to_string()),
            })
    }

    fn dispatch(&mut self, header: EventHeader, raw: &[u8], body: &[u8], checksum: bool) -> Result<BinlogEvent> {
        let mut out_header = header;
        let mut out_raw: Option<Vec<u8>> = None;

        let data = match header.event_type {
            EventType::FormatDescription => {
                // 본문 파서가 체크섬 꼬리(알고리즘 + CRC)를 직접 처리
                let fde = FormatDescriptionEvent::parse(&raw[EVENT_HEADER_SIZE..])?;
                debug!(
                    "Format description: server {} binlog v{} checksum {:?}",
                    fde.server_version, fde.binlog_version, fde.checksum_algorithm
                );
                self.fde = fde.clone();
                self.clear_tables();
                EventData::FormatDescription(fde)
            }
            EventType::Rotate => {
                let rotate = RotateEvent::parse(body)?;
                debug!("Rotate to {}:{}", rotate.next_log_name, rotate.position);
                self.clear_tables();
                EventData::Rotate(rotate)
            }
            EventType::Query | EventType::MariadbQueryCompressed => {
                let mut query = QueryEvent::parse(body, header.event_type == EventType::MariadbQueryCompressed)?;
                if let Some(filter) = &self.options.ddl_filter {
                    let refs = self.statement_parser.parse_tables(&query.query)?;
                    query.matched = filter.match_refs(&query.schema, &refs);
                }
                if !query.matched {
                    out_raw = Some(header_only(&mut out_header));
                } else if let Some(schema) = self.options.rewrite_db.get(&query.schema) {
                    query.schema = schema.clone();
                    let mut buf = Vec::with_capacity(raw.len());
                    out_header.event_type = EventType::Query;
                    out_header.encode(&mut buf);
                    query.encode(&mut buf);
                    let sealed = seal_event(buf, checksum);
                    out_header.event_size = sealed.len() as u32;
                    out_raw = Some(sealed);
                }
                EventData::Query(query)
            }
            EventType::Xid => EventData::Xid(XidEvent::parse(body)?),
            EventType::Intvar => EventData::Intvar(IntvarEvent::parse(body)?),
            EventType::Rand => EventData::Rand(RandEvent::parse(body)?),
            EventType::Stop => EventData::Stop,
            EventType::TableMap => {
                let table_id_size = self.fde.table_id_size(EventType::TableMap);
                let mut table = TableMapEvent::parse(body, table_id_size)?;
                let excluded = self
                    .options
                    .ddl_filter
                    .as_ref()
                    .is_some_and(|f| !f.match_table(&table.schema, &table.table));
                if excluded {
                    self.excluded_tables.insert(table.table_id);
                    out_raw = Some(header_only(&mut out_header));
                } else {
                    self.excluded_tables.remove(&table.table_id);
                    if let Some(schema) = self.options.rewrite_db.get(&table.schema) {
                        table.schema = schema.clone();
                        let mut buf = Vec::with_capacity(raw.len());
                        out_header.encode(&mut buf);
                        table.encode(&mut buf, table_id_size);
                        let sealed = seal_event(buf, checksum);
                        out_header.event_size = sealed.len() as u32;
                        out_raw = Some(sealed);
                    }
                }
                trace!("Table map {} -> {}.{}", table.table_id, table.schema, table.table);
                let table = Arc::new(table);
                self.tables.insert(table.table_id, table.clone());
                EventData::TableMap(table)
            }
            event_type if event_type.is_rows_event() => {
                let ctx = RowsContext {
                    fde: &self.fde,
                    tables: &self.tables,
                    excluded_tables: &self.excluded_tables,
                    options: &self.options,
                    checksum,
                };
                let decoded = decode_rows_event(&ctx, &header, body)?;
                if decoded.event.is_stmt_end() {
                    self.clear_tables();
                }
                out_header = decoded.header;
                out_raw = Some(decoded.raw);
                EventData::Rows(decoded.event)
            }
            EventType::RowsQuery => {
                // 첫 바이트는 길이 (255에서 잘림), 실제 쿼리는 나머지 전체
                let query = body.get(1..).unwrap_or_default();
                EventData::RowsQuery(String::from_utf8_lossy(query).into_owned())
            }
            EventType::Gtid | EventType::GtidTagged => EventData::Gtid(GtidEvent::parse(body)?),
            EventType::AnonymousGtid => EventData::AnonymousGtid(GtidEvent::parse(body)?),
            EventType::PreviousGtids => EventData::PreviousGtids(PreviousGtidsEvent {
                gtid_set: MysqlGtidSet::decode(body)?,
            }),
            EventType::MariadbGtid => EventData::MariadbGtid(MariadbGtidEvent::parse(body, header.server_id)?),
            EventType::MariadbGtidList => EventData::MariadbGtidList(MariadbGtidListEvent::parse(body)?),
            EventType::MariadbAnnotateRows => {
                EventData::MariadbAnnotateRows(String::from_utf8_lossy(body).into_owned())
            }
            EventType::MariadbBinlogCheckpoint => {
                let mut cursor = Cursor::new(body);
                let len = cursor.read_u32::<LittleEndian>()? as usize;
                let name = cursor.take_bytes(len)?;
                EventData::MariadbBinlogCheckpoint(String::from_utf8_lossy(name).into_owned())
            }
            EventType::Heartbeat => EventData::Heartbeat(HeartbeatEvent::parse(body, false)?),
            EventType::HeartbeatV2 => EventData::Heartbeat(HeartbeatEvent::parse(body, true)?),
            EventType::TransactionPayload => {
                let (payload, rebuilt) = self.parse_transaction_payload(body)?;
                if let Some(rebuilt) = rebuilt {
                    let mut buf = Vec::with_capacity(EVENT_HEADER_SIZE + rebuilt.len() + CHECKSUM_SIZE);
                    out_header.encode(&mut buf);
                    buf.extend_from_slice(&rebuilt);
                    let sealed = seal_event(buf, checksum);
                    out_header.event_size = sealed.len() as u32;
                    out_raw = Some(sealed);
                }
                EventData::TransactionPayload(payload)
            }
            EventType::FakeDone => EventData::FakeDone,
            _ => EventData::Generic { body: body.to_vec() },
        };

        Ok(BinlogEvent {
            header: out_header,
            data,
            raw: out_raw.unwrap_or_else(|| raw.to_vec()),
        })
    }

    /// 압축 해제 후 내부 이벤트를 같은 FDE 컨텍스트로 파싱 (내부 이벤트에는 CRC 없음).
    /// 내부 이벤트가 하나라도 변환됐으면 변환된 바이트로 다시 만든 본문을 함께 돌려줌
    fn parse_transaction_payload(&mut self, body: &[u8]) -> Result<(TransactionPayloadEvent, Option<Vec<u8>>)> {
        let (size, uncompressed_size, compression_type, payload) = parse_payload_header(body)?;
        let data = match compression_type {
            PAYLOAD_COMPRESSION_ZSTD => zstd::stream::decode_all(payload)
                .map_err(|e| BinlogError::BinlogParseError(format!("zstd: {}", e)))?,
            PAYLOAD_COMPRESSION_NONE => payload.to_vec(),
            other => {
                return Err(BinlogError::BinlogParseError(format!(
                    "unknown transaction payload compression {}",
                    other
                )))
            }
        };

        let mut events = Vec::new();
        let mut changed = false;
        let mut pos = 0;
        while pos < data.len() {
            let header = EventHeader::parse(&data[pos..])?;
            let end = pos + header.event_size as usize;
            if end > data.len() {
                return Err(BinlogError::BinlogParseError(format!(
                    "inner event at {} overruns payload ({} > {})",
                    pos,
                    end,
                    data.len()
                )));
            }
            let event = self.parse_with_checksum(&data[pos..end], false)?;
            changed |= event.raw != data[pos..end];
            events.push(event);
            pos = end;
        }

        let mut payload = TransactionPayloadEvent {
            size,
            uncompressed_size,
            compression_type,
            events,
        };
        if !changed {
            return Ok((payload, None));
        }

        let inner: Vec<u8> = payload.events.iter().flat_map(|e| e.raw.iter().copied()).collect();
        let compressed = match compression_type {
            PAYLOAD_COMPRESSION_ZSTD => zstd::stream::encode_all(inner.as_slice(), 0)
                .map_err(|e| BinlogError::BinlogParseError(format!("zstd: {}", e)))?,
            _ => inner.clone(),
        };
        payload.size = compressed.len() as u64;
        payload.uncompressed_size = inner.len() as u64;
        let mut rebuilt = Vec::with_capacity(compressed.len() + 16);
        encode_payload_header(&mut rebuilt, payload.size, payload.uncompressed_size, compression_type);
        rebuilt.extend_from_slice(&compressed);
        trace!(
            "Rebuilt transaction payload: {} inner events, {} -> {} bytes",
            payload.events.len(),
            data.len(),
            inner.len()
        );
        Ok((payload, Some(rebuilt)))
    }
}

fn header_only(header: &mut EventHeader) -> Vec<u8> {
    header.event_size = EVENT_HEADER_SIZE as u32;
    let mut raw = Vec::with_capacity(EVENT_HEADER_SIZE);
    header.encode(&mut raw);
    raw
}
