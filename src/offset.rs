//! Binlog 처리 위치 추적 (BinlogPosition 및 SourceInfo)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::events::{BinlogEvent, EventData, EventType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Binlog 파일 위치 정보
///
/// 같은 서버의 위치끼리만 비교할 수 있습니다. 다른 서버의 위치를 비교하면
/// `partial_cmp` 가 `None` 을 돌려줍니다. 파일명은 숫자 접미사를 먼저 비교하므로
/// `mysql-bin.999999` 다음이 `mysql-bin.1000000` 입니다.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 위치를 만든 서버 (모르면 0)
    #[serde(default)]
    pub server_id: u32,
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            server_id: 0,
            filename: filename.into(),
            position,
        }
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }

    /// "file:pos" 형식 파싱
    pub fn parse(s: &str) -> Option<Self> {
        let (file, pos) = s.rsplit_once(':')?;
        Some(BinlogPosition::new(file, pos.trim().parse().ok()?))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.server_id != other.server_id {
            return None;
        }
        let by_file = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.filename.cmp(&other.filename)),
            _ => self.filename.cmp(&other.filename),
        };
        Some(by_file.then(self.position.cmp(&other.position)))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 현재 처리 상태 정보 (Debezium의 SourceInfo와 유사)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceInfo {
    /// MySQL 서버 ID
    pub server_id: u32,
    /// Binlog 파일명
    pub binlog_filename: String,
    /// Binlog 위치 (다음 이벤트의 시작)
    pub binlog_position: u64,
    /// 마지막 GTID (있는 경우)
    pub gtid: Option<String>,
    /// 이벤트 타임스탬프 (초 단위)
    pub ts_sec: u32,
    /// 마지막 행 이벤트의 행 수
    pub row: Option<u64>,
    /// 데이터베이스명
    pub database: Option<String>,
    /// 테이블명
    pub table: Option<String>,
    /// 스레드 ID
    pub thread_id: Option<u32>,
    /// 받은 이벤트 수 (heartbeat 제외)
    pub events: u64,
}

impl SourceInfo {
    pub fn new(server_id: u32, binlog_filename: impl Into<String>) -> Self {
        SourceInfo {
            server_id,
            binlog_filename: binlog_filename.into(),
            binlog_position: 4,
            ..Default::default()
        }
    }

    pub fn from_position(server_id: u32, position: &BinlogPosition) -> Self {
        SourceInfo {
            binlog_position: position.position,
            ..SourceInfo::new(server_id, position.filename.clone())
        }
    }

    pub fn position(&self) -> BinlogPosition {
        BinlogPosition {
            server_id: self.server_id,
            filename: self.binlog_filename.clone(),
            position: self.binlog_position,
        }
    }

    /// 이벤트 하나를 반영
    pub fn update(&mut self, event: &BinlogEvent) {
        let header = &event.header;
        if header.timestamp != 0 {
            self.ts_sec = header.timestamp;
        }
        match &event.data {
            EventData::Rotate(rotate) => {
                self.binlog_filename = rotate.next_log_name.clone();
                self.binlog_position = rotate.position;
                return;
            }
            EventData::Heartbeat(_) => return,
            EventData::Gtid(gtid) => self.gtid = Some(gtid.gtid()),
            EventData::MariadbGtid(gtid) => self.gtid = Some(gtid.gtid.to_string()),
            EventData::Query(query) => {
                self.thread_id = Some(query.slave_proxy_id);
                if !query.schema.is_empty() {
                    self.database = Some(query.schema.clone());
                }
            }
            EventData::TableMap(table) => {
                self.database = Some(table.schema.clone());
                self.table = Some(table.table.clone());
            }
            EventData::Rows(rows) => self.row = Some(rows.rows_matched as u64),
            _ => {}
        }
        self.events += 1;
        // 인공 이벤트(FDE 재전송 등)의 log_pos 는 0
        if header.log_pos != 0 && header.event_type != EventType::FakeDone {
            self.binlog_position = u64::from(header.log_pos);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server_id": self.server_id,
            "file": self.binlog_filename,
            "pos": self.binlog_position,
            "gtid": self.gtid,
            "ts_sec": self.ts_sec,
            "row": self.row,
            "db": self.database,
            "table": self.table,
            "thread": self.thread_id,
            "events": self.events,
        })
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SourceInfo {{ server_id: {}, file: {}, pos: {}, gtid: {:?} }}",
            self.server_id, self.binlog_filename, self.binlog_position, self.gtid
        )
    }
}
