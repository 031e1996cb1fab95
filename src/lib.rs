//! MySQL 복제 클라이언트와 Binlog 디코더
//!
//! 이 라이브러리는 MySQL/MariaDB 에 복제 슬레이브로 접속해 바이너리 로그를 읽고,
//! 이벤트를 타입이 있는 값으로 디코딩합니다.
//! 주요 기능:
//! - 패킷 프로토콜, 압축, TLS, 인증 플러그인
//! - 쿼리 / prepared statement 를 지원하는 클라이언트 세션과 커넥션 풀
//! - Binlog 이벤트 및 행 이미지 디코딩 (필터, flashback, rewrite-db)
//! - GTID 집합 관리와 위치 추적
//! - 테스트용 서버

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod bufpool;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gtid;
pub mod offset;
pub mod protocol;
pub mod server;
pub mod types;

pub use binlog::{BinlogParser, FileParser, ParseOptions};
pub use binlog_client::{BinlogStreamer, BinlogSyncer, SyncerConfig};
pub use config::{ConnectionConfig, DumpOptions};
pub use connection::{Connection, Pool, PoolConfig};
pub use error::{BinlogError, Result};
pub use events::{BinlogEvent, EventData, EventType};
pub use gtid::{Flavor, GtidSet};
pub use offset::{BinlogPosition, SourceInfo};
