//! 통합 테스트 공용: 테스트 서버 핸들러, duplex 연결, 이벤트 바이트 생성

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::BufMut;
use parking_lot::Mutex;
use rust_mysql_binlog::auth::AuthPlugin;
use rust_mysql_binlog::config::ConnectionConfig;
use rust_mysql_binlog::connection::{Connection, Field};
use rust_mysql_binlog::error::{BinlogError, Result, ServerError};
use rust_mysql_binlog::events::{ChecksumAlgorithm, EventHeader, EventType, FormatDescriptionEvent};
use rust_mysql_binlog::protocol::OkPacket;
use rust_mysql_binlog::server::{DumpRequest, Handler, Response, ServerConn, ServerContext, Session, StatementInfo};
use rust_mysql_binlog::types::{ColumnType, FieldValue};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const SERVER_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// 쿼리 몇 가지에 고정 응답을 주는 핸들러
#[derive(Default)]
pub struct TestHandler {
    pub events: Vec<Vec<u8>>,
    pub dump_error: Option<ServerError>,
    pub queries: Mutex<Vec<String>>,
    pub dumps: Mutex<Vec<DumpRequest>>,
}

impl TestHandler {
    pub fn with_events(events: Vec<Vec<u8>>) -> Self {
        TestHandler {
            events,
            ..Default::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

fn users_result() -> Response {
    Response::ResultSet {
        fields: vec![Field::new("id", ColumnType::LongLong), Field::new("name", ColumnType::VarString)],
        rows: vec![
            vec![FieldValue::Signed(1), FieldValue::String(b"alice".to_vec())],
            vec![FieldValue::Signed(2), FieldValue::Null],
        ],
    }
}

fn single(name: &str, value: FieldValue) -> Response {
    Response::ResultSet {
        fields: vec![Field::new(name, ColumnType::LongLong)],
        rows: vec![vec![value]],
    }
}

#[async_trait]
impl Handler for TestHandler {
    async fn query(&self, session: &mut Session, sql: &str) -> Result<Response> {
        self.queries.lock().push(sql.to_string());
        let upper = sql.trim().to_ascii_uppercase();
        if upper.starts_with("SET ") || matches!(upper.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK") {
            return Ok(Response::ok());
        }
        let response = match sql.trim() {
            "SELECT 1" => single("1", FieldValue::Signed(1)),
            "SELECT id, name FROM users" => users_result(),
            "SELECT 1; SELECT 2" => Response::Multi(vec![
                single("1", FieldValue::Signed(1)),
                single("2", FieldValue::Signed(2)),
            ]),
            "INSERT INTO t VALUES (1)" => Response::affected(1, 7),
            "DELETE FROM t; SELECT 1" => Response::Multi(vec![Response::affected(3, 0), single("1", FieldValue::Signed(1))]),
            "SELECT DATABASE()" => Response::ResultSet {
                fields: vec![Field::new("DATABASE()", ColumnType::VarString)],
                rows: vec![vec![session
                    .database
                    .as_ref()
                    .map(|db| FieldValue::String(db.clone().into_bytes()))
                    .unwrap_or(FieldValue::Null)]],
            },
            "SELECT query_attributes()" => Response::ResultSet {
                fields: vec![Field::new("name", ColumnType::VarString), Field::new("value", ColumnType::VarString)],
                rows: session
                    .query_attributes
                    .iter()
                    .map(|(name, value)| vec![FieldValue::String(name.clone().into_bytes()), value.clone()])
                    .collect(),
            },
            "KILL" => return Err(BinlogError::ProtocolError("handler exploded".to_string())),
            _ => Response::error(1064, "42000", format!("You have an error in your SQL syntax near '{}'", sql)),
        };
        Ok(response)
    }

    async fn prepare(&self, _session: &mut Session, sql: &str) -> Result<StatementInfo> {
        match sql {
            "SELECT ? + ?" => Ok(StatementInfo {
                params: vec![Field::new("?", ColumnType::LongLong), Field::new("?", ColumnType::LongLong)],
                columns: vec![Field::new("sum", ColumnType::LongLong)],
            }),
            "INSERT INTO blobs VALUES (?, ?)" => Ok(StatementInfo {
                params: vec![Field::new("?", ColumnType::Blob), Field::new("?", ColumnType::VarString)],
                columns: Vec::new(),
            }),
            _ => Err(BinlogError::Server(ServerError::new(1064, "42000", "syntax error"))),
        }
    }

    async fn execute(&self, _session: &mut Session, sql: &str, params: &[FieldValue]) -> Result<Response> {
        match sql {
            "SELECT ? + ?" => {
                let sum = params.iter().filter_map(FieldValue::as_i64).sum::<i64>();
                Ok(single("sum", FieldValue::Signed(sum)))
            }
            "INSERT INTO blobs VALUES (?, ?)" => {
                let len = params[0].as_bytes().map(<[u8]>::len).unwrap_or(0);
                Ok(Response::Ok(OkPacket {
                    affected_rows: 1,
                    info: format!("{} {}", len, params[1]),
                    ..Default::default()
                }))
            }
            _ => Ok(Response::error(1243, "HY000", "unknown statement")),
        }
    }

    async fn binlog_dump(&self, _session: &mut Session, request: &DumpRequest) -> Result<Vec<Vec<u8>>> {
        self.dumps.lock().push(request.clone());
        if let Some(err) = &self.dump_error {
            return Err(BinlogError::Server(err.clone()));
        }
        Ok(self.events.clone())
    }
}

pub fn native_context() -> ServerContext {
    let ctx = ServerContext::default();
    ctx.add_user(rust_mysql_binlog::server::Credential::new("repl", "secret", AuthPlugin::NativePassword));
    ctx
}

pub fn client_config(user: &str, password: &str) -> ConnectionConfig {
    ConnectionConfig::new("localhost", user).password(password)
}

/// duplex 위에서 서버 연결 하나와 클라이언트 연결을 만듦
pub async fn connect(
    ctx: Arc<ServerContext>,
    handler: Arc<dyn Handler>,
    config: ConnectionConfig,
) -> (Result<Connection>, JoinHandle<Result<()>>) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let server_task = tokio::spawn(async move {
        let conn = ServerConn::accept(Box::new(server), ctx, handler).await?;
        conn.run().await
    });
    let conn = Connection::connect_stream(Box::new(client), config).await;
    (conn, server_task)
}

/// 헤더 + 본문 (+ CRC32)
pub fn build_event(event_type: EventType, log_pos: u32, body: &[u8], checksum: bool) -> Vec<u8> {
    let header = EventHeader {
        timestamp: 1_700_000_000,
        event_type,
        server_id: 1,
        event_size: 0,
        log_pos,
        flags: 0,
    };
    let mut raw = Vec::with_capacity(19 + body.len() + 4);
    header.encode(&mut raw);
    raw.extend_from_slice(body);
    let size = raw.len() + if checksum { 4 } else { 0 };
    raw[9..13].copy_from_slice(&(size as u32).to_le_bytes());
    if checksum {
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());
    }
    raw
}

pub fn fde_body() -> Vec<u8> {
    let mut post_header = vec![0u8; 41];
    post_header[EventType::TableMap.as_u8() as usize - 1] = 8;
    post_header[EventType::WriteRowsV2.as_u8() as usize - 1] = 10;
    let fde = FormatDescriptionEvent {
        binlog_version: 4,
        server_version: "8.0.36-log".to_string(),
        create_timestamp: 0,
        event_header_length: 19,
        post_header_lengths: post_header,
        checksum_algorithm: ChecksumAlgorithm::Crc32,
    };
    let mut body = Vec::new();
    fde.encode(&mut body);
    body
}

pub fn rotate_body(position: u64, next: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u64_le(position);
    body.put_slice(next.as_bytes());
    body
}

pub fn query_body(schema: &str, query: &str) -> Vec<u8> {
    let mut body = Vec::new();
    // thread id, exec time
    body.put_u32_le(11);
    body.put_u32_le(0);
    body.put_u8(schema.len() as u8);
    // error code, status vars len
    body.put_u16_le(0);
    body.put_u16_le(0);
    body.put_slice(schema.as_bytes());
    body.put_u8(0);
    body.put_slice(query.as_bytes());
    body
}

pub fn gtid_body(sid: &str, gno: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u8(1);
    body.put_slice(uuid::Uuid::parse_str(sid).map(|u| *u.as_bytes()).unwrap_or_default().as_slice());
    body.put_u64_le(gno);
    // logical timestamp
    body.put_u8(2);
    body.put_i64_le(0);
    body.put_i64_le(1);
    body
}

pub fn xid_body(xid: u64) -> Vec<u8> {
    xid.to_le_bytes().to_vec()
}

pub fn table_map_body(table_id: u64, schema: &str, table: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_uint_le(table_id, 6);
    body.put_u16_le(1);
    body.put_u8(schema.len() as u8);
    body.put_slice(schema.as_bytes());
    body.put_u8(0);
    body.put_u8(table.len() as u8);
    body.put_slice(table.as_bytes());
    body.put_u8(0);
    body.put_u8(2);
    body.put_slice(&[ColumnType::Long as u8, ColumnType::VarChar as u8]);
    // metadata: VARCHAR(256) 의 최대 길이
    body.put_slice(&[2, 0x00, 0x01]);
    body.put_u8(0b10);
    body
}

pub fn write_rows_body(table_id: u64, id: i32, name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_uint_le(table_id, 6);
    // STMT_END
    body.put_u16_le(1);
    body.put_u16_le(2);
    body.put_u8(2);
    body.put_u8(0b11);
    body.put_u8(0);
    body.put_i32_le(id);
    body.put_u16_le(name.len() as u16);
    body.put_slice(name.as_bytes());
    body
}

/// 서버 덤프 순서대로: 가짜 ROTATE, FDE, GTID 트랜잭션 하나 (BEGIN, TABLE_MAP, WRITE_ROWS, XID)
pub fn transaction_events(gno: u64) -> Vec<Vec<u8>> {
    vec![
        build_event(EventType::Rotate, 0, &rotate_body(4, "mysql-bin.000001"), false),
        build_event(EventType::FormatDescription, 0, &fde_body(), true),
        build_event(EventType::Gtid, 200, &gtid_body(SERVER_UUID, gno), true),
        build_event(EventType::Query, 280, &query_body("test", "BEGIN"), true),
        build_event(EventType::TableMap, 330, &table_map_body(9, "test", "t1"), true),
        build_event(EventType::WriteRowsV2, 380, &write_rows_body(9, 42, "abc"), true),
        build_event(EventType::Xid, 411, &xid_body(77), true),
    ]
}
