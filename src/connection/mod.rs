//! MySQL 클라이언트 연결
//!
//! 핸드셰이크(capability 협상, TLS 업그레이드, 인증)와 커맨드
//! (query, prepare/execute, ping, use db, quit)를 처리합니다.

pub mod pool;
pub mod resultset;
pub mod stmt;

pub use pool::{Pool, PoolConfig, PooledConnection};
pub use resultset::{copy_out, Field, QueryResult, ResultSet};
pub use stmt::{Param, Stmt};

use crate::auth::{self, AuthStep, Authenticator};
use crate::config::ConnectionConfig;
use crate::error::{BinlogError, Result};
use crate::protocol::codec::{put_lenenc_bytes, put_lenenc_int, ReadMysqlExt};
use crate::protocol::compress::CompressionAlgorithm;
use crate::protocol::handshake::{parse_err_packet, EofPacket, OkPacket};
use crate::protocol::packet::{is_eof_packet, with_timeout};
use crate::protocol::{
    capabilities, charset_of_collation, status, AsyncStream, Command, HandshakeResponse,
    InitialHandshake, PacketChannel, SslRequest, EOF_HEADER, ERR_HEADER, LOCAL_INFILE_HEADER,
    MAX_PAYLOAD_LEN, OK_HEADER,
};
use crate::types::FieldValue;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use stmt::PrepareOk;
use tracing::{debug, info, warn};

/// 프로세스 내 연결 식별자
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Ready,
    /// 스트리밍 결과를 읽는 중이거나 binlog dump 중
    Streaming,
    Closed,
}

/// MySQL 연결
pub struct Connection {
    channel: PacketChannel,
    config: ConnectionConfig,
    client_id: u64,
    capabilities: u32,
    server_version: String,
    connection_id: u32,
    status: u16,
    charset: String,
    collation: String,
    state: ConnState,
    query_attributes: Vec<(String, Param)>,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    /// 설정대로 접속하고 인증까지 완료
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        info!("Connecting to {}", config.address());
        let channel = match &config.socket {
            #[cfg(unix)]
            Some(path) => PacketChannel::connect_unix(path, config.connect_timeout).await?,
            #[cfg(not(unix))]
            Some(_) => {
                return Err(BinlogError::ConfigError(
                    "unix sockets are not supported on this platform".to_string(),
                ))
            }
            None => PacketChannel::connect(&config.hostname, config.port, config.connect_timeout).await?,
        };
        Self::handshake(channel, config).await
    }

    /// 이미 열린 스트림 위에서 핸드셰이크 (테스트, 터널 등)
    pub async fn connect_stream(stream: Box<dyn AsyncStream>, config: ConnectionConfig) -> Result<Self> {
        Self::handshake(PacketChannel::new(stream), config).await
    }

    async fn handshake(mut channel: PacketChannel, config: ConnectionConfig) -> Result<Self> {
        channel.set_timeouts(config.read_timeout, config.write_timeout);
        let collation_id = config.collation_id()?;
        let mut conn = Connection {
            channel,
            client_id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            capabilities: 0,
            server_version: String::new(),
            connection_id: 0,
            status: 0,
            charset: charset_of_collation(collation_id).to_string(),
            collation: config.collation.clone(),
            state: ConnState::Handshaking,
            query_attributes: Vec::new(),
            created_at: Instant::now(),
            last_used: Instant::now(),
            config,
        };

        let connect_timeout = conn.config.connect_timeout;
        let result = with_timeout(connect_timeout, conn.run_handshake(collation_id)).await;
        match result.and_then(|r| r) {
            Ok(()) => {
                conn.state = ConnState::Ready;
                Ok(conn)
            }
            Err(e) => {
                conn.channel.close().await;
                conn.state = ConnState::Closed;
                Err(e)
            }
        }
    }

    async fn run_handshake(&mut self, collation_id: u8) -> Result<()> {
        // 1. greeting
        let data = self.channel.read_packet().await?;
        let greeting = InitialHandshake::parse(&data)?;
        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.connection_id
        );

        // 2. capability 협상
        let required = capabilities::PROTOCOL_41 | capabilities::SECURE_CONNECTION | capabilities::PLUGIN_AUTH;
        if greeting.capabilities & required != required {
            return Err(BinlogError::ProtocolError(
                "server does not support protocol 4.1 plugin authentication".to_string(),
            ));
        }
        let mut wanted = capabilities::CLIENT_DEFAULT;
        if self.config.database.is_some() {
            wanted |= capabilities::CONNECT_WITH_DB;
        }
        match self.config.compression {
            CompressionAlgorithm::Zlib => wanted |= capabilities::COMPRESS,
            CompressionAlgorithm::Zstd => wanted |= capabilities::ZSTD_COMPRESSION_ALGORITHM,
            CompressionAlgorithm::None => {}
        }
        if self.config.tls.is_enabled() {
            wanted |= capabilities::SSL;
        }
        let mut caps = (wanted & greeting.capabilities & !self.config.disabled_capabilities) | required;
        if self.config.attributes.is_empty() {
            caps &= !capabilities::CONNECT_ATTRS;
        }
        self.capabilities = caps;
        self.server_version = greeting.server_version.clone();
        self.connection_id = greeting.connection_id;
        self.status = greeting.status;

        // 3. TLS
        if self.config.tls.is_enabled() {
            if caps & capabilities::SSL == 0 {
                if self.config.tls.is_required() {
                    return Err(BinlogError::ProtocolError(
                        "TLS required but server does not support it".to_string(),
                    ));
                }
                warn!("Server does not support TLS, continuing without it");
            } else {
                let request = SslRequest {
                    capabilities: caps,
                    max_packet_size: self.config.max_allowed_packet,
                    charset: collation_id,
                };
                self.channel.write_packet(&request.encode()).await?;
                let connector = self.config.tls.connector()?;
                let server_name = self.config.tls.server_name(&self.config.hostname)?;
                self.channel.upgrade_client_tls(connector, server_name).await?;
            }
        }

        // 4. 인증 응답
        let server_key = match &self.config.server_pub_key_path {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    BinlogError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Some(auth::parse_public_key(&pem)?)
            }
            None => None,
        };
        let mut authenticator = Authenticator::new(
            &greeting.auth_plugin_name,
            self.config.password.clone(),
            &greeting.auth_plugin_data,
            self.channel.is_tls(),
            server_key,
        )?;
        let response = HandshakeResponse {
            capabilities: caps,
            max_packet_size: self.config.max_allowed_packet,
            charset: collation_id,
            username: self.config.username.clone(),
            auth_response: authenticator.initial_response()?,
            database: self.config.database.clone(),
            auth_plugin_name: Some(authenticator.plugin().name().to_string()),
            attributes: self.config.attributes.clone(),
            zstd_level: None,
        };
        self.channel.write_packet(&response.encode()).await?;

        // 5. auth more data / switch 루프
        loop {
            let packet = self.channel.read_packet().await?;
            match authenticator.handle_packet(&packet)? {
                AuthStep::Write(data) => self.channel.write_packet(&data).await?,
                AuthStep::Continue => {}
                AuthStep::Done => {
                    let ok = OkPacket::parse(&packet, caps)?;
                    self.status = ok.status;
                    break;
                }
            }
        }
        info!("Authentication successful ({})", authenticator.plugin().name());

        if caps & capabilities::ZSTD_COMPRESSION_ALGORITHM != 0 {
            self.channel.enable_compression(CompressionAlgorithm::Zstd);
        } else if caps & capabilities::COMPRESS != 0 {
            self.channel.enable_compression(CompressionAlgorithm::Zlib);
        }
        Ok(())
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn collation(&self) -> &str {
        &self.collation
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed || self.channel.is_closed()
    }

    pub fn in_transaction(&self) -> bool {
        self.status & status::IN_TRANS != 0
    }

    pub fn is_tls(&self) -> bool {
        self.channel.is_tls()
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn channel_mut(&mut self) -> &mut PacketChannel {
        &mut self.channel
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// 커맨드 전송 (이전 스트리밍 결과가 남아 있으면 먼저 비움)
    pub(crate) async fn send_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(BinlogError::BadConn("connection is closed".to_string()));
        }
        if self.state == ConnState::Streaming {
            self.drain_rows().await?;
        }
        self.last_used = Instant::now();
        let result = self.channel.write_command(command, body).await;
        self.check_fatal(result)
    }

    fn check_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if e.is_connection_fatal() {
                self.state = ConnState::Closed;
            }
        }
        result
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let result = self.channel.read_packet().await;
        self.check_fatal(result)
    }

    fn server_error(&self, data: &[u8]) -> BinlogError {
        match parse_err_packet(data, self.capabilities) {
            Ok(err) => BinlogError::Server(err),
            Err(e) => e,
        }
    }

    /// OK 또는 ERR 패킷 하나 읽기
    pub(crate) async fn read_ok(&mut self) -> Result<OkPacket> {
        let data = self.read_packet().await?;
        match data[0] {
            OK_HEADER => {
                let ok = OkPacket::parse(&data, self.capabilities)?;
                self.status = ok.status;
                Ok(ok)
            }
            ERR_HEADER => Err(self.server_error(&data)),
            other => Err(BinlogError::MalformedPacket(format!(
                "expected OK packet, got 0x{:02x}",
                other
            ))),
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & capabilities::DEPRECATE_EOF != 0
    }

    /// 결과셋의 끝 표시 패킷인지 (EOF 또는 DEPRECATE_EOF의 0xFE OK)
    fn is_result_end(&self, data: &[u8]) -> bool {
        if self.deprecate_eof() {
            data[0] == EOF_HEADER && data.len() < MAX_PAYLOAD_LEN
        } else {
            is_eof_packet(data)
        }
    }

    fn end_status(&mut self, data: &[u8]) -> Result<(u16, u16)> {
        let (warnings, status) = if self.deprecate_eof() {
            let ok = OkPacket::parse(data, self.capabilities)?;
            (ok.warnings, ok.status)
        } else {
            let eof = EofPacket::parse(data)?;
            (eof.warnings, eof.status)
        };
        self.status = status;
        Ok((warnings, status))
    }

    /// 컬럼 정의 n개 (+ EOF)
    async fn read_fields(&mut self, count: usize) -> Result<Vec<Field>> {
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let data = self.read_packet().await?;
            fields.push(Field::parse(&data)?);
        }
        if count > 0 && !self.deprecate_eof() {
            let data = self.read_packet().await?;
            if !is_eof_packet(&data) {
                return Err(BinlogError::MalformedPacket("expected EOF after column definitions".to_string()));
            }
        }
        Ok(fields)
    }

    /// 응답 첫 패킷을 읽고 OK면 결과, 아니면 컬럼 정의까지 읽음
    async fn read_result_head(&mut self) -> Result<std::result::Result<QueryResult, Vec<Field>>> {
        let data = self.read_packet().await?;
        match data[0] {
            OK_HEADER => {
                let ok = OkPacket::parse(&data, self.capabilities)?;
                self.status = ok.status;
                Ok(Ok(QueryResult::from_ok(&ok)))
            }
            ERR_HEADER => Err(self.server_error(&data)),
            LOCAL_INFILE_HEADER => {
                self.state = ConnState::Closed;
                self.channel.close().await;
                Err(BinlogError::MalformedPacket("LOAD DATA LOCAL INFILE is not supported".to_string()))
            }
            _ => {
                let mut cursor = Cursor::new(data.as_slice());
                let count = cursor
                    .read_lenenc_int()?
                    .ok_or_else(|| BinlogError::MalformedPacket("NULL column count".to_string()))?;
                Ok(Err(self.read_fields(count as usize).await?))
            }
        }
    }

    /// 결과 하나 읽기 (텍스트 또는 바이너리 행)
    pub(crate) async fn read_result(&mut self, binary: bool) -> Result<QueryResult> {
        let fields = match self.read_result_head().await? {
            Ok(ok) => return Ok(ok),
            Err(fields) => fields,
        };
        let mut rows = Vec::new();
        loop {
            let data = self.read_packet().await?;
            if data[0] == ERR_HEADER {
                return Err(self.server_error(&data));
            }
            if self.is_result_end(&data) {
                let (warnings, status) = self.end_status(&data)?;
                return Ok(QueryResult {
                    status,
                    warnings,
                    result_set: Some(ResultSet { fields, rows }),
                    ..Default::default()
                });
            }
            let row = if binary {
                resultset::parse_binary_row(&data, &fields)?
            } else {
                resultset::parse_text_row(&data, &fields)?
            };
            rows.push(row);
        }
    }

    /// 남은 결과셋 모두 소비 (스트리밍 중단 시)
    async fn drain_rows(&mut self) -> Result<()> {
        loop {
            loop {
                let data = self.read_packet().await?;
                if data[0] == ERR_HEADER {
                    self.state = ConnState::Ready;
                    return Err(self.server_error(&data));
                }
                if self.is_result_end(&data) {
                    self.end_status(&data)?;
                    break;
                }
            }
            loop {
                if self.status & status::MORE_RESULTS_EXISTS == 0 {
                    self.state = ConnState::Ready;
                    return Ok(());
                }
                match self.read_result_head().await? {
                    Ok(_) => continue,
                    Err(_fields) => break,
                }
            }
        }
    }

    fn query_body(&self, sql: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(sql.len() + 2);
        if self.capabilities & capabilities::QUERY_ATTRIBUTES != 0 {
            let attrs = &self.query_attributes;
            put_lenenc_int(&mut body, attrs.len() as u64);
            // parameter set count
            put_lenenc_int(&mut body, 1);
            if !attrs.is_empty() {
                let values: Vec<Param> = attrs.iter().map(|(_, v)| v.clone()).collect();
                let bitmap_start = body.len();
                body.resize(bitmap_start + crate::protocol::codec::bitmap_len(values.len()), 0);
                for (i, v) in values.iter().enumerate() {
                    if v.is_null() {
                        body[bitmap_start + i / 8] |= 1 << (i % 8);
                    }
                }
                body.push(1);
                for (name, value) in attrs {
                    let (ty, unsigned) = value.column_type();
                    body.push(ty as u8);
                    body.push(if unsigned { 0x80 } else { 0 });
                    put_lenenc_bytes(&mut body, name.as_bytes());
                }
                for value in &values {
                    value.encode_value(&mut body);
                }
            }
        }
        body.extend_from_slice(sql.as_bytes());
        body
    }

    /// COM_PING
    pub async fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping, &[]).await?;
        self.read_ok().await.map(|_| ())
    }

    /// COM_INIT_DB
    pub async fn use_db(&mut self, name: &str) -> Result<()> {
        self.send_command(Command::InitDb, name.as_bytes()).await?;
        self.read_ok().await?;
        self.config.database = Some(name.to_string());
        Ok(())
    }

    /// 텍스트 프로토콜 쿼리. 여러 결과가 오면 첫 결과를 반환하고 나머지는 버림
    pub async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        let body = self.query_body(sql);
        self.send_command(Command::Query, &body).await?;
        let result = self.read_result(false).await?;
        if result.has_more_results() {
            self.drain_after_result().await?;
        }
        Ok(result)
    }

    async fn drain_after_result(&mut self) -> Result<()> {
        while self.status & status::MORE_RESULTS_EXISTS != 0 {
            self.read_result(false).await?;
        }
        self.state = ConnState::Ready;
        Ok(())
    }

    /// 파라미터 바인딩 실행: prepare → execute → close
    pub async fn execute_with(&mut self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        if params.is_empty() {
            return self.execute(sql).await;
        }
        let mut stmt = self.prepare(sql).await?;
        let result = stmt.execute(self, params).await;
        stmt.close(self).await?;
        result
    }

    /// `;`로 구분된 여러 문장 실행. 결과마다 콜백, 마지막 결과 반환
    pub async fn execute_multi<F>(&mut self, sql: &str, mut per_result: F) -> Result<QueryResult>
    where
        F: FnMut(&QueryResult) -> Result<()>,
    {
        let body = self.query_body(sql);
        self.send_command(Command::Query, &body).await?;
        loop {
            let result = self.read_result(false).await?;
            per_result(&result)?;
            if !result.has_more_results() {
                return Ok(result);
            }
        }
    }

    /// 행을 하나씩 읽는 스트리밍 쿼리
    pub async fn execute_streaming(&mut self, sql: &str) -> Result<RowStream<'_>> {
        let body = self.query_body(sql);
        self.send_command(Command::Query, &body).await?;
        let head = self.read_result_head().await?;
        Ok(match head {
            Ok(result) => RowStream {
                conn: self,
                fields: Vec::new(),
                current: Vec::new(),
                result: Some(result),
            },
            Err(fields) => {
                self.state = ConnState::Streaming;
                RowStream {
                    conn: self,
                    fields,
                    current: Vec::new(),
                    result: None,
                }
            }
        })
    }

    /// COM_STMT_PREPARE
    pub async fn prepare(&mut self, sql: &str) -> Result<Stmt> {
        self.send_command(Command::StmtPrepare, sql.as_bytes()).await?;
        let data = self.read_packet().await?;
        if data[0] == ERR_HEADER {
            return Err(self.server_error(&data));
        }
        let ok = PrepareOk::parse(&data)?;
        let params = self.read_fields(ok.params as usize).await?;
        let columns = self.read_fields(ok.columns as usize).await?;
        debug!("Prepared statement {}: {} params, {} columns", ok.statement_id, ok.params, ok.columns);
        Ok(Stmt::new(sql, ok, params, columns))
    }

    /// 이후 COM_QUERY에 실릴 쿼리 속성
    pub fn set_query_attributes(&mut self, attrs: Vec<(String, Param)>) {
        self.query_attributes = attrs;
    }

    /// 문자셋 변경. 현재와 다를 때만 SET NAMES 실행
    pub async fn set_charset(&mut self, charset: &str) -> Result<()> {
        if self.charset.eq_ignore_ascii_case(charset) {
            return Ok(());
        }
        self.execute(&format!("SET NAMES {}", charset)).await?;
        self.charset = charset.to_string();
        Ok(())
    }

    /// 콜레이션은 핸드셰이크 전에만 변경 가능
    pub fn set_collation(&mut self, collation: &str) -> Result<()> {
        if self.state != ConnState::Handshaking {
            return Err(BinlogError::ConfigError(
                "collation cannot be changed after the handshake".to_string(),
            ));
        }
        self.collation = collation.to_string();
        Ok(())
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN").await.map(|_| ())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// COM_QUIT 후 종료
    pub async fn quit(&mut self) -> Result<()> {
        if !self.is_closed() {
            let result = self.channel.write_command(Command::Quit, &[]).await;
            self.close().await;
            result?;
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
        self.state = ConnState::Closed;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.server_version)
            .field("state", &self.state)
            .field("channel", &self.channel)
            .finish()
    }
}

/// 스트리밍 결과. `next()`가 돌려준 행은 다음 호출 전까지만 유효
pub struct RowStream<'a> {
    conn: &'a mut Connection,
    fields: Vec<Field>,
    current: Vec<FieldValue>,
    result: Option<QueryResult>,
}

impl<'a> RowStream<'a> {
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// 다음 행. 끝나면 None
    pub async fn next(&mut self) -> Result<Option<&[FieldValue]>> {
        if self.result.is_some() {
            return Ok(None);
        }
        let data = self.conn.read_packet().await?;
        if data[0] == ERR_HEADER {
            self.conn.state = ConnState::Ready;
            return Err(self.conn.server_error(&data));
        }
        if self.conn.is_result_end(&data) {
            let (warnings, status) = self.conn.end_status(&data)?;
            // 뒤따르는 결과셋은 버림
            self.conn.drain_after_result().await?;
            self.result = Some(QueryResult {
                status,
                warnings,
                ..Default::default()
            });
            return Ok(None);
        }
        self.current = resultset::parse_text_row(&data, &self.fields)?;
        Ok(Some(self.current.as_slice()))
    }

    /// 남은 행을 버리고 최종 상태 반환
    pub async fn finish(mut self) -> Result<QueryResult> {
        while self.next().await?.is_some() {}
        Ok(self.result.take().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::InitialHandshake;
    use crate::types::ColumnType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// 테스트용 packet 쓰기
    async fn send(stream: &mut DuplexStream, seq: u8, payload: &[u8]) {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        buf.push(seq);
        buf.extend_from_slice(payload);
        stream.write_all(&buf).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        (header[3], payload)
    }

    fn greeting() -> Vec<u8> {
        InitialHandshake {
            protocol_version: 10,
            server_version: "8.0.36".to_string(),
            connection_id: 9,
            auth_plugin_data: vec![b'x'; 20],
            capabilities: capabilities::SERVER_DEFAULT & !capabilities::COMPRESS
                & !capabilities::ZSTD_COMPRESSION_ALGORITHM,
            charset: 45,
            status: status::AUTOCOMMIT,
            auth_plugin_name: auth::MYSQL_NATIVE_PASSWORD.to_string(),
        }
        .encode()
    }

    fn ok_packet() -> Vec<u8> {
        OkPacket {
            status: status::AUTOCOMMIT,
            ..Default::default()
        }
        .encode(OK_HEADER, capabilities::PROTOCOL_41)
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            send(&mut server, 0, &greeting()).await;
            let (seq, payload) = recv(&mut server).await;
            assert_eq!(seq, 1);
            let response = HandshakeResponse::parse(&payload).unwrap().unwrap();
            assert_eq!(response.username, "repl");
            assert_eq!(
                response.auth_response,
                auth::native_password_response("pw", &[b'x'; 20])
            );
            send(&mut server, 2, &ok_packet()).await;

            let (seq, payload) = recv(&mut server).await;
            assert_eq!((seq, payload), (0, vec![Command::Ping as u8]));
            send(&mut server, 1, &ok_packet()).await;
        });

        let config = ConnectionConfig::new("localhost", "repl").password("pw");
        let mut conn = Connection::connect_stream(Box::new(client), config).await.unwrap();
        assert_eq!(conn.server_version(), "8.0.36");
        assert_eq!(conn.connection_id(), 9);
        assert_eq!(conn.state(), ConnState::Ready);
        assert!(conn.set_collation("latin1_swedish_ci").is_err());
        conn.ping().await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_result_set_and_local_infile() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            send(&mut server, 0, &greeting()).await;
            recv(&mut server).await;
            send(&mut server, 2, &ok_packet()).await;

            // SELECT: column count, 1 field, row, 0xFE OK
            recv(&mut server).await;
            send(&mut server, 1, &[1]).await;
            send(&mut server, 2, &Field::new("a", ColumnType::Long).encode()).await;
            send(&mut server, 3, &resultset::encode_text_row(&[FieldValue::Signed(5)])).await;
            let end = OkPacket::default().encode(EOF_HEADER, capabilities::PROTOCOL_41);
            send(&mut server, 4, &end).await;

            // LOCAL INFILE
            recv(&mut server).await;
            send(&mut server, 1, &[LOCAL_INFILE_HEADER, b'f']).await;
        });

        let config = ConnectionConfig::new("localhost", "repl").password("pw");
        let mut conn = Connection::connect_stream(Box::new(client), config).await.unwrap();
        let result = conn.execute("SELECT 5").await.unwrap();
        assert_eq!(result.rows(), &[vec![FieldValue::Signed(5)]]);

        let err = conn.execute("LOAD DATA LOCAL INFILE 'f' INTO TABLE t").await.unwrap_err();
        assert!(matches!(err, BinlogError::MalformedPacket(_)));
        assert!(conn.is_closed());
        server_task.await.unwrap();
    }
}
