//! 테스트용 MySQL 서버
//!
//! 핸드셰이크(greeting, TLS 업그레이드, native / caching_sha2 / sha256 인증)와
//! 최소한의 커맨드 루프를 구현합니다. 쿼리 처리는 [`Handler`] 가 맡고, 서버 전역
//! 상태(연결 id, 계정, RSA 키, TLS)는 [`ServerContext`] 하나에 모입니다.

use crate::auth::{
    self, AuthPlugin, CACHING_SHA2_FAST_AUTH_SUCCESS, CACHING_SHA2_PERFORM_FULL_AUTH,
    CACHING_SHA2_REQUEST_PUBLIC_KEY, SCRAMBLE_LEN, SHA256_REQUEST_PUBLIC_KEY,
};
use crate::binlog_client::dump_flags;
use crate::connection::resultset::{encode_binary_row, encode_text_row, field_flags, read_binary_value};
use crate::connection::stmt::PrepareOk;
use crate::connection::Field;
use crate::error::{BinlogError, Result, ServerError};
use crate::gtid::MysqlGtidSet;
use crate::offset::BinlogPosition;
use crate::protocol::codec::{bitmap_len, put_lenenc_int, put_null_terminated, ReadMysqlExt};
use crate::protocol::compress::CompressionAlgorithm;
use crate::protocol::handshake::encode_err_packet;
use crate::protocol::{
    capabilities, status, AsyncStream, Command, EofPacket, HandshakeResponse, InitialHandshake,
    OkPacket, PacketChannel, EOF_HEADER, MORE_DATA_HEADER, OK_HEADER,
};
use crate::types::{ColumnType, FieldValue};
use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 에러 코드
pub mod error_codes {
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
    pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
}

use error_codes::*;

pub const DEFAULT_SERVER_VERSION: &str = "8.0.36-fake";

/// 계정 정보. `passwords` 중 하나와 맞으면 인증 성공
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub passwords: Vec<String>,
    pub plugin: AuthPlugin,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>, plugin: AuthPlugin) -> Self {
        Credential {
            username: username.into(),
            passwords: vec![password.into()],
            plugin,
        }
    }

    fn allows_empty(&self) -> bool {
        self.passwords.iter().any(String::is_empty)
    }

    fn matches(&self, password: &str) -> bool {
        self.passwords.iter().any(|p| p == password)
    }
}

/// 서버 전역 상태
pub struct ServerContext {
    next_connection_id: AtomicU32,
    pub server_version: String,
    pub capabilities: u32,
    /// greeting 에 싣는 플러그인
    pub default_auth_plugin: AuthPlugin,
    users: RwLock<HashMap<String, Credential>>,
    /// caching_sha2 캐시: user → SHA256(SHA256(P))
    sha2_cache: Mutex<HashMap<String, Vec<u8>>>,
    rsa_key: Option<RsaPrivateKey>,
    public_key_pem: String,
    tls: Option<TlsAcceptor>,
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_VERSION)
    }
}

impl ServerContext {
    pub fn new(server_version: impl Into<String>) -> Self {
        ServerContext {
            next_connection_id: AtomicU32::new(1),
            server_version: server_version.into(),
            capabilities: capabilities::SERVER_DEFAULT,
            default_auth_plugin: AuthPlugin::NativePassword,
            users: RwLock::new(HashMap::new()),
            sha2_cache: Mutex::new(HashMap::new()),
            rsa_key: None,
            public_key_pem: String::new(),
            tls: None,
        }
    }

    pub fn with_default_auth_plugin(mut self, plugin: AuthPlugin) -> Self {
        self.default_auth_plugin = plugin;
        self
    }

    /// caching_sha2 / sha256 full auth 용 RSA 키
    pub fn with_rsa_key(mut self, key: RsaPrivateKey) -> Result<Self> {
        self.public_key_pem = RsaPublicKey::from(&key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| BinlogError::ConfigError(format!("Failed to encode public key: {}", e)))?;
        self.rsa_key = Some(key);
        Ok(self)
    }

    /// PKCS#8 또는 PKCS#1 PEM 개인키 파일
    pub fn with_rsa_key_file(self, path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| BinlogError::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| BinlogError::ConfigError(format!("Invalid RSA private key: {}", e)))?;
        self.with_rsa_key(key)
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn add_user(&self, credential: Credential) {
        self.users.write().insert(credential.username.clone(), credential);
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
        self.sha2_cache.lock().remove(username);
    }

    fn user(&self, username: &str) -> Option<Credential> {
        self.users.read().get(username).cloned()
    }

    /// caching_sha2 fast auth 가 통하도록 캐시에 미리 넣음
    pub fn cache_sha2_password(&self, username: &str, password: &str) {
        self.sha2_cache
            .lock()
            .insert(username.to_string(), auth::caching_sha2_digest(password));
    }

    pub fn is_sha2_cached(&self, username: &str) -> bool {
        self.sha2_cache.lock().contains_key(username)
    }

    fn cached_digest(&self, username: &str) -> Option<Vec<u8>> {
        self.sha2_cache.lock().get(username).cloned()
    }

    fn next_connection_id(&self) -> u32 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// NUL 없는 20 bytes salt
    fn generate_salt(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..SCRAMBLE_LEN).map(|_| rng.gen_range(1u8..=127)).collect()
    }

    fn server_capabilities(&self) -> u32 {
        if self.tls.is_some() {
            self.capabilities | capabilities::SSL
        } else {
            self.capabilities & !capabilities::SSL
        }
    }
}

fn generate_ed25519_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; auth::ED25519_NONCE_LEN];
    rand::thread_rng().fill(nonce.as_mut_slice());
    nonce
}

/// 연결별 세션 상태 (핸들러가 수정할 수 있음)
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub connection_id: u32,
    pub username: String,
    pub database: Option<String>,
    /// 협상된 capability
    pub capabilities: u32,
    pub status: u16,
    /// 마지막 COM_QUERY 의 쿼리 속성
    pub query_attributes: Vec<(String, FieldValue)>,
    pub attributes: Vec<(String, String)>,
    /// COM_REGISTER_SLAVE 로 등록한 server id
    pub replica_server_id: Option<u32>,
}

/// 커맨드 응답
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(OkPacket),
    ResultSet {
        fields: Vec<Field>,
        rows: Vec<Vec<FieldValue>>,
    },
    Error(ServerError),
    /// 다중 결과 (마지막을 제외하고 MORE_RESULTS_EXISTS)
    Multi(Vec<Response>),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(OkPacket::default())
    }

    pub fn affected(rows: u64, last_insert_id: u64) -> Self {
        Response::Ok(OkPacket {
            affected_rows: rows,
            last_insert_id,
            ..Default::default()
        })
    }

    pub fn error(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Response::Error(ServerError::new(code, sql_state, message))
    }
}

/// COM_STMT_PREPARE 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementInfo {
    pub params: Vec<Field>,
    pub columns: Vec<Field>,
}

/// 덤프 시작 지점
#[derive(Debug, Clone, PartialEq)]
pub enum DumpStart {
    Position(BinlogPosition),
    Gtid(MysqlGtidSet),
}

/// COM_BINLOG_DUMP / COM_BINLOG_DUMP_GTID 요청
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRequest {
    pub server_id: u32,
    pub flags: u16,
    pub start: DumpStart,
}

impl DumpRequest {
    pub fn parse(command: Command, body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);
        match command {
            Command::BinlogDump => {
                let position = cursor.read_u32::<LittleEndian>()?;
                let flags = cursor.read_u16::<LittleEndian>()?;
                let server_id = cursor.read_u32::<LittleEndian>()?;
                let filename = String::from_utf8_lossy(cursor.rest()).into_owned();
                Ok(DumpRequest {
                    server_id,
                    flags,
                    start: DumpStart::Position(BinlogPosition::new(filename, u64::from(position))),
                })
            }
            Command::BinlogDumpGtid => {
                let flags = cursor.read_u16::<LittleEndian>()?;
                let server_id = cursor.read_u32::<LittleEndian>()?;
                let name_len = cursor.read_u32::<LittleEndian>()? as usize;
                let filename = String::from_utf8_lossy(cursor.take_bytes(name_len)?).into_owned();
                let position = cursor.read_u64::<LittleEndian>()?;
                let start = if flags & dump_flags::THROUGH_GTID != 0 {
                    let data_len = cursor.read_u32::<LittleEndian>()? as usize;
                    DumpStart::Gtid(MysqlGtidSet::decode(cursor.take_bytes(data_len)?)?)
                } else {
                    DumpStart::Position(BinlogPosition::new(filename, position))
                };
                Ok(DumpRequest {
                    server_id,
                    flags,
                    start,
                })
            }
            other => Err(BinlogError::ProtocolError(format!("{:?} is not a dump command", other))),
        }
    }

    pub fn is_non_blocking(&self) -> bool {
        self.flags & dump_flags::NON_BLOCK != 0
    }
}

/// 커맨드 처리기. `Err(BinlogError::Server)` 는 ERR 패킷으로, 그 밖의 에러는
/// ER_UNKNOWN_ERROR 로 전달됩니다.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn use_db(&self, session: &mut Session, db: &str) -> Result<Response> {
        session.database = Some(db.to_string());
        Ok(Response::ok())
    }

    async fn query(&self, session: &mut Session, sql: &str) -> Result<Response>;

    async fn prepare(&self, _session: &mut Session, _sql: &str) -> Result<StatementInfo> {
        Err(BinlogError::Server(ServerError::new(
            ER_NOT_SUPPORTED_YET,
            "42000",
            "prepared statements are not supported",
        )))
    }

    async fn execute(&self, _session: &mut Session, _sql: &str, _params: &[FieldValue]) -> Result<Response> {
        Err(BinlogError::Server(ServerError::new(
            ER_NOT_SUPPORTED_YET,
            "42000",
            "prepared statements are not supported",
        )))
    }

    /// 보낼 이벤트 (헤더 포함, OK 바이트 제외)
    async fn binlog_dump(&self, _session: &mut Session, _request: &DumpRequest) -> Result<Vec<Vec<u8>>> {
        Err(BinlogError::Server(ServerError::new(
            ER_NOT_SUPPORTED_YET,
            "42000",
            "binlog dump is not supported",
        )))
    }
}

#[derive(Debug, Clone)]
struct ServerStmt {
    sql: String,
    param_count: usize,
    /// (type, flags) — 처음 바인딩될 때 채워짐
    param_types: Vec<(u8, u8)>,
    columns: Vec<Field>,
    long_data: HashMap<usize, Vec<u8>>,
}

/// 서버 측 연결 하나
pub struct ServerConn {
    channel: PacketChannel,
    ctx: Arc<ServerContext>,
    handler: Arc<dyn Handler>,
    session: Session,
    salt: Vec<u8>,
    statements: HashMap<u32, ServerStmt>,
    next_stmt_id: u32,
}

impl ServerConn {
    /// greeting 전송부터 인증 완료까지
    pub async fn accept(
        stream: Box<dyn AsyncStream>,
        ctx: Arc<ServerContext>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        let connection_id = ctx.next_connection_id();
        let salt = ctx.generate_salt();
        let mut conn = ServerConn {
            channel: PacketChannel::new(stream),
            ctx,
            handler,
            session: Session {
                connection_id,
                status: status::AUTOCOMMIT,
                ..Default::default()
            },
            salt,
            statements: HashMap::new(),
            next_stmt_id: 1,
        };
        if let Err(e) = conn.handshake().await {
            conn.channel.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn handshake(&mut self) -> Result<()> {
        let server_caps = self.ctx.server_capabilities();
        let greeting = InitialHandshake {
            protocol_version: 10,
            server_version: self.ctx.server_version.clone(),
            connection_id: self.session.connection_id,
            auth_plugin_data: self.salt.clone(),
            capabilities: server_caps,
            charset: 45,
            status: self.session.status,
            auth_plugin_name: self.ctx.default_auth_plugin.name().to_string(),
        };
        self.channel.write_packet(&greeting.encode()).await?;

        let data = self.channel.read_packet().await?;
        let response = match HandshakeResponse::parse(&data)? {
            Some(response) => response,
            None => {
                let acceptor = self
                    .ctx
                    .tls
                    .clone()
                    .ok_or_else(|| BinlogError::ProtocolError("client requested TLS but it is not enabled".to_string()))?;
                self.channel.upgrade_server_tls(acceptor).await?;
                debug!("Connection {} upgraded to TLS", self.session.connection_id);
                let data = self.channel.read_packet().await?;
                HandshakeResponse::parse(&data)?.ok_or_else(|| {
                    BinlogError::ProtocolError("duplicate SSLRequest after TLS upgrade".to_string())
                })?
            }
        };

        let caps = response.capabilities & server_caps;
        self.session.capabilities = caps;
        self.session.username = response.username.clone();
        self.session.database = response.database.clone();
        self.session.attributes = response.attributes.clone();

        self.authenticate(&response).await?;

        let ok = OkPacket {
            status: self.session.status,
            ..Default::default()
        };
        self.channel.write_packet(&ok.encode(OK_HEADER, caps)).await?;
        info!(
            "Connection {} authenticated as '{}'",
            self.session.connection_id, self.session.username
        );

        if caps & capabilities::ZSTD_COMPRESSION_ALGORITHM != 0 {
            self.channel.enable_compression(CompressionAlgorithm::Zstd);
        } else if caps & capabilities::COMPRESS != 0 {
            self.channel.enable_compression(CompressionAlgorithm::Zlib);
        }
        Ok(())
    }

    async fn authenticate(&mut self, response: &HandshakeResponse) -> Result<()> {
        let Some(credential) = self.ctx.user(&response.username) else {
            return self.deny(&response.username).await;
        };

        let client_plugin = response.auth_plugin_name.as_deref().unwrap_or_default();
        let mut auth_data = response.auth_response.clone();
        // client_ed25519 는 항상 새 32 bytes nonce 에 서명받음
        let ed25519_nonce = (credential.plugin == AuthPlugin::Ed25519).then(generate_ed25519_nonce);
        if client_plugin != credential.plugin.name() || ed25519_nonce.is_some() {
            // AuthSwitchRequest: {0xFE, plugin\0, salt, 0x00}. ed25519 nonce 뒤에는 NUL 없음
            let mut packet = vec![EOF_HEADER];
            put_null_terminated(&mut packet, credential.plugin.name().as_bytes());
            match &ed25519_nonce {
                Some(nonce) => packet.extend_from_slice(nonce),
                None => {
                    packet.extend_from_slice(&self.salt);
                    packet.push(0);
                }
            }
            self.channel.write_packet(&packet).await?;
            debug!(
                "Auth switch for '{}': {} -> {}",
                credential.username,
                client_plugin,
                credential.plugin.name()
            );
            auth_data = self.channel.read_packet_allow_empty().await?;
        }

        let accepted = match credential.plugin {
            AuthPlugin::NativePassword => {
                if auth_data.is_empty() {
                    credential.allows_empty()
                } else {
                    credential
                        .passwords
                        .iter()
                        .any(|p| auth::check_native_password(&auth_data, &self.salt, p))
                }
            }
            AuthPlugin::ClearPassword => {
                let plain = auth_data.strip_suffix(&[0]).unwrap_or(&auth_data);
                credential.passwords.iter().any(|p| p.as_bytes() == plain)
            }
            AuthPlugin::CachingSha2Password => self.caching_sha2(&credential, &auth_data).await?,
            AuthPlugin::Ed25519 => {
                let nonce = ed25519_nonce.unwrap_or_default();
                credential
                    .passwords
                    .iter()
                    .any(|p| auth::check_ed25519(&auth_data, &nonce, &auth::ed25519_public_key(p)))
            }
            AuthPlugin::Sha256Password => {
                if auth_data.is_empty() || auth_data == [0] {
                    credential.allows_empty()
                } else {
                    match self.full_auth_password(auth_data, SHA256_REQUEST_PUBLIC_KEY).await? {
                        Some(password) => credential.matches(&password),
                        None => false,
                    }
                }
            }
        };

        if !accepted {
            return self.deny(&credential.username).await;
        }
        Ok(())
    }

    async fn caching_sha2(&mut self, credential: &Credential, auth_data: &[u8]) -> Result<bool> {
        if auth_data.is_empty() {
            return Ok(credential.allows_empty());
        }
        if let Some(digest) = self.ctx.cached_digest(&credential.username) {
            if auth::check_caching_sha2_digest(auth_data, &self.salt, &digest) {
                self.channel
                    .write_packet(&[MORE_DATA_HEADER, CACHING_SHA2_FAST_AUTH_SUCCESS])
                    .await?;
                return Ok(true);
            }
        }

        self.channel
            .write_packet(&[MORE_DATA_HEADER, CACHING_SHA2_PERFORM_FULL_AUTH])
            .await?;
        let first = self.channel.read_packet_allow_empty().await?;
        let Some(password) = self.full_auth_password(first, CACHING_SHA2_REQUEST_PUBLIC_KEY).await? else {
            return Ok(false);
        };
        let matched = credential.matches(&password);
        if matched {
            self.ctx.cache_sha2_password(&credential.username, &password);
        }
        Ok(matched)
    }

    /// full auth 로 평문 비밀번호 얻기. TLS 면 평문, 아니면 RSA-OAEP 암호문.
    /// 첫 패킷이 공개키 요청이면 PEM 을 보내고 다음 패킷을 읽음
    async fn full_auth_password(&mut self, first: Vec<u8>, key_request: u8) -> Result<Option<String>> {
        if self.channel.is_tls() {
            let plain = first.strip_suffix(&[0]).unwrap_or(&first);
            return Ok(Some(String::from_utf8_lossy(plain).into_owned()));
        }
        let ctx = self.ctx.clone();
        let Some(key) = ctx.rsa_key.as_ref() else {
            warn!("Full authentication over plaintext requires an RSA key");
            return Ok(None);
        };
        let mut ciphertext = first;
        if ciphertext == [key_request] {
            let mut packet = Vec::with_capacity(1 + ctx.public_key_pem.len());
            packet.push(MORE_DATA_HEADER);
            packet.extend_from_slice(ctx.public_key_pem.as_bytes());
            self.channel.write_packet(&packet).await?;
            ciphertext = self.channel.read_packet().await?;
        }
        match auth::decrypt_password(&ciphertext, &self.salt, key) {
            Ok(password) => Ok(Some(password)),
            Err(e) => {
                debug!("Failed to decrypt password: {}", e);
                Ok(None)
            }
        }
    }

    async fn deny(&mut self, username: &str) -> Result<()> {
        let err = ServerError::new(
            ER_ACCESS_DENIED_ERROR,
            "28000",
            format!("Access denied for user '{}'", username),
        );
        self.channel.write_packet(&encode_err_packet(&err)).await?;
        Err(BinlogError::AuthFailed(err.message))
    }

    fn deprecate_eof(&self) -> bool {
        self.session.capabilities & capabilities::DEPRECATE_EOF != 0
    }

    /// 클라이언트가 끊거나 COM_QUIT 을 보낼 때까지 커맨드 처리
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.channel.reset_sequence();
            let data = match self.channel.read_packet().await {
                Ok(data) => data,
                Err(BinlogError::UnexpectedEof | BinlogError::BadConn(_)) => break,
                Err(e) => return Err(e),
            };
            let Some(command) = Command::from_u8(data[0]) else {
                self.write_error(ServerError::new(
                    ER_UNKNOWN_COM_ERROR,
                    "08S01",
                    format!("Unknown command 0x{:02x}", data[0]),
                ))
                .await?;
                continue;
            };
            trace!("Connection {} command {:?}", self.session.connection_id, command);
            if command == Command::Quit {
                break;
            }
            self.dispatch(command, &data[1..]).await?;
        }
        self.channel.close().await;
        debug!("Connection {} closed", self.session.connection_id);
        Ok(())
    }

    async fn dispatch(&mut self, command: Command, body: &[u8]) -> Result<()> {
        let handler = self.handler.clone();
        match command {
            Command::Ping | Command::ResetConnection | Command::SetOption => {
                if command == Command::ResetConnection {
                    self.statements.clear();
                    self.session.query_attributes.clear();
                }
                self.write_response(Response::ok(), None).await
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(body).into_owned();
                let result = handler.use_db(&mut self.session, &db).await;
                self.write_result(result, None).await
            }
            Command::Query => {
                let (sql, attrs) = self.parse_query(body)?;
                self.session.query_attributes = attrs;
                let result = handler.query(&mut self.session, &sql).await;
                self.write_result(result, None).await
            }
            Command::StmtPrepare => {
                let sql = String::from_utf8_lossy(body).into_owned();
                match handler.prepare(&mut self.session, &sql).await {
                    Ok(info) => self.write_prepare_ok(sql, info).await,
                    Err(e) => self.write_result(Err(e), None).await,
                }
            }
            Command::StmtExecute => {
                let (sql, params, columns) = match self.parse_execute(body) {
                    Ok(parsed) => parsed,
                    Err(BinlogError::Server(err)) => return self.write_error(err).await,
                    Err(e) => return Err(e),
                };
                let result = handler.execute(&mut self.session, &sql, &params).await;
                self.write_result(result, Some(&columns)).await
            }
            Command::StmtSendLongData => {
                let mut cursor = Cursor::new(body);
                let id = cursor.read_u32::<LittleEndian>()?;
                let param = cursor.read_u16::<LittleEndian>()? as usize;
                if let Some(stmt) = self.statements.get_mut(&id) {
                    stmt.long_data.entry(param).or_default().extend_from_slice(cursor.rest());
                }
                Ok(())
            }
            Command::StmtReset => {
                let id = Cursor::new(body).read_u32::<LittleEndian>()?;
                match self.statements.get_mut(&id) {
                    Some(stmt) => {
                        stmt.long_data.clear();
                        self.write_response(Response::ok(), None).await
                    }
                    None => self.write_error(unknown_statement(id)).await,
                }
            }
            Command::StmtClose => {
                let id = Cursor::new(body).read_u32::<LittleEndian>()?;
                self.statements.remove(&id);
                Ok(())
            }
            Command::RegisterSlave => {
                let server_id = Cursor::new(body).read_u32::<LittleEndian>()?;
                self.session.replica_server_id = Some(server_id);
                info!("Replica registered with server_id={}", server_id);
                self.write_response(Response::ok(), None).await
            }
            Command::BinlogDump | Command::BinlogDumpGtid => self.binlog_dump(command, body).await,
            other => {
                self.write_error(ServerError::new(
                    ER_UNKNOWN_COM_ERROR,
                    "08S01",
                    format!("Command {:?} is not supported", other),
                ))
                .await
            }
        }
    }

    /// COM_QUERY 본문: QUERY_ATTRIBUTES 가 협상되었으면 속성 블록이 앞에 옴
    fn parse_query(&self, body: &[u8]) -> Result<(String, Vec<(String, FieldValue)>)> {
        if self.session.capabilities & capabilities::QUERY_ATTRIBUTES == 0 {
            return Ok((String::from_utf8_lossy(body).into_owned(), Vec::new()));
        }
        let mut cursor = Cursor::new(body);
        let count = cursor.read_lenenc_int()?.unwrap_or(0) as usize;
        // parameter set count (항상 1)
        cursor.read_lenenc_int()?;
        let mut attrs = Vec::with_capacity(count);
        if count > 0 {
            let null_bitmap = cursor.take_bytes(bitmap_len(count))?.to_vec();
            if cursor.read_u8()? != 1 {
                return Err(BinlogError::MalformedPacket(
                    "query attributes without types".to_string(),
                ));
            }
            let mut declared = Vec::with_capacity(count);
            for _ in 0..count {
                let ty = cursor.read_u8()?;
                let flags = cursor.read_u8()?;
                let name = cursor.read_lenenc_string()?;
                declared.push((ty, flags, name));
            }
            for (i, (ty, flags, name)) in declared.into_iter().enumerate() {
                let value = if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                    FieldValue::Null
                } else {
                    read_binary_value(&mut cursor, &param_field(ty, flags)?)?
                };
                attrs.push((name, value));
            }
        }
        Ok((String::from_utf8_lossy(cursor.rest()).into_owned(), attrs))
    }

    /// COM_STMT_EXECUTE 본문 → (sql, 파라미터, 결과 컬럼)
    fn parse_execute(&mut self, body: &[u8]) -> Result<(String, Vec<FieldValue>, Vec<Field>)> {
        let mut cursor = Cursor::new(body);
        let id = cursor.read_u32::<LittleEndian>()?;
        let _flags = cursor.read_u8()?;
        let _iterations = cursor.read_u32::<LittleEndian>()?;
        let stmt = self
            .statements
            .get_mut(&id)
            .ok_or_else(|| BinlogError::Server(unknown_statement(id)))?;

        let count = stmt.param_count;
        let mut params = Vec::with_capacity(count);
        if count > 0 {
            let null_bitmap = cursor.take_bytes(bitmap_len(count))?.to_vec();
            if cursor.read_u8()? == 1 {
                stmt.param_types.clear();
                for _ in 0..count {
                    let ty = cursor.read_u8()?;
                    let flags = cursor.read_u8()?;
                    stmt.param_types.push((ty, flags));
                }
            }
            for i in 0..count {
                if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                    params.push(FieldValue::Null);
                    continue;
                }
                if let Some(data) = stmt.long_data.remove(&i) {
                    params.push(FieldValue::String(data));
                    continue;
                }
                let (ty, flags) = stmt.param_types.get(i).copied().ok_or_else(|| {
                    BinlogError::MalformedPacket(format!("missing type for parameter {}", i))
                })?;
                params.push(read_binary_value(&mut cursor, &param_field(ty, flags)?)?);
            }
        }
        stmt.long_data.clear();
        Ok((stmt.sql.clone(), params, stmt.columns.clone()))
    }

    async fn write_prepare_ok(&mut self, sql: String, info: StatementInfo) -> Result<()> {
        let statement_id = self.next_stmt_id;
        self.next_stmt_id = self.next_stmt_id.wrapping_add(1).max(1);
        let ok = PrepareOk {
            statement_id,
            columns: info.columns.len() as u16,
            params: info.params.len() as u16,
            warnings: 0,
        };
        self.channel.write_packet(&ok.encode()).await?;
        self.write_fields(&info.params).await?;
        self.write_fields(&info.columns).await?;
        debug!(
            "Prepared statement {}: {} params, {} columns",
            statement_id,
            info.params.len(),
            info.columns.len()
        );
        self.statements.insert(
            statement_id,
            ServerStmt {
                sql,
                param_count: info.params.len(),
                param_types: Vec::new(),
                columns: info.columns,
                long_data: HashMap::new(),
            },
        );
        Ok(())
    }

    /// 컬럼 정의들 (+ DEPRECATE_EOF 가 아니면 EOF)
    async fn write_fields(&mut self, fields: &[Field]) -> Result<()> {
        for field in fields {
            self.channel.write_packet(&field.encode()).await?;
        }
        if !fields.is_empty() && !self.deprecate_eof() {
            let eof = EofPacket {
                warnings: 0,
                status: self.session.status,
            };
            self.channel.write_packet(&eof.encode()).await?;
        }
        Ok(())
    }

    async fn write_result(&mut self, result: Result<Response>, binary: Option<&[Field]>) -> Result<()> {
        match result {
            Ok(response) => self.write_response(response, binary).await,
            Err(BinlogError::Server(err)) => self.write_error(err).await,
            Err(e) => {
                warn!("Handler failed: {}", e);
                self.write_error(ServerError::new(ER_UNKNOWN_ERROR, "HY000", e.to_string()))
                    .await
            }
        }
    }

    async fn write_error(&mut self, err: ServerError) -> Result<()> {
        self.channel.write_packet(&encode_err_packet(&err)).await
    }

    /// `binary` 가 있으면 바이너리 프로토콜 행
    async fn write_response(&mut self, response: Response, binary: Option<&[Field]>) -> Result<()> {
        match response {
            Response::Multi(parts) if parts.is_empty() => self.write_single(Response::ok(), binary, false).await,
            Response::Multi(parts) => {
                let last = parts.len() - 1;
                for (i, part) in parts.into_iter().enumerate() {
                    let is_error = matches!(part, Response::Error(_));
                    self.write_single(part, binary, i < last).await?;
                    if is_error {
                        break;
                    }
                }
                Ok(())
            }
            single => self.write_single(single, binary, false).await,
        }
    }

    async fn write_single(&mut self, response: Response, binary: Option<&[Field]>, more: bool) -> Result<()> {
        let caps = self.session.capabilities;
        let mut status = self.session.status;
        if more {
            status |= status::MORE_RESULTS_EXISTS;
        }
        match response {
            Response::Ok(mut ok) => {
                ok.status |= status;
                self.channel.write_packet(&ok.encode(OK_HEADER, caps)).await
            }
            Response::Error(err) => self.write_error(err).await,
            Response::ResultSet { fields, rows } => {
                let mut head = Vec::with_capacity(9);
                put_lenenc_int(&mut head, fields.len() as u64);
                self.channel.write_packet(&head).await?;
                self.write_fields(&fields).await?;
                for row in &rows {
                    let data = match binary {
                        Some(_) => encode_binary_row(row, &fields)?,
                        None => encode_text_row(row),
                    };
                    self.channel.write_packet(&data).await?;
                }
                if self.deprecate_eof() {
                    let ok = OkPacket {
                        status,
                        ..Default::default()
                    };
                    self.channel.write_packet(&ok.encode(EOF_HEADER, caps)).await
                } else {
                    let eof = EofPacket { warnings: 0, status };
                    self.channel.write_packet(&eof.encode()).await
                }
            }
            Response::Multi(_) => Err(BinlogError::ProtocolError(
                "nested multi-result responses are not supported".to_string(),
            )),
        }
    }

    async fn binlog_dump(&mut self, command: Command, body: &[u8]) -> Result<()> {
        let request = DumpRequest::parse(command, body)?;
        info!(
            "Binlog dump requested by server_id={}: {:?}",
            request.server_id, request.start
        );
        let handler = self.handler.clone();
        let events = match handler.binlog_dump(&mut self.session, &request).await {
            Ok(events) => events,
            Err(e) => return self.write_result(Err(e), None).await,
        };
        for event in &events {
            let mut packet = Vec::with_capacity(event.len() + 1);
            packet.push(OK_HEADER);
            packet.extend_from_slice(event);
            self.channel.write_packet(&packet).await?;
        }
        debug!("Sent {} binlog events", events.len());

        if request.is_non_blocking() {
            let eof = EofPacket {
                warnings: 0,
                status: self.session.status,
            };
            return self.channel.write_packet(&eof.encode()).await;
        }
        // 블로킹 덤프: 클라이언트가 끊을 때까지 대기 (semi-sync ACK 는 버림)
        loop {
            self.channel.reset_sequence();
            match self.channel.read_packet().await {
                Ok(packet) => trace!("Ignoring {} bytes from replica", packet.len()),
                Err(_) => break,
            }
        }
        Ok(())
    }
}

fn unknown_statement(id: u32) -> ServerError {
    ServerError::new(
        ER_UNKNOWN_STMT_HANDLER,
        "HY000",
        format!("Unknown prepared statement handler ({})", id),
    )
}

/// 바인드 타입 (type, flags) → 디코딩용 컬럼 정의
fn param_field(ty: u8, flags: u8) -> Result<Field> {
    let mut field = Field::new("?", ColumnType::try_from(ty)?);
    if flags & 0x80 != 0 {
        field.flags |= field_flags::UNSIGNED;
    }
    Ok(field)
}

/// 연결을 받아 연결마다 태스크를 띄움. `shutdown` 이 취소되면 종료
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Fake server listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let ctx = ctx.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = async {
                let conn = ServerConn::accept(Box::new(stream), ctx, handler).await?;
                tokio::select! {
                    _ = shutdown.cancelled() => Ok(()),
                    result = conn.run() => result,
                }
            }
            .await;
            if let Err(e) = result {
                warn!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::MysqlGtidSet;

    #[test]
    fn test_dump_request_parse() {
        let mut body = Vec::new();
        body.extend_from_slice(&120u32.to_le_bytes());
        body.extend_from_slice(&dump_flags::NON_BLOCK.to_le_bytes());
        body.extend_from_slice(&9u32.to_le_bytes());
        body.extend_from_slice(b"mysql-bin.000002");
        let request = DumpRequest::parse(Command::BinlogDump, &body).unwrap();
        assert_eq!(request.server_id, 9);
        assert!(request.is_non_blocking());
        assert_eq!(
            request.start,
            DumpStart::Position(BinlogPosition::new("mysql-bin.000002", 120))
        );
    }

    #[test]
    fn test_dump_gtid_request_parse() {
        let set = MysqlGtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5").unwrap();
        let data = set.encode();
        let mut body = Vec::new();
        body.extend_from_slice(&dump_flags::THROUGH_GTID.to_le_bytes());
        body.extend_from_slice(&3u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&4u64.to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(&data);
        let request = DumpRequest::parse(Command::BinlogDumpGtid, &body).unwrap();
        assert_eq!(request.start, DumpStart::Gtid(set));
        assert!(!request.is_non_blocking());
    }

    #[test]
    fn test_param_field() {
        let field = param_field(ColumnType::LongLong as u8, 0x80).unwrap();
        assert!(field.is_unsigned());
        assert!(param_field(0x42, 0).is_err());
    }

    #[test]
    fn test_context_ids_and_salt() {
        let ctx = ServerContext::default();
        let a = ctx.next_connection_id();
        let b = ctx.next_connection_id();
        assert_eq!(b, a + 1);
        let salt = ctx.generate_salt();
        assert_eq!(salt.len(), SCRAMBLE_LEN);
        assert!(salt.iter().all(|&b| b != 0));
        assert_eq!(ctx.server_capabilities() & capabilities::SSL, 0);
    }

    #[test]
    fn test_sha2_cache() {
        let ctx = ServerContext::default();
        ctx.add_user(Credential::new("app", "pw", AuthPlugin::CachingSha2Password));
        assert!(!ctx.is_sha2_cached("app"));
        ctx.cache_sha2_password("app", "pw");
        assert!(ctx.is_sha2_cached("app"));
        ctx.remove_user("app");
        assert!(!ctx.is_sha2_cached("app"));
        assert!(ctx.user("app").is_none());
    }
}
