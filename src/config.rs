//! 연결 설정
//!
//! 환경변수(`DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`, `DB_SOCKET`)나
//! 빌더 메서드로 구성합니다. 덤프 도구 옵션([`DumpOptions`])은 `BINLOG_*` 환경변수를
//! 읽습니다.

use crate::binlog::{DdlFilter, ParseOptions, RowFilter, TimeFilter};
use crate::error::{BinlogError, Result};
use crate::gtid::Flavor;
use crate::offset::BinlogPosition;
use crate::protocol::compress::CompressionAlgorithm;
use crate::protocol::tls::{SslMode, TlsConfig};
use crate::protocol::{collation_id, DEFAULT_MAX_ALLOWED_PACKET};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    /// unix domain socket 경로 (설정되면 TCP 대신 사용)
    pub socket: Option<String>,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// 핸드셰이크에 사용할 콜레이션 이름
    pub collation: String,
    pub tls: TlsConfig,
    pub compression: CompressionAlgorithm,
    /// 서버와 공통이더라도 끄고 싶은 capability
    pub disabled_capabilities: u32,
    /// CLIENT_CONNECT_ATTRS로 보내는 속성
    pub attributes: Vec<(String, String)>,
    /// caching_sha2/sha256 full auth에 쓸 서버 공개키 PEM 파일
    pub server_pub_key_path: Option<PathBuf>,
    pub max_allowed_packet: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            socket: None,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            connect_timeout: Some(Duration::from_secs(30)),
            read_timeout: None,
            write_timeout: None,
            collation: "utf8mb4_general_ci".to_string(),
            tls: TlsConfig::default(),
            compression: CompressionAlgorithm::None,
            disabled_capabilities: 0,
            attributes: vec![
                ("_client_name".to_string(), env!("CARGO_PKG_NAME").to_string()),
                ("_client_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ],
            server_pub_key_path: None,
            max_allowed_packet: DEFAULT_MAX_ALLOWED_PACKET,
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// 환경변수에서 설정 읽기
    pub fn from_env() -> Result<Self> {
        let mut config = ConnectionConfig::default();
        if let Ok(host) = env::var("DB_HOST") {
            config.hostname = host;
        }
        if let Ok(port) = env::var("DB_PORT") {
            config.port = port
                .parse()
                .map_err(|_| BinlogError::ConfigError(format!("Invalid DB_PORT '{}'", port)))?;
        }
        if let Ok(user) = env::var("DB_USER") {
            config.username = user;
        }
        if let Ok(password) = env::var("DB_PASSWORD") {
            config.password = password;
        }
        config.database = env::var("DB_NAME").ok().filter(|s| !s.is_empty());
        config.socket = env::var("DB_SOCKET").ok().filter(|s| !s.is_empty());
        if let Ok(mode) = env::var("DB_SSL_MODE") {
            config.tls.mode = mode.parse::<SslMode>()?;
        }
        Ok(config)
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn socket(mut self, path: impl Into<String>) -> Self {
        self.socket = Some(path.into());
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compression = algorithm;
        self
    }

    pub fn timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = collation.into();
        self
    }

    pub fn disable_capability(mut self, flag: u32) -> Self {
        self.disabled_capabilities |= flag;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn server_pub_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_pub_key_path = Some(path.into());
        self
    }

    /// 콜레이션 ID (알 수 없는 이름이면 에러)
    pub fn collation_id(&self) -> Result<u8> {
        collation_id(&self.collation)
            .ok_or_else(|| BinlogError::ConfigError(format!("Unknown collation '{}'", self.collation)))
    }

    /// 접속 대상 표시용 문자열
    pub fn address(&self) -> String {
        match &self.socket {
            Some(path) => format!("unix:{}", path),
            None => format!("{}:{}", self.hostname, self.port),
        }
    }
}

/// 덤프 도구 옵션
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpOptions {
    pub start_file: Option<String>,
    pub stop_file: Option<String>,
    pub start_position: Option<u64>,
    pub stop_position: Option<u64>,
    /// "YYYY-MM-DD HH:MM:SS"
    pub start_datetime: Option<String>,
    pub stop_datetime: Option<String>,
    /// 쉼표로 구분한 glob 목록
    pub databases: String,
    pub tables: String,
    pub exclude_databases: String,
    pub exclude_tables: String,
    pub flashback: bool,
    pub convert_update_to_write: bool,
    /// `insert,update,delete` 중 일부
    pub rows_event_types: Option<String>,
    pub rows_filter: Option<String>,
    /// `from:to,...`
    pub rewrite_db: Option<String>,
    pub flavor: Flavor,
    pub server_id: u32,
    /// 설정되면 위치 대신 GTID 로 덤프 시작
    pub gtid: Option<String>,
    pub semi_sync: bool,
    pub non_blocking: bool,
    /// 로컬 파일 모드 (비어 있으면 서버에서 스트리밍)
    pub files: Vec<PathBuf>,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    env_string(key)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| BinlogError::ConfigError(format!("Invalid {} '{}'", key, v)))
        })
        .transpose()
}

fn env_flag(key: &str) -> bool {
    env_string(key).is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl DumpOptions {
    /// `BINLOG_START_FILE`, `BINLOG_STOP_FILE`, `BINLOG_START_POSITION`, `BINLOG_STOP_POSITION`,
    /// `BINLOG_START_DATETIME`, `BINLOG_STOP_DATETIME`, `BINLOG_DATABASES`, `BINLOG_TABLES`,
    /// `BINLOG_EXCLUDE_DATABASES`, `BINLOG_EXCLUDE_TABLES`, `BINLOG_FLASHBACK`,
    /// `BINLOG_CONVERT_UPDATE_TO_WRITE`, `BINLOG_ROWS_EVENT_TYPE`, `BINLOG_ROWS_FILTER`,
    /// `BINLOG_REWRITE_DB`, `BINLOG_FLAVOR`, `BINLOG_SERVER_ID`, `BINLOG_GTID`,
    /// `BINLOG_SEMI_SYNC`, `BINLOG_NON_BLOCK`
    pub fn from_env() -> Result<Self> {
        Ok(DumpOptions {
            start_file: env_string("BINLOG_START_FILE"),
            stop_file: env_string("BINLOG_STOP_FILE"),
            start_position: env_parse("BINLOG_START_POSITION")?,
            stop_position: env_parse("BINLOG_STOP_POSITION")?,
            start_datetime: env_string("BINLOG_START_DATETIME"),
            stop_datetime: env_string("BINLOG_STOP_DATETIME"),
            databases: env_string("BINLOG_DATABASES").unwrap_or_default(),
            tables: env_string("BINLOG_TABLES").unwrap_or_default(),
            exclude_databases: env_string("BINLOG_EXCLUDE_DATABASES").unwrap_or_default(),
            exclude_tables: env_string("BINLOG_EXCLUDE_TABLES").unwrap_or_default(),
            flashback: env_flag("BINLOG_FLASHBACK"),
            convert_update_to_write: env_flag("BINLOG_CONVERT_UPDATE_TO_WRITE"),
            rows_event_types: env_string("BINLOG_ROWS_EVENT_TYPE"),
            rows_filter: env_string("BINLOG_ROWS_FILTER"),
            rewrite_db: env_string("BINLOG_REWRITE_DB"),
            flavor: env_parse("BINLOG_FLAVOR")?.unwrap_or_default(),
            server_id: env_parse("BINLOG_SERVER_ID")?.unwrap_or(1001),
            gtid: env_string("BINLOG_GTID"),
            semi_sync: env_flag("BINLOG_SEMI_SYNC"),
            non_blocking: env_flag("BINLOG_NON_BLOCK"),
            files: Vec::new(),
        })
    }

    /// 디코더 옵션으로 변환 (필터 문법 오류는 여기서 드러남)
    pub fn parse_options(&self) -> Result<ParseOptions> {
        let mut options = ParseOptions {
            flashback: self.flashback,
            convert_update_to_write: self.convert_update_to_write,
            ..Default::default()
        };
        let ddl = DdlFilter::from_lists(
            &self.databases,
            &self.tables,
            &self.exclude_databases,
            &self.exclude_tables,
        )?;
        if !ddl.is_empty() {
            options.ddl_filter = Some(ddl);
        }
        if let Some(filter) = &self.rows_filter {
            options.row_filter = Some(RowFilter::parse(filter)?);
        }
        if let Some(kinds) = &self.rows_event_types {
            options = options.with_rows_event_types(kinds)?;
        }
        if let Some(rule) = &self.rewrite_db {
            options = options.with_rewrite_db(rule)?;
        }
        Ok(options)
    }

    pub fn time_filter(&self) -> Result<TimeFilter> {
        let mut filter =
            TimeFilter::from_datetimes(self.start_datetime.as_deref(), self.stop_datetime.as_deref())?;
        filter.start_pos = self.start_position;
        filter.stop_pos = self.stop_position;
        Ok(filter)
    }

    /// 서버 덤프 시작 위치 (파일명이 없으면 에러)
    pub fn start(&self) -> Result<BinlogPosition> {
        let file = self
            .start_file
            .clone()
            .ok_or_else(|| BinlogError::ConfigError("BINLOG_START_FILE is required".to_string()))?;
        Ok(BinlogPosition::new(file, self.start_position.unwrap_or(4)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.collation_id().unwrap(), 45);
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("127.0.0.1", "repl")
            .port(3307)
            .password("pw")
            .database("test")
            .collation("klingon");
        assert_eq!(config.address(), "127.0.0.1:3307");
        assert_eq!(config.database.as_deref(), Some("test"));
        assert!(matches!(config.collation_id(), Err(BinlogError::ConfigError(_))));

        let config = config.socket("/tmp/mysql.sock");
        assert_eq!(config.address(), "unix:/tmp/mysql.sock");
    }

    #[test]
    fn test_dump_options_to_parse_options() {
        let options = DumpOptions {
            databases: "shop*".to_string(),
            rows_event_types: Some("insert, delete".to_string()),
            rewrite_db: Some("shop:shop_copy".to_string()),
            flashback: true,
            start_position: Some(120),
            stop_datetime: Some("2024-01-02 03:04:05".to_string()),
            ..Default::default()
        };
        let parse = options.parse_options().unwrap();
        assert!(parse.flashback);
        assert!(parse.ddl_filter.is_some());
        assert_eq!(parse.rows_event_types.as_ref().map(|k| k.len()), Some(2));
        assert_eq!(parse.rewrite_db.get("shop").map(String::as_str), Some("shop_copy"));

        let filter = options.time_filter().unwrap();
        assert_eq!(filter.start_pos, Some(120));
        assert_eq!(filter.stop_ts, Some(1_704_164_645));
        assert!(options.start().is_err());
    }

    #[test]
    fn test_dump_options_rejects_bad_filter() {
        let options = DumpOptions {
            rows_event_types: Some("upsert".to_string()),
            ..Default::default()
        };
        assert!(options.parse_options().is_err());
    }
}
