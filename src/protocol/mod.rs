//! MySQL 클라이언트/서버 프로토콜
//!
//! 패킷 프레이밍, 압축, TLS 업그레이드, 핸드셰이크 패킷과 공통 상수

pub mod codec;
pub mod compress;
pub mod handshake;
pub mod packet;
pub mod tls;

pub use codec::ReadMysqlExt;
pub use handshake::{EofPacket, HandshakeResponse, InitialHandshake, OkPacket, SslRequest};
pub use packet::{AsyncStream, PacketChannel};

/// 패킷 헤더 크기 (3 bytes length + 1 byte sequence)
pub const PACKET_HEADER_SIZE: usize = 4;

/// 한 패킷에 담을 수 있는 최대 페이로드
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// 응답 패킷 첫 바이트
pub const OK_HEADER: u8 = 0x00;
pub const MORE_DATA_HEADER: u8 = 0x01;
pub const LOCAL_INFILE_HEADER: u8 = 0xFB;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;

/// 기본 max_allowed_packet
pub const DEFAULT_MAX_ALLOWED_PACKET: u32 = 16 * 1024 * 1024;

/// 서버가 허용하는 max_allowed_packet 의 최댓값 (1 GiB). 이벤트 하나도 이보다 클 수 없음
pub const MAX_ALLOWED_PACKET_LIMIT: u32 = 1024 * 1024 * 1024;

/// Capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 1 << 1;
    pub const LONG_FLAG: u32 = 1 << 2;
    pub const CONNECT_WITH_DB: u32 = 1 << 3;
    pub const NO_SCHEMA: u32 = 1 << 4;
    pub const COMPRESS: u32 = 1 << 5;
    pub const ODBC: u32 = 1 << 6;
    pub const LOCAL_FILES: u32 = 1 << 7;
    pub const IGNORE_SPACE: u32 = 1 << 8;
    pub const PROTOCOL_41: u32 = 1 << 9;
    pub const INTERACTIVE: u32 = 1 << 10;
    pub const SSL: u32 = 1 << 11;
    pub const IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const TRANSACTIONS: u32 = 1 << 13;
    pub const RESERVED: u32 = 1 << 14;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const SESSION_TRACK: u32 = 1 << 23;
    pub const DEPRECATE_EOF: u32 = 1 << 24;
    pub const OPTIONAL_RESULTSET_METADATA: u32 = 1 << 25;
    pub const ZSTD_COMPRESSION_ALGORITHM: u32 = 1 << 26;
    pub const QUERY_ATTRIBUTES: u32 = 1 << 27;

    /// 클라이언트가 기본으로 요청하는 capability
    pub const CLIENT_DEFAULT: u32 = LONG_PASSWORD
        | LONG_FLAG
        | PROTOCOL_41
        | TRANSACTIONS
        | SECURE_CONNECTION
        | MULTI_STATEMENTS
        | MULTI_RESULTS
        | PS_MULTI_RESULTS
        | PLUGIN_AUTH
        | PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CONNECT_ATTRS
        | DEPRECATE_EOF
        | QUERY_ATTRIBUTES;

    /// 테스트 서버가 광고하는 capability
    pub const SERVER_DEFAULT: u32 = CLIENT_DEFAULT
        | CONNECT_WITH_DB
        | FOUND_ROWS
        | COMPRESS
        | ZSTD_COMPRESSION_ALGORITHM
        | SESSION_TRACK;
}

/// Server status flags
pub mod status {
    pub const IN_TRANS: u16 = 0x0001;
    pub const AUTOCOMMIT: u16 = 0x0002;
    pub const MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const NO_INDEX_USED: u16 = 0x0020;
    pub const CURSOR_EXISTS: u16 = 0x0040;
    pub const LAST_ROW_SENT: u16 = 0x0080;
    pub const DB_DROPPED: u16 = 0x0100;
    pub const NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const METADATA_CHANGED: u16 = 0x0400;
    pub const QUERY_WAS_SLOW: u16 = 0x0800;
    pub const PS_OUT_PARAMS: u16 = 0x1000;
    pub const IN_TRANS_READONLY: u16 = 0x2000;
    pub const SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// 커맨드 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    Ping = 0x0e,
    BinlogDump = 0x12,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    ResetConnection = 0x1f,
    BinlogDumpGtid = 0x1e,
}

impl Command {
    pub fn from_u8(val: u8) -> Option<Self> {
        let cmd = match val {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x0e => Command::Ping,
            0x12 => Command::BinlogDump,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => return None,
        };
        Some(cmd)
    }
}

/// 문자셋/콜레이션 이름 → 콜레이션 ID
pub fn collation_id(name: &str) -> Option<u8> {
    let id = match name.to_ascii_lowercase().as_str() {
        "big5" | "big5_chinese_ci" => 1,
        "latin1" | "latin1_swedish_ci" => 8,
        "ascii" | "ascii_general_ci" => 11,
        "gbk" | "gbk_chinese_ci" => 28,
        "utf8" | "utf8mb3" | "utf8_general_ci" | "utf8mb3_general_ci" => 33,
        "utf8mb4" | "utf8mb4_general_ci" => 45,
        "utf8mb4_bin" => 46,
        "latin1_bin" => 47,
        "binary" => 63,
        "utf8_bin" | "utf8mb3_bin" => 83,
        "utf8_unicode_ci" | "utf8mb3_unicode_ci" => 192,
        "utf8mb4_unicode_ci" => 224,
        "utf8mb4_0900_ai_ci" => 255,
        _ => return None,
    };
    Some(id)
}

/// 콜레이션 ID → 문자셋 이름
pub fn charset_of_collation(id: u8) -> &'static str {
    match id {
        1 => "big5",
        8 | 47 => "latin1",
        11 => "ascii",
        28 => "gbk",
        33 | 83 | 192 => "utf8",
        63 => "binary",
        _ => "utf8mb4",
    }
}
