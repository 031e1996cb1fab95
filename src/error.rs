//! 복제 엔진 에러 타입

use crate::events::EventHeader;
use std::fmt;
use std::io;
use thiserror::Error;

/// 서버가 보낸 ERR 패킷 내용
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        ServerError {
            code,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.sql_state, self.message)
    }
}

/// 이벤트 디코딩 실패 정보 (헤더와 원본 바이트 포함)
#[derive(Debug, Clone)]
pub struct EventError {
    pub header: EventHeader,
    pub message: String,
    pub raw: Vec<u8>,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (type={:?}, log_pos={}, size={})",
            self.message, self.header.event_type, self.header.log_pos, self.header.event_size
        )
    }
}

#[derive(Error, Debug)]
pub enum BinlogError {
    #[error("연결이 끊어졌습니다: {0}")]
    BadConn(String),

    #[error("잘못된 패킷: {0}")]
    MalformedPacket(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("인증 실패: {0}")]
    AuthFailed(String),

    #[error("서버 에러: {0}")]
    Server(ServerError),

    #[error("이벤트 디코딩 에러: {0}")]
    Decode(Box<EventError>),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("입력이 예상보다 일찍 끝났습니다")]
    UnexpectedEof,

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("필터 에러: {0}")]
    FilterError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("작업이 취소되었습니다")]
    Canceled,

    #[error("동기화가 종료되었습니다: {0}")]
    SyncClosed(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl BinlogError {
    /// 연결을 더 이상 사용할 수 없게 만드는 에러인지 여부
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            BinlogError::BadConn(_)
                | BinlogError::MalformedPacket(_)
                | BinlogError::ProtocolError(_)
                | BinlogError::AuthFailed(_)
                | BinlogError::IoError(_)
                | BinlogError::Timeout
                | BinlogError::Canceled
        )
    }

    /// 서버 에러 코드 (서버 에러인 경우)
    pub fn server_code(&self) -> Option<u16> {
        match self {
            BinlogError::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<io::Error> for BinlogError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => BinlogError::UnexpectedEof,
            io::ErrorKind::TimedOut => BinlogError::Timeout,
            _ => BinlogError::IoError(err.to_string()),
        }
    }
}

impl From<ServerError> for BinlogError {
    fn from(err: ServerError) -> Self {
        BinlogError::Server(err)
    }
}

impl From<EventError> for BinlogError {
    fn from(err: EventError) -> Self {
        BinlogError::Decode(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, BinlogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_eof_maps_to_unexpected_eof() {
        let err: BinlogError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, BinlogError::UnexpectedEof));
    }

    #[test]
    fn test_server_error_display() {
        let err = BinlogError::from(ServerError {
            code: 1045,
            sql_state: "28000".to_string(),
            message: "Access denied".to_string(),
        });
        assert_eq!(err.server_code(), Some(1045));
        assert!(err.to_string().contains("28000"));
        assert!(!err.is_connection_fatal());
    }
}
