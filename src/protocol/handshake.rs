//! 핸드셰이크 및 일반 응답 패킷 (Initial Handshake, Handshake Response, SSLRequest, OK/ERR/EOF)

use crate::error::{BinlogError, Result, ServerError};
use crate::protocol::codec::{put_lenenc_bytes, put_lenenc_int, put_null_terminated, ReadMysqlExt};
use crate::protocol::{capabilities, EOF_HEADER, ERR_HEADER, OK_HEADER};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use std::io::Cursor;

/// 서버 greeting (Protocol::HandshakeV10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// auth plugin data (salt) — 보통 20 bytes
    pub auth_plugin_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() == Some(&ERR_HEADER) {
            return Err(BinlogError::Server(parse_err_packet(data, 0)?));
        }

        let mut cursor = Cursor::new(data);
        let protocol_version = cursor.read_u8()?;
        if protocol_version != 10 {
            return Err(BinlogError::ProtocolError(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }

        let server_version = cursor.read_null_terminated_string()?;
        let connection_id = cursor.read_u32::<LittleEndian>()?;
        let mut auth_plugin_data = cursor.take_bytes(8)?.to_vec();
        // filler
        cursor.read_u8()?;

        let capabilities_lower = cursor.read_u16::<LittleEndian>()?;
        let mut capabilities = capabilities_lower as u32;
        let mut charset = 0;
        let mut status = 0;
        let mut auth_plugin_name = String::new();

        if cursor.remaining() > 0 {
            charset = cursor.read_u8()?;
            status = cursor.read_u16::<LittleEndian>()?;
            let capabilities_upper = cursor.read_u16::<LittleEndian>()?;
            capabilities |= (capabilities_upper as u32) << 16;

            let auth_data_len = cursor.read_u8()?;
            // reserved
            cursor.skip(10)?;

            if capabilities & capabilities::SECURE_CONNECTION != 0 {
                let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
                let part2 = cursor.take_bytes(part2_len.min(cursor.remaining()))?;
                // 마지막 null byte 제외
                let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
                auth_plugin_data.extend_from_slice(part2);
            }

            if capabilities & capabilities::PLUGIN_AUTH != 0 {
                let rest = cursor.rest();
                let name = rest.split(|&b| b == 0).next().unwrap_or_default();
                auth_plugin_name = String::from_utf8_lossy(name).into_owned();
            }
        }

        Ok(InitialHandshake {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data,
            capabilities,
            charset,
            status,
            auth_plugin_name,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.put_u8(10);
        put_null_terminated(&mut buf, self.server_version.as_bytes());
        buf.put_u32_le(self.connection_id);

        let salt = &self.auth_plugin_data;
        let split = salt.len().min(8);
        buf.put_slice(&salt[..split]);
        buf.put_bytes(0, 8 - split);
        buf.put_u8(0);

        buf.put_u16_le(self.capabilities as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.status);
        buf.put_u16_le((self.capabilities >> 16) as u16);
        buf.put_u8((salt.len() + 1) as u8);
        buf.put_bytes(0, 10);

        if self.capabilities & capabilities::SECURE_CONNECTION != 0 {
            let part2 = &salt[split..];
            buf.put_slice(part2);
            // 최소 13 bytes (null 포함)
            buf.put_bytes(0, 13usize.saturating_sub(part2.len()).max(1));
        }
        if self.capabilities & capabilities::PLUGIN_AUTH != 0 {
            put_null_terminated(&mut buf, self.auth_plugin_name.as_bytes());
        }
        buf
    }
}

/// SSLRequest: capability + max packet + charset + 23 zero bytes (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslRequest {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
}

pub const SSL_REQUEST_LEN: usize = 32;

impl SslRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SSL_REQUEST_LEN);
        buf.put_u32_le(self.capabilities | capabilities::SSL);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.put_bytes(0, 23);
        buf
    }
}

/// 클라이언트 Handshake Response 41
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub zstd_level: Option<u8>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut buf = Vec::with_capacity(128);
        buf.put_u32_le(caps);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.put_bytes(0, 23);
        put_null_terminated(&mut buf, self.username.as_bytes());

        if caps & capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_bytes(&mut buf, &self.auth_response);
        } else if caps & capabilities::SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.put_slice(&self.auth_response);
        } else {
            put_null_terminated(&mut buf, &self.auth_response);
        }

        if caps & capabilities::CONNECT_WITH_DB != 0 {
            let db = self.database.as_deref().unwrap_or_default();
            put_null_terminated(&mut buf, db.as_bytes());
        }
        if caps & capabilities::PLUGIN_AUTH != 0 {
            let plugin = self.auth_plugin_name.as_deref().unwrap_or_default();
            put_null_terminated(&mut buf, plugin.as_bytes());
        }
        if caps & capabilities::CONNECT_ATTRS != 0 {
            let mut attrs = Vec::new();
            for (key, value) in &self.attributes {
                put_lenenc_bytes(&mut attrs, key.as_bytes());
                put_lenenc_bytes(&mut attrs, value.as_bytes());
            }
            put_lenenc_int(&mut buf, attrs.len() as u64);
            buf.put_slice(&attrs);
        }
        if caps & capabilities::ZSTD_COMPRESSION_ALGORITHM != 0 {
            buf.put_u8(self.zstd_level.unwrap_or(3));
        }
        buf
    }

    /// 서버 측 파싱. 32 bytes에 SSL 플래그가 있으면 SSLRequest로 간주하여 None
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let mut cursor = Cursor::new(data);
        let caps = cursor.read_u32::<LittleEndian>()?;
        if caps & capabilities::PROTOCOL_41 == 0 {
            return Err(BinlogError::ProtocolError(
                "pre-4.1 handshake response is not supported".to_string(),
            ));
        }
        let max_packet_size = cursor.read_u32::<LittleEndian>()?;
        let charset = cursor.read_u8()?;
        cursor.skip(23)?;
        if data.len() == SSL_REQUEST_LEN && caps & capabilities::SSL != 0 {
            return Ok(None);
        }

        let username = cursor.read_null_terminated_string()?;
        let auth_response = if caps & capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            cursor.read_lenenc_bytes()?.unwrap_or_default().to_vec()
        } else if caps & capabilities::SECURE_CONNECTION != 0 {
            let len = cursor.read_u8()? as usize;
            cursor.take_bytes(len)?.to_vec()
        } else {
            cursor.read_null_terminated()?.to_vec()
        };

        let mut response = HandshakeResponse {
            capabilities: caps,
            max_packet_size,
            charset,
            username,
            auth_response,
            ..Default::default()
        };

        if caps & capabilities::CONNECT_WITH_DB != 0 && cursor.remaining() > 0 {
            let db = cursor.read_null_terminated_string()?;
            if !db.is_empty() {
                response.database = Some(db);
            }
        }
        if caps & capabilities::PLUGIN_AUTH != 0 && cursor.remaining() > 0 {
            response.auth_plugin_name = Some(cursor.read_null_terminated_string()?);
        }
        if caps & capabilities::CONNECT_ATTRS != 0 && cursor.remaining() > 0 {
            let len = cursor.read_lenenc_int()?.unwrap_or(0) as usize;
            let mut attrs = Cursor::new(cursor.take_bytes(len)?);
            while attrs.remaining() > 0 {
                let key = attrs.read_lenenc_string()?;
                let value = attrs.read_lenenc_string()?;
                response.attributes.push((key, value));
            }
        }
        if caps & capabilities::ZSTD_COMPRESSION_ALGORITHM != 0 && cursor.remaining() > 0 {
            response.zstd_level = Some(cursor.read_u8()?);
        }
        Ok(Some(response))
    }
}

/// OK 패킷 (0x00, 또는 DEPRECATE_EOF의 결과셋 종료용 0xFE)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
    pub info: String,
    pub session_state: Vec<u8>,
}

impl OkPacket {
    pub fn parse(data: &[u8], caps: u32) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = cursor.read_u8()?;
        if header != OK_HEADER && header != EOF_HEADER {
            return Err(BinlogError::MalformedPacket(format!(
                "invalid OK packet header 0x{:02x}",
                header
            )));
        }
        let mut ok = OkPacket {
            affected_rows: cursor.read_lenenc_int()?.unwrap_or(0),
            last_insert_id: cursor.read_lenenc_int()?.unwrap_or(0),
            ..Default::default()
        };
        if caps & capabilities::PROTOCOL_41 != 0 {
            ok.status = cursor.read_u16::<LittleEndian>()?;
            ok.warnings = cursor.read_u16::<LittleEndian>()?;
        } else if caps & capabilities::TRANSACTIONS != 0 {
            ok.status = cursor.read_u16::<LittleEndian>()?;
        }

        if caps & capabilities::SESSION_TRACK != 0 {
            if cursor.remaining() > 0 {
                ok.info = cursor.read_lenenc_string()?;
            }
            if ok.status & super::status::SESSION_STATE_CHANGED != 0 && cursor.remaining() > 0 {
                ok.session_state = cursor.read_lenenc_bytes()?.unwrap_or_default().to_vec();
            }
        } else {
            ok.info = String::from_utf8_lossy(cursor.rest()).into_owned();
        }
        Ok(ok)
    }

    /// header: 0x00 (일반 OK) 또는 0xFE (DEPRECATE_EOF 결과셋 종료)
    pub fn encode(&self, header: u8, caps: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.info.len());
        buf.put_u8(header);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        if caps & capabilities::PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status);
            buf.put_u16_le(self.warnings);
        } else if caps & capabilities::TRANSACTIONS != 0 {
            buf.put_u16_le(self.status);
        }
        if caps & capabilities::SESSION_TRACK != 0 {
            if !self.info.is_empty() || self.status & super::status::SESSION_STATE_CHANGED != 0 {
                put_lenenc_bytes(&mut buf, self.info.as_bytes());
            }
            if self.status & super::status::SESSION_STATE_CHANGED != 0 {
                put_lenenc_bytes(&mut buf, &self.session_state);
            }
        } else {
            buf.put_slice(self.info.as_bytes());
        }
        buf
    }
}

/// EOF 패킷 (DEPRECATE_EOF 미사용 시)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: u16,
}

impl EofPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if cursor.read_u8()? != EOF_HEADER {
            return Err(BinlogError::MalformedPacket("invalid EOF packet".to_string()));
        }
        if cursor.remaining() < 4 {
            return Ok(EofPacket::default());
        }
        Ok(EofPacket {
            warnings: cursor.read_u16::<LittleEndian>()?,
            status: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.put_u8(EOF_HEADER);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status);
        buf
    }
}

/// ERR 패킷 파싱
pub fn parse_err_packet(data: &[u8], caps: u32) -> Result<ServerError> {
    let mut cursor = Cursor::new(data);
    if cursor.read_u8()? != ERR_HEADER {
        return Err(BinlogError::MalformedPacket("invalid ERR packet".to_string()));
    }
    let code = cursor.read_u16::<LittleEndian>()?;
    let mut sql_state = "HY000".to_string();
    // 핸드셰이크 이전 ERR에도 '#'가 있으면 sqlstate를 읽음
    let has_marker = data.get(3) == Some(&b'#');
    if (caps & capabilities::PROTOCOL_41 != 0 || caps == 0) && has_marker {
        cursor.skip(1)?;
        sql_state = String::from_utf8_lossy(cursor.take_bytes(5)?).into_owned();
    }
    let message = String::from_utf8_lossy(cursor.rest()).into_owned();
    Ok(ServerError {
        code,
        sql_state,
        message,
    })
}

/// ERR 패킷 생성
pub fn encode_err_packet(err: &ServerError) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + err.message.len());
    buf.put_u8(ERR_HEADER);
    buf.put_u16_le(err.code);
    buf.put_u8(b'#');
    let state = err.sql_state.as_bytes();
    let mut padded = [b'0'; 5];
    let n = state.len().min(5);
    padded[..n].copy_from_slice(&state[..n]);
    buf.put_slice(&padded);
    buf.put_slice(err.message.as_bytes());
    buf
}
