//! MySQL 프로토콜 패킷 채널
//!
//! 패킷 = 3 bytes length + 1 byte sequence + payload.
//! 0xFFFFFF 바이트 페이로드 뒤에는 항상 이어지는 패킷이 붙고, 정확히 0xFFFFFF로
//! 끝나는 페이로드는 길이 0의 패킷으로 종료됩니다.

use crate::bufpool::BufferPool;
use crate::error::{BinlogError, Result};
use crate::protocol::compress::{self, CompressedFramer, CompressionAlgorithm};
use crate::protocol::{Command, MAX_PAYLOAD_LEN, PACKET_HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace};

/// 패킷 채널이 올라갈 수 있는 양방향 스트림 (TCP, unix socket, TLS, 메모리 파이프)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type BoxedStream = BufReader<Box<dyn AsyncStream>>;

/// MySQL 패킷 채널
pub struct PacketChannel {
    stream: Option<BoxedStream>,
    sequence: u8,
    compression: Option<CompressedFramer>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    buffers: BufferPool,
    tls: bool,
}

impl PacketChannel {
    /// 임의의 스트림 위에 채널 생성
    pub fn new(stream: Box<dyn AsyncStream>) -> Self {
        PacketChannel {
            stream: Some(BufReader::new(stream)),
            sequence: 0,
            compression: None,
            read_timeout: None,
            write_timeout: None,
            buffers: BufferPool::default(),
            tls: false,
        }
    }

    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = with_timeout(timeout, TcpStream::connect(&addr))
            .await?
            .map_err(|e| BinlogError::BadConn(format!("Failed to connect to {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(Box::new(stream)))
    }

    /// unix domain socket 연결
    #[cfg(unix)]
    pub async fn connect_unix(path: &str, timeout: Option<Duration>) -> Result<Self> {
        let stream = with_timeout(timeout, tokio::net::UnixStream::connect(path))
            .await?
            .map_err(|e| BinlogError::BadConn(format!("Failed to connect to {}: {}", path, e)))?;

        debug!("Connected to MySQL at unix:{}", path);

        Ok(PacketChannel::new(Box::new(stream)))
    }

    pub fn with_buffer_pool(mut self, buffers: BufferPool) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn set_timeouts(&mut self, read: Option<Duration>, write: Option<Duration>) {
        self.read_timeout = read;
        self.write_timeout = write;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    /// 새 커맨드 시작 시 시퀀스 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        if let Some(framer) = self.compression.as_mut() {
            framer.reset_sequence();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
            .as_ref()
            .map(|c| c.algorithm())
            .unwrap_or_default()
    }

    /// 압축 프로토콜 활성화 (핸드셰이크 완료 직후 호출)
    pub fn enable_compression(&mut self, algorithm: CompressionAlgorithm) {
        if algorithm == CompressionAlgorithm::None {
            self.compression = None;
        } else {
            debug!("Protocol compression enabled: {:?}", algorithm);
            self.compression = Some(CompressedFramer::new(algorithm));
        }
    }

    /// 패킷 읽기 (여러 조각으로 나뉜 페이로드는 하나로 합쳐서 반환)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        self.read_packet_inner(false).await
    }

    /// 빈 페이로드도 허용하는 패킷 읽기 (빈 비밀번호의 auth 응답 등)
    pub async fn read_packet_allow_empty(&mut self) -> Result<Vec<u8>> {
        self.read_packet_inner(true).await
    }

    async fn read_packet_inner(&mut self, allow_empty: bool) -> Result<Vec<u8>> {
        let result = self.read_payload(allow_empty).await;
        if let Err(ref e) = result {
            if e.is_connection_fatal() || matches!(e, BinlogError::UnexpectedEof) {
                self.stream = None;
            }
        }
        result
    }

    async fn read_payload(&mut self, allow_empty: bool) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let mut first = true;
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.read_bytes(&mut header).await.map_err(io_to_bad_conn)?;
            let length = LittleEndian::read_u24(&header[0..3]) as usize;
            let sequence = header[3];

            if sequence != self.sequence {
                return Err(BinlogError::ProtocolError(format!(
                    "invalid packet sequence {} != {}",
                    sequence, self.sequence
                )));
            }
            self.sequence = self.sequence.wrapping_add(1);

            if first && length < 1 && !allow_empty {
                return Err(BinlogError::MalformedPacket(
                    "invalid payload length 0".to_string(),
                ));
            }
            first = false;

            let start = payload.len();
            payload.resize(start + length, 0);
            self.read_bytes(&mut payload[start..]).await.map_err(io_to_bad_conn)?;

            trace!("read packet seq={} len={}", sequence, length);

            if length < MAX_PAYLOAD_LEN {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기 (현재 시퀀스부터 이어서 기록)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = self.buffers.get();
        let mut offset = 0;
        loop {
            let chunk = (data.len() - offset).min(MAX_PAYLOAD_LEN);
            buf.put_uint_le(chunk as u64, 3);
            buf.put_u8(self.sequence);
            buf.put_slice(&data[offset..offset + chunk]);
            self.sequence = self.sequence.wrapping_add(1);
            offset += chunk;
            // 0xFFFFFF 조각 다음에는 반드시 한 조각 더 (빈 패킷일 수 있음)
            if chunk < MAX_PAYLOAD_LEN {
                break;
            }
        }

        let result = match self.compression.as_mut() {
            Some(framer) => {
                let mut framed = self.buffers.get();
                let encoded = framer.encode_frames(&buf, &mut framed);
                let result = match encoded {
                    Ok(()) => self.write_raw(&framed).await,
                    Err(e) => Err(e),
                };
                self.buffers.put(framed);
                result
            }
            None => self.write_raw(&buf).await,
        };
        self.buffers.put(buf);
        result
    }

    /// 시퀀스를 초기화하고 커맨드 패킷 전송
    pub async fn write_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        self.reset_sequence();
        let mut data = Vec::with_capacity(body.len() + 1);
        data.push(command as u8);
        data.extend_from_slice(body);
        self.write_packet(&data).await
    }

    /// TLS 클라이언트 업그레이드 (SSLRequest 전송 직후). 시퀀스는 유지됨
    pub async fn upgrade_client_tls(
        &mut self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let stream = self.take_stream()?;
        let tls = connector
            .connect(server_name, stream.into_inner())
            .await
            .map_err(|e| BinlogError::BadConn(format!("TLS handshake failed: {}", e)))?;
        self.stream = Some(BufReader::new(Box::new(tls)));
        self.tls = true;
        debug!("Connection upgraded to TLS");
        Ok(())
    }

    /// TLS 서버 업그레이드 (SSLRequest 수신 직후)
    pub async fn upgrade_server_tls(&mut self, acceptor: TlsAcceptor) -> Result<()> {
        let stream = self.take_stream()?;
        let tls = acceptor
            .accept(stream.into_inner())
            .await
            .map_err(|e| BinlogError::BadConn(format!("TLS accept failed: {}", e)))?;
        self.stream = Some(BufReader::new(Box::new(tls)));
        self.tls = true;
        Ok(())
    }

    /// 스트림 종료
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn take_stream(&mut self) -> Result<BoxedStream> {
        self.stream
            .take()
            .ok_or_else(|| BinlogError::BadConn("connection is closed".to_string()))
    }

    fn stream_mut(&mut self) -> Result<&mut BoxedStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| BinlogError::BadConn("connection is closed".to_string()))
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.write_timeout;
        let stream = self.stream_mut()?;
        let result = with_timeout(timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stream = None;
                Err(BinlogError::BadConn(format!("Failed to write packet: {}", e)))
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// 스트림에서 정확히 buf 크기만큼 읽기 (압축 시 압축 해제된 바이트 기준)
    async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(framer) = self.compression.as_mut() else {
                return self.read_stream(&mut buf[filled..]).await;
            };
            filled += framer.drain_into(&mut buf[filled..]);
            if filled < buf.len() {
                self.read_compressed_frame().await?;
            }
        }
        Ok(())
    }

    async fn read_compressed_frame(&mut self) -> Result<()> {
        let mut header = [0u8; compress::COMPRESSED_HEADER_SIZE];
        self.read_stream(&mut header).await?;
        let (compressed_len, sequence, uncompressed_len) = compress::parse_frame_header(&header);
        let mut body = vec![0u8; compressed_len];
        self.read_stream(&mut body).await?;
        if let Some(framer) = self.compression.as_mut() {
            framer.accept_frame(sequence, uncompressed_len, &body)?;
        }
        Ok(())
    }

    async fn read_stream(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.read_timeout;
        let stream = self.stream_mut()?;
        with_timeout(timeout, stream.read_exact(buf)).await??;
        Ok(())
    }
}

impl std::fmt::Debug for PacketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketChannel")
            .field("sequence", &self.sequence)
            .field("closed", &self.stream.is_none())
            .field("tls", &self.tls)
            .field("compression", &self.compression())
            .finish()
    }
}

/// 선택적 타임아웃
pub(crate) async fn with_timeout<F: Future>(timeout: Option<Duration>, fut: F) -> Result<F::Output> {
    match timeout {
        Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| BinlogError::Timeout),
        None => Ok(fut.await),
    }
}

fn io_to_bad_conn(err: BinlogError) -> BinlogError {
    match err {
        BinlogError::IoError(msg) => BinlogError::BadConn(msg),
        BinlogError::UnexpectedEof => BinlogError::BadConn("connection closed by peer".to_string()),
        other => other,
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == super::ERR_HEADER
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == super::OK_HEADER
}

/// EOF 패킷 확인 (0xFE, 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == super::EOF_HEADER && data.len() < 9
}
