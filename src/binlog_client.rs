//! MySQL Binlog 복제 클라이언트
//!
//! 슬레이브로 등록한 뒤 COM_BINLOG_DUMP / COM_BINLOG_DUMP_GTID 로 이벤트를 받아
//! 디코딩하고 bounded 채널로 넘깁니다. 덤프가 시작되면 연결은 백그라운드 태스크가
//! 소유합니다. 취소되거나 연결이 끊기면 스트림은 `SyncClosed` 로 끝나며,
//! 자동 재접속은 하지 않습니다.

use crate::binlog::{BinlogParser, ParseOptions};
use crate::config::ConnectionConfig;
use crate::connection::{ConnState, Connection};
use crate::error::{BinlogError, Result};
use crate::events::{BinlogEvent, EventData, EventHeader};
use crate::gtid::{Flavor, GtidSet};
use crate::offset::{BinlogPosition, SourceInfo};
use crate::protocol::handshake::parse_err_packet;
use crate::protocol::{Command, EOF_HEADER, ERR_HEADER, OK_HEADER};
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::RwLock;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// COM_BINLOG_DUMP(_GTID) flags
pub mod dump_flags {
    /// 더 보낼 이벤트가 없으면 EOF 를 보냄
    pub const NON_BLOCK: u16 = 0x01;
    pub const THROUGH_POSITION: u16 = 0x02;
    pub const THROUGH_GTID: u16 = 0x04;
}

const SEMI_SYNC_INDICATOR: u8 = 0xEF;
const SEMI_SYNC_ACK_REQUIRED: u8 = 0x01;

/// MariaDB: GTID 를 이해하는 슬레이브
const MARIADB_SLAVE_CAPABILITY_GTID: u8 = 4;

/// 복제 설정
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// 이 슬레이브의 server id (마스터와 다른 슬레이브와 겹치면 안 됨)
    pub server_id: u32,
    pub flavor: Flavor,
    pub connection: ConnectionConfig,
    /// COM_REGISTER_SLAVE 로 알리는 주소
    pub report_host: String,
    pub report_port: u16,
    pub heartbeat_period: Option<Duration>,
    /// 덤프 중 패킷 하나를 기다리는 최대 시간
    pub read_timeout: Option<Duration>,
    pub semi_sync: bool,
    /// 끝까지 읽으면 서버가 EOF 를 보내게 함
    pub non_blocking: bool,
    /// non-blocking 모드에서 EOF 를 받은 뒤 다시 읽기까지 대기
    pub eof_retry_interval: Duration,
    pub channel_capacity: usize,
    pub parse_options: ParseOptions,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        SyncerConfig {
            server_id: 1001,
            flavor: Flavor::Mysql,
            connection: ConnectionConfig::default(),
            report_host: String::new(),
            report_port: 0,
            heartbeat_period: Some(Duration::from_secs(30)),
            read_timeout: None,
            semi_sync: false,
            non_blocking: false,
            eof_retry_interval: Duration::from_secs(1),
            channel_capacity: 1024,
            parse_options: ParseOptions::default(),
        }
    }
}

impl SyncerConfig {
    pub fn new(server_id: u32, connection: ConnectionConfig) -> Self {
        SyncerConfig {
            server_id,
            connection,
            ..Default::default()
        }
    }
}

/// 스트리머 태스크와 공유하는 진행 상태
#[derive(Debug)]
struct SyncState {
    info: SourceInfo,
    executed: Option<GtidSet>,
    /// 커밋을 기다리는 트랜잭션의 GTID
    pending_gtid: Option<String>,
    last_seen: Instant,
}

impl SyncState {
    fn new(server_id: u32) -> Self {
        SyncState {
            info: SourceInfo::new(server_id, ""),
            executed: None,
            pending_gtid: None,
            last_seen: Instant::now(),
        }
    }

    fn observe(&mut self, event: &BinlogEvent) {
        self.last_seen = Instant::now();
        self.info.update(event);
        match &event.data {
            EventData::Gtid(gtid) => self.pending_gtid = Some(gtid.gtid()),
            EventData::MariadbGtid(gtid) => self.pending_gtid = Some(gtid.gtid.to_string()),
            EventData::Xid(_) => self.commit_gtid(),
            EventData::Query(query) if !query.query.eq_ignore_ascii_case("BEGIN") => self.commit_gtid(),
            EventData::TransactionPayload(payload) => {
                let commits = payload.events.iter().any(|inner| match &inner.data {
                    EventData::Xid(_) => true,
                    EventData::Query(query) => !query.query.eq_ignore_ascii_case("BEGIN"),
                    _ => false,
                });
                if commits {
                    self.commit_gtid();
                }
            }
            _ => {}
        }
    }

    /// 디코딩하지 못한 이벤트: 위치만 앞으로
    fn skip(&mut self, header: &EventHeader) {
        self.last_seen = Instant::now();
        if header.log_pos != 0 {
            self.info.binlog_position = u64::from(header.log_pos);
        }
    }

    fn commit_gtid(&mut self) {
        let Some(gtid) = self.pending_gtid.take() else {
            return;
        };
        if let Some(set) = self.executed.as_mut() {
            if let Err(e) = set.update(&gtid) {
                warn!("Failed to advance executed GTID set with {}: {}", gtid, e);
            }
        }
    }
}

/// 슬레이브 세션. 덤프를 시작하면 [`BinlogStreamer`] 를 돌려줌
pub struct BinlogSyncer {
    config: SyncerConfig,
    conn: Option<Connection>,
    state: Arc<RwLock<SyncState>>,
    cancel: CancellationToken,
    registered: bool,
    semi_sync_enabled: bool,
}

impl BinlogSyncer {
    /// 연결은 첫 명령에서 맺음
    pub fn new(config: SyncerConfig) -> Self {
        let state = SyncState::new(0);
        BinlogSyncer {
            config,
            conn: None,
            state: Arc::new(RwLock::new(state)),
            cancel: CancellationToken::new(),
            registered: false,
            semi_sync_enabled: false,
        }
    }

    /// 이미 인증된 연결로 시작
    pub fn with_connection(config: SyncerConfig, conn: Connection) -> Self {
        let mut syncer = Self::new(config);
        syncer.conn = Some(conn);
        syncer
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    async fn connection(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            if self.registered {
                return Err(BinlogError::ProtocolError("binlog sync already started".to_string()));
            }
            let conn = Connection::connect(self.config.connection.clone()).await?;
            info!(
                "Connected to {} (connection_id={})",
                conn.server_version(),
                conn.connection_id()
            );
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| BinlogError::BadConn("no connection".to_string()))
    }

    /// 세션 변수 설정 후 COM_REGISTER_SLAVE
    pub async fn register_slave(&mut self) -> Result<()> {
        let config = self.config.clone();
        let conn = self.connection().await?;

        if let Some(period) = config.heartbeat_period {
            let sql = format!("SET @master_heartbeat_period={}", period.as_nanos());
            conn.execute(&sql).await?;
        }
        if let Err(e) = conn.execute("SET @master_binlog_checksum=@@global.binlog_checksum").await {
            // 5.6 이전 서버에는 체크섬이 없음
            debug!("Binlog checksum negotiation failed: {}", e);
        }
        if config.flavor == Flavor::Mariadb {
            let sql = format!("SET @mariadb_slave_capability={}", MARIADB_SLAVE_CAPABILITY_GTID);
            conn.execute(&sql).await?;
        }
        let mut semi_sync = false;
        if config.semi_sync {
            match conn.execute("SET @rpl_semi_sync_slave=1").await {
                Ok(_) => semi_sync = true,
                Err(e) => warn!("Semi-sync replication is not available: {}", e),
            }
        }

        let body = Self::create_register_slave_command(&config)?;
        conn.send_command(Command::RegisterSlave, &body).await?;
        conn.read_ok().await?;
        info!("Registered as slave with server_id={}", config.server_id);

        self.semi_sync_enabled = semi_sync;
        self.registered = true;
        Ok(())
    }

    async fn ensure_registered(&mut self) -> Result<()> {
        if !self.registered {
            self.register_slave().await?;
        }
        Ok(())
    }

    fn dump_flags(&self) -> u16 {
        if self.config.non_blocking {
            dump_flags::NON_BLOCK
        } else {
            0
        }
    }

    /// 파일 + 위치에서 덤프 시작
    pub async fn start_sync(&mut self, position: BinlogPosition) -> Result<BinlogStreamer> {
        self.ensure_registered().await?;
        let body = Self::create_binlog_dump_command(
            self.config.server_id,
            &position.filename,
            position.position,
            self.dump_flags(),
        )?;
        {
            let mut state = self.state.write();
            state.info = SourceInfo::from_position(position.server_id, &position);
        }

        let conn = self.connection().await?;
        conn.send_command(Command::BinlogDump, &body).await?;
        info!(
            "Sent COM_BINLOG_DUMP: file={}, position={}",
            position.filename, position.position
        );
        self.spawn_streamer()
    }

    /// GTID 집합 이후부터 덤프 시작
    pub async fn start_sync_gtid(&mut self, gtid_set: GtidSet) -> Result<BinlogStreamer> {
        if gtid_set.flavor() != self.config.flavor {
            return Err(BinlogError::ConfigError(format!(
                "GTID set flavor {:?} does not match server flavor {:?}",
                gtid_set.flavor(),
                self.config.flavor
            )));
        }
        self.ensure_registered().await?;
        let server_id = self.config.server_id;
        let flags = self.dump_flags();
        self.state.write().executed = Some(gtid_set.clone());

        let conn = self.connection().await?;
        match &gtid_set {
            GtidSet::Mysql(set) => {
                let body = Self::create_binlog_dump_gtid_command(
                    server_id,
                    flags | dump_flags::THROUGH_GTID,
                    "",
                    4,
                    &set.encode(),
                )?;
                conn.send_command(Command::BinlogDumpGtid, &body).await?;
            }
            GtidSet::Mariadb(set) => {
                conn.execute(&format!("SET @slave_connect_state='{}'", set)).await?;
                conn.execute("SET @slave_gtid_strict_mode=1").await?;
                conn.execute("SET @slave_gtid_ignore_duplicates=0").await?;
                let body = Self::create_binlog_dump_command(server_id, "", 4, flags)?;
                conn.send_command(Command::BinlogDump, &body).await?;
            }
        }
        info!("Sent binlog dump from GTID set {}", gtid_set);
        self.spawn_streamer()
    }

    fn spawn_streamer(&mut self) -> Result<BinlogStreamer> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| BinlogError::BadConn("no connection".to_string()))?;
        let parser = BinlogParser::new(self.config.parse_options.clone())?;
        conn.set_state(ConnState::Streaming);
        conn.channel_mut()
            .set_timeouts(self.config.read_timeout, self.config.connection.write_timeout);

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let task = StreamTask {
            conn,
            parser,
            tx,
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            semi_sync: self.semi_sync_enabled,
            non_blocking: self.config.non_blocking,
            eof_retry_interval: self.config.eof_retry_interval,
        };
        tokio::spawn(task.run());

        Ok(BinlogStreamer {
            rx,
            cancel: self.cancel.clone(),
        })
    }

    /// 마지막으로 받은 이벤트 다음 위치
    pub fn position(&self) -> BinlogPosition {
        self.state.read().info.position()
    }

    pub fn source_info(&self) -> SourceInfo {
        self.state.read().info.clone()
    }

    /// GTID 로 시작한 경우 지금까지 커밋된 집합
    pub fn executed_gtid_set(&self) -> Option<GtidSet> {
        self.state.read().executed.clone()
    }

    /// 마지막 이벤트 또는 heartbeat 를 받은 시각
    pub fn last_seen(&self) -> Instant {
        self.state.read().last_seen
    }

    /// 스트림 중단. 대기 중인 `next()` 는 곧바로 `SyncClosed` 를 받음
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn quit(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(conn) = self.conn.as_mut() {
            conn.quit().await?;
        }
        Ok(())
    }

    /// COM_REGISTER_SLAVE 본문 생성 (커맨드 바이트 제외)
    fn create_register_slave_command(config: &SyncerConfig) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.write_u32::<LittleEndian>(config.server_id)?;
        for field in [
            config.report_host.as_str(),
            config.connection.username.as_str(),
            config.connection.password.as_str(),
        ] {
            let bytes = &field.as_bytes()[..field.len().min(u8::MAX as usize)];
            buffer.write_u8(bytes.len() as u8)?;
            buffer.write_all(bytes)?;
        }
        buffer.write_u16::<LittleEndian>(config.report_port)?;
        // replication rank (무시됨)
        buffer.write_u32::<LittleEndian>(0)?;
        // master id (0 = 이 연결의 서버)
        buffer.write_u32::<LittleEndian>(0)?;
        Ok(buffer)
    }

    /// COM_BINLOG_DUMP 본문 생성 (커맨드 바이트 제외)
    fn create_binlog_dump_command(
        server_id: u32,
        binlog_filename: &str,
        binlog_position: u64,
        flags: u16,
    ) -> Result<Vec<u8>> {
        let position = u32::try_from(binlog_position).map_err(|_| {
            BinlogError::ConfigError(format!(
                "binlog position {} does not fit COM_BINLOG_DUMP",
                binlog_position
            ))
        })?;
        let mut buffer = Vec::with_capacity(10 + binlog_filename.len());

        buffer.write_u32::<LittleEndian>(position)?;
        buffer.write_u16::<LittleEndian>(flags)?;
        buffer.write_u32::<LittleEndian>(server_id)?;
        buffer.write_all(binlog_filename.as_bytes())?;

        debug!(
            "Created COM_BINLOG_DUMP command: server_id={}, file={}, position={}",
            server_id, binlog_filename, binlog_position
        );
        Ok(buffer)
    }

    /// COM_BINLOG_DUMP_GTID 본문 생성 (커맨드 바이트 제외)
    fn create_binlog_dump_gtid_command(
        server_id: u32,
        flags: u16,
        binlog_filename: &str,
        binlog_position: u64,
        gtid_data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(22 + binlog_filename.len() + gtid_data.len());

        buffer.write_u16::<LittleEndian>(flags)?;
        buffer.write_u32::<LittleEndian>(server_id)?;
        buffer.write_u32::<LittleEndian>(binlog_filename.len() as u32)?;
        buffer.write_all(binlog_filename.as_bytes())?;
        buffer.write_u64::<LittleEndian>(binlog_position)?;
        if flags & dump_flags::THROUGH_GTID != 0 {
            buffer.write_u32::<LittleEndian>(gtid_data.len() as u32)?;
            buffer.write_all(gtid_data)?;
        }
        Ok(buffer)
    }
}

/// semi-sync ACK 패킷: {0xEF, position u64, filename}
fn create_semi_sync_ack(binlog_filename: &str, binlog_position: u64) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(9 + binlog_filename.len());
    buffer.write_u8(SEMI_SYNC_INDICATOR)?;
    buffer.write_u64::<LittleEndian>(binlog_position)?;
    buffer.write_all(binlog_filename.as_bytes())?;
    Ok(buffer)
}

/// 연결을 소유하고 이벤트를 채널로 보내는 백그라운드 태스크
struct StreamTask {
    conn: Connection,
    parser: BinlogParser,
    tx: mpsc::Sender<Result<BinlogEvent>>,
    state: Arc<RwLock<SyncState>>,
    cancel: CancellationToken,
    semi_sync: bool,
    non_blocking: bool,
    eof_retry_interval: Duration,
}

impl StreamTask {
    async fn run(mut self) {
        info!("Binlog event streaming started");
        let err = match self.stream_loop().await {
            Ok(()) => BinlogError::SyncClosed("binlog stream canceled".to_string()),
            Err(e @ BinlogError::SyncClosed(_)) => {
                info!("Binlog streaming ended: {}", e);
                e
            }
            Err(e) => {
                error!("Binlog streaming error: {}", e);
                BinlogError::SyncClosed(e.to_string())
            }
        };
        // 에러는 한 번만 전달. 채널이 가득 찼으면 수신 측이 닫힌 채널로 알게 됨
        let _ = self.tx.try_send(Err(err));
        self.conn.close().await;
        info!(
            "Binlog streaming ended. Total events received: {}",
            self.state.read().info.events
        );
    }

    async fn stream_loop(&mut self) -> Result<()> {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                packet = self.conn.channel_mut().read_packet() => packet?,
            };

            match packet[0] {
                OK_HEADER => {}
                ERR_HEADER => {
                    let message = match parse_err_packet(&packet, self.conn.capabilities()) {
                        Ok(err) => err.to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(BinlogError::SyncClosed(message));
                }
                EOF_HEADER if packet.len() < 9 => {
                    if !self.non_blocking {
                        return Err(BinlogError::SyncClosed("server ended binlog stream".to_string()));
                    }
                    debug!("Received EOF packet, retrying in {:?}", self.eof_retry_interval);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.eof_retry_interval) => continue,
                    }
                }
                other => {
                    return Err(BinlogError::MalformedPacket(format!(
                        "unexpected binlog packet header 0x{:02x}",
                        other
                    )))
                }
            }

            let mut data = &packet[1..];
            let mut need_ack = false;
            if self.semi_sync && data.first() == Some(&SEMI_SYNC_INDICATOR) {
                if data.len() < 2 {
                    return Err(BinlogError::MalformedPacket("truncated semi-sync header".to_string()));
                }
                need_ack = data[1] == SEMI_SYNC_ACK_REQUIRED;
                data = &data[2..];
            }

            let event = match self.parser.parse_event(data) {
                Ok(event) => event,
                Err(BinlogError::Decode(e)) => {
                    // 다음 이벤트 경계에서 계속
                    warn!("Skipping undecodable event: {}", e);
                    self.state.write().skip(&e.header);
                    if need_ack {
                        self.send_semi_sync_ack().await?;
                    }
                    if !self.forward(Err(BinlogError::Decode(e))).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.state.write().observe(&event);
            if need_ack {
                self.send_semi_sync_ack().await?;
            }

            match &event.data {
                EventData::Heartbeat(heartbeat) => {
                    trace!("Heartbeat: {} {:?}", heartbeat.log_ident, heartbeat.position);
                    continue;
                }
                EventData::Rotate(rotate) => {
                    info!("Rotate to {}:{}", rotate.next_log_name, rotate.position);
                }
                _ => {}
            }

            if !self.forward(Ok(event)).await {
                return Ok(());
            }
        }
    }

    /// 수신 측으로 전달. 취소됐거나 수신 측이 없으면 false
    async fn forward(&mut self, item: Result<BinlogEvent>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => {
                if sent.is_err() {
                    debug!("Binlog receiver dropped");
                }
                sent.is_ok()
            }
        }
    }

    async fn send_semi_sync_ack(&mut self) -> Result<()> {
        let (filename, position) = {
            let state = self.state.read();
            (state.info.binlog_filename.clone(), state.info.binlog_position)
        };
        let packet = create_semi_sync_ack(&filename, position)?;
        let channel = self.conn.channel_mut();
        channel.reset_sequence();
        channel.write_packet(&packet).await?;
        trace!("Sent semi-sync ACK: {}:{}", filename, position);
        Ok(())
    }
}

/// 순서대로 이벤트를 돌려주는 수신 측. drop 하면 스트림이 취소됨
pub struct BinlogStreamer {
    rx: mpsc::Receiver<Result<BinlogEvent>>,
    cancel: CancellationToken,
}

impl BinlogStreamer {
    /// 다음 이벤트. 스트림이 끝나면 계속 `SyncClosed`
    pub async fn next(&mut self) -> Result<BinlogEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(BinlogError::SyncClosed("binlog stream canceled".to_string()))
            }
            item = self.rx.recv() => match item {
                Some(result) => result,
                None => Err(BinlogError::SyncClosed("binlog stream closed".to_string())),
            },
        }
    }

    /// 제한 시간 안에 이벤트가 없으면 `Timeout` (스트림은 계속됨)
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<BinlogEvent> {
        tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| BinlogError::Timeout)?
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BinlogStreamer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHeader, EventType, GtidEvent, QueryEvent, XidEvent};
    use crate::gtid::MysqlGtidSet;
    use uuid::Uuid;

    #[test]
    fn test_create_binlog_dump_command() {
        let cmd = BinlogSyncer::create_binlog_dump_command(1, "mysql-bin.000001", 4, 0).unwrap();

        // position (4) + flags (2) + server_id (4) + filename
        assert_eq!(cmd.len(), 10 + "mysql-bin.000001".len());
        assert_eq!(&cmd[..4], &[4, 0, 0, 0]);
        assert_eq!(&cmd[6..10], &[1, 0, 0, 0]);
        assert_eq!(&cmd[10..], b"mysql-bin.000001");

        assert!(BinlogSyncer::create_binlog_dump_command(1, "f", u64::from(u32::MAX) + 1, 0).is_err());
    }

    #[test]
    fn test_create_binlog_dump_gtid_command() {
        let set = MysqlGtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5").unwrap();
        let data = set.encode();
        let cmd =
            BinlogSyncer::create_binlog_dump_gtid_command(7, dump_flags::THROUGH_GTID, "", 4, &data).unwrap();

        assert_eq!(&cmd[..2], &[0x04, 0x00]);
        assert_eq!(&cmd[2..6], &[7, 0, 0, 0]);
        assert_eq!(&cmd[6..10], &[0, 0, 0, 0]);
        assert_eq!(&cmd[10..18], &[4, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&cmd[18..22], &(data.len() as u32).to_le_bytes());
        assert_eq!(&cmd[22..], &data[..]);
    }

    #[test]
    fn test_create_register_slave_command() {
        let mut config = SyncerConfig::new(42, ConnectionConfig::new("db", "repl"));
        config.report_host = "replica-1".to_string();
        config.report_port = 3307;
        let cmd = BinlogSyncer::create_register_slave_command(&config).unwrap();

        assert_eq!(&cmd[..4], &[42, 0, 0, 0]);
        assert_eq!(cmd[4] as usize, "replica-1".len());
        assert_eq!(&cmd[5..14], b"replica-1");
        assert_eq!(cmd[14], 4);
        assert_eq!(&cmd[15..19], b"repl");
        // 빈 비밀번호
        assert_eq!(cmd[19], 0);
        assert_eq!(&cmd[20..22], &3307u16.to_le_bytes());
        assert_eq!(cmd.len(), 30);
    }

    #[test]
    fn test_semi_sync_ack() {
        let ack = create_semi_sync_ack("mysql-bin.000002", 1234).unwrap();
        assert_eq!(ack[0], 0xEF);
        assert_eq!(&ack[1..9], &1234u64.to_le_bytes());
        assert_eq!(&ack[9..], b"mysql-bin.000002");
    }

    fn event(event_type: EventType, log_pos: u32, data: EventData) -> BinlogEvent {
        BinlogEvent {
            header: EventHeader {
                timestamp: 1,
                event_type,
                server_id: 1,
                event_size: 19,
                log_pos,
                flags: 0,
            },
            data,
            raw: Vec::new(),
        }
    }

    fn query(sql: &str) -> EventData {
        EventData::Query(QueryEvent {
            slave_proxy_id: 1,
            exec_time: 0,
            error_code: 0,
            status_vars: Vec::new(),
            schema: "shop".to_string(),
            query: sql.to_string(),
            matched: true,
        })
    }

    #[test]
    fn test_gtid_advances_on_commit() {
        let sid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let mut state = SyncState::new(1);
        state.executed = Some(GtidSet::parse(Flavor::Mysql, "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5").unwrap());

        let gtid = GtidEvent {
            commit_flag: true,
            sid,
            gno: 6,
            ..Default::default()
        };
        state.observe(&event(EventType::Gtid, 200, EventData::Gtid(gtid)));
        state.observe(&event(EventType::Query, 300, query("BEGIN")));
        // 아직 커밋 전
        assert_eq!(
            state.executed.as_ref().unwrap().to_string(),
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5"
        );
        state.observe(&event(EventType::Xid, 400, EventData::Xid(XidEvent { xid: 1 })));
        assert_eq!(
            state.executed.as_ref().unwrap().to_string(),
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-6"
        );
        assert_eq!(state.info.binlog_position, 400);
        assert_eq!(state.info.gtid.as_deref(), Some("3e11fa47-71ca-11e1-9e33-c80aa9429562:6"));
    }

    #[tokio::test]
    async fn test_streamer_close_unblocks_next() {
        let (tx, rx) = mpsc::channel(4);
        let mut streamer = BinlogStreamer {
            rx,
            cancel: CancellationToken::new(),
        };
        let token = streamer.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = streamer.next().await.unwrap_err();
        assert!(matches!(err, BinlogError::SyncClosed(_)));
        drop(tx);
    }

    #[tokio::test]
    async fn test_streamer_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(4);
        let mut streamer = BinlogStreamer {
            rx,
            cancel: CancellationToken::new(),
        };
        tx.send(Ok(event(EventType::Stop, 0, EventData::Stop))).await.unwrap();
        drop(tx);
        assert_eq!(streamer.next().await.unwrap().data, EventData::Stop);
        assert!(matches!(streamer.next().await, Err(BinlogError::SyncClosed(_))));
        assert!(matches!(
            streamer.next_timeout(Duration::from_millis(5)).await,
            Err(BinlogError::SyncClosed(_))
        ));
    }
}
