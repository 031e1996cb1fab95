//! 연결 풀
//!
//! 유휴 연결 FIFO와 카운터를 mutex 하나로 보호합니다. 풀이 가득 차면
//! `get`은 반환되는 연결을 기다립니다.

use super::{ConnState, Connection};
use crate::config::ConnectionConfig;
use crate::error::{BinlogError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 새 연결을 만드는 방법
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection>;
}

#[async_trait]
impl Connector for ConnectionConfig {
    async fn connect(&self) -> Result<Connection> {
        Connection::connect(self.clone()).await
    }
}

/// 풀 설정
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_open: usize,
    /// 이 시간 이상 쉬고 있던 연결은 폐기
    pub max_idle_time: Option<Duration>,
    /// 생성 후 이 시간이 지난 연결은 폐기
    pub max_lifetime: Option<Duration>,
    /// `get` 대기 한도
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_idle: 0,
            max_open: 10,
            max_idle_time: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(3600)),
            acquire_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// 풀 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 열려 있는 연결 수 (유휴 + 사용 중 + 생성 중)
    pub total: usize,
    /// 유휴 연결 수
    pub available: usize,
    /// 지금까지 생성에 성공한 연결 수
    pub ready_count: u64,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    ready_count: u64,
    closed: bool,
}

struct PoolInner {
    connector: Box<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
}

/// 연결 풀 핸들 (clone 가능)
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: ConnectionConfig, pool_config: PoolConfig) -> Self {
        Self::with_connector(config, pool_config)
    }

    pub fn with_connector(connector: impl Connector, config: PoolConfig) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                connector: Box::new(connector),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    ready_count: 0,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total: state.total,
            available: state.idle.len(),
            ready_count: state.ready_count,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// 만료된 연결인지
    fn is_expired(&self, conn: &Connection, now: Instant) -> bool {
        let config = &self.inner.config;
        if let Some(lifetime) = config.max_lifetime {
            if now.duration_since(conn.created_at()) >= lifetime {
                return true;
            }
        }
        if let Some(idle) = config.max_idle_time {
            if now.duration_since(conn.last_used()) >= idle {
                return true;
            }
        }
        false
    }

    /// 연결 하나 가져오기. 풀이 가득 차 있으면 반환될 때까지 대기
    pub async fn get(&self) -> Result<PooledConnection> {
        let deadline = self.inner.config.acquire_timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.inner.notify.notified();
            let reserved = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(BinlogError::BadConn("pool is closed".to_string()));
                }
                let now = Instant::now();
                while let Some(conn) = state.idle.pop_front() {
                    if self.is_expired(&conn, now) || conn.is_closed() {
                        state.total -= 1;
                        debug!("Discarding expired pooled connection {}", conn.client_id());
                        continue;
                    }
                    return Ok(PooledConnection::new(self.clone(), conn));
                }
                if state.total < self.inner.config.max_open {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if reserved {
                let slot = Reservation::new(self);
                return self.open(slot).await.map(|conn| PooledConnection::new(self.clone(), conn));
            }
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return Err(BinlogError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// 예약된 자리에 새 연결 생성. 실패하거나 future 가 drop 되면 자리 반납
    async fn open(&self, slot: Reservation<'_>) -> Result<Connection> {
        let conn = self.inner.connector.connect().await?;
        slot.commit();
        let mut state = self.inner.state.lock();
        state.ready_count += 1;
        info!("Pool created connection {} (total={})", conn.client_id(), state.total);
        Ok(conn)
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// 연결 반환. 닫혔거나 재사용할 수 없는 상태면 폐기
    pub fn put(&self, conn: Connection) {
        let reusable = conn.state() == ConnState::Ready && !conn.in_transaction();
        let mut state = self.inner.state.lock();
        if state.closed
            || !reusable
            || state.total > self.inner.config.max_open
            || self.is_expired_lifetime(&conn)
        {
            state.total = state.total.saturating_sub(1);
            debug!("Pool discarded connection {} (total={})", conn.client_id(), state.total);
        } else {
            state.idle.push_back(conn);
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    fn is_expired_lifetime(&self, conn: &Connection) -> bool {
        self.inner
            .config
            .max_lifetime
            .map(|lifetime| conn.created_at().elapsed() >= lifetime)
            .unwrap_or(false)
    }

    /// 만료된 유휴 연결을 정리하고 min_idle까지 채움
    pub async fn maintain(&self) -> Result<()> {
        let now = Instant::now();
        let expired: VecDeque<Connection> = {
            let mut state = self.inner.state.lock();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|conn| !self.is_expired(conn, now) && !conn.is_closed());
            state.idle = keep;
            state.total -= expired.len();
            expired
        };
        for mut conn in expired {
            debug!("Closing idle connection {}", conn.client_id());
            let _ = conn.quit().await;
        }

        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed
                    || state.idle.len() >= self.inner.config.min_idle
                    || state.total >= self.inner.config.max_open
                {
                    return Ok(());
                }
                state.total += 1;
            }
            let conn = self.open(Reservation::new(self)).await?;
            self.put(conn);
        }
    }

    /// 주기적으로 `maintain` 실행
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                if let Err(e) = pool.maintain().await {
                    warn!("Pool maintenance failed: {}", e);
                }
            }
        })
    }

    /// 풀 종료. 유휴 연결을 닫고 대기 중인 `get`을 깨움
    pub async fn close(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.total -= state.idle.len();
            state.idle.drain(..).collect()
        };
        for mut conn in idle {
            let _ = conn.quit().await;
        }
        self.inner.notify.notify_waiters();
        info!("Pool closed");
    }
}

/// `total` 에 잡아 둔 생성 중 자리. commit 전에 drop 되면 반납
struct Reservation<'a> {
    pool: &'a Pool,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a Pool) -> Self {
        Reservation { pool, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Releasing unused pool slot");
            self.pool.release_slot();
        }
    }
}

/// 풀에서 빌린 연결. drop 시 풀로 돌아감
pub struct PooledConnection {
    pool: Pool,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Pool, conn: Connection) -> Self {
        PooledConnection { pool, conn: Some(conn) }
    }

    /// 풀에서 분리 (반환되지 않고 카운트에서도 빠짐)
    pub fn detach(mut self) -> Option<Connection> {
        let conn = self.conn.take();
        self.pool.release_slot();
        conn
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // conn은 drop/detach 전까지 항상 Some
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthPlugin;
    use crate::server::{Credential, Handler, Response, ServerConn, ServerContext, Session};

    struct OkHandler;

    #[async_trait]
    impl Handler for OkHandler {
        async fn query(&self, _session: &mut Session, _sql: &str) -> Result<Response> {
            Ok(Response::ok())
        }
    }

    /// 연결마다 메모리 위 테스트 서버를 띄움
    struct LocalServer {
        ctx: Arc<ServerContext>,
    }

    impl LocalServer {
        fn new() -> Self {
            let ctx = ServerContext::default();
            ctx.add_user(Credential::new("repl", "secret", AuthPlugin::NativePassword));
            LocalServer { ctx: Arc::new(ctx) }
        }
    }

    #[async_trait]
    impl Connector for LocalServer {
        async fn connect(&self) -> Result<Connection> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Ok(conn) = ServerConn::accept(Box::new(server), ctx, Arc::new(OkHandler)).await {
                    let _ = conn.run().await;
                }
            });
            Connection::connect_stream(Box::new(client), ConnectionConfig::new("localhost", "repl").password("secret"))
                .await
        }
    }

    /// 응답하지 않는 서버
    struct Stalled;

    #[async_trait]
    impl Connector for Stalled {
        async fn connect(&self) -> Result<Connection> {
            std::future::pending().await
        }
    }

    struct Refused;

    #[async_trait]
    impl Connector for Refused {
        async fn connect(&self) -> Result<Connection> {
            Err(BinlogError::BadConn("connection refused".to_string()))
        }
    }

    fn single_slot() -> PoolConfig {
        PoolConfig {
            max_open: 1,
            acquire_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_abandoned_get_releases_slot() {
        let pool = Pool::with_connector(Stalled, single_slot());
        for _ in 0..3 {
            let attempt = tokio::time::timeout(Duration::from_millis(20), pool.get()).await;
            assert!(attempt.is_err());
            assert_eq!(pool.stats().total, 0);
        }
    }

    #[tokio::test]
    async fn test_failed_connect_releases_slot() {
        let pool = Pool::with_connector(Refused, single_slot());
        assert!(matches!(pool.get().await, Err(BinlogError::BadConn(_))));
        assert!(matches!(pool.get().await, Err(BinlogError::BadConn(_))));
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_max_open_blocks_until_return() {
        let pool = Pool::with_connector(LocalServer::new(), single_slot());
        let held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(BinlogError::Timeout)));
        assert_eq!(pool.stats().total, 1);

        let id = held.client_id();
        drop(held);
        let again = pool.get().await.unwrap();
        assert_eq!(again.client_id(), id);
        assert_eq!(pool.stats().ready_count, 1);
    }

    #[tokio::test]
    async fn test_idle_connections_expire() {
        let pool = Pool::with_connector(
            LocalServer::new(),
            PoolConfig {
                max_idle_time: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );
        let first = pool.get().await.unwrap().client_id();
        assert_eq!(pool.stats().available, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.maintain().await.unwrap();
        assert_eq!(pool.stats().total, 0);

        let conn = pool.get().await.unwrap();
        assert_ne!(conn.client_id(), first);
        assert_eq!(pool.stats().ready_count, 2);
    }
}
