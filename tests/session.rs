mod common;

use async_trait::async_trait;
use common::*;
use rust_mysql_binlog::connection::pool::Connector;
use rust_mysql_binlog::connection::{copy_out, ConnState, Connection, Param, Pool, PoolConfig};
use rust_mysql_binlog::error::{BinlogError, Result};
use rust_mysql_binlog::protocol::capabilities;
use rust_mysql_binlog::server::{Handler, ServerConn, ServerContext};
use rust_mysql_binlog::types::FieldValue;
use std::sync::Arc;
use std::time::Duration;

async fn open(config: rust_mysql_binlog::config::ConnectionConfig) -> (Connection, Arc<TestHandler>) {
    let handler = Arc::new(TestHandler::default());
    let (conn, _server) = connect(Arc::new(native_context()), handler.clone(), config).await;
    (conn.unwrap(), handler)
}

async fn default_conn() -> (Connection, Arc<TestHandler>) {
    open(client_config("repl", "secret")).await
}

fn text(s: &str) -> FieldValue {
    FieldValue::String(s.as_bytes().to_vec())
}

#[tokio::test]
async fn test_text_result_set() {
    let (mut conn, handler) = default_conn().await;
    let result = conn.execute("SELECT id, name FROM users").await.unwrap();
    let rs = result.result_set.as_ref().unwrap();
    assert_eq!(rs.fields.len(), 2);
    assert_eq!(rs.get(0, "name"), Some(&text("alice")));
    assert_eq!(rs.get(1, "id"), Some(&FieldValue::Signed(2)));
    assert_eq!(rs.get(1, "name"), Some(&FieldValue::Null));
    assert!(!result.has_more_results());
    assert_eq!(handler.queries(), vec!["SELECT id, name FROM users".to_string()]);
}

#[tokio::test]
async fn test_ok_and_error_responses() {
    let (mut conn, _handler) = default_conn().await;
    let result = conn.execute("INSERT INTO t VALUES (1)").await.unwrap();
    assert_eq!((result.affected_rows, result.insert_id), (1, 7));
    assert!(result.result_set.is_none());

    let err = conn.execute("SELEKT").await.unwrap_err();
    assert_eq!(err.server_code(), Some(1064));
    assert_eq!(conn.state(), ConnState::Ready);

    // 서버 에러가 아닌 핸들러 실패는 ER_UNKNOWN_ERROR
    let err = conn.execute("KILL").await.unwrap_err();
    assert_eq!(err.server_code(), Some(1105));
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_multi_results() {
    let (mut conn, _handler) = default_conn().await;
    let mut seen = Vec::new();
    let last = conn
        .execute_multi("SELECT 1; SELECT 2", |result| {
            seen.push(result.rows().to_vec());
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(
        seen,
        vec![vec![vec![FieldValue::Signed(1)]], vec![vec![FieldValue::Signed(2)]]]
    );
    assert!(!last.has_more_results());

    // execute 는 첫 결과만 돌려주고 나머지는 버림
    let first = conn.execute("DELETE FROM t; SELECT 1").await.unwrap();
    assert_eq!(first.affected_rows, 3);
    let next = conn.execute("SELECT 1").await.unwrap();
    assert_eq!(next.rows(), &[vec![FieldValue::Signed(1)]]);
}

#[tokio::test]
async fn test_streaming_rows() {
    let (mut conn, _handler) = default_conn().await;
    let mut kept = Vec::new();
    {
        let mut stream = conn.execute_streaming("SELECT id, name FROM users").await.unwrap();
        assert_eq!(stream.fields().len(), 2);
        while let Some(row) = stream.next().await.unwrap() {
            kept.push(copy_out(row));
        }
        let done = stream.finish().await.unwrap();
        assert!(!done.has_more_results());
    }
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0], vec![FieldValue::Signed(1), text("alice")]);
    assert_eq!(conn.state(), ConnState::Ready);
}

#[tokio::test]
async fn test_abandoned_stream_is_drained() {
    let (mut conn, _handler) = default_conn().await;
    {
        let mut stream = conn.execute_streaming("SELECT id, name FROM users").await.unwrap();
        assert!(stream.next().await.unwrap().is_some());
    }
    // 남은 행은 다음 커맨드 전에 버려짐
    let result = conn.execute("SELECT 1").await.unwrap();
    assert_eq!(result.rows(), &[vec![FieldValue::Signed(1)]]);
}

#[tokio::test]
async fn test_without_deprecate_eof() {
    let config = client_config("repl", "secret").disable_capability(capabilities::DEPRECATE_EOF);
    let (mut conn, _handler) = open(config).await;
    assert_eq!(conn.capabilities() & capabilities::DEPRECATE_EOF, 0);
    let result = conn.execute("SELECT id, name FROM users").await.unwrap();
    assert_eq!(result.rows().len(), 2);

    let mut stmt = conn.prepare("SELECT ? + ?").await.unwrap();
    let result = stmt.execute(&mut conn, &[Param::I64(2), Param::I64(3)]).await.unwrap();
    assert_eq!(result.rows(), &[vec![FieldValue::Signed(5)]]);
}

#[tokio::test]
async fn test_prepared_statement_lifecycle() {
    let (mut conn, _handler) = default_conn().await;
    let mut stmt = conn.prepare("SELECT ? + ?").await.unwrap();
    assert_eq!(stmt.param_count(), 2);
    assert_eq!(stmt.columns().len(), 1);

    let result = stmt.execute(&mut conn, &[Param::I64(40), Param::I64(2)]).await.unwrap();
    assert_eq!(result.rows(), &[vec![FieldValue::Signed(42)]]);
    // 두 번째 실행은 바인딩된 타입을 다시 보냄
    let result = stmt.execute(&mut conn, &[Param::I64(-1), Param::Null]).await.unwrap();
    assert_eq!(result.rows(), &[vec![FieldValue::Signed(-1)]]);

    assert!(matches!(
        stmt.execute(&mut conn, &[Param::I64(1)]).await,
        Err(BinlogError::ProtocolError(_))
    ));

    stmt.close(&mut conn).await.unwrap();
    assert!(stmt.execute(&mut conn, &[Param::I64(1), Param::I64(2)]).await.is_err());
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_prepared_long_data_and_reset() {
    let (mut conn, _handler) = default_conn().await;
    let mut stmt = conn.prepare("INSERT INTO blobs VALUES (?, ?)").await.unwrap();
    stmt.send_long_data(&mut conn, 0, b"abc").await.unwrap();
    stmt.send_long_data(&mut conn, 0, b"def").await.unwrap();
    let result = stmt
        .execute(&mut conn, &[Param::Bytes(Vec::new()), Param::from("x")])
        .await
        .unwrap();
    assert_eq!(result.affected_rows, 1);
    assert_eq!(result.info, "6 x");

    stmt.send_long_data(&mut conn, 0, b"zzz").await.unwrap();
    stmt.reset(&mut conn).await.unwrap();
    let result = stmt
        .execute(&mut conn, &[Param::Bytes(b"12".to_vec()), Param::from("y")])
        .await
        .unwrap();
    assert_eq!(result.info, "2 y");
}

#[tokio::test]
async fn test_execute_with_params() {
    let (mut conn, _handler) = default_conn().await;
    let result = conn
        .execute_with("SELECT ? + ?", &[Param::from(7i64), Param::from(8i64)])
        .await
        .unwrap();
    assert_eq!(result.rows(), &[vec![FieldValue::Signed(15)]]);

    let err = conn.prepare("SELECT nonsense").await.unwrap_err();
    assert_eq!(err.server_code(), Some(1064));
}

#[tokio::test]
async fn test_query_attributes() {
    let (mut conn, _handler) = default_conn().await;
    conn.set_query_attributes(vec![
        ("trace_id".to_string(), Param::from("abc")),
        ("n".to_string(), Param::I64(5)),
        ("missing".to_string(), Param::Null),
    ]);
    let result = conn.execute("SELECT query_attributes()").await.unwrap();
    assert_eq!(
        result.rows(),
        &[
            vec![text("trace_id"), text("abc")],
            vec![text("n"), text("5")],
            vec![text("missing"), FieldValue::Null],
        ]
    );
}

#[tokio::test]
async fn test_use_db_and_connect_with_db() {
    let (mut conn, _handler) = open(client_config("repl", "secret").database("shop")).await;
    let result = conn.execute("SELECT DATABASE()").await.unwrap();
    assert_eq!(result.rows(), &[vec![text("shop")]]);

    conn.use_db("billing").await.unwrap();
    let result = conn.execute("SELECT DATABASE()").await.unwrap();
    assert_eq!(result.rows(), &[vec![text("billing")]]);
}

#[tokio::test]
async fn test_transactions() {
    let (mut conn, handler) = default_conn().await;
    conn.begin().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)").await.unwrap();
    conn.commit().await.unwrap();
    conn.rollback().await.unwrap();
    assert_eq!(
        handler.queries(),
        vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT", "ROLLBACK"]
    );
}

/// 풀이 새 연결을 만들 때마다 테스트 서버를 하나씩 띄움
struct DuplexConnector {
    ctx: Arc<ServerContext>,
    handler: Arc<dyn Handler>,
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<Connection> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let ctx = self.ctx.clone();
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Ok(conn) = ServerConn::accept(Box::new(server), ctx, handler).await {
                let _ = conn.run().await;
            }
        });
        Connection::connect_stream(Box::new(client), client_config("repl", "secret")).await
    }
}

fn pool(config: PoolConfig) -> Pool {
    Pool::with_connector(
        DuplexConnector {
            ctx: Arc::new(native_context()),
            handler: Arc::new(TestHandler::default()),
        },
        config,
    )
}

#[tokio::test]
async fn test_pool_reuses_connections() {
    let pool = pool(PoolConfig::default());
    let first_id = {
        let mut conn = pool.get().await.unwrap();
        conn.ping().await.unwrap();
        conn.client_id()
    };
    assert_eq!(pool.stats().available, 1);

    let conn = pool.get().await.unwrap();
    assert_eq!(conn.client_id(), first_id);
    assert_eq!(pool.stats().ready_count, 1);
    drop(conn);
    pool.close().await;
    assert!(pool.get().await.is_err());
}

#[tokio::test]
async fn test_pool_waits_for_returned_connection() {
    let pool = pool(PoolConfig {
        max_open: 1,
        acquire_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let held = pool.get().await.unwrap();
    assert!(matches!(pool.get().await, Err(BinlogError::Timeout)));

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await.map(|c| c.client_id()) })
    };
    let held_id = held.client_id();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
}

#[tokio::test]
async fn test_pool_warms_up_and_detaches() {
    let pool = pool(PoolConfig {
        min_idle: 2,
        ..Default::default()
    });
    pool.maintain().await.unwrap();
    assert_eq!(pool.stats().available, 2);

    let conn = pool.get().await.unwrap();
    let detached = conn.detach().unwrap();
    assert_eq!(detached.state(), ConnState::Ready);
    assert_eq!(pool.stats().total, 1);
}
