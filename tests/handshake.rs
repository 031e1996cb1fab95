mod common;

use common::*;
use rust_mysql_binlog::auth::AuthPlugin;
use rust_mysql_binlog::connection::ConnState;
use rust_mysql_binlog::error::BinlogError;
use rust_mysql_binlog::protocol::compress::CompressionAlgorithm;
use rust_mysql_binlog::protocol::tls::{build_acceptor, SslMode, TlsConfig};
use rust_mysql_binlog::server::{Credential, ServerContext};
use rust_mysql_binlog::types::FieldValue;
use std::sync::Arc;

fn handler() -> Arc<TestHandler> {
    Arc::new(TestHandler::default())
}

fn sha2_context() -> ServerContext {
    let ctx = ServerContext::default().with_default_auth_plugin(AuthPlugin::CachingSha2Password);
    ctx.add_user(Credential::new("app", "s3cret", AuthPlugin::CachingSha2Password));
    ctx
}

#[tokio::test]
async fn test_native_password_auth() {
    let ctx = Arc::new(native_context());
    let (conn, server) = connect(ctx, handler(), client_config("repl", "secret")).await;
    let mut conn = conn.unwrap();
    assert_eq!(conn.state(), ConnState::Ready);
    assert_eq!(conn.server_version(), rust_mysql_binlog::server::DEFAULT_SERVER_VERSION);
    conn.ping().await.unwrap();
    conn.quit().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_denied() {
    let ctx = Arc::new(native_context());
    let (conn, server) = connect(ctx, handler(), client_config("repl", "guess")).await;
    let err = conn.unwrap_err();
    assert!(matches!(err, BinlogError::AuthFailed(ref msg) if msg.contains("1045")), "{}", err);
    assert!(matches!(server.await.unwrap(), Err(BinlogError::AuthFailed(_))));
}

#[tokio::test]
async fn test_unknown_user_is_denied() {
    let ctx = Arc::new(native_context());
    let (conn, _server) = connect(ctx, handler(), client_config("nobody", "secret")).await;
    assert!(matches!(conn, Err(BinlogError::AuthFailed(_))));
}

#[tokio::test]
async fn test_empty_native_password() {
    let ctx = ServerContext::default();
    ctx.add_user(Credential::new("anon", "", AuthPlugin::NativePassword));
    let (conn, _server) = connect(Arc::new(ctx), handler(), client_config("anon", "")).await;
    conn.unwrap().ping().await.unwrap();
}

#[tokio::test]
async fn test_ed25519_auth_switch() {
    let ctx = ServerContext::default();
    ctx.add_user(Credential::new("maria", "s3cret", AuthPlugin::Ed25519));
    let ctx = Arc::new(ctx);

    let (conn, _server) = connect(ctx.clone(), handler(), client_config("maria", "s3cret")).await;
    conn.unwrap().ping().await.unwrap();

    let (conn, _server) = connect(ctx, handler(), client_config("maria", "wrong")).await;
    assert!(matches!(conn, Err(BinlogError::AuthFailed(_))));
}

#[tokio::test]
async fn test_caching_sha2_fast_auth() {
    // RSA 키가 없으므로 full auth 로 가면 실패함
    let ctx = sha2_context();
    ctx.cache_sha2_password("app", "s3cret");
    let (conn, _server) = connect(Arc::new(ctx), handler(), client_config("app", "s3cret")).await;
    let mut conn = conn.unwrap();
    assert!(!conn.is_tls());
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_caching_sha2_full_auth_with_key_request() {
    let ctx = Arc::new(sha2_context().with_rsa_key_file(&fixture("rsa-private.pem")).unwrap());
    assert!(ctx.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
    assert!(!ctx.is_sha2_cached("app"));

    let (conn, _server) = connect(ctx.clone(), handler(), client_config("app", "s3cret")).await;
    conn.unwrap().ping().await.unwrap();
    assert!(ctx.is_sha2_cached("app"));

    // 캐시된 뒤에는 fast auth
    let (conn, _server) = connect(ctx.clone(), handler(), client_config("app", "s3cret")).await;
    conn.unwrap().ping().await.unwrap();
}

#[tokio::test]
async fn test_caching_sha2_full_auth_with_known_key() {
    let ctx = Arc::new(sha2_context().with_rsa_key_file(&fixture("rsa-private.pem")).unwrap());
    let config = client_config("app", "s3cret").server_pub_key_path(fixture("rsa-public.pem"));
    let (conn, _server) = connect(ctx, handler(), config).await;
    conn.unwrap().ping().await.unwrap();
}

#[tokio::test]
async fn test_caching_sha2_full_auth_wrong_password() {
    let ctx = Arc::new(sha2_context().with_rsa_key_file(&fixture("rsa-private.pem")).unwrap());
    let (conn, _server) = connect(ctx.clone(), handler(), client_config("app", "nope")).await;
    assert!(matches!(conn, Err(BinlogError::AuthFailed(_))));
    assert!(!ctx.is_sha2_cached("app"));
}

#[tokio::test]
async fn test_sha256_password_with_key_request() {
    let ctx = ServerContext::default()
        .with_default_auth_plugin(AuthPlugin::Sha256Password)
        .with_rsa_key_file(&fixture("rsa-private.pem"))
        .unwrap();
    ctx.add_user(Credential::new("legacy", "pw256", AuthPlugin::Sha256Password));
    let (conn, _server) = connect(Arc::new(ctx), handler(), client_config("legacy", "pw256")).await;
    conn.unwrap().ping().await.unwrap();
}

#[tokio::test]
async fn test_auth_switch_to_caching_sha2() {
    // greeting 은 native, 계정은 caching_sha2
    let ctx = ServerContext::default();
    ctx.add_user(Credential::new("app", "s3cret", AuthPlugin::CachingSha2Password));
    ctx.cache_sha2_password("app", "s3cret");
    let (conn, _server) = connect(Arc::new(ctx), handler(), client_config("app", "s3cret")).await;
    conn.unwrap().ping().await.unwrap();
}

#[tokio::test]
async fn test_tls_upgrade_with_cleartext_full_auth() {
    let acceptor = build_acceptor(&fixture("server-cert.pem"), &fixture("server-key.pem")).unwrap();
    let ctx = Arc::new(sha2_context().with_tls(acceptor));

    let tls = TlsConfig {
        mode: SslMode::Require,
        skip_verify: true,
        ..Default::default()
    };
    let config = client_config("app", "s3cret").tls(tls);
    let (conn, _server) = connect(ctx.clone(), handler(), config).await;
    let mut conn = conn.unwrap();
    assert!(conn.is_tls());
    assert!(ctx.is_sha2_cached("app"));

    let result = conn.execute("SELECT 1").await.unwrap();
    assert_eq!(result.rows(), &[vec![FieldValue::Signed(1)]]);
}

#[tokio::test]
async fn test_tls_required_but_not_offered() {
    let ctx = Arc::new(native_context());
    let config = client_config("repl", "secret").tls(TlsConfig {
        mode: SslMode::Require,
        skip_verify: true,
        ..Default::default()
    });
    let (conn, _server) = connect(ctx, handler(), config).await;
    assert!(matches!(conn, Err(BinlogError::ProtocolError(_))));
}

#[tokio::test]
async fn test_compressed_protocol() {
    for algorithm in [CompressionAlgorithm::Zlib, CompressionAlgorithm::Zstd] {
        let ctx = Arc::new(native_context());
        let config = client_config("repl", "secret").compression(algorithm);
        let (conn, _server) = connect(ctx, handler(), config).await;
        let mut conn = conn.unwrap();
        let result = conn.execute("SELECT id, name FROM users").await.unwrap();
        assert_eq!(result.rows().len(), 2);
        conn.ping().await.unwrap();
    }
}
