//! Backend protocol scenarios against a mock server.

mod support;

use std::sync::Arc;

use bifrost::backend::{AuthData, BackendConnection, BackendSettings, ConnState, WriteFlags};
use bifrost::config::ServerConfig;
use bifrost::protocol::{capabilities, password_hash, Command, Packet};
use bifrost::server::{Server, Status};
use bifrost::ProxyError;

use support::spawn_mock_backend;

const PASSWORD: &str = "backend-secret";

fn auth(password: &str) -> AuthData {
    AuthData {
        username: "app".to_string(),
        password_sha1: if password.is_empty() {
            Vec::new()
        } else {
            password_hash(password).to_vec()
        },
        database: String::new(),
        charset: 0x21,
        connect_attrs: Vec::new(),
        client_capabilities: capabilities::DEFAULT_CAPABILITIES,
    }
}

fn server_for(addr: std::net::SocketAddr) -> Arc<Server> {
    let mut config = ServerConfig::for_address(&addr.ip().to_string(), addr.port());
    config.persist_pool_max = 4;
    let server = Server::new("mock", &config);
    server.set_status(Status::RUNNING);
    server
}

async fn established(addr: std::net::SocketAddr, password: &str) -> BackendConnection {
    let mut conn = BackendConnection::dial(server_for(addr), auth(password), BackendSettings::default())
        .await
        .expect("dial");
    conn.drive_to_routing().await.expect("establish");
    conn
}

/// Read until the in-flight reply is complete and nothing is swallowed
async fn pump(conn: &mut BackendConnection) -> Vec<u8> {
    let mut forwarded = Vec::new();
    loop {
        let bytes = conn.read_routed().await.expect("read");
        conn.flush_pending().await.expect("flush");
        forwarded.extend_from_slice(&bytes);
        if conn.is_reply_complete() && conn.ignore_replies() == 0 {
            return forwarded;
        }
    }
}

#[tokio::test]
async fn test_connect_and_query() {
    let (addr, _stats) = spawn_mock_backend(PASSWORD).await;
    let mut conn = established(addr, PASSWORD).await;

    assert_eq!(conn.state(), ConnState::Routing);
    assert!(conn.established());
    assert_eq!(conn.thread_id(), 7);
    assert!(conn.server().version().string.contains("mock"));

    let mut payload = vec![Command::Query as u8];
    payload.extend_from_slice(b"SELECT 1");
    conn.write(&Packet::new(0, payload), WriteFlags::default())
        .await
        .expect("write");

    let forwarded = pump(&mut conn).await;
    assert!(!forwarded.is_empty());
    assert_eq!(conn.reply().rows(), 1);
    assert_eq!(conn.reply().field_counts(), &[1]);
    assert!(conn.reply().error().is_none());
    assert!(conn.established());
}

#[tokio::test]
async fn test_ping_reply_is_swallowed() {
    let (addr, _stats) = spawn_mock_backend(PASSWORD).await;
    let mut conn = established(addr, PASSWORD).await;

    conn.ping().await.expect("ping");
    assert_eq!(conn.ignore_replies(), 1);
    assert!(!conn.established());

    let forwarded = pump(&mut conn).await;
    assert!(forwarded.is_empty(), "ping replies are never forwarded");
    assert_eq!(conn.ignore_replies(), 0);
    assert!(conn.established());
}

#[tokio::test]
async fn test_reuse_runs_change_user_with_auth_switch() {
    let (addr, stats) = spawn_mock_backend(PASSWORD).await;
    let mut conn = established(addr, PASSWORD).await;

    assert!(conn.reuse(auth(PASSWORD), BackendSettings::default()).await);
    assert_eq!(conn.ignore_replies(), 1);

    // A command written while re-authentication is outstanding is stored
    let mut payload = vec![Command::Query as u8];
    payload.extend_from_slice(b"SELECT 1");
    conn.write(&Packet::new(0, payload), WriteFlags::default())
        .await
        .expect("write");
    assert!(!conn.established());

    // Pump: auth switch answered, OK swallowed, stored query released
    let forwarded = pump(&mut conn).await;
    assert!(!forwarded.is_empty(), "the released query's resultset reaches the caller");
    assert_eq!(conn.reply().rows(), 1);
    assert!(conn.established());

    assert_eq!(stats.change_users.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(stats.queries.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_password_is_permanent_auth_failure() {
    let (addr, _stats) = spawn_mock_backend(PASSWORD).await;

    let mut conn = BackendConnection::dial(server_for(addr), auth("wrong"), BackendSettings::default())
        .await
        .expect("dial succeeds");

    let err = conn.drive_to_routing().await.expect_err("auth must fail");
    assert!(matches!(err, ProxyError::AuthFailed(_)));
    assert_eq!(conn.state(), ConnState::Failed);

    // Writes on a failed connection are refused
    let result = conn
        .write(&Packet::new(0, vec![Command::Ping as u8]), WriteFlags::default())
        .await;
    assert!(matches!(result, Err(ProxyError::Unavailable)));
}

#[tokio::test]
async fn test_dial_refused_is_transient() {
    let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let result =
        BackendConnection::dial(server_for(addr), auth(PASSWORD), BackendSettings::default()).await;
    match result {
        Err(e) => assert_eq!(e.kind(), bifrost::ErrorKind::Transient),
        Ok(_) => panic!("dial to a closed port must fail"),
    }
}
