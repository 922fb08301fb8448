//! End-to-end proxy scenarios against a mock backend.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use bifrost::config::{parse_config_text, Config};
use bifrost::protocol::{is_eof_packet, is_err_packet};
use bifrost::worker::Workers;
use bifrost::Runtime;

use support::{spawn_mock_backend, TestClient};

const BACKEND_PASSWORD: &str = "backend-secret";
const CLIENT_USER: &str = "app";

fn proxy_config(backend_port: u16, pool_max: usize) -> Config {
    let text = format!(
        "\
[bifrost]
threads=1

[db1]
type=server
address=127.0.0.1
port={}
persistpoolmax={}
persistmaxtime=60s

[app]
type=service
router=readconn
servers=db1
user={}
password={}

[app-listener]
type=listener
service=app
address=127.0.0.1
port=0
",
        backend_port, pool_max, CLIENT_USER, BACKEND_PASSWORD
    );
    parse_config_text(&text).expect("config parses")
}

struct Proxy {
    addr: std::net::SocketAddr,
    workers: Workers,
}

fn start_proxy(config: Config) -> Proxy {
    let runtime = Runtime::build(config).expect("runtime builds");
    let addr = runtime.listen_points[0]
        .listener
        .local_addr()
        .expect("listener addr");
    let workers = Workers::start(1, &runtime.listen_points).expect("workers start");
    Proxy { addr, workers }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simple_select_roundtrip() {
    let (backend_addr, stats) = spawn_mock_backend(BACKEND_PASSWORD).await;
    let proxy = start_proxy(proxy_config(backend_addr.port(), 0));

    let mut client = TestClient::connect(proxy.addr, CLIENT_USER, BACKEND_PASSWORD).await;
    let packets = client.query("SELECT 1").await;

    // column count, column def, EOF, row, EOF: forwarded verbatim
    assert_eq!(packets.len(), 5);
    assert_eq!(&packets[0].payload[..], &[0x01]);
    assert!(is_eof_packet(&packets[2].payload));
    assert_eq!(&packets[3].payload[..], b"\x011");
    assert!(is_eof_packet(&packets[4].payload));

    assert_eq!(stats.queries.load(Ordering::SeqCst), 1);
    client.quit().await;

    proxy.workers.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_client_password_denied() {
    let (backend_addr, _stats) = spawn_mock_backend(BACKEND_PASSWORD).await;
    let proxy = start_proxy(proxy_config(backend_addr.port(), 0));

    TestClient::connect_expect_denied(proxy.addr, CLIENT_USER, "wrong").await;

    proxy.workers.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pooled_connection_reused_with_change_user() {
    let (backend_addr, stats) = spawn_mock_backend(BACKEND_PASSWORD).await;
    let proxy = start_proxy(proxy_config(backend_addr.port(), 4));

    // Session A creates the backend connection and leaves it poolable
    let mut client = TestClient::connect(proxy.addr, CLIENT_USER, BACKEND_PASSWORD).await;
    let packets = client.query("SELECT 1").await;
    assert_eq!(packets.len(), 5);
    client.quit().await;

    // Give the worker a moment to park the connection
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);

    // Session B must reuse it: same TCP connection, reset via change-user
    let mut client = TestClient::connect(proxy.addr, CLIENT_USER, BACKEND_PASSWORD).await;
    let packets = client.query("SELECT 1").await;
    assert_eq!(packets.len(), 5, "stored query must be released after change-user");
    assert_eq!(&packets[3].payload[..], b"\x011");
    client.quit().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        stats.connections.load(Ordering::SeqCst),
        1,
        "second session must not dial a new backend connection"
    );
    assert_eq!(
        stats.change_users.load(Ordering::SeqCst),
        1,
        "pool re-use resets the connection with COM_CHANGE_USER"
    );
    assert_eq!(stats.queries.load(Ordering::SeqCst), 2);

    proxy.workers.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_backend_down_surfaces_single_error() {
    // No backend listening on this port
    let config = proxy_config(1, 0);
    let proxy = start_proxy(config);

    let mut client = TestClient::connect(proxy.addr, CLIENT_USER, BACKEND_PASSWORD).await;
    let packets = client.query("SELECT 1").await;

    assert_eq!(packets.len(), 1);
    assert!(is_err_packet(&packets[0].payload));

    proxy.workers.shutdown();
}
