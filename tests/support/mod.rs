//! Test doubles: a mock MySQL backend and a raw protocol client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use bifrost::protocol::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, Command, HandshakeResponse,
    Packet, PacketCodec, ServerHandshake, DEFAULT_AUTH_PLUGIN, SCRAMBLE_SIZE,
};

/// Counters exposed by the mock backend
#[derive(Default)]
pub struct BackendStats {
    pub connections: AtomicUsize,
    pub change_users: AtomicUsize,
    pub queries: AtomicUsize,
}

/// A backend that answers the handshake, verifies `mysql_native_password`
/// tokens for the given password, replies to COM_QUERY with a one-row
/// resultset and answers COM_CHANGE_USER with an auth-switch roundtrip.
pub async fn spawn_mock_backend(password: &'static str) -> (SocketAddr, Arc<BackendStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(BackendStats::default());

    let accept_stats = stats.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let stats = accept_stats.clone();
            stats.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = serve_connection(stream, password, stats).await;
            });
        }
    });

    (addr, stats)
}

async fn serve_connection(
    stream: TcpStream,
    password: &str,
    stats: Arc<BackendStats>,
) -> Option<()> {
    let mut framed = Framed::new(stream, PacketCodec);

    let handshake = ServerHandshake::generate(7, "8.0.0-mock");
    framed.send(handshake.encode()).await.ok()?;

    let response = framed.next().await?.ok()?;
    let parsed = HandshakeResponse::parse(&response.payload)?;
    let expected = compute_auth_response(password, &handshake.scramble);
    if parsed.auth_response != expected {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1045u16.to_le_bytes());
        payload.extend_from_slice(b"#28000Access denied");
        framed.send(Packet::new(2, payload)).await.ok()?;
        return None;
    }

    framed.send(ok_packet(2)).await.ok()?;

    loop {
        let packet = framed.next().await?.ok()?;
        match packet.command()? {
            Command::Quit => break,

            Command::Ping => {
                framed.send(ok_packet(1)).await.ok()?;
            }

            Command::Query => {
                stats.queries.fetch_add(1, Ordering::SeqCst);
                send_select_resultset(&mut framed).await?;
            }

            Command::ChangeUser => {
                stats.change_users.fetch_add(1, Ordering::SeqCst);

                // Ask the client to redo native-password auth with a fresh
                // scramble.
                let fresh = ServerHandshake::generate(7, "8.0.0-mock");
                let mut payload = vec![0xFE];
                payload.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
                payload.push(0);
                payload.extend_from_slice(&fresh.scramble);
                framed.send(Packet::new(1, payload)).await.ok()?;

                let token = framed.next().await?.ok()?;
                let expected = compute_auth_response(password, &fresh.scramble);
                if token.payload.len() == SCRAMBLE_SIZE && token.payload[..] == expected[..] {
                    framed.send(ok_packet(3)).await.ok()?;
                } else {
                    let mut payload = vec![0xFF];
                    payload.extend_from_slice(&1045u16.to_le_bytes());
                    payload.extend_from_slice(b"#28000Access denied");
                    framed.send(Packet::new(3, payload)).await.ok()?;
                    break;
                }
            }

            _ => {
                framed.send(ok_packet(1)).await.ok()?;
            }
        }
    }

    Some(())
}

fn ok_packet(seq: u8) -> Packet {
    Packet::new(seq, vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
}

/// `SELECT 1` style response: column count, one column def, EOF, one text
/// row containing "1", final EOF.
async fn send_select_resultset(framed: &mut Framed<TcpStream, PacketCodec>) -> Option<()> {
    framed.send(Packet::new(1, vec![0x01])).await.ok()?;
    framed
        .send(Packet::new(2, Bytes::from_static(b"\x03def\x00\x00\x00\x011\x011\x0c\x3f\x00\x01\x00\x00\x00\x08\x81\x00\x00\x00\x00")))
        .await
        .ok()?;
    framed
        .send(Packet::new(3, vec![0xFE, 0x00, 0x00, 0x02, 0x00]))
        .await
        .ok()?;
    framed.send(Packet::new(4, vec![0x01, b'1'])).await.ok()?;
    framed
        .send(Packet::new(5, vec![0xFE, 0x00, 0x00, 0x02, 0x00]))
        .await
        .ok()?;
    Some(())
}

/// A raw protocol client for talking to the proxy under test
pub struct TestClient {
    framed: Framed<TcpStream, PacketCodec>,
}

impl TestClient {
    /// Connect and authenticate with `mysql_native_password`
    pub async fn connect(addr: SocketAddr, user: &str, password: &str) -> TestClient {
        let stream = TcpStream::connect(addr).await.expect("connect to proxy");
        let mut framed = Framed::new(stream, PacketCodec);

        let greeting = framed.next().await.expect("greeting").expect("greeting");
        let handshake = ServerHandshake::parse(&greeting.payload).expect("parse greeting");

        let response = HandshakeResponse {
            capability_flags: bifrost::protocol::capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16_777_216,
            character_set: 0x21,
            username: user.to_string(),
            auth_response: compute_auth_response(password, &handshake.scramble),
            database: None,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
            connect_attrs: Vec::new(),
        };
        framed.send(response.encode(1)).await.expect("send response");

        let reply = framed.next().await.expect("auth reply").expect("auth reply");
        assert!(
            is_ok_packet(&reply.payload),
            "authentication rejected: {:?}",
            reply.payload
        );

        TestClient { framed }
    }

    /// Expect the auth handshake to fail
    pub async fn connect_expect_denied(addr: SocketAddr, user: &str, password: &str) {
        let stream = TcpStream::connect(addr).await.expect("connect to proxy");
        let mut framed = Framed::new(stream, PacketCodec);

        let greeting = framed.next().await.expect("greeting").expect("greeting");
        let handshake = ServerHandshake::parse(&greeting.payload).expect("parse greeting");

        let response = HandshakeResponse {
            capability_flags: bifrost::protocol::capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16_777_216,
            character_set: 0x21,
            username: user.to_string(),
            auth_response: compute_auth_response(password, &handshake.scramble),
            database: None,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
            connect_attrs: Vec::new(),
        };
        framed.send(response.encode(1)).await.expect("send response");

        let reply = framed.next().await.expect("auth reply").expect("auth reply");
        assert!(is_err_packet(&reply.payload), "expected access denied");
    }

    /// Send COM_QUERY and collect the whole response (until the second EOF,
    /// an OK, or an ERR).
    pub async fn query(&mut self, sql: &str) -> Vec<Packet> {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        self.framed
            .send(Packet::new(0, payload))
            .await
            .expect("send query");

        let mut packets = Vec::new();
        let mut eofs = 0;
        loop {
            let packet = self.framed.next().await.expect("reply").expect("reply");
            let payload = packet.payload.clone();
            let first = packets.is_empty();
            packets.push(packet);

            if is_eof_packet(&payload) {
                eofs += 1;
                if eofs == 2 {
                    break;
                }
            } else if first && (is_ok_packet(&payload) || is_err_packet(&payload)) {
                break;
            } else if is_err_packet(&payload) && eofs > 0 {
                break;
            }
        }
        packets
    }

    /// Send COM_QUIT and close
    pub async fn quit(mut self) {
        let _ = self
            .framed
            .send(Packet::new(0, vec![Command::Quit as u8]))
            .await;
    }
}
