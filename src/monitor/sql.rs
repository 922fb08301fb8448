//! Minimal MySQL text-protocol client for monitor use.
//!
//! The monitor only needs to authenticate against a node, run small text
//! queries (membership, node info, ALTER CLUSTER) and ping. Rows come back
//! as strings; NULL columns as `None`.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::protocol::{
    backend_capabilities, is_auth_switch_request, is_eof_packet, is_err_packet, is_ok_packet,
    scramble_token, Command, ErrPacket, HandshakeResponse, Packet, PacketCodec, PayloadReader,
    ServerHandshake, DEFAULT_AUTH_PLUGIN, SCRAMBLE_SIZE,
};

/// NULL column marker in text-protocol rows
const NULL_MARKER: u8 = 0xFB;

/// One row of a text resultset
pub type Row = Vec<Option<String>>;

/// A monitor connection to one node
pub struct MonitorClient {
    framed: Framed<TcpStream, PacketCodec>,
    endpoint: String,
}

impl MonitorClient {
    /// Connect and authenticate within `timeout`
    pub async fn connect(
        endpoint: &str,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self> {
        tokio::time::timeout(timeout, Self::connect_inner(endpoint, user, password))
            .await
            .map_err(|_| ProxyError::Transient(format!("connect to {} timed out", endpoint)))?
    }

    async fn connect_inner(endpoint: &str, user: &str, password: &str) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| ProxyError::Transient(format!("connect to {} failed: {}", endpoint, e)))?;
        stream.set_nodelay(true).ok();
        let mut framed = Framed::new(stream, PacketCodec);

        let greeting = framed
            .next()
            .await
            .ok_or_else(|| ProxyError::Transient("connection closed in handshake".into()))?
            .map_err(ProxyError::Io)?;

        if is_err_packet(&greeting.payload) {
            let err = ErrPacket::parse(&greeting.payload)
                .unwrap_or_else(|| ErrPacket::lost_connection("rejected"));
            return Err(ProxyError::Transient(err.message));
        }

        let handshake = ServerHandshake::parse(&greeting.payload)
            .ok_or_else(|| ProxyError::BadPacket("bad server handshake".into()))?;

        let mut scramble = handshake.scramble;
        let token = if password.is_empty() {
            Vec::new()
        } else {
            scramble_token(&crate::protocol::password_hash(password), &scramble)
        };

        let response = HandshakeResponse {
            capability_flags: backend_capabilities(
                crate::protocol::capabilities::DEFAULT_CAPABILITIES,
                false,
                false,
                false,
            ),
            max_packet_size: 16_777_216,
            character_set: 0x21,
            username: user.to_string(),
            auth_response: token,
            database: None,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
            connect_attrs: Vec::new(),
        };
        framed.send(response.encode(1)).await.map_err(ProxyError::Io)?;

        // OK, ERR or an auth switch back to native password
        loop {
            let reply = framed
                .next()
                .await
                .ok_or_else(|| ProxyError::Transient("connection closed in auth".into()))?
                .map_err(ProxyError::Io)?;

            if is_ok_packet(&reply.payload) {
                break;
            }
            if is_err_packet(&reply.payload) {
                let err = ErrPacket::parse(&reply.payload)
                    .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
                return Err(ProxyError::AuthFailed(err.message));
            }
            if is_auth_switch_request(&reply.payload) {
                let mut r = PayloadReader::new(&reply.payload);
                let _ = r.u8();
                let plugin = r.nul_str().unwrap_or_default();
                if plugin != DEFAULT_AUTH_PLUGIN {
                    return Err(ProxyError::AuthFailed(format!(
                        "unsupported auth plugin '{}'",
                        plugin
                    )));
                }
                if let Some(bytes) = r.bytes(SCRAMBLE_SIZE) {
                    scramble.copy_from_slice(bytes);
                }
                let token = scramble_token(&crate::protocol::password_hash(password), &scramble);
                framed
                    .send(Packet::new(reply.sequence_id.wrapping_add(1), token))
                    .await
                    .map_err(ProxyError::Io)?;
                continue;
            }
            return Err(ProxyError::BadPacket("unexpected auth packet".into()));
        }

        debug!(endpoint, user, "Monitor connection established");
        Ok(Self {
            framed,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// COM_PING
    pub async fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping, b"").await?;
        let reply = self.next_packet().await?;
        if is_ok_packet(&reply.payload) {
            Ok(())
        } else {
            Err(ProxyError::Transient("ping failed".into()))
        }
    }

    /// Run a statement that returns no resultset
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.send_command(Command::Query, sql.as_bytes()).await?;
        let reply = self.next_packet().await?;

        if is_ok_packet(&reply.payload) {
            return Ok(());
        }
        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload)
                .unwrap_or_else(|| ErrPacket::lost_connection("query failed"));
            return Err(ProxyError::Transient(format!(
                "'{}' failed on {}: {} ({})",
                sql, self.endpoint, err.message, err.code
            )));
        }
        Err(ProxyError::BadPacket(format!(
            "unexpected response to '{}'",
            sql
        )))
    }

    /// Run a text query and collect all rows
    pub async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.send_command(Command::Query, sql.as_bytes()).await?;

        let first = self.next_packet().await?;
        if is_err_packet(&first.payload) {
            let err = ErrPacket::parse(&first.payload)
                .unwrap_or_else(|| ErrPacket::lost_connection("query failed"));
            return Err(ProxyError::Transient(format!(
                "'{}' failed on {}: {} ({})",
                sql, self.endpoint, err.message, err.code
            )));
        }
        if is_ok_packet(&first.payload) {
            // No resultset
            return Ok(Vec::new());
        }

        let mut r = PayloadReader::new(&first.payload);
        let columns = r
            .lenenc_int()
            .ok_or_else(|| ProxyError::BadPacket("bad column count".into()))? as usize;

        // Column definitions, closed by EOF
        loop {
            let packet = self.next_packet().await?;
            if is_eof_packet(&packet.payload) {
                break;
            }
        }

        // Rows until EOF or ERR
        let mut rows = Vec::new();
        loop {
            let packet = self.next_packet().await?;
            if is_eof_packet(&packet.payload) {
                break;
            }
            if is_err_packet(&packet.payload) {
                let err = ErrPacket::parse(&packet.payload)
                    .unwrap_or_else(|| ErrPacket::lost_connection("query failed"));
                return Err(ProxyError::Transient(err.message));
            }
            rows.push(parse_text_row(&packet.payload, columns)?);
        }

        Ok(rows)
    }

    async fn send_command(&mut self, command: Command, args: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(command as u8);
        payload.extend_from_slice(args);
        self.framed
            .send(Packet::new(0, payload))
            .await
            .map_err(ProxyError::Io)
    }

    async fn next_packet(&mut self) -> Result<Packet> {
        self.framed
            .next()
            .await
            .ok_or_else(|| ProxyError::Transient(format!("{} closed the connection", self.endpoint)))?
            .map_err(ProxyError::Io)
    }
}

/// Text-protocol row: length-encoded strings, 0xfb for NULL
fn parse_text_row(payload: &[u8], columns: usize) -> Result<Row> {
    let mut r = PayloadReader::new(payload);
    let mut row = Vec::with_capacity(columns);

    for _ in 0..columns {
        if r.is_empty() {
            return Err(ProxyError::BadPacket("truncated row".into()));
        }
        if r.peek_u8() == Some(NULL_MARKER) {
            r.u8();
            row.push(None);
        } else {
            let value = r
                .lenenc_str()
                .ok_or_else(|| ProxyError::BadPacket("bad row value".into()))?;
            row.push(Some(value));
        }
    }

    Ok(row)
}

/// Column value as i64, for id/port columns
pub fn column_i64(row: &Row, index: usize) -> Option<i64> {
    row.get(index)?.as_ref()?.parse().ok()
}

/// Column value as &str
pub fn column_str(row: &Row, index: usize) -> Option<&str> {
    row.get(index)?.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_row() {
        // "3" | NULL | "10.0.0.1"
        let mut payload = Vec::new();
        payload.push(1);
        payload.extend_from_slice(b"3");
        payload.push(0xFB);
        payload.push(8);
        payload.extend_from_slice(b"10.0.0.1");

        let row = parse_text_row(&payload, 3).unwrap();
        assert_eq!(row[0].as_deref(), Some("3"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("10.0.0.1"));

        assert_eq!(column_i64(&row, 0), Some(3));
        assert_eq!(column_i64(&row, 1), None);
        assert_eq!(column_str(&row, 2), Some("10.0.0.1"));
    }

    #[test]
    fn test_truncated_row_rejected() {
        let payload = vec![1, b'3'];
        assert!(parse_text_row(&payload, 2).is_err());
    }
}
