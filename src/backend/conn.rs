//! Backend connection protocol.
//!
//! Drives the connection through handshake, authentication and connection
//! init queries, then tracks replies packet-by-packet while routing. A
//! connection belongs to exactly one worker and is never touched off it.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::error::{ProxyError, Result, ER_HOST_IS_BLOCKED};
use crate::protocol::{
    backend_capabilities, is_auth_switch_request, is_err_packet, is_ok_packet, scramble_token,
    split_complete_packets, Command, ErrPacket, HandshakeResponse, Packet, PayloadReader,
    ServerHandshake, DEFAULT_AUTH_PLUGIN, PACKET_HEADER_SIZE, REPLY_OK, SCRAMBLE_SIZE,
};
use crate::server::{Server, Status};

use super::reply::{Reply, ReplyState, ReplyTracker};
use super::tls;

/// Outer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Authenticating,
    ConnectionInit,
    SendDelayQ,
    Routing,
    Failed,
}

/// Authentication data shared with the backend: the client identity this
/// connection impersonates towards the server.
#[derive(Debug, Clone)]
pub struct AuthData {
    pub username: String,
    /// SHA1(password), the stage-1 hash tokens are derived from
    pub password_sha1: Vec<u8>,
    pub database: String,
    pub charset: u8,
    pub connect_attrs: Vec<u8>,
    /// Capability mask the client negotiated with the proxy
    pub client_capabilities: u32,
}

/// Per-connection settings resolved from the service
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub init_queries: Vec<String>,
    pub session_track: bool,
    /// Peer and local address of the client socket, for the PROXY header
    pub client_addr: Option<(SocketAddr, SocketAddr)>,
}

/// Write attributes for a routed packet
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Buffer the reply and hand it up only when complete
    pub collect_result: bool,
    /// Swallow the reply instead of forwarding it
    pub ignorable: bool,
}

/// Plain or TLS-wrapped backend stream. `Detached` only exists transiently
/// while the plain stream is being handed to the TLS connector.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Detached,
}

impl BackendStream {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            BackendStream::Plain(s) => Some(s),
            BackendStream::Tls(s) => Some(s.get_ref().0),
            BackendStream::Detached => None,
        }
    }
}

fn detached_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "backend stream detached")
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Detached => Poll::Ready(Err(detached_err())),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Detached => Poll::Ready(Err(detached_err())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Detached => Poll::Ready(Err(detached_err())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Detached => Poll::Ready(Ok(())),
        }
    }
}

/// A backend connection and its protocol state
pub struct BackendConnection {
    server: Arc<Server>,
    stream: BackendStream,
    read_buf: BytesMut,
    state: ConnState,
    tracker: ReplyTracker,
    auth: AuthData,
    settings: BackendSettings,
    thread_id: u32,
    scramble: [u8; SCRAMBLE_SIZE],
    server_capabilities: u32,
    negotiated_capabilities: u32,
    ignore_replies: u32,
    delayed: VecDeque<Bytes>,
    stored_query: Option<Bytes>,
    /// Bytes produced by the swallow path, flushed on the next opportunity
    pending_write: Option<Bytes>,
    collect_result: bool,
    collected: BytesMut,
    last_io: Instant,
    hanged_up: bool,
}

impl BackendConnection {
    /// Dial the server. The returned connection is still handshaking; call
    /// [`drive_to_routing`](Self::drive_to_routing) to finish establishment.
    pub async fn dial(
        server: Arc<Server>,
        auth: AuthData,
        settings: BackendSettings,
    ) -> Result<Self> {
        let endpoint = server.endpoint();
        debug!(server = %server.name(), endpoint = %endpoint, "Connecting to backend");

        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|e| ProxyError::Transient(format!("connect to {} failed: {}", endpoint, e)))?;
        stream.set_nodelay(true).ok();

        let mut conn = Self {
            server,
            stream: BackendStream::Plain(stream),
            read_buf: BytesMut::with_capacity(16 * 1024),
            state: ConnState::Handshaking,
            tracker: ReplyTracker::new(settings.session_track),
            auth,
            settings,
            thread_id: 0,
            scramble: [0u8; SCRAMBLE_SIZE],
            server_capabilities: 0,
            negotiated_capabilities: 0,
            ignore_replies: 0,
            delayed: VecDeque::new(),
            stored_query: None,
            pending_write: None,
            collect_result: false,
            collected: BytesMut::new(),
            last_io: Instant::now(),
            hanged_up: false,
        };

        conn.init_connection().await?;
        Ok(conn)
    }

    /// Emit the PROXY protocol header if the server wants one. Runs before
    /// any MySQL bytes.
    async fn init_connection(&mut self) -> Result<()> {
        if self.server.proxy_protocol {
            let header = proxy_protocol_header(self.settings.client_addr);
            info!(
                server = %self.server.name(),
                header = %header.trim_end(),
                "Sending proxy protocol header"
            );
            self.stream.write_all(header.as_bytes()).await?;
        }
        Ok(())
    }

    /// Run the connection through handshake, authentication and init
    /// queries, then flush the delayed queue. On success the connection is
    /// in Routing state.
    pub async fn drive_to_routing(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, ConnState::Handshaking);

        if let Err(e) = self.handshake().await {
            self.state = ConnState::Failed;
            return Err(e);
        }
        self.state = ConnState::Authenticating;

        if let Err(e) = self.authenticate().await {
            self.state = ConnState::Failed;
            return Err(e);
        }
        self.state = ConnState::ConnectionInit;

        if let Err(e) = self.connection_init().await {
            self.state = ConnState::Failed;
            return Err(e);
        }
        self.state = ConnState::SendDelayQ;

        self.send_delayed_packets().await?;
        self.state = ConnState::Routing;

        debug!(
            server = %self.server.name(),
            thread_id = self.thread_id,
            "Backend connection established"
        );
        Ok(())
    }

    /// Handshake sub-machine: read the server greeting, optionally upgrade
    /// to TLS, send the handshake response.
    async fn handshake(&mut self) -> Result<()> {
        let packet = self.read_packet().await?.ok_or_else(|| {
            ProxyError::Transient(format!("handshake with '{}' failed", self.server.name()))
        })?;

        if is_err_packet(&packet.payload) {
            // Probably too many connections
            let err = ErrPacket::parse(&packet.payload)
                .unwrap_or_else(|| ErrPacket::lost_connection("connection rejected"));
            return Err(ProxyError::Transient(format!(
                "connection rejected by '{}': {} ({})",
                self.server.name(),
                err.message,
                err.code
            )));
        }

        let handshake = ServerHandshake::parse(&packet.payload)
            .ok_or_else(|| ProxyError::Transient("bad handshake".to_string()))?;

        info!(
            server = %self.server.name(),
            thread_id = handshake.thread_id,
            version = %handshake.server_version,
            "Connected to backend"
        );

        self.thread_id = handshake.thread_id;
        self.scramble = handshake.scramble;
        self.server_capabilities = handshake.capability_flags;
        self.server.set_version(&handshake.server_version);

        let with_ssl = self.server.ssl.is_some();
        self.negotiated_capabilities = backend_capabilities(
            self.auth.client_capabilities,
            with_ssl,
            self.settings.session_track,
            !self.auth.database.is_empty(),
        );

        if with_ssl {
            // SSL starts with a cleartext SSLRequest, then the TLS
            // negotiation, then the real response inside the tunnel.
            let ssl_request = self.handshake_response(true, false);
            self.write_packet(&ssl_request).await?;

            let ssl_config = self.server.ssl.clone().unwrap_or_default();
            let plain = match std::mem::replace(&mut self.stream, BackendStream::Detached) {
                BackendStream::Plain(s) => s,
                other => {
                    self.stream = other;
                    return Err(ProxyError::Transient("ssl negotiation state error".into()));
                }
            };

            let tls = tls::connect(plain, &self.server.address(), &ssl_config)
                .await
                .map_err(|e| ProxyError::Transient(format!("ssl failed: {}", e)))?;
            self.stream = BackendStream::Tls(Box::new(tls));
        }

        let response = self.handshake_response(with_ssl, true);
        self.write_packet(&response).await?;
        Ok(())
    }

    /// Build the handshake response. For the SSLRequest variant the packet
    /// stops after the capability header.
    fn handshake_response(&self, with_ssl: bool, ssl_established: bool) -> Packet {
        let seq = if with_ssl && ssl_established { 2 } else { 1 };

        let token = if self.auth.password_sha1.is_empty() {
            Vec::new()
        } else {
            scramble_token(&self.auth.password_sha1, &self.scramble)
        };

        let mut response = HandshakeResponse {
            capability_flags: self.negotiated_capabilities,
            max_packet_size: 16_777_216,
            character_set: self.auth.charset,
            username: self.auth.username.clone(),
            auth_response: token,
            database: if self.auth.database.is_empty() {
                None
            } else {
                Some(self.auth.database.clone())
            },
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
            connect_attrs: Vec::new(),
        };

        // Attributes pass through as-is, but only when both sides claim
        // support.
        use crate::protocol::capabilities::CLIENT_CONNECT_ATTRS;
        if self.negotiated_capabilities & self.server_capabilities & CLIENT_CONNECT_ATTRS != 0 {
            response.connect_attrs = self.auth.connect_attrs.clone();
        } else {
            response.capability_flags &= !CLIENT_CONNECT_ATTRS;
        }

        if with_ssl && !ssl_established {
            // Truncated SSLRequest: caps, max packet, charset, filler only
            let full = response.encode(seq);
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&full.payload[..32.min(full.payload.len())]);
            return Packet::new(seq, buf.freeze());
        }

        response.encode(seq)
    }

    /// Authentication: wait for OK/ERR, answering auth-switch requests for
    /// the default plugin in between.
    async fn authenticate(&mut self) -> Result<()> {
        loop {
            let packet = self
                .read_packet()
                .await?
                .ok_or_else(|| ProxyError::Transient("socket closed during authentication".into()))?;

            if packet.payload.is_empty() {
                return Err(ProxyError::Transient("invalid packet".to_string()));
            }

            if is_ok_packet(&packet.payload) {
                info!(server = %self.server.name(), "Authentication succeeded");
                return Ok(());
            }

            if is_err_packet(&packet.payload) {
                return Err(self.authentication_error(&packet.payload));
            }

            // AuthSwitchRequest or plugin data: the default authenticator
            // only answers switches back to mysql_native_password.
            if is_auth_switch_request(&packet.payload) {
                let response = self
                    .native_password_switch_response(&packet)
                    .ok_or_else(|| {
                        ProxyError::AuthFailed(format!(
                            "backend '{}' requested an unsupported auth plugin",
                            self.server.name()
                        ))
                    })?;
                self.write_packet(&response).await?;
                continue;
            }

            return Err(ProxyError::AuthFailed(format!(
                "unexpected packet 0x{:02x} during authentication",
                packet.payload[0]
            )));
        }
    }

    fn authentication_error(&self, payload: &[u8]) -> ProxyError {
        let err = ErrPacket::parse(payload)
            .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
        error!(
            server = %self.server.name(),
            code = err.code,
            message = %err.message,
            "Backend authentication failed"
        );

        if err.code == ER_HOST_IS_BLOCKED {
            // Stop routing to this server until an admin flushes hosts
            self.server.set_status(Status::MAINT);
            error!(
                server = %self.server.name(),
                "Server placed in maintenance: backend blocks connections from this host. \
                 Run 'mysqladmin flush-hosts' on it before clearing maintenance mode."
            );
            return ProxyError::HostBlocked(err.message);
        }

        ProxyError::AuthFailed(err.message)
    }

    /// Answer an AuthSwitchRequest that names the default plugin: extract
    /// the new scramble and send the rehashed token.
    fn native_password_switch_response(&mut self, request: &Packet) -> Option<Packet> {
        let mut r = PayloadReader::new(&request.payload);
        r.u8()?; // 0xfe
        let plugin = r.nul_str()?;
        if plugin != DEFAULT_AUTH_PLUGIN {
            error!(
                server = %self.server.name(),
                requested = %plugin,
                "Received AuthSwitchRequest to an unsupported plugin"
            );
            return None;
        }

        let scramble_bytes = r.bytes(SCRAMBLE_SIZE)?;
        self.scramble.copy_from_slice(scramble_bytes);

        let token = if self.auth.password_sha1.is_empty() {
            vec![0u8; SCRAMBLE_SIZE]
        } else {
            scramble_token(&self.auth.password_sha1, &self.scramble)
        };

        Some(Packet::new(request.sequence_id.wrapping_add(1), token))
    }

    /// Send all configured init queries in one write, then expect exactly
    /// one OK per query.
    async fn connection_init(&mut self) -> Result<()> {
        if self.settings.init_queries.is_empty() {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        for query in &self.settings.init_queries {
            let mut payload = Vec::with_capacity(query.len() + 1);
            payload.push(Command::Query as u8);
            payload.extend_from_slice(query.as_bytes());
            Packet::new(0, payload).encode(&mut buf);
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        for (index, query) in self.settings.init_queries.clone().iter().enumerate() {
            let packet = self
                .read_packet()
                .await?
                .ok_or_else(|| ProxyError::Transient("socket closed during connection init".into()))?;

            let outcome = if packet.payload.is_empty() {
                Some("an empty packet")
            } else if is_err_packet(&packet.payload) {
                Some("an error packet")
            } else if !is_ok_packet(&packet.payload) {
                Some("a resultset packet")
            } else {
                None
            };

            if let Some(outcome) = outcome {
                error!(
                    server = %self.server.name(),
                    query = %query,
                    index,
                    outcome,
                    "Connection init query failed"
                );
                return Err(ProxyError::InitQueryFailed {
                    query: query.clone(),
                    outcome: outcome.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Flush packets accumulated while the connection was establishing
    async fn send_delayed_packets(&mut self) -> Result<()> {
        while let Some(framed) = self.delayed.pop_front() {
            if framed_command(&framed) == Some(Command::ChangeUser) {
                // Recreate with the scramble this backend actually sent
                self.send_change_user().await?;
            } else if framed_command(&framed) == Some(Command::Quit)
                && self.server.pooling_enabled()
            {
                // Keep pooled connections alive
                continue;
            } else {
                self.tracker.track_query(&framed);
                self.stream.write_all(&framed).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a client command. Behaviour depends on connection state; see
    /// the state machine in the module docs.
    pub async fn write(&mut self, packet: &Packet, flags: WriteFlags) -> Result<()> {
        let mut framed = BytesMut::new();
        packet.encode(&mut framed);
        let framed = framed.freeze();

        if self.ignore_replies > 0 {
            return self.handle_persistent_write(framed).await;
        }

        match self.state {
            ConnState::Failed => {
                error!(
                    server = %self.server.name(),
                    status = %self.server.status_string(),
                    "Cannot write: backend connection has failed"
                );
                Err(ProxyError::Unavailable)
            }

            ConnState::Routing => {
                let command = packet.command();

                if command == Some(Command::ChangeUser) {
                    return self.send_change_user().await;
                }

                if command == Some(Command::Quit) && self.server.pooling_enabled() {
                    // Swallow COM_QUIT so the connection can be pooled
                    return Ok(());
                }

                if flags.ignorable {
                    self.ignore_replies += 1;
                } else {
                    self.tracker.track_query(&framed);
                }
                if flags.collect_result {
                    self.collect_result = true;
                }

                self.stream.write_all(&framed).await?;
                self.stream.flush().await?;
                self.last_io = Instant::now();
                Ok(())
            }

            _ => {
                debug!(
                    server = %self.server.name(),
                    state = ?self.state,
                    "Delaying write until connection is established"
                );
                self.delayed.push_back(framed);
                Ok(())
            }
        }
    }

    /// A write that arrives while a change-user reply is outstanding
    async fn handle_persistent_write(&mut self, framed: Bytes) -> Result<()> {
        if framed_command(&framed) == Some(Command::Quit) {
            info!("COM_QUIT received while COM_CHANGE_USER is in progress, closing pooled connection");
            self.hanged_up = true;
            return Ok(());
        }

        // BLOB data or pipelined queries: store until re-authentication is
        // confirmed.
        debug!("COM_CHANGE_USER in progress, storing query");
        self.stored_query = Some(match self.stored_query.take() {
            None => framed,
            Some(prev) => {
                let mut joined = BytesMut::with_capacity(prev.len() + framed.len());
                joined.extend_from_slice(&prev);
                joined.extend_from_slice(&framed);
                joined.freeze()
            }
        });
        Ok(())
    }

    /// Read from the backend while routing. Returns the bytes to forward to
    /// the client; empty when everything was swallowed or partial.
    pub async fn read_routed(&mut self) -> Result<Bytes> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            self.hanged_up = true;
            return Err(ProxyError::Transient(format!(
                "lost connection to '{}': connection closed by peer",
                self.server.name()
            )));
        }
        self.last_io = Instant::now();

        self.process_readable()
    }

    /// Split out complete packets and run the swallow/track logic. Separate
    /// from the read so tests can drive it directly.
    fn process_readable(&mut self) -> Result<Bytes> {
        let mut complete = split_complete_packets(&mut self.read_buf);
        if complete.is_empty() {
            return Ok(Bytes::new());
        }

        if self.tracker.changing_user() {
            complete = self.handle_changing_user(complete)?;
            if complete.is_empty() {
                return Ok(Bytes::new());
            }
        }

        if self.ignore_replies > 0 {
            self.swallow_ignored_reply(complete)?;
            return Ok(Bytes::new());
        }

        self.tracker.process_packets(&complete);

        if self.collect_result {
            self.collected.extend_from_slice(&complete);
            if !self.tracker.is_complete() {
                return Ok(Bytes::new());
            }
            self.collect_result = false;
            return Ok(self.collected.split().freeze());
        }

        Ok(complete)
    }

    /// Handle packets that arrive while a COM_CHANGE_USER is outstanding.
    /// Returns the packets still to be processed (with the final response
    /// renumbered to sequence 3, which connectors expect).
    fn handle_changing_user(&mut self, complete: Bytes) -> Result<Bytes> {
        let len = crate::protocol::peek_payload_len(&complete).unwrap_or(0);
        let payload = &complete[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + len];

        if is_auth_switch_request(payload) {
            let packet = Packet::new(complete[3], Bytes::copy_from_slice(payload));
            let response = self.native_password_switch_response(&packet);
            let Some(response) = response else {
                self.hanged_up = true;
                return Err(ProxyError::AuthFailed(
                    "change-user auth switch to unknown plugin".into(),
                ));
            };

            let mut out = BytesMut::new();
            response.encode(&mut out);
            // Hand the response to the flush path; writing here would make
            // this function async for a rare case.
            self.pending_write = Some(out.freeze());
            return Ok(Bytes::new());
        }

        // Final response to the change-user: force sequence 3
        let mut owned = BytesMut::from(&complete[..]);
        owned[3] = 0x03;
        self.tracker.set_changing_user(false);
        Ok(owned.freeze())
    }

    /// Swallow the reply to a synthetic command (change-user or ignorable
    /// ping). On OK, any stored query is released to the backend.
    fn swallow_ignored_reply(&mut self, complete: Bytes) -> Result<()> {
        // Skip to the last packet if several arrived at once
        let mut rest: &[u8] = &complete;
        let mut payload: &[u8] = &[];
        let mut seq = 0u8;
        while let Some(len) = crate::protocol::peek_payload_len(rest) {
            let total = PACKET_HEADER_SIZE + len;
            seq = rest[3];
            payload = &rest[PACKET_HEADER_SIZE..total];
            if rest.len() <= total {
                break;
            }
            rest = &rest[total..];
        }

        self.ignore_replies -= 1;

        if payload.first() == Some(&REPLY_OK) {
            if let Some(query) = self.stored_query.take() {
                info!("Response to COM_CHANGE_USER is OK, releasing stored query");
                self.tracker.track_query(&query);
                self.pending_write = Some(query);
            }
            Ok(())
        } else if is_auth_switch_request(payload) {
            let packet = Packet::new(seq, Bytes::copy_from_slice(payload));
            match self.native_password_switch_response(&packet) {
                Some(response) => {
                    let mut out = BytesMut::new();
                    response.encode(&mut out);
                    self.pending_write = Some(out.freeze());
                    // Still waiting for the OK that follows the switch
                    self.ignore_replies += 1;
                    Ok(())
                }
                None => {
                    self.stored_query = None;
                    self.hanged_up = true;
                    Err(ProxyError::AuthFailed(
                        "auth switch to unsupported plugin".into(),
                    ))
                }
            }
        } else {
            self.stored_query = None;
            self.hanged_up = true;
            if is_err_packet(payload) {
                let err = ErrPacket::parse(payload)
                    .unwrap_or_else(|| ErrPacket::lost_connection("change-user failed"));
                Err(ProxyError::AuthFailed(err.message))
            } else {
                error!(
                    response = payload.first().copied().unwrap_or(0),
                    "Unknown response to COM_CHANGE_USER, closing connection"
                );
                Err(ProxyError::Transient("unknown change-user response".into()))
            }
        }
    }

    /// Flush any bytes produced by the swallow path (auth-switch responses,
    /// released stored queries).
    pub async fn flush_pending(&mut self) -> Result<()> {
        if let Some(bytes) = self.pending_write.take() {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Build and send a COM_CHANGE_USER for the current identity, deriving
    /// the token from the stored stage-1 hash and the current scramble.
    pub async fn send_change_user(&mut self) -> Result<()> {
        let packet = self.change_user_packet();
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.tracker.set_changing_user(true);
        Ok(())
    }

    fn change_user_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(128);
        payload.push(Command::ChangeUser as u8);

        payload.extend_from_slice(self.auth.username.as_bytes());
        payload.push(0);

        let token = if self.auth.password_sha1.is_empty() {
            Vec::new()
        } else {
            scramble_token(&self.auth.password_sha1, &self.scramble)
        };
        payload.push(token.len() as u8);
        payload.extend_from_slice(&token);

        payload.extend_from_slice(self.auth.database.as_bytes());
        payload.push(0);

        payload.extend_from_slice(&(self.auth.charset as u16).to_le_bytes());

        payload.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
        payload.push(0);

        payload.extend_from_slice(&self.auth.connect_attrs);

        Packet::new(0, payload)
    }

    /// Take this connection out of the pool for a new session. Fails unless
    /// the connection is quiescent; on success a COM_CHANGE_USER resets the
    /// session state on the backend.
    pub async fn reuse(&mut self, auth: AuthData, settings: BackendSettings) -> bool {
        if self.state != ConnState::Routing || !self.delayed.is_empty() {
            info!(
                state = ?self.state,
                delayed = self.delayed.len(),
                "Connection state does not qualify for reuse"
            );
            return false;
        }

        let orig_auth = std::mem::replace(&mut self.auth, auth);
        self.settings = settings;
        self.ignore_replies = 0;
        // A stored query can be left behind when the previous client closed
        // before the change-user response arrived.
        self.stored_query = None;

        if self.send_change_user().await.is_ok() {
            info!(server = %self.server.name(), "Sent COM_CHANGE_USER");
            self.ignore_replies += 1;
            true
        } else {
            self.auth = orig_auth;
            false
        }
    }

    /// Send an ignorable ping if the connection is idle at a reply boundary
    pub async fn ping(&mut self) -> Result<()> {
        if self.tracker.state() == ReplyState::Done {
            info!(
                server = %self.server.name(),
                idle_secs = self.seconds_idle(),
                "Pinging idle backend"
            );
            let packet = Packet::new(0, vec![Command::Ping as u8]);
            self.write(&packet, WriteFlags { ignorable: true, collect_result: false })
                .await?;
        }
        Ok(())
    }

    /// Quiescent and ready for another command: routing, nothing ignored,
    /// nothing stored.
    pub fn established(&self) -> bool {
        self.state == ConnState::Routing && self.ignore_replies == 0 && self.stored_query.is_none()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn reply(&self) -> &Reply {
        self.tracker.reply()
    }

    pub fn reply_state(&self) -> ReplyState {
        self.tracker.state()
    }

    pub fn is_reply_complete(&self) -> bool {
        self.tracker.is_complete()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn ignore_replies(&self) -> u32 {
        self.ignore_replies
    }

    pub fn hanged_up(&self) -> bool {
        self.hanged_up
    }

    pub fn set_hanged_up(&mut self) {
        self.hanged_up = true;
    }

    pub fn seconds_idle(&self) -> u64 {
        self.last_io.elapsed().as_secs()
    }

    /// Non-blocking liveness probe for pooled connections. An idle
    /// authenticated connection must be silent: any readable bytes or EOF
    /// means the entry has to be evicted.
    pub fn probe_idle_io(&self) -> bool {
        let Some(tcp) = self.stream.tcp() else {
            return true;
        };
        let mut buf = [0u8; 64];
        match tcp.try_read(&mut buf) {
            Ok(0) => true,             // peer closed
            Ok(_) => true,             // unsolicited data
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }

    /// Close the socket, sending COM_QUIT when the connection made it past
    /// the handshake.
    pub async fn shutdown(&mut self) {
        if matches!(self.state, ConnState::Routing | ConnState::SendDelayQ) {
            let mut buf = BytesMut::new();
            Packet::new(0, vec![Command::Quit as u8]).encode(&mut buf);
            let _ = self.stream.write_all(&buf).await;
        }
        let _ = self.stream.shutdown().await;
    }

    /// Read one complete packet, buffering as needed
    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.read_buf) {
                self.last_io = Instant::now();
                return Ok(Some(packet));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.last_io = Instant::now();
        Ok(())
    }
}

/// Command byte of a framed packet
fn framed_command(framed: &[u8]) -> Option<Command> {
    framed.get(PACKET_HEADER_SIZE).map(|&b| Command::from(b))
}

/// PROXY protocol v1 line for the given client/local addresses
fn proxy_protocol_header(addrs: Option<(SocketAddr, SocketAddr)>) -> String {
    match addrs {
        Some((peer, local)) if peer.is_ipv4() && local.is_ipv4() => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            peer.ip(),
            local.ip(),
            peer.port(),
            local.port()
        ),
        Some((peer, local)) if peer.is_ipv6() && local.is_ipv6() => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            peer.ip(),
            local.ip(),
            peer.port(),
            local.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_protocol_header_forms() {
        let peer: SocketAddr = "192.0.2.1:53211".parse().unwrap();
        let local: SocketAddr = "192.0.2.10:4006".parse().unwrap();
        assert_eq!(
            proxy_protocol_header(Some((peer, local))),
            "PROXY TCP4 192.0.2.1 192.0.2.10 53211 4006\r\n"
        );

        let peer6: SocketAddr = "[2001:db8::1]:50000".parse().unwrap();
        let local6: SocketAddr = "[2001:db8::2]:4006".parse().unwrap();
        assert!(proxy_protocol_header(Some((peer6, local6))).starts_with("PROXY TCP6 "));

        assert_eq!(proxy_protocol_header(None), "PROXY UNKNOWN\r\n");
        // Mixed families cannot be expressed in v1
        assert_eq!(proxy_protocol_header(Some((peer, local6))), "PROXY UNKNOWN\r\n");
    }
}
