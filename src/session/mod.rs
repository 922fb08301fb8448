//! Client sessions.
//!
//! A session owns the client socket, an ordered set of backend endpoints
//! and a router session. It lives on exactly one worker; a quiescent
//! session can be detached and reposted to another worker.

mod state;

pub use state::{SessionState, TrxState};

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{AuthData, BackendConnection, BackendSettings, WriteFlags};
use crate::error::{ErrorKind, ProxyError, Result};
use crate::metrics::metrics;
use crate::pool::WorkerPool;
use crate::protocol::{
    Command, ErrPacket, HandshakeResponse, OkPacket, Packet, PacketCodec, ServerHandshake,
    VAR_LAST_GTID,
};
use crate::router::{ClientCommand, ErrorAction, RouterSession, Target};
use crate::server::Server;
use crate::service::{AuthVerifier, Service};

/// Worker-side view of a session: activity cells read by the timeout
/// scanner and the rebalancer, plus the kill/move signals.
pub struct SessionHandle {
    pub id: u64,
    pub last_read: Cell<Instant>,
    pub last_write: Cell<Instant>,
    pub io_activity: Cell<u64>,
    pub movable: Cell<bool>,
    pub kill: CancellationToken,
    pub move_target: Cell<Option<usize>>,
    pub move_notify: Notify,
}

impl SessionHandle {
    pub fn new(id: u64) -> Rc<Self> {
        let now = Instant::now();
        Rc::new(Self {
            id,
            last_read: Cell::new(now),
            last_write: Cell::new(now),
            io_activity: Cell::new(0),
            movable: Cell::new(true),
            kill: CancellationToken::new(),
            move_target: Cell::new(None),
            move_notify: Notify::new(),
        })
    }

    /// Ask the session to migrate to worker `target` at its next quiescent
    /// point.
    pub fn request_move(&self, target: usize) {
        self.move_target.set(Some(target));
        self.move_notify.notify_one();
    }
}

/// Why a session's run loop ended
pub enum SessionOutcome {
    /// Client closed or the session failed; resources released
    Closed,
    /// Killed by the worker (shutdown or timeout)
    Killed,
    /// Session detached for migration; repost to the worker id
    Moved(Box<Session>, usize),
}

/// Worker-local dependencies handed to the run loop, never stored in the
/// session itself (they must not travel on a move).
pub struct SessionRuntime {
    pub pool: Rc<tokio::sync::Mutex<WorkerPool>>,
    pub handle: Rc<SessionHandle>,
}

/// A backend endpoint of this session
struct Endpoint {
    server: Arc<Server>,
    conn: Option<BackendConnection>,
}

/// A client session
pub struct Session {
    pub id: u64,
    service: Arc<Service>,
    client: Framed<TcpStream, PacketCodec>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: SessionState,
    router_session: Box<dyn RouterSession>,
    endpoints: Vec<Endpoint>,
    authenticated: bool,
    /// Set when the session ends in a state unfit for pooling its backends
    tainted: bool,
}

impl Session {
    pub fn new(id: u64, stream: TcpStream, service: Arc<Service>) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true).ok();

        let router_session = service.router.new_session(service.candidates());

        Ok(Self {
            id,
            service,
            client: Framed::new(stream, PacketCodec),
            peer_addr,
            local_addr,
            state: SessionState::new(),
            router_session,
            endpoints: Vec::new(),
            authenticated: false,
            tainted: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn service_config(&self) -> &crate::config::ServiceConfig {
        &self.service.config
    }

    /// Whether the session can be moved to another worker right now: the
    /// router agrees and no transaction or partial command is in flight.
    fn is_movable(&self) -> bool {
        self.router_session.is_movable() && !self.state.trx.is_active()
    }

    /// Drive the session until the client leaves, the worker kills it, or
    /// a migration is requested.
    pub async fn run(mut self, rt: SessionRuntime) -> SessionOutcome {
        if !self.authenticated {
            if let Err(e) = self.client_handshake().await {
                info!(session_id = self.id, error = %e, "Client handshake failed");
                self.release_backends(&rt, false).await;
                return SessionOutcome::Closed;
            }
            self.authenticated = true;
        }

        let outcome = loop {
            let movable = self.is_movable();
            rt.handle.movable.set(movable);

            tokio::select! {
                biased;

                _ = rt.handle.kill.cancelled() => {
                    info!(session_id = self.id, "Session killed");
                    break SessionOutcome::Killed;
                }

                _ = rt.handle.move_notify.notified(), if movable => {
                    if let Some(target) = rt.handle.move_target.take() {
                        debug!(session_id = self.id, target, "Session detaching for move");
                        self.release_backends(&rt, true).await;
                        return SessionOutcome::Moved(Box::new(self), target);
                    }
                }

                packet = self.client.next() => {
                    let packet = match packet {
                        Some(Ok(p)) => p,
                        Some(Err(e)) => {
                            warn!(session_id = self.id, error = %e, "Client read error");
                            self.tainted = true;
                            break SessionOutcome::Closed;
                        }
                        None => break SessionOutcome::Closed,
                    };

                    rt.handle.last_read.set(Instant::now());
                    rt.handle.io_activity.set(rt.handle.io_activity.get() + 1);

                    match self.dispatch(&rt, packet).await {
                        Ok(true) => {}
                        Ok(false) => break SessionOutcome::Closed,
                        Err(e) => {
                            self.fail_session(&e).await;
                            break SessionOutcome::Closed;
                        }
                    }
                }
            }
        };

        let valid_for_pool = !matches!(outcome, SessionOutcome::Killed) && !self.tainted;
        self.release_backends(&rt, valid_for_pool).await;
        outcome
    }

    /// Greet the client, verify credentials, answer OK
    async fn client_handshake(&mut self) -> Result<()> {
        let handshake = ServerHandshake::generate(self.id as u32, "5.5.5-10.5.0-bifrost");
        self.client.send(handshake.encode()).await?;

        let packet = self
            .client
            .next()
            .await
            .ok_or_else(|| ProxyError::Transient("client disconnected in handshake".into()))??;

        let response = HandshakeResponse::parse(&packet.payload)
            .ok_or_else(|| ProxyError::BadPacket("invalid handshake response".into()))?;

        let verified = self.service.auth.verify(
            &response.username,
            &response.auth_response,
            &handshake.scramble,
            response.database.as_deref(),
        );

        if !verified {
            let err = ErrPacket::new(
                1045,
                "28000",
                format!(
                    "Access denied for user '{}'@'{}'",
                    response.username,
                    self.peer_addr.ip()
                ),
            );
            self.client
                .send(err.encode(packet.sequence_id.wrapping_add(1)))
                .await?;
            return Err(ProxyError::AuthFailed(response.username));
        }

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
        );

        let ok = OkPacket::new();
        self.client
            .send(ok.encode(packet.sequence_id.wrapping_add(1), false))
            .await?;

        info!(
            session_id = self.id,
            user = %response.username,
            database = ?response.database,
            "Client authenticated"
        );
        Ok(())
    }

    /// Handle one client command. Returns Ok(false) when the session should
    /// end cleanly.
    async fn dispatch(&mut self, rt: &SessionRuntime, packet: Packet) -> Result<bool> {
        let command = packet.command().unwrap_or(Command::Unknown);

        if command == Command::Quit {
            debug!(session_id = self.id, "Client sent COM_QUIT");
            return Ok(false);
        }

        let mut attempts = 0usize;
        loop {
            let target = {
                let client_command = ClientCommand {
                    command,
                    packet: &packet,
                };
                self.router_session
                    .choose_target(&client_command, &self.state)
            };

            let Some(target) = target else {
                let err = ErrPacket::lost_connection("no server available to route to");
                self.client.send(err.encode(1)).await?;
                self.tainted = true;
                return Ok(false);
            };

            let servers = match target {
                Target::One(server) => vec![server],
                Target::All(servers) => servers,
            };
            let fan_out = servers.len() > 1;

            let mut result = Ok(());
            for (index, server) in servers.iter().enumerate() {
                // Only the first endpoint's reply is forwarded on fan-out
                let forward = index == 0;
                result = self
                    .execute_on(rt, server, &packet, command, forward, fan_out)
                    .await;
                if result.is_err() {
                    break;
                }
            }

            match result {
                Ok(()) => {
                    metrics().record_query_routed();
                    return Ok(true);
                }
                Err(e) => {
                    attempts += 1;
                    let action = match servers.first() {
                        Some(server) => self.router_session.on_error(server, e.kind()),
                        None => ErrorAction::Fail,
                    };

                    if action == ErrorAction::Retry
                        && e.kind() == ErrorKind::Transient
                        && attempts < 8
                    {
                        warn!(
                            session_id = self.id,
                            error = %e,
                            "Backend failed, retrying on another endpoint"
                        );
                        continue;
                    }

                    return Err(e);
                }
            }
        }
    }

    /// Run one command against one backend and pump its reply to the client
    async fn execute_on(
        &mut self,
        rt: &SessionRuntime,
        server: &Arc<Server>,
        packet: &Packet,
        command: Command,
        forward_reply: bool,
        collect: bool,
    ) -> Result<()> {
        let endpoint = self.endpoint_for(rt, server).await?;

        let flags = WriteFlags {
            collect_result: collect,
            ignorable: false,
        };

        let write_result = match self.conn_mut(endpoint) {
            Some(conn) => conn.write(packet, flags).await,
            None => Err(ProxyError::Unavailable),
        };
        if let Err(e) = write_result {
            self.drop_endpoint(endpoint).await;
            return Err(e);
        }

        let needs_reply = match self.conn_mut(endpoint) {
            Some(conn) => command.will_respond() || conn.ignore_replies() > 0,
            None => false,
        };

        if needs_reply {
            // Pump the reply. This also swallows outstanding change-user
            // replies from pooled re-use and releases the stored command.
            loop {
                let step = match self.conn_mut(endpoint) {
                    Some(conn) => match conn.read_routed().await {
                        Ok(bytes) => {
                            conn.flush_pending().await?;
                            let done =
                                conn.is_reply_complete() && conn.ignore_replies() == 0;
                            Ok((bytes, done))
                        }
                        Err(e) => Err(e),
                    },
                    None => Err(ProxyError::Unavailable),
                };

                match step {
                    Ok((bytes, done)) => {
                        if !bytes.is_empty() && forward_reply {
                            SinkExt::<Bytes>::send(&mut self.client, bytes).await?;
                            rt.handle.last_write.set(Instant::now());
                            rt.handle.io_activity.set(rt.handle.io_activity.get() + 1);
                        }
                        if done {
                            break;
                        }
                    }
                    Err(e) => {
                        self.drop_endpoint(endpoint).await;
                        return Err(e);
                    }
                }
            }
        }

        // Surface reply metadata to the router and session state
        let mut reply_status = 0u16;
        let mut trx_chars = None;
        let mut reply_failed = false;

        if let Some(conn) = self.endpoints.get(endpoint).and_then(|e| e.conn.as_ref()) {
            let reply = conn.reply();
            self.router_session.on_reply(server, reply);
            reply_status = reply.server_status();
            trx_chars = reply.variable("trx_characteristics").map(String::from);
            reply_failed = reply.error().is_some();

            if let Some(gtid) = reply.variable(VAR_LAST_GTID) {
                debug!(session_id = self.id, gtid = %gtid, "Tracked GTID");
            }
        }

        self.state.update_from_server_status(reply_status);
        if let Some(chars) = trx_chars {
            self.state.update_from_trx_characteristics(&chars);
        }
        if reply_failed {
            metrics().record_query_error();
        }
        Ok(())
    }

    fn conn_mut(&mut self, index: usize) -> Option<&mut BackendConnection> {
        self.endpoints.get_mut(index).and_then(|e| e.conn.as_mut())
    }

    /// Index of the endpoint for `server`, connecting it if needed. New
    /// connections come from the worker pool when possible.
    async fn endpoint_for(&mut self, rt: &SessionRuntime, server: &Arc<Server>) -> Result<usize> {
        if let Some(index) = self
            .endpoints
            .iter()
            .position(|e| e.server.name() == server.name() && e.conn.is_some())
        {
            return Ok(index);
        }

        let auth = self.backend_auth();
        let settings = self.backend_settings();

        let pooled = {
            let mut pool = rt.pool.lock().await;
            pool.take(server, auth.clone(), settings.clone()).await
        };

        let conn = match pooled {
            Some(conn) => conn,
            None => {
                let mut conn = BackendConnection::dial(server.clone(), auth, settings).await?;
                conn.drive_to_routing().await?;
                metrics().record_backend_connection();
                conn
            }
        };

        self.endpoints.push(Endpoint {
            server: server.clone(),
            conn: Some(conn),
        });
        Ok(self.endpoints.len() - 1)
    }

    fn backend_auth(&self) -> AuthData {
        AuthData {
            username: self.service.auth.username().to_string(),
            password_sha1: self.service.auth.password_sha1().to_vec(),
            database: self.state.database.clone().unwrap_or_default(),
            charset: self.state.charset,
            connect_attrs: Vec::new(),
            client_capabilities: self.state.capabilities,
        }
    }

    fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            init_queries: self.service.config.connection_init_sql.clone(),
            session_track: self.service.config.session_track,
            client_addr: Some((self.peer_addr, self.local_addr)),
        }
    }

    /// Remove a failed endpoint, closing its connection
    async fn drop_endpoint(&mut self, index: usize) {
        if let Some(endpoint) = self.endpoints.get_mut(index) {
            if let Some(mut conn) = endpoint.conn.take() {
                conn.set_hanged_up();
                conn.shutdown().await;
            }
        }
        self.endpoints.retain(|e| e.conn.is_some());
    }

    /// Send the client its single failure ERR packet
    async fn fail_session(&mut self, error: &ProxyError) {
        warn!(session_id = self.id, error = %error, "Session failed");
        self.tainted = true;
        let err = error.to_err_packet();
        let _ = self.client.send(err.encode(1)).await;
    }

    /// Release all backends: donate them to the worker pool when allowed,
    /// close the rest. Also used when detaching for a move, since the pool
    /// is per-worker and references must not travel.
    async fn release_backends(&mut self, rt: &SessionRuntime, valid_for_pool: bool) {
        // A session inside a transaction must not leak its connection state
        let valid = valid_for_pool && !self.state.trx.is_active();

        for mut endpoint in self.endpoints.drain(..) {
            let Some(conn) = endpoint.conn.take() else {
                continue;
            };

            let rejected = {
                let mut pool = rt.pool.lock().await;
                pool.offer(&endpoint.server, conn, valid).await
            };
            if let Some(mut conn) = rejected {
                conn.shutdown().await;
            }
        }
    }
}
