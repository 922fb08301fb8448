//! Routing workers.
//!
//! A fixed pool of single-threaded event-loop workers owns all client I/O.
//! Each worker runs a current-thread tokio runtime inside a `LocalSet`;
//! everything a session touches stays on its owning worker. Cross-worker
//! work travels only as messages, delivered before the target's next tick.
//!
//! Every worker holds a nonblocking dup of each listening socket and
//! accepts from it independently. As with a level-triggered shared poll
//! set, a burst of pending connections spreads across workers by
//! readiness: idle workers get back to accepting sooner and therefore
//! take more clients.

mod rebalance;

pub use rebalance::{balance_workers, run_coordinator, AverageN};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::metrics::metrics;
use crate::pool::WorkerPool;
use crate::service::Service;
use crate::session::{Session, SessionHandle, SessionOutcome, SessionRuntime};

/// Heartbeat resolution of the worker tick
const HEARTBEAT: Duration = Duration::from_millis(100);
/// Session timeouts are scanned once per this many heartbeats
const TIMEOUT_SCAN_HEARTBEATS: u64 = 10;
/// Shutdown retry cadence while sessions drain
const SHUTDOWN_RETRY: Duration = Duration::from_millis(100);

/// A listening socket bound to a service
pub struct ListenPoint {
    pub listener: std::net::TcpListener,
    pub service: Arc<Service>,
}

/// Messages a worker accepts from other threads
pub enum WorkerMessage {
    /// Run a closure on the worker
    Post(Box<dyn FnOnce(&WorkerContext) + Send>),
    /// Adopt a session migrated from another worker
    MoveSession(Box<Session>),
    /// Move `sessions` sessions to worker `to`, on the next tick
    Rebalance { to: usize, sessions: usize },
    /// Begin draining and exit
    Shutdown,
}

/// Cross-thread face of a worker
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: usize,
    sender: mpsc::UnboundedSender<WorkerMessage>,
    load: Arc<AtomicU32>,
    session_count: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn send(&self, message: WorkerMessage) -> Result<(), ()> {
        self.sender.send(message).map_err(|_| ())
    }

    /// Post a closure for execution before the worker's next tick
    pub fn post(&self, f: impl FnOnce(&WorkerContext) + Send + 'static) -> Result<(), ()> {
        self.send(WorkerMessage::Post(Box::new(f)))
    }

    /// Most recent one-second load sample (0-100)
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }
}

/// Registered session bookkeeping, worker-private
struct SessionEntry {
    handle: Rc<SessionHandle>,
    connection_timeout: Duration,
    net_write_timeout: Duration,
}

/// Worker-private state reachable from posted closures and sessions
pub struct WorkerContext {
    pub id: usize,
    pub pool: Rc<tokio::sync::Mutex<WorkerPool>>,
    sessions: RefCell<HashMap<u64, SessionEntry>>,
    zombies: RefCell<Vec<u64>>,
    tick_callbacks: RefCell<Vec<Box<dyn Fn()>>>,
    should_shutdown: Cell<bool>,
    pending_rebalance: Cell<Option<(usize, usize)>>,
    /// Work-unit counter feeding the load sample
    activity: Cell<u64>,
    workers: Arc<Vec<WorkerHandle>>,
    session_count: Arc<AtomicUsize>,
    load: Arc<AtomicU32>,
}

impl WorkerContext {
    pub fn should_shutdown(&self) -> bool {
        self.should_shutdown.get()
    }

    /// Register a callback run on every worker tick
    pub fn register_tick_callback(&self, f: impl Fn() + 'static) {
        self.tick_callbacks.borrow_mut().push(Box::new(f));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    fn note_activity(&self) {
        self.activity.set(self.activity.get() + 1);
    }
}

/// The fixed set of routing workers
pub struct Workers {
    handles: Arc<Vec<WorkerHandle>>,
    joins: Vec<std::thread::JoinHandle<()>>,
}

impl Workers {
    /// Create and start `count` workers with dense ids 0..count. Workers
    /// are never created or destroyed after this.
    pub fn start(count: usize, listen_points: &[ListenPoint]) -> std::io::Result<Self> {
        let session_ids = Arc::new(AtomicU64::new(1));

        let mut receivers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            handles.push(WorkerHandle {
                id,
                sender: tx,
                load: Arc::new(AtomicU32::new(0)),
                session_count: Arc::new(AtomicUsize::new(0)),
            });
            receivers.push(rx);
        }

        let handles = Arc::new(handles);
        let mut joins = Vec::with_capacity(count);

        for (id, rx) in receivers.into_iter().enumerate() {
            // Every worker gets its own nonblocking dup of each listener
            let mut listeners = Vec::with_capacity(listen_points.len());
            for point in listen_points {
                let dup = point.listener.try_clone()?;
                dup.set_nonblocking(true)?;
                listeners.push((dup, point.service.clone()));
            }

            let handles = handles.clone();
            let session_ids = session_ids.clone();

            let join = std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_thread(id, rx, listeners, handles, session_ids))?;
            joins.push(join);
        }

        info!(workers = count, "Routing workers started");
        Ok(Self { handles, joins })
    }

    pub fn handles(&self) -> Arc<Vec<WorkerHandle>> {
        self.handles.clone()
    }

    /// Broadcast shutdown and join each worker in turn
    pub fn shutdown(self) {
        for handle in self.handles.iter() {
            let _ = handle.send(WorkerMessage::Shutdown);
        }
        for join in self.joins {
            if join.join().is_err() {
                error!("A worker thread panicked during shutdown");
            }
        }
        info!("All routing workers stopped");
    }
}

/// Thread entry: single-threaded runtime + LocalSet
fn worker_thread(
    id: usize,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    listeners: Vec<(std::net::TcpListener, Arc<Service>)>,
    workers: Arc<Vec<WorkerHandle>>,
    session_ids: Arc<AtomicU64>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = id, error = %e, "Could not build worker runtime");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, worker_main(id, rx, listeners, workers, session_ids));
}

async fn worker_main(
    id: usize,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    listeners: Vec<(std::net::TcpListener, Arc<Service>)>,
    workers: Arc<Vec<WorkerHandle>>,
    session_ids: Arc<AtomicU64>,
) {
    let handle = &workers[id];
    let ctx = Rc::new(WorkerContext {
        id,
        pool: Rc::new(tokio::sync::Mutex::new(WorkerPool::new())),
        sessions: RefCell::new(HashMap::new()),
        zombies: RefCell::new(Vec::new()),
        tick_callbacks: RefCell::new(Vec::new()),
        should_shutdown: Cell::new(false),
        pending_rebalance: Cell::new(None),
        activity: Cell::new(0),
        workers: workers.clone(),
        session_count: handle.session_count.clone(),
        load: handle.load.clone(),
    });

    // Accept loops push new clients into a worker-local channel
    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel::<(TcpStream, Arc<Service>)>();
    for (listener, service) in listeners {
        let accept_tx = accept_tx.clone();
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                error!(worker = id, error = %e, "Could not register listener");
                continue;
            }
        };

        tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if accept_tx.send((stream, service.clone())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        });
    }
    // The original sender stays alive so the channel never closes, even for
    // a worker with no listeners.
    let _accept_tx = accept_tx;

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut heartbeats: u64 = 0;
    let mut last_load_sample = Instant::now();

    debug!(worker = id, "Worker event loop running");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                heartbeats += 1;
                epoll_tick(&ctx, heartbeats).await;
                sample_load(&ctx, &mut last_load_sample);

                if ctx.should_shutdown.get() && try_shutdown(&ctx).await {
                    break;
                }
            }

            accepted = accept_rx.recv() => {
                let Some((stream, service)) = accepted else { continue };
                if ctx.should_shutdown.get() {
                    continue;
                }
                ctx.note_activity();

                let session_id = session_ids.fetch_add(1, Ordering::SeqCst);
                match Session::new(session_id, stream, service) {
                    Ok(session) => {
                        info!(worker = id, session_id, peer = %session.peer_addr(), "New client");
                        metrics().record_connection_accepted();
                        spawn_session(&ctx, session);
                    }
                    Err(e) => warn!(worker = id, error = %e, "Could not create session"),
                }
            }

            message = rx.recv() => {
                let Some(message) = message else { break };
                ctx.note_activity();
                match message {
                    WorkerMessage::Post(f) => f(&ctx),
                    WorkerMessage::MoveSession(session) => {
                        info!(worker = id, session_id = session.id, "Adopting moved session");
                        spawn_session(&ctx, *session);
                    }
                    WorkerMessage::Rebalance { to, sessions } => {
                        // Deferred to the tick: processing inbound data for a
                        // session while moving it would be unsafe.
                        ctx.pending_rebalance.set(Some((to, sessions)));
                    }
                    WorkerMessage::Shutdown => {
                        info!(worker = id, "Worker shutting down");
                        ctx.should_shutdown.set(true);
                    }
                }
            }
        }
    }

    debug!(worker = id, "Worker event loop stopped");
}

/// Register and spawn a session task
fn spawn_session(ctx: &Rc<WorkerContext>, session: Session) {
    let session_id = session.id;
    let handle = SessionHandle::new(session_id);

    let service = session.service_config();
    ctx.sessions.borrow_mut().insert(
        session_id,
        SessionEntry {
            handle: handle.clone(),
            connection_timeout: service.connection_timeout,
            net_write_timeout: service.net_write_timeout,
        },
    );
    ctx.session_count.store(ctx.sessions.borrow().len(), Ordering::Relaxed);

    let rt = SessionRuntime {
        pool: ctx.pool.clone(),
        handle,
    };

    let ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        let outcome = session.run(rt).await;

        ctx.zombies.borrow_mut().push(session_id);
        metrics().record_connection_closed();

        if let SessionOutcome::Moved(session, target) = outcome {
            match ctx.workers.get(target) {
                Some(worker) => {
                    if worker.send(WorkerMessage::MoveSession(session)).is_err() {
                        warn!(session_id, target, "Destination worker gone, session dropped");
                    }
                }
                None => warn!(session_id, target, "Bad rebalance target"),
            }
        }
    });
}

/// Per-tick work, in order: session timeouts, zombie cleanup, registered
/// callbacks, pending rebalance.
async fn epoll_tick(ctx: &Rc<WorkerContext>, heartbeats: u64) {
    if heartbeats % TIMEOUT_SCAN_HEARTBEATS == 0 {
        process_timeouts(ctx);
        // Pool upkeep shares the one-second cadence
        sweep_pool(ctx).await;
    }

    delete_zombies(ctx);

    let callbacks = ctx.tick_callbacks.borrow();
    for callback in callbacks.iter() {
        callback();
    }
    drop(callbacks);

    if let Some((to, sessions)) = ctx.pending_rebalance.take() {
        execute_rebalance(ctx, to, sessions);
    }
}

/// Kill sessions whose client has been idle or write-stalled for too long.
/// Timeout resolution is one second.
fn process_timeouts(ctx: &Rc<WorkerContext>) {
    let now = Instant::now();
    let sessions = ctx.sessions.borrow();

    for entry in sessions.values() {
        let connection_timeout = entry.connection_timeout;
        if !connection_timeout.is_zero()
            && now.duration_since(entry.handle.last_read.get()) > connection_timeout
        {
            warn!(
                session_id = entry.handle.id,
                "Client idle past connection_timeout, closing session"
            );
            entry.handle.kill.cancel();
            continue;
        }

        let net_write_timeout = entry.net_write_timeout;
        if !net_write_timeout.is_zero()
            && now.duration_since(entry.handle.last_write.get()) > net_write_timeout
        {
            warn!(
                session_id = entry.handle.id,
                "Write stalled past net_write_timeout, closing session"
            );
            entry.handle.kill.cancel();
        }
    }
}

/// Drain the zombie list to empty; destruction can enqueue more zombies.
fn delete_zombies(ctx: &Rc<WorkerContext>) {
    loop {
        let drained: Vec<u64> = ctx.zombies.borrow_mut().drain(..).collect();
        if drained.is_empty() {
            break;
        }
        let mut sessions = ctx.sessions.borrow_mut();
        for id in drained {
            sessions.remove(&id);
        }
    }
    ctx.session_count.store(ctx.sessions.borrow().len(), Ordering::Relaxed);
}

/// Expire pooled connections on the one-second cadence
async fn sweep_pool(ctx: &Rc<WorkerContext>) {
    // Sweeping needs the server list; entries know their servers, so a
    // blanket evict pass with the pool's own bookkeeping suffices.
    let mut pool = ctx.pool.lock().await;
    pool.sweep().await;
}

/// One-second load sample published for the rebalance coordinator. Load is
/// the clamped number of work units processed during the sample window.
fn sample_load(ctx: &Rc<WorkerContext>, last_sample: &mut Instant) {
    if last_sample.elapsed() < Duration::from_secs(1) {
        return;
    }
    *last_sample = Instant::now();

    let mut activity = ctx.activity.get();
    for entry in ctx.sessions.borrow().values() {
        activity += entry.handle.io_activity.get();
        entry.handle.io_activity.set(0);
    }
    ctx.activity.set(0);

    ctx.load.store(activity.min(100) as u32, Ordering::Relaxed);
}

/// Pick sessions and ask them to migrate. With one session requested, the
/// most I/O-active movable session goes; with more, any movable sessions.
fn execute_rebalance(ctx: &Rc<WorkerContext>, to: usize, requested: usize) {
    if to == ctx.id {
        return;
    }
    let sessions = ctx.sessions.borrow();

    if requested == 1 {
        let candidate = sessions
            .values()
            .filter(|e| e.handle.movable.get())
            .max_by_key(|e| e.handle.io_activity.get());

        match candidate {
            Some(entry) => {
                debug!(session_id = entry.handle.id, to, "Requesting session move");
                entry.handle.request_move(to);
            }
            None if !sessions.is_empty() => {
                info!(
                    worker = ctx.id,
                    "No sessions moved: all sessions are in an unmovable state"
                );
            }
            None => {}
        }
        return;
    }

    let movable: Vec<_> = sessions
        .values()
        .filter(|e| e.handle.movable.get())
        .take(requested)
        .collect();

    if movable.len() < requested && sessions.len() >= requested {
        info!(
            worker = ctx.id,
            unmovable = sessions.len() - movable.len(),
            "Some sessions are in an unmovable state"
        );
    }

    for entry in movable {
        entry.handle.request_move(to);
    }
}

/// Shutdown step: evict the pool, kill remaining sessions, report whether
/// the worker is drained. Retried every 100ms by the caller's tick.
async fn try_shutdown(ctx: &Rc<WorkerContext>) -> bool {
    {
        let mut pool = ctx.pool.lock().await;
        pool.evict_all().await;
    }

    let sessions = ctx.sessions.borrow();
    if sessions.is_empty() {
        return true;
    }

    for entry in sessions.values() {
        entry.handle.kill.cancel();
    }
    drop(sessions);

    tokio::time::sleep(SHUTDOWN_RETRY).await;
    false
}
