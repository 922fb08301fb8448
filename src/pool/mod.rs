//! Per-worker pool of idle, authenticated backend connections.
//!
//! Each routing worker owns one pool, keyed by server. Entries are parked
//! connections in Routing state; while pooled they must stay silent, so
//! any readable bytes (or EOF) on the socket evicts the entry. Pooled
//! connections are never part of the worker's active session accounting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::{AuthData, BackendConnection, BackendSettings};
use crate::server::Server;

/// A parked backend connection
pub struct PoolEntry {
    conn: BackendConnection,
    created: Instant,
}

impl PoolEntry {
    fn new(conn: BackendConnection) -> Self {
        Self {
            conn,
            created: Instant::now(),
        }
    }

    pub fn created(&self) -> Instant {
        self.created
    }
}

/// FIFO pool of idle connections, per server
#[derive(Default)]
pub struct WorkerPool {
    entries: HashMap<String, VecDeque<PoolEntry>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a pooled connection to `server` for a new session. Runs the
    /// expiry sweep first, then tries entries front-to-back: dead or
    /// non-reusable entries are closed and the next is tried. On success a
    /// COM_CHANGE_USER has been sent and its reply will be swallowed.
    pub async fn take(
        &mut self,
        server: &Arc<Server>,
        auth: AuthData,
        settings: BackendSettings,
    ) -> Option<BackendConnection> {
        self.evict_expired(server).await;

        let queue = self.entries.get_mut(server.name())?;

        while let Some(mut entry) = queue.pop_front() {
            server.pool_stats.n_pooled.fetch_sub(1, Ordering::Relaxed);

            if entry.conn.probe_idle_io() {
                debug!(server = %server.name(), "Pooled connection had pending I/O, discarding");
                server.pool_stats.n_evicted.fetch_add(1, Ordering::Relaxed);
                entry.conn.shutdown().await;
                continue;
            }

            if entry.conn.reuse(auth.clone(), settings.clone()).await {
                server.pool_stats.n_from_pool.fetch_add(1, Ordering::Relaxed);
                return Some(entry.conn);
            }

            warn!(server = %server.name(), "Failed to reuse a pooled connection");
            entry.conn.shutdown().await;
        }

        None
    }

    /// Offer a connection back to the pool when its session ends. Returns
    /// the connection if it cannot be pooled, so the caller closes it.
    pub async fn offer(
        &mut self,
        server: &Arc<Server>,
        conn: BackendConnection,
        session_valid_for_pool: bool,
    ) -> Option<BackendConnection> {
        let pool_max = server.persist_pool_max;

        if pool_max == 0
            || !server.is_running()
            || !conn.established()
            || !session_valid_for_pool
            || conn.hanged_up()
        {
            return Some(conn);
        }

        let live = self.evict_expired(server).await;
        if live >= pool_max {
            debug!(server = %server.name(), "Pool full, discarding connection");
            return Some(conn);
        }

        server.pool_stats.n_pooled.fetch_add(1, Ordering::Relaxed);
        self.entries
            .entry(server.name().to_string())
            .or_default()
            .push_back(PoolEntry::new(conn));
        debug!(server = %server.name(), "Connection returned to pool");
        None
    }

    /// Sweep one server's entries: hang-ups, age beyond `persistmaxtime`,
    /// a stopped server (evicts everything) and overflow beyond the pool
    /// maximum are all eviction reasons. Returns the live entry count.
    pub async fn evict_expired(&mut self, server: &Arc<Server>) -> usize {
        let Some(queue) = self.entries.get_mut(server.name()) else {
            return 0;
        };

        let evict_all = !server.is_running();
        let max_age = server.persist_max_time;
        let pool_max = server.persist_pool_max;

        let mut kept = VecDeque::new();
        let mut evicted = Vec::new();
        let mut count = 0usize;

        for entry in queue.drain(..) {
            let hanged_up = entry.conn.hanged_up() || entry.conn.probe_idle_io();
            let expired = evict_all || entry.created.elapsed() > max_age;
            let too_many = count >= pool_max;

            if hanged_up || expired || too_many {
                evicted.push(entry);
            } else {
                count += 1;
                kept.push_back(entry);
            }
        }
        *queue = kept;

        if !evicted.is_empty() {
            info!(
                server = %server.name(),
                evicted = evicted.len(),
                remaining = count,
                "Evicted pooled connections"
            );
        }

        for mut entry in evicted {
            server.pool_stats.n_pooled.fetch_sub(1, Ordering::Relaxed);
            server.pool_stats.n_evicted.fetch_add(1, Ordering::Relaxed);
            entry.conn.shutdown().await;
        }

        count
    }

    /// Periodic upkeep across all servers with pooled entries
    pub async fn sweep(&mut self) {
        let servers: Vec<Arc<Server>> = self
            .entries
            .values()
            .filter_map(|q| q.front().map(|e| e.conn.server().clone()))
            .collect();
        for server in servers {
            self.evict_expired(&server).await;
        }
    }

    /// Evict every entry of every server. Used at worker shutdown.
    pub async fn evict_all(&mut self) {
        let queues: Vec<_> = self.entries.drain().collect();
        for (server, mut queue) in queues {
            let n = queue.len();
            if n > 0 {
                info!(server = %server, count = n, "Closing pooled connections");
            }
            for entry in queue.iter_mut() {
                entry.conn.shutdown().await;
            }
        }
    }

    /// Total pooled entries for this worker
    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled entries for one server
    pub fn count_for(&self, server: &Arc<Server>) -> usize {
        self.entries
            .get(server.name())
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}
