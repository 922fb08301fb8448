//! Logical backend server objects.
//!
//! Servers are created from configuration or by the cluster monitor at
//! runtime. Workers read status and settings lock-free; only the monitor
//! and admin paths mutate them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::config::{ServerConfig, SslConfig};

/// Server status bits, consumed by routers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u32);

impl Status {
    pub const RUNNING: u32 = 1 << 0;
    pub const MASTER: u32 = 1 << 1;
    pub const SLAVE: u32 = 1 << 2;
    pub const JOINED: u32 = 1 << 3;
    pub const MAINT: u32 = 1 << 4;
    pub const DRAINING: u32 = 1 << 5;
    pub const WAS_MASTER: u32 = 1 << 6;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// Routing preference tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rank {
    #[default]
    Primary,
    Secondary,
}

/// Backend version, parsed from the handshake's server version string
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub string: String,
}

impl Version {
    pub fn parse(version: &str) -> Self {
        let numeric: String = version
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter_map(|p| p.parse().ok());

        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            string: version.to_string(),
        }
    }
}

/// Disk space thresholds: path -> max used percentage
pub type DiskSpaceLimits = HashMap<String, u8>;

/// Pool statistics, updated by workers
#[derive(Debug, Default)]
pub struct PoolStats {
    pub n_pooled: AtomicU64,
    pub n_from_pool: AtomicU64,
    pub n_evicted: AtomicU64,
}

/// Mutable server fields written by the monitor under a short-held lock
#[derive(Debug, Default)]
struct Mutable {
    version: Version,
    charset: u8,
    address: String,
    port: u16,
    disk_space_limits: DiskSpaceLimits,
}

/// A logical backend target
pub struct Server {
    name: String,
    mutable: Mutex<Mutable>,
    status: AtomicU32,
    active: AtomicBool,
    /// UNIX socket path, used instead of address:port when set
    pub socket: Option<String>,
    pub extra_port: u16,
    pub monitor_user: String,
    pub monitor_password: String,
    pub rank: Rank,
    pub priority: i64,
    pub proxy_protocol: bool,
    pub persist_pool_max: usize,
    pub persist_max_time: Duration,
    pub ssl: Option<SslConfig>,
    pub pool_stats: PoolStats,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("address", &self.address())
            .field("port", &self.port())
            .field("status", &self.status_string())
            .finish()
    }
}

impl Server {
    pub fn new(name: &str, config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            mutable: Mutex::new(Mutable {
                address: config.address.clone(),
                port: config.port,
                disk_space_limits: config.disk_space_threshold.clone(),
                ..Default::default()
            }),
            status: AtomicU32::new(0),
            active: AtomicBool::new(true),
            socket: config.socket.clone(),
            extra_port: config.extra_port,
            monitor_user: config.monitor_user.clone(),
            monitor_password: config.monitor_password.clone(),
            rank: config.rank,
            priority: config.priority,
            proxy_protocol: config.proxy_protocol,
            persist_pool_max: config.persist_pool_max,
            persist_max_time: config.persist_max_time,
            ssl: config.ssl.clone(),
            pool_stats: PoolStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> String {
        self.mutable.lock().address.clone()
    }

    pub fn port(&self) -> u16 {
        self.mutable.lock().port
    }

    pub fn set_port(&self, port: u16) {
        self.mutable.lock().port = port;
    }

    pub fn set_address(&self, address: &str) {
        self.mutable.lock().address = address.to_string();
    }

    /// host:port endpoint for dialing
    pub fn endpoint(&self) -> String {
        let m = self.mutable.lock();
        format!("{}:{}", m.address, m.port)
    }

    pub fn version(&self) -> Version {
        self.mutable.lock().version.clone()
    }

    pub fn set_version(&self, version_string: &str) {
        self.mutable.lock().version = Version::parse(version_string);
    }

    pub fn charset(&self) -> u8 {
        self.mutable.lock().charset
    }

    pub fn set_charset(&self, charset: u8) {
        self.mutable.lock().charset = charset;
    }

    pub fn disk_space_limits(&self) -> DiskSpaceLimits {
        self.mutable.lock().disk_space_limits.clone()
    }

    pub fn status(&self) -> Status {
        Status(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_status(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn is_running(&self) -> bool {
        self.status().contains(Status::RUNNING)
    }

    pub fn is_master(&self) -> bool {
        self.status().contains(Status::MASTER)
    }

    pub fn is_draining(&self) -> bool {
        self.status().contains(Status::DRAINING)
    }

    pub fn in_maintenance(&self) -> bool {
        self.status().contains(Status::MAINT)
    }

    /// Usable by routers: running, not in maintenance, not deactivated
    pub fn is_usable(&self) -> bool {
        let status = self.status();
        self.is_active()
            && status.contains(Status::RUNNING)
            && !status.contains(Status::MAINT)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Take the server out of rotation. Used when a dynamically discovered
    /// node disappears from cluster membership.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.clear_status(Status::RUNNING | Status::MASTER);
        info!(server = %self.name, "Server deactivated");
    }

    pub fn pooling_enabled(&self) -> bool {
        self.persist_pool_max > 0
    }

    pub fn status_string(&self) -> String {
        let status = self.status();
        let mut parts = Vec::new();
        for (bit, name) in [
            (Status::MAINT, "Maintenance"),
            (Status::MASTER, "Master"),
            (Status::SLAVE, "Slave"),
            (Status::JOINED, "Joined"),
            (Status::DRAINING, "Draining"),
            (Status::RUNNING, "Running"),
        ] {
            if status.contains(bit) {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            parts.push("Down");
        }
        parts.join(", ")
    }
}

/// Registry of all known servers, shared between the bootstrap, workers
/// and monitors. Insertion order is preserved for stable routing order.
#[derive(Default)]
pub struct ServerRegistry {
    by_name: DashMap<String, Arc<Server>>,
    order: Mutex<Vec<String>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server: Arc<Server>) {
        let name = server.name().to_string();
        if self.by_name.insert(name.clone(), server).is_none() {
            self.order.lock().push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.by_name.get(name).map(|s| s.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        let order = self.order.lock();
        order.iter().filter_map(|n| self.get(n)).collect()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Server>> {
        self.order.lock().retain(|n| n != name);
        self.by_name.remove(name).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Arc<Server> {
        Server::new("db1", &ServerConfig::for_address("10.0.0.1", 3306))
    }

    #[test]
    fn test_status_bits() {
        let server = test_server();
        assert!(!server.is_running());

        server.set_status(Status::RUNNING | Status::MASTER);
        assert!(server.is_running());
        assert!(server.is_master());
        assert!(server.is_usable());

        server.set_status(Status::MAINT);
        assert!(!server.is_usable());
        server.clear_status(Status::MAINT);

        server.clear_status(Status::MASTER);
        assert!(!server.is_master());
        assert!(server.is_running());
    }

    #[test]
    fn test_deactivate_clears_running() {
        let server = test_server();
        server.set_status(Status::RUNNING | Status::MASTER);
        server.deactivate();
        assert!(!server.is_active());
        assert!(!server.is_running());
        assert!(!server.is_usable());
    }

    #[test]
    fn test_version_parse() {
        let v = Version::parse("10.5.9-MariaDB-log");
        assert_eq!((v.major, v.minor, v.patch), (10, 5, 9));
        assert_eq!(v.string, "10.5.9-MariaDB-log");

        let v = Version::parse("8.0");
        assert_eq!((v.major, v.minor, v.patch), (8, 0, 0));
    }

    #[test]
    fn test_registry_order() {
        let registry = ServerRegistry::new();
        for name in ["a", "b", "c"] {
            registry.insert(Server::new(name, &ServerConfig::for_address("h", 1)));
        }
        let names: Vec<_> = registry.all().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        registry.remove("b");
        let names: Vec<_> = registry.all().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["a", "c"]);
    }

    #[test]
    fn test_status_string() {
        let server = test_server();
        assert_eq!(server.status_string(), "Down");
        server.set_status(Status::RUNNING | Status::MASTER);
        assert_eq!(server.status_string(), "Master, Running");
    }
}
