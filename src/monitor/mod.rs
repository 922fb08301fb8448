//! Cluster-aware monitor.
//!
//! Runs on its own thread. Each tick it refreshes cluster membership from
//! a hub node when due, fires concurrent HTTP health pings at every known
//! node, updates server status bits and persists the node set. Routers see
//! the results through the servers' status bits only.

mod node;
mod sql;
mod store;

pub use node::{Approach, ClusterNode, Membership, NodeStatus, NodeSubState};
pub use sql::MonitorClient;
pub use store::{BootstrapNode, DynamicNode, NodeStore};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{ProxyError, Result};
use crate::server::{Server, ServerRegistry, Status};
use crate::service::Service;

use node::Persister;
use sql::{column_i64, column_str};

const MEMBERSHIP_QUERY: &str = "SELECT nid, status, instance, substate FROM system.membership";
const NODEINFO_QUERY: &str = "SELECT ni.nodeid, ni.iface_ip, ni.mysql_port, ni.healthmon_port, \
     sn.nodeid FROM system.nodeinfo AS ni \
     LEFT JOIN system.softfailed_nodes AS sn ON ni.nodeid = sn.nodeid";
const QUORUM_QUERY: &str = "SELECT status FROM system.membership WHERE nid = gtmnid()";
const SOFTFAILED_QUERY: &str = "SELECT nid FROM system.softfailed_nodes WHERE nid = gtmnid()";

/// Whether softfailed nodes are acceptable as hubs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Softfailed {
    Accept,
    Reject,
}

/// Admin operations posted to the monitor thread
pub enum MonitorCommand {
    Softfail(String, oneshot::Sender<Result<()>>),
    Unsoftfail(String, oneshot::Sender<Result<()>>),
}

/// Cross-thread face of a running monitor
#[derive(Clone)]
pub struct MonitorHandle {
    name: String,
    commands: mpsc::UnboundedSender<MonitorCommand>,
    stop: CancellationToken,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SOFTFAIL a node: drain it without breaking existing sessions
    pub async fn softfail(&self, server_name: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Softfail(server_name.to_string(), tx))
            .map_err(|_| ProxyError::Transient("monitor is not running".into()))?;
        rx.await
            .map_err(|_| ProxyError::Transient("monitor dropped the request".into()))?
    }

    pub async fn unsoftfail(&self, server_name: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Unsoftfail(server_name.to_string(), tx))
            .map_err(|_| ProxyError::Transient("monitor is not running".into()))?;
        rx.await
            .map_err(|_| ProxyError::Transient("monitor dropped the request".into()))?
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// A running monitor thread
pub struct MonitorJoin {
    pub handle: MonitorHandle,
    join: std::thread::JoinHandle<()>,
}

impl MonitorJoin {
    pub fn stop_and_join(self) {
        self.handle.stop();
        if self.join.join().is_err() {
            error!(monitor = %self.handle.name, "Monitor thread panicked");
        }
    }
}

/// The monitor state, owned by the monitor thread
pub struct ClusterMonitor {
    name: String,
    config: MonitorConfig,
    registry: Arc<ServerRegistry>,
    services: Vec<Arc<Service>>,
    /// Servers from the configuration, used for bootstrapping only
    bootstrap_servers: Vec<Arc<Server>>,
    nodes: BTreeMap<i64, ClusterNode>,
    store: NodeStore,
    hub: Option<MonitorClient>,
    hub_server_name: Option<String>,
    http: reqwest::Client,
    last_cluster_check: Option<Instant>,
    cluster_check_requested: bool,
}

/// Adapter tying node persistence to the store's dynamic-node table
struct StorePersister<'a>(&'a mut NodeStore);

impl Persister for StorePersister<'_> {
    fn persist(&mut self, node: &ClusterNode) {
        self.0.persist(
            node.id(),
            DynamicNode {
                ip: node.ip().to_string(),
                mysql_port: node.mysql_port(),
                health_port: node.health_port(),
            },
        );
        debug!(node = node.id(), ip = %node.ip(), "Node persisted");
    }

    fn unpersist(&mut self, node: &ClusterNode) {
        self.0.unpersist(node.id());
        debug!(node = node.id(), "Node unpersisted");
    }
}

impl ClusterMonitor {
    pub fn new(
        name: &str,
        config: MonitorConfig,
        datadir: &Path,
        registry: Arc<ServerRegistry>,
        bootstrap_servers: Vec<Arc<Server>>,
        services: Vec<Arc<Service>>,
    ) -> Result<Self> {
        let store = NodeStore::open(datadir, name)?;

        Ok(Self {
            name: name.to_string(),
            config,
            registry,
            services,
            bootstrap_servers,
            nodes: BTreeMap::new(),
            store,
            hub: None,
            hub_server_name: None,
            http: reqwest::Client::new(),
            last_cluster_check: None,
            cluster_check_requested: false,
        })
    }

    /// Spawn the monitor thread
    pub fn start(mut self) -> MonitorJoin {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = MonitorHandle {
            name: self.name.clone(),
            commands: tx,
            stop: stop.clone(),
        };

        let thread_name = format!("monitor-{}", self.name);
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "Could not build monitor runtime");
                        return;
                    }
                };

                runtime.block_on(async move {
                    self.pre_loop().await;

                    let mut ticker = tokio::time::interval(self.config.monitor_interval);
                    ticker
                        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            command = rx.recv() => {
                                match command {
                                    Some(command) => self.handle_command(command).await,
                                    None => break,
                                }
                            }
                            _ = ticker.tick() => self.tick().await,
                        }
                    }

                    self.post_loop();
                });
            })
            .expect("spawning the monitor thread cannot fail");

        MonitorJoin { handle, join }
    }

    async fn pre_loop(&mut self) {
        let bootstrap: Vec<BootstrapNode> = self
            .bootstrap_servers
            .iter()
            .map(|s| BootstrapNode {
                ip: s.address(),
                mysql_port: s.port(),
            })
            .collect();
        self.store.check_bootstrap_nodes(&bootstrap);

        if self.config.dynamic_node_detection {
            // Softfailed hubs are acceptable at startup; anything that lets
            // us see the cluster will do until an alternative appears.
            self.check_cluster(Softfailed::Accept).await;
        } else {
            self.populate_from_bootstrap_servers();
        }

        info!(
            monitor = %self.name,
            nodes = self.nodes.len(),
            "Cluster monitor running"
        );
    }

    fn post_loop(&mut self) {
        self.hub = None;
        self.hub_server_name = None;
        info!(monitor = %self.name, "Cluster monitor stopped");
    }

    async fn tick(&mut self) {
        if self.config.dynamic_node_detection && self.should_check_cluster() {
            self.check_cluster(Softfailed::Reject).await;
        }

        self.health_check_round().await;
        self.update_server_statuses();
    }

    async fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Softfail(server, reply) => {
                let result = self.perform_softfail(&server, true).await;
                let _ = reply.send(result);
            }
            MonitorCommand::Unsoftfail(server, reply) => {
                let result = self.perform_softfail(&server, false).await;
                let _ = reply.send(result);
            }
        }
    }

    fn should_check_cluster(&self) -> bool {
        self.cluster_check_requested
            || match self.last_cluster_check {
                None => true,
                Some(at) => at.elapsed() >= self.config.cluster_monitor_interval,
            }
    }

    /// Connection timeout for hub candidates
    fn connect_timeout(&self) -> Duration {
        self.config.monitor_interval.max(Duration::from_secs(1))
    }

    /// Ensure a hub and refresh the node set through it
    async fn check_cluster(&mut self, softfailed: Softfailed) {
        self.cluster_check_requested = false;

        if let Some(hub) = self.hub.as_mut() {
            if hub.ping().await.is_err() {
                info!(monitor = %self.name, "Hub connection lost");
                self.hub = None;
                self.hub_server_name = None;
            }
        }

        if self.hub.is_none() {
            self.choose_hub(softfailed).await;
        }

        if self.hub.is_some() {
            self.refresh_nodes().await;
            self.last_cluster_check = Some(Instant::now());
        }
    }

    /// Try dynamic nodes, then bootstrap servers, then nodes persisted by
    /// the previous run. A candidate is accepted when it can be connected
    /// to, authenticates, and is part of the quorum.
    async fn choose_hub(&mut self, softfailed: Softfailed) {
        let mut checked = BTreeSet::new();

        // Dynamic nodes first,
        let candidates: Vec<(String, String)> = self
            .nodes
            .values()
            .map(|n| (n.server().name().to_string(), n.endpoint()))
            .collect();
        for (server_name, endpoint) in candidates {
            let ip = endpoint.split(':').next().unwrap_or_default().to_string();
            checked.insert(ip);
            if let Some(client) = self.try_hub_candidate(&endpoint, softfailed).await {
                self.hub = Some(client);
                self.hub_server_name = Some(server_name);
                break;
            }
        }

        // then the configured bootstrap servers,
        if self.hub.is_none() {
            let candidates: Vec<(String, String)> = self
                .bootstrap_servers
                .iter()
                .filter(|s| !checked.contains(&s.address()))
                .map(|s| (s.name().to_string(), s.endpoint()))
                .collect();
            for (server_name, endpoint) in candidates {
                let ip = endpoint.split(':').next().unwrap_or_default().to_string();
                checked.insert(ip);
                if let Some(client) = self.try_hub_candidate(&endpoint, softfailed).await {
                    self.hub = Some(client);
                    self.hub_server_name = Some(server_name);
                    break;
                }
            }
        }

        // and finally whatever the previous run knew about.
        if self.hub.is_none() {
            info!(
                monitor = %self.name,
                "Trying to find a cluster node among the ones used during the previous run"
            );
            for (id, node) in self.store.dynamic_nodes() {
                if checked.contains(&node.ip) {
                    continue;
                }
                checked.insert(node.ip.clone());
                let endpoint = format!("{}:{}", node.ip, node.mysql_port);
                if let Some(client) = self.try_hub_candidate(&endpoint, softfailed).await {
                    info!(monitor = %self.name, node = id, "Hub found from persisted nodes");
                    self.hub = Some(client);
                    self.hub_server_name = None;
                    break;
                }
            }
        }

        match (&self.hub, &self.hub_server_name) {
            (Some(hub), _) => {
                info!(
                    monitor = %self.name,
                    hub = %hub.endpoint(),
                    "Monitoring cluster state using this node"
                );
            }
            (None, _) => {
                error!(
                    monitor = %self.name,
                    "Could not connect to any node, or no reachable node is part of the quorum"
                );
            }
        }
    }

    async fn try_hub_candidate(
        &mut self,
        endpoint: &str,
        softfailed: Softfailed,
    ) -> Option<MonitorClient> {
        let mut client = match MonitorClient::connect(
            endpoint,
            &self.config.user,
            &self.config.password,
            self.connect_timeout(),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                debug!(endpoint, error = %e, "Hub candidate not reachable");
                return None;
            }
        };

        match self.is_part_of_quorum(&mut client).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    monitor = %self.name,
                    endpoint,
                    "Node is not part of the quorum, switching to another node"
                );
                return None;
            }
            Err(e) => {
                warn!(endpoint, error = %e, "Quorum check failed");
                return None;
            }
        }

        if softfailed == Softfailed::Reject {
            match client.query(SOFTFAILED_QUERY).await {
                Ok(rows) if !rows.is_empty() => {
                    info!(
                        monitor = %self.name,
                        endpoint,
                        "Node is part of the quorum but being softfailed, switching to another"
                    );
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(endpoint, error = %e, "Softfail check failed");
                    return None;
                }
            }
        }

        Some(client)
    }

    async fn is_part_of_quorum(&self, client: &mut MonitorClient) -> Result<bool> {
        let rows = client.query(QUORUM_QUERY).await?;
        let status = rows
            .first()
            .and_then(|row| column_str(row, 0))
            .map(NodeStatus::from_str);
        Ok(status == Some(NodeStatus::Quorum))
    }

    /// Query membership and node info from the hub and reconcile the node
    /// set: refresh existing nodes, create servers for new ones, deactivate
    /// the ones that left.
    async fn refresh_nodes(&mut self) {
        // The hub is taken out for the duration of the queries and dropped
        // on failure, forcing a re-selection on the next round.
        let Some(mut hub) = self.hub.take() else { return };

        let memberships = match hub.query(MEMBERSHIP_QUERY).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(monitor = %self.name, error = %e, "Membership query failed");
                return;
            }
        };

        let node_info = match hub.query(NODEINFO_QUERY).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(monitor = %self.name, error = %e, "Node info query failed");
                return;
            }
        };
        self.hub = Some(hub);

        let mut memberships_by_id: BTreeMap<i64, Membership> = BTreeMap::new();
        for row in &memberships {
            let Some(id) = column_i64(row, 0) else {
                warn!(monitor = %self.name, "No node id returned in membership row");
                continue;
            };
            memberships_by_id.insert(
                id,
                Membership {
                    id,
                    status: NodeStatus::from_str(column_str(row, 1).unwrap_or("unknown")),
                    substate: NodeSubState::from_str(column_str(row, 3).unwrap_or("unknown")),
                    instance: column_i64(row, 2).unwrap_or(-1),
                },
            );
        }

        // Update membership data on known nodes; drop the ones that left
        let mut left: Vec<i64> = Vec::new();
        for (&id, node) in self.nodes.iter_mut() {
            match memberships_by_id.get(&id) {
                Some(m) => {
                    node.update_membership(m.status, m.substate, m.instance);
                    memberships_by_id.remove(&id);
                }
                None => left.push(id),
            }
        }
        for id in left {
            if let Some(mut node) = self.nodes.remove(&id) {
                info!(monitor = %self.name, node = id, "Node is no longer a cluster member");
                node.deactivate(&mut StorePersister(&mut self.store));
            }
        }

        let mut seen: BTreeSet<i64> = self.nodes.keys().copied().collect();

        for row in &node_info {
            let (Some(id), Some(ip)) = (column_i64(row, 0), column_str(row, 1)) else {
                warn!(monitor = %self.name, "Node id and/or interface ip missing, ignoring node");
                continue;
            };
            let ip = ip.to_string();
            let mysql_port = column_i64(row, 2)
                .map(|p| p as u16)
                .unwrap_or(node::DEFAULT_MYSQL_PORT);
            let health_port = column_i64(row, 3)
                .map(|p| p as u16)
                .unwrap_or(node::DEFAULT_HEALTH_PORT);
            let softfailed = row.get(4).map(|c| c.is_some()).unwrap_or(false);

            if let Some(node) = self.nodes.get_mut(&id) {
                node.update_address(&ip, mysql_port, health_port, &mut StorePersister(&mut self.store));

                let draining = node.server().is_draining();
                if softfailed && !draining {
                    info!(
                        monitor = %self.name,
                        node = id,
                        ip = %ip,
                        "Node has been SOFTFAILed, turning on draining"
                    );
                    node.server().set_status(Status::DRAINING);
                } else if !softfailed && draining {
                    info!(
                        monitor = %self.name,
                        node = id,
                        ip = %ip,
                        "Node is no longer being SOFTFAILed, turning off draining"
                    );
                    node.server().clear_status(Status::DRAINING);
                }

                seen.remove(&id);
            } else if let Some(membership) = memberships_by_id.remove(&id) {
                self.add_node(membership, ip, mysql_port, health_port, softfailed);
            } else {
                error!(
                    monitor = %self.name,
                    node = id,
                    ip = %ip,
                    "Node found in system.nodeinfo but not in system.membership"
                );
            }
        }

        // Nodes missing from nodeinfo are not available at all
        for id in seen {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.set_running(false, Approach::Override, &mut StorePersister(&mut self.store));
            }
        }
    }

    /// Create the server object and node bookkeeping for a newly discovered
    /// cluster member.
    fn add_node(
        &mut self,
        membership: Membership,
        ip: String,
        mysql_port: u16,
        health_port: u16,
        softfailed: bool,
    ) {
        // '@@' prevents clashes with configured servers; the monitor name
        // prevents clashes with other monitor instances.
        let server_name = format!("@@{}:node-{}", self.name, membership.id);

        let mut server_config = crate::config::ServerConfig::for_address(&ip, mysql_port);
        server_config.monitor_user = self.config.user.clone();
        server_config.monitor_password = self.config.password.clone();
        let server = Server::new(&server_name, &server_config);

        if softfailed {
            server.set_status(Status::DRAINING);
        }

        self.registry.insert(server.clone());
        for service in &self.services {
            if self
                .bootstrap_servers
                .iter()
                .any(|s| service.uses_server(s.name()))
            {
                service.add_server(server.clone());
            }
        }

        info!(
            monitor = %self.name,
            node = membership.id,
            ip = %ip,
            mysql_port,
            health_port,
            "New cluster node discovered"
        );

        let id = membership.id;
        let node = ClusterNode::new(
            &mut StorePersister(&mut self.store),
            &membership,
            ip,
            mysql_port,
            health_port,
            self.config.health_check_threshold,
            server,
        );
        self.nodes.insert(id, node);
    }

    /// Without dynamic node detection the configured servers are the nodes
    fn populate_from_bootstrap_servers(&mut self) {
        for (index, server) in self.bootstrap_servers.clone().iter().enumerate() {
            let id = index as i64 + 1;
            let membership = Membership {
                id,
                status: NodeStatus::Unknown,
                substate: NodeSubState::Unknown,
                instance: 1,
            };
            let node = ClusterNode::new(
                &mut StorePersister(&mut self.store),
                &membership,
                server.address(),
                server.port(),
                self.config.health_check_port,
                self.config.health_check_threshold,
                server.clone(),
            );
            self.nodes.insert(id, node);
        }
    }

    /// Concurrent HTTP GETs against every node's health port. Reachable
    /// means HTTP 200. Each request is bounded by a tenth of the monitor
    /// interval so a full round fits in one tick.
    async fn health_check_round(&mut self) {
        if self.nodes.is_empty() {
            return;
        }

        let timeout = (self.config.monitor_interval / 10).max(Duration::from_millis(100));
        let targets: Vec<(i64, String)> = self
            .nodes
            .values()
            .map(|n| (n.id(), n.health_url()))
            .collect();

        let checks = targets.into_iter().map(|(id, url)| {
            let http = self.http.clone();
            async move {
                let reachable = match http.get(&url).timeout(timeout).send().await {
                    Ok(response) => response.status() == reqwest::StatusCode::OK,
                    Err(_) => false,
                };
                (id, reachable)
            }
        });

        let results = futures::future::join_all(checks).await;

        for (id, reachable) in results {
            crate::metrics::metrics().record_health_check(reachable);

            let Some(node) = self.nodes.get_mut(&id) else { continue };
            node.set_running(reachable, Approach::Default, &mut StorePersister(&mut self.store));

            if !reachable && !node.is_running() {
                // The node has used up its countdown; make sure the next
                // tick revisits the cluster topology.
                self.cluster_check_requested = true;
            }
        }
    }

    /// Reflect node health onto the configured bootstrap servers, which are
    /// not updated by the per-node bookkeeping.
    fn update_server_statuses(&mut self) {
        for server in &self.bootstrap_servers {
            let node = self
                .nodes
                .values()
                .find(|n| n.ip() == server.address());

            match node {
                Some(node) if node.is_running() => {
                    server.set_status(Status::MASTER | Status::RUNNING);
                }
                _ => {
                    server.clear_status(Status::MASTER | Status::RUNNING);
                }
            }
        }
    }

    /// Run ALTER CLUSTER SOFTFAIL/UNSOFTFAIL for the node backing `server`
    async fn perform_softfail(&mut self, server_name: &str, softfail: bool) -> Result<()> {
        let operation = if softfail { "SOFTFAIL" } else { "UNSOFTFAIL" };

        if self.hub.is_none() {
            self.check_cluster(Softfailed::Accept).await;
        }

        // Whatever the outcome, revisit the cluster on the next tick
        self.cluster_check_requested = true;

        let node = self
            .nodes
            .values()
            .find(|n| n.server().name() == server_name)
            .map(|n| (n.id(), n.server().clone()));

        let Some((node_id, server)) = node else {
            return Err(ProxyError::Transient(format!(
                "server '{}' is not monitored by '{}', cannot {}",
                server_name, self.name, operation
            )));
        };

        let Some(hub) = self.hub.as_mut() else {
            return Err(ProxyError::Transient(format!(
                "could not connect to any cluster node, cannot {} {}",
                operation, server_name
            )));
        };

        hub.execute(&format!("ALTER CLUSTER {} {}", operation, node_id))
            .await?;

        if softfail {
            info!(
                monitor = %self.name,
                server = server_name,
                node = node_id,
                "SOFTFAIL performed, turning on draining"
            );
            server.set_status(Status::DRAINING);
        } else {
            info!(
                monitor = %self.name,
                server = server_name,
                node = node_id,
                "UNSOFTFAIL performed, turning off draining"
            );
            server.clear_status(Status::DRAINING);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            module: "cluster".to_string(),
            servers: vec![],
            user: "mon".to_string(),
            password: String::new(),
            monitor_interval: Duration::from_secs(2),
            cluster_monitor_interval: Duration::from_secs(60),
            health_check_threshold: 2,
            health_check_port: 3581,
            dynamic_node_detection: false,
        }
    }

    fn new_monitor(dir: &Path) -> ClusterMonitor {
        let registry = Arc::new(ServerRegistry::new());
        let server = Server::new("boot1", &ServerConfig::for_address("10.0.0.1", 3306));
        registry.insert(server.clone());

        ClusterMonitor::new(
            "test-mon",
            monitor_config(),
            dir,
            registry,
            vec![server],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_populate_from_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = new_monitor(dir.path());

        monitor.populate_from_bootstrap_servers();
        assert_eq!(monitor.nodes.len(), 1);

        let node = monitor.nodes.get(&1).unwrap();
        assert_eq!(node.ip(), "10.0.0.1");
        assert_eq!(node.health_port(), 3581);
        assert!(node.is_running());
        assert!(node.server().is_running());
    }

    #[test]
    fn test_server_status_follows_node_health() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = new_monitor(dir.path());
        monitor.populate_from_bootstrap_servers();

        let server = monitor.bootstrap_servers[0].clone();
        monitor.update_server_statuses();
        assert!(server.is_running());

        // threshold = 2: two failures take the node down
        {
            let node = monitor.nodes.get_mut(&1).unwrap();
            node.set_running(false, Approach::Default, &mut StorePersister(&mut monitor.store));
            node.set_running(false, Approach::Default, &mut StorePersister(&mut monitor.store));
        }
        monitor.update_server_statuses();
        assert!(!server.is_running());
    }

    #[test]
    fn test_add_node_creates_synthetic_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = new_monitor(dir.path());

        monitor.add_node(
            Membership {
                id: 4,
                status: NodeStatus::Quorum,
                substate: NodeSubState::Normal,
                instance: 2,
            },
            "10.0.0.4".to_string(),
            3306,
            3581,
            false,
        );

        let server = monitor.registry.get("@@test-mon:node-4").unwrap();
        assert!(server.is_running());
        assert!(server.is_master());
        assert_eq!(server.port(), 3306);

        // And it was persisted
        assert_eq!(monitor.store.dynamic_nodes().len(), 1);
    }

    #[test]
    fn test_add_softfailed_node_starts_draining() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = new_monitor(dir.path());

        monitor.add_node(
            Membership {
                id: 9,
                status: NodeStatus::Quorum,
                substate: NodeSubState::Normal,
                instance: 1,
            },
            "10.0.0.9".to_string(),
            3306,
            3581,
            true,
        );

        let server = monitor.registry.get("@@test-mon:node-9").unwrap();
        assert!(server.is_draining());
    }
}
