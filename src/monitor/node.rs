//! Cluster node bookkeeping.

use std::sync::Arc;

use tracing::{info, warn};

use crate::server::{Server, Status};

pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_HEALTH_PORT: u16 = 3581;

/// Node status as reported by `system.membership`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Quorum,
    Static,
    Dynamic,
    Unknown,
}

impl NodeStatus {
    pub fn from_str(status: &str) -> Self {
        match status {
            "quorum" => NodeStatus::Quorum,
            "static" => NodeStatus::Static,
            "dynamic" => NodeStatus::Dynamic,
            other => {
                warn!(status = other, "Unknown status for a cluster node");
                NodeStatus::Unknown
            }
        }
    }
}

/// Node substate as reported by `system.membership`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSubState {
    Normal,
    Unknown,
}

impl NodeSubState {
    pub fn from_str(substate: &str) -> Self {
        match substate {
            "normal" => NodeSubState::Normal,
            other => {
                warn!(substate = other, "Unknown sub-state for a cluster node");
                NodeSubState::Unknown
            }
        }
    }
}

/// A row from `system.membership`
#[derive(Debug, Clone)]
pub struct Membership {
    pub id: i64,
    pub status: NodeStatus,
    pub substate: NodeSubState,
    pub instance: i64,
}

/// Persistence hooks for node bookkeeping
pub trait Persister {
    fn persist(&mut self, node: &ClusterNode);
    fn unpersist(&mut self, node: &ClusterNode);
}

/// A known cluster node and the server object backing it
pub struct ClusterNode {
    id: i64,
    status: NodeStatus,
    substate: NodeSubState,
    instance: i64,
    ip: String,
    mysql_port: u16,
    health_port: u16,
    health_check_threshold: u32,
    /// Health countdown; the node counts as running while this is > 0
    n_running: u32,
    server: Arc<Server>,
}

/// Whether a failed ping decrements the countdown or zeroes it outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approach {
    Default,
    Override,
}

impl ClusterNode {
    pub fn new(
        persister: &mut dyn Persister,
        membership: &Membership,
        ip: String,
        mysql_port: u16,
        health_port: u16,
        health_check_threshold: u32,
        server: Arc<Server>,
    ) -> Self {
        let node = Self {
            id: membership.id,
            status: membership.status,
            substate: membership.substate,
            instance: membership.instance,
            ip,
            mysql_port,
            health_port,
            health_check_threshold,
            n_running: health_check_threshold,
            server,
        };

        node.server.set_status(Status::MASTER | Status::RUNNING);
        persister.persist(&node);
        node
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn mysql_port(&self) -> u16 {
        self.mysql_port
    }

    pub fn health_port(&self) -> u16 {
        self.health_port
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn substate(&self) -> NodeSubState {
        self.substate
    }

    pub fn instance(&self) -> i64 {
        self.instance
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn health_url(&self) -> String {
        format!("http://{}:{}/", self.ip, self.health_port)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.mysql_port)
    }

    pub fn is_running(&self) -> bool {
        self.n_running > 0
    }

    /// Record a health check result. A recovery restores the full
    /// countdown; failures decrement it (or zero it with
    /// [`Approach::Override`]) and clear the server status when it runs
    /// out.
    pub fn set_running(&mut self, running: bool, approach: Approach, persister: &mut dyn Persister) {
        if running {
            if self.n_running == 0 {
                info!(node = self.id, ip = %self.ip, "Cluster node is up again");
                self.server.set_status(Status::MASTER | Status::RUNNING);
                persister.persist(self);
            }
            self.n_running = self.health_check_threshold;
        } else if self.n_running > 0 {
            if approach == Approach::Override {
                self.n_running = 0;
            } else {
                self.n_running -= 1;
            }

            if self.n_running == 0 {
                info!(node = self.id, ip = %self.ip, "Cluster node is down");
                self.server.clear_status(Status::MASTER | Status::RUNNING);
                persister.unpersist(self);
            }
        }
    }

    /// Refresh address information from `system.nodeinfo`
    pub fn update_address(
        &mut self,
        ip: &str,
        mysql_port: u16,
        health_port: u16,
        persister: &mut dyn Persister,
    ) {
        let mut changed = false;

        if ip != self.ip {
            self.ip = ip.to_string();
            self.server.set_address(ip);
            changed = true;
        }
        if mysql_port != self.mysql_port {
            self.mysql_port = mysql_port;
            self.server.set_port(mysql_port);
            changed = true;
        }
        if health_port != self.health_port {
            self.health_port = health_port;
            changed = true;
        }

        if changed {
            persister.persist(self);
        }
    }

    /// Refresh membership information
    pub fn update_membership(&mut self, status: NodeStatus, substate: NodeSubState, instance: i64) {
        self.status = status;
        self.substate = substate;
        self.instance = instance;
    }

    /// The node has left the cluster: retire its server object
    pub fn deactivate(&mut self, persister: &mut dyn Persister) {
        self.server.deactivate();
        persister.unpersist(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[derive(Default)]
    struct RecordingPersister {
        persists: usize,
        unpersists: usize,
    }

    impl Persister for RecordingPersister {
        fn persist(&mut self, _node: &ClusterNode) {
            self.persists += 1;
        }
        fn unpersist(&mut self, _node: &ClusterNode) {
            self.unpersists += 1;
        }
    }

    fn membership(id: i64) -> Membership {
        Membership {
            id,
            status: NodeStatus::Quorum,
            substate: NodeSubState::Normal,
            instance: 1,
        }
    }

    fn test_node(persister: &mut RecordingPersister, threshold: u32) -> ClusterNode {
        let server = Server::new("@@mon:node-1", &ServerConfig::for_address("10.0.0.1", 3306));
        ClusterNode::new(
            persister,
            &membership(1),
            "10.0.0.1".to_string(),
            3306,
            3581,
            threshold,
            server,
        )
    }

    #[test]
    fn test_new_node_is_running_master() {
        let mut persister = RecordingPersister::default();
        let node = test_node(&mut persister, 3);

        assert!(node.is_running());
        assert!(node.server().is_running());
        assert!(node.server().is_master());
        assert_eq!(persister.persists, 1);
    }

    #[test]
    fn test_countdown_to_down() {
        let mut persister = RecordingPersister::default();
        let mut node = test_node(&mut persister, 3);

        node.set_running(false, Approach::Default, &mut persister);
        node.set_running(false, Approach::Default, &mut persister);
        assert!(node.is_running());
        assert!(node.server().is_running());

        // Third consecutive failure: down, status cleared, unpersisted once
        node.set_running(false, Approach::Default, &mut persister);
        assert!(!node.is_running());
        assert!(!node.server().is_running());
        assert_eq!(persister.unpersists, 1);

        // Further failures change nothing
        node.set_running(false, Approach::Default, &mut persister);
        assert_eq!(persister.unpersists, 1);
    }

    #[test]
    fn test_success_resets_countdown() {
        let mut persister = RecordingPersister::default();
        let mut node = test_node(&mut persister, 3);

        node.set_running(false, Approach::Default, &mut persister);
        node.set_running(true, Approach::Default, &mut persister);

        // Needs the full threshold of failures again
        node.set_running(false, Approach::Default, &mut persister);
        node.set_running(false, Approach::Default, &mut persister);
        assert!(node.is_running());
        node.set_running(false, Approach::Default, &mut persister);
        assert!(!node.is_running());
    }

    #[test]
    fn test_override_drops_immediately() {
        let mut persister = RecordingPersister::default();
        let mut node = test_node(&mut persister, 5);

        node.set_running(false, Approach::Override, &mut persister);
        assert!(!node.is_running());
        assert_eq!(persister.unpersists, 1);
    }

    #[test]
    fn test_recovery_persists_again() {
        let mut persister = RecordingPersister::default();
        let mut node = test_node(&mut persister, 1);

        node.set_running(false, Approach::Default, &mut persister);
        assert!(!node.is_running());

        node.set_running(true, Approach::Default, &mut persister);
        assert!(node.is_running());
        assert!(node.server().is_running());
        assert_eq!(persister.persists, 2);
    }

    #[test]
    fn test_update_address_persists_on_change() {
        let mut persister = RecordingPersister::default();
        let mut node = test_node(&mut persister, 3);

        node.update_address("10.0.0.1", 3306, 3581, &mut persister);
        assert_eq!(persister.persists, 1); // no change, no persist

        node.update_address("10.0.0.2", 3307, 3582, &mut persister);
        assert_eq!(persister.persists, 2);
        assert_eq!(node.server().port(), 3307);
        assert_eq!(node.server().address(), "10.0.0.2");
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(NodeStatus::from_str("quorum"), NodeStatus::Quorum);
        assert_eq!(NodeStatus::from_str("static"), NodeStatus::Static);
        assert_eq!(NodeStatus::from_str("dynamic"), NodeStatus::Dynamic);
        assert_eq!(NodeStatus::from_str("wat"), NodeStatus::Unknown);
        assert_eq!(NodeSubState::from_str("normal"), NodeSubState::Normal);
        assert_eq!(NodeSubState::from_str("wat"), NodeSubState::Unknown);
    }
}
