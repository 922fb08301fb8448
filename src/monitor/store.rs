//! Persisted node bookkeeping.
//!
//! A small schema-versioned JSON file holds two tables: the bootstrap
//! nodes the monitor was configured with, and the dynamic nodes it has
//! discovered. On startup, a changed bootstrap set means the previous
//! cluster is unrelated and both tables are wiped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{ProxyError, Result};

/// Bump when the on-disk layout changes; the version is part of the
/// filename so old files are simply left behind.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub ip: String,
    pub mysql_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicNode {
    pub ip: String,
    pub mysql_port: u16,
    pub health_port: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    bootstrap_nodes: Vec<BootstrapNode>,
    /// Keyed by node id
    dynamic_nodes: BTreeMap<i64, DynamicNode>,
}

/// File-backed node store, owned by the monitor thread
pub struct NodeStore {
    path: PathBuf,
    tables: Tables,
}

impl NodeStore {
    /// Open or create the store under `datadir/<monitor name>/`
    pub fn open(datadir: &Path, monitor_name: &str) -> Result<Self> {
        let dir = datadir.join(monitor_name);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ProxyError::Config(format!(
                "could not create {} for node bookkeeping: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(format!("cluster_nodes-v{}.json", SCHEMA_VERSION));
        let tables = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Node bookkeeping file is unreadable, starting empty"
                );
                Tables::default()
            }),
            Err(_) => Tables::default(),
        };

        info!(path = %path.display(), "Node bookkeeping store open");
        Ok(Self { path, tables })
    }

    /// Compare the configured bootstrap set against the persisted one. A
    /// different set means the previous cluster is unrelated: wipe both
    /// tables and persist the new set.
    pub fn check_bootstrap_nodes(&mut self, current: &[BootstrapNode]) {
        let mut previous = self.tables.bootstrap_nodes.clone();
        previous.sort();
        let mut configured = current.to_vec();
        configured.sort();

        if previous == configured {
            info!("Bootstrap nodes are unchanged, using persisted node information");
            return;
        }

        if !previous.is_empty() {
            info!(
                "Bootstrap nodes differ from the previous run, discarding persisted node information"
            );
        }

        self.tables.dynamic_nodes.clear();
        self.tables.bootstrap_nodes = configured;
        self.flush();
    }

    /// Insert or update a dynamic node
    pub fn persist(&mut self, id: i64, node: DynamicNode) {
        self.tables.dynamic_nodes.insert(id, node);
        self.flush();
    }

    /// Remove a dynamic node
    pub fn unpersist(&mut self, id: i64) {
        if self.tables.dynamic_nodes.remove(&id).is_some() {
            self.flush();
        }
    }

    /// Dynamic nodes from the previous run, for hub bootstrapping
    pub fn dynamic_nodes(&self) -> Vec<(i64, DynamicNode)> {
        self.tables
            .dynamic_nodes
            .iter()
            .map(|(id, node)| (*id, node.clone()))
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) {
        let json = match serde_json::to_vec_pretty(&self.tables) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Could not serialise node bookkeeping");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        let result = std::fs::write(&tmp, &json).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            error!(
                path = %self.path.display(),
                error = %e,
                "Could not update node bookkeeping"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap(ip: &str) -> BootstrapNode {
        BootstrapNode {
            ip: ip.to_string(),
            mysql_port: 3306,
        }
    }

    fn dynamic(ip: &str) -> DynamicNode {
        DynamicNode {
            ip: ip.to_string(),
            mysql_port: 3306,
            health_port: 3581,
        }
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = NodeStore::open(dir.path(), "mon").unwrap();
            store.check_bootstrap_nodes(&[bootstrap("10.0.0.1")]);
            store.persist(1, dynamic("10.0.0.1"));
            store.persist(2, dynamic("10.0.0.2"));
            store.unpersist(1);
        }

        let store = NodeStore::open(dir.path(), "mon").unwrap();
        let nodes = store.dynamic_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].0, 2);
        assert_eq!(nodes[0].1.ip, "10.0.0.2");
    }

    #[test]
    fn test_same_bootstrap_keeps_dynamic_nodes() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = NodeStore::open(dir.path(), "mon").unwrap();
            store.check_bootstrap_nodes(&[bootstrap("a"), bootstrap("b")]);
            store.persist(7, dynamic("10.0.0.7"));
        }

        let mut store = NodeStore::open(dir.path(), "mon").unwrap();
        // Same set, different order
        store.check_bootstrap_nodes(&[bootstrap("b"), bootstrap("a")]);
        assert_eq!(store.dynamic_nodes().len(), 1);
    }

    #[test]
    fn test_changed_bootstrap_wipes_tables() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = NodeStore::open(dir.path(), "mon").unwrap();
            store.check_bootstrap_nodes(&[bootstrap("a")]);
            store.persist(7, dynamic("10.0.0.7"));
        }

        let mut store = NodeStore::open(dir.path(), "mon").unwrap();
        store.check_bootstrap_nodes(&[bootstrap("c")]);
        assert!(store.dynamic_nodes().is_empty());
    }

    #[test]
    fn test_schema_version_in_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path(), "mon").unwrap();
        let name = store.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("-v1"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mon");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("cluster_nodes-v1.json"), b"not json").unwrap();

        let store = NodeStore::open(dir.path(), "mon").unwrap();
        assert!(store.dynamic_nodes().is_empty());
    }
}
