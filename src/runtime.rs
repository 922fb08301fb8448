//! Runtime assembly.
//!
//! All process-wide state lives in a [`Runtime`] built once at startup and
//! passed explicitly to the parts that need it.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::monitor::ClusterMonitor;
use crate::server::{Server, ServerRegistry, Status};
use crate::service::Service;
use crate::worker::ListenPoint;

/// Everything assembled from the configuration
pub struct Runtime {
    pub config: Config,
    pub servers: Arc<ServerRegistry>,
    pub services: Vec<Arc<Service>>,
    pub listen_points: Vec<ListenPoint>,
    pub monitors: Vec<ClusterMonitor>,
}

impl Runtime {
    pub fn build(config: Config) -> Result<Self> {
        let servers = Arc::new(ServerRegistry::new());
        for (name, server_config) in &config.servers {
            servers.insert(Server::new(name, server_config));
        }

        let mut services = Vec::new();
        for (name, service_config) in &config.services {
            let service = Service::from_config(name, service_config, &servers)?;
            info!(
                service = name,
                router = %service_config.router,
                servers = service_config.servers.len(),
                "Service configured"
            );
            services.push(service);
        }

        let mut listen_points = Vec::new();
        for (name, listener_config) in &config.listeners {
            let service = services
                .iter()
                .find(|s| s.name == listener_config.service)
                .cloned()
                .ok_or_else(|| {
                    ProxyError::Config(format!(
                        "listener '{}': unknown service '{}'",
                        name, listener_config.service
                    ))
                })?;

            let addr = format!("{}:{}", listener_config.address, listener_config.port);
            let listener = std::net::TcpListener::bind(&addr)
                .map_err(|e| ProxyError::Config(format!("listener '{}' on {}: {}", name, addr, e)))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| ProxyError::Config(format!("listener '{}': {}", name, e)))?;

            info!(listener = name, addr = %addr, service = %service.name, "Listener bound");
            listen_points.push(ListenPoint { listener, service });
        }

        let mut monitors = Vec::new();
        let mut monitored: Vec<String> = Vec::new();
        for (name, monitor_config) in &config.monitors {
            let bootstrap: Vec<Arc<Server>> = monitor_config
                .servers
                .iter()
                .filter_map(|n| servers.get(n))
                .collect();
            monitored.extend(monitor_config.servers.iter().cloned());

            monitors.push(ClusterMonitor::new(
                name,
                monitor_config.clone(),
                &config.global.datadir,
                servers.clone(),
                bootstrap,
                services.clone(),
            )?);
        }

        // Servers nothing monitors are taken at face value; without this
        // they would never become routable.
        for server in servers.all() {
            if !monitored.iter().any(|n| n == server.name()) {
                warn!(
                    server = %server.name(),
                    "Server is not monitored, assuming it is running"
                );
                server.set_status(Status::RUNNING | Status::MASTER);
            }
        }

        Ok(Self {
            config,
            servers,
            services,
            listen_points,
            monitors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_ini;

    fn build(text: &str) -> Result<Runtime> {
        Runtime::build(Config::from_sections(parse_ini(text).unwrap())?)
    }

    #[test]
    fn test_build_minimal() {
        let runtime = build(
            "\
[db1]
type=server
address=127.0.0.1
port=13306

[app]
type=service
router=readconn
servers=db1
user=proxy
password=pw

[app-listener]
type=listener
service=app
address=127.0.0.1
port=0
",
        )
        .unwrap();

        assert_eq!(runtime.services.len(), 1);
        assert_eq!(runtime.listen_points.len(), 1);
        // Unmonitored server is assumed running
        assert!(runtime.servers.get("db1").unwrap().is_running());
    }

    #[test]
    fn test_monitored_server_starts_down() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(&format!(
            "\
[bifrost]
datadir={}

[db1]
type=server
address=127.0.0.1
port=13306

[mon]
type=monitor
module=cluster
servers=db1
user=mon
",
            dir.path().display()
        ))
        .unwrap();

        assert_eq!(runtime.monitors.len(), 1);
        assert!(!runtime.servers.get("db1").unwrap().is_running());
    }
}
