use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::server::Rank;

use super::Section;

const GLOBAL_SECTION: &str = "bifrost";

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Settings from the `[bifrost]` section
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Number of routing workers
    pub threads: usize,
    /// Directory for runtime state (persisted node stores)
    pub datadir: PathBuf,
    /// Samples in the per-worker load moving average
    pub rebalance_window: usize,
    /// Load-difference percentage that triggers a session move; 0 disables
    pub rebalance_threshold: u32,
    /// How often worker loads are sampled
    pub rebalance_period: Duration,
    /// Port for the metrics exporter; 0 disables
    pub metrics_port: u16,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            datadir: PathBuf::from("/var/lib/bifrost"),
            rebalance_window: 10,
            rebalance_threshold: 0,
            rebalance_period: Duration::from_secs(1),
            metrics_port: 0,
        }
    }
}

/// TLS settings for a backend server
#[derive(Debug, Clone, Default)]
pub struct SslConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub version: Option<String>,
    pub cert_verify_depth: u32,
    pub verify_peer_certificate: bool,
    pub verify_peer_host: bool,
}

/// A `type=server` section
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub socket: Option<String>,
    pub extra_port: u16,
    pub protocol: String,
    pub monitor_user: String,
    pub monitor_password: String,
    pub persist_pool_max: usize,
    pub persist_max_time: Duration,
    pub proxy_protocol: bool,
    pub priority: i64,
    pub rank: Rank,
    pub ssl: Option<SslConfig>,
    /// path -> max used percentage
    pub disk_space_threshold: HashMap<String, u8>,
}

impl ServerConfig {
    pub fn for_address(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            socket: None,
            extra_port: 0,
            protocol: "mariadb".to_string(),
            monitor_user: String::new(),
            monitor_password: String::new(),
            persist_pool_max: 0,
            persist_max_time: Duration::from_secs(0),
            proxy_protocol: false,
            priority: 0,
            rank: Rank::Primary,
            ssl: None,
            disk_space_threshold: HashMap::new(),
        }
    }

    fn from_section(name: &str, section: &Section) -> Result<Self> {
        let address = section.get("address").cloned().unwrap_or_default();
        let socket = section.get("socket").cloned();
        if address.is_empty() && socket.is_none() {
            return Err(ProxyError::Config(format!(
                "server '{}': either 'address' or 'socket' is required",
                name
            )));
        }

        let mut config = Self::for_address(&address, get_u16(section, "port", 3306)?);
        config.socket = socket;
        config.extra_port = get_u16(section, "extra_port", 0)?;
        if let Some(protocol) = section.get("protocol") {
            config.protocol = protocol.clone();
        }
        config.monitor_user = section.get("monitoruser").cloned().unwrap_or_default();
        config.monitor_password = section.get("monitorpw").cloned().unwrap_or_default();
        config.persist_pool_max = get_usize(section, "persistpoolmax", 0)?;
        config.persist_max_time = get_duration(section, "persistmaxtime", Duration::ZERO)?;
        config.proxy_protocol = get_bool(section, "proxy_protocol", false)?;
        config.priority = section
            .get("priority")
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| ProxyError::Config(format!("server '{}': bad priority '{}'", name, v)))
            })
            .transpose()?
            .unwrap_or(0);

        config.rank = match section.get("rank").map(String::as_str) {
            None | Some("primary") => Rank::Primary,
            Some("secondary") => Rank::Secondary,
            Some(other) => {
                return Err(ProxyError::Config(format!(
                    "server '{}': rank must be primary or secondary, got '{}'",
                    name, other
                )))
            }
        };

        if get_bool(section, "ssl", false)? {
            config.ssl = Some(SslConfig {
                cert: section.get("ssl_cert").map(PathBuf::from),
                key: section.get("ssl_key").map(PathBuf::from),
                ca_cert: section.get("ssl_ca_cert").map(PathBuf::from),
                version: section.get("ssl_version").cloned(),
                cert_verify_depth: get_usize(section, "ssl_cert_verify_depth", 9)? as u32,
                verify_peer_certificate: get_bool(section, "ssl_verify_peer_certificate", false)?,
                verify_peer_host: get_bool(section, "ssl_verify_peer_host", false)?,
            });
        }

        if let Some(thresholds) = section.get("disk_space_threshold") {
            config.disk_space_threshold = parse_disk_space_threshold(name, thresholds)?;
        }

        Ok(config)
    }
}

/// A `type=service` section
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub router: String,
    pub servers: Vec<String>,
    pub user: String,
    pub password: String,
    /// Queries run on every fresh backend connection, in order
    pub connection_init_sql: Vec<String>,
    /// Client idle timeout; zero disables
    pub connection_timeout: Duration,
    /// Client write-stall timeout; zero disables
    pub net_write_timeout: Duration,
    /// Whether backends should report session-state changes
    pub session_track: bool,
    /// Router-specific options, passed through to the router factory
    pub router_options: BTreeMap<String, String>,
}

impl ServiceConfig {
    fn from_section(name: &str, section: &Section) -> Result<Self> {
        let router = section
            .get("router")
            .cloned()
            .ok_or_else(|| ProxyError::Config(format!("service '{}': 'router' is required", name)))?;

        let servers = section
            .get("servers")
            .map(|csv| {
                csv.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let known = [
            "type",
            "router",
            "servers",
            "user",
            "password",
            "connection_init_sql",
            "connection_timeout",
            "net_write_timeout",
            "session_track",
        ];
        let router_options = section
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            router,
            servers,
            user: section.get("user").cloned().unwrap_or_default(),
            password: section.get("password").cloned().unwrap_or_default(),
            connection_init_sql: section
                .get("connection_init_sql")
                .map(|s| {
                    s.split(';')
                        .map(str::trim)
                        .filter(|q| !q.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            connection_timeout: get_duration(section, "connection_timeout", Duration::ZERO)?,
            net_write_timeout: get_duration(section, "net_write_timeout", Duration::ZERO)?,
            session_track: get_bool(section, "session_track", false)?,
            router_options,
        })
    }
}

/// A `type=monitor` section
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub module: String,
    pub servers: Vec<String>,
    pub user: String,
    pub password: String,
    pub monitor_interval: Duration,
    pub cluster_monitor_interval: Duration,
    pub health_check_threshold: u32,
    pub health_check_port: u16,
    pub dynamic_node_detection: bool,
}

impl MonitorConfig {
    fn from_section(name: &str, section: &Section) -> Result<Self> {
        let health_check_threshold = get_usize(section, "health_check_threshold", 2)? as u32;
        if health_check_threshold == 0 {
            return Err(ProxyError::Config(format!(
                "monitor '{}': health_check_threshold must be at least 1",
                name
            )));
        }

        Ok(Self {
            module: section.get("module").cloned().unwrap_or_else(|| "cluster".to_string()),
            servers: section
                .get("servers")
                .map(|csv| {
                    csv.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            user: section.get("user").cloned().unwrap_or_default(),
            password: section.get("password").cloned().unwrap_or_default(),
            monitor_interval: get_duration(section, "monitor_interval", Duration::from_secs(2))?,
            cluster_monitor_interval: get_duration(
                section,
                "cluster_monitor_interval",
                Duration::from_secs(60),
            )?,
            health_check_threshold,
            health_check_port: get_u16(section, "health_check_port", 3581)?,
            dynamic_node_detection: get_bool(section, "dynamic_node_detection", true)?,
        })
    }
}

/// A `type=listener` section
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub service: String,
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub socket: Option<String>,
}

impl ListenerConfig {
    fn from_section(name: &str, section: &Section) -> Result<Self> {
        let socket = section.get("socket").cloned();
        let port = get_u16(section, "port", 0)?;
        if section.get("port").is_none() && socket.is_none() {
            return Err(ProxyError::Config(format!(
                "listener '{}': either 'port' or 'socket' is required",
                name
            )));
        }

        Ok(Self {
            service: section.get("service").cloned().ok_or_else(|| {
                ProxyError::Config(format!("listener '{}': 'service' is required", name))
            })?,
            protocol: section
                .get("protocol")
                .cloned()
                .unwrap_or_else(|| "mariadb".to_string()),
            address: section
                .get("address")
                .cloned()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            socket,
        })
    }
}

/// The whole configuration: global settings plus named objects
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalConfig,
    pub servers: BTreeMap<String, ServerConfig>,
    pub services: BTreeMap<String, ServiceConfig>,
    pub monitors: BTreeMap<String, MonitorConfig>,
    pub listeners: BTreeMap<String, ListenerConfig>,
}

impl Config {
    pub(crate) fn from_sections(sections: Vec<(String, Section)>) -> Result<Self> {
        let mut config = Self {
            global: GlobalConfig::default(),
            servers: BTreeMap::new(),
            services: BTreeMap::new(),
            monitors: BTreeMap::new(),
            listeners: BTreeMap::new(),
        };

        for (name, section) in &sections {
            if name == GLOBAL_SECTION {
                config.global = parse_global(section)?;
                continue;
            }

            match section.get("type").map(String::as_str) {
                Some("server") => {
                    config
                        .servers
                        .insert(name.clone(), ServerConfig::from_section(name, section)?);
                }
                Some("service") => {
                    config
                        .services
                        .insert(name.clone(), ServiceConfig::from_section(name, section)?);
                }
                Some("monitor") => {
                    config
                        .monitors
                        .insert(name.clone(), MonitorConfig::from_section(name, section)?);
                }
                Some("listener") => {
                    config
                        .listeners
                        .insert(name.clone(), ListenerConfig::from_section(name, section)?);
                }
                Some(other) => {
                    return Err(ProxyError::Config(format!(
                        "section '{}': unknown type '{}'",
                        name, other
                    )))
                }
                None => {
                    return Err(ProxyError::Config(format!(
                        "section '{}': missing 'type'",
                        name
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            for server in &service.servers {
                if !self.servers.contains_key(server) {
                    return Err(ProxyError::Config(format!(
                        "service '{}': unknown server '{}'",
                        name, server
                    )));
                }
            }
        }

        for (name, monitor) in &self.monitors {
            for server in &monitor.servers {
                if !self.servers.contains_key(server) {
                    return Err(ProxyError::Config(format!(
                        "monitor '{}': unknown server '{}'",
                        name, server
                    )));
                }
            }
        }

        for (name, listener) in &self.listeners {
            if !self.services.contains_key(&listener.service) {
                return Err(ProxyError::Config(format!(
                    "listener '{}': unknown service '{}'",
                    name, listener.service
                )));
            }
        }

        if self.global.threads == 0 {
            return Err(ProxyError::Config("threads must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn parse_global(section: &Section) -> Result<GlobalConfig> {
    let mut global = GlobalConfig::default();
    global.threads = get_usize(section, "threads", global.threads)?;
    if let Some(dir) = section.get("datadir") {
        global.datadir = PathBuf::from(dir);
    }
    global.rebalance_window = get_usize(section, "rebalance_window", global.rebalance_window)?;
    global.rebalance_threshold =
        get_usize(section, "rebalance_threshold", global.rebalance_threshold as usize)? as u32;
    global.rebalance_period = get_duration(section, "rebalance_period", global.rebalance_period)?;
    global.metrics_port = get_u16(section, "metrics_port", global.metrics_port)?;
    Ok(global)
}

fn get_bool(section: &Section, key: &str, default: bool) -> Result<bool> {
    match section.get(key).map(String::as_str) {
        None => Ok(default),
        Some("true") | Some("yes") | Some("on") | Some("1") => Ok(true),
        Some("false") | Some("no") | Some("off") | Some("0") => Ok(false),
        Some(other) => Err(ProxyError::Config(format!("bad boolean '{}' for '{}'", other, key))),
    }
}

fn get_usize(section: &Section, key: &str, default: usize) -> Result<usize> {
    match section.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ProxyError::Config(format!("bad number '{}' for '{}'", v, key))),
    }
}

fn get_u16(section: &Section, key: &str, default: u16) -> Result<u16> {
    match section.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ProxyError::Config(format!("bad port '{}' for '{}'", v, key))),
    }
}

/// Durations accept a bare number of seconds or the suffixes ms, s, m, h
fn get_duration(section: &Section, key: &str, default: Duration) -> Result<Duration> {
    let Some(value) = section.get(key) else {
        return Ok(default);
    };

    let bad = || ProxyError::Config(format!("bad duration '{}' for '{}'", value, key));

    let (digits, unit): (&str, &str) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => (&value[..pos], value[pos..].trim()),
        None => (value.as_str(), "s"),
    };
    let n: u64 = digits.parse().map_err(|_| bad())?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(bad()),
    }
}

fn parse_disk_space_threshold(server: &str, spec: &str) -> Result<HashMap<String, u8>> {
    let mut out = HashMap::new();

    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (path, pct) = entry.split_once(':').ok_or_else(|| {
            ProxyError::Config(format!(
                "server '{}': disk_space_threshold entry '{}' is not path:pct",
                server, entry
            ))
        })?;
        let pct: u8 = pct.parse().ok().filter(|p| *p <= 100).ok_or_else(|| {
            ProxyError::Config(format!(
                "server '{}': disk_space_threshold percentage '{}' out of range",
                server, pct
            ))
        })?;
        out.insert(path.to_string(), pct);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_ini;

    fn load(text: &str) -> Result<Config> {
        Config::from_sections(parse_ini(text).unwrap())
    }

    const BASIC: &str = "\
[bifrost]
threads=2

[db1]
type=server
address=10.0.0.1
port=3306
persistpoolmax=5
persistmaxtime=300s
rank=secondary

[app]
type=service
router=readconn
servers=db1
user=proxy
password=secret
connection_init_sql=SET NAMES utf8; SET SQL_MODE=ANSI

[app-listener]
type=listener
service=app
port=4006

[cluster-mon]
type=monitor
module=cluster
servers=db1
user=mon
password=monpw
cluster_monitor_interval=30s
health_check_threshold=3
";

    #[test]
    fn test_full_config() {
        let config = load(BASIC).unwrap();
        assert_eq!(config.global.threads, 2);

        let db1 = &config.servers["db1"];
        assert_eq!(db1.address, "10.0.0.1");
        assert_eq!(db1.persist_pool_max, 5);
        assert_eq!(db1.persist_max_time, Duration::from_secs(300));
        assert_eq!(db1.rank, Rank::Secondary);

        let app = &config.services["app"];
        assert_eq!(app.router, "readconn");
        assert_eq!(app.connection_init_sql, vec!["SET NAMES utf8", "SET SQL_MODE=ANSI"]);

        let monitor = &config.monitors["cluster-mon"];
        assert_eq!(monitor.health_check_threshold, 3);
        assert_eq!(monitor.cluster_monitor_interval, Duration::from_secs(30));
        assert!(monitor.dynamic_node_detection);

        assert_eq!(config.listeners["app-listener"].port, 4006);
    }

    #[test]
    fn test_unknown_server_reference_rejected() {
        let text = "\
[svc]
type=service
router=readconn
servers=ghost
";
        assert!(load(text).is_err());
    }

    #[test]
    fn test_listener_requires_port_or_socket() {
        let text = "\
[svc]
type=service
router=readconn

[l]
type=listener
service=svc
";
        assert!(load(text).is_err());
    }

    #[test]
    fn test_disk_space_threshold_parse() {
        let parsed = parse_disk_space_threshold("db", "/data:80,/logs:90").unwrap();
        assert_eq!(parsed.get("/data"), Some(&80));
        assert_eq!(parsed.get("/logs"), Some(&90));
        assert!(parse_disk_space_threshold("db", "/data:120").is_err());
        assert!(parse_disk_space_threshold("db", "nocolon").is_err());
    }

    #[test]
    fn test_duration_suffixes() {
        let text = "\
[db1]
type=server
address=h
persistmaxtime=500ms
";
        let config = load(text).unwrap();
        assert_eq!(config.servers["db1"].persist_max_time, Duration::from_millis(500));
    }

    #[test]
    fn test_ssl_section() {
        let text = "\
[db1]
type=server
address=h
ssl=true
ssl_ca_cert=/etc/ssl/ca.pem
ssl_verify_peer_certificate=true
";
        let config = load(text).unwrap();
        let ssl = config.servers["db1"].ssl.as_ref().unwrap();
        assert_eq!(ssl.ca_cert.as_deref(), Some(std::path::Path::new("/etc/ssl/ca.pem")));
        assert!(ssl.verify_peer_certificate);
    }
}
