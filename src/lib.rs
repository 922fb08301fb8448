//! bifrost: a cluster-aware MySQL/MariaDB proxy.
//!
//! Clients connect as if to a single database server. The proxy terminates
//! the wire protocol, routes each command to backend servers picked by the
//! service's router, and streams replies back. Routing workers own all
//! session I/O; a per-worker pool recycles authenticated backend
//! connections; a cluster monitor keeps server status bits current.

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod server;
pub mod service;
pub mod session;
pub mod worker;

pub use error::{ErrorKind, ProxyError, Result};
pub use runtime::Runtime;
