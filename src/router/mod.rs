//! Router contract.
//!
//! A router is a factory producing one router-session per client session.
//! The runtime guarantees that all methods of a router-session are invoked
//! serially on the session's owning worker.

mod readconn;

pub use readconn::ReadConnRouter;

use std::sync::Arc;

use crate::backend::Reply;
use crate::config::ServiceConfig;
use crate::error::{ErrorKind, ProxyError, Result};
use crate::protocol::{Command, Packet};
use crate::server::Server;
use crate::session::SessionState;

/// Capabilities a router demands from the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterCaps(pub u32);

impl RouterCaps {
    /// Backend connections must negotiate session-state tracking
    pub const SESSION_TRACK: u32 = 1 << 0;
    /// Replies must be delivered as contiguous buffers
    pub const CONTIGUOUS_OUTPUT: u32 = 1 << 1;
    /// The runtime must track statement ids across backends
    pub const STMT_TRACKING: u32 = 1 << 2;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// A client command as seen by the router
#[derive(Debug)]
pub struct ClientCommand<'a> {
    pub command: Command,
    pub packet: &'a Packet,
}

/// Where a command should go
#[derive(Debug, Clone)]
pub enum Target {
    /// A single backend
    One(Arc<Server>),
    /// Fan out to several backends (session commands)
    All(Vec<Arc<Server>>),
}

/// What to do after a backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Try the next candidate endpoint
    Retry,
    /// Give up; the session fails
    Fail,
}

/// Per-session routing state
pub trait RouterSession: Send {
    /// Pick target backend(s) for a command. `None` means no usable target.
    fn choose_target(&mut self, command: &ClientCommand<'_>, state: &SessionState)
        -> Option<Target>;

    /// A complete reply arrived from `server`
    fn on_reply(&mut self, server: &Arc<Server>, reply: &Reply);

    /// A backend failed; decide whether the command can be retried elsewhere
    fn on_error(&mut self, server: &Arc<Server>, kind: ErrorKind) -> ErrorAction;

    /// Whether the session can be migrated to another worker right now
    fn is_movable(&self) -> bool {
        true
    }
}

/// Router factory, one per configured service
pub trait Router: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> RouterCaps {
        RouterCaps::default()
    }

    /// Create routing state for a new client session over `candidates`
    fn new_session(&self, candidates: Vec<Arc<Server>>) -> Box<dyn RouterSession>;
}

/// Instantiate the router module named in the service configuration
pub fn create_router(service: &ServiceConfig) -> Result<Arc<dyn Router>> {
    match service.router.as_str() {
        "readconn" | "readconnroute" => Ok(Arc::new(ReadConnRouter::from_options(
            &service.router_options,
        )?)),
        other => Err(ProxyError::Config(format!("unknown router module '{}'", other))),
    }
}
