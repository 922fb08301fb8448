mod conn;
mod reply;
mod tls;

pub use conn::{AuthData, BackendConnection, BackendSettings, ConnState, WriteFlags};
pub use reply::{Reply, ReplyState, ReplyTracker};
