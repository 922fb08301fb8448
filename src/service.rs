//! Services tie a router to a set of backend servers and carry the
//! account used both for client authentication and backend connections.
//! The client-side user database builder plugs in behind [`AuthVerifier`].

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::protocol::{password_hash, verify_auth_response};
use crate::router::{create_router, Router};
use crate::server::{Server, ServerRegistry};

/// Client credential verification seam.
///
/// The full implementation builds its account table from the backends
/// (including host patterns; a netmask pattern that cannot be parsed must
/// log and count as no-match). The built-in implementation verifies
/// against the service account only.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, username: &str, token: &[u8], scramble: &[u8], database: Option<&str>)
        -> bool;
}

/// Verifies clients against the service's own account
pub struct ServiceAuth {
    username: String,
    /// SHA1(SHA1(password)), what the server-side check needs
    double_hash: Vec<u8>,
    /// SHA1(password), what backend tokens are derived from
    password_sha1: Vec<u8>,
}

impl ServiceAuth {
    pub fn new(username: &str, password: &str) -> Self {
        let (double_hash, password_sha1) = if password.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let stage1 = password_hash(password);
            (Sha1::digest(stage1).to_vec(), stage1.to_vec())
        };

        Self {
            username: username.to_string(),
            double_hash,
            password_sha1,
        }
    }

    pub fn password_sha1(&self) -> &[u8] {
        &self.password_sha1
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl AuthVerifier for ServiceAuth {
    fn verify(
        &self,
        username: &str,
        token: &[u8],
        scramble: &[u8],
        _database: Option<&str>,
    ) -> bool {
        if username != self.username {
            return false;
        }
        if self.double_hash.is_empty() {
            return token.is_empty();
        }
        verify_auth_response(token, &self.double_hash, scramble)
    }
}

/// A configured service: router + servers + account. The server set can
/// grow at runtime when a monitor discovers new cluster nodes.
pub struct Service {
    pub name: String,
    pub config: ServiceConfig,
    pub router: Arc<dyn Router>,
    servers: parking_lot::RwLock<Vec<Arc<Server>>>,
    pub auth: ServiceAuth,
}

impl Service {
    pub fn from_config(
        name: &str,
        config: &ServiceConfig,
        registry: &ServerRegistry,
    ) -> Result<Arc<Self>> {
        let router = create_router(config)?;
        let servers = config
            .servers
            .iter()
            .filter_map(|n| registry.get(n))
            .collect();

        Ok(Arc::new(Self {
            name: name.to_string(),
            config: config.clone(),
            router,
            servers: parking_lot::RwLock::new(servers),
            auth: ServiceAuth::new(&config.user, &config.password),
        }))
    }

    /// Candidate servers for a new session, in configuration order
    pub fn candidates(&self) -> Vec<Arc<Server>> {
        self.servers.read().clone()
    }

    /// Whether this service routes to the named server
    pub fn uses_server(&self, name: &str) -> bool {
        self.servers.read().iter().any(|s| s.name() == name)
    }

    /// Add a monitor-discovered server to the routing candidates
    pub fn add_server(&self, server: Arc<Server>) {
        let mut servers = self.servers.write();
        if !servers.iter().any(|s| s.name() == server.name()) {
            servers.push(server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compute_auth_response;

    #[test]
    fn test_service_auth_accepts_valid_token() {
        let auth = ServiceAuth::new("app", "secret");
        let scramble = [9u8; 20];
        let token = compute_auth_response("secret", &scramble);

        assert!(auth.verify("app", &token, &scramble, None));
        assert!(!auth.verify("other", &token, &scramble, None));
        assert!(!auth.verify("app", &token, &[1u8; 20], None));
    }

    #[test]
    fn test_service_auth_empty_password() {
        let auth = ServiceAuth::new("app", "");
        assert!(auth.verify("app", &[], &[0u8; 20], None));
        assert!(!auth.verify("app", &[1u8; 20], &[0u8; 20], None));
    }
}
