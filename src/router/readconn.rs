//! Round-robin connection router.
//!
//! Each session is pinned to one backend chosen round-robin from the
//! candidates matching the configured target mode. All commands of the
//! session go to that backend; on a transient error the next candidate is
//! tried.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::backend::Reply;
use crate::error::{ErrorKind, ProxyError, Result};
use crate::server::{Rank, Server};
use crate::session::SessionState;

use super::{ClientCommand, ErrorAction, Router, RouterSession, Target};

/// Which servers qualify as session targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TargetMode {
    /// Any running server
    #[default]
    Running,
    /// Only the master
    Master,
    /// Prefer slaves, fall back to the master
    Slave,
}

pub struct ReadConnRouter {
    mode: TargetMode,
    next: AtomicUsize,
}

impl ReadConnRouter {
    pub fn new() -> Self {
        Self {
            mode: TargetMode::Running,
            next: AtomicUsize::new(0),
        }
    }

    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let mode = match options.get("router_options").map(String::as_str) {
            None | Some("running") => TargetMode::Running,
            Some("master") => TargetMode::Master,
            Some("slave") => TargetMode::Slave,
            Some(other) => {
                return Err(ProxyError::Config(format!(
                    "readconn: unknown router_options value '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            mode,
            next: AtomicUsize::new(0),
        })
    }

    /// Candidates for a new session: usable, not draining, filtered by mode,
    /// restricted to the best available rank tier.
    fn eligible(&self, candidates: &[Arc<Server>]) -> Vec<Arc<Server>> {
        let matching: Vec<_> = candidates
            .iter()
            .filter(|s| s.is_usable() && !s.is_draining())
            .filter(|s| match self.mode {
                TargetMode::Running => true,
                TargetMode::Master => s.is_master(),
                TargetMode::Slave => !s.is_master(),
            })
            .cloned()
            .collect();

        let matching = if matching.is_empty() && self.mode == TargetMode::Slave {
            // No slaves available: the master serves reads
            candidates
                .iter()
                .filter(|s| s.is_usable() && !s.is_draining() && s.is_master())
                .cloned()
                .collect()
        } else {
            matching
        };

        let best_rank = if matching.iter().any(|s| s.rank == Rank::Primary) {
            Rank::Primary
        } else {
            Rank::Secondary
        };

        matching.into_iter().filter(|s| s.rank == best_rank).collect()
    }
}

impl Default for ReadConnRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for ReadConnRouter {
    fn name(&self) -> &'static str {
        "readconn"
    }

    fn new_session(&self, candidates: Vec<Arc<Server>>) -> Box<dyn RouterSession> {
        let eligible = self.eligible(&candidates);
        let start = if eligible.is_empty() {
            0
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % eligible.len()
        };

        // Rotate so each session starts at the round-robin point but can
        // still fall through the rest on retry.
        let mut ordered = eligible;
        ordered.rotate_left(start);

        debug!(
            candidates = ordered.len(),
            "readconn session candidates selected"
        );

        Box::new(ReadConnSession {
            candidates: ordered,
            current: 0,
        })
    }
}

struct ReadConnSession {
    candidates: Vec<Arc<Server>>,
    current: usize,
}

impl RouterSession for ReadConnSession {
    fn choose_target(
        &mut self,
        _command: &ClientCommand<'_>,
        _state: &SessionState,
    ) -> Option<Target> {
        // Skip candidates that went down since session start
        while self.current < self.candidates.len() {
            let server = &self.candidates[self.current];
            if server.is_usable() && !server.is_draining() {
                return Some(Target::One(server.clone()));
            }
            self.current += 1;
        }
        None
    }

    fn on_reply(&mut self, _server: &Arc<Server>, _reply: &Reply) {}

    fn on_error(&mut self, server: &Arc<Server>, kind: ErrorKind) -> ErrorAction {
        if kind == ErrorKind::Transient && self.current + 1 < self.candidates.len() {
            debug!(server = %server.name(), "Transient backend error, trying next candidate");
            self.current += 1;
            ErrorAction::Retry
        } else {
            ErrorAction::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::{Command, Packet};
    use crate::server::Status;

    fn running_server(name: &str) -> Arc<Server> {
        let server = Server::new(name, &ServerConfig::for_address("h", 3306));
        server.set_status(Status::RUNNING);
        server
    }

    fn choose(session: &mut Box<dyn RouterSession>) -> Option<Target> {
        let packet = Packet::new(0, vec![0x03, b'S']);
        let command = ClientCommand {
            command: Command::Query,
            packet: &packet,
        };
        session.choose_target(&command, &SessionState::new())
    }

    #[test]
    fn test_round_robin_spread() {
        let router = ReadConnRouter::new();
        let servers = vec![running_server("a"), running_server("b"), running_server("c")];

        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut session = router.new_session(servers.clone());
            match choose(&mut session) {
                Some(Target::One(s)) => seen.push(s.name().to_string()),
                other => panic!("expected single target, got {:?}", other.is_some()),
            }
        }

        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[test]
    fn test_draining_servers_skipped() {
        let router = ReadConnRouter::new();
        let draining = running_server("draining");
        draining.set_status(Status::DRAINING);
        let healthy = running_server("healthy");

        for _ in 0..4 {
            let mut session = router.new_session(vec![draining.clone(), healthy.clone()]);
            match choose(&mut session) {
                Some(Target::One(s)) => assert_eq!(s.name(), "healthy"),
                _ => panic!("expected target"),
            }
        }
    }

    #[test]
    fn test_no_usable_servers() {
        let router = ReadConnRouter::new();
        let down = Server::new("down", &ServerConfig::for_address("h", 3306));
        let mut session = router.new_session(vec![down]);
        assert!(choose(&mut session).is_none());
    }

    #[test]
    fn test_transient_error_retries_next() {
        let router = ReadConnRouter::new();
        let servers = vec![running_server("a"), running_server("b")];
        let mut session = router.new_session(servers.clone());

        let first = match choose(&mut session) {
            Some(Target::One(s)) => s,
            _ => panic!(),
        };

        assert_eq!(
            session.on_error(&first, ErrorKind::Transient),
            ErrorAction::Retry
        );
        let second = match choose(&mut session) {
            Some(Target::One(s)) => s,
            _ => panic!(),
        };
        assert_ne!(first.name(), second.name());

        // Permanent errors always fail
        assert_eq!(
            session.on_error(&second, ErrorKind::Permanent),
            ErrorAction::Fail
        );
    }

    #[test]
    fn test_secondary_rank_only_as_fallback() {
        let router = ReadConnRouter::new();
        let primary = running_server("primary");
        let secondary = Server::new(
            "secondary",
            &ServerConfig {
                rank: Rank::Secondary,
                ..ServerConfig::for_address("h", 3306)
            },
        );
        secondary.set_status(Status::RUNNING);

        let mut session = router.new_session(vec![secondary.clone(), primary.clone()]);
        match choose(&mut session) {
            Some(Target::One(s)) => assert_eq!(s.name(), "primary"),
            _ => panic!(),
        }

        primary.clear_status(Status::RUNNING);
        let mut session = router.new_session(vec![secondary, primary]);
        match choose(&mut session) {
            Some(Target::One(s)) => assert_eq!(s.name(), "secondary"),
            _ => panic!(),
        }
    }
}
