use crate::protocol::status_flags::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};

/// Transaction state bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrxState(pub u32);

impl TrxState {
    pub const INACTIVE: u32 = 0;
    pub const ACTIVE: u32 = 1 << 0;
    pub const READ_ONLY: u32 = 1 << 1;

    pub fn is_active(self) -> bool {
        self.0 & Self::ACTIVE != 0
    }

    pub fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }
}

/// Session state visible to routers
#[derive(Debug, Clone)]
pub struct SessionState {
    pub username: String,
    pub database: Option<String>,
    pub trx: TrxState,
    pub autocommit: bool,
    /// Capability mask the client negotiated
    pub capabilities: u32,
    pub charset: u8,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            username: String::new(),
            database: None,
            trx: TrxState::default(),
            autocommit: true,
            capabilities: 0,
            charset: 0x21,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capabilities = capabilities;
        self.charset = charset;
    }

    /// Fold the status flags of a completed reply into the session state
    pub fn update_from_server_status(&mut self, status: u16) {
        if status == 0 {
            return;
        }
        self.autocommit = status & SERVER_STATUS_AUTOCOMMIT != 0;
        if status & SERVER_STATUS_IN_TRANS != 0 {
            self.trx = TrxState(TrxState::ACTIVE);
        } else {
            self.trx = TrxState(TrxState::INACTIVE);
        }
    }

    /// Apply a session-track transaction state string ("trx_state"), which
    /// marks read-only transactions that status flags cannot express.
    pub fn update_from_trx_characteristics(&mut self, value: &str) {
        if value.contains("READ ONLY") {
            self.trx = TrxState(TrxState::ACTIVE | TrxState::READ_ONLY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trx_from_status_flags() {
        let mut state = SessionState::new();
        assert!(!state.trx.is_active());

        state.update_from_server_status(SERVER_STATUS_IN_TRANS | SERVER_STATUS_AUTOCOMMIT);
        assert!(state.trx.is_active());
        assert!(state.autocommit);

        state.update_from_server_status(SERVER_STATUS_AUTOCOMMIT);
        assert!(!state.trx.is_active());
    }

    #[test]
    fn test_read_only_trx() {
        let mut state = SessionState::new();
        state.update_from_server_status(SERVER_STATUS_IN_TRANS);
        state.update_from_trx_characteristics("START TRANSACTION READ ONLY;");
        assert!(state.trx.is_active());
        assert!(state.trx.is_read_only());
    }

    #[test]
    fn test_zero_status_ignored() {
        let mut state = SessionState::new();
        state.update_from_server_status(SERVER_STATUS_IN_TRANS);
        state.update_from_server_status(0);
        assert!(state.trx.is_active());
    }
}
