use crate::protocol::ErrPacket;

/// ER_HOST_IS_BLOCKED: the backend refuses connections from this host.
/// The affected server is placed in maintenance until an admin intervenes.
pub const ER_HOST_IS_BLOCKED: u16 = 1129;

/// How a failure should be treated by the layer above: transient errors may
/// be retried on another endpoint, permanent ones fail the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Proxy error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed packet: {0}")]
    BadPacket(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection init query '{query}' returned {outcome}")]
    InitQueryFailed { query: String, outcome: String },

    #[error("{0}")]
    Transient(String),

    #[error("backend connection unavailable")]
    Unavailable,

    #[error("host blocked by backend: {0}")]
    HostBlocked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::BadPacket(_) | ProxyError::Transient(_) | ProxyError::Io(_) => {
                ErrorKind::Transient
            }
            ProxyError::AuthFailed(_)
            | ProxyError::InitQueryFailed { .. }
            | ProxyError::Unavailable
            | ProxyError::HostBlocked(_)
            | ProxyError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// The single ERR packet a client sees for this failure. Unless a
    /// server-supplied code is known, errors surface as 2003.
    pub fn to_err_packet(&self) -> ErrPacket {
        match self {
            ProxyError::AuthFailed(msg) => ErrPacket::new(1045, "28000", msg.clone()),
            ProxyError::HostBlocked(msg) => ErrPacket::new(ER_HOST_IS_BLOCKED, "HY000", msg.clone()),
            other => ErrPacket::lost_connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ProxyError::BadPacket("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(ProxyError::Transient("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(ProxyError::AuthFailed("x".into()).kind(), ErrorKind::Permanent);
        assert_eq!(
            ProxyError::InitQueryFailed {
                query: "SET NAMES utf8".into(),
                outcome: "an error packet".into()
            }
            .kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_client_facing_error_code() {
        let err = ProxyError::Transient("connection reset".into());
        assert_eq!(err.to_err_packet().code, 2003);

        let err = ProxyError::AuthFailed("Access denied".into());
        assert_eq!(err.to_err_packet().code, 1045);
    }
}
