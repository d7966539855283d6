//! Identity and connection lifecycle.
//!
//! The connection manager owns the identity issued by the service (user id,
//! connection id, auth token) and the credentials persisted for resuming it.
//! Everything else only sees cloned, read-only copies.

mod manager;

pub use manager::ConnectionManager;

use serde::{Deserialize, Serialize};

use crate::sync::UserId;

/// Identity issued by the service on connect or reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub connection_id: String,
    pub auth_token: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
        auth_token: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            auth_token: auth_token.into(),
            display_name: display_name.into(),
        }
    }

    /// The resumable part of this identity
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.user_id, &self.auth_token)
    }
}

/// Minimal data needed to resume an identity later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: UserId,
    pub auth_token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Result of resuming an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Resumed(Identity),
    /// The stored token is no longer accepted; credentials were discarded
    InvalidToken,
    /// The token was answered for a different user; credentials were discarded
    StaleToken(UserId),
}

impl ReconnectOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            ReconnectOutcome::Resumed(identity) => Some(identity),
            ReconnectOutcome::InvalidToken | ReconnectOutcome::StaleToken(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_credentials() {
        let identity = Identity::new("U1", "conn-1", "tok", "Alice");
        assert_eq!(identity.credentials(), Credentials::new("U1", "tok"));
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Reconnecting.as_str(), "reconnecting");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_reconnect_outcome_identity() {
        let identity = Identity::new("U1", "conn-1", "tok", "Alice");
        assert_eq!(
            ReconnectOutcome::Resumed(identity.clone()).identity(),
            Some(&identity)
        );
        assert!(ReconnectOutcome::InvalidToken.identity().is_none());
    }
}
