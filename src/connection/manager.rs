//! Connection manager: connect, reconnect, disconnect and logout.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{ConnectionState, Credentials, Identity, ReconnectOutcome};
use crate::storage::SettingsStore;
use crate::sync::protocol::{self, ConnectReply, ReconnectReply};
use crate::sync::{EngineError, EngineResult};
use crate::transport::Transport;

/// Owns the identity and its lifecycle against the service
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    store: Option<SettingsStore>,
    identity: RwLock<Option<Identity>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, store: Option<SettingsStore>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            store,
            identity: RwLock::new(None),
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    /// Returns true if the state actually changed
    fn set_state(&self, state: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    fn identity_from_reply(reply: ConnectReply, fallback_name: &str) -> Identity {
        Identity {
            user_id: reply.user_id,
            connection_id: reply
                .connection_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            auth_token: reply.auth_token,
            display_name: reply
                .display_name
                .unwrap_or_else(|| fallback_name.to_string()),
        }
    }

    fn persist_credentials(&self, credentials: &Credentials) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_credentials(credentials) {
                error!("Failed to persist credentials: {}", e);
            }
        }
    }

    fn forget_credentials(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_credentials() {
                error!("Failed to clear stored credentials: {}", e);
            }
        }
    }

    /// Credentials persisted by a previous connection, if any
    pub fn stored_credentials(&self) -> Option<Credentials> {
        let store = self.store.as_ref()?;
        match store.load_credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("Failed to load stored credentials: {}", e);
                None
            }
        }
    }

    /// Register a fresh identity
    pub async fn connect(&self, display_name: &str) -> EngineResult<Identity> {
        self.set_state(ConnectionState::Connecting);

        let result = match self.transport.connect(display_name).await {
            Ok(value) => protocol::parse_connect_reply(&value),
            Err(e) if e.is_auth_rejection() => Err(EngineError::Auth(e.to_string())),
            Err(e) => Err(EngineError::Transport(e)),
        };

        match result {
            Ok(reply) => {
                let identity = Self::identity_from_reply(reply, display_name);
                self.persist_credentials(&identity.credentials());
                *self.identity.write() = Some(identity.clone());
                self.set_state(ConnectionState::Connected);
                info!("Connected as {} ({})", identity.display_name, identity.user_id);
                Ok(identity)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.restore_state_after_failure();
                Err(e)
            }
        }
    }

    /// Resume an identity with a user id and token
    pub async fn reconnect(&self, user_id: &str, auth_token: &str) -> EngineResult<ReconnectOutcome> {
        self.set_state(ConnectionState::Reconnecting);

        let reply = match self.transport.reconnect(user_id, auth_token).await {
            Ok(value) => protocol::parse_reconnect_reply(&value),
            Err(e) if e.is_auth_rejection() => ReconnectReply::Rejected(e.to_string()),
            Err(e) => {
                warn!("Reconnect of {} failed: {}", user_id, e);
                self.restore_state_after_failure();
                return Err(EngineError::Transport(e));
            }
        };

        match reply {
            ReconnectReply::Accepted(reply) if reply.user_id != user_id => {
                warn!(
                    "Reconnect of {} answered for a different user {}",
                    user_id, reply.user_id
                );
                self.forget_credentials();
                *self.identity.write() = None;
                self.set_state(ConnectionState::Disconnected);
                Ok(ReconnectOutcome::StaleToken(user_id.to_string()))
            }
            ReconnectReply::Accepted(reply) => {
                let identity = Self::identity_from_reply(reply, user_id);
                self.persist_credentials(&identity.credentials());
                *self.identity.write() = Some(identity.clone());
                self.set_state(ConnectionState::Connected);
                info!("Resumed identity {}", identity.user_id);
                Ok(ReconnectOutcome::Resumed(identity))
            }
            ReconnectReply::Rejected(reason) => {
                info!("Reconnect of {} rejected: {}", user_id, reason);
                self.forget_credentials();
                *self.identity.write() = None;
                self.set_state(ConnectionState::Disconnected);
                Ok(ReconnectOutcome::InvalidToken)
            }
        }
    }

    /// Back to `Connected` when an identity is still held, else `Disconnected`
    fn restore_state_after_failure(&self) {
        let state = if self.identity.read().is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(state);
    }

    /// Drop the identity, keeping credentials for a later resume.
    /// Returns the identity that was connected, if any.
    pub async fn disconnect(&self) -> Option<Identity> {
        let identity = self.identity.write().take();
        if let Some(identity) = &identity {
            if let Err(e) = self.transport.disconnect(identity).await {
                warn!("Disconnect notification failed: {}", e);
            }
            info!("Disconnected {}", identity.user_id);
        }
        self.set_state(ConnectionState::Disconnected);
        identity
    }

    /// Drop the identity and forget its credentials
    pub async fn logout(&self) -> Option<Identity> {
        let identity = self.identity.write().take();
        let token = identity
            .as_ref()
            .map(|i| i.auth_token.clone())
            .or_else(|| self.stored_credentials().map(|c| c.auth_token));

        if let Some(token) = token {
            if let Err(e) = self.transport.logout(&token).await {
                warn!("Logout notification failed: {}", e);
            }
        }
        self.forget_credentials();
        self.set_state(ConnectionState::Disconnected);
        if let Some(identity) = &identity {
            info!("Logged out {}", identity.user_id);
        }
        identity
    }
}
