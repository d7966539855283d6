//! Synchronization module for snapshot-driven client state.
//!
//! The remote service only answers request/response calls, so this module
//! builds an event stream out of periodic snapshots:
//! - Wire normalization of heterogeneous response shapes
//! - Optimistic pairing requests with provisional ids, TTL expiry and rollback
//! - Reconciliation of each snapshot against previously known state
//! - A synchronous event bus for UI collaborators
//! - The polling loop and the client facade tying it together

pub mod client;
pub mod events;
pub mod pending;
pub mod poller;
pub mod protocol;
pub mod reconciler;

pub use client::{
    PairingRequestResult, PairingResponseResult, ReconnectOutcome, SyncClient,
};
pub use events::{EngineEvent, EventBus, EventKind, SubscriptionId};
pub use pending::{PairingRequest, PendingStore, RequestOrigin, RequestState};
pub use reconciler::{Reconciler, SessionState};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::storage::StorageError;
use crate::transport::TransportError;

/// Unique identifier for a user
pub type UserId = String;

/// Unique identifier for a pairing request (provisional or server-issued)
pub type RequestId = String;

/// Unique identifier for a game session
pub type SessionId = String;

/// Unique identifier for a formed pair of users
pub type CoupleId = String;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The service rejected the identity
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Network or HTTP failure on any call
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The call went through but the service reported a logical failure
    #[error("Application error: {0}")]
    Application(String),

    /// A pairing request addressed to ourselves
    #[error("Cannot send a pairing request to yourself ({0})")]
    SelfTarget(UserId),

    /// Operation requires a connected identity
    #[error("Not connected")]
    NotConnected,

    /// Settings or credential persistence failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Short machine-readable label used in telemetry records
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Auth(_) => "auth",
            EngineError::Transport(_) => "transport",
            EngineError::Application(_) => "application",
            EngineError::SelfTarget(_) => "self_target",
            EngineError::NotConnected => "not_connected",
            EngineError::Storage(_) => "storage",
        }
    }
}

/// Lower bound for the optimistic request TTL
pub const MIN_OPTIMISTIC_TTL: Duration = Duration::from_secs(5);

/// Lower bound for the poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lower bound for the telemetry flush interval
pub const MIN_TELEMETRY_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime settings, persisted across restarts by the settings store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// How long an unconfirmed optimistic request stays visible
    pub optimistic_ttl: Duration,
    /// Delay between two snapshot polls
    pub poll_interval: Duration,
    /// Window in which an empty server list is not trusted over fresh local entries
    pub grace_window: Duration,
    /// Number of buffered telemetry records that triggers a flush
    pub telemetry_flush_size: usize,
    /// Fallback flush period for the telemetry buffer
    pub telemetry_flush_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            optimistic_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            grace_window: Duration::from_secs(2),
            telemetry_flush_size: 50,
            telemetry_flush_interval: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimistic_ttl(mut self, ttl: Duration) -> Self {
        self.optimistic_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.grace_window = window;
        self
    }

    pub fn with_telemetry_flush_size(mut self, size: usize) -> Self {
        self.telemetry_flush_size = size;
        self
    }

    pub fn with_telemetry_flush_interval(mut self, interval: Duration) -> Self {
        self.telemetry_flush_interval = interval;
        self
    }

    /// Apply the floors every setting must respect
    pub fn clamped(mut self) -> Self {
        self.optimistic_ttl = self.optimistic_ttl.max(MIN_OPTIMISTIC_TTL);
        self.poll_interval = self.poll_interval.max(MIN_POLL_INTERVAL);
        self.telemetry_flush_size = self.telemetry_flush_size.max(1);
        self.telemetry_flush_interval = self
            .telemetry_flush_interval
            .max(MIN_TELEMETRY_FLUSH_INTERVAL);
        // The grace window must stay shorter than the TTL, otherwise an
        // expired request could be resurrected by the anti-flicker rule.
        if self.grace_window >= self.optimistic_ttl {
            self.grace_window = self.optimistic_ttl / 2;
        }
        self
    }
}

/// Counters kept by the client and published with `metricsUpdated`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub polls_skipped: u64,
    pub fallback_polls: u64,
    pub requests_expired: u64,
    pub optimistic_rollbacks: u64,
}
