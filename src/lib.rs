//! Duo Sync - client engine for a two-person card prompt game
//!
//! The remote service only answers request/response calls. This crate turns
//! periodic snapshots of it into an event stream:
//! - Optimistic pairing requests with provisional ids, TTL expiry and rollback
//! - Snapshot reconciliation into partner, session and card events
//! - A synchronous event bus for UI collaborators
//! - Sled-backed persistence of settings and credentials

pub mod clock;
pub mod connection;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionState, Credentials, Identity};
pub use storage::{SettingsStore, StorageConfig};
pub use sync::client::SyncClientBuilder;
pub use sync::{
    EngineError, EngineEvent, EngineMetrics, EngineResult, EngineSettings, EventKind,
    PairingRequest, PairingRequestResult, PairingResponseResult, ReconnectOutcome, RequestState,
    SyncClient,
};
pub use transport::{HttpTransport, HttpTransportConfig, MemoryTransport, Transport};
