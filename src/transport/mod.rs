//! Transport layer for talking to the remote game service.
//!
//! The service is a plain request/response API. Every call returns the raw
//! JSON body; interpreting it (field names, envelopes, application-level
//! failure flags) is the job of [`crate::sync::protocol`], so a transport only
//! has to distinguish "the call failed" from "the call returned a body".
//!
//! Two implementations are provided:
//! - [`HttpTransport`] talks to the real service over HTTP
//! - [`MemoryTransport`] simulates the service in memory for tests and demos

mod http;
mod memory;

pub use http::{HttpTransport, HttpTransportConfig};
pub use memory::{MemoryCall, MemoryTransport};

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::Identity;

/// Result type for transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures of the transport itself, as opposed to logical failures reported
/// inside a successful response body
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Endpoint not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether the endpoint itself is missing, rather than the call failing
    pub fn is_endpoint_unavailable(&self) -> bool {
        match self {
            TransportError::Unsupported(_) => true,
            TransportError::Http { status, .. } => matches!(status, 404 | 405 | 501),
            _ => false,
        }
    }

    /// Whether the service refused the credentials at the HTTP level
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, TransportError::Http { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Outbound calls the engine makes against the service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a fresh identity
    async fn connect(&self, display_name: &str) -> TransportResult<Value>;

    /// Resume an identity from stored credentials
    async fn reconnect(&self, user_id: &str, auth_token: &str) -> TransportResult<Value>;

    async fn disconnect(&self, identity: &Identity) -> TransportResult<Value>;

    async fn logout(&self, auth_token: &str) -> TransportResult<Value>;

    async fn list_peers(&self, identity: &Identity) -> TransportResult<Value>;

    async fn list_pairing_requests(&self, identity: &Identity) -> TransportResult<Value>;

    async fn request_pairing(&self, identity: &Identity, target_id: &str)
        -> TransportResult<Value>;

    async fn respond_pairing(
        &self,
        identity: &Identity,
        request_id: &str,
        approve: bool,
    ) -> TransportResult<Value>;

    async fn cancel_pairing(&self, identity: &Identity, target_id: &str) -> TransportResult<Value>;

    /// Aggregated read of everything relevant to one identity
    async fn snapshot(&self, identity: &Identity) -> TransportResult<Value>;

    /// Status, partner and session of one identity
    async fn user_status(&self, identity: &Identity) -> TransportResult<Value>;

    async fn start_session(&self, identity: &Identity) -> TransportResult<Value>;

    async fn end_session(&self, identity: &Identity, session_id: &str) -> TransportResult<Value>;

    async fn draw_card(
        &self,
        identity: &Identity,
        session_id: &str,
        content: &str,
    ) -> TransportResult<Value>;
}
