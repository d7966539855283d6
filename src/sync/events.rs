//! Engine events and the synchronous event bus.
//!
//! Subscribers register per [`EventKind`] and are invoked in registration
//! order, on the emitting thread. A panicking subscriber is logged and
//! skipped; the rest still run and the emitter never sees the panic.

use dashmap::DashMap;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

use super::pending::PairingRequest;
use super::protocol::{PartnerInfo, PeerInfo, SharedCard};
use super::{CoupleId, EngineMetrics, EngineSettings, SessionId, UserId};
use crate::connection::ConnectionState;
use crate::telemetry::MetricEvent;

/// Names subscribers register under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    PartnerUpdated,
    PeersUpdated,
    PairingRequestsUpdated,
    PairingRequestExpired,
    PairingFormed,
    SessionStarted,
    SessionEnded,
    CardDrawn,
    MetricsUpdated,
    SettingsUpdated,
    TelemetryBatch,
    ConnectionChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::PartnerUpdated,
        EventKind::PeersUpdated,
        EventKind::PairingRequestsUpdated,
        EventKind::PairingRequestExpired,
        EventKind::PairingFormed,
        EventKind::SessionStarted,
        EventKind::SessionEnded,
        EventKind::CardDrawn,
        EventKind::MetricsUpdated,
        EventKind::SettingsUpdated,
        EventKind::TelemetryBatch,
        EventKind::ConnectionChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PartnerUpdated => "partnerUpdated",
            EventKind::PeersUpdated => "peersUpdated",
            EventKind::PairingRequestsUpdated => "pairingRequestsUpdated",
            EventKind::PairingRequestExpired => "pairingRequestExpired",
            EventKind::PairingFormed => "pairingFormed",
            EventKind::SessionStarted => "sessionStarted",
            EventKind::SessionEnded => "sessionEnded",
            EventKind::CardDrawn => "cardDrawn",
            EventKind::MetricsUpdated => "metricsUpdated",
            EventKind::SettingsUpdated => "settingsUpdated",
            EventKind::TelemetryBatch => "telemetryBatch",
            EventKind::ConnectionChanged => "connectionChanged",
        }
    }

    /// Look a kind up by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine tells its subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum EngineEvent {
    PartnerUpdated {
        partner: Option<PartnerInfo>,
    },
    PeersUpdated {
        peers: Vec<PeerInfo>,
    },
    PairingRequestsUpdated {
        incoming: Vec<PairingRequest>,
        outgoing: Vec<PairingRequest>,
    },
    PairingRequestExpired {
        request: PairingRequest,
    },
    PairingFormed {
        couple_id: Option<CoupleId>,
        partner_id: Option<UserId>,
    },
    SessionStarted {
        session_id: SessionId,
    },
    SessionEnded {
        session_id: SessionId,
    },
    CardDrawn {
        session_id: SessionId,
        /// Zero-based position of the card on the shared table
        index: usize,
        card: SharedCard,
    },
    MetricsUpdated {
        metrics: EngineMetrics,
    },
    SettingsUpdated {
        settings: EngineSettings,
    },
    TelemetryBatch {
        records: Vec<MetricEvent>,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::PartnerUpdated { .. } => EventKind::PartnerUpdated,
            EngineEvent::PeersUpdated { .. } => EventKind::PeersUpdated,
            EngineEvent::PairingRequestsUpdated { .. } => EventKind::PairingRequestsUpdated,
            EngineEvent::PairingRequestExpired { .. } => EventKind::PairingRequestExpired,
            EngineEvent::PairingFormed { .. } => EventKind::PairingFormed,
            EngineEvent::SessionStarted { .. } => EventKind::SessionStarted,
            EngineEvent::SessionEnded { .. } => EventKind::SessionEnded,
            EngineEvent::CardDrawn { .. } => EventKind::CardDrawn,
            EngineEvent::MetricsUpdated { .. } => EventKind::MetricsUpdated,
            EngineEvent::SettingsUpdated { .. } => EventKind::SettingsUpdated,
            EngineEvent::TelemetryBatch { .. } => EventKind::TelemetryBatch,
            EngineEvent::ConnectionChanged { .. } => EventKind::ConnectionChanged,
        }
    }

    /// JSON form for collaborators outside Rust
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Handle returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber callback
pub type EventHandler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Synchronous publish/subscribe registry keyed by event kind
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription; false if it was not registered for `kind`
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        match self.subscribers.get_mut(&kind) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(sub, _)| *sub != id);
                handlers.len() != before
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    /// Invoke every subscriber of the event's kind, in registration order
    pub fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        // Snapshot the list so handlers can subscribe or unsubscribe re-entrantly
        let handlers: Vec<EventHandler> = match self.subscribers.get(&kind) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };

        trace!("Emitting {} to {} subscribers", kind, handlers.len());

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Subscriber for {} panicked: {}", kind, message);
            }
        }
    }

    pub fn emit_all<I>(&self, events: I)
    where
        I: IntoIterator<Item = EngineEvent>,
    {
        for event in events {
            self.emit(&event);
        }
    }
}
