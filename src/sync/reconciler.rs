//! Snapshot reconciliation.
//!
//! Turns each normalized snapshot into the list of events it implies, in a
//! fixed order:
//! 1. replay of the service's event log past the processed cursor
//! 2. session derivation from the snapshot itself
//! 3. partner and peer changes, by content signature
//! 4. implicit session end when the session disappears
//! 5. request expiry and merge
//! 6. newly drawn cards
//!
//! The reconciler is plain state plus pure functions of (state, snapshot,
//! time); the caller holds the lock and emits the returned events after
//! releasing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info};

use super::events::EngineEvent;
use super::pending::PendingStore;
use super::protocol::{
    DomainEvent, IdentityStatus, PartnerInfo, PeerInfo, PeerSnapshot, SessionInfo, SharedCard,
};
use super::{CoupleId, EngineSettings, SessionId, UserId};

/// What the engine knows about the running game session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub is_active: bool,
    pub card_cursor: u32,
    pub last_known_card_count: usize,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            is_active: true,
            card_cursor: 0,
            last_known_card_count: 0,
        }
    }

    fn discovered(info: &SessionInfo) -> Self {
        Self {
            session_id: info.session_id.clone(),
            is_active: info.is_active,
            card_cursor: info.card_cursor,
            last_known_card_count: info.cards.len(),
        }
    }
}

/// SHA-256 over the JSON form of a value
fn signature<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Known state of one session context, diffed against every snapshot
#[derive(Debug)]
pub struct Reconciler {
    /// Highest processed event sequence; `None` before the first snapshot
    event_cursor: Option<u64>,
    /// Couple id, or partner id when the service gave no couple id
    pairing_key: Option<String>,
    session: Option<SessionState>,
    ended_sessions: HashSet<SessionId>,
    partner: Option<PartnerInfo>,
    partner_signature: String,
    peers: Vec<PeerInfo>,
    peers_signature: String,
    identity_status: IdentityStatus,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            event_cursor: None,
            pairing_key: None,
            session: None,
            ended_sessions: HashSet::new(),
            partner: None,
            partner_signature: signature(&None::<PartnerInfo>),
            peers: Vec::new(),
            peers_signature: signature(&Vec::<PeerInfo>::new()),
            identity_status: IdentityStatus::default(),
        }
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    pub fn partner(&self) -> Option<&PartnerInfo> {
        self.partner.as_ref()
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn identity_status(&self) -> &IdentityStatus {
        &self.identity_status
    }

    pub fn event_cursor(&self) -> Option<u64> {
        self.event_cursor
    }

    /// Diff `snapshot` against known state, updating `store` along the way
    pub fn reconcile(
        &mut self,
        store: &mut PendingStore,
        snapshot: &PeerSnapshot,
        now: DateTime<Utc>,
        settings: &EngineSettings,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let mut requests_changed = false;

        // 1. Event log
        match self.event_cursor {
            None => {
                let baseline = snapshot.events.iter().map(|e| e.seq).max().unwrap_or(0);
                debug!("Event cursor baseline at {}", baseline);
                self.event_cursor = Some(baseline);
            }
            Some(start) => {
                let mut cursor = start;
                for logged in snapshot.events.iter().filter(move |e| e.seq > start) {
                    cursor = cursor.max(logged.seq);
                    match &logged.event {
                        DomainEvent::PairingFormed {
                            couple_id,
                            partner_id,
                        } => {
                            if let Some(event) =
                                self.record_pairing(couple_id.clone(), partner_id.clone())
                            {
                                requests_changed |= store.clear_outgoing();
                                events.push(event);
                            }
                        }
                        DomainEvent::SessionStarted { session_id } => {
                            if !self.ended_sessions.contains(session_id) {
                                events.extend(self.start_session(session_id));
                            }
                        }
                        DomainEvent::SessionEnded { session_id } => {
                            events.extend(self.end_session(Some(session_id)));
                            self.ended_sessions.insert(session_id.clone());
                        }
                    }
                }
                self.event_cursor = Some(cursor);
            }
        }

        // 2. Session derived from the snapshot
        let active = snapshot.active_session();
        if let Some(info) = active {
            let known = self.session.as_ref().map(|s| s.session_id.as_str());
            if known != Some(info.session_id.as_str())
                && !self.ended_sessions.contains(&info.session_id)
            {
                events.extend(self.end_session(None));
                info!("Discovered session {} from snapshot", info.session_id);
                self.session = Some(SessionState::discovered(info));
                events.push(EngineEvent::SessionStarted {
                    session_id: info.session_id.clone(),
                });
            }
        }

        // 3. Partner and peers
        let partner_signature = signature(&snapshot.partner);
        if partner_signature != self.partner_signature {
            self.partner_signature = partner_signature;
            self.partner = snapshot.partner.clone();
            events.push(EngineEvent::PartnerUpdated {
                partner: self.partner.clone(),
            });
        }

        let peers_signature = signature(&snapshot.peers);
        if peers_signature != self.peers_signature {
            self.peers_signature = peers_signature;
            self.peers = snapshot.peers.clone();
            events.push(EngineEvent::PeersUpdated {
                peers: self.peers.clone(),
            });
        }

        self.identity_status = snapshot.identity_status.clone();

        // 4. Session gone from the snapshot
        if active.is_none() {
            if let Some(event) = self.end_session(None) {
                info!("Session no longer listed, treating as ended");
                events.push(event);
            }
        }

        // 5. Requests
        let expired = store.expire(now, settings.optimistic_ttl);
        requests_changed |= !expired.is_empty();
        events.extend(
            expired
                .into_iter()
                .map(|request| EngineEvent::PairingRequestExpired { request }),
        );
        requests_changed |=
            store.merge_outgoing(&snapshot.outgoing_requests, now, settings.grace_window);
        requests_changed |= store.merge_incoming(&snapshot.incoming_requests, now);
        if requests_changed {
            events.push(requests_updated(store));
        }

        // 6. Cards
        if let (Some(state), Some(info)) = (self.session.as_mut(), active) {
            if state.session_id == info.session_id {
                let count = info.cards.len();
                if count > state.last_known_card_count {
                    for (index, card) in info
                        .cards
                        .iter()
                        .enumerate()
                        .skip(state.last_known_card_count)
                    {
                        events.push(EngineEvent::CardDrawn {
                            session_id: state.session_id.clone(),
                            index,
                            card: card.clone(),
                        });
                    }
                } else if count < state.last_known_card_count {
                    debug!(
                        "Shared cards shrank from {} to {}, resetting",
                        state.last_known_card_count, count
                    );
                }
                state.last_known_card_count = count;
                state.card_cursor = info.card_cursor;
                state.is_active = info.is_active;
            }
        }

        events
    }

    /// TTL evaluation alone, for ticks that produced no snapshot
    pub fn expire_only(
        &self,
        store: &mut PendingStore,
        now: DateTime<Utc>,
        settings: &EngineSettings,
    ) -> Vec<EngineEvent> {
        let expired = store.expire(now, settings.optimistic_ttl);
        if expired.is_empty() {
            return Vec::new();
        }
        let mut events: Vec<EngineEvent> = expired
            .into_iter()
            .map(|request| EngineEvent::PairingRequestExpired { request })
            .collect();
        events.push(requests_updated(store));
        events
    }

    /// Record a formed pairing; `None` if it was already known
    pub fn record_pairing(
        &mut self,
        couple_id: Option<CoupleId>,
        partner_id: Option<UserId>,
    ) -> Option<EngineEvent> {
        let key = couple_id.clone().or_else(|| partner_id.clone());
        if key.is_some() && key == self.pairing_key {
            return None;
        }
        self.pairing_key = key;
        info!("Pairing formed (couple {:?})", couple_id);
        Some(EngineEvent::PairingFormed {
            couple_id,
            partner_id,
        })
    }

    /// Track a newly started session; empty if it is already the known one
    pub fn start_session(&mut self, session_id: &str) -> Vec<EngineEvent> {
        if self.session.as_ref().map(|s| s.session_id.as_str()) == Some(session_id) {
            return Vec::new();
        }
        let mut events: Vec<EngineEvent> = self.end_session(None).into_iter().collect();
        self.ended_sessions.remove(session_id);
        self.session = Some(SessionState::new(session_id));
        info!("Session {} started", session_id);
        events.push(EngineEvent::SessionStarted {
            session_id: session_id.to_string(),
        });
        events
    }

    /// End the known session, or only when it matches `session_id`
    pub fn end_session(&mut self, session_id: Option<&SessionId>) -> Option<EngineEvent> {
        let matches = match (&self.session, session_id) {
            (Some(state), Some(id)) => &state.session_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }
        let state = self.session.take()?;
        self.ended_sessions.insert(state.session_id.clone());
        info!("Session {} ended", state.session_id);
        Some(EngineEvent::SessionEnded {
            session_id: state.session_id,
        })
    }

    /// Account for a card this client drew itself
    pub fn record_drawn_card(&mut self, card: SharedCard, total: Option<usize>) -> Option<EngineEvent> {
        let state = self.session.as_mut()?;
        let last = state.last_known_card_count;
        let new_total = total.unwrap_or(last + 1);
        if new_total <= last {
            return None;
        }
        state.last_known_card_count = new_total;
        Some(EngineEvent::CardDrawn {
            session_id: state.session_id.clone(),
            index: new_total - 1,
            card,
        })
    }
}

/// Current request lists as a `pairingRequestsUpdated` event
pub fn requests_updated(store: &PendingStore) -> EngineEvent {
    EngineEvent::PairingRequestsUpdated {
        incoming: store.incoming().to_vec(),
        outgoing: store.outgoing().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::EventKind;
    use crate::sync::protocol::{LoggedEvent, RemoteRequest};
    use crate::sync::pending::RequestState;
    use std::time::Duration;

    fn card(content: &str, author: &str) -> SharedCard {
        SharedCard {
            card_id: None,
            content: content.to_string(),
            drawn_by: Some(author.to_string()),
        }
    }

    fn session(id: &str, cards: Vec<SharedCard>) -> SessionInfo {
        SessionInfo {
            session_id: id.to_string(),
            is_active: true,
            card_cursor: 0,
            cards,
        }
    }

    fn partner(name: &str) -> PartnerInfo {
        PartnerInfo {
            user_id: "U2".to_string(),
            display_name: Some(name.to_string()),
            online: true,
            couple_id: Some("C1".to_string()),
        }
    }

    fn kinds(events: &[EngineEvent]) -> Vec<EventKind> {
        events.iter().map(EngineEvent::kind).collect()
    }

    struct Harness {
        reconciler: Reconciler,
        store: PendingStore,
        settings: EngineSettings,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                reconciler: Reconciler::new(),
                store: PendingStore::new(),
                settings: EngineSettings::default(),
                now: Utc::now(),
            }
        }

        fn feed(&mut self, snapshot: &PeerSnapshot) -> Vec<EngineEvent> {
            self.reconciler
                .reconcile(&mut self.store, snapshot, self.now, &self.settings)
        }

        fn advance(&mut self, millis: i64) {
            self.now += chrono::Duration::milliseconds(millis);
        }
    }

    #[test]
    fn test_same_snapshot_twice_is_silent() {
        let mut h = Harness::new();
        let snapshot = PeerSnapshot {
            partner: Some(partner("Bob")),
            session: Some(session("S1", vec![card("a", "U1")])),
            peers: vec![PeerInfo {
                user_id: "U3".to_string(),
                display_name: None,
                online: true,
            }],
            incoming_requests: vec![RemoteRequest {
                request_id: "R9".to_string(),
                requester_id: "U3".to_string(),
                target_id: "U1".to_string(),
                requester_name: None,
                created_at: None,
                state: RequestState::PendingConfirmed,
            }],
            ..Default::default()
        };

        let first = h.feed(&snapshot);
        assert!(!first.is_empty());

        h.advance(100);
        assert!(h.feed(&snapshot).is_empty());
    }

    #[test]
    fn test_null_partner_initially_emits_nothing() {
        let mut h = Harness::new();
        assert!(h.feed(&PeerSnapshot::default()).is_empty());
    }

    #[test]
    fn test_partner_change_by_content() {
        let mut h = Harness::new();
        let mut snapshot = PeerSnapshot {
            partner: Some(partner("Bob")),
            ..Default::default()
        };
        assert_eq!(kinds(&h.feed(&snapshot)), vec![EventKind::PartnerUpdated]);

        // Rebuilt but identical payload
        snapshot.partner = Some(partner("Bob"));
        assert!(h.feed(&snapshot).is_empty());

        snapshot.partner = Some(partner("Robert"));
        assert_eq!(kinds(&h.feed(&snapshot)), vec![EventKind::PartnerUpdated]);
    }

    #[test]
    fn test_session_absence_ends_session() {
        let mut h = Harness::new();
        let active = PeerSnapshot {
            session: Some(session("S1", vec![])),
            ..Default::default()
        };
        assert_eq!(kinds(&h.feed(&active)), vec![EventKind::SessionStarted]);

        let events = h.feed(&PeerSnapshot::default());

        assert_eq!(
            events,
            vec![EngineEvent::SessionEnded {
                session_id: "S1".to_string()
            }]
        );
        assert!(h.reconciler.session().is_none());

        // A lagging read must not resurrect it
        assert!(h.feed(&active).is_empty());
        assert!(h.reconciler.session().is_none());
    }

    #[test]
    fn test_one_card_drawn_per_new_card() {
        let mut h = Harness::new();
        let mut snapshot = PeerSnapshot {
            session: Some(session("S1", vec![card("one", "U1"), card("two", "U2")])),
            ..Default::default()
        };
        h.feed(&snapshot);

        snapshot.session = Some(session(
            "S1",
            vec![card("one", "U1"), card("two", "U2"), card("three", "U2")],
        ));
        let events = h.feed(&snapshot);

        assert_eq!(
            events,
            vec![EngineEvent::CardDrawn {
                session_id: "S1".to_string(),
                index: 2,
                card: card("three", "U2"),
            }]
        );
        assert_eq!(h.reconciler.session().unwrap().last_known_card_count, 3);
    }

    #[test]
    fn test_shrinking_cards_reset_silently() {
        let mut h = Harness::new();
        let mut snapshot = PeerSnapshot {
            session: Some(session("S1", vec![card("one", "U1"), card("two", "U2")])),
            ..Default::default()
        };
        h.feed(&snapshot);

        snapshot.session = Some(session("S1", vec![card("one", "U1")]));
        assert!(h.feed(&snapshot).is_empty());

        snapshot.session = Some(session("S1", vec![card("one", "U1"), card("new", "U1")]));
        assert_eq!(kinds(&h.feed(&snapshot)), vec![EventKind::CardDrawn]);
    }

    #[test]
    fn test_event_log_replay_after_baseline() {
        let mut h = Harness::new();
        let mut snapshot = PeerSnapshot {
            events: vec![LoggedEvent {
                seq: 4,
                event: DomainEvent::SessionStarted {
                    session_id: "S0".to_string(),
                },
            }],
            ..Default::default()
        };
        // First snapshot only sets the cursor
        assert!(h.feed(&snapshot).is_empty());
        assert_eq!(h.reconciler.event_cursor(), Some(4));

        snapshot.events.push(LoggedEvent {
            seq: 5,
            event: DomainEvent::PairingFormed {
                couple_id: Some("C1".to_string()),
                partner_id: Some("U2".to_string()),
            },
        });
        snapshot.events.push(LoggedEvent {
            seq: 6,
            event: DomainEvent::SessionStarted {
                session_id: "S1".to_string(),
            },
        });
        snapshot.session = Some(session("S1", vec![]));

        let events = h.feed(&snapshot);
        assert_eq!(
            kinds(&events),
            vec![EventKind::PairingFormed, EventKind::SessionStarted]
        );
        assert_eq!(h.reconciler.event_cursor(), Some(6));

        // Replaying the same log is a no-op
        assert!(h.feed(&snapshot).is_empty());
    }

    #[test]
    fn test_replay_filters_against_starting_cursor() {
        let mut h = Harness::new();
        h.feed(&PeerSnapshot {
            events: vec![LoggedEvent {
                seq: 2,
                event: DomainEvent::SessionStarted {
                    session_id: "S0".to_string(),
                },
            }],
            ..Default::default()
        });

        // Newer entries listed out of order are all replayed
        let snapshot = PeerSnapshot {
            events: vec![
                LoggedEvent {
                    seq: 9,
                    event: DomainEvent::SessionEnded {
                        session_id: "S7".to_string(),
                    },
                },
                LoggedEvent {
                    seq: 3,
                    event: DomainEvent::PairingFormed {
                        couple_id: Some("C1".to_string()),
                        partner_id: Some("U2".to_string()),
                    },
                },
            ],
            ..Default::default()
        };
        let events = h.feed(&snapshot);
        assert_eq!(kinds(&events), vec![EventKind::PairingFormed]);
        assert_eq!(h.reconciler.event_cursor(), Some(9));
    }

    #[test]
    fn test_replayed_pairing_dedupes_against_direct_result() {
        let mut h = Harness::new();
        h.feed(&PeerSnapshot::default());
        assert!(h
            .reconciler
            .record_pairing(Some("C1".to_string()), Some("U2".to_string()))
            .is_some());

        let snapshot = PeerSnapshot {
            events: vec![LoggedEvent {
                seq: 1,
                event: DomainEvent::PairingFormed {
                    couple_id: Some("C1".to_string()),
                    partner_id: None,
                },
            }],
            ..Default::default()
        };
        assert!(h.feed(&snapshot).is_empty());
    }

    #[test]
    fn test_ended_event_blocks_fallback_derivation() {
        let mut h = Harness::new();
        h.feed(&PeerSnapshot::default());

        let snapshot = PeerSnapshot {
            session: Some(session("S1", vec![])),
            events: vec![LoggedEvent {
                seq: 1,
                event: DomainEvent::SessionEnded {
                    session_id: "S1".to_string(),
                },
            }],
            ..Default::default()
        };
        assert!(h.feed(&snapshot).is_empty());
        assert!(h.reconciler.session().is_none());
    }

    #[test]
    fn test_expiry_emits_once_then_updates_list() {
        let mut h = Harness::new();
        h.store.insert_optimistic("U1", "U2", h.now);

        h.advance(29_000);
        assert!(h.feed(&PeerSnapshot::default()).is_empty());

        h.advance(1_000);
        let events = h.feed(&PeerSnapshot::default());
        assert_eq!(
            kinds(&events),
            vec![EventKind::PairingRequestExpired, EventKind::PairingRequestsUpdated]
        );

        h.advance(1_000);
        assert!(h.feed(&PeerSnapshot::default()).is_empty());
    }

    #[test]
    fn test_expire_only_on_failed_tick() {
        let mut h = Harness::new();
        h.store.insert_optimistic("U1", "U2", h.now);
        h.advance(Duration::from_secs(31).as_millis() as i64);

        let events = h
            .reconciler
            .expire_only(&mut h.store, h.now, &h.settings);

        assert_eq!(events.len(), 2);
        assert!(h.store.outgoing().is_empty());
    }

    #[test]
    fn test_direct_draw_is_not_reannounced() {
        let mut h = Harness::new();
        let mut snapshot = PeerSnapshot {
            session: Some(session("S1", vec![card("one", "U1")])),
            ..Default::default()
        };
        h.feed(&snapshot);

        let event = h.reconciler.record_drawn_card(card("two", "U1"), Some(2));
        assert!(matches!(event, Some(EngineEvent::CardDrawn { index: 1, .. })));

        snapshot.session = Some(session("S1", vec![card("one", "U1"), card("two", "U1")]));
        assert!(h.feed(&snapshot).is_empty());
    }

    #[test]
    fn test_signature_is_content_based() {
        assert_eq!(signature(&partner("Bob")), signature(&partner("Bob")));
        assert_ne!(signature(&partner("Bob")), signature(&partner("Rob")));
        assert_eq!(signature(&None::<PartnerInfo>).len(), 64);
    }
}
