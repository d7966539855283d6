//! Wire normalization for the game service.
//!
//! The service returns the same concepts under different names depending on
//! the endpoint (`gameSession` on the aggregated snapshot, `game_session`
//! inside the `data` envelope of the status call, `sharedCards` vs `cards`,
//! ids as strings or numbers...). Every field the engine reads is mapped here,
//! explicitly, into one canonical schema. Nothing past this module looks at a
//! raw [`Value`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::pending::RequestState;
use super::{CoupleId, EngineError, EngineResult, RequestId, SessionId, UserId};

// ============================================================================
// CANONICAL TYPES
// ============================================================================

/// What the service says about the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityStatus {
    /// Lowercased status label (`online`, `paired`, `in_session`, ...)
    pub status: String,
    pub display_name: Option<String>,
}

impl Default for IdentityStatus {
    fn default() -> Self {
        Self {
            status: "unknown".to_string(),
            display_name: None,
        }
    }
}

/// The user we are paired with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerInfo {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub online: bool,
    pub couple_id: Option<CoupleId>,
}

/// Another user visible to us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub online: bool,
}

/// A card placed on the shared table of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedCard {
    pub card_id: Option<String>,
    pub content: String,
    pub drawn_by: Option<UserId>,
}

/// A game session as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub is_active: bool,
    pub card_cursor: u32,
    pub cards: Vec<SharedCard>,
}

/// A pairing request as reported by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    pub request_id: RequestId,
    pub requester_id: UserId,
    pub target_id: UserId,
    pub requester_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub state: RequestState,
}

/// A discrete domain event from the service's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
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
}

/// A domain event with its position in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq: u64,
    pub event: DomainEvent,
}

/// Canonical shape of one poll, whichever endpoints produced it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub identity_status: IdentityStatus,
    pub partner: Option<PartnerInfo>,
    pub session: Option<SessionInfo>,
    pub peers: Vec<PeerInfo>,
    pub incoming_requests: Vec<RemoteRequest>,
    pub outgoing_requests: Vec<RemoteRequest>,
    pub events: Vec<LoggedEvent>,
}

impl PeerSnapshot {
    /// Session that is still running, if any
    pub fn active_session(&self) -> Option<&SessionInfo> {
        self.session.as_ref().filter(|s| s.is_active)
    }
}

/// Reply to `connect` / `reconnect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub user_id: UserId,
    pub auth_token: String,
    pub connection_id: Option<String>,
    pub display_name: Option<String>,
}

/// Reply to `reconnect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectReply {
    Accepted(ConnectReply),
    /// The user/token pair is no longer valid
    Rejected(String),
}

/// What an approved pairing produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingOutcome {
    pub couple_id: Option<CoupleId>,
    pub partner_id: Option<UserId>,
    pub session_id: Option<SessionId>,
}

impl PairingOutcome {
    pub fn is_formed(&self) -> bool {
        self.couple_id.is_some() || self.session_id.is_some()
    }
}

/// Reply to `draw_card`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawnCard {
    pub card: Option<SharedCard>,
    /// Total number of shared cards after the draw, when reported
    pub total: Option<usize>,
}

// ============================================================================
// FIELD ACCESS
// ============================================================================

/// First non-null field among `names`
fn field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let object = value.as_object()?;
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find(|v| !v.is_null())
}

/// String field; numbers are stringified since ids come both ways
fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    match field(value, names)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_field(value: &Value, names: &[&str]) -> Option<bool> {
    match field(value, names)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn u64_field(value: &Value, names: &[&str]) -> Option<u64> {
    match field(value, names)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// RFC 3339 string or epoch milliseconds
fn datetime_field(value: &Value, names: &[&str]) -> Option<DateTime<Utc>> {
    match field(value, names)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn array_field<'a>(value: &'a Value, names: &[&str]) -> &'a [Value] {
    field(value, names)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Unwrap an optional `{ "data": ... }` envelope
fn unwrap_envelope(value: &Value) -> &Value {
    match value.get("data") {
        Some(inner) if inner.is_object() || inner.is_array() => inner,
        _ => value,
    }
}

/// Lowercase and strip separators so `sessionEnded` and `session_ended` compare equal
fn fold_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// ============================================================================
// APPLICATION-LEVEL FAILURES
// ============================================================================

/// Message of an application-level failure carried by a successful response
pub fn application_failure(value: &Value) -> Option<String> {
    let explicit_failure = bool_field(value, &["success", "ok"]) == Some(false);
    let error = string_field(value, &["error", "errorMessage", "error_message", "message"]);
    let has_error_only = field(value, &["success", "ok"]).is_none()
        && field(value, &["error"]).is_some();

    if explicit_failure || has_error_only {
        Some(error.unwrap_or_else(|| "request failed".to_string()))
    } else {
        None
    }
}

/// Turn an application-level failure into [`EngineError::Application`]
pub fn ensure_success(value: &Value) -> EngineResult<&Value> {
    match application_failure(value) {
        Some(message) => Err(EngineError::Application(message)),
        None => Ok(unwrap_envelope(value)),
    }
}

// ============================================================================
// PART NORMALIZERS
// ============================================================================

pub fn normalize_partner(value: &Value) -> Option<PartnerInfo> {
    let partner = field(value, &["partner", "partnerInfo", "partner_info", "couple"])?;
    let user_id = string_field(partner, &["id", "userId", "user_id", "partnerId"])?;
    Some(PartnerInfo {
        user_id,
        display_name: string_field(partner, &["displayName", "display_name", "name"]),
        online: bool_field(partner, &["online", "isOnline", "is_online"]).unwrap_or(false),
        couple_id: string_field(partner, &["coupleId", "couple_id"])
            .or_else(|| string_field(value, &["coupleId", "couple_id"])),
    })
}

fn normalize_card(value: &Value) -> Option<SharedCard> {
    if let Value::String(content) = value {
        return Some(SharedCard {
            card_id: None,
            content: content.clone(),
            drawn_by: None,
        });
    }
    Some(SharedCard {
        card_id: string_field(value, &["id", "cardId", "card_id"]),
        content: string_field(value, &["content", "text", "prompt"])?,
        drawn_by: string_field(value, &["drawnBy", "drawn_by", "authorId", "author_id", "userId"]),
    })
}

fn normalize_session_object(session: &Value) -> Option<SessionInfo> {
    let session_id = string_field(session, &["id", "sessionId", "session_id", "gameSessionId"])?;
    let cards = array_field(session, &["sharedCards", "shared_cards", "cards", "drawnCards"])
        .iter()
        .filter_map(normalize_card)
        .collect();

    Some(SessionInfo {
        session_id,
        is_active: bool_field(session, &["isActive", "is_active", "active"]).unwrap_or(true),
        card_cursor: u64_field(
            session,
            &["cardCursor", "card_cursor", "currentCardIndex", "current_card_index"],
        )
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0),
        cards,
    })
}

pub fn normalize_session(value: &Value) -> Option<SessionInfo> {
    let session = field(
        value,
        &["gameSession", "game_session", "session", "activeSession", "active_session"],
    )?;
    normalize_session_object(session)
}

pub fn normalize_identity_status(value: &Value) -> IdentityStatus {
    let user = field(value, &["user", "me", "self", "identity"]).unwrap_or(value);
    let status = string_field(user, &["status", "userStatus", "user_status", "identityStatus"])
        .or_else(|| string_field(value, &["userStatus", "user_status", "identityStatus", "status"]))
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    IdentityStatus {
        status,
        display_name: string_field(user, &["displayName", "display_name", "name"])
            .or_else(|| string_field(value, &["displayName", "display_name"])),
    }
}

fn normalize_peer(value: &Value) -> Option<PeerInfo> {
    Some(PeerInfo {
        user_id: string_field(value, &["id", "userId", "user_id"])?,
        display_name: string_field(value, &["displayName", "display_name", "name"]),
        online: bool_field(value, &["online", "isOnline", "is_online"]).unwrap_or(false),
    })
}

pub fn normalize_peers(value: &Value) -> Vec<PeerInfo> {
    let list = if let Value::Array(items) = value {
        items.as_slice()
    } else {
        array_field(value, &["peers", "peerList", "peer_list", "users", "onlineUsers"])
    };
    list.iter().filter_map(normalize_peer).collect()
}

pub fn normalize_request(value: &Value) -> Option<RemoteRequest> {
    let state = string_field(value, &["status", "state"])
        .map(|s| RequestState::from_wire(&s))
        .unwrap_or(RequestState::PendingConfirmed);

    Some(RemoteRequest {
        request_id: string_field(value, &["requestId", "request_id", "id"])?,
        requester_id: string_field(
            value,
            &["requesterId", "requester_id", "fromUserId", "from_user_id", "from"],
        )?,
        target_id: string_field(value, &["targetId", "target_id", "toUserId", "to_user_id", "to"])?,
        requester_name: string_field(value, &["requesterName", "requester_name", "fromName"]),
        created_at: datetime_field(value, &["createdAt", "created_at", "timestamp"]),
        state,
    })
}

/// Split pairing requests into `(incoming, outgoing)` for `self_id`
pub fn normalize_requests(value: &Value, self_id: &str) -> (Vec<RemoteRequest>, Vec<RemoteRequest>) {
    let container = field(value, &["pairingRequests", "pairing_requests", "requests"]).unwrap_or(value);

    // Separate lists, either nested or at the top level
    let incoming_names = ["incoming", "incomingRequests", "incoming_requests", "received"];
    let outgoing_names = ["outgoing", "outgoingRequests", "outgoing_requests", "sent"];
    if field(container, &incoming_names).is_some() || field(container, &outgoing_names).is_some() {
        let incoming = array_field(container, &incoming_names)
            .iter()
            .filter_map(normalize_request)
            .collect();
        let outgoing = array_field(container, &outgoing_names)
            .iter()
            .filter_map(normalize_request)
            .collect();
        return (incoming, outgoing);
    }

    // One combined list, split by direction
    let combined = match container {
        Value::Array(items) => items.as_slice(),
        _ => &[],
    };
    let mut incoming = Vec::new();
    let mut outgoing = Vec::new();
    for request in combined.iter().filter_map(normalize_request) {
        if request.requester_id == self_id {
            outgoing.push(request);
        } else if request.target_id == self_id {
            incoming.push(request);
        } else {
            debug!("Ignoring pairing request {} not involving us", request.request_id);
        }
    }
    (incoming, outgoing)
}

fn normalize_event(value: &Value) -> Option<LoggedEvent> {
    let seq = u64_field(value, &["seq", "sequence", "eventId", "event_id", "id"])?;
    let kind = fold_label(&string_field(value, &["type", "kind", "event", "name"])?);
    let payload = field(value, &["payload", "data"]).unwrap_or(value);

    let event = match kind.as_str() {
        "pairingformed" | "coupleformed" | "paired" => DomainEvent::PairingFormed {
            couple_id: string_field(payload, &["coupleId", "couple_id"]),
            partner_id: string_field(payload, &["partnerId", "partner_id"]),
        },
        "sessionstarted" | "gamestarted" => DomainEvent::SessionStarted {
            session_id: string_field(payload, &["sessionId", "session_id", "gameSessionId"])?,
        },
        "sessionended" | "gameended" => DomainEvent::SessionEnded {
            session_id: string_field(payload, &["sessionId", "session_id", "gameSessionId"])?,
        },
        other => {
            debug!("Ignoring unknown event kind {}", other);
            return None;
        }
    };
    Some(LoggedEvent { seq, event })
}

pub fn normalize_events(value: &Value) -> Vec<LoggedEvent> {
    let mut events: Vec<LoggedEvent> = array_field(value, &["events", "eventLog", "event_log"])
        .iter()
        .filter_map(normalize_event)
        .collect();
    events.sort_by_key(|e| e.seq);
    events
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Normalize the aggregated snapshot endpoint
pub fn normalize_snapshot(value: &Value, self_id: &str) -> EngineResult<PeerSnapshot> {
    let body = ensure_success(value)?;
    let (incoming_requests, outgoing_requests) = normalize_requests(body, self_id);

    Ok(PeerSnapshot {
        identity_status: normalize_identity_status(body),
        partner: normalize_partner(body),
        session: normalize_session(body),
        peers: normalize_peers(body),
        incoming_requests,
        outgoing_requests,
        events: normalize_events(body),
    })
}

/// Assemble a snapshot from the narrower per-concern endpoints
pub fn snapshot_from_parts(
    status: &Value,
    peers: &Value,
    requests: &Value,
    self_id: &str,
) -> EngineResult<PeerSnapshot> {
    let status = ensure_success(status)?;
    let peers = ensure_success(peers)?;
    let requests = ensure_success(requests)?;
    let (incoming_requests, outgoing_requests) = normalize_requests(requests, self_id);

    Ok(PeerSnapshot {
        identity_status: normalize_identity_status(status),
        partner: normalize_partner(status),
        session: normalize_session(status),
        peers: normalize_peers(peers),
        incoming_requests,
        outgoing_requests,
        events: normalize_events(status),
    })
}

// ============================================================================
// MUTATION REPLIES
// ============================================================================

fn parse_connect_body(body: &Value) -> Option<ConnectReply> {
    let user = field(body, &["user"]).unwrap_or(body);
    Some(ConnectReply {
        user_id: string_field(user, &["userId", "user_id", "id"])
            .or_else(|| string_field(body, &["userId", "user_id"]))?,
        auth_token: string_field(body, &["authToken", "auth_token", "token", "sessionToken"])?,
        connection_id: string_field(body, &["connectionId", "connection_id"]),
        display_name: string_field(user, &["displayName", "display_name", "name"]),
    })
}

/// Parse a `connect` reply; a rejection maps to [`EngineError::Auth`]
pub fn parse_connect_reply(value: &Value) -> EngineResult<ConnectReply> {
    if let Some(message) = application_failure(value) {
        return Err(EngineError::Auth(message));
    }
    parse_connect_body(unwrap_envelope(value))
        .ok_or_else(|| EngineError::Auth("connect reply carried no identity".to_string()))
}

pub fn parse_reconnect_reply(value: &Value) -> ReconnectReply {
    if let Some(message) = application_failure(value) {
        return ReconnectReply::Rejected(message);
    }
    if bool_field(value, &["invalidToken", "invalid_token"]) == Some(true) {
        return ReconnectReply::Rejected("invalid token".to_string());
    }
    match parse_connect_body(unwrap_envelope(value)) {
        Some(reply) => ReconnectReply::Accepted(reply),
        None => ReconnectReply::Rejected("reconnect reply carried no identity".to_string()),
    }
}

/// Server-issued id of a new pairing request, if the reply carries one
pub fn parse_request_reply(value: &Value) -> EngineResult<Option<RequestId>> {
    let body = ensure_success(value)?;
    let nested = field(body, &["request", "pairingRequest"]);
    Ok(string_field(body, &["requestId", "request_id", "id"])
        .or_else(|| nested.and_then(|r| string_field(r, &["requestId", "request_id", "id"]))))
}

pub fn parse_pairing_outcome(value: &Value) -> EngineResult<PairingOutcome> {
    let body = ensure_success(value)?;
    let couple = field(body, &["couple"]);
    Ok(PairingOutcome {
        couple_id: string_field(body, &["coupleId", "couple_id"])
            .or_else(|| couple.and_then(|c| string_field(c, &["id", "coupleId"]))),
        partner_id: string_field(body, &["partnerId", "partner_id"]),
        session_id: normalize_session(body)
            .map(|s| s.session_id)
            .or_else(|| string_field(body, &["sessionId", "session_id"])),
    })
}

pub fn parse_session_reply(value: &Value) -> EngineResult<Option<SessionId>> {
    let body = ensure_success(value)?;
    Ok(normalize_session(body)
        .map(|s| s.session_id)
        .or_else(|| string_field(body, &["sessionId", "session_id"])))
}

pub fn parse_drawn_card(value: &Value) -> EngineResult<DrawnCard> {
    let body = ensure_success(value)?;
    Ok(DrawnCard {
        card: field(body, &["card", "drawnCard", "drawn_card"]).and_then(normalize_card),
        total: u64_field(body, &["cardCount", "card_count", "totalCards"]).map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_application_failure_detection() {
        assert_eq!(
            application_failure(&json!({ "success": false, "error": "target not found" })),
            Some("target not found".to_string())
        );
        assert_eq!(application_failure(&json!({ "error": "boom" })), Some("boom".to_string()));
        assert_eq!(application_failure(&json!({ "ok": false })), Some("request failed".to_string()));
        assert_eq!(application_failure(&json!({ "success": true, "message": "ok" })), None);
        assert_eq!(application_failure(&json!({ "requestId": "R1" })), None);
    }

    #[test]
    fn test_snapshot_camel_case() {
        let value = json!({
            "user": { "id": "U1", "displayName": "Alice", "status": "In_Session" },
            "partner": { "id": "U2", "displayName": "Bob", "online": true, "coupleId": "C1" },
            "gameSession": {
                "id": "S1",
                "isActive": true,
                "currentCardIndex": 1,
                "sharedCards": [
                    { "id": "K1", "content": "first", "drawnBy": "U1" },
                    { "id": "K2", "content": "second", "drawnBy": "U2" }
                ]
            },
            "peers": [{ "id": "U3", "displayName": "Carol", "online": false }],
            "pairingRequests": {
                "incoming": [{ "requestId": "R9", "requesterId": "U3", "targetId": "U1", "status": "pending" }],
                "outgoing": []
            },
            "events": [
                { "seq": 2, "type": "sessionStarted", "sessionId": "S1" },
                { "seq": 1, "type": "pairingFormed", "coupleId": "C1" }
            ]
        });

        let snapshot = normalize_snapshot(&value, "U1").unwrap();

        assert_eq!(snapshot.identity_status.status, "in_session");
        assert_eq!(snapshot.partner.as_ref().unwrap().couple_id.as_deref(), Some("C1"));
        let session = snapshot.session.as_ref().unwrap();
        assert_eq!(session.session_id, "S1");
        assert_eq!(session.card_cursor, 1);
        assert_eq!(session.cards[1].drawn_by.as_deref(), Some("U2"));
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.incoming_requests[0].request_id, "R9");
        assert!(snapshot.outgoing_requests.is_empty());
        assert_eq!(snapshot.events[0].seq, 1);
        assert!(matches!(snapshot.events[1].event, DomainEvent::SessionStarted { .. }));
    }

    #[test]
    fn test_parts_match_aggregated_shape() {
        let status = json!({
            "success": true,
            "data": {
                "user_status": "paired",
                "display_name": "Alice",
                "partner_info": { "user_id": 2, "display_name": "Bob", "is_online": "true", "couple_id": "C1" },
                "game_session": {
                    "session_id": "S1",
                    "is_active": true,
                    "card_cursor": 0,
                    "cards": [{ "card_id": "K1", "text": "first", "drawn_by": "U1" }]
                }
            }
        });
        let peers = json!({ "users": [{ "user_id": "U3", "display_name": "Carol", "is_online": false }] });
        let requests = json!({ "requests": [
            { "request_id": 7, "requester_id": "U1", "target_id": "U3", "status": "pending" },
            { "request_id": 8, "requester_id": "U3", "target_id": "U1", "status": "pending" }
        ]});

        let snapshot = snapshot_from_parts(&status, &peers, &requests, "U1").unwrap();

        assert_eq!(snapshot.identity_status.status, "paired");
        assert_eq!(snapshot.partner.as_ref().unwrap().user_id, "2");
        assert!(snapshot.partner.as_ref().unwrap().online);
        assert_eq!(snapshot.session.as_ref().unwrap().cards[0].content, "first");
        assert_eq!(snapshot.peers[0].user_id, "U3");
        assert_eq!(snapshot.outgoing_requests[0].request_id, "7");
        assert_eq!(snapshot.incoming_requests[0].request_id, "8");
    }

    #[test]
    fn test_snapshot_application_failure() {
        let value = json!({ "success": false, "error": "invalid token" });
        let result = normalize_snapshot(&value, "U1");
        assert!(matches!(result, Err(EngineError::Application(msg)) if msg == "invalid token"));
    }

    #[test]
    fn test_null_session_and_partner() {
        let value = json!({ "partner": null, "gameSession": null, "peers": [] });
        let snapshot = normalize_snapshot(&value, "U1").unwrap();
        assert!(snapshot.partner.is_none());
        assert!(snapshot.session.is_none());
        assert!(snapshot.active_session().is_none());
    }

    #[test]
    fn test_oversized_card_cursor_saturates() {
        let value = json!({ "gameSession": { "id": "S1", "cardCursor": 5_000_000_000u64 } });
        let session = normalize_session(&value).unwrap();
        assert_eq!(session.card_cursor, u32::MAX);
    }

    #[test]
    fn test_events_without_seq_are_dropped() {
        let value = json!({ "events": [
            { "type": "session_ended", "session_id": "S1" },
            { "eventId": "4", "type": "game_ended", "payload": { "sessionId": "S1" } },
            { "seq": 5, "type": "confetti" }
        ]});
        let events = normalize_events(&value);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 4);
        assert_eq!(
            events[0].event,
            DomainEvent::SessionEnded { session_id: "S1".to_string() }
        );
    }

    #[test]
    fn test_request_reply_variants() {
        assert_eq!(
            parse_request_reply(&json!({ "success": true, "requestId": "R1" })).unwrap(),
            Some("R1".to_string())
        );
        assert_eq!(
            parse_request_reply(&json!({ "request": { "id": 12 } })).unwrap(),
            Some("12".to_string())
        );
        assert_eq!(parse_request_reply(&json!({ "success": true })).unwrap(), None);
        assert!(parse_request_reply(&json!({ "success": false, "error": "target not found" })).is_err());
    }

    #[test]
    fn test_pairing_outcome() {
        let outcome = parse_pairing_outcome(&json!({
            "success": true,
            "coupleId": "C1",
            "gameSession": { "id": "S1" }
        }))
        .unwrap();
        assert!(outcome.is_formed());
        assert_eq!(outcome.couple_id.as_deref(), Some("C1"));
        assert_eq!(outcome.session_id.as_deref(), Some("S1"));

        let rejected = parse_pairing_outcome(&json!({ "success": true })).unwrap();
        assert!(!rejected.is_formed());
    }

    #[test]
    fn test_connect_and_reconnect_replies() {
        let reply = parse_connect_reply(&json!({
            "success": true, "userId": "U1", "authToken": "tok", "connectionId": "c-1"
        }))
        .unwrap();
        assert_eq!(reply.user_id, "U1");
        assert_eq!(reply.connection_id.as_deref(), Some("c-1"));

        assert!(matches!(
            parse_connect_reply(&json!({ "success": false, "error": "name taken" })),
            Err(EngineError::Auth(_))
        ));

        assert!(matches!(
            parse_reconnect_reply(&json!({ "invalidToken": true })),
            ReconnectReply::Rejected(_)
        ));
        assert!(matches!(
            parse_reconnect_reply(&json!({ "user_id": "U1", "auth_token": "tok" })),
            ReconnectReply::Accepted(_)
        ));
    }

    #[test]
    fn test_drawn_card_and_datetime() {
        let drawn = parse_drawn_card(&json!({
            "card": { "id": "K3", "content": "third", "drawnBy": "U2" },
            "cardCount": 3
        }))
        .unwrap();
        assert_eq!(drawn.total, Some(3));
        assert_eq!(drawn.card.unwrap().drawn_by.as_deref(), Some("U2"));

        let request = normalize_request(&json!({
            "id": "R1", "from": "U1", "to": "U2", "createdAt": 1_700_000_000_000i64
        }))
        .unwrap();
        assert_eq!(request.created_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(request.state, RequestState::PendingConfirmed);
    }
}
