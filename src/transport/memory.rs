//! In-memory simulation of the game service.
//!
//! [`MemoryTransport`] keeps users, pairing requests, couples, sessions and a
//! per-user event log in one shared state, so several clients cloned from the
//! same handle see each other exactly as they would through the real service.
//! It answers in the service's own mixed field naming (camelCase on the
//! aggregated snapshot, snake_case and envelopes on the narrower endpoints),
//! which keeps the normalization layer honest.
//!
//! Test hooks:
//! - [`MemoryTransport::fail_next`] queues a transport failure for one call
//! - [`MemoryTransport::set_snapshot_enabled`] removes the aggregated endpoint
//! - [`MemoryTransport::set_issue_request_ids`] answers pairing requests without an id
//! - [`MemoryTransport::set_hide_requests`] simulates a read replica lagging behind writes
//! - [`MemoryTransport::answer_reconnect_as`] accepts reconnects for another user

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{Transport, TransportError, TransportResult};
use crate::connection::Identity;

/// The calls a [`MemoryTransport`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryCall {
    Connect,
    Reconnect,
    Disconnect,
    Logout,
    ListPeers,
    ListPairingRequests,
    RequestPairing,
    RespondPairing,
    CancelPairing,
    Snapshot,
    UserStatus,
    StartSession,
    EndSession,
    DrawCard,
}

#[derive(Debug, Clone)]
struct MemoryUser {
    display_name: String,
    auth_token: String,
    online: bool,
}

#[derive(Debug, Clone)]
struct MemoryRequest {
    id: String,
    requester_id: String,
    target_id: String,
    status: &'static str,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MemoryCard {
    id: String,
    content: String,
    drawn_by: String,
}

#[derive(Debug, Clone)]
struct MemorySession {
    id: String,
    couple_id: String,
    active: bool,
    cards: Vec<MemoryCard>,
}

#[derive(Debug, Clone)]
struct MemoryEvent {
    seq: u64,
    audience: [String; 2],
    body: Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, MemoryUser>,
    requests: Vec<MemoryRequest>,
    couples: HashMap<String, [String; 2]>,
    sessions: Vec<MemorySession>,
    events: Vec<MemoryEvent>,
    counter: u64,
    event_seq: u64,
    failures: HashMap<MemoryCall, VecDeque<TransportError>>,
    calls: Vec<MemoryCall>,
    snapshot_disabled: bool,
    omit_request_ids: bool,
    hide_requests: bool,
    reconnect_as: Option<String>,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}{}", prefix, self.counter)
    }

    fn record(&mut self, call: MemoryCall) -> TransportResult<()> {
        self.calls.push(call);
        match self.failures.get_mut(&call).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_token(&self, identity: &Identity) -> Result<(), Value> {
        match self.users.get(&identity.user_id) {
            Some(user) if user.auth_token == identity.auth_token => Ok(()),
            _ => Err(failure("invalid token")),
        }
    }

    fn couple_of(&self, user_id: &str) -> Option<(&String, &[String; 2])> {
        self.couples
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == user_id))
    }

    fn partner_of(&self, user_id: &str) -> Option<(String, String)> {
        let (couple_id, members) = self.couple_of(user_id)?;
        let partner = members.iter().find(|m| m.as_str() != user_id)?;
        Some((couple_id.clone(), partner.clone()))
    }

    fn active_session_of(&self, user_id: &str) -> Option<&MemorySession> {
        let (couple_id, _) = self.couple_of(user_id)?;
        self.sessions
            .iter()
            .rev()
            .find(|s| &s.couple_id == couple_id && s.active)
    }

    fn push_event(&mut self, audience: [String; 2], body: Value) {
        self.event_seq += 1;
        let seq = self.event_seq;
        self.events.push(MemoryEvent {
            seq,
            audience,
            body,
        });
    }

    fn form_couple(&mut self, a: &str, b: &str) -> (String, String) {
        let couple_id = self.next_id("C");
        let session_id = self.next_id("S");
        let members = [a.to_string(), b.to_string()];

        self.couples.insert(couple_id.clone(), members.clone());
        self.sessions.push(MemorySession {
            id: session_id.clone(),
            couple_id: couple_id.clone(),
            active: true,
            cards: Vec::new(),
        });

        // Any other pending request involving either user is moot now
        for request in self.requests.iter_mut() {
            let involved = [&request.requester_id, &request.target_id]
                .iter()
                .any(|id| id.as_str() == a || id.as_str() == b);
            if involved && request.status == "pending" {
                request.status = "cancelled";
            }
        }

        self.push_event(
            members.clone(),
            json!({ "type": "pairingFormed", "coupleId": couple_id }),
        );
        self.push_event(
            members,
            json!({ "type": "sessionStarted", "sessionId": session_id }),
        );

        (couple_id, session_id)
    }

    fn user_json(&self, user_id: &str) -> Value {
        let user = self.users.get(user_id);
        json!({
            "id": user_id,
            "displayName": user.map(|u| u.display_name.clone()),
            "online": user.map(|u| u.online).unwrap_or(false),
        })
    }

    fn request_json(&self, request: &MemoryRequest) -> Value {
        json!({
            "requestId": request.id,
            "requesterId": request.requester_id,
            "requesterName": self.users.get(&request.requester_id).map(|u| u.display_name.clone()),
            "targetId": request.target_id,
            "status": request.status,
            "createdAt": request.created_at.to_rfc3339(),
        })
    }

    fn session_json(&self, session: &MemorySession) -> Value {
        let cards: Vec<Value> = session
            .cards
            .iter()
            .map(|c| json!({ "id": c.id, "content": c.content, "drawnBy": c.drawn_by }))
            .collect();
        json!({
            "id": session.id,
            "isActive": session.active,
            "currentCardIndex": session.cards.len().saturating_sub(1),
            "sharedCards": cards,
        })
    }

    fn partner_json(&self, user_id: &str) -> Value {
        match self.partner_of(user_id) {
            Some((couple_id, partner_id)) => {
                let mut partner = self.user_json(&partner_id);
                partner["coupleId"] = Value::String(couple_id);
                partner
            }
            None => Value::Null,
        }
    }

    fn status_label(&self, user_id: &str) -> &'static str {
        if self.active_session_of(user_id).is_some() {
            "in_session"
        } else if self.couple_of(user_id).is_some() {
            "paired"
        } else {
            "online"
        }
    }

    fn snapshot_json(&self, user_id: &str) -> Value {
        let (incoming, outgoing): (Vec<Value>, Vec<Value>) = if self.hide_requests {
            (Vec::new(), Vec::new())
        } else {
            let pending = || self.requests.iter().filter(|r| r.status == "pending");
            (
                pending()
                    .filter(|r| r.target_id == user_id)
                    .map(|r| self.request_json(r))
                    .collect(),
                pending()
                    .filter(|r| r.requester_id == user_id)
                    .map(|r| self.request_json(r))
                    .collect(),
            )
        };

        let peers: Vec<Value> = self
            .users
            .keys()
            .filter(|id| id.as_str() != user_id)
            .map(|id| self.user_json(id))
            .collect();

        let events: Vec<Value> = self
            .events
            .iter()
            .filter(|e| e.audience.iter().any(|a| a == user_id))
            .map(|e| {
                let mut body = e.body.clone();
                body["seq"] = json!(e.seq);
                body
            })
            .collect();

        json!({
            "user": {
                "id": user_id,
                "displayName": self.users.get(user_id).map(|u| u.display_name.clone()),
                "status": self.status_label(user_id),
            },
            "partner": self.partner_json(user_id),
            "gameSession": self.active_session_of(user_id).map(|s| self.session_json(s)),
            "peers": peers,
            "pairingRequests": { "incoming": incoming, "outgoing": outgoing },
            "events": events,
        })
    }
}

fn failure(message: &str) -> Value {
    json!({ "success": false, "error": message })
}

/// In-memory service shared by every clone of the handle
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of the given kind fail with `error`
    pub fn fail_next(&self, call: MemoryCall, error: TransportError) {
        self.state
            .lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Enable or disable the aggregated snapshot endpoint
    pub fn set_snapshot_enabled(&self, enabled: bool) {
        self.state.lock().snapshot_disabled = !enabled;
    }

    /// When false, successful pairing requests are answered without an id
    pub fn set_issue_request_ids(&self, issue: bool) {
        self.state.lock().omit_request_ids = !issue;
    }

    /// When true, reads report no pairing requests at all
    pub fn set_hide_requests(&self, hide: bool) {
        self.state.lock().hide_requests = hide;
    }

    /// Accept every reconnect, answering it for `user_id`
    pub fn answer_reconnect_as(&self, user_id: Option<&str>) {
        self.state.lock().reconnect_as = user_id.map(str::to_string);
    }

    /// Calls received so far, in order
    pub fn calls(&self) -> Vec<MemoryCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, call: MemoryCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Register a user directly, bypassing `connect`
    pub fn add_user(&self, user_id: &str, display_name: &str, auth_token: &str) {
        self.state.lock().users.insert(
            user_id.to_string(),
            MemoryUser {
                display_name: display_name.to_string(),
                auth_token: auth_token.to_string(),
                online: true,
            },
        );
    }

    /// Invalidate the stored token of a user
    pub fn revoke_token(&self, user_id: &str) {
        if let Some(user) = self.state.lock().users.get_mut(user_id) {
            user.auth_token = String::new();
        }
    }

    /// Draw a card on behalf of `user_id` without going through a client
    pub fn draw_card_as(&self, user_id: &str, content: &str) -> Option<String> {
        let mut state = self.state.lock();
        let session_id = state.active_session_of(user_id)?.id.clone();
        let card_id = state.next_id("K");
        let session = state.sessions.iter_mut().find(|s| s.id == session_id)?;
        session.cards.push(MemoryCard {
            id: card_id.clone(),
            content: content.to_string(),
            drawn_by: user_id.to_string(),
        });
        Some(card_id)
    }

    /// End the active session of `user_id` without going through a client
    pub fn end_session_as(&self, user_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        let session_id = state.active_session_of(user_id)?.id.clone();
        let audience = state.couple_of(user_id)?.1.clone();
        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.active = false;
        }
        state.push_event(
            audience,
            json!({ "type": "sessionEnded", "sessionId": session_id }),
        );
        Some(session_id)
    }

    async fn enter(&self, call: MemoryCall) -> TransportResult<()> {
        // Every call is a suspension point, like a real round trip
        tokio::task::yield_now().await;
        self.state.lock().record(call)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, display_name: &str) -> TransportResult<Value> {
        self.enter(MemoryCall::Connect).await?;
        let mut state = self.state.lock();

        if display_name.trim().is_empty() {
            return Ok(failure("display name required"));
        }

        let user_id = state.next_id("U");
        let auth_token = uuid::Uuid::new_v4().simple().to_string();
        state.users.insert(
            user_id.clone(),
            MemoryUser {
                display_name: display_name.to_string(),
                auth_token: auth_token.clone(),
                online: true,
            },
        );

        Ok(json!({
            "success": true,
            "userId": user_id,
            "authToken": auth_token,
            "connectionId": uuid::Uuid::new_v4().to_string(),
            "displayName": display_name,
        }))
    }

    async fn reconnect(&self, user_id: &str, auth_token: &str) -> TransportResult<Value> {
        self.enter(MemoryCall::Reconnect).await?;
        let mut state = self.state.lock();

        if let Some(other) = &state.reconnect_as {
            return Ok(json!({
                "success": true,
                "userId": other,
                "authToken": auth_token,
            }));
        }

        match state.users.get_mut(user_id) {
            Some(user) if !user.auth_token.is_empty() && user.auth_token == auth_token => {
                user.online = true;
                Ok(json!({
                    "success": true,
                    "user_id": user_id,
                    "auth_token": auth_token,
                    "connection_id": uuid::Uuid::new_v4().to_string(),
                    "display_name": user.display_name,
                }))
            }
            _ => Ok(json!({
                "success": false,
                "error": "invalid token",
                "invalidToken": true,
            })),
        }
    }

    async fn disconnect(&self, identity: &Identity) -> TransportResult<Value> {
        self.enter(MemoryCall::Disconnect).await?;
        let mut state = self.state.lock();
        if let Some(user) = state.users.get_mut(&identity.user_id) {
            user.online = false;
        }
        Ok(json!({ "success": true }))
    }

    async fn logout(&self, auth_token: &str) -> TransportResult<Value> {
        self.enter(MemoryCall::Logout).await?;
        let mut state = self.state.lock();
        for user in state.users.values_mut() {
            if user.auth_token == auth_token {
                user.online = false;
                user.auth_token = String::new();
            }
        }
        Ok(json!({ "success": true }))
    }

    async fn list_peers(&self, identity: &Identity) -> TransportResult<Value> {
        self.enter(MemoryCall::ListPeers).await?;
        let state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }

        let users: Vec<Value> = state
            .users
            .iter()
            .filter(|(id, _)| **id != identity.user_id)
            .map(|(id, user)| {
                json!({ "user_id": id, "display_name": user.display_name, "is_online": user.online })
            })
            .collect();
        Ok(json!({ "users": users }))
    }

    async fn list_pairing_requests(&self, identity: &Identity) -> TransportResult<Value> {
        self.enter(MemoryCall::ListPairingRequests).await?;
        let state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }

        let requests: Vec<Value> = if state.hide_requests {
            Vec::new()
        } else {
            state
                .requests
                .iter()
                .filter(|r| r.status == "pending")
                .filter(|r| r.requester_id == identity.user_id || r.target_id == identity.user_id)
                .map(|r| {
                    json!({
                        "request_id": r.id,
                        "requester_id": r.requester_id,
                        "target_id": r.target_id,
                        "status": r.status,
                        "created_at": r.created_at.to_rfc3339(),
                    })
                })
                .collect()
        };
        Ok(json!({ "requests": requests }))
    }

    async fn request_pairing(
        &self,
        identity: &Identity,
        target_id: &str,
    ) -> TransportResult<Value> {
        self.enter(MemoryCall::RequestPairing).await?;
        let mut state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }
        if !state.users.contains_key(target_id) {
            return Ok(failure("target not found"));
        }

        let existing = state
            .requests
            .iter()
            .find(|r| {
                r.status == "pending" && r.requester_id == identity.user_id && r.target_id == target_id
            })
            .map(|r| r.id.clone());

        let request_id = match existing {
            Some(id) => id,
            None => {
                let id = state.next_id("R");
                state.requests.push(MemoryRequest {
                    id: id.clone(),
                    requester_id: identity.user_id.clone(),
                    target_id: target_id.to_string(),
                    status: "pending",
                    created_at: Utc::now(),
                });
                id
            }
        };

        if state.omit_request_ids {
            Ok(json!({ "success": true }))
        } else {
            Ok(json!({ "success": true, "requestId": request_id }))
        }
    }

    async fn respond_pairing(
        &self,
        identity: &Identity,
        request_id: &str,
        approve: bool,
    ) -> TransportResult<Value> {
        self.enter(MemoryCall::RespondPairing).await?;
        let mut state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }

        let Some(index) = state.requests.iter().position(|r| {
            r.id == request_id && r.target_id == identity.user_id && r.status == "pending"
        }) else {
            return Ok(failure("request not found"));
        };

        if !approve {
            state.requests[index].status = "rejected";
            return Ok(json!({ "success": true }));
        }

        state.requests[index].status = "approved";
        let requester = state.requests[index].requester_id.clone();
        let (couple_id, session_id) = state.form_couple(&requester, &identity.user_id);

        Ok(json!({
            "success": true,
            "coupleId": couple_id,
            "partnerId": requester,
            "gameSession": { "id": session_id },
        }))
    }

    async fn cancel_pairing(&self, identity: &Identity, target_id: &str) -> TransportResult<Value> {
        self.enter(MemoryCall::CancelPairing).await?;
        let mut state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }

        let mut cancelled = 0;
        for request in state.requests.iter_mut() {
            if request.status == "pending"
                && request.requester_id == identity.user_id
                && request.target_id == target_id
            {
                request.status = "cancelled";
                cancelled += 1;
            }
        }
        Ok(json!({ "success": true, "cancelled": cancelled }))
    }

    async fn snapshot(&self, identity: &Identity) -> TransportResult<Value> {
        self.enter(MemoryCall::Snapshot).await?;
        let state = self.state.lock();
        if state.snapshot_disabled {
            return Err(TransportError::Http {
                status: 404,
                body: "Not Found".to_string(),
            });
        }
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }
        Ok(state.snapshot_json(&identity.user_id))
    }

    async fn user_status(&self, identity: &Identity) -> TransportResult<Value> {
        self.enter(MemoryCall::UserStatus).await?;
        let state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }

        let partner = match state.partner_of(&identity.user_id) {
            Some((couple_id, partner_id)) => {
                let user = state.users.get(&partner_id);
                json!({
                    "user_id": partner_id,
                    "display_name": user.map(|u| u.display_name.clone()),
                    "is_online": user.map(|u| u.online).unwrap_or(false),
                    "couple_id": couple_id,
                })
            }
            None => Value::Null,
        };
        let session = state
            .active_session_of(&identity.user_id)
            .map(|s| {
                let cards: Vec<Value> = s
                    .cards
                    .iter()
                    .map(|c| json!({ "card_id": c.id, "text": c.content, "drawn_by": c.drawn_by }))
                    .collect();
                json!({
                    "session_id": s.id,
                    "is_active": s.active,
                    "card_cursor": s.cards.len().saturating_sub(1),
                    "cards": cards,
                })
            })
            .unwrap_or(Value::Null);

        Ok(json!({
            "success": true,
            "data": {
                "user_status": state.status_label(&identity.user_id),
                "display_name": state.users.get(&identity.user_id).map(|u| u.display_name.clone()),
                "partner_info": partner,
                "game_session": session,
            }
        }))
    }

    async fn start_session(&self, identity: &Identity) -> TransportResult<Value> {
        self.enter(MemoryCall::StartSession).await?;
        let mut state = self.state.lock();
        if let Err(body) = state.check_token(identity) {
            return Ok(body);
        }

        if let Some(session) = state.active_session_of(&identity.user_id) {
            return Ok(json!({ "success": true, "gameSession": { "id": session.id } }));
        }
        let Some((couple_id, members)) = state
            .couple_of(&identity.user_id)
            .map(|(id, members)| (id.clone(), members.clone()))
        else {
            return Ok(failure("not paired"));
        };

        let session_id = state.next_id("S");
        state.sessions.push(MemorySession {
            id: session_id.clone(),
            couple_id,
            active: true,
            cards: Vec::new(),
        });
        state.push_event(
            members,
            json!({ "type": "sessionStarted", "sessionId": session_id }),
        );
        Ok(json!({ "success": true, "gameSession": { "id": session_id } }))
    }

    async fn end_session(&self, identity: &Identity, session_id: &str) -> TransportResult<Value> {
        self.enter(MemoryCall::EndSession).await?;
        {
            let state = self.state.lock();
            if let Err(body) = state.check_token(identity) {
                return Ok(body);
            }
            match state.active_session_of(&identity.user_id) {
                Some(session) if session.id == session_id => {}
                _ => return Ok(failure("session not found")),
            }
        }
        self.end_session_as(&identity.user_id);
        Ok(json!({ "success": true, "sessionId": session_id }))
    }

    async fn draw_card(
        &self,
        identity: &Identity,
        session_id: &str,
        content: &str,
    ) -> TransportResult<Value> {
        self.enter(MemoryCall::DrawCard).await?;
        {
            let state = self.state.lock();
            if let Err(body) = state.check_token(identity) {
                return Ok(body);
            }
            match state.active_session_of(&identity.user_id) {
                Some(session) if session.id == session_id => {}
                _ => return Ok(failure("session not found")),
            }
        }

        let Some(card_id) = self.draw_card_as(&identity.user_id, content) else {
            return Ok(failure("session not found"));
        };
        let state = self.state.lock();
        let count = state
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.cards.len())
            .unwrap_or(0);

        Ok(json!({
            "success": true,
            "card": { "id": card_id, "content": content, "drawnBy": identity.user_id },
            "cardCount": count,
        }))
    }
}
