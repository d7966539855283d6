//! Optimistic pairing requests.
//!
//! Outgoing requests appear locally before the service confirms them. Each
//! one carries a provisional `local-` id until the service issues a real one,
//! and an [`RequestOrigin::Optimistic`] marker until a snapshot lists it on
//! its own. Entries confirmed neither by a reply nor by a snapshot expire
//! after the TTL.
//!
//! Snapshots are merged into the store rather than copied over it:
//! - an empty outgoing list is not trusted while a fresh local entry exists
//! - unconfirmed entries survive until they expire
//! - targets cancelled locally and incoming requests already answered are
//!   suppressed for a while so a lagging read cannot bring them back

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::protocol::RemoteRequest;
use super::{RequestId, UserId};
use crate::clock::elapsed_between;

/// Prefix of ids generated locally before the service issues one
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Who vouches for a request's existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOrigin {
    /// Created locally, not yet seen in a snapshot
    Optimistic,
    /// Listed by a snapshot
    Confirmed,
}

/// Lifecycle of a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    PendingOptimistic,
    PendingConfirmed,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RequestState::PendingOptimistic | RequestState::PendingConfirmed
        )
    }

    /// Map a status label reported by the service
    pub fn from_wire(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "approved" | "accepted" => RequestState::Approved,
            "rejected" | "declined" | "denied" => RequestState::Rejected,
            "cancelled" | "canceled" | "withdrawn" => RequestState::Cancelled,
            "expired" => RequestState::Expired,
            _ => RequestState::PendingConfirmed,
        }
    }
}

/// A pairing request as the engine tracks it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub request_id: RequestId,
    pub requester_id: UserId,
    pub target_id: UserId,
    pub requester_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub origin: RequestOrigin,
    pub state: RequestState,
}

impl PairingRequest {
    /// New optimistic outgoing request with a provisional id
    pub fn optimistic(requester_id: &str, target_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            request_id: format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4()),
            requester_id: requester_id.to_string(),
            target_id: target_id.to_string(),
            requester_name: None,
            created_at: now,
            origin: RequestOrigin::Optimistic,
            state: RequestState::PendingOptimistic,
        }
    }

    /// Request first learned from a snapshot
    pub fn from_remote(remote: &RemoteRequest, now: DateTime<Utc>) -> Self {
        Self {
            request_id: remote.request_id.clone(),
            requester_id: remote.requester_id.clone(),
            target_id: remote.target_id.clone(),
            requester_name: remote.requester_name.clone(),
            created_at: remote.created_at.unwrap_or(now),
            origin: RequestOrigin::Confirmed,
            state: RequestState::PendingConfirmed,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.request_id.starts_with(PROVISIONAL_PREFIX)
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.created_at, now)
    }

    fn within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) < window
    }

    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.state == RequestState::PendingOptimistic && self.age(now) >= ttl
    }
}

/// Outgoing and incoming pairing requests of one session context
#[derive(Debug, Default)]
pub struct PendingStore {
    outgoing: Vec<PairingRequest>,
    incoming: Vec<PairingRequest>,
    /// target id -> suppressed until
    cancelled_targets: HashMap<UserId, DateTime<Utc>>,
    /// incoming request id -> suppressed until
    responded_incoming: HashMap<RequestId, DateTime<Utc>>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outgoing(&self) -> &[PairingRequest] {
        &self.outgoing
    }

    pub fn incoming(&self) -> &[PairingRequest] {
        &self.incoming
    }

    /// The non-terminal outgoing request addressed to `target_id`, if any
    pub fn active_outgoing_for(&self, target_id: &str) -> Option<&PairingRequest> {
        self.outgoing
            .iter()
            .find(|r| r.target_id == target_id && r.state.is_pending())
    }

    pub fn find_incoming(&self, request_id: &str) -> Option<&PairingRequest> {
        self.incoming.iter().find(|r| r.request_id == request_id)
    }

    /// Append a new optimistic outgoing request
    pub fn insert_optimistic(
        &mut self,
        requester_id: &str,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> PairingRequest {
        self.cancelled_targets.remove(target_id);
        let request = PairingRequest::optimistic(requester_id, target_id, now);
        self.outgoing.push(request.clone());
        request
    }

    /// Swap a provisional id for the server-issued one, in place.
    ///
    /// Returns the confirmed entry. When a snapshot already adopted the
    /// request under its server id, that entry is returned unchanged.
    pub fn confirm(&mut self, provisional_id: &str, server_id: &str) -> Option<PairingRequest> {
        if let Some(existing) = self.outgoing.iter().find(|r| r.request_id == server_id) {
            let existing = existing.clone();
            // A snapshot may have appended the server entry next to ours
            self.outgoing.retain(|r| r.request_id != provisional_id);
            return Some(existing);
        }

        let entry = self
            .outgoing
            .iter_mut()
            .find(|r| r.request_id == provisional_id)?;
        entry.request_id = server_id.to_string();
        entry.state = RequestState::PendingConfirmed;
        Some(entry.clone())
    }

    /// Remove an optimistic entry that the service never accepted
    pub fn rollback(&mut self, request_id: &str) -> bool {
        let before = self.outgoing.len();
        self.outgoing.retain(|r| r.request_id != request_id);
        self.outgoing.len() != before
    }

    /// Remove the outgoing request for `target_id` and keep the target
    /// suppressed for `window`
    pub fn cancel_outgoing(&mut self, target_id: &str, now: DateTime<Utc>, window: Duration) -> bool {
        self.cancelled_targets
            .insert(target_id.to_string(), now + to_chrono(window));
        let before = self.outgoing.len();
        self.outgoing.retain(|r| r.target_id != target_id);
        self.outgoing.len() != before
    }

    /// Remove an answered incoming request and keep its id suppressed for `window`
    pub fn take_incoming(
        &mut self,
        request_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Option<PairingRequest> {
        self.responded_incoming
            .insert(request_id.to_string(), now + to_chrono(window));
        let index = self.incoming.iter().position(|r| r.request_id == request_id)?;
        Some(self.incoming.remove(index))
    }

    /// Drop every outgoing request; returns true if any existed
    pub fn clear_outgoing(&mut self) -> bool {
        let had_any = !self.outgoing.is_empty();
        self.outgoing.clear();
        had_any
    }

    /// Expire optimistic entries older than `ttl`; returns them marked `Expired`
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<PairingRequest> {
        let mut expired = Vec::new();
        self.outgoing.retain(|r| {
            if r.is_expired(ttl, now) {
                let mut r = r.clone();
                r.state = RequestState::Expired;
                expired.push(r);
                false
            } else {
                true
            }
        });
        expired
    }

    fn prune_suppressions(&mut self, now: DateTime<Utc>) {
        self.cancelled_targets.retain(|_, until| *until > now);
        self.responded_incoming.retain(|_, until| *until > now);
    }

    /// Merge the outgoing list of a snapshot; returns true if the list changed
    pub fn merge_outgoing(
        &mut self,
        fresh: &[RemoteRequest],
        now: DateTime<Utc>,
        grace: Duration,
    ) -> bool {
        self.prune_suppressions(now);

        let fresh: Vec<&RemoteRequest> = fresh
            .iter()
            .filter(|r| r.state.is_pending() && !self.cancelled_targets.contains_key(&r.target_id))
            .collect();

        if fresh.is_empty() && self.outgoing.iter().any(|r| r.within(grace, now)) {
            debug!("Ignoring empty outgoing list inside the grace window");
            return false;
        }

        let mut used = vec![false; fresh.len()];
        let mut merged: Vec<PairingRequest> = Vec::with_capacity(self.outgoing.len().max(fresh.len()));

        for local in &self.outgoing {
            let matched = fresh
                .iter()
                .enumerate()
                .position(|(i, r)| !used[i] && r.request_id == local.request_id)
                .or_else(|| {
                    fresh
                        .iter()
                        .enumerate()
                        .position(|(i, r)| !used[i] && r.target_id == local.target_id)
                });

            match matched {
                Some(index) => {
                    used[index] = true;
                    let remote = fresh[index];
                    merged.push(PairingRequest {
                        request_id: remote.request_id.clone(),
                        requester_id: local.requester_id.clone(),
                        target_id: local.target_id.clone(),
                        requester_name: remote
                            .requester_name
                            .clone()
                            .or_else(|| local.requester_name.clone()),
                        created_at: local.created_at,
                        origin: RequestOrigin::Confirmed,
                        state: RequestState::PendingConfirmed,
                    });
                }
                None if local.state == RequestState::PendingOptimistic || local.within(grace, now) => {
                    merged.push(local.clone());
                }
                None => debug!("Dropping outgoing request {} no longer listed", local.request_id),
            }
        }

        for (index, remote) in fresh.iter().enumerate() {
            if used[index] || merged.iter().any(|r| r.target_id == remote.target_id) {
                continue;
            }
            merged.push(PairingRequest::from_remote(remote, now));
        }

        let changed = merged != self.outgoing;
        self.outgoing = merged;
        changed
    }

    /// Merge the incoming list of a snapshot; returns true if the list changed
    pub fn merge_incoming(&mut self, fresh: &[RemoteRequest], now: DateTime<Utc>) -> bool {
        self.prune_suppressions(now);

        let mut merged: Vec<PairingRequest> = Vec::with_capacity(fresh.len());
        for remote in fresh {
            if !remote.state.is_pending() || self.responded_incoming.contains_key(&remote.request_id) {
                continue;
            }
            // One visible request per requester
            if merged.iter().any(|r| r.requester_id == remote.requester_id) {
                continue;
            }

            let mut request = PairingRequest::from_remote(remote, now);
            if let Some(known) = self.find_incoming(&remote.request_id) {
                request.created_at = known.created_at;
                request.requester_name = request
                    .requester_name
                    .or_else(|| known.requester_name.clone());
            }
            merged.push(request);
        }

        let changed = merged != self.incoming;
        self.incoming = merged;
        changed
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
