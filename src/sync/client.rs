//! The sync client: one connected identity, its session context, and the
//! public operations UI collaborators call.
//!
//! A session context (pending store + reconciler + poller) is created for
//! every connected identity and retired on disconnect, logout or reconnect.
//! Each context carries a generation number; a poll or mutation result that
//! resolves after its context was retired is dropped.
//!
//! Locks are never held across an `.await`. Events are collected while the
//! context lock is held and emitted after it is released, so subscribers may
//! call back into the client. A per-context ordering lock spans both steps,
//! so events go out in the order their state changes were made.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus, EventKind, SubscriptionId};
use super::pending::{PairingRequest, PendingStore, RequestState};
use super::poller::{spawn_ticker, PollSource, SnapshotPoller};
use super::protocol::{self, IdentityStatus, PairingOutcome, PartnerInfo, PeerInfo, SharedCard};
use super::reconciler::{requests_updated, Reconciler, SessionState};
use super::{EngineError, EngineMetrics, EngineResult, EngineSettings, SessionId};
use crate::clock::{Clock, SystemClock};
use crate::connection::{ConnectionManager, ConnectionState, Identity};
use crate::storage::SettingsStore;
use crate::telemetry::{MetricEvent, MetricKind, TelemetryBuffer};
use crate::transport::Transport;

pub use crate::connection::ReconnectOutcome;

/// Result of [`SyncClient::send_pairing_request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequestResult {
    pub request: PairingRequest,
    /// The request already existed; no new call was made
    pub already_pending: bool,
}

/// Result of [`SyncClient::respond_to_pairing_request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingResponseResult {
    pub request_id: String,
    pub approved: bool,
    pub outcome: PairingOutcome,
}

struct ContextState {
    store: PendingStore,
    reconciler: Reconciler,
}

/// State owned by one connected identity
struct SessionContext {
    generation: u64,
    identity: Identity,
    poller: SnapshotPoller,
    state: Mutex<ContextState>,
    /// Held from a state change until its events are emitted
    emit_order: ReentrantMutex<()>,
}

/// Builder for [`SyncClient`]
pub struct SyncClientBuilder {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    store: Option<SettingsStore>,
    settings: Option<EngineSettings>,
    background_tasks: bool,
}

impl SyncClientBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            store: None,
            settings: None,
            background_tasks: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist settings and credentials in `store`
    pub fn with_store(mut self, store: SettingsStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Initial settings; overrides anything persisted
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Whether connecting starts the poll and telemetry loops
    pub fn with_background_tasks(mut self, enabled: bool) -> Self {
        self.background_tasks = enabled;
        self
    }

    pub fn build(self) -> Arc<SyncClient> {
        let persisted = self.store.as_ref().and_then(|store| match store.load_settings() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load persisted settings: {}", e);
                None
            }
        });
        let settings = self
            .settings
            .or(persisted)
            .unwrap_or_default()
            .clamped();

        let (poll_interval_tx, _) = watch::channel(settings.poll_interval);
        let (flush_interval_tx, _) = watch::channel(settings.telemetry_flush_interval);
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(SyncClient {
            connection: ConnectionManager::new(self.transport.clone(), self.store.clone()),
            transport: self.transport,
            bus: Arc::new(EventBus::new()),
            clock: self.clock,
            store: self.store,
            telemetry: TelemetryBuffer::new(settings.telemetry_flush_size),
            settings: RwLock::new(settings),
            metrics: Mutex::new(EngineMetrics::default()),
            context: RwLock::new(None),
            generation: AtomicU64::new(0),
            last_state: Mutex::new(ConnectionState::Disconnected),
            background_tasks: self.background_tasks,
            poll_interval_tx,
            flush_interval_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Client engine facade
pub struct SyncClient {
    transport: Arc<dyn Transport>,
    connection: ConnectionManager,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    store: Option<SettingsStore>,
    telemetry: TelemetryBuffer,
    settings: RwLock<EngineSettings>,
    metrics: Mutex<EngineMetrics>,
    context: RwLock<Option<Arc<SessionContext>>>,
    generation: AtomicU64,
    /// Last state announced with `connectionChanged`
    last_state: Mutex<ConnectionState>,
    background_tasks: bool,
    poll_interval_tx: watch::Sender<Duration>,
    flush_interval_tx: watch::Sender<Duration>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn builder(transport: Arc<dyn Transport>) -> SyncClientBuilder {
        SyncClientBuilder::new(transport)
    }

    /// Client with default settings, system clock and no persistence
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        SyncClientBuilder::new(transport).build()
    }

    // ------------------------------------------------------------------
    // Subscriptions and accessors
    // ------------------------------------------------------------------

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.bus.off(kind, id)
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.connection.identity()
    }

    fn current_context(&self) -> Option<Arc<SessionContext>> {
        self.context.read().clone()
    }

    fn require_context(&self) -> EngineResult<Arc<SessionContext>> {
        self.current_context().ok_or(EngineError::NotConnected)
    }

    fn is_current(&self, ctx: &SessionContext) -> bool {
        self.context
            .read()
            .as_ref()
            .map(|c| c.generation == ctx.generation)
            .unwrap_or(false)
    }

    fn read_context<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&ContextState) -> T,
    {
        let ctx = self.current_context()?;
        let state = ctx.state.lock();
        let value = f(&*state);
        Some(value)
    }

    pub fn outgoing_requests(&self) -> Vec<PairingRequest> {
        self.read_context(|s| s.store.outgoing().to_vec())
            .unwrap_or_default()
    }

    pub fn incoming_requests(&self) -> Vec<PairingRequest> {
        self.read_context(|s| s.store.incoming().to_vec())
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<SessionState> {
        self.read_context(|s| s.reconciler.session().cloned())
            .flatten()
    }

    pub fn partner(&self) -> Option<PartnerInfo> {
        self.read_context(|s| s.reconciler.partner().cloned())
            .flatten()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.read_context(|s| s.reconciler.peers().to_vec())
            .unwrap_or_default()
    }

    pub fn identity_status(&self) -> Option<IdentityStatus> {
        self.read_context(|s| s.reconciler.identity_status().clone())
    }

    /// Whether the current context polls through the per-concern endpoints
    pub fn uses_fallback(&self) -> bool {
        self.current_context()
            .map(|ctx| ctx.poller.uses_fallback())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Announce `state` if it differs from the last announced one
    fn note_state(&self, state: ConnectionState) {
        {
            let mut last = self.last_state.lock();
            if *last == state {
                return;
            }
            *last = state;
        }
        self.bus.emit(&EngineEvent::ConnectionChanged { state });
    }

    /// Register a fresh identity and start polling for it
    pub async fn connect(self: &Arc<Self>, display_name: &str) -> EngineResult<Identity> {
        self.retire_context();
        self.note_state(ConnectionState::Connecting);

        let result = self.connection.connect(display_name).await;
        match &result {
            Ok(identity) => self.start_context(identity.clone()),
            Err(_) => self.restart_surviving_context(),
        }
        self.note_state(self.connection.state());
        result
    }

    /// Resume an identity; an invalid token is an outcome, not an error
    pub async fn reconnect(
        self: &Arc<Self>,
        user_id: &str,
        auth_token: &str,
    ) -> EngineResult<ReconnectOutcome> {
        self.retire_context();
        self.note_state(ConnectionState::Reconnecting);

        let result = self.connection.reconnect(user_id, auth_token).await;
        match &result {
            Ok(ReconnectOutcome::Resumed(identity)) => self.start_context(identity.clone()),
            Ok(ReconnectOutcome::InvalidToken) => {
                self.record_telemetry(MetricKind::ReconnectRejected, json!({ "userId": user_id }));
            }
            Ok(ReconnectOutcome::StaleToken(_)) => {
                self.record_telemetry(
                    MetricKind::ReconnectRejected,
                    json!({ "userId": user_id, "error": "stale_token" }),
                );
            }
            Err(e) => {
                self.record_telemetry(
                    MetricKind::ReconnectRejected,
                    json!({ "userId": user_id, "error": e.label() }),
                );
                self.restart_surviving_context();
            }
        }
        self.note_state(self.connection.state());
        result
    }

    /// Reconnect with persisted credentials; `None` when none are stored
    pub async fn resume(self: &Arc<Self>) -> EngineResult<Option<ReconnectOutcome>> {
        match self.connection.stored_credentials() {
            Some(credentials) => self
                .reconnect(&credentials.user_id, &credentials.auth_token)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Stop polling and drop all local state; credentials are kept
    pub async fn disconnect(&self) {
        self.retire_context();
        self.connection.disconnect().await;
        self.note_state(self.connection.state());
    }

    /// Like [`disconnect`](Self::disconnect), and forget stored credentials
    pub async fn logout(&self) {
        self.retire_context();
        self.connection.logout().await;
        self.note_state(self.connection.state());
    }

    /// A failed attempt leaves a previous identity in place; keep polling for it
    fn restart_surviving_context(self: &Arc<Self>) {
        if let Some(identity) = self.connection.identity() {
            self.start_context(identity);
        }
    }

    fn start_context(self: &Arc<Self>, identity: Identity) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = Arc::new(SessionContext {
            generation,
            identity,
            poller: SnapshotPoller::new(self.transport.clone()),
            state: Mutex::new(ContextState {
                store: PendingStore::new(),
                reconciler: Reconciler::new(),
            }),
            emit_order: ReentrantMutex::new(()),
        });
        *self.context.write() = Some(ctx);
        debug!("Session context {} started", generation);

        if self.background_tasks {
            self.spawn_background_tasks();
        }
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let poll_task = spawn_ticker(
            "Poll",
            self.poll_interval_tx.subscribe(),
            self.shutdown_tx.subscribe(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(client) = weak.upgrade() {
                        client.refresh().await;
                    }
                }
            },
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let flush_task = spawn_ticker(
            "Telemetry flush",
            self.flush_interval_tx.subscribe(),
            self.shutdown_tx.subscribe(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(client) = weak.upgrade() {
                        client.flush_telemetry();
                    }
                }
            },
        );

        self.tasks.lock().extend([poll_task, flush_task]);
    }

    /// Retire the current context: stop its loops and drop its state
    fn retire_context(&self) {
        let retired = self.context.write().take();
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(ctx) = retired {
            debug!("Session context {} retired", ctx.generation);
            self.flush_telemetry();
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// Poll once now. Returns false if skipped (another poll in flight, no
    /// context) or if the result was discarded.
    pub async fn refresh(&self) -> bool {
        let Some(ctx) = self.current_context() else {
            return false;
        };

        let Some(_guard) = ctx.poller.try_begin() else {
            debug!("Poll already in flight, skipping tick");
            self.metrics.lock().polls_skipped += 1;
            return false;
        };

        let result = ctx.poller.fetch(&ctx.identity).await;
        if !self.is_current(&ctx) {
            debug!("Discarding poll result of retired context {}", ctx.generation);
            return false;
        }

        let now = self.clock.now();
        let settings = self.settings();
        let succeeded = result.is_ok();

        {
            let mut metrics = self.metrics.lock();
            match &result {
                Ok(outcome) => {
                    metrics.polls_succeeded += 1;
                    if outcome.source == PollSource::Fallback {
                        metrics.fallback_polls += 1;
                    }
                }
                Err(_) => metrics.polls_failed += 1,
            }
        }

        if let Err(e) = &result {
            warn!("Poll failed: {}", e);
            self.record_telemetry(MetricKind::PollFailed, json!({ "error": e.to_string() }));
        }

        self.apply(&ctx, |state| {
            let events = match &result {
                Ok(outcome) => {
                    state
                        .reconciler
                        .reconcile(&mut state.store, &outcome.snapshot, now, &settings)
                }
                Err(_) => state.reconciler.expire_only(&mut state.store, now, &settings),
            };
            ((), events)
        });
        succeeded
    }

    /// Change context state and emit the resulting events as one step
    fn apply<T, F>(&self, ctx: &SessionContext, f: F) -> T
    where
        F: FnOnce(&mut ContextState) -> (T, Vec<EngineEvent>),
    {
        let _order = ctx.emit_order.lock();
        let (value, events) = {
            let mut state = ctx.state.lock();
            f(&mut *state)
        };
        self.publish(events);
        value
    }

    /// Emit reconciliation events, then account for expiries
    fn publish(&self, events: Vec<EngineEvent>) {
        let expired: Vec<PairingRequest> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::PairingRequestExpired { request } => Some(request.clone()),
                _ => None,
            })
            .collect();

        self.bus.emit_all(events);

        if expired.is_empty() {
            return;
        }
        for request in &expired {
            info!("Pairing request {} to {} expired", request.request_id, request.target_id);
            self.record_telemetry(
                MetricKind::RequestExpired,
                json!({ "requestId": request.request_id, "targetId": request.target_id }),
            );
        }
        let count = expired.len() as u64;
        self.bump_metrics(|m| m.requests_expired += count);
    }

    /// Apply `f` to the counters and announce them
    fn bump_metrics<F: FnOnce(&mut EngineMetrics)>(&self, f: F) {
        let metrics = {
            let mut metrics = self.metrics.lock();
            f(&mut metrics);
            metrics.clone()
        };
        self.bus.emit(&EngineEvent::MetricsUpdated { metrics });
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    /// Send a pairing request to `target_id`, visible locally right away
    pub async fn send_pairing_request(&self, target_id: &str) -> EngineResult<PairingRequestResult> {
        let ctx = self.require_context()?;
        if target_id == ctx.identity.user_id {
            return Err(EngineError::SelfTarget(target_id.to_string()));
        }

        let now = self.clock.now();
        let inserted = self.apply(&ctx, |state| {
            if let Some(existing) = state.store.active_outgoing_for(target_id) {
                return (Err(existing.clone()), Vec::new());
            }
            let request = state.store.insert_optimistic(&ctx.identity.user_id, target_id, now);
            (Ok(request), vec![requests_updated(&state.store)])
        });
        let request = match inserted {
            Ok(request) => request,
            Err(existing) => {
                debug!("Pairing request to {} already pending", target_id);
                return Ok(PairingRequestResult {
                    request: existing,
                    already_pending: true,
                });
            }
        };

        let result = match self.transport.request_pairing(&ctx.identity, target_id).await {
            Ok(value) => protocol::parse_request_reply(&value),
            Err(e) => Err(e.into()),
        };

        if !self.is_current(&ctx) {
            debug!("Context retired while requesting pairing with {}", target_id);
            return result.map(|_| PairingRequestResult {
                request,
                already_pending: false,
            });
        }

        match result {
            Ok(Some(server_id)) => {
                let confirmed = self.apply(&ctx, |state| {
                    let confirmed = state.store.confirm(&request.request_id, &server_id);
                    let events = match confirmed {
                        Some(_) => vec![requests_updated(&state.store)],
                        None => Vec::new(),
                    };
                    (confirmed, events)
                });
                let request = match confirmed {
                    Some(confirmed) => confirmed,
                    // Expired or cancelled while the call was in flight
                    None => PairingRequest {
                        request_id: server_id,
                        state: RequestState::PendingConfirmed,
                        ..request
                    },
                };
                Ok(PairingRequestResult {
                    request,
                    already_pending: false,
                })
            }
            Ok(None) => {
                debug!("Pairing request to {} accepted without an id", target_id);
                Ok(PairingRequestResult {
                    request,
                    already_pending: false,
                })
            }
            Err(e) => {
                warn!("Pairing request to {} failed, rolling back: {}", target_id, e);
                self.apply(&ctx, |state| {
                    let removed = state.store.rollback(&request.request_id);
                    let events: Vec<EngineEvent> = removed
                        .then(|| requests_updated(&state.store))
                        .into_iter()
                        .collect();
                    ((), events)
                });
                self.bump_metrics(|m| m.optimistic_rollbacks += 1);
                self.record_telemetry(
                    MetricKind::RequestRolledBack,
                    json!({ "targetId": target_id, "error": e.label() }),
                );
                Err(e)
            }
        }
    }

    /// Approve or reject an incoming request. The request leaves the
    /// incoming list immediately, whatever the outcome.
    pub async fn respond_to_pairing_request(
        &self,
        request_id: &str,
        approve: bool,
    ) -> EngineResult<PairingResponseResult> {
        let ctx = self.require_context()?;
        let now = self.clock.now();
        let ttl = self.settings().optimistic_ttl;

        let taken = self.apply(&ctx, |state| {
            let taken = state.store.take_incoming(request_id, now, ttl);
            let events: Vec<EngineEvent> = taken
                .as_ref()
                .map(|_| requests_updated(&state.store))
                .into_iter()
                .collect();
            (taken, events)
        });

        let result = match self
            .transport
            .respond_pairing(&ctx.identity, request_id, approve)
            .await
        {
            Ok(value) => protocol::parse_pairing_outcome(&value),
            Err(e) => Err(e.into()),
        };

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Responding to pairing request {} failed: {}", request_id, e);
                self.record_telemetry(
                    MetricKind::MutationFailed,
                    json!({ "operation": "respond_pairing", "requestId": request_id, "error": e.label() }),
                );
                return Err(e);
            }
        };

        if outcome.partner_id.is_none() && outcome.is_formed() {
            outcome.partner_id = taken.map(|r| r.requester_id);
        }

        if approve && outcome.is_formed() && self.is_current(&ctx) {
            self.apply(&ctx, |state| {
                let mut events = Vec::new();
                if state.store.clear_outgoing() {
                    events.push(requests_updated(&state.store));
                }
                events.extend(
                    state
                        .reconciler
                        .record_pairing(outcome.couple_id.clone(), outcome.partner_id.clone()),
                );
                if let Some(session_id) = &outcome.session_id {
                    events.extend(state.reconciler.start_session(session_id));
                }
                ((), events)
            });
        }

        Ok(PairingResponseResult {
            request_id: request_id.to_string(),
            approved: approve,
            outcome,
        })
    }

    /// Withdraw the outgoing request to `target_id`. Removed locally first
    /// and never restored, even when the call fails.
    pub async fn cancel_pairing_request(&self, target_id: &str) -> EngineResult<()> {
        let ctx = self.require_context()?;
        let now = self.clock.now();
        let grace = self.settings().grace_window;

        self.apply(&ctx, |state| {
            let removed = state.store.cancel_outgoing(target_id, now, grace);
            let events: Vec<EngineEvent> = removed
                .then(|| requests_updated(&state.store))
                .into_iter()
                .collect();
            ((), events)
        });

        let result = match self.transport.cancel_pairing(&ctx.identity, target_id).await {
            Ok(value) => protocol::ensure_success(&value).map(|_| ()),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &result {
            warn!("Cancelling pairing request to {} failed: {}", target_id, e);
            self.record_telemetry(
                MetricKind::MutationFailed,
                json!({ "operation": "cancel_pairing", "targetId": target_id, "error": e.label() }),
            );
        }
        result
    }

    // ------------------------------------------------------------------
    // Session actions
    // ------------------------------------------------------------------

    fn known_session_id(&self, ctx: &SessionContext) -> EngineResult<SessionId> {
        ctx.state
            .lock()
            .reconciler
            .session()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| EngineError::Application("no active session".to_string()))
    }

    fn mutation_failed(&self, operation: &str, error: &EngineError) {
        warn!("{} failed: {}", operation, error);
        self.record_telemetry(
            MetricKind::MutationFailed,
            json!({ "operation": operation, "error": error.label() }),
        );
    }

    /// Start a game session with the current partner
    pub async fn start_session(&self) -> EngineResult<Option<SessionId>> {
        let ctx = self.require_context()?;
        let result = match self.transport.start_session(&ctx.identity).await {
            Ok(value) => protocol::parse_session_reply(&value),
            Err(e) => Err(e.into()),
        };

        let session_id = result.map_err(|e| {
            self.mutation_failed("start_session", &e);
            e
        })?;

        if let (Some(id), true) = (&session_id, self.is_current(&ctx)) {
            self.apply(&ctx, |state| ((), state.reconciler.start_session(id)));
        }
        Ok(session_id)
    }

    /// End the known session
    pub async fn end_session(&self) -> EngineResult<()> {
        let ctx = self.require_context()?;
        let session_id = self.known_session_id(&ctx)?;

        let result = match self.transport.end_session(&ctx.identity, &session_id).await {
            Ok(value) => protocol::ensure_success(&value).map(|_| ()),
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| {
            self.mutation_failed("end_session", &e);
            e
        })?;

        if self.is_current(&ctx) {
            self.apply(&ctx, |state| {
                let events = state.reconciler.end_session(Some(&session_id));
                ((), events.into_iter().collect())
            });
        }
        Ok(())
    }

    /// Draw a card in the known session
    pub async fn draw_card(&self, content: &str) -> EngineResult<SharedCard> {
        let ctx = self.require_context()?;
        let session_id = self.known_session_id(&ctx)?;

        let result = match self
            .transport
            .draw_card(&ctx.identity, &session_id, content)
            .await
        {
            Ok(value) => protocol::parse_drawn_card(&value),
            Err(e) => Err(e.into()),
        };
        let drawn = result.map_err(|e| {
            self.mutation_failed("draw_card", &e);
            e
        })?;

        let card = drawn.card.unwrap_or_else(|| SharedCard {
            card_id: None,
            content: content.to_string(),
            drawn_by: Some(ctx.identity.user_id.clone()),
        });

        if self.is_current(&ctx) {
            self.apply(&ctx, |state| {
                let events = state.reconciler.record_drawn_card(card.clone(), drawn.total);
                ((), events.into_iter().collect())
            });
        }
        Ok(card)
    }

    // ------------------------------------------------------------------
    // Settings and telemetry
    // ------------------------------------------------------------------

    /// Apply new settings (clamped), persist them and announce the change
    pub fn update_settings(&self, settings: EngineSettings) -> EngineSettings {
        let settings = settings.clamped();
        {
            let mut current = self.settings.write();
            if *current == settings {
                return settings;
            }
            *current = settings.clone();
        }

        self.telemetry.set_flush_size(settings.telemetry_flush_size);
        self.poll_interval_tx.send_if_modified(|period| {
            let changed = *period != settings.poll_interval;
            *period = settings.poll_interval;
            changed
        });
        self.flush_interval_tx.send_if_modified(|period| {
            let changed = *period != settings.telemetry_flush_interval;
            *period = settings.telemetry_flush_interval;
            changed
        });

        if let Some(store) = &self.store {
            if let Err(e) = store.save_settings(&settings) {
                tracing::error!("Failed to persist settings: {}", e);
            }
        }

        info!("Settings updated: {:?}", settings);
        self.bus.emit(&EngineEvent::SettingsUpdated {
            settings: settings.clone(),
        });
        settings
    }

    fn record_telemetry(&self, kind: MetricKind, payload: serde_json::Value) {
        let event = MetricEvent::new(kind, payload, self.clock.now());
        if let Some(records) = self.telemetry.record(event) {
            self.bus.emit(&EngineEvent::TelemetryBatch { records });
        }
    }

    /// Flush buffered telemetry as one batch; false when nothing was buffered
    pub fn flush_telemetry(&self) -> bool {
        match self.telemetry.flush() {
            Some(records) => {
                debug!("Flushing {} telemetry records", records.len());
                self.bus.emit(&EngineEvent::TelemetryBatch { records });
                true
            }
            None => false,
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{MemoryCall, MemoryTransport, TransportError};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        transport: MemoryTransport,
        clock: Arc<ManualClock>,
        client: Arc<SyncClient>,
        events: Arc<Mutex<Vec<EngineEvent>>>,
    }

    fn fixture_with(transport: MemoryTransport) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let client = SyncClient::builder(Arc::new(transport.clone()))
            .with_clock(clock.clone())
            .with_background_tasks(false)
            .build();

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let events = events.clone();
            client.on(kind, move |event| events.lock().push(event.clone()));
        }

        Fixture {
            transport,
            clock,
            client,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryTransport::new())
    }

    impl Fixture {
        fn take_kinds(&self) -> Vec<EventKind> {
            self.events.lock().drain(..).map(|e| e.kind()).collect()
        }

        fn take_events(&self) -> Vec<EngineEvent> {
            self.events.lock().drain(..).collect()
        }
    }

    #[tokio::test]
    async fn test_connect_announces_state() {
        let f = fixture();

        let identity = assert_ok!(f.client.connect("Alice").await);

        assert_eq!(identity.user_id, "U1");
        assert_eq!(f.client.connection_state(), ConnectionState::Connected);
        assert_eq!(
            f.take_events(),
            vec![
                EngineEvent::ConnectionChanged {
                    state: ConnectionState::Connecting
                },
                EngineEvent::ConnectionChanged {
                    state: ConnectionState::Connected
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let f = fixture();
        assert!(matches!(
            f.client.send_pairing_request("U2").await,
            Err(EngineError::NotConnected)
        ));
        assert!(!f.client.refresh().await);
    }

    #[tokio::test]
    async fn test_send_request_confirmed_in_place() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.client.connect("Alice").await.unwrap();
        f.take_kinds();

        let result = assert_ok!(f.client.send_pairing_request("U2").await);

        assert!(!result.already_pending);
        assert_eq!(result.request.state, RequestState::PendingConfirmed);
        let outgoing = f.client.outgoing_requests();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].request_id, result.request.request_id);
        assert!(!outgoing[0].is_provisional());

        // Optimistic entry first, then the confirmed one
        let events = f.take_events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            EngineEvent::PairingRequestsUpdated { outgoing, .. } => {
                assert_eq!(outgoing[0].state, RequestState::PendingOptimistic);
                assert!(outgoing[0].is_provisional());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_self_target_rejected() {
        let f = fixture();
        let identity = f.client.connect("Alice").await.unwrap();

        let result = f.client.send_pairing_request(&identity.user_id).await;

        assert!(matches!(result, Err(EngineError::SelfTarget(_))));
        assert!(f.client.outgoing_requests().is_empty());
        assert_eq!(f.transport.call_count(MemoryCall::RequestPairing), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_rolls_back() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.client.connect("Alice").await.unwrap();
        f.take_kinds();
        f.transport
            .fail_next(MemoryCall::RequestPairing, TransportError::Network("reset".into()));

        let result = f.client.send_pairing_request("U2").await;

        assert!(matches!(result, Err(EngineError::Transport(_))));
        assert!(f.client.outgoing_requests().is_empty());
        assert_eq!(f.client.metrics().optimistic_rollbacks, 1);
        assert_eq!(
            f.take_kinds(),
            vec![
                EventKind::PairingRequestsUpdated,
                EventKind::PairingRequestsUpdated,
                EventKind::MetricsUpdated,
            ]
        );
    }

    #[tokio::test]
    async fn test_application_failure_rolls_back() {
        let f = fixture();
        f.client.connect("Alice").await.unwrap();

        let result = f.client.send_pairing_request("nobody").await;

        assert!(matches!(result, Err(EngineError::Application(msg)) if msg == "target not found"));
        assert!(f.client.outgoing_requests().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_one_entry() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.client.connect("Alice").await.unwrap();

        let (first, second) = tokio::join!(
            f.client.send_pairing_request("U2"),
            f.client.send_pairing_request("U2"),
        );

        assert!(!first.unwrap().already_pending);
        assert!(second.unwrap().already_pending);
        assert_eq!(f.client.outgoing_requests().len(), 1);
        assert_eq!(f.transport.call_count(MemoryCall::RequestPairing), 1);
    }

    #[tokio::test]
    async fn test_request_without_id_expires_after_ttl() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.transport.set_issue_request_ids(false);
        f.transport.set_hide_requests(true);
        f.client.connect("Alice").await.unwrap();

        let result = f.client.send_pairing_request("U2").await.unwrap();
        assert!(result.request.is_provisional());
        assert!(f.client.refresh().await);
        f.take_kinds();

        f.clock.advance(Duration::from_secs(29));
        assert!(f.client.refresh().await);
        assert_eq!(f.client.outgoing_requests().len(), 1);

        f.clock.advance(Duration::from_secs(1));
        assert!(f.client.refresh().await);

        assert!(f.client.outgoing_requests().is_empty());
        assert_eq!(f.client.metrics().requests_expired, 1);
        let kinds = f.take_kinds();
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::PairingRequestExpired).count(),
            1
        );
        assert!(kinds.contains(&EventKind::MetricsUpdated));
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_state_and_still_expires() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.transport.set_issue_request_ids(false);
        f.transport.set_hide_requests(true);
        f.client.connect("Alice").await.unwrap();
        f.client.send_pairing_request("U2").await.unwrap();

        f.clock.advance(Duration::from_secs(30));
        f.transport
            .fail_next(MemoryCall::Snapshot, TransportError::Network("timeout".into()));
        assert!(!f.client.refresh().await);

        let metrics = f.client.metrics();
        assert_eq!(metrics.polls_failed, 1);
        assert_eq!(metrics.requests_expired, 1);
        assert!(f.client.outgoing_requests().is_empty());
    }

    #[tokio::test]
    async fn test_same_snapshot_twice_emits_nothing_more() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.client.connect("Alice").await.unwrap();

        assert!(f.client.refresh().await);
        f.take_kinds();
        assert!(f.client.refresh().await);

        assert!(f.take_kinds().is_empty());
        assert_eq!(f.client.metrics().polls_succeeded, 2);
    }

    #[tokio::test]
    async fn test_pairing_flow_between_two_clients() {
        let transport = MemoryTransport::new();
        let alice = fixture_with(transport.clone());
        let bob = fixture_with(transport.clone());

        transport.add_user("U9", "Carol", "tok-9");

        let alice_id = alice.client.connect("Alice").await.unwrap();
        let bob_id = bob.client.connect("Bob").await.unwrap();
        bob.client.send_pairing_request("U9").await.unwrap();
        assert_eq!(bob.client.outgoing_requests().len(), 1);

        let sent = alice.client.send_pairing_request(&bob_id.user_id).await.unwrap();
        let request_id = sent.request.request_id.clone();
        assert!(alice.client.refresh().await);

        assert!(bob.client.refresh().await);
        assert_eq!(bob.client.incoming_requests().len(), 1);
        assert_eq!(bob.client.incoming_requests()[0].requester_id, alice_id.user_id);
        bob.take_kinds();

        let response = bob
            .client
            .respond_to_pairing_request(&request_id, true)
            .await
            .unwrap();

        assert!(response.outcome.is_formed());
        assert_eq!(response.outcome.partner_id.as_deref(), Some(alice_id.user_id.as_str()));
        assert!(bob.client.incoming_requests().is_empty());
        assert!(bob.client.outgoing_requests().is_empty());
        assert_eq!(
            bob.client.session().map(|s| s.session_id),
            response.outcome.session_id
        );

        let events = bob.take_events();
        let formed = events
            .iter()
            .position(|e| e.kind() == EventKind::PairingFormed)
            .unwrap();
        let started = events
            .iter()
            .position(|e| e.kind() == EventKind::SessionStarted)
            .unwrap();
        assert!(formed < started);
        match &events[formed] {
            EngineEvent::PairingFormed {
                couple_id,
                partner_id,
            } => {
                assert!(couple_id.is_some());
                assert_eq!(couple_id, &response.outcome.couple_id);
                assert_eq!(partner_id.as_deref(), Some(alice_id.user_id.as_str()));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[started] {
            EngineEvent::SessionStarted { session_id } => {
                assert_eq!(Some(session_id), response.outcome.session_id.as_ref());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Bob's next poll does not repeat what the response already told him
        assert!(bob.client.refresh().await);
        let kinds = bob.take_kinds();
        assert!(!kinds.contains(&EventKind::PairingFormed));
        assert!(!kinds.contains(&EventKind::SessionStarted));

        // Alice learns everything from her next poll
        alice.take_kinds();
        assert!(alice.client.refresh().await);
        let kinds = alice.take_kinds();
        assert!(kinds.contains(&EventKind::SessionStarted));
        assert!(kinds.contains(&EventKind::PartnerUpdated));
        assert!(alice.client.outgoing_requests().is_empty());
    }

    #[tokio::test]
    async fn test_cards_and_session_end_reach_the_partner() {
        let transport = MemoryTransport::new();
        let alice = fixture_with(transport.clone());
        let bob = fixture_with(transport.clone());
        let alice_id = alice.client.connect("Alice").await.unwrap();
        let bob_id = bob.client.connect("Bob").await.unwrap();
        let sent = alice.client.send_pairing_request(&bob_id.user_id).await.unwrap();
        bob.client.refresh().await;
        bob.client
            .respond_to_pairing_request(&sent.request.request_id, true)
            .await
            .unwrap();
        alice.client.refresh().await;
        bob.client.refresh().await;
        alice.take_kinds();
        bob.take_kinds();

        let card = bob.client.draw_card("What made you smile today?").await.unwrap();
        assert_eq!(card.drawn_by.as_deref(), Some(bob_id.user_id.as_str()));
        assert_eq!(bob.take_kinds(), vec![EventKind::CardDrawn]);

        // Bob's poll does not re-announce his own card
        bob.client.refresh().await;
        assert!(bob.take_kinds().is_empty());

        alice.client.refresh().await;
        match alice.take_events().as_slice() {
            [EngineEvent::CardDrawn { card, index, .. }] => {
                assert_eq!(*index, 0);
                assert_eq!(card.content, "What made you smile today?");
                assert_eq!(card.drawn_by.as_deref(), Some(bob_id.user_id.as_str()));
            }
            other => panic!("unexpected events {:?}", other),
        }

        alice.client.end_session().await.unwrap();
        assert!(alice.client.session().is_none());
        assert_eq!(alice.take_kinds(), vec![EventKind::SessionEnded]);

        bob.client.refresh().await;
        assert_eq!(bob.take_kinds(), vec![EventKind::SessionEnded]);
        assert!(bob.client.session().is_none());
        assert_ne!(alice_id.user_id, bob_id.user_id);
    }

    #[tokio::test]
    async fn test_cancel_is_not_rolled_back() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        f.client.connect("Alice").await.unwrap();
        f.client.send_pairing_request("U2").await.unwrap();
        f.transport
            .fail_next(MemoryCall::CancelPairing, TransportError::Network("reset".into()));

        assert_err!(f.client.cancel_pairing_request("U2").await);

        assert!(f.client.outgoing_requests().is_empty());
        // The service still lists it, but the cancelled target stays hidden
        assert!(f.client.refresh().await);
        assert!(f.client.outgoing_requests().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_polling() {
        let transport = MemoryTransport::new();
        transport.set_snapshot_enabled(false);
        transport.add_user("U2", "Bob", "tok-2");
        let f = fixture_with(transport);
        f.client.connect("Alice").await.unwrap();

        assert!(f.client.refresh().await);
        assert!(f.client.refresh().await);

        assert!(f.client.uses_fallback());
        assert_eq!(f.client.metrics().fallback_polls, 2);
        assert_eq!(f.client.peers().len(), 1);
        assert_eq!(f.transport.call_count(MemoryCall::Snapshot), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_state_and_discards_late_results() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        let client = f.client.clone();
        client.connect("Alice").await.unwrap();
        client.send_pairing_request("U2").await.unwrap();

        let (refreshed, _) = tokio::join!(client.refresh(), client.disconnect());

        assert!(!refreshed);
        assert!(client.outgoing_requests().is_empty());
        assert!(client.session().is_none());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.identity().is_none());
    }

    #[tokio::test]
    async fn test_resume_after_disconnect() {
        let store = SettingsStore::open_temporary().unwrap();
        let transport = MemoryTransport::new();
        let client = SyncClient::builder(Arc::new(transport.clone()))
            .with_store(store)
            .with_background_tasks(false)
            .build();

        assert_eq!(client.resume().await.unwrap(), None);
        let identity = client.connect("Alice").await.unwrap();
        client.disconnect().await;

        let outcome = client.resume().await.unwrap().unwrap();
        assert_eq!(outcome.identity().map(|i| i.user_id.clone()), Some(identity.user_id.clone()));
        assert!(client.refresh().await);

        client.logout().await;
        assert_eq!(client.resume().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_token_is_structured() {
        let f = fixture();
        let identity = f.client.connect("Alice").await.unwrap();
        f.client.disconnect().await;
        f.transport.revoke_token(&identity.user_id);

        let outcome = f
            .client
            .reconnect(&identity.user_id, &identity.auth_token)
            .await
            .unwrap();

        assert_eq!(outcome, ReconnectOutcome::InvalidToken);
        assert_eq!(f.client.connection_state(), ConnectionState::Disconnected);
        assert!(f.client.flush_telemetry());
    }

    #[tokio::test]
    async fn test_update_settings_clamps_and_announces() {
        let store = SettingsStore::open_temporary().unwrap();
        let client = SyncClient::builder(Arc::new(MemoryTransport::new()))
            .with_store(store.clone())
            .with_background_tasks(false)
            .build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.on(EventKind::SettingsUpdated, move |e| sink.lock().push(e.clone()));

        let applied = client.update_settings(
            EngineSettings::default().with_optimistic_ttl(Duration::from_secs(1)),
        );
        // Same settings again: no announcement
        client.update_settings(applied.clone());

        assert_eq!(applied.optimistic_ttl, crate::sync::MIN_OPTIMISTIC_TTL);
        assert_eq!(client.settings(), applied);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(store.load_settings().unwrap(), Some(applied));
    }

    #[tokio::test]
    async fn test_telemetry_flushes_on_size() {
        let f = fixture();
        f.client.update_settings(EngineSettings::default().with_telemetry_flush_size(2));
        f.client.connect("Alice").await.unwrap();
        f.take_kinds();

        f.transport
            .fail_next(MemoryCall::Snapshot, TransportError::Network("a".into()));
        f.transport
            .fail_next(MemoryCall::Snapshot, TransportError::Network("b".into()));
        f.client.refresh().await;
        assert!(!f.take_kinds().contains(&EventKind::TelemetryBatch));
        f.client.refresh().await;

        let batches: Vec<EngineEvent> = f
            .take_events()
            .into_iter()
            .filter(|e| e.kind() == EventKind::TelemetryBatch)
            .collect();
        match batches.as_slice() {
            [EngineEvent::TelemetryBatch { records }] => {
                assert_eq!(records.len(), 2);
                assert!(records.iter().all(|r| r.kind == MetricKind::PollFailed));
            }
            other => panic!("unexpected batches {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_background_poll_fetches_immediately() {
        let transport = MemoryTransport::new();
        let client = SyncClient::builder(Arc::new(transport.clone()))
            .with_settings(EngineSettings::default().with_poll_interval(Duration::from_secs(60)))
            .build();

        client.connect("Alice").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.metrics().polls_succeeded == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        client.disconnect().await;
        assert_eq!(transport.call_count(MemoryCall::Snapshot), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_previous_context() {
        let f = fixture();
        f.transport.add_user("U2", "Bob", "tok-2");
        let identity = f.client.connect("Alice").await.unwrap();
        f.transport
            .fail_next(MemoryCall::Connect, TransportError::Network("down".into()));

        assert_err!(f.client.connect("Alice again").await);

        assert_eq!(f.client.connection_state(), ConnectionState::Connected);
        assert_eq!(f.client.identity(), Some(identity));
        assert!(f.client.refresh().await);
        assert_ok!(f.client.send_pairing_request("U2").await);
    }

    #[tokio::test]
    async fn test_stale_token_is_structured() {
        let f = fixture();
        let identity = f.client.connect("Alice").await.unwrap();
        f.transport.answer_reconnect_as(Some("OTHER"));

        let outcome = assert_ok!(
            f.client
                .reconnect(&identity.user_id, &identity.auth_token)
                .await
        );

        assert_eq!(outcome, ReconnectOutcome::StaleToken(identity.user_id.clone()));
        assert_eq!(f.client.connection_state(), ConnectionState::Disconnected);
        assert!(f.client.identity().is_none());
        assert!(!f.client.refresh().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_request_lists_match_state_when_emitted() {
        let transport = MemoryTransport::new();
        for i in 0..8 {
            transport.add_user(&format!("P{}", i), "Peer", &format!("tok-{}", i));
        }
        let client = SyncClient::builder(Arc::new(transport.clone()))
            .with_background_tasks(false)
            .build();

        let stale = Arc::new(AtomicUsize::new(0));
        let counter = stale.clone();
        let observer = Arc::downgrade(&client);
        client.on(EventKind::PairingRequestsUpdated, move |event| {
            let (EngineEvent::PairingRequestsUpdated { outgoing, incoming }, Some(client)) =
                (event, observer.upgrade())
            else {
                return;
            };
            if *outgoing != client.outgoing_requests() || *incoming != client.incoming_requests() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.connect("Alice").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let sender = client.clone();
            handles.push(tokio::spawn(async move {
                sender
                    .send_pairing_request(&format!("P{}", i))
                    .await
                    .map(|_| ())
            }));
            let poller = client.clone();
            handles.push(tokio::spawn(async move {
                poller.refresh().await;
                Ok::<(), EngineError>(())
            }));
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert_eq!(client.outgoing_requests().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_flushes_on_interval() {
        let transport = MemoryTransport::new();
        let settings = EngineSettings::default()
            .with_poll_interval(Duration::from_secs(600))
            .with_telemetry_flush_interval(Duration::from_secs(10));
        let client = SyncClient::builder(Arc::new(transport.clone()))
            .with_settings(settings)
            .build();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        client.on(EventKind::TelemetryBatch, move |e| sink.lock().push(e.clone()));

        client.connect("Alice").await.unwrap();
        while client.metrics().polls_succeeded == 0 {
            tokio::task::yield_now().await;
        }

        // One record, well below the size threshold
        transport.fail_next(MemoryCall::Snapshot, TransportError::Network("down".into()));
        assert!(!client.refresh().await);
        assert!(batches.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        match batches.lock().as_slice() {
            [EngineEvent::TelemetryBatch { records }] => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].kind, MetricKind::PollFailed);
            }
            other => panic!("unexpected batches {:?}", other),
        }
        client.disconnect().await;
    }
}
