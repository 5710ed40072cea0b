//! The session engine: owns the connection-state machine, both transport
//! connections, and the two-tier reconnection strategy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use wavelink_proto::{
    DisconnectReason, IceCandidateInit, IceServer, JoinResponse, SessionDescription,
    SignalRequest, SignalResponse, SignalTarget, SimulateScenario, SyncState, TrackInfo,
    TrackKind,
};

use crate::config::{ConnectOptions, ReconnectOverride};
use crate::error::{EngineError, NegotiationError, SignalError};
use crate::events::EngineEvent;
use crate::region::{RegionUrlProvider, is_managed_domain};
use crate::rtc::webrtc::RtcConnectionFactory;
use crate::rtc::{
    MediaConnectionFactory, SessionTransport, TransportEvent, TransportEventKind,
};
use crate::signal::{
    CLOSE_CODE_NORMAL, ConnectMode, JoinHandshake, SignalChannel, SignalEvent,
};
use crate::track::{LocalTrack, LocalTrackRegistry};

/// Fallbacks when neither the caller nor the server provides ICE servers.
const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Combined state of the signaling channel and the primary transport
/// connection. Only the engine mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Lightweight recovery: resume the logical session via ICE restart.
    Resuming,
    /// Heavyweight recovery: rebuild the whole session.
    Reconnecting,
}

struct EngineState {
    conn_state: ConnectionState,
    server_url: Option<Url>,
    token: String,
    participant_sid: Option<String>,
    subscriber_primary: bool,
    has_published: bool,
    /// Correlation id of the most recent publish-direction offer.
    offer_id: u32,
    /// Set when the server asked for a rebuild on the next recovery.
    full_reconnect_on_next: bool,
    publisher: Option<Arc<SessionTransport>>,
    subscriber: Option<Arc<SessionTransport>>,
    ice_servers: Vec<IceServer>,
    closed: bool,
}

struct EngineInner {
    options: ConnectOptions,
    signal: SignalChannel,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    transport_events_tx: mpsc::UnboundedSender<TransportEvent>,
    factory: Arc<dyn MediaConnectionFactory>,
    tracks: LocalTrackRegistry,
    pending_publishes: Mutex<HashMap<String, oneshot::Sender<TrackInfo>>>,
    region: Mutex<Option<Arc<RegionUrlProvider>>>,
    reconnect_override: Mutex<ReconnectOverride>,
    state: AsyncMutex<EngineState>,
    reconnect_guard: Arc<AsyncMutex<()>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

/// Drives one room session. Reusable: after a terminal disconnect the same
/// instance accepts a fresh `connect`.
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    /// Engine with the default WebRTC transport stack.
    pub fn new(options: ConnectOptions) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::with_connection_factory(options, Arc::new(RtcConnectionFactory::new()))
    }

    /// Engine with an injected transport factory; how tests substitute a
    /// scripted media stack.
    pub fn with_connection_factory(
        options: ConnectOptions,
        factory: Arc<dyn MediaConnectionFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (signal, signal_rx) = SignalChannel::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_events_tx, transport_events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(EngineInner {
            options,
            signal,
            events_tx,
            transport_events_tx,
            factory,
            tracks: LocalTrackRegistry::new(),
            pending_publishes: Mutex::new(HashMap::new()),
            region: Mutex::new(None),
            reconnect_override: Mutex::new(ReconnectOverride::Auto),
            state: AsyncMutex::new(EngineState {
                conn_state: ConnectionState::Disconnected,
                server_url: None,
                token: String::new(),
                participant_sid: None,
                subscriber_primary: false,
                has_published: false,
                offer_id: 0,
                full_reconnect_on_next: false,
                publisher: None,
                subscriber: None,
                ice_servers: Vec::new(),
                closed: false,
            }),
            reconnect_guard: Arc::new(AsyncMutex::new(())),
            reconnect_task: Mutex::new(None),
            pump_task: Mutex::new(None),
        });

        let pump = tokio::spawn(run_event_pump(
            Arc::clone(&inner),
            signal_rx,
            transport_events_rx,
        ));
        *inner.pump_task.lock() = Some(pump);

        (Self { inner }, events_rx)
    }

    /// Connects to a room. Resolves with the join response once signaling is
    /// established, or fails with a typed connection error. For managed
    /// cloud addresses, failed handshakes fall through the ranked region
    /// candidates before giving up.
    pub async fn connect(&self, url: &str, token: &str) -> Result<JoinResponse, EngineError> {
        let server_url =
            Url::parse(url).map_err(|err| EngineError::InvalidUrl(err.to_string()))?;
        {
            let mut st = self.inner.state.lock().await;
            st.closed = false;
            st.conn_state = ConnectionState::Connecting;
            st.token = token.to_string();
            st.server_url = Some(server_url.clone());
            st.offer_id = 0;
            st.has_published = false;
            st.full_reconnect_on_next = false;
        }
        self.inner.close_transports().await;

        let provider = if is_managed_domain(&server_url) {
            let provider = Arc::new(RegionUrlProvider::new(server_url.clone(), token)?);
            provider.reset_attempts();
            Some(provider)
        } else {
            None
        };
        *self.inner.region.lock() = provider.clone();

        let mut attempt_url = server_url;
        let join = loop {
            match self.inner.establish(attempt_url.clone()).await {
                Ok(join) => break join,
                Err(err @ EngineError::Signal(SignalError::HandshakeFailed(_))) => {
                    let Some(provider) = provider.as_ref() else {
                        return Err(err);
                    };
                    tracing::warn!(
                        target = "wavelink::engine",
                        "connect failed, trying next region: {err}"
                    );
                    match provider.next_best_url().await? {
                        Some(next) => {
                            self.inner.state.lock().await.server_url = Some(next.clone());
                            attempt_url = next;
                        }
                        None => return Err(EngineError::EndpointsExhausted),
                    }
                }
                Err(err) => return Err(err),
            }
        };

        let mut st = self.inner.state.lock().await;
        self.inner.set_state_locked(&mut st, ConnectionState::Connected);
        Ok(join)
    }

    /// Publishes a local track: issues the add-track request and suspends
    /// until the server acknowledges it. `cid` is the caller's track id.
    pub async fn publish_track(
        &self,
        cid: &str,
        name: &str,
        kind: TrackKind,
    ) -> Result<TrackInfo, EngineError> {
        let inner = &self.inner;
        if inner.state.lock().await.closed {
            return Err(EngineError::Closed);
        }
        let registered = inner.tracks.register(LocalTrack {
            cid: cid.to_string(),
            sid: None,
            name: name.to_string(),
            kind,
            muted: false,
        });
        if !registered {
            return Err(EngineError::DuplicateTrack(cid.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        inner.pending_publishes.lock().insert(cid.to_string(), tx);
        inner.signal.send(SignalRequest::AddTrack {
            cid: cid.to_string(),
            name: name.to_string(),
            kind,
            muted: false,
        });
        if let Err(err) = inner.negotiate_publisher().await {
            inner.pending_publishes.lock().remove(cid);
            inner.tracks.remove_by_cid(cid);
            return Err(err);
        }

        match tokio::time::timeout(inner.options.publish_timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => {
                inner.tracks.remove_by_cid(cid);
                Err(EngineError::Closed)
            }
            Err(_) => {
                inner.pending_publishes.lock().remove(cid);
                inner.tracks.remove_by_cid(cid);
                Err(EngineError::PublishTimeout)
            }
        }
    }

    /// Mute state rides the ordered queue, so changes issued during an
    /// outage are delivered, in order, once the session recovers.
    pub fn set_track_muted(&self, track_sid: &str, muted: bool) {
        self.inner.tracks.set_muted(track_sid, muted);
        self.inner.signal.send(SignalRequest::Mute {
            track_sid: track_sid.to_string(),
            muted,
        });
    }

    pub fn update_subscription(&self, track_sids: Vec<String>, subscribe: bool) {
        self.inner.signal.send(SignalRequest::UpdateSubscription {
            track_sids,
            subscribe,
        });
    }

    pub fn update_track_settings(&self, track_sids: Vec<String>, disabled: bool) {
        self.inner.signal.send(SignalRequest::UpdateTrackSettings {
            track_sids,
            disabled,
        });
    }

    pub fn update_metadata(
        &self,
        metadata: String,
        name: String,
        attributes: HashMap<String, String>,
    ) {
        self.inner.signal.send(SignalRequest::UpdateMetadata {
            metadata,
            name,
            attributes,
        });
    }

    pub fn send_sync_state(&self, state: SyncState) {
        self.inner.signal.send(SignalRequest::SyncState(state));
    }

    /// Diagnostic hook: ask the server to play out a failure scenario.
    pub fn simulate(&self, scenario: SimulateScenario) {
        self.inner.signal.send(SignalRequest::Simulate(scenario));
    }

    /// Bypasses the automatic resume-vs-rebuild decision.
    pub fn set_reconnect_override(&self, over: ReconnectOverride) {
        *self.inner.reconnect_override.lock() = over;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().await.conn_state
    }

    /// Announces the departure to the server, then closes.
    pub async fn leave(&self) {
        self.inner.signal.send(SignalRequest::Leave {
            reason: DisconnectReason::ClientInitiated,
        });
        // The leave request rides the ordered queue; give the drain task a
        // beat before tearing the connection down underneath it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.close().await;
    }

    /// Closes the session and cancels everything outstanding. Idempotent.
    pub async fn close(&self) {
        self.inner
            .shutdown(DisconnectReason::ClientInitiated)
            .await;
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.pump_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.reconnect_task.lock().take() {
            handle.abort();
        }
    }
}

async fn run_event_pump(
    inner: Arc<EngineInner>,
    mut signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        tokio::select! {
            event = signal_rx.recv() => match event {
                Some(event) => inner.handle_signal_event(event).await,
                None => break,
            },
            event = transport_rx.recv() => match event {
                Some(event) => inner.handle_transport_event(event).await,
                None => break,
            },
        }
    }
}

impl EngineInner {
    /// Fresh join against one endpoint: handshake, transport setup, first
    /// negotiation, and release of buffered responses.
    async fn establish(self: &Arc<Self>, url: Url) -> Result<JoinResponse, EngineError> {
        let token = self.state.lock().await.token.clone();
        let handshake = self
            .signal
            .connect(&url, &token, &self.options, ConnectMode::Join)
            .await?;
        let JoinHandshake::Joined(join) = handshake else {
            return Err(
                SignalError::HandshakeFailed("expected a join response".to_string()).into(),
            );
        };
        self.configure(&join).await?;
        if !join.subscriber_primary {
            self.negotiate_publisher().await?;
        }
        self.signal.ready_for_responses();
        Ok(join)
    }

    async fn configure(self: &Arc<Self>, join: &JoinResponse) -> Result<(), EngineError> {
        // Caller override first, then the join response, then whatever the
        // server last reported (a resume acknowledgement), then fallbacks.
        let last_reported = self.state.lock().await.ice_servers.clone();
        let ice_servers = if !self.options.ice_servers.is_empty() {
            self.options.ice_servers.clone()
        } else if !join.ice_servers.is_empty() {
            join.ice_servers.clone()
        } else if !last_reported.is_empty() {
            last_reported
        } else {
            default_ice_servers()
        };

        let publisher = self
            .factory
            .create(
                SignalTarget::Publisher,
                &ice_servers,
                self.transport_events_tx.clone(),
            )
            .await?;
        let subscriber = self
            .factory
            .create(
                SignalTarget::Subscriber,
                &ice_servers,
                self.transport_events_tx.clone(),
            )
            .await?;

        {
            let mut st = self.state.lock().await;
            st.publisher = Some(Arc::new(SessionTransport::new(
                SignalTarget::Publisher,
                publisher,
            )));
            st.subscriber = Some(Arc::new(SessionTransport::new(
                SignalTarget::Subscriber,
                subscriber,
            )));
            st.subscriber_primary = join.subscriber_primary;
            st.participant_sid =
                Some(join.participant.sid.clone()).filter(|sid| !sid.is_empty());
            st.ice_servers = ice_servers;
        }

        if let Some(settings) = &join.region_settings {
            if let Some(provider) = self.region.lock().clone() {
                provider.set_server_reported_settings(settings.clone());
            }
        }
        Ok(())
    }

    /// Client-side negotiation: next offer id, local offer, send tagged.
    async fn negotiate_publisher(self: &Arc<Self>) -> Result<(), EngineError> {
        if !self.signal.is_connected() {
            return Ok(());
        }
        let (transport, offer_id, ice_restart) = {
            let mut st = self.state.lock().await;
            let Some(transport) = st.publisher.clone() else {
                return Ok(());
            };
            st.has_published = true;
            st.offer_id += 1;
            let restart = matches!(
                st.conn_state,
                ConnectionState::Resuming | ConnectionState::Reconnecting
            );
            (transport, st.offer_id, restart)
        };

        if let Some(mut offer) = transport.create_offer(ice_restart).await? {
            offer.id = offer_id;
            tracing::debug!(
                target = "wavelink::engine",
                offer_id,
                ice_restart,
                "sending publisher offer"
            );
            self.signal.send(SignalRequest::Offer(offer));
            self.flush_local_candidates(&transport);
        }
        Ok(())
    }

    fn flush_local_candidates(&self, transport: &SessionTransport) {
        for candidate in transport.take_ready_local_candidates() {
            self.send_trickle(transport.target(), candidate);
        }
    }

    fn send_trickle(&self, target: SignalTarget, candidate: IceCandidateInit) {
        match serde_json::to_string(&candidate) {
            Ok(blob) => self.signal.send(SignalRequest::Trickle {
                target,
                candidate_init: blob,
            }),
            Err(err) => {
                tracing::warn!(
                    target = "wavelink::engine",
                    "failed to encode local candidate: {err}"
                );
            }
        }
    }

    async fn handle_signal_event(self: &Arc<Self>, event: SignalEvent) {
        match event {
            SignalEvent::Message(response) => self.handle_signal_response(response).await,
            SignalEvent::Closed { reason, code } => {
                tracing::debug!(
                    target = "wavelink::engine",
                    code,
                    reason = %reason,
                    "signaling connection lost"
                );
                let should_reconnect = {
                    let st = self.state.lock().await;
                    !st.closed && st.conn_state == ConnectionState::Connected
                };
                if should_reconnect {
                    self.spawn_reconnect();
                }
            }
        }
    }

    async fn handle_signal_response(self: &Arc<Self>, response: SignalResponse) {
        match response {
            SignalResponse::Offer(offer) => self.handle_server_offer(offer).await,
            SignalResponse::Answer(answer) => self.handle_server_answer(answer).await,
            SignalResponse::Trickle {
                target,
                candidate_init,
            } => self.handle_trickle(target, &candidate_init).await,
            SignalResponse::ParticipantUpdate { participants } => {
                let _ = self
                    .events_tx
                    .send(EngineEvent::ParticipantUpdate { participants });
            }
            SignalResponse::TrackPublished { cid, track } => {
                self.tracks.mark_published(&cid, &track);
                if let Some(waiter) = self.pending_publishes.lock().remove(&cid) {
                    let _ = waiter.send(track.clone());
                }
                let _ = self
                    .events_tx
                    .send(EngineEvent::LocalTrackPublished { track });
            }
            SignalResponse::TrackUnpublished { track_sid } => {
                self.tracks.remove_by_sid(&track_sid);
                let _ = self
                    .events_tx
                    .send(EngineEvent::LocalTrackUnpublished { track_sid });
            }
            SignalResponse::SpeakersChanged { speakers } => {
                let _ = self.events_tx.send(EngineEvent::SpeakersChanged { speakers });
            }
            SignalResponse::RoomUpdate { room } => {
                let _ = self.events_tx.send(EngineEvent::RoomUpdate { room });
            }
            SignalResponse::ConnectionQuality { updates } => {
                let _ = self
                    .events_tx
                    .send(EngineEvent::ConnectionQuality { updates });
            }
            SignalResponse::StreamStateUpdate { stream_states } => {
                let _ = self
                    .events_tx
                    .send(EngineEvent::StreamStateUpdate { stream_states });
            }
            SignalResponse::RemoteMute { track_sid, muted } => {
                let _ = self
                    .events_tx
                    .send(EngineEvent::RemoteMute { track_sid, muted });
            }
            SignalResponse::RefreshToken { token } => {
                tracing::debug!(
                    target = "wavelink::engine",
                    "received refreshed credential for future reconnects"
                );
                self.state.lock().await.token = token.clone();
                if let Some(provider) = self.region.lock().clone() {
                    provider.set_token(token);
                }
            }
            SignalResponse::Leave {
                reason,
                can_reconnect,
            } => {
                if can_reconnect {
                    // Server wants a rebuild; the connection closing behind
                    // this message triggers it.
                    self.state.lock().await.full_reconnect_on_next = true;
                } else {
                    tracing::info!(
                        target = "wavelink::engine",
                        ?reason,
                        "server ended the session"
                    );
                    self.shutdown(reason).await;
                }
            }
            SignalResponse::Join(_)
            | SignalResponse::Reconnect(_)
            | SignalResponse::Pong { .. } => {
                tracing::debug!(
                    target = "wavelink::engine",
                    kind = response.kind_name(),
                    "unexpected handshake message mid-session, ignoring"
                );
            }
        }
    }

    /// Server-side negotiation: the subscribe transport answers.
    async fn handle_server_offer(self: &Arc<Self>, offer: SessionDescription) {
        let subscriber = self.state.lock().await.subscriber.clone();
        let Some(subscriber) = subscriber else {
            tracing::warn!(
                target = "wavelink::engine",
                "server offer without a subscriber transport"
            );
            return;
        };
        let offer_id = offer.id;
        let result = async {
            subscriber.set_remote_description(offer).await?;
            let mut answer = subscriber.create_answer().await?;
            // Echo the server's id so it can correlate the answer.
            answer.id = offer_id;
            Ok::<SessionDescription, NegotiationError>(answer)
        }
        .await;
        match result {
            Ok(answer) => {
                self.signal.send(SignalRequest::Answer(answer));
                self.flush_local_candidates(&subscriber);
            }
            Err(err) => {
                tracing::warn!(
                    target = "wavelink::engine",
                    "subscriber negotiation failed: {err}"
                );
            }
        }
    }

    /// An answer is applied only when it matches the outstanding offer (or
    /// carries the legacy `0` id); anything else is a superseded
    /// negotiation's answer and is dropped.
    async fn handle_server_answer(self: &Arc<Self>, answer: SessionDescription) {
        let (publisher, current_offer) = {
            let st = self.state.lock().await;
            (st.publisher.clone(), st.offer_id)
        };
        let Some(publisher) = publisher else {
            return;
        };
        if answer.id != 0 && answer.id != current_offer {
            tracing::debug!(
                target = "wavelink::engine",
                answer_id = answer.id,
                current_offer,
                "ignoring stale answer"
            );
            return;
        }
        match publisher.set_remote_description(answer).await {
            Ok(renegotiate) => {
                if renegotiate {
                    if let Err(err) = self.negotiate_publisher().await {
                        tracing::warn!(
                            target = "wavelink::engine",
                            "deferred renegotiation failed: {err}"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "wavelink::engine",
                    "failed to apply publisher answer: {err}"
                );
            }
        }
    }

    async fn handle_trickle(self: &Arc<Self>, target: SignalTarget, candidate_init: &str) {
        let candidate: IceCandidateInit = match serde_json::from_str(candidate_init) {
            Ok(candidate) => candidate,
            Err(err) => {
                tracing::warn!(
                    target = "wavelink::engine",
                    "dropping malformed remote candidate: {err}"
                );
                return;
            }
        };
        let transport = {
            let st = self.state.lock().await;
            match target {
                SignalTarget::Publisher => st.publisher.clone(),
                SignalTarget::Subscriber => st.subscriber.clone(),
            }
        };
        match transport {
            Some(transport) => {
                if let Err(err) = transport.add_remote_candidate(candidate).await {
                    tracing::warn!(
                        target = "wavelink::engine",
                        ?target,
                        "failed to apply remote candidate: {err}"
                    );
                }
            }
            None => {
                tracing::warn!(
                    target = "wavelink::engine",
                    ?target,
                    "remote candidate for missing transport, ignoring"
                );
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event.kind {
            TransportEventKind::Connectivity(state) => {
                tracing::debug!(
                    target = "wavelink::engine",
                    transport = ?event.target,
                    ?state,
                    "transport connectivity changed"
                );
                let should_reconnect = {
                    let st = self.state.lock().await;
                    !st.closed
                        && state.is_lost()
                        && st.conn_state == ConnectionState::Connected
                };
                if should_reconnect {
                    self.spawn_reconnect();
                }
            }
            TransportEventKind::LocalCandidate(candidate) => {
                let transport = {
                    let st = self.state.lock().await;
                    match event.target {
                        SignalTarget::Publisher => st.publisher.clone(),
                        SignalTarget::Subscriber => st.subscriber.clone(),
                    }
                };
                if let Some(transport) = transport {
                    for ready in transport.local_candidate(candidate) {
                        self.send_trickle(event.target, ready);
                    }
                }
            }
            TransportEventKind::RenegotiationNeeded => {
                if event.target == SignalTarget::Publisher {
                    if let Err(err) = self.negotiate_publisher().await {
                        tracing::warn!(
                            target = "wavelink::engine",
                            "publisher renegotiation failed: {err}"
                        );
                    }
                }
            }
            TransportEventKind::TrackAdded { track_id } => {
                let _ = self.events_tx.send(EngineEvent::TrackAdded { track_id });
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let Ok(guard) = Arc::clone(&self.reconnect_guard).try_lock_owned() else {
            // A recovery is already running.
            return;
        };
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.run_reconnect().await;
            drop(guard);
        });
        *self.reconnect_task.lock() = Some(handle);
    }

    /// The two-tier recovery ladder: resume first, rebuild once resume
    /// attempts are spent, terminal disconnect when the budget runs out.
    async fn run_reconnect(self: &Arc<Self>) {
        let policy = self.options.reconnect.clone();
        let started = Instant::now();

        for attempt in 0..policy.max_attempts {
            if self.state.lock().await.closed {
                return;
            }
            tokio::time::sleep(policy.delay_for_attempt(attempt) + backoff_jitter()).await;
            if self.state.lock().await.closed {
                return;
            }

            let over = *self.reconnect_override.lock();
            let is_full = match over {
                ReconnectOverride::ForceSoftReconnect => false,
                ReconnectOverride::ForceFullReconnect => true,
                ReconnectOverride::Auto => {
                    let mut st = self.state.lock().await;
                    attempt != 0 || std::mem::take(&mut st.full_reconnect_on_next)
                }
            };
            tracing::info!(
                target = "wavelink::engine",
                attempt = attempt + 1,
                full = is_full,
                "reconnecting"
            );

            let result = if is_full {
                self.try_full_reconnect().await
            } else {
                self.try_soft_reconnect().await
            };
            match result {
                Ok(()) => {
                    // Publish connectivity is restored: release the ordered
                    // queue so requests issued during the outage flush now.
                    self.signal.start_request_queue();
                    let mut st = self.state.lock().await;
                    self.set_state_locked(&mut st, ConnectionState::Connected);
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        target = "wavelink::engine",
                        attempt = attempt + 1,
                        "reconnect attempt failed: {err}"
                    );
                }
            }
            if started.elapsed() > policy.max_elapsed {
                break;
            }
        }

        tracing::warn!(
            target = "wavelink::engine",
            "{}",
            EngineError::ReconnectAttemptsExhausted
        );
        // Taking the handle first keeps shutdown from aborting this task
        // out from under itself.
        let _ = self.reconnect_task.lock().take();
        self.shutdown(DisconnectReason::Unknown).await;
    }

    /// Resume: re-establish signaling under the same participant, restart
    /// ICE, keep local track state intact.
    async fn try_soft_reconnect(self: &Arc<Self>) -> Result<(), EngineError> {
        let (url, token, sid, subscriber, has_published) = {
            let mut st = self.state.lock().await;
            self.set_state_locked(&mut st, ConnectionState::Resuming);
            let url = st.server_url.clone().ok_or(EngineError::Closed)?;
            (
                url,
                st.token.clone(),
                st.participant_sid.clone(),
                st.subscriber.clone(),
                st.has_published,
            )
        };
        if let Some(subscriber) = &subscriber {
            subscriber.prepare_ice_restart();
        }

        let handshake = self
            .signal
            .connect(
                &url,
                &token,
                &self.options,
                ConnectMode::Resume {
                    participant_sid: sid,
                },
            )
            .await?;
        match handshake {
            JoinHandshake::Resumed(Some(ack)) => {
                if !ack.ice_servers.is_empty() {
                    // Stashed for the next transport rebuild; live
                    // connections keep their configuration.
                    self.state.lock().await.ice_servers = ack.ice_servers;
                }
            }
            JoinHandshake::Resumed(None) => {}
            JoinHandshake::Joined(_) => {
                return Err(SignalError::HandshakeFailed(
                    "expected a resume acknowledgement, got a fresh join".to_string(),
                )
                .into());
            }
        }
        self.signal.ready_for_responses();

        if has_published {
            self.negotiate_publisher().await?;
        }
        self.wait_for_transports_connected().await
    }

    /// Rebuild: tear everything down, fresh join, recreate transports, and
    /// republish every held local track before reporting connected.
    async fn try_full_reconnect(self: &Arc<Self>) -> Result<(), EngineError> {
        let url = {
            let mut st = self.state.lock().await;
            self.set_state_locked(&mut st, ConnectionState::Reconnecting);
            st.server_url.clone().ok_or(EngineError::Closed)?
        };
        self.close_transports().await;
        self.signal.close(CLOSE_CODE_NORMAL, "full reconnect", true);
        self.pending_publishes.lock().clear();

        self.establish(url).await?;

        let tracks = self.tracks.snapshot();
        for track in &tracks {
            self.signal.send(SignalRequest::AddTrack {
                cid: track.cid.clone(),
                name: track.name.clone(),
                kind: track.kind,
                muted: track.muted,
            });
        }
        if !tracks.is_empty() {
            self.negotiate_publisher().await?;
        }
        self.wait_for_transports_connected().await
    }

    /// Polls the transports until the primary one (and the publisher, when
    /// anything is published) reports connected, bounded by the policy's
    /// transport timeout.
    async fn wait_for_transports_connected(&self) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.options.reconnect.transport_connect_timeout;
        loop {
            let (primary_ok, publisher_ok) = {
                let st = self.state.lock().await;
                let primary = if st.subscriber_primary {
                    st.subscriber.clone()
                } else {
                    st.publisher.clone()
                };
                let primary_ok = primary
                    .map(|t| t.connection_state().is_connected())
                    .unwrap_or(false);
                let publisher_ok = if st.has_published {
                    st.publisher
                        .as_ref()
                        .map(|t| t.connection_state().is_connected())
                        .unwrap_or(false)
                } else {
                    true
                };
                (primary_ok, publisher_ok)
            };
            if primary_ok && publisher_ok {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::TransportConnectTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn close_transports(&self) {
        let (publisher, subscriber) = {
            let mut st = self.state.lock().await;
            (st.publisher.take(), st.subscriber.take())
        };
        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        if let Some(subscriber) = subscriber {
            subscriber.close().await;
        }
    }

    /// Terminal teardown, from either side. Emits exactly one
    /// `Disconnected` per session.
    async fn shutdown(self: &Arc<Self>, reason: DisconnectReason) {
        {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            st.closed = true;
        }
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
        }
        self.close_transports().await;
        self.signal.close(CLOSE_CODE_NORMAL, "session closed", true);
        self.pending_publishes.lock().clear();
        self.tracks.clear();

        let mut st = self.state.lock().await;
        let was_disconnected = st.conn_state == ConnectionState::Disconnected;
        st.conn_state = ConnectionState::Disconnected;
        st.has_published = false;
        st.offer_id = 0;
        st.participant_sid = None;
        drop(st);
        if !was_disconnected {
            let _ = self.events_tx.send(EngineEvent::Disconnected { reason });
        }
    }

    fn set_state_locked(&self, st: &mut EngineState, new: ConnectionState) {
        if st.conn_state == new {
            return;
        }
        let old = std::mem::replace(&mut st.conn_state, new);
        let event = match new {
            ConnectionState::Connected => Some(if matches!(
                old,
                ConnectionState::Resuming | ConnectionState::Reconnecting
            ) {
                EngineEvent::Reconnected
            } else {
                EngineEvent::Connected
            }),
            ConnectionState::Resuming => Some(EngineEvent::Resuming),
            ConnectionState::Reconnecting => Some(EngineEvent::Reconnecting),
            // Terminal paths emit `Disconnected` with a reason themselves.
            ConnectionState::Connecting | ConnectionState::Disconnected => None,
        };
        if let Some(event) = event {
            let _ = self.events_tx.send(event);
        }
    }
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
        username: String::new(),
        credential: String::new(),
    }]
}

fn backoff_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..100))
}
