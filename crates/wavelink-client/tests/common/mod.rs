#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::timeout;

use wavelink_client::error::NegotiationError;
use wavelink_client::events::EngineEvent;
use wavelink_client::rtc::{
    MediaConnection, MediaConnectionFactory, SignalingState, TransportEvent, TransportEventKind,
    TransportState,
};
use wavelink_proto::{
    IceCandidateInit, JoinResponse, ParticipantInfo, ReconnectResponse, RoomInfo, SdpKind,
    SessionDescription, SignalRequest, SignalResponse, TrackInfo, decode_request,
    encode_response,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn join_template() -> JoinResponse {
    JoinResponse {
        room: RoomInfo {
            sid: "RM_mock".into(),
            name: "mock-room".into(),
            metadata: String::new(),
            num_participants: 1,
        },
        participant: ParticipantInfo {
            sid: "PA_test".into(),
            identity: "tester".into(),
            ..Default::default()
        },
        other_participants: Vec::new(),
        server_version: "1.8.0".into(),
        subscriber_primary: true,
        ice_servers: Vec::new(),
        ping_interval: 30,
        ping_timeout: 20,
        region_settings: None,
    }
}

/// One accepted signaling connection on the mock server.
pub struct MockConnection {
    pub params: HashMap<String, String>,
    pub received: Mutex<Vec<SignalRequest>>,
    received_notify: Notify,
    out_tx: mpsc::UnboundedSender<SignalResponse>,
    pub closed: AtomicBool,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl MockConnection {
    pub fn send(&self, response: SignalResponse) {
        let _ = self.out_tx.send(response);
    }

    /// Drops the socket abruptly, the way a dying network would.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn requests(&self) -> Vec<SignalRequest> {
        self.received.lock().clone()
    }

    /// Waits until a received request satisfies `pred`, returning it.
    pub async fn wait_for_request<F>(&self, mut pred: F) -> SignalRequest
    where
        F: FnMut(&SignalRequest) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let notified = self.received_notify.notified();
                if let Some(found) = self.received.lock().iter().find(|r| pred(r)) {
                    return found.clone();
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for request")
    }

    pub async fn wait_for_request_count(&self, count: usize) {
        timeout(WAIT, async {
            loop {
                let notified = self.received_notify.notified();
                if self.received.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for request count")
    }
}

pub struct ServerState {
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
    conn_notify: Notify,
    pub join_template: Mutex<JoinResponse>,
    pub respond_pongs: AtomicBool,
    pub ack_add_track: AtomicBool,
}

/// In-process signaling server speaking the wavelink wire protocol over
/// `/rtc`; joins and resumes are acknowledged automatically.
pub struct MockSignalServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
}

impl MockSignalServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState {
            connections: Mutex::new(Vec::new()),
            conn_notify: Notify::new(),
            join_template: Mutex::new(join_template()),
            respond_pongs: AtomicBool::new(true),
            ack_add_track: AtomicBool::new(true),
        });
        let app = Router::new()
            .route("/rtc", get(rtc_handler))
            .route("/rtc/validate", get(|| async { "ok" }))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn wait_for_connection(&self, index: usize) -> Arc<MockConnection> {
        timeout(WAIT, async {
            loop {
                let notified = self.state.conn_notify.notified();
                if let Some(conn) = self.state.connections.lock().get(index).cloned() {
                    return conn;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for connection")
    }
}

async fn rtc_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(
    socket: WebSocket,
    params: HashMap<String, String>,
    state: Arc<ServerState>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalResponse>();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let conn = Arc::new(MockConnection {
        params: params.clone(),
        received: Mutex::new(Vec::new()),
        received_notify: Notify::new(),
        out_tx,
        closed: AtomicBool::new(false),
        kill_tx: Mutex::new(Some(kill_tx)),
    });
    state.connections.lock().push(Arc::clone(&conn));
    state.conn_notify.notify_waiters();

    let handshake = if params.contains_key("reconnect") {
        SignalResponse::Reconnect(ReconnectResponse::default())
    } else {
        SignalResponse::Join(state.join_template.lock().clone())
    };
    if send_response(&mut ws_tx, &handshake).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(response) => {
                    if send_response(&mut ws_tx, &response).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut kill_rx => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => {
                    let Ok(request) = decode_request(&data) else {
                        continue;
                    };
                    match &request {
                        SignalRequest::Ping { timestamp, .. } => {
                            if state.respond_pongs.load(Ordering::SeqCst) {
                                let pong = SignalResponse::Pong { timestamp: *timestamp };
                                if send_response(&mut ws_tx, &pong).await.is_err() {
                                    break;
                                }
                            }
                        }
                        SignalRequest::AddTrack { cid, name, kind, muted } => {
                            if state.ack_add_track.load(Ordering::SeqCst) {
                                let ack = SignalResponse::TrackPublished {
                                    cid: cid.clone(),
                                    track: TrackInfo {
                                        sid: format!("TR_{cid}"),
                                        name: name.clone(),
                                        kind: Some(*kind),
                                        muted: *muted,
                                    },
                                };
                                if send_response(&mut ws_tx, &ack).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ => {}
                    }
                    conn.received.lock().push(request);
                    conn.received_notify.notify_waiters();
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    conn.closed.store(true, Ordering::SeqCst);
}

async fn send_response(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    response: &SignalResponse,
) -> Result<(), ()> {
    let frame = encode_response(response).map_err(|_| ())?;
    ws_tx.send(WsMessage::Binary(frame)).await.map_err(|_| ())
}

/// Scripted media connection: records every description and candidate, and
/// lets tests drive connectivity and renegotiation events.
pub struct MockMedia {
    pub target: wavelink_proto::SignalTarget,
    events: mpsc::UnboundedSender<TransportEvent>,
    pub signaling: Mutex<SignalingState>,
    pub conn_state: Mutex<TransportState>,
    pub local_descriptions: Mutex<Vec<SessionDescription>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidateInit>>,
    offers_created: AtomicU32,
}

impl MockMedia {
    pub fn set_connection_state(&self, state: TransportState) {
        *self.conn_state.lock() = state;
        let _ = self.events.send(TransportEvent {
            target: self.target,
            kind: TransportEventKind::Connectivity(state),
        });
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidateInit) {
        let _ = self.events.send(TransportEvent {
            target: self.target,
            kind: TransportEventKind::LocalCandidate(candidate),
        });
    }

    pub fn emit_renegotiation_needed(&self) {
        let _ = self.events.send(TransportEvent {
            target: self.target,
            kind: TransportEventKind::RenegotiationNeeded,
        });
    }
}

#[async_trait]
impl MediaConnection for MockMedia {
    async fn create_offer(
        &self,
        _ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("v=0 mock-offer-{n}"), 0))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::answer("v=0 mock-answer", 0))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        *self.signaling.lock() = match description.kind {
            SdpKind::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        self.local_descriptions.lock().push(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        *self.signaling.lock() = match description.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidateInit,
    ) -> Result<(), NegotiationError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    fn connection_state(&self) -> TransportState {
        *self.conn_state.lock()
    }

    async fn close(&self) {
        *self.conn_state.lock() = TransportState::Closed;
    }
}

/// Factory handing out `MockMedia` connections, in creation order
/// (publisher before subscriber per engine setup).
pub struct MockMediaFactory {
    pub connections: Mutex<Vec<Arc<MockMedia>>>,
    notify: Notify,
    pub initial_state: TransportState,
}

impl MockMediaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
            notify: Notify::new(),
            initial_state: TransportState::Connected,
        })
    }

    pub async fn connection(&self, index: usize) -> Arc<MockMedia> {
        timeout(WAIT, async {
            loop {
                let notified = self.notify.notified();
                if let Some(conn) = self.connections.lock().get(index).cloned() {
                    return conn;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for media connection")
    }
}

#[async_trait]
impl MediaConnectionFactory for MockMediaFactory {
    async fn create(
        &self,
        target: wavelink_proto::SignalTarget,
        _ice_servers: &[wavelink_proto::IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError> {
        let conn = Arc::new(MockMedia {
            target,
            events,
            signaling: Mutex::new(SignalingState::Stable),
            conn_state: Mutex::new(self.initial_state),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            offers_created: AtomicU32::new(0),
        });
        self.connections.lock().push(Arc::clone(&conn));
        self.notify.notify_waiters();
        Ok(conn)
    }
}

/// Polls until `f` holds, bounded by [`WAIT`].
pub async fn wait_until<F>(mut f: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        loop {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Next engine event, bounded.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for engine event")
        .expect("engine event stream ended")
}

/// Skips forward until an event satisfies `pred`.
pub async fn wait_for_event<F>(
    rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    mut pred: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("engine event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}
