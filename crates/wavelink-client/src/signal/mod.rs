//! Persistent duplex control channel to one server endpoint.
//!
//! Owns the join handshake, the ordered request queue, response buffering,
//! and the keepalive protocol. Connection loss is reported through the
//! event stream exactly once per attempt; the session engine decides
//! whether to retry.

pub mod url;

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use wavelink_proto::{
    JoinResponse, ReconnectResponse, SignalRequest, SignalResponse, decode_response,
    encode_request,
};

use crate::config::ConnectOptions;
use crate::error::SignalError;

pub use ::url::Url;

pub const CLOSE_CODE_NORMAL: u16 = 1000;
pub const CLOSE_CODE_PING_TIMEOUT: u16 = 3000;
pub const CLOSE_CODE_SOCKET_FAILURE: u16 = 3500;

/// What `connect` resolved with.
#[derive(Debug, Clone)]
pub enum JoinHandshake {
    /// Fresh session: a full join response.
    Joined(JoinResponse),
    /// Resumed session: an explicit acknowledgement, or `None` when an older
    /// server signalled liveness with an ordinary message instead.
    Resumed(Option<ReconnectResponse>),
}

#[derive(Debug, Clone)]
pub enum ConnectMode {
    Join,
    Resume { participant_sid: Option<String> },
}

impl ConnectMode {
    fn is_resume(&self) -> bool {
        matches!(self, ConnectMode::Resume { .. })
    }
}

/// Events surfaced to the session engine, in arrival order.
#[derive(Debug)]
pub enum SignalEvent {
    Message(SignalResponse),
    Closed { reason: String, code: u16 },
}

type JoinWaiter = oneshot::Sender<Result<JoinHandshake, SignalError>>;

struct ResponseGate {
    ready: bool,
    buffer: Vec<SignalResponse>,
}

struct Conn {
    generation: u64,
    writer_tx: mpsc::UnboundedSender<Message>,
    /// Join or resume acknowledged.
    connected: bool,
    resuming: bool,
    drain_started: bool,
    pong_tx: watch::Sender<i64>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    events_tx: mpsc::UnboundedSender<SignalEvent>,
    http: reqwest::Client,
    generation: AtomicU64,
    conn: Mutex<Option<Conn>>,
    pending: Mutex<VecDeque<SignalRequest>>,
    pending_notify: Notify,
    gate: Mutex<ResponseGate>,
    join_waiter: Mutex<Option<JoinWaiter>>,
    /// Interval/timeout from the most recent join response; reused when a
    /// resume is acknowledged without a fresh join.
    ping_config: Mutex<Option<(Duration, Duration)>>,
    rtt_ms: AtomicI64,
}

/// The signaling channel. One instance is reusable across connection
/// attempts; `connect` tears down any previous socket first.
pub struct SignalChannel {
    shared: Arc<Shared>,
}

impl SignalChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events_tx,
            http: reqwest::Client::new(),
            generation: AtomicU64::new(0),
            conn: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            pending_notify: Notify::new(),
            gate: Mutex::new(ResponseGate {
                ready: false,
                buffer: Vec::new(),
            }),
            join_waiter: Mutex::new(None),
            ping_config: Mutex::new(None),
            rtt_ms: AtomicI64::new(0),
        });
        (Self { shared }, events_rx)
    }

    /// Opens the control connection and suspends until the server answers
    /// the handshake. Queued requests from a previous connection survive;
    /// buffered responses do not.
    pub async fn connect(
        &self,
        server_url: &Url,
        token: &str,
        options: &ConnectOptions,
        mode: ConnectMode,
    ) -> Result<JoinHandshake, SignalError> {
        self.shared.teardown(self.shared.current_generation(), None);
        {
            let mut gate = self.shared.gate.lock();
            gate.ready = false;
            gate.buffer.clear();
        }

        let participant_sid = match &mode {
            ConnectMode::Resume { participant_sid } => participant_sid.clone(),
            ConnectMode::Join => None,
        };
        let connect_url = url::build_connect_url(
            server_url,
            token,
            options,
            mode.is_resume(),
            participant_sid.as_deref(),
        )?;

        tracing::debug!(
            target = "wavelink::signal",
            url = %redacted(&connect_url),
            resume = mode.is_resume(),
            "connecting signaling channel"
        );

        let (ws_stream, _) = match connect_async(connect_url.as_str()).await {
            Ok(ok) => ok,
            Err(err) => {
                let reason = self
                    .shared
                    .probe_validate(&connect_url)
                    .await
                    .unwrap_or_else(|| err.to_string());
                return Err(SignalError::HandshakeFailed(reason));
            }
        };
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let (pong_tx, _) = watch::channel(0i64);

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || is_close {
                    break;
                }
            }
        });

        // The connection slot and join waiter must exist before the reader
        // runs, or a fast server answer would be discarded as stale.
        let (join_tx, join_rx) = oneshot::channel();
        *self.shared.join_waiter.lock() = Some(join_tx);
        {
            let mut slot = self.shared.conn.lock();
            *slot = Some(Conn {
                generation,
                writer_tx,
                connected: false,
                resuming: mode.is_resume(),
                drain_started: false,
                pong_tx,
                tasks: vec![writer_handle],
            });
        }

        let reader_shared = Arc::clone(&self.shared);
        let reader_url = connect_url;
        let reader_handle = tokio::spawn(async move {
            let (reason, code) = loop {
                match ws_read.next().await {
                    Some(Ok(Message::Binary(data))) => match decode_response(&data) {
                        Ok(response) => {
                            reader_shared.handle_response(generation, response);
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "wavelink::signal",
                                "dropping undecodable frame: {err}"
                            );
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((CLOSE_CODE_NORMAL, String::new()));
                        break (reason, code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        // A richer rejection reason may be waiting on the
                        // validation endpoint.
                        let reason = reader_shared
                            .probe_validate(&reader_url)
                            .await
                            .unwrap_or_else(|| err.to_string());
                        break (reason, CLOSE_CODE_SOCKET_FAILURE);
                    }
                    None => break ("connection closed".to_string(), CLOSE_CODE_NORMAL),
                }
            };
            reader_shared.teardown(generation, Some((reason, code)));
        });
        {
            let mut slot = self.shared.conn.lock();
            if let Some(c) = slot.as_mut() {
                if c.generation == generation {
                    c.tasks.push(reader_handle);
                }
            }
        }

        let handshake = match join_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(SignalError::Cancelled),
        };
        if matches!(handshake, JoinHandshake::Joined(_)) {
            // Fresh sessions start draining immediately; resumed ones wait
            // for the engine's ready-to-send signal.
            self.start_request_queue();
        }
        Ok(handshake)
    }

    /// Sends a request. Skip-queue requests go out immediately or are
    /// dropped; everything else is queued in submission order.
    pub fn send(&self, request: SignalRequest) {
        if request.is_skip_queue() {
            let sent = {
                let conn = self.shared.conn.lock();
                match conn.as_ref() {
                    Some(c) if c.connected => match encode_request(&request) {
                        Ok(frame) => c.writer_tx.send(Message::Binary(frame)).is_ok(),
                        Err(err) => {
                            tracing::warn!(
                                target = "wavelink::signal",
                                "failed to encode {}: {err}",
                                request.kind_name()
                            );
                            return;
                        }
                    },
                    _ => false,
                }
            };
            if !sent {
                tracing::warn!(
                    target = "wavelink::signal",
                    kind = request.kind_name(),
                    "not connected, dropping position-sensitive request"
                );
            }
            return;
        }

        self.shared.pending.lock().push_back(request);
        self.shared.pending_notify.notify_one();
    }

    /// Starts the single drain task for the pending queue. Idempotent per
    /// connection. Called automatically on a fresh join; after a resume the
    /// engine calls it once the publish transport is connected again.
    pub fn start_request_queue(&self) {
        let shared = Arc::clone(&self.shared);
        let mut conn = self.shared.conn.lock();
        let Some(c) = conn.as_mut() else {
            return;
        };
        if c.drain_started {
            return;
        }
        c.drain_started = true;
        let generation = c.generation;
        let handle = tokio::spawn(async move {
            loop {
                let next = shared.pending.lock().pop_front();
                match next {
                    Some(request) => {
                        let frame = match encode_request(&request) {
                            Ok(frame) => frame,
                            Err(err) => {
                                tracing::warn!(
                                    target = "wavelink::signal",
                                    "failed to encode {}: {err}",
                                    request.kind_name()
                                );
                                continue;
                            }
                        };
                        tracing::trace!(
                            target = "wavelink::signal",
                            kind = request.kind_name(),
                            "sending queued request"
                        );
                        if !shared.write_raw(generation, Message::Binary(frame)) {
                            // Connection went away; requeue for the next one.
                            shared.pending.lock().push_front(request);
                            break;
                        }
                    }
                    None => shared.pending_notify.notified().await,
                }
            }
        });
        c.tasks.push(handle);
    }

    /// Releases buffered responses to the event stream and switches to live
    /// dispatch. Called once the caller finished its join-response setup.
    pub fn ready_for_responses(&self) {
        let mut gate = self.shared.gate.lock();
        if gate.ready {
            return;
        }
        gate.ready = true;
        for response in gate.buffer.drain(..) {
            let _ = self
                .shared
                .events_tx
                .send(SignalEvent::Message(response));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .conn
            .lock()
            .as_ref()
            .map(|c| c.connected)
            .unwrap_or(false)
    }

    /// Most recent measured round-trip time, milliseconds.
    pub fn rtt_ms(&self) -> i64 {
        self.shared.rtt_ms.load(Ordering::Relaxed)
    }

    /// Closes the connection and cancels every outstanding suspension.
    /// Idempotent. The pending queue survives unless `clear_pending` is set,
    /// so side effects issued during an outage can be flushed after a
    /// resume.
    pub fn close(&self, code: u16, reason: &str, clear_pending: bool) {
        tracing::debug!(
            target = "wavelink::signal",
            code,
            reason,
            "closing signaling channel"
        );
        let generation = self.shared.current_generation();
        if let Some(c) = self.shared.conn.lock().as_ref() {
            let _ = c.writer_tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_string()),
            })));
        }
        self.shared.teardown(generation, None);
        if clear_pending {
            self.shared.pending.lock().clear();
        }
        let mut gate = self.shared.gate.lock();
        gate.ready = false;
        gate.buffer.clear();
    }
}

impl Shared {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn write_raw(&self, generation: u64, message: Message) -> bool {
        let conn = self.conn.lock();
        match conn.as_ref() {
            Some(c) if c.generation == generation => c.writer_tx.send(message).is_ok(),
            _ => false,
        }
    }

    /// Removes the connection (if it is still the current one), aborts its
    /// tasks, fails any pending join wait, and emits at most one `Closed`
    /// event.
    fn teardown(&self, generation: u64, closed: Option<(String, u16)>) {
        let conn = {
            let mut slot = self.conn.lock();
            match slot.as_ref() {
                Some(c) if c.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return;
        };
        for task in &conn.tasks {
            task.abort();
        }
        if let Some(waiter) = self.join_waiter.lock().take() {
            let err = match &closed {
                Some((reason, _)) => SignalError::HandshakeFailed(reason.clone()),
                None => SignalError::Cancelled,
            };
            let _ = waiter.send(Err(err));
        }
        if let Some((reason, code)) = closed {
            tracing::debug!(
                target = "wavelink::signal",
                code,
                reason = %reason,
                "signaling connection closed"
            );
            let _ = self.events_tx.send(SignalEvent::Closed { reason, code });
        }
    }

    fn handle_response(self: &Arc<Self>, generation: u64, response: SignalResponse) {
        let mut conn_slot = self.conn.lock();
        let Some(conn) = conn_slot.as_mut() else {
            return;
        };
        if conn.generation != generation {
            tracing::trace!(
                target = "wavelink::signal",
                "discarding message from superseded connection"
            );
            return;
        }

        if !conn.connected {
            match response {
                SignalResponse::Join(join) => {
                    conn.connected = true;
                    let interval = Duration::from_secs(u64::from(join.ping_interval));
                    let timeout = Duration::from_secs(u64::from(join.ping_timeout));
                    *self.ping_config.lock() = Some((interval, timeout));
                    self.spawn_ping_task(conn);
                    self.resolve_join(Ok(JoinHandshake::Joined(join)));
                }
                SignalResponse::Leave { .. } => {
                    // Failed resumes may answer with a leave before any join.
                    self.dispatch(response);
                }
                SignalResponse::Reconnect(ack) if conn.resuming => {
                    conn.connected = true;
                    conn.resuming = false;
                    self.spawn_ping_task(conn);
                    self.resolve_join(Ok(JoinHandshake::Resumed(Some(ack))));
                }
                other if conn.resuming => {
                    // Older servers resume by simply carrying on; the first
                    // message doubles as the acknowledgement.
                    conn.connected = true;
                    conn.resuming = false;
                    self.spawn_ping_task(conn);
                    self.resolve_join(Ok(JoinHandshake::Resumed(None)));
                    self.dispatch(other);
                }
                other => {
                    tracing::warn!(
                        target = "wavelink::signal",
                        kind = other.kind_name(),
                        "received response before handshake completed"
                    );
                }
            }
            return;
        }

        match response {
            SignalResponse::Pong { timestamp } => {
                let now = unix_millis();
                self.rtt_ms.store(now - timestamp, Ordering::Relaxed);
                let _ = conn.pong_tx.send(timestamp);
            }
            other => self.dispatch(other),
        }
    }

    fn resolve_join(&self, result: Result<JoinHandshake, SignalError>) {
        if let Some(waiter) = self.join_waiter.lock().take() {
            let _ = waiter.send(result);
        }
    }

    fn dispatch(&self, response: SignalResponse) {
        let mut gate = self.gate.lock();
        if gate.ready {
            let _ = self.events_tx.send(SignalEvent::Message(response));
        } else {
            gate.buffer.push(response);
        }
    }

    /// Keepalive: ping on the negotiated interval; a missing pong within the
    /// timeout force-closes the connection, because NATs and proxies drop
    /// idle sockets without any close event.
    fn spawn_ping_task(self: &Arc<Self>, conn: &mut Conn) {
        let Some((interval, timeout)) = *self.ping_config.lock() else {
            return;
        };
        if interval.is_zero() {
            return;
        }
        let shared = Arc::clone(self);
        let generation = conn.generation;
        let mut pong_rx = conn.pong_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let sent_at = unix_millis();
                let ping = SignalRequest::Ping {
                    timestamp: sent_at,
                    rtt: shared.rtt_ms.load(Ordering::Relaxed),
                };
                let frame = match encode_request(&ping) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                if !shared.write_raw(generation, Message::Binary(frame)) {
                    break;
                }
                let ponged =
                    tokio::time::timeout(timeout, wait_for_pong(&mut pong_rx, sent_at)).await;
                if ponged.is_err() {
                    tracing::warn!(
                        target = "wavelink::signal",
                        "keepalive timeout, force-closing connection"
                    );
                    let _ = shared.write_raw(
                        generation,
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::from(CLOSE_CODE_PING_TIMEOUT),
                            reason: Cow::Borrowed("keepalive timeout"),
                        })),
                    );
                    shared.teardown(
                        generation,
                        Some(("keepalive timeout".to_string(), CLOSE_CODE_PING_TIMEOUT)),
                    );
                    break;
                }
            }
        });
        conn.tasks.push(handle);
    }

    /// Asks the validation endpoint why a connection failed; a rejection
    /// body beats a bare socket error in the surfaced message.
    async fn probe_validate(&self, connect_url: &Url) -> Option<String> {
        let validate_url = url::build_validate_url(connect_url).ok()?;
        let response = self.http.get(validate_url.as_str()).send().await.ok()?;
        if response.status().is_success() {
            return None;
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if body.is_empty() {
            Some(format!("connection rejected: {status}"))
        } else {
            Some(body)
        }
    }
}

async fn wait_for_pong(rx: &mut watch::Receiver<i64>, sent_at: i64) {
    loop {
        match rx.changed().await {
            Ok(()) => {
                if *rx.borrow() >= sent_at {
                    return;
                }
            }
            // Sender gone: the connection is being torn down, so never
            // report a pong; the surrounding timeout handles exit.
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn redacted(url: &Url) -> String {
    let mut out = url.clone();
    {
        let mut query = out.query_pairs_mut();
        query.clear();
    }
    out.set_query(None);
    out.to_string()
}
