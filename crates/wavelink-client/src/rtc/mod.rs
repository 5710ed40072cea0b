//! Transport-connection wrapper: one ICE/media peer connection per
//! direction, consumed through its offer/answer/candidate primitives and
//! observable states only.

pub mod webrtc;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use wavelink_proto::{IceCandidateInit, IceServer, SessionDescription, SignalTarget};

use crate::error::NegotiationError;

/// Connectivity of a transport connection, as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_connected(self) -> bool {
        matches!(self, TransportState::Connected)
    }

    pub fn is_lost(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

/// Signaling sub-state of a transport connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Callbacks from the underlying connection, marshaled onto the engine's
/// event channel instead of firing on platform threads.
#[derive(Debug)]
pub struct TransportEvent {
    pub target: SignalTarget,
    pub kind: TransportEventKind,
}

#[derive(Debug)]
pub enum TransportEventKind {
    Connectivity(TransportState),
    LocalCandidate(IceCandidateInit),
    RenegotiationNeeded,
    TrackAdded { track_id: String },
}

/// The seam to the actual ICE/media stack. The production implementation
/// wraps a WebRTC peer connection; tests substitute a scripted mock.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError>;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> TransportState;
    async fn close(&self);
}

/// Creates connections for the engine; injected so tests can observe and
/// script every transport.
#[async_trait]
pub trait MediaConnectionFactory: Send + Sync {
    async fn create(
        &self,
        target: SignalTarget,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError>;
}

/// One logical transport connection. Single-writer: only the session engine
/// drives descriptions and candidates.
pub struct SessionTransport {
    target: SignalTarget,
    conn: Arc<dyn MediaConnection>,
    /// Remote candidates that arrived before the remote description.
    pending_remote: Mutex<Vec<IceCandidateInit>>,
    /// Last applied remote description, kept for offer rollback during an
    /// ICE restart.
    last_remote: Mutex<Option<SessionDescription>>,
    /// Local candidates gathered before the local description was set.
    pending_local: Mutex<Vec<IceCandidateInit>>,
    has_remote_description: AtomicBool,
    has_local_description: AtomicBool,
    restarting_ice: AtomicBool,
    /// An offer was requested while one was already outstanding.
    renegotiate: AtomicBool,
}

impl SessionTransport {
    pub fn new(target: SignalTarget, conn: Arc<dyn MediaConnection>) -> Self {
        Self {
            target,
            conn,
            pending_remote: Mutex::new(Vec::new()),
            last_remote: Mutex::new(None),
            pending_local: Mutex::new(Vec::new()),
            has_remote_description: AtomicBool::new(false),
            has_local_description: AtomicBool::new(false),
            restarting_ice: AtomicBool::new(false),
            renegotiate: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> SignalTarget {
        self.target
    }

    pub fn connection_state(&self) -> TransportState {
        self.conn.connection_state()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.conn.signaling_state()
    }

    /// Marks the next offer as an ICE restart and re-enables candidate
    /// buffering until the restarted remote description lands.
    pub fn prepare_ice_restart(&self) {
        self.restarting_ice.store(true, Ordering::SeqCst);
    }

    /// Applies a remote candidate, or buffers it while no remote
    /// description is set (or an ICE restart is pending).
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidateInit,
    ) -> Result<(), NegotiationError> {
        let apply_now = self.has_remote_description.load(Ordering::SeqCst)
            && !self.restarting_ice.load(Ordering::SeqCst);
        if apply_now {
            self.conn.add_ice_candidate(candidate).await
        } else {
            self.pending_remote.lock().push(candidate);
            Ok(())
        }
    }

    /// Sets the remote description and flushes buffered remote candidates in
    /// arrival order. Returns `true` when a deferred renegotiation should
    /// start now.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        self.conn.set_remote_description(description.clone()).await?;
        *self.last_remote.lock() = Some(description);
        self.has_remote_description.store(true, Ordering::SeqCst);
        self.restarting_ice.store(false, Ordering::SeqCst);

        let buffered = std::mem::take(&mut *self.pending_remote.lock());
        for candidate in buffered {
            self.conn.add_ice_candidate(candidate).await?;
        }
        Ok(self.renegotiate.swap(false, Ordering::SeqCst))
    }

    /// Creates and locally applies an offer. Returns `None` when an offer is
    /// already outstanding and the attempt was deferred instead.
    pub async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        if ice_restart {
            self.restarting_ice.store(true, Ordering::SeqCst);
        }
        if self.conn.signaling_state() == SignalingState::HaveLocalOffer {
            let rollback = if ice_restart {
                self.last_remote.lock().clone()
            } else {
                None
            };
            match rollback {
                Some(remote) => {
                    // Roll back to stable by re-applying the current remote
                    // description, then build the restart offer below.
                    self.conn.set_remote_description(remote).await?;
                }
                None => {
                    // Waiting on the peer's answer; try again once it lands.
                    self.renegotiate.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }

        let offer = self.conn.create_offer(ice_restart).await?;
        self.conn.set_local_description(offer.clone()).await?;
        self.has_local_description.store(true, Ordering::SeqCst);
        Ok(Some(offer))
    }

    /// Answers a remote offer: creates the answer and applies it locally.
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(answer.clone()).await?;
        self.has_local_description.store(true, Ordering::SeqCst);
        Ok(answer)
    }

    /// Routes a locally gathered candidate: returns the candidates that are
    /// ready to be trickled now (buffered until the local description
    /// exists).
    pub fn local_candidate(&self, candidate: IceCandidateInit) -> Vec<IceCandidateInit> {
        let mut pending = self.pending_local.lock();
        if self.has_local_description.load(Ordering::SeqCst) {
            let mut out = std::mem::take(&mut *pending);
            out.push(candidate);
            out
        } else {
            pending.push(candidate);
            Vec::new()
        }
    }

    /// Drains local candidates buffered before the local description was
    /// set, in gathering order.
    pub fn take_ready_local_candidates(&self) -> Vec<IceCandidateInit> {
        if self.has_local_description.load(Ordering::SeqCst) {
            std::mem::take(&mut *self.pending_local.lock())
        } else {
            Vec::new()
        }
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}
