//! `MediaConnection` implementation backed by a WebRTC peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use wavelink_proto::{IceCandidateInit, IceServer, SdpKind, SessionDescription, SignalTarget};

use crate::error::NegotiationError;
use crate::rtc::{
    MediaConnection, MediaConnectionFactory, SignalingState, TransportEvent, TransportEventKind,
    TransportState,
};

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Peer(err.to_string())
    }
}

fn to_rtc_description(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp.clone()),
        SdpKind::Rollback => {
            return Err(NegotiationError::Peer(
                "rollback descriptions are not supported".to_string(),
            ));
        }
    };
    Ok(result?)
}

fn from_rtc_description(description: &RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp.clone(),
        id: 0,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        RTCPeerConnectionState::Unspecified => TransportState::New,
    }
}

fn ice_servers_to_rtc(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

/// A WebRTC peer connection behind the engine's transport seam.
pub struct RtcMediaConnection {
    pc: Arc<RTCPeerConnection>,
}

impl RtcMediaConnection {
    async fn new(
        api: &API,
        target: SignalTarget,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers_to_rtc(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_events.send(TransportEvent {
                target,
                kind: TransportEventKind::Connectivity(map_connection_state(state)),
            });
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.send(TransportEvent {
                            target,
                            kind: TransportEventKind::LocalCandidate(IceCandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "wavelink::rtc",
                            "failed to serialize local candidate: {err}"
                        );
                    }
                }
            }
            Box::pin(async {})
        }));

        let negotiation_events = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = negotiation_events.send(TransportEvent {
                target,
                kind: TransportEventKind::RenegotiationNeeded,
            });
            Box::pin(async {})
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = track_events.send(TransportEvent {
                target,
                kind: TransportEventKind::TrackAdded {
                    track_id: track.id(),
                },
            });
            Box::pin(async {})
        }));

        Ok(Self { pc })
    }
}

#[async_trait]
impl MediaConnection for RtcMediaConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc_description(&answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = to_rtc_description(&description)?;
        self.pc.set_local_description(rtc).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = to_rtc_description(&description)?;
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> TransportState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target = "wavelink::rtc", "peer connection close: {err}");
        }
    }
}

/// Default factory: one shared WebRTC API instance, one peer connection per
/// transport direction.
pub struct RtcConnectionFactory {
    api: API,
}

impl RtcConnectionFactory {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

impl Default for RtcConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        target: SignalTarget,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError> {
        let connection = RtcMediaConnection::new(&self.api, target, ice_servers, events).await?;
        Ok(Arc::new(connection))
    }
}
