use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{
    ConnectionQualityUpdate, DisconnectReason, IceServer, ParticipantInfo, RegionSettings,
    RoomInfo, SessionDescription, SpeakerInfo, StreamStateInfo, TrackInfo, TrackKind,
};

/// Which transport connection a trickled candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalTarget {
    Publisher,
    Subscriber,
}

/// Client-to-server control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalRequest {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle {
        target: SignalTarget,
        /// JSON-encoded [`crate::model::IceCandidateInit`].
        candidate_init: String,
    },
    Mute {
        track_sid: String,
        muted: bool,
    },
    AddTrack {
        cid: String,
        name: String,
        kind: TrackKind,
        muted: bool,
    },
    UpdateSubscription {
        track_sids: Vec<String>,
        subscribe: bool,
    },
    UpdateTrackSettings {
        track_sids: Vec<String>,
        disabled: bool,
    },
    UpdateMetadata {
        metadata: String,
        name: String,
        attributes: HashMap<String, String>,
    },
    SyncState(SyncState),
    Simulate(SimulateScenario),
    Leave {
        reason: DisconnectReason,
    },
    Ping {
        timestamp: i64,
        rtt: i64,
    },
}

impl SignalRequest {
    /// Requests outside the ordered queue: position-sensitive negotiation
    /// state that must never be delivered late.
    pub fn is_skip_queue(&self) -> bool {
        matches!(
            self,
            SignalRequest::Trickle { .. }
                | SignalRequest::Offer(_)
                | SignalRequest::Answer(_)
                | SignalRequest::SyncState(_)
                | SignalRequest::Simulate(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SignalRequest::Offer(_) => "offer",
            SignalRequest::Answer(_) => "answer",
            SignalRequest::Trickle { .. } => "trickle",
            SignalRequest::Mute { .. } => "mute",
            SignalRequest::AddTrack { .. } => "add_track",
            SignalRequest::UpdateSubscription { .. } => "update_subscription",
            SignalRequest::UpdateTrackSettings { .. } => "update_track_settings",
            SignalRequest::UpdateMetadata { .. } => "update_metadata",
            SignalRequest::SyncState(_) => "sync_state",
            SignalRequest::Simulate(_) => "simulate",
            SignalRequest::Leave { .. } => "leave",
            SignalRequest::Ping { .. } => "ping",
        }
    }
}

/// Snapshot of local session state sent after a resume so the server can
/// reconcile subscriptions and published tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub answer: Option<SessionDescription>,
    pub subscribed_track_sids: Vec<String>,
    pub published_track_cids: Vec<String>,
}

/// Diagnostic scenarios the server can be asked to play out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulateScenario {
    NodeFailure,
    ServerLeave,
    Migration,
}

/// Server-to-client control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalResponse {
    Join(JoinResponse),
    Reconnect(ReconnectResponse),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle {
        target: SignalTarget,
        candidate_init: String,
    },
    ParticipantUpdate {
        participants: Vec<ParticipantInfo>,
    },
    TrackPublished {
        cid: String,
        track: TrackInfo,
    },
    TrackUnpublished {
        track_sid: String,
    },
    SpeakersChanged {
        speakers: Vec<SpeakerInfo>,
    },
    RoomUpdate {
        room: RoomInfo,
    },
    ConnectionQuality {
        updates: Vec<ConnectionQualityUpdate>,
    },
    StreamStateUpdate {
        stream_states: Vec<StreamStateInfo>,
    },
    RemoteMute {
        track_sid: String,
        muted: bool,
    },
    RefreshToken {
        token: String,
    },
    Leave {
        reason: DisconnectReason,
        can_reconnect: bool,
    },
    Pong {
        timestamp: i64,
    },
}

impl SignalResponse {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SignalResponse::Join(_) => "join",
            SignalResponse::Reconnect(_) => "reconnect",
            SignalResponse::Offer(_) => "offer",
            SignalResponse::Answer(_) => "answer",
            SignalResponse::Trickle { .. } => "trickle",
            SignalResponse::ParticipantUpdate { .. } => "participant_update",
            SignalResponse::TrackPublished { .. } => "track_published",
            SignalResponse::TrackUnpublished { .. } => "track_unpublished",
            SignalResponse::SpeakersChanged { .. } => "speakers_changed",
            SignalResponse::RoomUpdate { .. } => "room_update",
            SignalResponse::ConnectionQuality { .. } => "connection_quality",
            SignalResponse::StreamStateUpdate { .. } => "stream_state_update",
            SignalResponse::RemoteMute { .. } => "remote_mute",
            SignalResponse::RefreshToken { .. } => "refresh_token",
            SignalResponse::Leave { .. } => "leave",
            SignalResponse::Pong { .. } => "pong",
        }
    }
}

/// Everything the client needs to finish setting up a fresh session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub room: RoomInfo,
    pub participant: ParticipantInfo,
    pub other_participants: Vec<ParticipantInfo>,
    pub server_version: String,
    /// When set, the subscribe-direction connection carries the primary
    /// media flow and the server sends the first offer.
    pub subscriber_primary: bool,
    pub ice_servers: Vec<IceServer>,
    /// Keepalive cadence in seconds.
    pub ping_interval: u32,
    /// Seconds without a pong before the connection is treated as dead.
    pub ping_timeout: u32,
    pub region_settings: Option<RegionSettings>,
}

/// Acknowledgement of a resumed session; newer servers include refreshed
/// ICE servers for the restarted transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconnectResponse {
    pub ice_servers: Vec<IceServer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_queue_set_is_exactly_the_position_sensitive_requests() {
        let offer = SignalRequest::Offer(SessionDescription::offer("v=0", 1));
        let answer = SignalRequest::Answer(SessionDescription::answer("v=0", 1));
        let trickle = SignalRequest::Trickle {
            target: SignalTarget::Publisher,
            candidate_init: "{}".into(),
        };
        let sync = SignalRequest::SyncState(SyncState::default());
        let simulate = SignalRequest::Simulate(SimulateScenario::NodeFailure);
        for req in [&offer, &answer, &trickle, &sync, &simulate] {
            assert!(req.is_skip_queue(), "{} should skip", req.kind_name());
        }

        let mute = SignalRequest::Mute {
            track_sid: "TR_a".into(),
            muted: true,
        };
        let leave = SignalRequest::Leave {
            reason: DisconnectReason::ClientInitiated,
        };
        let ping = SignalRequest::Ping {
            timestamp: 1,
            rtt: 0,
        };
        for req in [&mute, &leave, &ping] {
            assert!(!req.is_skip_queue(), "{} should queue", req.kind_name());
        }
    }
}
