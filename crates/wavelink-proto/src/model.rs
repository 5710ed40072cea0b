use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A participant as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub name: String,
    pub metadata: String,
    pub attributes: HashMap<String, String>,
    pub state: ParticipantState,
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    #[default]
    Joining,
    Joined,
    Active,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
    Data,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub sid: String,
    pub name: String,
    pub kind: Option<TrackKind>,
    pub muted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub sid: String,
    pub name: String,
    pub metadata: String,
    pub num_participants: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub sid: String,
    pub level: f32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    #[default]
    Poor,
    Lost,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualityUpdate {
    pub participant_sid: String,
    pub quality: ConnectionQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Active,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStateInfo {
    pub participant_sid: String,
    pub track_sid: String,
    pub state: StreamState,
}

/// Why a session ended, as reported to the application once recovery is
/// abandoned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    #[default]
    Unknown,
    ClientInitiated,
    DuplicateIdentity,
    ServerShutdown,
    ParticipantRemoved,
    RoomDeleted,
    JoinFailure,
    StateMismatch,
}

/// ICE server entry handed out in join/reconnect responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// One equivalent endpoint of a managed multi-region deployment. Lower
/// `distance` ranks earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region: String,
    pub url: String,
    pub distance: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionSettings {
    pub regions: Vec<RegionInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description plus the correlation id used by publish-direction
/// renegotiation. `id` is `0` when the sender does not correlate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
    pub id: u32,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>, id: u32) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
            id,
        }
    }

    pub fn answer(sdp: impl Into<String>, id: u32) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
            id,
        }
    }
}

/// Trickled ICE candidates travel as a JSON blob so the transport layer's
/// own candidate encoding stays opaque to the signaling protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_init_uses_camel_case_wire_names() {
        let init = IceCandidateInit {
            candidate: "candidate:0 1 UDP 1 192.0.2.1 3000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&init).unwrap();
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdpMLineIndex").is_some());
        assert!(json.get("candidate").is_some());
    }
}
