use wavelink_proto::{
    ConnectionQualityUpdate, DisconnectReason, ParticipantInfo, RoomInfo, SpeakerInfo,
    StreamStateInfo, TrackInfo,
};

/// Notifications delivered to the application, in the order the triggering
/// server events arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Initial connection established.
    Connected,
    /// A lightweight resume (ICE restart) is in progress.
    Resuming,
    /// A full session rebuild is in progress.
    Reconnecting,
    /// Recovery finished; the session is live again.
    Reconnected,
    /// Recovery was abandoned or the session was closed.
    Disconnected { reason: DisconnectReason },
    ParticipantUpdate { participants: Vec<ParticipantInfo> },
    SpeakersChanged { speakers: Vec<SpeakerInfo> },
    RoomUpdate { room: RoomInfo },
    ConnectionQuality { updates: Vec<ConnectionQualityUpdate> },
    StreamStateUpdate { stream_states: Vec<StreamStateInfo> },
    RemoteMute { track_sid: String, muted: bool },
    LocalTrackPublished { track: TrackInfo },
    LocalTrackUnpublished { track_sid: String },
    /// A remote media track arrived on the subscribe transport.
    TrackAdded { track_id: String },
}
