use parking_lot::RwLock;
use wavelink_proto::{TrackInfo, TrackKind};

/// A locally published track as the engine knows it. `sid` stays empty
/// until the server acknowledges the publication.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTrack {
    pub cid: String,
    pub sid: Option<String>,
    pub name: String,
    pub kind: TrackKind,
    pub muted: bool,
}

/// Registry of currently published local tracks, enumerated when a full
/// reconnect has to republish everything.
#[derive(Default)]
pub struct LocalTrackRegistry {
    tracks: RwLock<Vec<LocalTrack>>,
}

impl LocalTrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a track that is about to be published. Returns `false` when
    /// the cid is already registered.
    pub fn register(&self, track: LocalTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.cid == track.cid) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn mark_published(&self, cid: &str, info: &TrackInfo) {
        let mut tracks = self.tracks.write();
        if let Some(track) = tracks.iter_mut().find(|t| t.cid == cid) {
            track.sid = Some(info.sid.clone());
            track.muted = info.muted;
        }
    }

    pub fn remove_by_cid(&self, cid: &str) {
        self.tracks.write().retain(|t| t.cid != cid);
    }

    pub fn remove_by_sid(&self, sid: &str) {
        self.tracks
            .write()
            .retain(|t| t.sid.as_deref() != Some(sid));
    }

    pub fn set_muted(&self, sid: &str, muted: bool) {
        let mut tracks = self.tracks.write();
        if let Some(track) = tracks.iter_mut().find(|t| t.sid.as_deref() == Some(sid)) {
            track.muted = muted;
        }
    }

    pub fn snapshot(&self) -> Vec<LocalTrack> {
        self.tracks.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    pub fn clear(&self) {
        self.tracks.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(cid: &str) -> LocalTrack {
        LocalTrack {
            cid: cid.to_string(),
            sid: None,
            name: "mic".to_string(),
            kind: TrackKind::Audio,
            muted: false,
        }
    }

    #[test]
    fn duplicate_cid_is_rejected() {
        let registry = LocalTrackRegistry::new();
        assert!(registry.register(track("cid-1")));
        assert!(!registry.register(track("cid-1")));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn publish_ack_attaches_sid() {
        let registry = LocalTrackRegistry::new();
        registry.register(track("cid-1"));
        let info = TrackInfo {
            sid: "TR_abc".into(),
            name: "mic".into(),
            kind: Some(TrackKind::Audio),
            muted: false,
        };
        registry.mark_published("cid-1", &info);
        assert_eq!(registry.snapshot()[0].sid.as_deref(), Some("TR_abc"));

        registry.remove_by_sid("TR_abc");
        assert!(registry.is_empty());
    }
}
