use thiserror::Error;

use crate::signal::{SignalRequest, SignalResponse};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame encode failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[source] bincode::Error),
}

pub fn encode_request(request: &SignalRequest) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(request).map_err(CodecError::Encode)
}

pub fn decode_request(frame: &[u8]) -> Result<SignalRequest, CodecError> {
    bincode::deserialize(frame).map_err(CodecError::Decode)
}

pub fn encode_response(response: &SignalResponse) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(response).map_err(CodecError::Encode)
}

pub fn decode_response(frame: &[u8]) -> Result<SignalResponse, CodecError> {
    bincode::deserialize(frame).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionDescription, TrackKind};
    use crate::signal::SignalTarget;

    #[test]
    fn request_frames_survive_the_wire() {
        let request = SignalRequest::AddTrack {
            cid: "cid-1".into(),
            name: "camera".into(),
            kind: TrackKind::Video,
            muted: false,
        };
        let frame = encode_request(&request).unwrap();
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn truncated_frame_is_a_decode_error() {
        let frame = encode_response(&SignalResponse::Answer(SessionDescription::answer(
            "v=0\r\n",
            3,
        )))
        .unwrap();
        let err = decode_response(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn trickle_candidate_blob_is_opaque_json() {
        let init = crate::model::IceCandidateInit {
            candidate: "candidate:1 1 UDP 2122252543 198.51.100.7 61665 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let request = SignalRequest::Trickle {
            target: SignalTarget::Subscriber,
            candidate_init: serde_json::to_string(&init).unwrap(),
        };
        let frame = encode_request(&request).unwrap();
        let SignalRequest::Trickle { candidate_init, .. } = decode_request(&frame).unwrap() else {
            panic!("wrong variant");
        };
        let parsed: crate::model::IceCandidateInit =
            serde_json::from_str(&candidate_init).unwrap();
        assert_eq!(parsed, init);
    }
}
