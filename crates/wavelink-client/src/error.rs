use thiserror::Error;
use wavelink_proto::CodecError;

/// Failures at the signaling-channel boundary.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failures applying descriptions or candidates to a transport connection.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("transport connection is closed")]
    Closed,
    #[error("malformed ice candidate: {0}")]
    BadCandidate(String),
}

/// Failures fetching or selecting region endpoints.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("region lookup is only supported for managed cloud domains")]
    UnsupportedDomain,
    #[error("region settings request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("region settings rejected: {status} {body}")]
    Rejected { status: u16, body: String },
}

/// Top-level error surface of the session engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("track {0} is already being published")]
    DuplicateTrack(String),
    #[error("server did not acknowledge track publication in time")]
    PublishTimeout,
    #[error("no more region candidates to try")]
    EndpointsExhausted,
    #[error("reconnect attempts exhausted")]
    ReconnectAttemptsExhausted,
    #[error("transport connection did not become connected in time")]
    TransportConnectTimeout,
    #[error("engine is closed")]
    Closed,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}
