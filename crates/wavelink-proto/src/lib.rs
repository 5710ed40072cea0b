//! Wire protocol shared between wavelink clients and media servers.
//!
//! Every control message is one bincode-encoded [`signal::SignalRequest`] or
//! [`signal::SignalResponse`] per WebSocket binary frame; the enum
//! discriminant doubles as the frame type tag.

pub mod codec;
pub mod model;
pub mod signal;

pub use codec::{CodecError, decode_request, decode_response, encode_request, encode_response};
pub use model::*;
pub use signal::{
    JoinResponse, ReconnectResponse, SignalRequest, SignalResponse, SignalTarget,
    SimulateScenario, SyncState,
};
