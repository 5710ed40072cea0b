//! wavelink client core: signaling, session recovery, and region failover
//! for real-time media rooms.
//!
//! The [`engine::SessionEngine`] owns a [`signal::SignalChannel`] plus two
//! transport connections (publish and subscribe direction) and keeps the
//! session alive across network churn: a cheap resume with ICE restart when
//! possible, a full rebuild with track republication when not.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod region;
pub mod rtc;
pub mod signal;
pub mod track;

pub use config::{ClientInfo, ConnectOptions, ReconnectOverride, ReconnectPolicy};
pub use engine::{ConnectionState, SessionEngine};
pub use error::{EngineError, NegotiationError, RegionError, SignalError};
pub use events::EngineEvent;
