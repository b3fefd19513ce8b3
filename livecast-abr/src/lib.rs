//! Adaptive WHEP reader.
//!
//! Drives a WHEP session against a simulcast publication and switches
//! between quality levels by recycling the session with a different
//! bandwidth cap in the offer. The decision core ([`AbrEngine`]) is pure
//! state: it consumes one stats sample per second and emits switch
//! decisions; the session driver owns the peer connection and the WHEP
//! signalling.

mod controller;
mod levels;
mod metrics;
mod sdp;
mod session;
mod whep;

pub use controller::{AbrConfig, AbrEngine, ControllerState, Decision, SwitchReason};
pub use levels::{Level, PenaltyBox, VideoCodec};
pub use metrics::{MetricsWindow, TickMetrics, TickSample};
pub use sdp::{strip_simulcast_attrs, with_bandwidth_cap};
pub use session::{AbrPlayer, WhepSession};
pub use whep::WhepClient;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbrError {
    #[error("WHEP signalling failed: {0}")]
    Signalling(String),

    #[error("WHEP session gone: {0}")]
    SessionGone(String),

    #[error("peer connection failed: {0}")]
    PeerConnection(String),

    #[error("no usable level (all banned or exhausted)")]
    NoUsableLevel,

    #[error("controller closed")]
    Closed,
}
