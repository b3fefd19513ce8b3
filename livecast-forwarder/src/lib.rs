//! Per-path forwarder fleet.
//!
//! Forwarders attach a reader to the source stream of their path and push
//! its media to a remote WHIP or SRT endpoint with no re-encoding. Each
//! forwarder runs under its own supervisor task with an optional reconnect
//! loop; the [`manager::ForwarderManager`] owns the set for a path.

mod manager;
mod rtcp_sender;
mod srt;
mod stats;
mod whip;
mod whip_client;

pub use manager::{ForwarderManager, ForwarderSettings};
pub use srt::SrtForwarder;
pub use stats::ForwarderStats;
pub use whip::WhipForwarder;
pub use whip_client::WhipClient;

use livecast_core::stream::Stream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("forwarder already started")]
    AlreadyStarted,

    #[error("invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("WHIP signalling failed: {0}")]
    Signalling(String),

    #[error("WHIP session gone: {0}")]
    SessionGone(String),
}

/// The forwarder kinds the manager can hold, with their shared capability
/// set.
pub enum AnyForwarder {
    Srt(SrtForwarder),
    Whip(WhipForwarder),
}

impl AnyForwarder {
    /// One-shot start; fails with [`ForwarderError::AlreadyStarted`] on a
    /// second call.
    pub fn start(&self, stream: Stream) -> Result<(), ForwarderError> {
        match self {
            Self::Srt(f) => f.start(stream),
            Self::Whip(f) => f.start(stream),
        }
    }

    /// Idempotent stop; joins the supervisor.
    pub async fn stop(&self) {
        match self {
            Self::Srt(f) => f.stop().await,
            Self::Whip(f) => f.stop().await,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        match self {
            Self::Srt(f) => f.is_running(),
            Self::Whip(f) => f.is_running(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        match self {
            Self::Srt(f) => f.stats(),
            Self::Whip(f) => f.stats(),
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Srt(f) => f.target(),
            Self::Whip(f) => f.target(),
        }
    }
}
