//! Simulcast aggregation source.
//!
//! A synthetic publisher that attaches as a reader to several
//! independently published layer paths, allocates one SSRC per layer and
//! republishes every layer's packets into a single multi-layer stream
//! through the host's path machinery.

mod source;

pub use source::SimulcastSource;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulcastError {
    #[error("input path '{0}' did not become ready in time")]
    UpstreamNotReady(String),

    #[error("input path '{path}' has no matching {kind} format")]
    DescriptionMismatch { path: String, kind: &'static str },

    #[error("path registry: {0}")]
    PathAccess(#[from] livecast_core::path::PathError),

    #[error("no usable input layers")]
    NoInputs,
}
