//! Transcoding output pipeline.
//!
//! Each output drives an external encoder over stdio: the source stream is
//! muxed to MPEG-TS into the child's stdin, the child's MPEG-TS stdout is
//! demuxed and republished as a synthetic stream, and a static source
//! binds that stream to a sibling path.

mod manager;
mod output;
mod source;

pub use manager::TranscoderManager;
pub use output::Output;
pub use source::{parse_transcoder_source, TranscoderSource, TranscoderStreamProvider};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscoderError {
    #[error("transcoder already active")]
    AlreadyActive,

    #[error("failed to spawn encoder: {0}")]
    ChildSpawnFailed(String),

    #[error("encoder exited: {0}")]
    ChildExited(String),

    #[error("output '{path}' misconfigured: {reason}")]
    InvalidOutput { path: String, reason: String },
}
