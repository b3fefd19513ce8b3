//! Host path-machinery interfaces.
//!
//! The host media server owns the path registry and per-path lifecycle;
//! these traits are the surface this extension consumes. Static sources
//! (simulcast aggregation, transcoder publication) are driven through
//! [`StaticSource::run`] and report readiness through [`SourceHooks`].

use crate::desc::Session;
use crate::stream::Stream;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("access denied on path: {0}")]
    AccessDenied(String),

    #[error("path not ready: {0}")]
    NotReady(String),
}

/// Identity a reader presents to the host's access control.
#[derive(Debug, Clone)]
pub struct ReaderAuthor {
    /// Source kind, e.g. `simulcast` or `transcoder`.
    pub kind: &'static str,
    /// Unique identity per attachment.
    pub id: String,
}

/// Host path registry: attach/detach readers on named paths.
#[async_trait]
pub trait PathRegistry: Send + Sync {
    /// Register a reader on a path and obtain its source stream.
    async fn add_reader(&self, author: ReaderAuthor, path: &str) -> Result<Stream, PathError>;

    /// Remove a previously registered reader.
    async fn remove_reader(&self, author: &ReaderAuthor, path: &str);
}

/// Host hooks a static source uses to publish its synthetic stream.
#[async_trait]
pub trait SourceHooks: Send + Sync {
    /// Signal readiness with a session description; returns the synthetic
    /// stream this source writes into.
    async fn set_ready(&self, desc: Session) -> Result<Stream, PathError>;

    /// Signal that the source is no longer producing.
    async fn set_not_ready(&self);
}

/// Parameters handed to [`StaticSource::run`].
pub struct RunParams {
    pub cancel: CancellationToken,
}

/// A source whose lifetime is owned by its path.
#[async_trait]
pub trait StaticSource: Send + Sync {
    async fn run(&self, params: RunParams) -> anyhow::Result<()>;
}
