//! Per-path transcoder manager.

use crate::{Output, TranscoderError, TranscoderStreamProvider};
use livecast_core::conf::TranscodingConfig;
use livecast_core::stream::Stream;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns every transcoding output of a path. Outputs start on "stream
/// ready" and stop on "stream not ready"; their synthetic streams are
/// handed to sibling-path sources through [`TranscoderStreamProvider`].
pub struct TranscoderManager {
    config: TranscodingConfig,
    outputs: DashMap<String, Arc<Output>>,
    active: AtomicBool,
}

impl TranscoderManager {
    #[must_use]
    pub fn new(config: TranscodingConfig) -> Self {
        Self {
            config,
            outputs: DashMap::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Create and start every configured output against the input stream.
    pub async fn start(&self, input_stream: Stream) -> Result<(), TranscoderError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(TranscoderError::AlreadyActive);
        }
        if !self.config.enable {
            debug!("transcoding disabled, skipping");
            return Ok(());
        }

        info!(outputs = self.config.outputs.len(), "starting transcoder");
        for output_config in &self.config.outputs {
            let output = Arc::new(Output::new(output_config.clone())?);
            output.start(input_stream.clone()).await?;
            self.outputs.insert(output_config.path.clone(), output);
        }
        Ok(())
    }

    /// Stop every output; idempotent.
    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let outputs: Vec<Arc<Output>> = self
            .outputs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.outputs.clear();
        for output in outputs {
            output.stop().await;
            debug!(path = %output.path(), "stopped output");
        }
        info!("transcoder stopped");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscoderStreamProvider for TranscoderManager {
    async fn transcoder_output_stream(&self, output_path: &str) -> Option<Stream> {
        self.outputs.get(output_path).map(|entry| entry.stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_core::conf::{OutputKind, TranscodingOutput, TranscodingVideoParams};

    #[tokio::test]
    async fn test_disabled_config_is_noop() {
        let manager = TranscoderManager::new(TranscodingConfig {
            enable: false,
            outputs: vec![TranscodingOutput {
                path: "live/in-480p".into(),
                kind: OutputKind::Video,
                video: Some(TranscodingVideoParams::default()),
                audio: None,
            }],
        });
        let stream = Stream::new(Default::default());
        manager.start(stream).await.unwrap();
        assert!(manager.is_active());
        assert!(manager
            .transcoder_output_stream("live/in-480p")
            .await
            .is_none());
        manager.stop().await;
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = TranscoderManager::new(TranscodingConfig::default());
        let stream = Stream::new(Default::default());
        manager.start(stream.clone()).await.unwrap();
        assert!(matches!(
            manager.start(stream).await,
            Err(TranscoderError::AlreadyActive)
        ));
    }
}
