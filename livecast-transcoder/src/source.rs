//! Transcoder static source: binds an output stream to its sibling path.

use crate::TranscoderError;
use livecast_core::path::{PathRegistry, ReaderAuthor, RunParams, SourceHooks, StaticSource};
use livecast_core::stream::{Reader, Stream};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Access to a path's transcoder output streams.
#[async_trait]
pub trait TranscoderStreamProvider: Send + Sync {
    async fn transcoder_output_stream(&self, output_path: &str) -> Option<Stream>;
}

/// Parse a `transcoder:input_path:output_path` source string.
#[must_use]
pub fn parse_transcoder_source(source: &str) -> Option<(String, String)> {
    let rest = source.strip_prefix("transcoder:")?;
    let (input, output) = rest.rsplit_once(':')?;
    if input.is_empty() || output.is_empty() {
        return None;
    }
    Some((input.to_string(), output.to_string()))
}

/// Static source publishing one transcoder output on its sibling path.
///
/// Acquires the output stream from the input path's transcoder, signals
/// ready with its description and keeps a null reader attached so the
/// stream is not collected while the path lives.
pub struct TranscoderSource {
    input_path: String,
    output_path: String,
    registry: Arc<dyn PathRegistry>,
    provider: Arc<dyn TranscoderStreamProvider>,
    hooks: Arc<dyn SourceHooks>,
    ready_timeout: Duration,
}

impl TranscoderSource {
    #[must_use]
    pub fn new(
        input_path: String,
        output_path: String,
        registry: Arc<dyn PathRegistry>,
        provider: Arc<dyn TranscoderStreamProvider>,
        hooks: Arc<dyn SourceHooks>,
    ) -> Self {
        Self {
            input_path,
            output_path,
            registry,
            provider,
            hooks,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Override the output-description readiness deadline.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

#[async_trait]
impl StaticSource for TranscoderSource {
    async fn run(&self, params: RunParams) -> anyhow::Result<()> {
        info!(
            input = %self.input_path,
            output = %self.output_path,
            "transcoder source starting"
        );

        // reading the input path keeps its transcoder running
        let author = ReaderAuthor {
            kind: "transcoder",
            id: format!("transcoder:{}:{}", self.input_path, self.output_path),
        };
        self.registry
            .add_reader(author.clone(), &self.input_path)
            .await?;

        let result = self.run_bound(&params).await;

        self.registry.remove_reader(&author, &self.input_path).await;
        result
    }
}

impl TranscoderSource {
    async fn run_bound(&self, params: &RunParams) -> anyhow::Result<()> {
        let out_stream = self
            .provider
            .transcoder_output_stream(&self.output_path)
            .await
            .ok_or_else(|| TranscoderError::InvalidOutput {
                path: self.output_path.clone(),
                reason: "no transcoder output stream for this path".into(),
            })?;

        // wait for the output description; the tentative one is acceptable
        // past the deadline as long as it is non-empty
        let wait_start = Instant::now();
        while out_stream.desc().medias.is_empty() {
            if wait_start.elapsed() >= self.ready_timeout {
                warn!(
                    output = %self.output_path,
                    "output stream has no description, giving up"
                );
                anyhow::bail!(
                    "transcoder output stream '{}' has no description",
                    self.output_path
                );
            }
            tokio::select! {
                _ = params.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }

        let desc = out_stream.desc();
        let _published = self.hooks.set_ready(desc.clone()).await?;

        // a null reader pins the output stream for the path's lifetime
        let keepalive = Reader::new();
        out_stream.add_reader(&keepalive);

        info!(
            output = %self.output_path,
            medias = %desc.medias_info(),
            "transcoder source ready"
        );

        params.cancel.cancelled().await;

        out_stream.remove_reader(&keepalive);
        self.hooks.set_not_ready().await;
        debug!(output = %self.output_path, "transcoder source stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_core::desc::{Format, Media, MediaType, Session};
    use livecast_core::path::PathError;
    use livecast_core::stream::StreamParams;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_parse_transcoder_source() {
        assert_eq!(
            parse_transcoder_source("transcoder:live/in:live/in-480p"),
            Some(("live/in".to_string(), "live/in-480p".to_string()))
        );
        assert!(parse_transcoder_source("transcoder:no-colon").is_none());
        assert!(parse_transcoder_source("rtsp://cam/stream").is_none());
        assert!(parse_transcoder_source("transcoder::out").is_none());
    }

    struct StubRegistry;

    #[async_trait]
    impl PathRegistry for StubRegistry {
        async fn add_reader(
            &self,
            _author: ReaderAuthor,
            _path: &str,
        ) -> Result<Stream, PathError> {
            Ok(Stream::new(StreamParams::default()))
        }

        async fn remove_reader(&self, _author: &ReaderAuthor, _path: &str) {}
    }

    struct StubProvider {
        stream: Option<Stream>,
    }

    #[async_trait]
    impl TranscoderStreamProvider for StubProvider {
        async fn transcoder_output_stream(&self, _output_path: &str) -> Option<Stream> {
            self.stream.clone()
        }
    }

    struct StubHooks {
        ready_desc: Mutex<Option<Session>>,
        not_ready: Mutex<bool>,
    }

    #[async_trait]
    impl SourceHooks for StubHooks {
        async fn set_ready(&self, desc: Session) -> Result<Stream, PathError> {
            *self.ready_desc.lock() = Some(desc);
            Ok(Stream::new(StreamParams::default()))
        }

        async fn set_not_ready(&self) {
            *self.not_ready.lock() = true;
        }
    }

    fn output_stream() -> Stream {
        Stream::new(StreamParams {
            desc: Session {
                medias: vec![Media {
                    media_type: MediaType::Audio,
                    formats: vec![Format::Opus {
                        payload_type: 97,
                        channels: 2,
                    }],
                }],
            },
            write_queue_size: 8,
        })
    }

    #[tokio::test]
    async fn test_publishes_output_description() {
        let stream = output_stream();
        let hooks = Arc::new(StubHooks {
            ready_desc: Mutex::new(None),
            not_ready: Mutex::new(false),
        });
        let hooks_dyn: Arc<dyn SourceHooks> = hooks.clone();
        let source = TranscoderSource::new(
            "live/in".into(),
            "live/in-480p".into(),
            Arc::new(StubRegistry),
            Arc::new(StubProvider {
                stream: Some(stream.clone()),
            }),
            hooks_dyn,
        );

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run = tokio::spawn(async move { source.run(RunParams { cancel: run_cancel }).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(hooks.ready_desc.lock().is_some());
        assert_eq!(stream.reader_count(), 1, "null reader must pin the stream");

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert!(*hooks.not_ready.lock());
        assert_eq!(stream.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_output_stream_fails() {
        let source = TranscoderSource::new(
            "live/in".into(),
            "live/in-480p".into(),
            Arc::new(StubRegistry),
            Arc::new(StubProvider { stream: None }),
            Arc::new(StubHooks {
                ready_desc: Mutex::new(None),
                not_ready: Mutex::new(false),
            }),
        );

        let err = source
            .run(RunParams {
                cancel: CancellationToken::new(),
            })
            .await
            .expect_err("must fail without an output stream");
        assert!(err.to_string().contains("no transcoder output stream"));
    }
}
