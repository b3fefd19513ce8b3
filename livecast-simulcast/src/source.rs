//! The simulcast static source.

use crate::SimulcastError;
use livecast_core::conf::{SimulcastConfig, SimulcastInput};
use livecast_core::desc::{Media, MediaType, Session};
use livecast_core::path::{PathRegistry, ReaderAuthor, RunParams, SourceHooks, StaticSource};
use livecast_core::stream::{Reader, Stream};
use livecast_core::unit::Unit;
use livecast_core::util::random_ssrc;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// One connected input layer.
struct LayerBinding {
    input: SimulcastInput,
    author: ReaderAuthor,
    stream: Stream,
    reader: Reader,
    ssrc: u32,
}

/// Static source bundling several layer paths into one output stream.
///
/// Driven by the host through [`StaticSource::run`]: connects every input,
/// signals ready with a synthesized description, forwards cloned packets
/// with per-layer SSRCs, and signals not-ready on exit.
pub struct SimulcastSource {
    config: SimulcastConfig,
    registry: Arc<dyn PathRegistry>,
    hooks: Arc<dyn SourceHooks>,
    ready_timeout: Duration,
}

impl SimulcastSource {
    #[must_use]
    pub fn new(
        config: SimulcastConfig,
        registry: Arc<dyn PathRegistry>,
        hooks: Arc<dyn SourceHooks>,
    ) -> Self {
        Self {
            config,
            registry,
            hooks,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Override the upstream readiness deadline.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    async fn connect_inputs(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LayerBinding>, SimulcastError> {
        let mut bindings = Vec::new();

        for input in &self.config.inputs {
            debug!(path = %input.path, layer = ?input.layer, "connecting simulcast input");

            let author = ReaderAuthor {
                kind: "simulcast",
                id: format!("simulcast:{}", input.path),
            };
            let stream = match self.registry.add_reader(author.clone(), &input.path).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.disconnect_inputs(&bindings).await;
                    return Err(e.into());
                }
            };

            // bounded wait for the upstream description to populate
            let wait_start = Instant::now();
            loop {
                if !stream.desc().medias.is_empty() {
                    break;
                }
                if wait_start.elapsed() >= self.ready_timeout {
                    self.registry.remove_reader(&author, &input.path).await;
                    self.disconnect_inputs(&bindings).await;
                    return Err(SimulcastError::UpstreamNotReady(input.path.clone()));
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.registry.remove_reader(&author, &input.path).await;
                        self.disconnect_inputs(&bindings).await;
                        return Err(SimulcastError::UpstreamNotReady(input.path.clone()));
                    }
                    _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
                }
            }

            let ssrc = random_ssrc();
            info!(
                path = %input.path,
                layer = ?input.layer,
                rid = input.layer.rid(),
                ssrc,
                medias = %stream.desc().medias_info(),
                "simulcast input connected"
            );

            bindings.push(LayerBinding {
                input: input.clone(),
                author,
                stream,
                reader: Reader::new(),
                ssrc,
            });
        }

        if bindings.is_empty() {
            return Err(SimulcastError::NoInputs);
        }
        Ok(bindings)
    }

    async fn disconnect_inputs(&self, bindings: &[LayerBinding]) {
        for binding in bindings {
            binding.stream.remove_reader(&binding.reader);
            self.registry
                .remove_reader(&binding.author, &binding.input.path)
                .await;
            debug!(path = %binding.input.path, "simulcast input disconnected");
        }
    }

    /// One video media (format of the first H.264 video input) and one
    /// audio media (format of the first Opus audio input); either may be
    /// absent.
    fn synthesize_description(&self, bindings: &[LayerBinding]) -> Session {
        let mut medias = Vec::new();

        if let Some(format) = bindings
            .iter()
            .filter(|b| b.input.media_type == MediaType::Video)
            .find_map(|b| b.stream.desc().first_h264().map(|(_, _, f)| f.clone()))
        {
            medias.push(Media {
                media_type: MediaType::Video,
                formats: vec![format],
            });
        }

        if let Some(format) = bindings
            .iter()
            .filter(|b| b.input.media_type == MediaType::Audio)
            .find_map(|b| b.stream.desc().first_opus().map(|(_, _, f)| f.clone()))
        {
            medias.push(Media {
                media_type: MediaType::Audio,
                formats: vec![format],
            });
        }

        Session { medias }
    }

    /// Wire one input layer's reader into the output stream.
    ///
    /// Packets are cloned (header by value, payload into a fresh buffer)
    /// before the SSRC rewrite so sibling readers of the upstream never
    /// observe the mutation.
    fn start_forwarding(
        &self,
        binding: &LayerBinding,
        out_stream: &Stream,
        out_desc: &Session,
        cancel: &CancellationToken,
    ) -> Result<(), SimulcastError> {
        let upstream_desc = binding.stream.desc();

        let (src, dst, rewrite_ssrc) = match binding.input.media_type {
            MediaType::Video => {
                let src = upstream_desc.first_h264().map(|(mi, fi, _)| (mi, fi));
                let dst = out_desc.first_h264().map(|(mi, fi, _)| (mi, fi));
                (src, dst, true)
            }
            MediaType::Audio => {
                let src = upstream_desc.first_opus().map(|(mi, fi, _)| (mi, fi));
                let dst = out_desc.first_opus().map(|(mi, fi, _)| (mi, fi));
                (src, dst, self.config.rewrite_audio_ssrc)
            }
        };
        let kind = match binding.input.media_type {
            MediaType::Video => "H264",
            MediaType::Audio => "Opus",
        };
        let (Some((src_mi, src_fi)), Some((dst_mi, dst_fi))) = (src, dst) else {
            return Err(SimulcastError::DescriptionMismatch {
                path: binding.input.path.clone(),
                kind,
            });
        };

        let ssrc = binding.ssrc;
        let out_stream = out_stream.clone();
        let cancel = cancel.clone();

        binding.reader.on_data(src_mi, src_fi, move |unit: &Unit| {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            if unit.nil_payload() {
                return Ok(());
            }

            for pkt in &unit.rtp_packets {
                let mut cloned = rtp::packet::Packet {
                    header: pkt.header.clone(),
                    payload: Bytes::copy_from_slice(&pkt.payload),
                };
                if rewrite_ssrc {
                    cloned.header.ssrc = ssrc;
                }
                let pts = i64::from(cloned.header.timestamp);
                out_stream.write_rtp_packet(dst_mi, dst_fi, cloned, unit.ntp, pts);
            }
            Ok(())
        });

        binding.stream.add_reader(&binding.reader);
        info!(
            path = %binding.input.path,
            layer = ?binding.input.layer,
            ssrc,
            "simulcast forwarding started"
        );
        Ok(())
    }
}

#[async_trait]
impl StaticSource for SimulcastSource {
    async fn run(&self, params: RunParams) -> anyhow::Result<()> {
        info!(inputs = self.config.inputs.len(), "simulcast source starting");

        let bindings = self.connect_inputs(&params.cancel).await?;

        let desc = self.synthesize_description(&bindings);
        if desc.medias.is_empty() {
            self.disconnect_inputs(&bindings).await;
            return Err(SimulcastError::NoInputs.into());
        }

        let out_stream = match self.hooks.set_ready(desc.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.disconnect_inputs(&bindings).await;
                return Err(e.into());
            }
        };

        for binding in &bindings {
            if let Err(e) = self.start_forwarding(binding, &out_stream, &desc, &params.cancel) {
                // a mismatched input is skipped, the rest keep flowing
                error!(path = %binding.input.path, "simulcast input skipped: {e}");
            }
        }

        info!(medias = %desc.medias_info(), "simulcast source ready");

        params.cancel.cancelled().await;

        self.disconnect_inputs(&bindings).await;
        self.hooks.set_not_ready().await;
        info!("simulcast source stopped");
        Ok(())
    }
}
