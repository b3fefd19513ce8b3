//! Per-path forwarder manager.
//!
//! Assembled at path init from the typed target lists; resolves
//! `$MTX_PATH`, skips disabled targets, starts children on "stream ready",
//! stops them on "stream not ready" with a bounded per-child interval.

use crate::{AnyForwarder, ForwarderStats, SrtForwarder, WhipForwarder};
use livecast_core::conf::{expand_path_vars, SrtForwardTarget, WebRtcForwardTarget};
use livecast_core::stream::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Host-level settings shared by every forwarder of a path.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub write_timeout: Duration,
    pub udp_max_payload_size: usize,
    pub write_queue_size: usize,
    /// Per-child stop budget; a child exceeding it is considered leaked.
    pub stop_timeout: Duration,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            udp_max_payload_size: 1472,
            write_queue_size: 256,
            stop_timeout: Duration::from_secs(3),
        }
    }
}

pub struct ForwarderManager {
    forwarders: Vec<Arc<AnyForwarder>>,
    settings: ForwarderSettings,
    cancel: CancellationToken,
}

impl ForwarderManager {
    #[must_use]
    pub fn new(
        path_name: &str,
        srt_targets: &[SrtForwardTarget],
        webrtc_targets: &[WebRtcForwardTarget],
        settings: ForwarderSettings,
    ) -> Self {
        let mut forwarders: Vec<Arc<AnyForwarder>> = Vec::new();

        for target in srt_targets {
            if !target.enable {
                continue;
            }
            let resolved = expand_path_vars(&target.url, path_name);
            debug!(from = %target.url, to = %resolved, "SRT forwarder URL resolved");
            forwarders.push(Arc::new(AnyForwarder::Srt(SrtForwarder::new(
                resolved,
                target.clone(),
                settings.write_timeout,
                settings.udp_max_payload_size,
                settings.write_queue_size,
            ))));
        }

        for target in webrtc_targets {
            if !target.enable {
                continue;
            }
            let resolved = expand_path_vars(&target.url, path_name);
            debug!(from = %target.url, to = %resolved, "WHIP forwarder URL resolved");
            forwarders.push(Arc::new(AnyForwarder::Whip(WhipForwarder::new(
                resolved,
                target.clone(),
                settings.write_timeout,
                settings.write_queue_size,
            ))));
        }

        Self {
            forwarders,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.forwarders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }

    /// Start every child against the ready stream. A start failure on one
    /// child never aborts the others.
    pub fn start(&self, stream: Stream) {
        for forwarder in &self.forwarders {
            let forwarder = Arc::clone(forwarder);
            let stream = stream.clone();
            tokio::spawn(async move {
                if let Err(err) = forwarder.start(stream) {
                    warn!(
                        target_url = %forwarder.target(),
                        "failed to start forwarder: {err}"
                    );
                }
            });
        }
    }

    /// Stop every child, each within the configured budget; a child that
    /// fails to stop in time is leaked and logged.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for forwarder in &self.forwarders {
            if tokio::time::timeout(self.settings.stop_timeout, forwarder.stop())
                .await
                .is_err()
            {
                warn!(
                    target_url = %forwarder.target(),
                    "forwarder did not stop in time, leaking it"
                );
            }
        }
    }

    /// Concatenated per-child statistics.
    #[must_use]
    pub fn stats(&self) -> Vec<ForwarderStats> {
        self.forwarders.iter().map(|f| f.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srt_target(url: &str, enable: bool) -> SrtForwardTarget {
        SrtForwardTarget {
            url: url.into(),
            enable,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_targets_skipped() {
        let manager = ForwarderManager::new(
            "live/foo",
            &[
                srt_target("srt://sink:8890?streamid=publish:$MTX_PATH", true),
                srt_target("srt://other:8890", false),
            ],
            &[WebRtcForwardTarget {
                url: "https://sink/$MTX_PATH/whip".into(),
                enable: true,
                ..Default::default()
            }],
            ForwarderSettings::default(),
        );
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_template_expansion_at_construction() {
        let manager = ForwarderManager::new(
            "live/foo",
            &[srt_target("srt://sink:8890?streamid=publish:$MTX_PATH", true)],
            &[],
            ForwarderSettings::default(),
        );
        assert_eq!(
            manager.forwarders[0].target(),
            "srt://sink:8890?streamid=publish:live/foo"
        );
    }

    #[test]
    fn test_stats_concatenation() {
        let manager = ForwarderManager::new(
            "live/foo",
            &[srt_target("srt://a:1", true), srt_target("srt://b:1", true)],
            &[],
            ForwarderSettings::default(),
        );
        let stats = manager.stats();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| !s.connected && s.packets_sent == 0));
    }
}
