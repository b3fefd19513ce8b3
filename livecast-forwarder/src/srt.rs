//! SRT forwarder: wraps the source stream in MPEG-TS and drives a
//! caller-mode SRT connection with optional reconnect.

use crate::stats::{Counters, ForwarderStats};
use crate::ForwarderError;
use bytes::Bytes;
use futures::SinkExt;
use livecast_core::conf::SrtForwardTarget;
use livecast_core::mpegts;
use livecast_core::stream::{Reader, Stream};
use parking_lot::Mutex;
use srt_tokio::options::PacketSize;
use srt_tokio::SrtSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_LATENCY_MS: u64 = 120;
const DEFAULT_PACKET_SIZE: usize = 1316;
const SRT_HEADER_SIZE: usize = 16;

/// Parsed `srt://` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SrtUrl {
    pub address: String,
    pub stream_id: Option<String>,
    pub passphrase: Option<String>,
}

impl SrtUrl {
    pub(crate) fn parse(raw: &str) -> Result<Self, ForwarderError> {
        let parsed = url::Url::parse(raw).map_err(|e| ForwarderError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "srt" {
            return Err(ForwarderError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("scheme must be srt, got {}", parsed.scheme()),
            });
        }
        let host = parsed.host_str().ok_or_else(|| ForwarderError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        })?;
        let port = parsed.port().unwrap_or(8890);

        let mut stream_id = None;
        let mut passphrase = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "streamid" => stream_id = Some(value.into_owned()),
                "passphrase" => passphrase = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            address: format!("{host}:{port}"),
            stream_id,
            passphrase,
        })
    }
}

struct SrtInner {
    url: String,
    target: SrtForwardTarget,
    write_timeout: Duration,
    udp_max_payload_size: usize,
    write_queue_size: usize,
    cancel: Mutex<CancellationToken>,
    counters: Counters,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stream: Mutex<Option<Stream>>,
}

/// SRT forwarder instance. The target URL must already have path variables
/// expanded.
#[derive(Clone)]
pub struct SrtForwarder {
    inner: Arc<SrtInner>,
}

impl SrtForwarder {
    #[must_use]
    pub fn new(
        url: String,
        target: SrtForwardTarget,
        write_timeout: Duration,
        udp_max_payload_size: usize,
        write_queue_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SrtInner {
                url,
                target,
                write_timeout,
                udp_max_payload_size,
                write_queue_size,
                cancel: Mutex::new(CancellationToken::new()),
                counters: Counters::default(),
                supervisor: Mutex::new(None),
                stream: Mutex::new(None),
            }),
        }
    }

    /// One-shot start: spawns the supervisor.
    pub fn start(&self, stream: Stream) -> Result<(), ForwarderError> {
        let mut slot = self.inner.stream.lock();
        if slot.is_some() {
            return Err(ForwarderError::AlreadyStarted);
        }
        *slot = Some(stream);
        drop(slot);

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { run_supervisor(inner, cancel).await });
        *self.inner.supervisor.lock() = Some(handle);
        Ok(())
    }

    /// Idempotent stop: cancels and joins the supervisor. The reader is
    /// detached by the inner run's teardown, never here.
    pub async fn stop(&self) {
        self.inner.cancel.lock().cancel();
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.inner.stream.lock() = None;
        self.inner.counters.set_connected(false);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.stream.lock().is_some()
    }

    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        self.inner.counters.snapshot()
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.inner.url
    }
}

async fn run_supervisor(inner: Arc<SrtInner>, cancel: CancellationToken) {
    let started_at = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(err) = run_inner(&inner, &cancel).await {
            inner.counters.record_error(&err);
            warn!(target_url = %inner.url, "SRT forwarder error: {err}");
        }

        if cancel.is_cancelled() || !inner.target.reconnect {
            return;
        }
        if inner.target.max_reconnect_time_ms > 0
            && started_at.elapsed() >= Duration::from_millis(inner.target.max_reconnect_time_ms)
        {
            warn!(target_url = %inner.url, "reconnect window exhausted, giving up");
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(inner.target.reconnect_delay_ms)) => {
                inner.counters.add_reconnect();
                info!(target_url = %inner.url, "reconnecting");
            }
        }
    }
}

async fn run_inner(inner: &Arc<SrtInner>, cancel: &CancellationToken) -> Result<(), ForwarderError> {
    let srt_url = SrtUrl::parse(&inner.url)?;
    let passphrase = inner
        .target
        .passphrase
        .clone()
        .or_else(|| srt_url.passphrase.clone());
    let latency = Duration::from_millis(if inner.target.latency_ms > 0 {
        inner.target.latency_ms
    } else {
        DEFAULT_LATENCY_MS
    });
    let packet_size = if inner.target.packet_size > 0 {
        inner.target.packet_size
    } else {
        DEFAULT_PACKET_SIZE
    };

    debug!(
        address = %srt_url.address,
        stream_id = srt_url.stream_id.as_deref().unwrap_or(""),
        "SRT forwarder connecting"
    );

    let mut builder = SrtSocket::builder().latency(latency).set(|options| {
        options.session.max_segment_size = PacketSize(packet_size as u64);
    });
    if let Some(pass) = &passphrase {
        builder = builder.encryption(0, pass);
    }
    let dial = builder.call(srt_url.address.as_str(), srt_url.stream_id.as_deref());
    let mut socket = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = dial => res.map_err(|e| ForwarderError::DialFailed(e.to_string()))?,
    };

    inner.counters.set_connected(true);

    let max_payload = inner.udp_max_payload_size.saturating_sub(SRT_HEADER_SIZE) / 188 * 188;

    let stream = inner
        .stream
        .lock()
        .clone()
        .ok_or_else(|| ForwarderError::TransportLost("stream detached".into()))?;
    let desc = stream.desc();

    let reader = Reader::new();
    let (tx, mut rx) = mpsc::channel::<Bytes>(inner.write_queue_size);
    let observer_inner = Arc::clone(inner);
    let observer: mpegts::UnitObserver = Arc::new(move |unit| {
        observer_inner
            .counters
            .add_packets_sent(unit.rtp_packets.len() as u64);
    });
    mpegts::from_stream(&desc, &reader, tx, Some(observer))
        .map_err(|e| ForwarderError::TransportLost(e.to_string()))?;

    stream.add_reader(&reader);

    let result = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                err = reader.wait_error() => {
                    return Err(ForwarderError::TransportLost(err.to_string()));
                }
                burst = rx.recv() => {
                    let Some(burst) = burst else { return Ok(()) };
                    if max_payload == 0 {
                        return Err(ForwarderError::TransportLost(
                            "udp payload size too small for MPEG-TS".into(),
                        ));
                    }
                    let mut offset = 0;
                    while offset < burst.len() {
                        let end = (offset + max_payload).min(burst.len());
                        let chunk = burst.slice(offset..end);
                        let len = chunk.len();
                        let send = socket.send((Instant::now(), chunk));
                        match tokio::time::timeout(inner.write_timeout, send).await {
                            Ok(Ok(())) => inner.counters.add_bytes_sent(len as u64),
                            Ok(Err(e)) => {
                                return Err(ForwarderError::TransportLost(e.to_string()))
                            }
                            Err(_) => {
                                return Err(ForwarderError::TransportLost(
                                    "write deadline exceeded".into(),
                                ))
                            }
                        }
                        offset = end;
                    }
                }
            }
        }
    }
    .await;

    // sole detacher of the reader
    stream.remove_reader(&reader);
    let _ = socket.close().await;
    inner.counters.set_connected(false);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_core::desc::Session;
    use livecast_core::stream::StreamParams;

    fn target() -> SrtForwardTarget {
        SrtForwardTarget {
            url: "srt://127.0.0.1:1/".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_srt_url_parse() {
        let u = SrtUrl::parse("srt://sink:8890?streamid=publish:live/foo&passphrase=s3cret")
            .unwrap();
        assert_eq!(u.address, "sink:8890");
        assert_eq!(u.stream_id.as_deref(), Some("publish:live/foo"));
        assert_eq!(u.passphrase.as_deref(), Some("s3cret"));

        assert!(SrtUrl::parse("http://sink:8890").is_err());
        assert!(SrtUrl::parse("srt://").is_err());
    }

    #[test]
    fn test_max_payload_calculation() {
        // (1472 - 16) / 188 * 188 = 1316
        assert_eq!((1472usize - 16) / 188 * 188, 1316);
        // larger MTUs round down to a whole number of TS packets
        assert_eq!((9000usize - 16) / 188 * 188, 8836);
        // below 16 + 188 the payload collapses to zero
        assert_eq!((203usize).saturating_sub(16) / 188 * 188, 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let fwd = SrtForwarder::new(
            "srt://127.0.0.1:1/".into(),
            target(),
            Duration::from_millis(100),
            1472,
            16,
        );
        let stream = Stream::new(StreamParams {
            desc: Session::default(),
            write_queue_size: 8,
        });
        fwd.start(stream.clone()).unwrap();
        assert!(matches!(
            fwd.start(stream.clone()),
            Err(ForwarderError::AlreadyStarted)
        ));
        fwd.stop().await;
        assert!(!fwd.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fwd = SrtForwarder::new(
            "srt://127.0.0.1:1/".into(),
            target(),
            Duration::from_millis(100),
            1472,
            16,
        );
        fwd.stop().await;
        fwd.stop().await;
        assert!(!fwd.is_running());
    }
}
