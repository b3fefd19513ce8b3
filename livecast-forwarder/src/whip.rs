//! WHIP forwarder: mirrors the source session into an outbound peer
//! connection and publishes it to a remote WHIP endpoint.

use crate::rtcp_sender::{RtcpSenderState, REPORT_PERIOD};
use crate::stats::{Counters, ForwarderStats};
use crate::whip_client::{candidate_frag, WhipClient};
use crate::ForwarderError;
use livecast_core::conf::WebRtcForwardTarget;
use livecast_core::desc::{Format, MediaType, Session};
use livecast_core::stream::{Reader, Stream};
use webrtc::track::track_local::TrackLocalWriter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use tracing::{debug, info, warn};

const WEBRTC_STREAM_ID: &str = "livecast";

struct WhipInner {
    url: String,
    target: WebRtcForwardTarget,
    write_timeout: Duration,
    write_queue_size: usize,
    cancel: Mutex<CancellationToken>,
    counters: Counters,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stream: Mutex<Option<Stream>>,
}

/// WHIP forwarder instance. The target URL must already have path
/// variables expanded.
#[derive(Clone)]
pub struct WhipForwarder {
    inner: Arc<WhipInner>,
}

impl WhipForwarder {
    #[must_use]
    pub fn new(
        url: String,
        target: WebRtcForwardTarget,
        write_timeout: Duration,
        write_queue_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(WhipInner {
                url,
                target,
                write_timeout,
                write_queue_size,
                cancel: Mutex::new(CancellationToken::new()),
                counters: Counters::default(),
                supervisor: Mutex::new(None),
                stream: Mutex::new(None),
            }),
        }
    }

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

    /// Idempotent stop. The reader is detached by the inner run's
    /// teardown, never here.
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

async fn run_supervisor(inner: Arc<WhipInner>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(err) = run_inner(&inner, &cancel).await {
            inner.counters.record_error(&err);
            warn!(target_url = %inner.url, "WHIP forwarder error: {err}");
        }

        if cancel.is_cancelled() || !inner.target.reconnect {
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

struct OutgoingTrack {
    track: Arc<TrackLocalStaticRTP>,
    rtcp: Arc<RtcpSenderState>,
    media_idx: usize,
    format_idx: usize,
}

struct TrackWrite {
    track_idx: usize,
    packets: Vec<rtp::packet::Packet>,
    ntp: SystemTime,
}

/// Validate the target URL per the WHIP grammar.
fn parse_whip_url(raw: &str) -> Result<url::Url, ForwarderError> {
    let parsed = url::Url::parse(raw).map_err(|e| ForwarderError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ForwarderError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("scheme must be http or https, got {}", parsed.scheme()),
        });
    }
    if !parsed.path().ends_with("/whip") {
        return Err(ForwarderError::InvalidUrl {
            url: raw.to_string(),
            reason: "path must end with /whip".into(),
        });
    }
    Ok(parsed)
}

fn codec_capability(format: &Format) -> Option<(RTCRtpCodecCapability, RTPCodecType)> {
    match format {
        Format::H264 { .. } => Some((
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            RTPCodecType::Video,
        )),
        Format::Opus { channels, .. } => Some((
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: u16::from(*channels),
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            RTPCodecType::Audio,
        )),
        _ => None,
    }
}

/// Materialise one outgoing track per (media, format) in the description.
async fn setup_tracks(
    pc: &RTCPeerConnection,
    desc: &Session,
) -> Result<Vec<OutgoingTrack>, ForwarderError> {
    let mut tracks = Vec::new();

    for (media_idx, media) in desc.medias.iter().enumerate() {
        for (format_idx, format) in media.formats.iter().enumerate() {
            let Some((caps, _)) = codec_capability(format) else {
                debug!(mime = format.mime_type(), "skipping unsupported outgoing format");
                continue;
            };
            let track_id = match media.media_type {
                MediaType::Video => "video",
                MediaType::Audio => "audio",
            };
            let track = Arc::new(TrackLocalStaticRTP::new(
                caps,
                track_id.to_owned(),
                WEBRTC_STREAM_ID.to_owned(),
            ));

            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| ForwarderError::Signalling(e.to_string()))?;

            let ssrc = sender
                .get_parameters()
                .await
                .encodings
                .first()
                .map(|e| e.ssrc)
                .unwrap_or_default();

            // incoming RTCP must always be drained so interceptors work
            let rtcp_sender = Arc::clone(&sender);
            tokio::spawn(async move {
                while rtcp_sender.read_rtcp().await.is_ok() {}
            });

            tracks.push(OutgoingTrack {
                track,
                rtcp: Arc::new(RtcpSenderState::new(ssrc, format.clock_rate())),
                media_idx,
                format_idx,
            });
        }
    }

    if tracks.is_empty() {
        return Err(ForwarderError::Signalling(
            "no forwardable media in source description".into(),
        ));
    }
    Ok(tracks)
}

fn extract_ice_ufrag(sdp: &str) -> String {
    sdp.lines()
        .find_map(|l| l.strip_prefix("a=ice-ufrag:"))
        .unwrap_or_default()
        .trim()
        .to_string()
}

async fn run_inner(inner: &Arc<WhipInner>, cancel: &CancellationToken) -> Result<(), ForwarderError> {
    let endpoint = parse_whip_url(&inner.url)?;
    debug!(endpoint = %endpoint, "WHIP forwarder connecting");

    // fingerprint-pinned targets present certificates outside the webpki
    // roots; certificate acceptance is relaxed only for those
    let http = reqwest::Client::builder()
        .timeout(inner.write_timeout)
        .danger_accept_invalid_certs(inner.target.fingerprint.is_some())
        .build()
        .map_err(|e| ForwarderError::DialFailed(e.to_string()))?;

    let stream = inner
        .stream
        .lock()
        .clone()
        .ok_or_else(|| ForwarderError::TransportLost("stream detached".into()))?;
    let desc = stream.desc();

    let mut media_engine = MediaEngine::default();
    for media in &desc.medias {
        for format in &media.formats {
            if let Some((caps, kind)) = codec_capability(format) {
                media_engine
                    .register_codec(
                        RTCRtpCodecParameters {
                            capability: caps,
                            payload_type: format.payload_type(),
                            ..Default::default()
                        },
                        kind,
                    )
                    .map_err(|e| ForwarderError::Signalling(e.to_string()))?;
            }
        }
    }

    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .map_err(|e| ForwarderError::DialFailed(e.to_string()))?,
    );

    let tracks = match setup_tracks(&pc, &desc).await {
        Ok(tracks) => Arc::new(tracks),
        Err(err) => {
            let _ = pc.close().await;
            return Err(err);
        }
    };

    let (state_tx, mut state_rx) = watch::channel(RTCPeerConnectionState::New);
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel::<RTCIceCandidate>();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(candidate) = candidate {
            let _ = cand_tx.send(candidate);
        }
        Box::pin(async {})
    }));

    let whip = Arc::new(WhipClient::new(http, endpoint));
    let signalling = async {
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| ForwarderError::Signalling(e.to_string()))?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| ForwarderError::Signalling(e.to_string()))?;
        let offer_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| ForwarderError::Signalling("no local description".into()))?
            .sdp;

        let answer_sdp = whip.post_offer(&offer_sdp).await?;
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| ForwarderError::Signalling(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| ForwarderError::Signalling(e.to_string()))?;
        Ok::<String, ForwarderError>(extract_ice_ufrag(&offer_sdp))
    }
    .await;
    let ice_ufrag = match signalling {
        Ok(ufrag) => ufrag,
        Err(err) => {
            let _ = pc.close().await;
            return Err(err);
        }
    };

    // trickle: candidates queued during signalling flush here, later ones
    // patch as they arrive; a failed PATCH is non-fatal except when the
    // session resource is gone, which counts as a transport loss
    let (fault_tx, mut fault_rx) = mpsc::channel::<ForwarderError>(1);
    let trickle_whip = Arc::clone(&whip);
    let trickle_cancel = cancel.clone();
    let trickle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = trickle_cancel.cancelled() => return,
                candidate = cand_rx.recv() => {
                    let Some(candidate) = candidate else { return };
                    let attr = match candidate.to_json() {
                        Ok(init) => init.candidate,
                        Err(e) => {
                            warn!("cannot serialise ICE candidate: {e}");
                            continue;
                        }
                    };
                    let attr = attr.strip_prefix("candidate:").unwrap_or(&attr).to_string();
                    let frag = candidate_frag(&ice_ufrag, "0", &attr);
                    match trickle_whip.patch_candidate(&frag).await {
                        Ok(()) => {}
                        Err(err @ ForwarderError::SessionGone(_)) => {
                            let _ = fault_tx.try_send(err);
                            return;
                        }
                        Err(e) => warn!("ICE candidate PATCH failed: {e}"),
                    }
                }
            }
        }
    });

    // wait for the connection before any media flows
    let connect_result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break Err(ForwarderError::TransportLost("peer connection gone".into()));
                }
                match *state_rx.borrow() {
                    RTCPeerConnectionState::Connected => break Ok(()),
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        break Err(ForwarderError::DialFailed("peer connection failed".into()));
                    }
                    _ => {}
                }
            }
        }
    };
    if let Err(err) = connect_result {
        trickle.abort();
        let _ = pc.close().await;
        return Err(err);
    }
    if cancel.is_cancelled() {
        trickle.abort();
        let _ = pc.close().await;
        return Ok(());
    }

    inner.counters.set_connected(true);
    info!(target_url = %inner.url, "WHIP forwarder connected");

    // reader attaches only now, so packets never reach a half-configured
    // sender
    let reader = Reader::new();
    let (write_tx, mut write_rx) = mpsc::channel::<TrackWrite>(inner.write_queue_size);
    for (track_idx, outgoing) in tracks.iter().enumerate() {
        let write_tx = write_tx.clone();
        let counters_inner = Arc::clone(inner);
        reader.on_data(outgoing.media_idx, outgoing.format_idx, move |unit| {
            if unit.nil_payload() {
                return Ok(());
            }
            let write = TrackWrite {
                track_idx,
                packets: unit.rtp_packets.clone(),
                ntp: unit.ntp,
            };
            if write_tx.try_send(write).is_err() {
                counters_inner
                    .counters
                    .add_packets_lost(unit.rtp_packets.len() as u64);
            }
            Ok(())
        });
    }
    stream.add_reader(&reader);

    let writer_tracks = Arc::clone(&tracks);
    let writer_inner = Arc::clone(inner);
    let writer = tokio::spawn(async move {
        while let Some(write) = write_rx.recv().await {
            let outgoing = &writer_tracks[write.track_idx];
            // one outcome per unit: the whole packet batch counts as sent
            // or as lost, never split
            let n = write.packets.len() as u64;
            let mut bytes = 0u64;
            let mut failed = false;
            for pkt in &write.packets {
                match outgoing.track.write_rtp(pkt).await {
                    Ok(_) => {
                        bytes += pkt.payload.len() as u64;
                        outgoing.rtcp.process_packet(pkt, write.ntp);
                    }
                    Err(e) => {
                        debug!("track write failed: {e}");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                writer_inner.counters.add_packets_lost(n);
            } else {
                writer_inner.counters.add_packets_sent(n);
                writer_inner.counters.add_bytes_sent(bytes);
            }
        }
    });

    // 1 Hz sender reports driven by the NTP stamps carried in units
    let report_tracks = Arc::clone(&tracks);
    let report_pc = Arc::clone(&pc);
    let report_cancel = cancel.clone();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPORT_PERIOD);
        loop {
            tokio::select! {
                _ = report_cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for outgoing in report_tracks.iter() {
                        if let Some(report) = outgoing.rtcp.report(SystemTime::now()) {
                            let pkt: Box<dyn rtcp::packet::Packet + Send + Sync> =
                                Box::new(report);
                            if report_pc.write_rtcp(&[pkt]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    let mut fault_closed = false;
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            err = reader.wait_error() => {
                break Err(ForwarderError::TransportLost(err.to_string()));
            }
            fault = fault_rx.recv(), if !fault_closed => {
                match fault {
                    Some(err) => break Err(ForwarderError::TransportLost(err.to_string())),
                    None => fault_closed = true,
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break Err(ForwarderError::TransportLost("peer connection gone".into()));
                }
                match *state_rx.borrow() {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        break Err(ForwarderError::TransportLost(
                            "peer connection lost".into(),
                        ));
                    }
                    _ => {}
                }
            }
        }
    };

    // sole detacher of the reader
    stream.remove_reader(&reader);
    writer.abort();
    reporter.abort();
    trickle.abort();
    if let Err(e) = whip.delete().await {
        debug!("WHIP DELETE failed: {e}");
    }
    let _ = pc.close().await;
    inner.counters.set_connected(false);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_core::desc::Media;
    use livecast_core::stream::StreamParams;

    #[test]
    fn test_parse_whip_url() {
        assert!(parse_whip_url("https://sink/live/whip").is_ok());
        assert!(parse_whip_url("http://sink:8889/foo/whip").is_ok());
        assert!(parse_whip_url("https://sink/live/whep").is_err());
        assert!(parse_whip_url("rtsp://sink/live/whip").is_err());
    }

    #[test]
    fn test_extract_ice_ufrag() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\na=ice-ufrag:abcd\r\na=ice-pwd:xyz\r\n";
        assert_eq!(extract_ice_ufrag(sdp), "abcd");
        assert_eq!(extract_ice_ufrag("v=0\r\n"), "");
    }

    #[test]
    fn test_codec_capability_mapping() {
        let h264 = Format::H264 {
            payload_type: 96,
            sps: vec![],
            pps: vec![],
            packetization_mode: 1,
        };
        let (caps, kind) = codec_capability(&h264).unwrap();
        assert_eq!(caps.mime_type, MIME_TYPE_H264);
        assert_eq!(kind, RTPCodecType::Video);

        let aac = Format::Aac {
            payload_type: 98,
            sample_rate: 44_100,
            channels: 2,
        };
        assert!(codec_capability(&aac).is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let fwd = WhipForwarder::new(
            "https://sink/live/whip".into(),
            WebRtcForwardTarget::default(),
            Duration::from_millis(100),
            16,
        );
        let stream = Stream::new(StreamParams {
            desc: Session {
                medias: vec![Media {
                    media_type: MediaType::Video,
                    formats: vec![Format::H264 {
                        payload_type: 96,
                        sps: vec![],
                        pps: vec![],
                        packetization_mode: 1,
                    }],
                }],
            },
            write_queue_size: 8,
        });
        fwd.start(stream.clone()).unwrap();
        assert!(matches!(
            fwd.start(stream),
            Err(ForwarderError::AlreadyStarted)
        ));
        fwd.stop().await;
        assert!(!fwd.is_running());
    }
}
