//! WHEP session driver.
//!
//! Owns the peer connection and the WHEP signalling for one level, feeds
//! 1 Hz samples into the decision engine, and performs level switches as
//! an atomic reader swap: the previous session is closed strictly after
//! the new session's first incoming track.

use crate::controller::{AbrConfig, AbrEngine, ControllerState};
use crate::levels::{Level, VideoCodec};
use crate::metrics::TickSample;
use crate::sdp::{strip_simulcast_attrs, with_bandwidth_cap};
use crate::whep::{candidate_frag, WhepClient};
use crate::AbrError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;

const MIME_TYPE_H265: &str = "video/H265";
const FIRST_TRACK_TIMEOUT: Duration = Duration::from_secs(10);
const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct SessionCounters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_lost: AtomicU64,
    frames_decoded: AtomicU64,
    has_video: AtomicBool,
}

/// One live WHEP reader session.
pub struct WhepSession {
    pc: Arc<webrtc::peer_connection::RTCPeerConnection>,
    whep: Arc<WhepClient>,
    counters: Arc<SessionCounters>,
    state_rx: watch::Receiver<RTCPeerConnectionState>,
    first_track_rx: mpsc::Receiver<()>,
    trickle: tokio::task::JoinHandle<()>,
    audio_only: bool,
}

impl WhepSession {
    /// Open a session for one level and codec preference. Returns once
    /// signalling completed; media arrival is awaited separately.
    pub async fn connect(
        endpoint: url::Url,
        level: &Level,
        codec: Option<VideoCodec>,
        cancel: CancellationToken,
    ) -> Result<Self, AbrError> {
        let mut media_engine = MediaEngine::default();
        if !level.audio_only {
            let (mime, payload_type) = match codec.unwrap_or(VideoCodec::H264) {
                VideoCodec::H264 => (MIME_TYPE_H264.to_owned(), 96),
                VideoCodec::H265 => (MIME_TYPE_H265.to_owned(), 98),
            };
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: mime,
                            clock_rate: 90_000,
                            channels: 0,
                            sdp_fmtp_line: String::new(),
                            rtcp_feedback: vec![],
                        },
                        payload_type,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .map_err(|e| AbrError::Signalling(e.to_string()))?;
        }
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48_000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| AbrError::Signalling(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AbrError::Signalling(e.to_string()))?;
        let whep = Arc::new(WhepClient::new(http, endpoint));

        // the OPTIONS Link headers enumerate ICE servers; absence is fine
        let ice_servers = whep.ice_servers().await.unwrap_or_default();
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .into_iter()
                .map(|url| RTCIceServer {
                    urls: vec![url],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| AbrError::PeerConnection(e.to_string()))?,
        );

        let counters = Arc::new(SessionCounters::default());
        let (first_track_tx, first_track_rx) = mpsc::channel::<()>(1);
        let on_track_counters = Arc::clone(&counters);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let counters = Arc::clone(&on_track_counters);
            let first_track_tx = first_track_tx.clone();
            Box::pin(async move {
                let _ = first_track_tx.try_send(());
                let is_video = track.kind() == RTPCodecType::Video;
                if is_video {
                    counters.has_video.store(true, Ordering::Relaxed);
                }
                let mut last_seq: Option<u16> = None;
                while let Ok((pkt, _)) = track.read_rtp().await {
                    counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    counters
                        .bytes_received
                        .fetch_add(pkt.payload.len() as u64, Ordering::Relaxed);
                    if is_video && pkt.header.marker {
                        counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(prev) = last_seq {
                        let gap = pkt.header.sequence_number.wrapping_sub(prev);
                        if gap > 1 && gap < u16::MAX / 2 {
                            counters
                                .packets_lost
                                .fetch_add(u64::from(gap) - 1, Ordering::Relaxed);
                        }
                    }
                    last_seq = Some(pkt.header.sequence_number);
                }
            })
        }));

        let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
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

        let setup = async {
            let make_recvonly = || RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            if !level.audio_only {
                pc.add_transceiver_from_kind(RTPCodecType::Video, Some(make_recvonly()))
                    .await
                    .map_err(|e| AbrError::PeerConnection(e.to_string()))?;
            }
            pc.add_transceiver_from_kind(RTPCodecType::Audio, Some(make_recvonly()))
                .await
                .map_err(|e| AbrError::PeerConnection(e.to_string()))?;

            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| AbrError::PeerConnection(e.to_string()))?;
            let munged = with_bandwidth_cap(
                &strip_simulcast_attrs(&offer.sdp),
                if level.audio_only { 0 } else { level.max_bitrate_kbps },
            );
            let munged_offer = RTCSessionDescription::offer(munged.clone())
                .map_err(|e| AbrError::Signalling(e.to_string()))?;
            pc.set_local_description(munged_offer)
                .await
                .map_err(|e| AbrError::PeerConnection(e.to_string()))?;
            let ice_ufrag = munged
                .lines()
                .find_map(|l| l.strip_prefix("a=ice-ufrag:"))
                .unwrap_or_default()
                .trim()
                .to_string();

            let answer_sdp = whep.post_offer(&munged).await?;
            let answer = RTCSessionDescription::answer(answer_sdp)
                .map_err(|e| AbrError::Signalling(e.to_string()))?;
            pc.set_remote_description(answer)
                .await
                .map_err(|e| AbrError::PeerConnection(e.to_string()))?;
            Ok::<String, AbrError>(ice_ufrag)
        }
        .await;
        let ice_ufrag = match setup {
            Ok(ufrag) => ufrag,
            Err(err) => {
                let _ = pc.close().await;
                return Err(err);
            }
        };

        // queued candidates flush on the first recv after the 201; PATCH
        // failures are warnings only
        let trickle_whep = Arc::clone(&whep);
        let trickle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
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
                        if let Err(e) = trickle_whep.patch_candidate(&frag).await {
                            warn!("ICE candidate PATCH failed: {e}");
                        }
                    }
                }
            }
        });

        Ok(Self {
            pc,
            whep,
            counters,
            state_rx,
            first_track_rx,
            trickle,
            audio_only: level.audio_only,
        })
    }

    /// Resolve when the first incoming track event fires.
    pub async fn wait_first_track(&mut self) -> Result<(), AbrError> {
        match tokio::time::timeout(FIRST_TRACK_TIMEOUT, self.first_track_rx.recv()).await {
            Ok(Some(())) => Ok(()),
            Ok(None) => Err(AbrError::PeerConnection("session closed".into())),
            Err(_) => Err(AbrError::PeerConnection("no track within deadline".into())),
        }
    }

    /// True while the transport is usable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !matches!(
            *self.state_rx.borrow(),
            RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed
        )
    }

    /// Sample the cumulative counters plus the candidate-pair RTT.
    pub async fn collect_sample(&self) -> TickSample {
        let mut rtt_ms = None;
        let stats = self.pc.get_stats().await;
        for (_, report) in stats.reports {
            if let StatsReportType::CandidatePair(pair) = report {
                let rtt = pair.current_round_trip_time * 1000.0;
                if rtt > 0.0 {
                    rtt_ms = Some(rtt);
                }
            }
        }

        TickSample {
            rtt_ms,
            packets_lost: self.counters.packets_lost.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            frames_decoded: if self.audio_only || !self.counters.has_video.load(Ordering::Relaxed)
            {
                None
            } else {
                Some(self.counters.frames_decoded.load(Ordering::Relaxed))
            },
        }
    }

    /// DELETE the session resource and close the peer connection.
    pub async fn close(self) {
        self.trickle.abort();
        if let Err(e) = self.whep.delete().await {
            debug!("WHEP DELETE failed: {e}");
        }
        let _ = self.pc.close().await;
    }
}

/// Headless adaptive WHEP player: one live session, engine-driven
/// switching.
pub struct AbrPlayer {
    endpoint: url::Url,
    engine: AbrEngine,
    session: Option<WhepSession>,
    cancel: CancellationToken,
}

impl AbrPlayer {
    #[must_use]
    pub fn new(endpoint: url::Url, levels: Vec<Level>, initial: usize, config: AbrConfig) -> Self {
        Self {
            endpoint,
            engine: AbrEngine::new(levels, initial, config),
            session: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.engine.state()
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Try one level through its codec fallback chain: the primary codec
    /// is retried with each fallback before the attempt counts as failed.
    async fn try_level(&self, index: usize) -> Result<WhepSession, AbrError> {
        let level = self.engine.levels()[index].clone();
        let chain: Vec<Option<VideoCodec>> = if level.audio_only || level.codec_chain.is_empty() {
            vec![None]
        } else {
            level.codec_chain.iter().copied().map(Some).collect()
        };

        let mut last_err = AbrError::NoUsableLevel;
        for codec in chain {
            debug!(level = %level.id, ?codec, "attempting session");
            match WhepSession::connect(
                self.endpoint.clone(),
                &level,
                codec,
                self.cancel.clone(),
            )
            .await
            {
                Ok(mut session) => match session.wait_first_track().await {
                    Ok(()) => return Ok(session),
                    Err(e) => {
                        session.close().await;
                        last_err = e;
                    }
                },
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Switch to `target`: the previous session closes strictly after the
    /// new one's first track arrived, so there is never a silent gap —
    /// and never two sessions past that point.
    async fn perform_switch(&mut self, mut target: usize) {
        loop {
            match self.try_level(target).await {
                Ok(new_session) => {
                    if let Some(old) = self.session.take() {
                        old.close().await;
                    }
                    self.session = Some(new_session);
                    self.engine.on_connect_success(Instant::now());
                    return;
                }
                Err(err) => {
                    warn!(level = target, "switch attempt failed: {err}");
                    match self.engine.on_switch_failure(Instant::now()) {
                        Some(next) => target = next,
                        None => {
                            if self.session.is_none() {
                                self.engine.on_failed();
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Manual level selection; clears the target's penalties first.
    pub async fn load_level(&mut self, index: usize) {
        self.engine.manual_switch(index, Instant::now());
        self.perform_switch(index).await;
    }

    /// Connect the initial level and run the 1 Hz decision loop until
    /// closed.
    pub async fn run(&mut self) -> Result<(), AbrError> {
        let initial = self.engine.current_index();
        self.engine.begin_initial(initial);
        self.perform_switch(initial).await;
        if self.engine.state() == ControllerState::Failed {
            return Err(AbrError::NoUsableLevel);
        }

        let mut ticker = tokio::time::interval(TICK_PERIOD);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close_inner().await;
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let alive = match &self.session {
                Some(session) => session.is_alive(),
                None => {
                    self.engine.on_failed();
                    return Err(AbrError::NoUsableLevel);
                }
            };

            if !alive {
                // transport loss enters the restart path
                info!("session transport lost, restarting current level");
                self.engine.on_restart();
                if let Some(old) = self.session.take() {
                    old.close().await;
                }
                let current = self.engine.current_index();
                self.engine.begin_initial(current);
                self.perform_switch(current).await;
                if self.session.is_none() {
                    self.engine.on_failed();
                    return Err(AbrError::NoUsableLevel);
                }
                continue;
            }

            let sample = match &self.session {
                Some(session) => session.collect_sample().await,
                None => continue,
            };
            if let Some(decision) = self.engine.on_tick(sample, Instant::now()) {
                info!(
                    target = %self.engine.levels()[decision.target].id,
                    reason = ?decision.reason,
                    "switching level"
                );
                self.perform_switch(decision.target).await;
            }
        }
    }

    /// Explicit close: pending work is cancelled and the last session is
    /// DELETEd if its URL is known.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.close_inner().await;
    }

    async fn close_inner(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.engine.on_closed();
    }
}
