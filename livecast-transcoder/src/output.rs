//! A single transcoding output: external encoder child plus its synthetic
//! output stream.

use crate::TranscoderError;
use livecast_core::conf::{OutputKind, TranscodingOutput};
use livecast_core::desc::{Format, Media, MediaType, Session};
use livecast_core::mpegts::{self, TsCodec, TsDemuxer};
use livecast_core::rtppack::{
    annexb_nal_units, h264_nal_type, H264RtpPacketizer, OpusRtpPacketizer, NAL_TYPE_PPS,
    NAL_TYPE_SPS,
};
use livecast_core::stream::{Reader, Stream, StreamParams};
use livecast_core::util::random_ssrc;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Small queue for low latency.
const OUTPUT_QUEUE_SIZE: usize = 64;
const RTP_MAX_PAYLOAD: usize = 1460;
const CHILD_WAIT_BUDGET: Duration = Duration::from_secs(2);

/// Canned H.264 parameter sets used until the encoder's real ones are
/// detected.
const TENTATIVE_SPS: &[u8] = &[
    0x67, 0x42, 0xc0, 0x28, 0xd9, 0x00, 0x78, 0x02, 0x27, 0xe5, 0x84, 0x00, 0x00, 0x03, 0x00,
    0x04, 0x00, 0x00, 0x03, 0x00, 0xf0, 0x3c, 0x60, 0xc9, 0x20,
];
const TENTATIVE_PPS: &[u8] = &[0x08, 0x06, 0x07, 0x08];

struct Running {
    child: tokio::process::Child,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

/// One transcoding output.
pub struct Output {
    config: TranscodingOutput,
    stream: Stream,
    encoder_program: String,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Output {
    pub fn new(config: TranscodingOutput) -> Result<Self, TranscoderError> {
        config
            .validate()
            .map_err(|e| TranscoderError::InvalidOutput {
                path: config.path.clone(),
                reason: e.to_string(),
            })?;

        let stream = Stream::new(StreamParams {
            desc: tentative_description(&config),
            write_queue_size: OUTPUT_QUEUE_SIZE,
        });

        Ok(Self {
            config,
            stream,
            encoder_program: "ffmpeg".into(),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Override the encoder binary (tests use a stand-in).
    #[must_use]
    pub fn with_encoder_program(mut self, program: &str) -> Self {
        self.encoder_program = program.into();
        self
    }

    /// The synthetic output stream; its description is tentative until the
    /// encoder's first output parse succeeds.
    #[must_use]
    pub fn stream(&self) -> Stream {
        self.stream.clone()
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.config.path
    }

    pub async fn start(&self, input_stream: Stream) -> Result<(), TranscoderError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(TranscoderError::AlreadyActive);
        }

        info!(path = %self.config.path, "starting transcoding output");
        let args = build_encoder_args(&self.config);
        debug!(program = %self.encoder_program, ?args, "encoder command");

        let mut child = Command::new(&self.encoder_program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TranscoderError::ChildSpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscoderError::ChildSpawnFailed("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscoderError::ChildSpawnFailed("no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscoderError::ChildSpawnFailed("no stderr pipe".into()))?;

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(input_task(
                input_stream,
                stdin,
                cancel.clone(),
                self.config.path.clone(),
            )),
            tokio::spawn(output_task(
                self.stream.clone(),
                stdout,
                cancel.clone(),
                self.config.path.clone(),
            )),
            tokio::spawn(stderr_task(stderr, cancel.clone())),
        ];

        *running = Some(Running {
            child,
            tasks,
            cancel,
        });
        info!(path = %self.config.path, "transcoding output started");
        Ok(())
    }

    /// Cancel, close stdin so the encoder drains, wait briefly, then kill.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        info!(path = %self.config.path, "stopping transcoding output");

        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }

        match tokio::time::timeout(CHILD_WAIT_BUDGET, running.child.wait()).await {
            Ok(Ok(status)) => debug!(path = %self.config.path, %status, "encoder exited"),
            Ok(Err(e)) => warn!(path = %self.config.path, "encoder wait failed: {e}"),
            Err(_) => {
                warn!(path = %self.config.path, "encoder did not exit, killing");
                let _ = running.child.kill().await;
            }
        }
        info!(path = %self.config.path, "transcoding output stopped");
    }

    #[must_use]
    pub async fn is_active(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// Attach a reader on the input stream and mux its units into the child's
/// stdin.
async fn input_task(
    input_stream: Stream,
    mut stdin: tokio::process::ChildStdin,
    cancel: CancellationToken,
    path: String,
) {
    let desc = input_stream.desc();
    let reader = Reader::new();
    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTPUT_QUEUE_SIZE);
    if let Err(e) = mpegts::from_stream(&desc, &reader, tx, None) {
        warn!(path = %path, "cannot mux input stream: {e}");
        return;
    }
    input_stream.add_reader(&reader);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            err = reader.wait_error() => {
                warn!(path = %path, "input reader fault: {err}");
                break;
            }
            burst = rx.recv() => {
                let Some(burst) = burst else { break };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = stdin.write_all(&burst) => {
                        if let Err(e) = res {
                            debug!(path = %path, "encoder stdin closed: {e}");
                            break;
                        }
                    }
                }
            }
        }
    }

    input_stream.remove_reader(&reader);
    // dropping stdin closes the pipe and drives the encoder to flush
}

/// Demux the child's stdout, replace the tentative description on first
/// successful parse, and republish frames into the output stream.
async fn output_task(
    out_stream: Stream,
    mut stdout: tokio::process::ChildStdout,
    cancel: CancellationToken,
    path: String,
) {
    let mut demuxer = TsDemuxer::new();
    let mut buf = vec![0u8; 4096];
    let mut described = false;
    let mut sps: Option<Vec<u8>> = None;
    let mut pps: Option<Vec<u8>> = None;
    let mut video_packetizer: Option<H264RtpPacketizer> = None;
    let mut audio_packetizer: Option<OpusRtpPacketizer> = None;
    let mut pending: Vec<livecast_core::mpegts::TsFrame> = Vec::new();

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => {
                    let err = TranscoderError::ChildExited("stdout closed".into());
                    debug!(path = %path, "{err}");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(path = %path, "encoder stdout read failed: {e}");
                    return;
                }
            },
        };

        let frames = match demuxer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(path = %path, "encoder output demux failed: {e}");
                return;
            }
        };

        for frame in frames {
            if !described {
                if frame.codec == TsCodec::H264 {
                    for nal in annexb_nal_units(&frame.data) {
                        match h264_nal_type(nal) {
                            NAL_TYPE_SPS => sps = Some(nal.to_vec()),
                            NAL_TYPE_PPS => pps = Some(nal.to_vec()),
                            _ => {}
                        }
                    }
                }
                pending.push(frame);

                let codecs = demuxer.detected_codecs();
                let video_ready =
                    !codecs.contains(&TsCodec::H264) || (sps.is_some() && pps.is_some());
                if codecs.is_empty() || !video_ready {
                    continue;
                }

                let desc = detected_description(&codecs, sps.clone(), pps.clone());
                info!(
                    path = %path,
                    medias = %desc.medias_info(),
                    "encoder output detected, replacing tentative description"
                );
                out_stream.set_desc(desc.clone());
                if desc.first_h264().is_some() {
                    video_packetizer = Some(H264RtpPacketizer::new(96, random_ssrc(), RTP_MAX_PAYLOAD));
                }
                if desc.first_opus().is_some() {
                    audio_packetizer = Some(OpusRtpPacketizer::new(97, random_ssrc()));
                }
                described = true;

                for frame in pending.drain(..) {
                    publish_frame(&out_stream, &frame, &mut video_packetizer, &mut audio_packetizer);
                }
                continue;
            }

            publish_frame(&out_stream, &frame, &mut video_packetizer, &mut audio_packetizer);
        }
    }
}

fn publish_frame(
    out_stream: &Stream,
    frame: &livecast_core::mpegts::TsFrame,
    video_packetizer: &mut Option<H264RtpPacketizer>,
    audio_packetizer: &mut Option<OpusRtpPacketizer>,
) {
    let desc = out_stream.desc();
    match frame.codec {
        TsCodec::H264 => {
            let (Some(packetizer), Some((mi, fi, _))) =
                (video_packetizer.as_mut(), desc.first_h264())
            else {
                return;
            };
            let timestamp = frame.pts as u32;
            match packetizer.packetize(&frame.data, timestamp) {
                Ok(packets) => {
                    let unit = livecast_core::unit::Unit::new(
                        packets,
                        SystemTime::now(),
                        frame.pts as i64,
                    );
                    out_stream.write_unit(mi, fi, unit);
                }
                Err(e) => debug!("video packetization failed: {e}"),
            }
        }
        TsCodec::Opus => {
            let (Some(packetizer), Some((mi, fi, _))) =
                (audio_packetizer.as_mut(), desc.first_opus())
            else {
                return;
            };
            // 90 kHz PES clock to the 48 kHz Opus RTP clock
            let timestamp = (frame.pts * 48_000 / 90_000) as u32;
            let pkt = packetizer.packetize(frame.data.clone(), timestamp);
            out_stream.write_rtp_packet(mi, fi, pkt, SystemTime::now(), frame.pts as i64);
        }
    }
}

/// Line-scan the encoder's stderr at debug level.
async fn stderr_task(stderr: tokio::process::ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(target: "encoder", "{line}"),
                _ => return,
            },
        }
    }
}

/// Placeholder description installed before the first real format
/// detection returns.
fn tentative_description(config: &TranscodingOutput) -> Session {
    let mut medias = Vec::new();
    if config.kind == OutputKind::Video {
        medias.push(Media {
            media_type: MediaType::Video,
            formats: vec![Format::H264 {
                payload_type: 96,
                sps: TENTATIVE_SPS.to_vec(),
                pps: TENTATIVE_PPS.to_vec(),
                packetization_mode: 1,
            }],
        });
    }
    medias.push(Media {
        media_type: MediaType::Audio,
        formats: vec![Format::Opus {
            payload_type: 97,
            channels: 2,
        }],
    });
    Session { medias }
}

/// Description derived from the encoder's actual MPEG-TS output.
fn detected_description(codecs: &[TsCodec], sps: Option<Vec<u8>>, pps: Option<Vec<u8>>) -> Session {
    let mut medias = Vec::new();
    if codecs.contains(&TsCodec::H264) {
        medias.push(Media {
            media_type: MediaType::Video,
            formats: vec![Format::H264 {
                payload_type: 96,
                sps: sps.unwrap_or_default(),
                pps: pps.unwrap_or_default(),
                packetization_mode: 1,
            }],
        });
    }
    if codecs.contains(&TsCodec::Opus) {
        medias.push(Media {
            media_type: MediaType::Audio,
            formats: vec![Format::Opus {
                payload_type: 97,
                channels: 2,
            }],
        });
    }
    Session { medias }
}

/// Encoder command line per output configuration.
fn build_encoder_args(config: &TranscodingOutput) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

    push(&["-f", "mpegts", "-i", "pipe:0"]);

    if config.kind == OutputKind::Video {
        if let Some(video) = &config.video {
            let gop = (video.framerate * 2).to_string();
            push(&[
                "-c:v",
                "libx264",
                "-preset",
                &video.preset,
                "-tune",
                "zerolatency",
                "-b:v",
                &format!("{}k", video.bitrate / 1000),
                "-s",
                &video.resolution,
                "-r",
                &video.framerate.to_string(),
                "-g",
                &gop,
                "-keyint_min",
                &gop,
                "-bf",
                "0",
                "-pix_fmt",
                "yuv420p",
            ]);
        }
    } else {
        push(&["-vn"]);
    }

    if config.kind == OutputKind::Audio {
        if let Some(audio) = &config.audio {
            push(&[
                "-c:a",
                "libopus",
                "-b:a",
                &format!("{}k", audio.bitrate / 1000),
                "-ar",
                &audio.samplerate.to_string(),
                "-ac",
                "2",
            ]);
        }
    } else {
        // video outputs carry a muxed default audio track
        push(&["-c:a", "libopus", "-b:a", "64k", "-ar", "48000", "-ac", "2"]);
    }

    push(&[
        "-f",
        "mpegts",
        "-fflags",
        "+discardcorrupt+genpts+nobuffer",
        "-max_delay",
        "100000",
        "-avoid_negative_ts",
        "make_zero",
        "pipe:1",
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_core::conf::{TranscodingAudioParams, TranscodingVideoParams};

    fn video_output() -> TranscodingOutput {
        TranscodingOutput {
            path: "live/in-480p".into(),
            kind: OutputKind::Video,
            video: Some(TranscodingVideoParams {
                resolution: "854x480".into(),
                bitrate: 800_000,
                framerate: 30,
                preset: "veryfast".into(),
            }),
            audio: None,
        }
    }

    #[test]
    fn test_encoder_args_video() {
        let args = build_encoder_args(&video_output());
        let joined = args.join(" ");
        assert!(joined.starts_with("-f mpegts -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -tune zerolatency -b:v 800k"));
        assert!(joined.contains("-s 854x480 -r 30 -g 60 -keyint_min 60 -bf 0 -pix_fmt yuv420p"));
        assert!(joined.contains("-c:a libopus -b:a 64k -ar 48000 -ac 2"));
        assert!(joined.ends_with(
            "-f mpegts -fflags +discardcorrupt+genpts+nobuffer -max_delay 100000 \
             -avoid_negative_ts make_zero pipe:1"
        ));
    }

    #[test]
    fn test_encoder_args_audio() {
        let config = TranscodingOutput {
            path: "live/in-audio".into(),
            kind: OutputKind::Audio,
            video: None,
            audio: Some(TranscodingAudioParams {
                bitrate: 96_000,
                samplerate: 48_000,
                channels: 2,
            }),
        };
        let joined = build_encoder_args(&config).join(" ");
        assert!(joined.contains("-vn"));
        assert!(joined.contains("-c:a libopus -b:a 96k -ar 48000 -ac 2"));
    }

    #[test]
    fn test_tentative_description() {
        let desc = tentative_description(&video_output());
        assert_eq!(desc.medias.len(), 2);
        let (_, _, format) = desc.first_h264().unwrap();
        match format {
            Format::H264 { sps, pps, .. } => {
                assert_eq!(sps.as_slice(), TENTATIVE_SPS);
                assert_eq!(pps.as_slice(), TENTATIVE_PPS);
            }
            _ => unreachable!(),
        }
        assert!(desc.first_opus().is_some());
    }

    #[tokio::test]
    async fn test_child_exit_keeps_tentative_description() {
        // the stand-in encoder exits immediately: stdout EOF, no detection
        let output = Output::new(video_output())
            .unwrap()
            .with_encoder_program("true");
        let input = Stream::new(StreamParams {
            desc: tentative_description(&video_output()),
            write_queue_size: 8,
        });

        output.start(input.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        output.stop().await;

        let desc = output.stream().desc();
        let (_, _, format) = desc.first_h264().unwrap();
        match format {
            Format::H264 { sps, .. } => assert_eq!(sps.as_slice(), TENTATIVE_SPS),
            _ => unreachable!(),
        }
        assert_eq!(input.reader_count(), 0);
        assert!(!output.is_active().await);
    }

    #[tokio::test]
    async fn test_description_replaced_from_encoder_output() {
        use livecast_core::unit::Unit;
        use std::time::SystemTime;

        // `cat` loops the muxed TS straight back, so the detected
        // description must carry the input's parameter sets, not the
        // canned ones
        let real_sps = vec![0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40];
        let real_pps = vec![0x68, 0xeb, 0xe3, 0xcb];
        let input = Stream::new(StreamParams {
            desc: Session {
                medias: vec![Media {
                    media_type: MediaType::Video,
                    formats: vec![Format::H264 {
                        payload_type: 96,
                        sps: real_sps.clone(),
                        pps: real_pps.clone(),
                        packetization_mode: 1,
                    }],
                }],
            },
            write_queue_size: 64,
        });

        let output = Output::new(video_output())
            .unwrap()
            .with_encoder_program("cat");
        output.start(input.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // an IDR without in-band parameter sets: the muxer prepends the
        // format's SPS/PPS, which then round-trip through the child
        let mut packetizer = H264RtpPacketizer::new(96, 0x77, 1200);
        let au = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x11, 0x22, 0x33]);
        let packets = packetizer.packetize(&au, 9000).unwrap();
        input.write_unit(0, 0, Unit::new(packets, SystemTime::now(), 9000));

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        let detected = loop {
            let desc = output.stream().desc();
            if let Some((_, _, Format::H264 { sps, pps, .. })) = desc.first_h264() {
                if sps.as_slice() == real_sps.as_slice() {
                    break Some((sps.clone(), pps.clone()));
                }
            }
            if std::time::Instant::now() > deadline {
                break None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        output.stop().await;
        let (sps, pps) = detected.expect("description never replaced with detected formats");
        assert_eq!(sps, real_sps);
        assert_eq!(pps, real_pps);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let output = Output::new(video_output())
            .unwrap()
            .with_encoder_program("/nonexistent/encoder-binary");
        let input = Stream::new(StreamParams::default());
        assert!(matches!(
            output.start(input).await,
            Err(TranscoderError::ChildSpawnFailed(_))
        ));
        assert!(!output.is_active().await);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let output = Output::new(video_output())
            .unwrap()
            .with_encoder_program("cat");
        let input = Stream::new(StreamParams {
            desc: tentative_description(&video_output()),
            write_queue_size: 8,
        });
        output.start(input.clone()).await.unwrap();
        assert!(matches!(
            output.start(input).await,
            Err(TranscoderError::AlreadyActive)
        ));
        output.stop().await;
    }
}
