//! Maps a session description onto an MPEG-TS program fed by a stream
//! reader.

use super::{MpegtsError, TsMuxer};
use crate::desc::{Format, Session};
use crate::rtppack::{annexb_nal_units, h264_nal_type, H264AuAssembler, NAL_TYPE_IDR, NAL_TYPE_SPS};
use crate::stream::Reader;
use crate::unit::Unit;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Called once per payload-carrying unit entering the muxer; lets the
/// owner account for dispatched RTP packets.
pub type UnitObserver = Arc<dyn Fn(&Unit) + Send + Sync>;

/// Register TS-producing callbacks on `reader` for every muxable format in
/// `desc`. Muxed bursts are pushed into `tx`; the owning task drains them
/// to the network. A full queue is a fault (the consumer fell behind) and
/// surfaces on the reader's error channel.
pub fn from_stream(
    desc: &Session,
    reader: &Reader,
    tx: mpsc::Sender<Bytes>,
    observer: Option<UnitObserver>,
) -> Result<(), MpegtsError> {
    let video = desc.first_h264();
    let audio = desc.first_opus();
    if video.is_none() && audio.is_none() {
        return Err(MpegtsError::NoSupportedMedia);
    }

    let audio_channels = match audio {
        Some((_, _, Format::Opus { channels, .. })) => *channels,
        _ => 2,
    };
    let muxer = Arc::new(Mutex::new(TsMuxer::new(
        video.is_some(),
        audio.is_some(),
        audio_channels,
    )));

    if let Some((mi, fi, format)) = video {
        let (sps, pps) = match format {
            Format::H264 { sps, pps, .. } => (sps.clone(), pps.clone()),
            _ => unreachable!(),
        };
        let muxer = Arc::clone(&muxer);
        let tx = tx.clone();
        let observer = observer.clone();
        let assembler = Mutex::new(H264AuAssembler::new());

        reader.on_data(mi, fi, move |unit| {
            if unit.nil_payload() {
                return Ok(());
            }
            if let Some(observer) = &observer {
                observer(unit);
            }
            for pkt in &unit.rtp_packets {
                let Some(au) = assembler.lock().push(pkt)? else {
                    continue;
                };

                let nals = annexb_nal_units(&au.data);
                let keyframe = nals.iter().any(|n| h264_nal_type(n) == NAL_TYPE_IDR);
                let has_params = nals.iter().any(|n| h264_nal_type(n) == NAL_TYPE_SPS);

                let mut out = BytesMut::new();
                let pts = u64::from(au.timestamp);
                if keyframe && !has_params && !sps.is_empty() {
                    // in-band parameter sets ahead of the IDR
                    let mut with_params =
                        BytesMut::with_capacity(sps.len() + pps.len() + 8 + au.data.len());
                    with_params.extend_from_slice(&[0, 0, 0, 1]);
                    with_params.extend_from_slice(&sps);
                    with_params.extend_from_slice(&[0, 0, 0, 1]);
                    with_params.extend_from_slice(&pps);
                    with_params.extend_from_slice(&au.data);
                    muxer.lock().mux_h264(&with_params, pts, true, &mut out)?;
                } else {
                    muxer.lock().mux_h264(&au.data, pts, keyframe, &mut out)?;
                }
                send_burst(&tx, out.freeze())?;
            }
            Ok(())
        });
    }

    if let Some((mi, fi, format)) = audio {
        let clock_rate = u64::from(format.clock_rate());
        let muxer = Arc::clone(&muxer);
        let tx = tx.clone();

        reader.on_data(mi, fi, move |unit| {
            if unit.nil_payload() {
                return Ok(());
            }
            if let Some(observer) = &observer {
                observer(unit);
            }
            for pkt in &unit.rtp_packets {
                if pkt.payload.is_empty() {
                    continue;
                }
                let pts = u64::from(pkt.header.timestamp) * 90_000 / clock_rate;
                let mut out = BytesMut::new();
                muxer.lock().mux_opus(&pkt.payload, pts, &mut out)?;
                send_burst(&tx, out.freeze())?;
            }
            Ok(())
        });
    }

    Ok(())
}

fn send_burst(tx: &mpsc::Sender<Bytes>, burst: Bytes) -> anyhow::Result<()> {
    if burst.is_empty() {
        return Ok(());
    }
    match tx.try_send(burst) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(MpegtsError::QueueFull.into()),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(anyhow::anyhow!("transport writer task gone"))
        }
    }
}
