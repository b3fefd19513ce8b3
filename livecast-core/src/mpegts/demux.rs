//! Single-program MPEG-TS demuxer.
//!
//! Byte-stream oriented: feed arbitrary chunks, get elementary-stream
//! frames out once PAT/PMT have been seen. Only the codecs this extension
//! round-trips are recognised (H.264, Opus-in-private-data).

use super::{MpegtsError, STREAM_TYPE_H264, STREAM_TYPE_PRIVATE_DATA, TS_PACKET_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsCodec {
    H264,
    Opus,
}

/// One demuxed elementary-stream frame.
#[derive(Debug, Clone)]
pub struct TsFrame {
    pub codec: TsCodec,
    /// 90 kHz presentation timestamp.
    pub pts: u64,
    pub data: Bytes,
}

struct PesAccumulator {
    pts: u64,
    data: BytesMut,
}

#[derive(Default)]
pub struct TsDemuxer {
    buf: BytesMut,
    pmt_pid: Option<u16>,
    streams: HashMap<u16, TsCodec>,
    pending: HashMap<u16, PesAccumulator>,
}

impl TsDemuxer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Codecs announced by the PMT, in PID order. Empty until a PMT has
    /// been parsed.
    #[must_use]
    pub fn detected_codecs(&self) -> Vec<TsCodec> {
        let mut pids: Vec<_> = self.streams.iter().collect();
        pids.sort_by_key(|(pid, _)| **pid);
        pids.into_iter().map(|(_, c)| *c).collect()
    }

    /// Feed a chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<TsFrame>, MpegtsError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buf.len() >= TS_PACKET_SIZE {
            if self.buf[0] != 0x47 {
                // resync: drop bytes until the next sync marker
                match self.buf.iter().position(|&b| b == 0x47) {
                    Some(pos) => {
                        debug!(skipped = pos, "transport resync");
                        self.buf.advance(pos);
                        continue;
                    }
                    None => {
                        self.buf.clear();
                        return Err(MpegtsError::LostSync);
                    }
                }
            }

            let pkt = self.buf.split_to(TS_PACKET_SIZE);
            self.parse_packet(&pkt, &mut frames)?;
        }
        Ok(frames)
    }

    fn parse_packet(&mut self, pkt: &[u8], frames: &mut Vec<TsFrame>) -> Result<(), MpegtsError> {
        let pusi = pkt[1] & 0x40 != 0;
        let pid = (u16::from(pkt[1] & 0x1f) << 8) | u16::from(pkt[2]);
        let adaptation = (pkt[3] >> 4) & 0x03;

        let mut offset = 4;
        if adaptation == 0x02 || adaptation == 0x03 {
            let af_len = usize::from(pkt[4]);
            offset += 1 + af_len;
        }
        if adaptation == 0x02 || offset >= TS_PACKET_SIZE {
            return Ok(());
        }
        let payload = &pkt[offset..];

        if pid == 0 {
            self.parse_pat(payload)?;
        } else if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload)?;
        } else if let Some(codec) = self.streams.get(&pid).copied() {
            self.parse_pes_payload(pid, codec, pusi, payload, frames)?;
        }
        Ok(())
    }

    fn parse_pat(&mut self, payload: &[u8]) -> Result<(), MpegtsError> {
        let section = section_body(payload)?;
        // skip table header: ts id (2), version (1), section numbers (2)
        if section.len() < 5 + 4 {
            return Err(MpegtsError::TruncatedSection);
        }
        let mut rest = &section[5..];
        while rest.len() >= 4 {
            let program = (u16::from(rest[0]) << 8) | u16::from(rest[1]);
            let pid = (u16::from(rest[2] & 0x1f) << 8) | u16::from(rest[3]);
            if program != 0 {
                self.pmt_pid = Some(pid);
            }
            rest = &rest[4..];
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &[u8]) -> Result<(), MpegtsError> {
        let section = section_body(payload)?;
        if section.len() < 9 {
            return Err(MpegtsError::TruncatedSection);
        }
        let program_info_len = usize::from(section[7] & 0x0f) << 8 | usize::from(section[8]);
        let mut rest = section
            .get(9 + program_info_len..)
            .ok_or(MpegtsError::TruncatedSection)?;

        while rest.len() >= 5 {
            let stream_type = rest[0];
            let pid = (u16::from(rest[1] & 0x1f) << 8) | u16::from(rest[2]);
            let es_info_len = (usize::from(rest[3] & 0x0f) << 8) | usize::from(rest[4]);
            let es_info = rest
                .get(5..5 + es_info_len)
                .ok_or(MpegtsError::TruncatedSection)?;

            match stream_type {
                STREAM_TYPE_H264 => {
                    self.streams.insert(pid, TsCodec::H264);
                }
                STREAM_TYPE_PRIVATE_DATA if has_opus_registration(es_info) => {
                    self.streams.insert(pid, TsCodec::Opus);
                }
                _ => {
                    debug!(stream_type, pid, "ignoring unsupported elementary stream");
                }
            }
            rest = &rest[5 + es_info_len..];
        }
        Ok(())
    }

    fn parse_pes_payload(
        &mut self,
        pid: u16,
        codec: TsCodec,
        pusi: bool,
        payload: &[u8],
        frames: &mut Vec<TsFrame>,
    ) -> Result<(), MpegtsError> {
        if pusi {
            if let Some(acc) = self.pending.remove(&pid) {
                emit_frames(codec, acc, frames);
            }

            if payload.len() < 9 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
                return Err(MpegtsError::TruncatedPes);
            }
            let header_len = usize::from(payload[8]);
            let pts_present = payload[7] & 0x80 != 0;
            let pts = if pts_present && header_len >= 5 {
                parse_pts(&payload[9..])?
            } else {
                0
            };
            let data_start = 9 + header_len;
            let data = payload.get(data_start..).ok_or(MpegtsError::TruncatedPes)?;
            self.pending.insert(
                pid,
                PesAccumulator {
                    pts,
                    data: BytesMut::from(data),
                },
            );
        } else if let Some(acc) = self.pending.get_mut(&pid) {
            acc.data.extend_from_slice(payload);
        }
        Ok(())
    }

    /// Flush any partially accumulated PES (call at end of stream).
    pub fn flush(&mut self) -> Vec<TsFrame> {
        let mut frames = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        for (pid, acc) in pending {
            if let Some(codec) = self.streams.get(&pid).copied() {
                emit_frames(codec, acc, &mut frames);
            }
        }
        frames
    }
}

fn emit_frames(codec: TsCodec, acc: PesAccumulator, frames: &mut Vec<TsFrame>) {
    if acc.data.is_empty() {
        return;
    }
    match codec {
        TsCodec::H264 => frames.push(TsFrame {
            codec,
            pts: acc.pts,
            data: acc.data.freeze(),
        }),
        TsCodec::Opus => {
            // split on control headers; each unit is one Opus frame
            let data = acc.data.freeze();
            let mut rest = &data[..];
            while rest.len() >= 3 {
                if (u16::from(rest[0]) << 8 | u16::from(rest[1])) & 0xffe0 != 0x7fe0 {
                    break;
                }
                let mut size = 0usize;
                let mut i = 2;
                loop {
                    let Some(&b) = rest.get(i) else { return };
                    size += usize::from(b);
                    i += 1;
                    if b != 0xff {
                        break;
                    }
                }
                let Some(frame) = rest.get(i..i + size) else {
                    return;
                };
                frames.push(TsFrame {
                    codec,
                    pts: acc.pts,
                    data: data.slice_ref(frame),
                });
                rest = &rest[i + size..];
            }
        }
    }
}

fn has_opus_registration(es_info: &[u8]) -> bool {
    let mut rest = es_info;
    while rest.len() >= 2 {
        let tag = rest[0];
        let len = usize::from(rest[1]);
        let Some(body) = rest.get(2..2 + len) else {
            return false;
        };
        if tag == 0x05 && body == b"Opus" {
            return true;
        }
        rest = &rest[2 + len..];
    }
    false
}

/// Strip the pointer field and return the section payload (table id on).
fn section_body(payload: &[u8]) -> Result<&[u8], MpegtsError> {
    let pointer = usize::from(*payload.first().ok_or(MpegtsError::TruncatedSection)?);
    let section = payload
        .get(1 + pointer..)
        .ok_or(MpegtsError::TruncatedSection)?;
    if section.len() < 3 {
        return Err(MpegtsError::TruncatedSection);
    }
    let section_len = (usize::from(section[1] & 0x0f) << 8) | usize::from(section[2]);
    let body = section
        .get(3..3 + section_len)
        .ok_or(MpegtsError::TruncatedSection)?;
    // drop trailing CRC32
    body.get(..body.len().saturating_sub(4))
        .ok_or(MpegtsError::TruncatedSection)
}

fn parse_pts(b: &[u8]) -> Result<u64, MpegtsError> {
    if b.len() < 5 {
        return Err(MpegtsError::TruncatedPes);
    }
    let pts = (u64::from(b[0] & 0x0e) << 29)
        | (u64::from(b[1]) << 22)
        | (u64::from(b[2] & 0xfe) << 14)
        | (u64::from(b[3]) << 7)
        | (u64::from(b[4]) >> 1);
    Ok(pts)
}

#[cfg(test)]
mod tests {
    use super::super::mux::TsMuxer;
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_mux_demux_roundtrip_video() {
        let mut muxer = TsMuxer::new(true, false, 0);
        let mut out = BytesMut::new();
        let au = [0u8, 0, 0, 1, 0x65, 0x11, 0x22, 0x33];
        muxer.mux_h264(&au, 123_000, true, &mut out).unwrap();
        muxer.mux_h264(&[0, 0, 0, 1, 0x41, 0x44], 126_600, false, &mut out).unwrap();

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&out).unwrap();
        frames.extend(demuxer.flush());

        assert_eq!(demuxer.detected_codecs(), vec![TsCodec::H264]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].pts, 123_000);
        assert_eq!(&frames[0].data[..], &au[..]);
        assert_eq!(frames[1].pts, 126_600);
    }

    #[test]
    fn test_mux_demux_roundtrip_opus() {
        let mut muxer = TsMuxer::new(false, true, 2);
        let mut out = BytesMut::new();
        let frame = [0xfcu8, 0xaa, 0xbb, 0xcc];
        muxer.mux_opus(&frame, 3840, &mut out).unwrap();

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&out).unwrap();
        frames.extend(demuxer.flush());

        assert_eq!(demuxer.detected_codecs(), vec![TsCodec::Opus]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].codec, TsCodec::Opus);
        assert_eq!(frames[0].pts, 3840);
        assert_eq!(&frames[0].data[..], &frame[..]);
    }

    #[test]
    fn test_large_au_spans_packets() {
        let mut muxer = TsMuxer::new(true, false, 0);
        let mut out = BytesMut::new();
        let mut au = vec![0u8, 0, 0, 1, 0x65];
        au.extend((0..2000u32).map(|i| i as u8));
        muxer.mux_h264(&au, 0, true, &mut out).unwrap();
        // follow-up unit forces the first PES to flush
        muxer.mux_h264(&[0, 0, 0, 1, 0x41, 0x00], 3600, false, &mut out).unwrap();

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&out).unwrap();
        frames.extend(demuxer.flush());
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].data[..], &au[..]);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut muxer = TsMuxer::new(true, false, 0);
        let mut out = BytesMut::new();
        muxer.mux_h264(&[0, 0, 0, 1, 0x65, 0x01], 0, true, &mut out).unwrap();

        let mut dirty = BytesMut::from(&[0xde, 0xad, 0xbe][..]);
        dirty.extend_from_slice(&out);

        let mut demuxer = TsDemuxer::new();
        let mut frames = demuxer.push(&dirty).unwrap();
        frames.extend(demuxer.flush());
        assert_eq!(frames.len(), 1);
    }
}
