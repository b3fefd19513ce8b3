//! Single-program MPEG-TS muxer.

use super::crc32::gen_crc32;
use super::{
    MpegtsError, PID_AUDIO, PID_PAT, PID_PMT, PID_VIDEO, STREAM_TYPE_H264,
    STREAM_TYPE_PRIVATE_DATA, TS_PACKET_SIZE,
};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

const STREAM_ID_VIDEO: u8 = 0xe0;
const STREAM_ID_PRIVATE_1: u8 = 0xbd;

/// Audio-only streams re-emit PSI every this many PES; video streams emit
/// PSI on every keyframe instead.
const AUDIO_PSI_INTERVAL: u32 = 32;

/// Muxes H.264 access units and Opus frames into a single-program TS.
pub struct TsMuxer {
    has_video: bool,
    has_audio: bool,
    audio_channels: u8,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    audio_cc: u8,
    psi_written: bool,
    audio_pes_since_psi: u32,
}

impl TsMuxer {
    #[must_use]
    pub fn new(has_video: bool, has_audio: bool, audio_channels: u8) -> Self {
        Self {
            has_video,
            has_audio,
            audio_channels,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            audio_cc: 0,
            psi_written: false,
            audio_pes_since_psi: 0,
        }
    }

    /// Mux one H.264 access unit (Annex B) with a 90 kHz PTS.
    pub fn mux_h264(
        &mut self,
        au: &[u8],
        pts: u64,
        keyframe: bool,
        out: &mut BytesMut,
    ) -> Result<(), MpegtsError> {
        if keyframe || !self.psi_written {
            self.write_psi(out);
        }

        let pes = build_pes(STREAM_ID_VIDEO, au, pts, true);
        let pcr = if keyframe { Some(pts.saturating_mul(300)) } else { None };
        self.video_cc = write_pes_packets(out, PID_VIDEO, self.video_cc, &pes, pcr);
        Ok(())
    }

    /// Mux one Opus frame with a 90 kHz PTS. The frame is wrapped in the
    /// Opus-in-TS control header.
    pub fn mux_opus(&mut self, frame: &[u8], pts: u64, out: &mut BytesMut) -> Result<(), MpegtsError> {
        if !self.psi_written || (!self.has_video && self.audio_pes_since_psi >= AUDIO_PSI_INTERVAL) {
            self.write_psi(out);
        }
        self.audio_pes_since_psi += 1;

        let mut payload = BytesMut::with_capacity(frame.len() + 4);
        write_opus_control_header(&mut payload, frame.len());
        payload.extend_from_slice(frame);

        let pes = build_pes(STREAM_ID_PRIVATE_1, &payload, pts, false);
        self.audio_cc = write_pes_packets(out, PID_AUDIO, self.audio_cc, &pes, None);
        Ok(())
    }

    fn write_psi(&mut self, out: &mut BytesMut) {
        let pat = build_pat_section();
        self.pat_cc = write_section_packet(out, PID_PAT, self.pat_cc, &pat);

        let pmt = self.build_pmt_section();
        self.pmt_cc = write_section_packet(out, PID_PMT, self.pmt_cc, &pmt);

        self.psi_written = true;
        self.audio_pes_since_psi = 0;
    }

    fn build_pmt_section(&self) -> BytesMut {
        let pcr_pid = if self.has_video { PID_VIDEO } else { PID_AUDIO };

        let mut body = BytesMut::new();
        body.put_u16(1); // program_number
        body.put_u8(0xc1); // version 0, current_next
        body.put_u8(0x00); // section_number
        body.put_u8(0x00); // last_section_number
        body.put_u16(0xe000 | pcr_pid);
        body.put_u16(0xf000); // program_info_length = 0

        if self.has_video {
            body.put_u8(STREAM_TYPE_H264);
            body.put_u16(0xe000 | PID_VIDEO);
            body.put_u16(0xf000); // ES_info_length = 0
        }
        if self.has_audio {
            // Opus: private data + registration descriptor + channel extension
            let mut es_info = BytesMut::new();
            es_info.put_u8(0x05); // registration_descriptor
            es_info.put_u8(4);
            es_info.extend_from_slice(b"Opus");
            es_info.put_u8(0x7f); // extension_descriptor
            es_info.put_u8(2);
            es_info.put_u8(0x80);
            es_info.put_u8(self.audio_channels);

            body.put_u8(STREAM_TYPE_PRIVATE_DATA);
            body.put_u16(0xe000 | PID_AUDIO);
            body.put_u16(0xf000 | es_info.len() as u16);
            body.extend_from_slice(&es_info);
        }

        finish_section(0x02, &body)
    }
}

fn build_pat_section() -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(1); // transport_stream_id
    body.put_u8(0xc1); // version 0, current_next
    body.put_u8(0x00);
    body.put_u8(0x00);
    body.put_u16(1); // program_number
    body.put_u16(0xe000 | PID_PMT);
    finish_section(0x00, &body)
}

/// Prepend table id + section length, append CRC32.
fn finish_section(table_id: u8, body: &[u8]) -> BytesMut {
    let mut section = BytesMut::with_capacity(body.len() + 7);
    section.put_u8(table_id);
    section.put_u16(0xb000 | (body.len() as u16 + 4));
    section.extend_from_slice(body);
    let crc = gen_crc32(0xffff_ffff, &section);
    let mut tail = [0u8; 4];
    BigEndian::write_u32(&mut tail, crc);
    section.extend_from_slice(&tail);
    section
}

fn write_opus_control_header(out: &mut BytesMut, mut size: usize) {
    // control_header_prefix (11 bits) + zeroed trim/extension flags
    out.put_u8(0x7f);
    out.put_u8(0xe0);
    while size >= 255 {
        out.put_u8(0xff);
        size -= 255;
    }
    out.put_u8(size as u8);
}

/// Build a PES packet. Video uses an unbounded packet length (0) as H.222.0
/// permits; audio carries the real length.
fn build_pes(stream_id: u8, payload: &[u8], pts: u64, unbounded_len: bool) -> BytesMut {
    let mut pes = BytesMut::with_capacity(payload.len() + 14);
    pes.put_u8(0x00);
    pes.put_u8(0x00);
    pes.put_u8(0x01);
    pes.put_u8(stream_id);

    let header_len = 5u8; // PTS only
    let body_len = 3 + usize::from(header_len) + payload.len();
    if unbounded_len || body_len > 0xffff {
        pes.put_u16(0);
    } else {
        pes.put_u16(body_len as u16);
    }

    pes.put_u8(0x80); // marker bits, no scrambling
    pes.put_u8(0x80); // PTS_DTS_flags = '10'
    pes.put_u8(header_len);
    write_pts(&mut pes, pts);
    pes.extend_from_slice(payload);
    pes
}

fn write_pts(out: &mut BytesMut, pts: u64) {
    let pts = pts & 0x1_ffff_ffff;
    out.put_u8(0x21 | ((((pts >> 30) & 0x07) as u8) << 1));
    out.put_u8((pts >> 22) as u8);
    out.put_u8(((pts >> 14) as u8 & 0xfe) | 0x01);
    out.put_u8((pts >> 7) as u8);
    out.put_u8(((pts << 1) as u8 & 0xfe) | 0x01);
}

/// Write one PSI section as a single TS packet (pointer field + stuffing).
fn write_section_packet(out: &mut BytesMut, pid: u16, mut cc: u8, section: &[u8]) -> u8 {
    let mut pkt = [0xffu8; TS_PACKET_SIZE];
    pkt[0] = 0x47;
    pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1f); // payload_unit_start
    pkt[2] = pid as u8;
    pkt[3] = 0x10 | (cc & 0x0f); // payload only
    cc = (cc + 1) & 0x0f;
    pkt[4] = 0x00; // pointer_field
    let len = section.len().min(TS_PACKET_SIZE - 5);
    pkt[5..5 + len].copy_from_slice(&section[..len]);
    out.extend_from_slice(&pkt);
    cc
}

/// Packetize a PES into TS packets on the given PID, with optional PCR
/// (27 MHz) in the first packet's adaptation field.
fn write_pes_packets(
    out: &mut BytesMut,
    pid: u16,
    mut cc: u8,
    pes: &[u8],
    pcr: Option<u64>,
) -> u8 {
    let mut remaining = pes;
    let mut first = true;

    while !remaining.is_empty() {
        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[0] = 0x47;
        pkt[1] = ((pid >> 8) as u8) & 0x1f;
        if first {
            pkt[1] |= 0x40;
        }
        pkt[2] = pid as u8;

        let pcr_here = if first { pcr } else { None };
        // total adaptation field size (length byte included), grown by
        // stuffing when the remaining payload underfills the packet
        let base_af = if pcr_here.is_some() { 8 } else { 0 };
        let capacity = TS_PACKET_SIZE - 4 - base_af;
        let payload_len = remaining.len().min(capacity);
        let stuffing = capacity - payload_len;
        let af_len = base_af + stuffing;

        if af_len > 0 {
            pkt[3] = 0x30 | (cc & 0x0f); // adaptation + payload
            pkt[4] = (af_len - 1) as u8;
            if af_len >= 2 {
                let mut flags = 0u8;
                if pcr_here.is_some() {
                    flags |= 0x50; // PCR_flag + random_access_indicator
                }
                pkt[5] = flags;
                let mut pos = 6;
                if let Some(pcr) = pcr_here {
                    let base = (pcr / 300) & 0x1_ffff_ffff;
                    let ext = (pcr % 300) as u16;
                    pkt[6] = (base >> 25) as u8;
                    pkt[7] = (base >> 17) as u8;
                    pkt[8] = (base >> 9) as u8;
                    pkt[9] = (base >> 1) as u8;
                    pkt[10] = (((base & 1) as u8) << 7) | 0x7e | ((ext >> 8) as u8);
                    pkt[11] = ext as u8;
                    pos = 12;
                }
                while pos < 4 + af_len {
                    pkt[pos] = 0xff;
                    pos += 1;
                }
            }
        } else {
            pkt[3] = 0x10 | (cc & 0x0f); // payload only
        }
        cc = (cc + 1) & 0x0f;

        let payload_start = 4 + af_len;
        pkt[payload_start..payload_start + payload_len].copy_from_slice(&remaining[..payload_len]);
        remaining = &remaining[payload_len..];
        first = false;
        out.extend_from_slice(&pkt);
    }
    cc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packets_are_aligned() {
        let mut muxer = TsMuxer::new(true, true, 2);
        let mut out = BytesMut::new();
        let au = [0u8, 0, 0, 1, 0x65, 1, 2, 3];
        muxer.mux_h264(&au, 90_000, true, &mut out).unwrap();
        muxer.mux_opus(&[0xfc, 1, 2], 48_000, &mut out).unwrap();
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for chunk in out.chunks(TS_PACKET_SIZE) {
            assert_eq!(chunk[0], 0x47);
        }
    }

    #[test]
    fn test_psi_precedes_keyframe() {
        let mut muxer = TsMuxer::new(true, false, 0);
        let mut out = BytesMut::new();
        muxer.mux_h264(&[0, 0, 0, 1, 0x65, 0xaa], 0, true, &mut out).unwrap();

        // first packet is PAT (pid 0), second PMT, then video
        let pid = |chunk: &[u8]| (u16::from(chunk[1] & 0x1f) << 8) | u16::from(chunk[2]);
        let chunks: Vec<_> = out.chunks(TS_PACKET_SIZE).collect();
        assert_eq!(pid(chunks[0]), PID_PAT);
        assert_eq!(pid(chunks[1]), PID_PMT);
        assert_eq!(pid(chunks[2]), PID_VIDEO);
    }

    #[test]
    fn test_continuity_counters_increment() {
        let mut muxer = TsMuxer::new(true, false, 0);
        let mut out = BytesMut::new();
        let big_au: Vec<u8> = [0, 0, 0, 1, 0x65]
            .iter()
            .copied()
            .chain(std::iter::repeat(0xab).take(1000))
            .collect();
        muxer.mux_h264(&big_au, 0, true, &mut out).unwrap();

        let mut last_cc: Option<u8> = None;
        for chunk in out.chunks(TS_PACKET_SIZE) {
            let pid = (u16::from(chunk[1] & 0x1f) << 8) | u16::from(chunk[2]);
            if pid == PID_VIDEO {
                let cc = chunk[3] & 0x0f;
                if let Some(prev) = last_cc {
                    assert_eq!(cc, (prev + 1) & 0x0f);
                }
                last_cc = Some(cc);
            }
        }
        assert!(last_cc.is_some());
    }
}
