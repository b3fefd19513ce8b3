//! RTP access-unit assembly and packetization.
//!
//! Depacketization is delegated to the `rtp` crate codec depacketizers
//! (FU-A / STAP-A handling for H.264); this module only assembles the
//! per-timestamp chunks into access units and, in the opposite direction,
//! wraps payloader output into full RTP packets with header state.

use bytes::{Bytes, BytesMut};
use rtp::codecs::h264::{H264Packet, H264Payloader};
use rtp::packetizer::{Depacketizer, Payloader};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtpPackError {
    #[error("depacketization failed: {0}")]
    Depacketize(rtp::Error),

    #[error("payloading failed: {0}")]
    Payload(rtp::Error),
}

/// One assembled elementary-stream access unit (Annex B for H.264).
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    /// RTP timestamp of the unit, in the codec clock domain.
    pub timestamp: u32,
}

/// Assembles H.264 access units from RTP packets. The unit boundary is the
/// RTP marker bit; intermediate fragments accumulate in Annex B form.
#[derive(Default)]
pub struct H264AuAssembler {
    depacketizer: H264Packet,
    acc: BytesMut,
    timestamp: u32,
}

impl H264AuAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP packet; returns a complete access unit when the marker
    /// closes it.
    pub fn push(&mut self, pkt: &rtp::packet::Packet) -> Result<Option<AccessUnit>, RtpPackError> {
        if self.acc.is_empty() {
            self.timestamp = pkt.header.timestamp;
        }

        let chunk = self
            .depacketizer
            .depacketize(&pkt.payload)
            .map_err(RtpPackError::Depacketize)?;
        self.acc.extend_from_slice(&chunk);

        if pkt.header.marker && !self.acc.is_empty() {
            let au = AccessUnit {
                data: std::mem::take(&mut self.acc).freeze(),
                timestamp: self.timestamp,
            };
            return Ok(Some(au));
        }
        Ok(None)
    }
}

/// Packetizes H.264 access units (Annex B) into RTP packets, fragmenting
/// with FU-A where the payload exceeds the MTU. The marker bit is set on
/// the last packet of each unit.
pub struct H264RtpPacketizer {
    payloader: H264Payloader,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    mtu: usize,
}

impl H264RtpPacketizer {
    #[must_use]
    pub fn new(payload_type: u8, ssrc: u32, mtu: usize) -> Self {
        Self {
            payloader: H264Payloader::default(),
            payload_type,
            ssrc,
            sequence: rand::random(),
            mtu: mtu.max(64),
        }
    }

    pub fn packetize(
        &mut self,
        au: &Bytes,
        timestamp: u32,
    ) -> Result<Vec<rtp::packet::Packet>, RtpPackError> {
        let payloads = self
            .payloader
            .payload(self.mtu, au)
            .map_err(RtpPackError::Payload)?;
        let count = payloads.len();

        let mut packets = Vec::with_capacity(count);
        for (i, payload) in payloads.into_iter().enumerate() {
            packets.push(rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: i == count - 1,
                    payload_type: self.payload_type,
                    sequence_number: self.sequence,
                    timestamp,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload,
            });
            self.sequence = self.sequence.wrapping_add(1);
        }
        Ok(packets)
    }
}

/// Packetizes Opus frames; one frame per packet, marker always set.
pub struct OpusRtpPacketizer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
}

impl OpusRtpPacketizer {
    #[must_use]
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: rand::random(),
        }
    }

    pub fn packetize(&mut self, frame: Bytes, timestamp: u32) -> rtp::packet::Packet {
        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                marker: true,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: frame,
        };
        self.sequence = self.sequence.wrapping_add(1);
        pkt
    }
}

/// Iterate Annex B NAL units (without start codes).
#[must_use]
pub fn annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                let end = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
                if end > s {
                    units.push(&data[s..end]);
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if data.len() > s {
            units.push(&data[s..]);
        }
    }
    units
}

/// H.264 NAL unit type (lower 5 bits of the first octet).
#[must_use]
pub fn h264_nal_type(nal: &[u8]) -> u8 {
    nal.first().map_or(0, |b| b & 0x1f)
}

pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annexb_split() {
        // 4-byte start code SPS, 3-byte start code PPS, slice
        let data: &[u8] = &[
            0, 0, 0, 1, 0x67, 0x42, 0xc0, //
            0, 0, 1, 0x68, 0x06, //
            0, 0, 0, 1, 0x65, 0x88,
        ];
        let nals = annexb_nal_units(data);
        assert_eq!(nals.len(), 3);
        assert_eq!(h264_nal_type(nals[0]), NAL_TYPE_SPS);
        assert_eq!(h264_nal_type(nals[1]), NAL_TYPE_PPS);
        assert_eq!(h264_nal_type(nals[2]), NAL_TYPE_IDR);
    }

    #[test]
    fn test_h264_roundtrip_single_nal() {
        let mut packetizer = H264RtpPacketizer::new(96, 0x1111, 1200);
        let au = Bytes::from_static(&[0, 0, 0, 1, 0x65, 1, 2, 3, 4]);
        let packets = packetizer.packetize(&au, 90_000).unwrap();
        assert!(!packets.is_empty());
        assert!(packets.last().unwrap().header.marker);
        for pkt in &packets {
            assert_eq!(pkt.header.ssrc, 0x1111);
            assert_eq!(pkt.header.timestamp, 90_000);
        }

        let mut assembler = H264AuAssembler::new();
        let mut out = None;
        for pkt in &packets {
            if let Some(au) = assembler.push(pkt).unwrap() {
                out = Some(au);
            }
        }
        let out = out.expect("marker should close the unit");
        assert_eq!(out.timestamp, 90_000);
        let nals = annexb_nal_units(&out.data);
        assert_eq!(nals.len(), 1);
        assert_eq!(h264_nal_type(nals[0]), NAL_TYPE_IDR);
    }

    #[test]
    fn test_h264_fragmentation() {
        let mut packetizer = H264RtpPacketizer::new(96, 0x2222, 200);
        let mut nal = vec![0, 0, 0, 1, 0x65];
        nal.extend(std::iter::repeat(0xab).take(1000));
        let packets = packetizer.packetize(&Bytes::from(nal), 0).unwrap();
        assert!(packets.len() > 1, "large NAL must fragment");

        // sequence numbers are consecutive
        for pair in packets.windows(2) {
            assert_eq!(
                pair[1].header.sequence_number,
                pair[0].header.sequence_number.wrapping_add(1)
            );
        }
    }

    #[test]
    fn test_opus_packetizer() {
        let mut packetizer = OpusRtpPacketizer::new(97, 0x3333);
        let pkt = packetizer.packetize(Bytes::from_static(&[0xfc, 1, 2]), 480);
        assert!(pkt.header.marker);
        assert_eq!(pkt.header.payload_type, 97);
        assert_eq!(pkt.payload.len(), 3);
    }
}
