//! MPEG-TS handling.
//!
//! Single-program transport stream with canonical PID assignment: PMT on
//! 0x1000, video on 0x100, audio on 0x101. H.264 is carried as stream type
//! 0x1B; Opus as private data (0x06) with an `Opus` registration descriptor
//! and per-unit control headers.
//!
//! [`bridge::from_stream`] maps a session description onto a TS program and
//! feeds muxed bursts into a channel drained by the owning writer task, so
//! reader callbacks never touch the network.

mod bridge;
mod crc32;
mod demux;
mod mux;

pub use bridge::{from_stream, UnitObserver};
pub use demux::{TsCodec, TsDemuxer, TsFrame};
pub use mux::TsMuxer;

use thiserror::Error;

pub const TS_PACKET_SIZE: usize = 188;

pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_PRIVATE_DATA: u8 = 0x06;

#[derive(Error, Debug)]
pub enum MpegtsError {
    #[error("lost transport sync")]
    LostSync,

    #[error("truncated section")]
    TruncatedSection,

    #[error("truncated PES header")]
    TruncatedPes,

    #[error("no muxable format in session description")]
    NoSupportedMedia,

    #[error("write queue is full")]
    QueueFull,

    #[error("access unit assembly failed: {0}")]
    Assembly(#[from] crate::rtppack::RtpPackError),
}
