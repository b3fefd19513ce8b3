//! The envelope handed from a stream to its readers.

use std::time::SystemTime;

/// One dispatch envelope: zero or more RTP packets plus timing context.
///
/// `ntp` is the wall-clock instant aligned to the first packet; `pts` stays
/// in the RTP clock domain of the owning format. A unit without a payload
/// (`payload_present == false`) only carries timing and must be skipped by
/// data-path consumers.
#[derive(Debug, Clone)]
pub struct Unit {
    pub rtp_packets: Vec<rtp::packet::Packet>,
    pub ntp: SystemTime,
    pub pts: i64,
    pub payload_present: bool,
}

impl Unit {
    #[must_use]
    pub fn new(rtp_packets: Vec<rtp::packet::Packet>, ntp: SystemTime, pts: i64) -> Self {
        Self {
            rtp_packets,
            ntp,
            pts,
            payload_present: true,
        }
    }

    /// A timing-only unit with no payload.
    #[must_use]
    pub fn empty(ntp: SystemTime, pts: i64) -> Self {
        Self {
            rtp_packets: Vec::new(),
            ntp,
            pts,
            payload_present: false,
        }
    }

    #[must_use]
    pub fn nil_payload(&self) -> bool {
        !self.payload_present || self.rtp_packets.is_empty()
    }
}
