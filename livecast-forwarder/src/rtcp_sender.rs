//! Per-track RTCP sender-report emitter.
//!
//! Clock-rate aware: the report's RTP timestamp extrapolates the last
//! written packet's timestamp to the report instant. Driven by the NTP
//! stamps carried in units, emitted once per second.

use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) const REPORT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default, Clone, Copy)]
struct LastPacket {
    rtp_timestamp: u32,
    ntp: Option<SystemTime>,
}

/// Accumulated sender state for one outgoing track.
pub(crate) struct RtcpSenderState {
    ssrc: u32,
    clock_rate: u32,
    last: Mutex<LastPacket>,
    packet_count: Mutex<u32>,
    octet_count: Mutex<u32>,
}

impl RtcpSenderState {
    pub(crate) fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            last: Mutex::new(LastPacket::default()),
            packet_count: Mutex::new(0),
            octet_count: Mutex::new(0),
        }
    }

    /// Record one written packet and the NTP instant aligned to it.
    pub(crate) fn process_packet(&self, pkt: &rtp::packet::Packet, ntp: SystemTime) {
        *self.last.lock() = LastPacket {
            rtp_timestamp: pkt.header.timestamp,
            ntp: Some(ntp),
        };
        *self.packet_count.lock() += 1;
        *self.octet_count.lock() += pkt.payload.len() as u32;
    }

    /// Build a sender report for `now`; `None` until a packet was seen.
    pub(crate) fn report(&self, now: SystemTime) -> Option<rtcp::sender_report::SenderReport> {
        let last = *self.last.lock();
        let last_ntp = last.ntp?;

        let elapsed = now.duration_since(last_ntp).unwrap_or(Duration::ZERO);
        let rtp_time = last
            .rtp_timestamp
            .wrapping_add((elapsed.as_secs_f64() * f64::from(self.clock_rate)) as u32);

        Some(rtcp::sender_report::SenderReport {
            ssrc: self.ssrc,
            ntp_time: system_time_to_ntp(now),
            rtp_time,
            packet_count: *self.packet_count.lock(),
            octet_count: *self.octet_count.lock(),
            ..Default::default()
        })
    }
}

/// Convert to the 64-bit NTP timestamp format (seconds since 1900 in the
/// high half, fraction in the low half).
fn system_time_to_ntp(t: SystemTime) -> u64 {
    const UNIX_TO_NTP_OFFSET: u64 = 2_208_988_800;
    let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let seconds = since_epoch.as_secs() + UNIX_TO_NTP_OFFSET;
    let fraction = (u128::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000;
    (seconds << 32) | fraction as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(ts: u32, payload_len: usize) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                timestamp: ts,
                ..Default::default()
            },
            payload: Bytes::from(vec![0u8; payload_len]),
        }
    }

    #[test]
    fn test_no_report_before_first_packet() {
        let state = RtcpSenderState::new(1, 90_000);
        assert!(state.report(SystemTime::now()).is_none());
    }

    #[test]
    fn test_report_extrapolates_clock() {
        let state = RtcpSenderState::new(7, 90_000);
        let t0 = SystemTime::now();
        state.process_packet(&pkt(1000, 100), t0);

        let report = state.report(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(report.ssrc, 7);
        assert_eq!(report.packet_count, 1);
        assert_eq!(report.octet_count, 100);
        // one second at 90 kHz
        assert!((i64::from(report.rtp_time) - 91_000i64).abs() < 100);
    }

    #[test]
    fn test_ntp_format() {
        let ntp = system_time_to_ntp(UNIX_EPOCH + Duration::from_secs(1));
        assert_eq!(ntp >> 32, 2_208_988_801);
        assert_eq!(ntp & 0xffff_ffff, 0);
    }
}
