//! Quality levels and the penalty box.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Ban back-off base and cap.
pub const PENALTY_BASE: Duration = Duration::from_secs(30);
pub const PENALTY_MAX: Duration = Duration::from_secs(120);

/// Video codec preference inside a level's fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H265,
    H264,
}

/// One selectable quality level, ordered high to low in the level table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    pub id: String,
    pub label: String,
    /// Bandwidth cap advertised in the offer, kbps; 0 = unlimited (top
    /// layer).
    pub max_bitrate_kbps: u32,
    #[serde(default)]
    pub audio_only: bool,
    /// Ordered codec preference; the first entry is tried before each
    /// fallback.
    #[serde(default = "default_codec_chain")]
    pub codec_chain: Vec<VideoCodec>,
}

fn default_codec_chain() -> Vec<VideoCodec> {
    vec![VideoCodec::H264]
}

impl Level {
    #[must_use]
    pub fn new(id: &str, max_bitrate_kbps: u32) -> Self {
        Self {
            id: id.into(),
            label: id.into(),
            max_bitrate_kbps,
            audio_only: false,
            codec_chain: default_codec_chain(),
        }
    }

    #[must_use]
    pub fn audio(id: &str, max_bitrate_kbps: u32) -> Self {
        Self {
            id: id.into(),
            label: id.into(),
            max_bitrate_kbps,
            audio_only: true,
            codec_chain: Vec::new(),
        }
    }
}

/// Per-level exponential ban tracking to avoid flapping into a failing
/// layer.
#[derive(Debug, Default)]
pub struct PenaltyBox {
    failures: HashMap<usize, u32>,
    banned_until: HashMap<usize, Instant>,
}

impl PenaltyBox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt; returns the ban duration applied.
    pub fn record_failure(&mut self, level: usize, now: Instant) -> Duration {
        let failures = self.failures.entry(level).or_insert(0);
        *failures += 1;
        let exp = failures.saturating_sub(1).min(16);
        let ban = PENALTY_BASE
            .saturating_mul(1 << exp)
            .min(PENALTY_MAX);
        self.banned_until.insert(level, now + ban);
        ban
    }

    #[must_use]
    pub fn is_banned(&self, level: usize, now: Instant) -> bool {
        self.banned_until
            .get(&level)
            .is_some_and(|until| now < *until)
    }

    #[must_use]
    pub fn failure_count(&self, level: usize) -> u32 {
        self.failures.get(&level).copied().unwrap_or(0)
    }

    /// A manual switch clears the level's failure count and ban.
    pub fn clear(&mut self, level: usize) {
        self.failures.remove(&level);
        self.banned_until.remove(&level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let mut penalties = PenaltyBox::new();
        let now = Instant::now();

        assert_eq!(penalties.record_failure(1, now), Duration::from_secs(30));
        assert_eq!(penalties.record_failure(1, now), Duration::from_secs(60));
        assert_eq!(penalties.record_failure(1, now), Duration::from_secs(120));
        // capped
        assert_eq!(penalties.record_failure(1, now), Duration::from_secs(120));
        assert_eq!(penalties.failure_count(1), 4);
    }

    #[test]
    fn test_ban_expires() {
        let mut penalties = PenaltyBox::new();
        let now = Instant::now();
        penalties.record_failure(2, now);

        assert!(penalties.is_banned(2, now));
        assert!(penalties.is_banned(2, now + Duration::from_secs(29)));
        assert!(!penalties.is_banned(2, now + Duration::from_secs(31)));
    }

    #[test]
    fn test_manual_clear() {
        let mut penalties = PenaltyBox::new();
        let now = Instant::now();
        penalties.record_failure(0, now);
        penalties.record_failure(0, now);

        penalties.clear(0);
        assert!(!penalties.is_banned(0, now));
        assert_eq!(penalties.failure_count(0), 0);
        // next failure starts the back-off over
        assert_eq!(penalties.record_failure(0, now), Duration::from_secs(30));
    }
}
