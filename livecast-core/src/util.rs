//! Shared utilities.

use rand::Rng;

/// Cryptographically-drawn 32-bit SSRC.
#[must_use]
pub fn random_ssrc() -> u32 {
    rand::thread_rng().gen()
}
