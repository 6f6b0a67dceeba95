//! Protocol tunables.

use echo_crypto::ratchet::RatchetLimits;

/// Recognized tunables with their protocol defaults. Host applications
/// override individual fields; tests tighten the ratchet bounds.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolConfig {
    /// Bounds on the skipped-key store.
    pub limits: RatchetLimits,
    /// Replenish one-time prekeys when the remote count drops below this.
    pub replenish_threshold: u32,
    /// Batch size for one-time prekey replenishment.
    pub replenish_batch: u32,
    /// Send attempts allowed per peer within the rate window.
    pub rate_limit_max: u32,
    /// Sliding rate window in milliseconds.
    pub rate_limit_window_ms: i64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            limits: RatchetLimits::default(),
            replenish_threshold: 10,
            replenish_batch: 50,
            rate_limit_max: 30,
            rate_limit_window_ms: 60 * 1000,
        }
    }
}
