//! Per-Identity Quota Enforcement
//!
//! Fixed one-second tumbling windows bounding ping count and byte volume
//! per identity. Tumbling windows trade precision for O(1) memory per
//! identity: no sliding log is retained, and burst tolerance is exactly the
//! configured per-second cap.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default ping messages per second (matches the stock client limits).
pub const DEFAULT_PING_RATE: u32 = 32;

/// Default ping payload bytes per second.
pub const DEFAULT_PING_SIZE: u32 = 1024;

/// Per-identity quota limits, sourced from the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Maximum pings per second.
    pub ping_rate: u32,
    /// Maximum total ping payload bytes per second.
    pub ping_size: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ping_rate: DEFAULT_PING_RATE,
            ping_size: DEFAULT_PING_SIZE,
        }
    }
}

/// Outcome of charging one message against an identity's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Within limits; counters have been incremented.
    Allowed,
    /// Message count for this second would be exceeded; counters unchanged.
    RateExceeded,
    /// Byte volume for this second would be exceeded; counters unchanged.
    SizeExceeded,
}

/// Counters for one identity within the current wall-clock second.
#[derive(Debug, Clone, Copy, Default)]
struct QuotaWindow {
    /// Messages charged this second.
    count: u64,
    /// Payload bytes charged this second.
    bytes: u64,
    /// The wall-clock second these counters belong to.
    second: u64,
}

/// Tumbling-window limiter shared by all sessions.
///
/// Windows are created lazily on first charge and dropped via [`forget`]
/// when the owning session closes; counters never persist across restarts.
///
/// [`forget`]: QuotaLimiter::forget
#[derive(Debug, Default)]
pub struct QuotaLimiter {
    windows: Mutex<BTreeMap<Uuid, QuotaWindow>>,
}

impl QuotaLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge one message of `byte_weight` payload bytes against
    /// `identity`'s current window.
    pub fn charge(&self, identity: Uuid, byte_weight: usize, limits: &QuotaConfig) -> Verdict {
        self.charge_at(identity, byte_weight, limits, wall_clock_second())
    }

    /// Clock-free variant of [`charge`] used by tests and diagnostics.
    ///
    /// [`charge`]: QuotaLimiter::charge
    fn charge_at(
        &self,
        identity: Uuid,
        byte_weight: usize,
        limits: &QuotaConfig,
        now: u64,
    ) -> Verdict {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(identity).or_default();

        // Reset exactly once per distinct second, not per message.
        if window.second != now {
            *window = QuotaWindow {
                second: now,
                ..QuotaWindow::default()
            };
        }

        if window.count + 1 > u64::from(limits.ping_rate) {
            return Verdict::RateExceeded;
        }
        if window.bytes + byte_weight as u64 > u64::from(limits.ping_size) {
            return Verdict::SizeExceeded;
        }

        window.count += 1;
        window.bytes += byte_weight as u64;
        Verdict::Allowed
    }

    /// Drop the window for `identity`. Called when its session deregisters;
    /// a later connection starts from a fresh window.
    pub fn forget(&self, identity: Uuid) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.remove(&identity);
    }

    /// Number of identities with a live window.
    pub fn tracked(&self) -> usize {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.len()
    }
}

/// Current wall-clock time truncated to whole seconds.
fn wall_clock_second() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
