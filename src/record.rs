//! Entitlement records and the engine's fixed limits.
//!
//! One record exists per purchased product. The record is the single
//! durable truth about a purchase: when it happened, how many grants
//! succeeded, and when the last one succeeded. Everything else
//! (eligibility, countdowns, cooldowns) is derived from it on demand.

use serde::{Deserialize, Serialize};

/// Length of the post-purchase download window (48 hours).
pub const WINDOW_MS: i64 = 48 * 60 * 60 * 1000;

/// Maximum number of successful downloads per purchase.
pub const MAX_DOWNLOADS: u32 = 3;

/// Mandatory wait between consecutive download requests (UX throttle,
/// not a security boundary).
pub const COOLDOWN_MS: i64 = 30_000;

/// Durable per-product entitlement state.
///
/// The product key is not stored in the record; it is the key the record
/// is filed under. Field names serialize in camelCase to stay readable by
/// the records the storefront already wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    /// Epoch ms of purchase confirmation. Immutable until reset.
    pub purchase_timestamp: i64,
    /// Successful grants so far. Never decreases between resets.
    pub download_count: u32,
    /// Epoch ms of the last successful grant, `None` before the first.
    pub last_download_timestamp: Option<i64>,
}

impl EntitlementRecord {
    /// Fresh record for a purchase confirmed at `purchase_timestamp`.
    pub fn new(purchase_timestamp: i64) -> Self {
        Self {
            purchase_timestamp,
            download_count: 0,
            last_download_timestamp: None,
        }
    }

    /// Milliseconds since purchase at `now_ms`. Negative when the clock
    /// reads earlier than the purchase (skew); callers treat that as zero
    /// elapsed.
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.purchase_timestamp
    }

    /// Fold a successful authority grant into the record.
    ///
    /// The server-reported remaining count is authoritative: the new count
    /// is `max(local + 1, MAX_DOWNLOADS - server_remaining)`, clamped to
    /// `MAX_DOWNLOADS`. The `max()` heals local undercounts left by a
    /// grant whose local write was lost, and can only move the count up.
    pub fn apply_grant(&mut self, server_remaining: u32, now_ms: i64) {
        let implied = MAX_DOWNLOADS.saturating_sub(server_remaining);
        let incremented = self.download_count.saturating_add(1);
        self.download_count = incremented.max(implied).min(MAX_DOWNLOADS);
        self.last_download_timestamp = Some(now_ms);
    }

    /// Downloads still available locally, clamped at zero.
    pub fn remaining_downloads(&self) -> u32 {
        MAX_DOWNLOADS.saturating_sub(self.download_count)
    }
}
