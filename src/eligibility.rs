//! Pure eligibility classification and the download cooldown guard.
//!
//! Both functions here run on the scheduler's every-second tick, so they
//! never fail, never allocate, and depend on nothing but their arguments.
//! Repeated calls with the same inputs return the same outputs.

use serde::{Deserialize, Serialize};

use crate::record::{EntitlementRecord, COOLDOWN_MS, MAX_DOWNLOADS, WINDOW_MS};

/// Classified download permission for one product at one instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilityState {
    /// No entitlement record exists for the key.
    NoEntitlement,
    /// Inside the window with downloads remaining.
    Active,
    /// The 48-hour window has elapsed, regardless of remaining downloads.
    Expired,
    /// All downloads consumed, regardless of remaining time.
    LimitReached,
}

impl EligibilityState {
    /// Terminal states end the countdown; only a reset leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EligibilityState::Expired | EligibilityState::LimitReached)
    }
}

/// Snapshot derived from a record and the current time. Never persisted;
/// recomputed fresh on every evaluation so presentation cannot drift from
/// the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EligibilitySnapshot {
    pub state: EligibilityState,
    /// Window time left, clamped at zero.
    pub remaining_time_ms: i64,
    /// Downloads left, clamped at zero.
    pub remaining_downloads: u32,
}

impl EligibilitySnapshot {
    fn empty(state: EligibilityState) -> Self {
        Self {
            state,
            remaining_time_ms: 0,
            remaining_downloads: 0,
        }
    }
}

/// Classify a record against the 48h window and 3-download cap.
///
/// Rules, in order: missing record, expired window (strictly more than
/// `WINDOW_MS` elapsed), exhausted downloads, otherwise active. Expiry
/// wins over remaining downloads and the cap wins over remaining time;
/// both are terminal, so their relative order only affects which label a
/// doubly-dead record gets.
pub fn evaluate(record: Option<&EntitlementRecord>, now_ms: i64) -> EligibilitySnapshot {
    evaluate_with(WINDOW_MS, MAX_DOWNLOADS, record, now_ms)
}

/// [`evaluate`] with explicit limits, for configurations that shrink the
/// window (staging). Production paths pass the fixed constants.
pub fn evaluate_with(
    window_ms: i64,
    max_downloads: u32,
    record: Option<&EntitlementRecord>,
    now_ms: i64,
) -> EligibilitySnapshot {
    let record = match record {
        Some(record) => record,
        None => return EligibilitySnapshot::empty(EligibilityState::NoEntitlement),
    };

    let elapsed = record.elapsed_ms(now_ms);
    let remaining_time_ms = (window_ms - elapsed).max(0);
    let remaining_downloads = max_downloads.saturating_sub(record.download_count);

    if elapsed > window_ms {
        return EligibilitySnapshot {
            state: EligibilityState::Expired,
            remaining_time_ms: 0,
            remaining_downloads,
        };
    }

    if record.download_count >= max_downloads {
        return EligibilitySnapshot {
            state: EligibilityState::LimitReached,
            remaining_time_ms,
            remaining_downloads: 0,
        };
    }

    EligibilitySnapshot {
        state: EligibilityState::Active,
        remaining_time_ms,
        remaining_downloads,
    }
}

/// Outcome of the 30-second cooldown check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CooldownVerdict {
    pub allowed: bool,
    /// Whole seconds until the next request is allowed, rounded up.
    /// Zero whenever `allowed` is true.
    pub seconds_left: u32,
}

impl CooldownVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            seconds_left: 0,
        }
    }
}

/// Gate how soon another download may be requested.
///
/// Allowed when no download happened yet, or when at least `COOLDOWN_MS`
/// elapsed since the last one. The boundary is inclusive: exactly
/// 30 000 ms elapsed is allowed.
pub fn check_cooldown(last_download_timestamp: Option<i64>, now_ms: i64) -> CooldownVerdict {
    check_cooldown_with(COOLDOWN_MS, last_download_timestamp, now_ms)
}

/// [`check_cooldown`] with an explicit cooldown length.
pub fn check_cooldown_with(
    cooldown_ms: i64,
    last_download_timestamp: Option<i64>,
    now_ms: i64,
) -> CooldownVerdict {
    let last = match last_download_timestamp {
        Some(last) => last,
        None => return CooldownVerdict::allowed(),
    };

    let elapsed = now_ms - last;
    if elapsed >= cooldown_ms {
        return CooldownVerdict::allowed();
    }

    let wait_ms = cooldown_ms - elapsed;
    CooldownVerdict {
        allowed: false,
        // Ceiling so "29.1s left" reads as 30, not 29.
        seconds_left: ((wait_ms + 999) / 1000) as u32,
    }
}
