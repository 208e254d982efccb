//! Reset invalidation fan-out.
//!
//! Live subscribers (other schedulers, other components in this process)
//! get a [`ResetNotice`] over a broadcast channel. For anything that was
//! not listening at publish time, the notice is also persisted as a
//! short-lived marker file; [`ResetBroadcast::catch_up`] replays it on the
//! next start while it is still fresh.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Name of the reset channel, as known to every storefront surface.
pub const RESET_CHANNEL: &str = "admin-reset";

/// How long a persisted reset marker stays actionable (5 minutes).
pub const RESET_MARKER_TTL_MS: i64 = 5 * 60 * 1000;

const CHANNEL_CAPACITY: usize = 256;

/// Payload published on [`RESET_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetNotice {
    /// The key the admin asked to reset.
    pub product_key: String,
    /// Full alias set the reset acted on.
    pub keys: Vec<String>,
    /// Epoch ms the reset was performed.
    pub ts: i64,
}

pub struct ResetBroadcast {
    tx: broadcast::Sender<ResetNotice>,
    marker_path: Option<PathBuf>,
}

impl ResetBroadcast {
    /// Broadcast with an optional marker file. Without a path only live
    /// subscribers are reachable, which is what tests want.
    pub fn new(marker_path: Option<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, marker_path }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResetNotice> {
        self.tx.subscribe()
    }

    /// Publish to live subscribers and persist the catch-up marker. Both
    /// halves are best-effort: zero subscribers is normal, and a marker
    /// write failure is logged rather than raised so a reset can never
    /// fail on its notification leg.
    pub async fn publish(&self, notice: ResetNotice) {
        let receivers = self.tx.send(notice.clone()).unwrap_or(0);
        tracing::debug!(
            channel = RESET_CHANNEL,
            product_key = %notice.product_key,
            receivers,
            "reset notice published"
        );

        let path = match &self.marker_path {
            Some(path) => path,
            None => return,
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %err, "could not create reset marker directory");
                return;
            }
        }
        match serde_json::to_vec(&notice) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(path, bytes).await {
                    tracing::warn!(error = %err, path = %path.display(), "could not persist reset marker");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not serialize reset marker");
            }
        }
    }

    /// The persisted notice, if one exists and is still within
    /// [`RESET_MARKER_TTL_MS`] at `now_ms`. Unreadable markers read as
    /// absent.
    pub async fn catch_up(&self, now_ms: i64) -> Option<ResetNotice> {
        let path = self.marker_path.as_ref()?;
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        let notice: ResetNotice = match serde_json::from_str(&raw) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::warn!(error = %err, "unreadable reset marker ignored");
                return None;
            }
        };
        if now_ms - notice.ts > RESET_MARKER_TTL_MS {
            return None;
        }
        Some(notice)
    }
}
