//! Used-token ledger for single-use scoped tokens.
//!
//! Register and restore tokens are bearer capabilities. Consuming their `jti`
//! here before acting on them means a token completes its flow at most once,
//! even when two requests race with the same token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

/// Seconds an entry is kept past its token's `exp`.
pub const RETENTION_MARGIN_SECS: i64 = 2;

#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Record `jti` as used. Returns false if it was already recorded.
    ///
    /// Entries may be forgotten after `expires_at`, since the token itself is
    /// rejected from then on.
    async fn consume(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Forget a consumed `jti` so the token can be presented again. Used when
    /// the flow it unlocked failed without committing anything.
    async fn release(&self, jti: &str) -> Result<()>;
}

/// In-process [`TokenLedger`].
#[derive(Debug, Default)]
pub struct MemoryTokenLedger {
    used: DashMap<String, DateTime<Utc>>,
}

impl MemoryTokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget entries whose token can no longer validate.
    ///
    /// Token expiry has whole-second precision and a token is still accepted
    /// during its `exp` second, so entries outlive `expires_at` by
    /// [`RETENTION_MARGIN_SECS`].
    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(RETENTION_MARGIN_SECS);
        let before = self.used.len();
        self.used.retain(|_, expires_at| *expires_at > cutoff);
        before.saturating_sub(self.used.len())
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Spawn a periodic eviction. It stops when `cancel` is cancelled.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = ledger.evict_expired();
                        if removed > 0 {
                            debug!(removed, "evicted expired ledger entries");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl TokenLedger for MemoryTokenLedger {
    async fn consume(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        match self.used.entry(jti.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn release(&self, jti: &str) -> Result<()> {
        self.used.remove(jti);
        Ok(())
    }
}
