//! One-time codes for email verification.
//!
//! Codes are keyed by `(flow, email)`, so a registration code can never
//! complete a restore. A code is single use: a successful verification
//! removes it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::{Rng, rng};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AuthError, Result};
use crate::models::VerificationFlow;

/// Wrong guesses tolerated before a code is discarded.
pub const MAX_ATTEMPTS: u32 = 5;

/// Storage for pending one-time codes.
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Store `code` for `(flow, email)`, replacing any pending code.
    async fn issue(&self, flow: VerificationFlow, email: &str, code: &str, ttl: Duration)
    -> Result<()>;

    /// Check `code` and consume it on success.
    ///
    /// Fails with `InvalidOtp` when there is no pending code or it does not
    /// match, and `OtpExpired` when it is past its deadline.
    async fn verify(&self, flow: VerificationFlow, email: &str, code: &str) -> Result<()>;
}

/// Out-of-band channel that hands a code to its recipient.
#[async_trait]
pub trait OtpDelivery: Send + Sync {
    async fn deliver(&self, flow: VerificationFlow, email: &str, code: &str) -> Result<()>;
}

/// Random numeric code of `length` digits.
pub fn generate_code(length: usize) -> String {
    let mut rng = rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

fn codes_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[derive(Debug, Clone)]
struct PendingCode {
    code: String,
    expires_at: Instant,
    failed_attempts: u32,
}

/// In-process [`OtpStore`].
#[derive(Debug, Default)]
pub struct MemoryOtpStore {
    codes: DashMap<(VerificationFlow, String), PendingCode>,
}

impl MemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired codes. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.codes.len();
        self.codes.retain(|_, pending| pending.expires_at > now);
        before.saturating_sub(self.codes.len())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Spawn a periodic purge. It stops when `cancel` is cancelled.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            debug!(removed, "purged expired one-time codes");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl OtpStore for MemoryOtpStore {
    async fn issue(
        &self,
        flow: VerificationFlow,
        email: &str,
        code: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.codes.insert(
            (flow, email.to_string()),
            PendingCode {
                code: code.to_string(),
                expires_at: Instant::now() + ttl,
                failed_attempts: 0,
            },
        );
        Ok(())
    }

    async fn verify(&self, flow: VerificationFlow, email: &str, code: &str) -> Result<()> {
        let Entry::Occupied(mut entry) = self.codes.entry((flow, email.to_string())) else {
            return Err(AuthError::InvalidOtp);
        };
        if entry.get().expires_at <= Instant::now() {
            entry.remove();
            return Err(AuthError::OtpExpired);
        }
        if !codes_match(&entry.get().code, code) {
            let pending = entry.get_mut();
            pending.failed_attempts += 1;
            if pending.failed_attempts >= MAX_ATTEMPTS {
                entry.remove();
                debug!(%flow, "one-time code discarded after too many attempts");
            }
            return Err(AuthError::InvalidOtp);
        }
        entry.remove();
        Ok(())
    }
}

/// Delivery that writes the code to the log. For development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl OtpDelivery for LogDelivery {
    async fn deliver(&self, flow: VerificationFlow, email: &str, code: &str) -> Result<()> {
        info!(%flow, email, code, "one-time code issued");
        Ok(())
    }
}

/// Delivery that keeps the last code sent to each address in memory.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    sent: DashMap<(VerificationFlow, String), String>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last code delivered to `email` for `flow`.
    pub fn last_code(&self, flow: VerificationFlow, email: &str) -> Option<String> {
        self.sent
            .get(&(flow, email.to_string()))
            .map(|code| code.value().clone())
    }

    /// Number of addresses that received at least one code.
    pub fn recipients(&self) -> usize {
        self.sent.len()
    }
}

#[async_trait]
impl OtpDelivery for MemoryOutbox {
    async fn deliver(&self, flow: VerificationFlow, email: &str, code: &str) -> Result<()> {
        self.sent.insert((flow, email.to_string()), code.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn generated_codes_are_numeric_with_requested_length() {
        for length in [4, 6, 10] {
            let code = generate_code(length);
            assert_eq!(code.len(), length);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let store = MemoryOtpStore::new();
        let flow = VerificationFlow::Registration;
        store.issue(flow, "a@example.com", "123456", TTL).await.unwrap();

        store.verify(flow, "a@example.com", "123456").await.unwrap();
        assert!(matches!(
            store.verify(flow, "a@example.com", "123456").await,
            Err(AuthError::InvalidOtp)
        ));
    }

    #[tokio::test]
    async fn codes_are_scoped_to_flow() {
        let store = MemoryOtpStore::new();
        store
            .issue(VerificationFlow::Registration, "a@example.com", "111111", TTL)
            .await
            .unwrap();
        assert!(matches!(
            store.verify(VerificationFlow::Restore, "a@example.com", "111111").await,
            Err(AuthError::InvalidOtp)
        ));
        store
            .verify(VerificationFlow::Registration, "a@example.com", "111111")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reissue_replaces_previous_code() {
        let store = MemoryOtpStore::new();
        let flow = VerificationFlow::Restore;
        store.issue(flow, "a@example.com", "111111", TTL).await.unwrap();
        store.issue(flow, "a@example.com", "222222", TTL).await.unwrap();
        assert!(store.verify(flow, "a@example.com", "111111").await.is_err());
        store.verify(flow, "a@example.com", "222222").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_code_is_rejected_and_removed() {
        let store = MemoryOtpStore::new();
        let flow = VerificationFlow::Registration;
        store.issue(flow, "a@example.com", "123456", TTL).await.unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(matches!(
            store.verify(flow, "a@example.com", "123456").await,
            Err(AuthError::OtpExpired)
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn repeated_wrong_guesses_discard_the_code() {
        let store = MemoryOtpStore::new();
        let flow = VerificationFlow::Registration;
        store.issue(flow, "a@example.com", "123456", TTL).await.unwrap();
        for _ in 0..MAX_ATTEMPTS {
            assert!(store.verify(flow, "a@example.com", "000000").await.is_err());
        }
        assert!(matches!(
            store.verify(flow, "a@example.com", "123456").await,
            Err(AuthError::InvalidOtp)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_codes() {
        let store = MemoryOtpStore::new();
        let flow = VerificationFlow::Registration;
        store.issue(flow, "old@example.com", "1", Duration::from_secs(10)).await.unwrap();
        store.issue(flow, "new@example.com", "2", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn outbox_records_last_code() {
        let outbox = MemoryOutbox::new();
        let flow = VerificationFlow::Restore;
        outbox.deliver(flow, "a@example.com", "1").await.unwrap();
        outbox.deliver(flow, "a@example.com", "2").await.unwrap();
        assert_eq!(outbox.last_code(flow, "a@example.com").as_deref(), Some("2"));
        assert_eq!(outbox.last_code(VerificationFlow::Registration, "a@example.com"), None);
        assert_eq!(outbox.recipients(), 1);
    }
}
