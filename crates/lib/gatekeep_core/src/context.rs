//! Per-call deadline and cancellation.
//!
//! Every repository, OTP and delivery call made by the services goes through
//! [`CallContext::guard`], so the caller's deadline and cancellation signal
//! reach every suspension point.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, Result};

/// Deadline and cancellation signal for one inbound call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// No deadline, never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this context to an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` under this context. Fails with [`AuthError::Timeout`] when the
    /// deadline passes and [`AuthError::Unavailable`] when cancelled; the
    /// inner future is dropped in both cases.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AuthError::Unavailable("call cancelled".into()));
        }
        // timeout_at polls `fut` once even past the deadline; never start work late.
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(AuthError::Timeout);
        }
        let bounded = async {
            match self.deadline {
                Some(deadline) => timeout_at(deadline, fut)
                    .await
                    .unwrap_or(Err(AuthError::Timeout)),
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AuthError::Unavailable("call cancelled".into())),
            result = bounded => result,
        }
    }
}
