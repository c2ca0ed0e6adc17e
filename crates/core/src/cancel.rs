//! Request-scoped cancellation with an optional deadline.
//!
//! A single [`CancelToken`] is created per question and handed to every stage
//! of the pipeline (retrieval, composition, generation). Each stage checks it
//! before starting expensive work and wraps outbound calls in [`CancelToken::run`],
//! which drops the inner future on cancellation. Dropping a `reqwest` future
//! aborts the underlying HTTP request, so cancellation reaches the network.
//!
//! Narrowed tokens ([`CancelToken::narrowed`]) share the cancellation flag
//! with their parent but may carry an earlier deadline.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a token-guarded operation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation token carrying an optional deadline.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.shared.cancelled.load(Ordering::SeqCst))
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl CancelToken {
    /// A token with no deadline.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            deadline: None,
        }
    }

    /// A token that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut token = Self::new();
        token.deadline = Some(Instant::now() + timeout);
        token
    }

    /// A token sharing this token's cancellation flag whose deadline is the
    /// earlier of the parent's and `now + timeout`.
    pub fn narrowed(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(candidate)),
            None => Some(candidate),
        };
        Self {
            shared: self.shared.clone(),
            deadline,
        }
    }

    /// Cancel this token and every token sharing its flag.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when the token has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns an error if the token is already cancelled or expired.
    ///
    /// Stages call this before starting expensive work.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub async fn interrupted(&self) -> Interrupted {
        loop {
            // Registered before the flag check so a concurrent cancel() is not missed.
            let notified = self.shared.notify.notified();
            if self.is_cancelled() {
                return Interrupted::Cancelled;
            }
            match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Interrupted::DeadlineExceeded;
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Drive `fut` to completion unless the token fires first, in which case
    /// `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.interrupted() => Err(reason),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
