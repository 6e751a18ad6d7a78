use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::storage::StorageError;

/// Cancellation and deadline carried into a transaction.
///
/// Clones share the cancellation flag, so a handle kept by the caller can abort
/// a transaction running on another thread.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl TxContext {
    /// No deadline, never cancelled unless [`TxContext::cancel`] is called.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_never_expires() {
        let ctx = TxContext::background();
        assert!(ctx.check().is_ok());
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let ctx = TxContext::background();
        let handle = ctx.clone();
        handle.cancel();
        assert!(matches!(ctx.check(), Err(StorageError::Cancelled)));
    }

    #[test]
    fn elapsed_deadline_fails_check() {
        let ctx = TxContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(ctx.check(), Err(StorageError::DeadlineExceeded)));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn future_deadline_reports_remaining_time() {
        let ctx = TxContext::with_timeout(Duration::from_secs(60));
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().unwrap() > Duration::from_secs(50));
    }
}
