use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

use simplebank_core::{StorageError, TransactionId, TxContext};

/// Upper bound on one condvar wait, so cancellation is noticed while blocked.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Exclusive per-row locks keyed by account id. A transaction may re-acquire
/// a row it already holds.
pub(crate) struct RowLocks {
    held: Mutex<HashMap<i64, TransactionId>>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Blocks until `owner` holds `row`, the context is cancelled, or its deadline passes.
    pub fn acquire(&self, row: i64, owner: TransactionId, ctx: &TxContext) -> Result<(), StorageError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match held.get(&row) {
                None => {
                    held.insert(row, owner);
                    return Ok(());
                }
                Some(holder) if *holder == owner => return Ok(()),
                Some(holder) => {
                    tracing::trace!(row, owner, holder = *holder, "Waiting for row lock");
                }
            }

            if ctx.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let wait = match ctx.remaining() {
                Some(left) if left.is_zero() => return Err(StorageError::LockTimeout),
                Some(left) => left.min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            held = self
                .released
                .wait_timeout(held, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn release_all(&self, owner: TransactionId, rows: &[i64]) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for row in rows {
            if held.get(row) == Some(&owner) {
                held.remove(row);
            }
        }
        drop(held);
        self.released.notify_all();
    }

    #[cfg(test)]
    pub fn holder(&self, row: i64) -> Option<TransactionId> {
        self.held.lock().unwrap().get(&row).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::*;

    #[test]
    fn reacquire_by_same_owner_does_not_block() {
        let locks = RowLocks::new();
        let ctx = TxContext::background();
        locks.acquire(1, 10, &ctx).unwrap();
        locks.acquire(1, 10, &ctx).unwrap();
        assert_eq!(locks.holder(1), Some(10));
    }

    #[test]
    fn waiter_times_out_while_row_is_held() {
        let locks = RowLocks::new();
        locks.acquire(1, 10, &TxContext::background()).unwrap();

        let started = Instant::now();
        let err = locks
            .acquire(1, 11, &TxContext::with_timeout(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(locks.holder(1), Some(10));
    }

    #[test]
    fn waiter_notices_cancellation() {
        let locks = RowLocks::new();
        locks.acquire(1, 10, &TxContext::background()).unwrap();
        let ctx = TxContext::background();
        ctx.cancel();
        assert!(matches!(locks.acquire(1, 11, &ctx), Err(StorageError::Cancelled)));
    }

    #[test]
    fn release_wakes_waiter() {
        let locks = Arc::new(RowLocks::new());
        locks.acquire(7, 1, &TxContext::background()).unwrap();

        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(7, 2, &TxContext::with_timeout(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));
        locks.release_all(1, &[7]);

        waiter.join().unwrap().unwrap();
        assert_eq!(locks.holder(7), Some(2));
    }

    #[test]
    fn release_ignores_rows_held_by_others() {
        let locks = RowLocks::new();
        let ctx = TxContext::background();
        locks.acquire(1, 10, &ctx).unwrap();
        locks.release_all(11, &[1]);
        assert_eq!(locks.holder(1), Some(10));
    }
}
