use std::sync::Arc;

use crate::{
    context::TxContext,
    models::{
        read::TransferTxResult,
        write::{CreateEntryParams, CreateTransferParams, TransferTxParams, UpdateAccountParams},
        Account,
    },
    storage::{LedgerTx, StorageBackend, StorageError},
};

/// Entry point for money movement. Wraps a backend and runs each transfer as
/// one all-or-nothing transaction.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn StorageBackend>,
}

impl Ledger {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }

    pub fn transfer(&self, ctx: &TxContext, arg: &TransferTxParams) -> Result<TransferTxResult, StorageError> {
        transfer_tx(self.store.as_ref(), ctx, arg)
    }
}

/// Runs `f` inside a transaction: commit on `Ok`, rollback on any error.
/// The caller's error is returned even when the rollback itself fails.
pub fn exec_tx<T, F>(store: &dyn StorageBackend, ctx: &TxContext, f: F) -> Result<T, StorageError>
where
    F: FnOnce(&mut dyn LedgerTx) -> Result<T, StorageError>,
{
    ctx.check()?;
    let mut tx = store.begin(ctx)?;
    let tx_id = tx.id();

    let outcome = f(tx.as_mut()).and_then(|value| ctx.check().map(|_| value));
    match outcome {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                tracing::warn!(tx_id, error = %err, rollback_error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// Moves `arg.amount` from one account to the other: one transfer row, a debit
/// and a credit entry, and both balances updated under row locks.
pub fn transfer_tx(
    store: &dyn StorageBackend,
    ctx: &TxContext,
    arg: &TransferTxParams,
) -> Result<TransferTxResult, StorageError> {
    let span = tracing::debug_span!(
        "transfer_tx",
        from = arg.from_account_id,
        to = arg.to_account_id,
        amount = arg.amount
    );
    let _guard = span.enter();

    let result = exec_tx(store, ctx, |tx| {
        let transfer = tx.create_transfer(&CreateTransferParams::from(arg))?;
        tracing::debug!(transfer_id = transfer.id, "Transfer row created");

        ctx.check()?;
        let from_entry = tx.create_entry(&CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })?;

        ctx.check()?;
        let to_entry = tx.create_entry(&CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })?;

        let (from_account, to_account) = move_money(
            tx,
            ctx,
            (arg.from_account_id, -arg.amount),
            (arg.to_account_id, arg.amount),
        )?;

        Ok(TransferTxResult {
            transfer,
            from_account,
            to_account,
            from_entry,
            to_entry,
        })
    })?;

    tracing::info!(
        transfer_id = result.transfer.id,
        from_balance = result.from_account.balance,
        to_balance = result.to_account.balance,
        "Transfer committed"
    );
    Ok(result)
}

/// Applies two `(account_id, delta)` updates, always locking the lower id
/// first so opposite-direction transfers can never wait on each other in a
/// cycle. Results come back in argument order.
pub fn move_money(
    tx: &mut dyn LedgerTx,
    ctx: &TxContext,
    first: (i64, i64),
    second: (i64, i64),
) -> Result<(Account, Account), StorageError> {
    if second.0 < first.0 {
        let second_account = add_money(tx, ctx, second)?;
        let first_account = add_money(tx, ctx, first)?;
        Ok((first_account, second_account))
    } else {
        let first_account = add_money(tx, ctx, first)?;
        let second_account = add_money(tx, ctx, second)?;
        Ok((first_account, second_account))
    }
}

fn add_money(tx: &mut dyn LedgerTx, ctx: &TxContext, (id, amount): (i64, i64)) -> Result<Account, StorageError> {
    ctx.check()?;
    tx.get_account_for_update(id)?;
    tx.update_account(&UpdateAccountParams { id, amount })
}
