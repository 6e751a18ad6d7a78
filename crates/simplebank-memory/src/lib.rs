//! In-process ledger store.
//!
//! Rows live in ordered maps behind one `RwLock`. A transaction buffers its
//! writes and applies them in a single step on commit, so nothing it does is
//! visible before then. Account rows are guarded by [`row_locks::RowLocks`],
//! which gives `get_account_for_update` the same blocking behaviour as
//! `SELECT ... FOR UPDATE`.

mod row_locks;

use std::{
    collections::BTreeMap,
    mem,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use simplebank_core::{
    check_page, Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    Entry, LedgerTx, ListAccountsParams, ListEntriesParams, ListTransfersParams, StorageBackend, StorageError,
    Transfer, TransactionId, TxContext, UpdateAccountParams, User, PASSWORD_NEVER_CHANGED,
};
use time::OffsetDateTime;

use row_locks::RowLocks;

#[derive(Default)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

impl Tables {
    fn account(&self, id: i64) -> Result<&Account, StorageError> {
        self.accounts.get(&id).ok_or_else(|| StorageError::not_found("account", id))
    }

    fn require_account(&self, id: i64, column: &str) -> Result<(), StorageError> {
        if self.accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(StorageError::ForeignKeyViolation(format!("{column} references missing account {id}")))
        }
    }

    fn is_referenced(&self, account_id: i64) -> bool {
        self.entries.values().any(|e| e.account_id == account_id)
            || self
                .transfers
                .values()
                .any(|t| t.from_account_id == account_id || t.to_account_id == account_id)
    }
}

pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    row_locks: RowLocks,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            row_locks: RowLocks::new(),
            account_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_tx(&self) -> TransactionId {
        self.tx_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Runs `f` while holding the row lock of `account_id`, as a one-statement
    /// transaction would.
    fn with_row_lock<T>(
        &self,
        account_id: i64,
        f: impl FnOnce(&mut Tables) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let owner = self.next_tx();
        self.row_locks.acquire(account_id, owner, &TxContext::background())?;
        let result = f(&mut self.write());
        self.row_locks.release_all(owner, &[account_id]);
        result
    }
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Result<Vec<T>, StorageError> {
    check_page(limit, offset)?;
    Ok(rows.skip(offset as usize).take(limit as usize).collect())
}

fn add_balance(account: &Account, amount: i64) -> Result<Account, StorageError> {
    let balance = account
        .balance
        .checked_add(amount)
        .ok_or_else(|| StorageError::Other(format!("balance overflow on account {}", account.id)))?;
    Ok(Account { balance, ..account.clone() })
}

impl StorageBackend for InMemoryStorage {
    fn create_account(&self, arg: &CreateAccountParams) -> Result<Account, StorageError> {
        let mut tables = self.write();
        if !tables.users.contains_key(&arg.owner) {
            return Err(StorageError::ForeignKeyViolation(format!(
                "accounts.owner references missing user {}",
                arg.owner
            )));
        }
        if tables
            .accounts
            .values()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency)
        {
            return Err(StorageError::UniqueViolation(format!(
                "owner {} already has a {} account",
                arg.owner, arg.currency
            )));
        }

        let account = Account {
            id: self.account_seq.fetch_add(1, Ordering::SeqCst),
            owner: arg.owner.clone(),
            balance: arg.balance,
            currency: arg.currency,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn get_account(&self, id: i64) -> Result<Account, StorageError> {
        self.read().account(id).cloned()
    }

    fn list_accounts(&self, arg: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        let tables = self.read();
        page(
            tables.accounts.values().filter(|a| a.owner == arg.owner).cloned(),
            arg.limit,
            arg.offset,
        )
    }

    fn update_account(&self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        self.with_row_lock(arg.id, |tables| {
            let updated = add_balance(tables.account(arg.id)?, arg.amount)?;
            tables.accounts.insert(updated.id, updated.clone());
            Ok(updated)
        })
    }

    fn delete_account(&self, id: i64) -> Result<(), StorageError> {
        self.with_row_lock(id, |tables| {
            tables.account(id)?;
            if tables.is_referenced(id) {
                return Err(StorageError::ForeignKeyViolation(format!(
                    "account {id} is still referenced by entries or transfers"
                )));
            }
            tables.accounts.remove(&id);
            Ok(())
        })
    }

    fn create_entry(&self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        let mut tables = self.write();
        tables.require_account(arg.account_id, "entries.account_id")?;
        let entry = Entry {
            id: self.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn get_entry(&self, id: i64) -> Result<Entry, StorageError> {
        self.read()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("entry", id))
    }

    fn list_entries(&self, arg: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        let tables = self.read();
        page(
            tables.entries.values().filter(|e| e.account_id == arg.account_id).cloned(),
            arg.limit,
            arg.offset,
        )
    }

    fn create_transfer(&self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        let mut tables = self.write();
        tables.require_account(arg.from_account_id, "transfers.from_account_id")?;
        tables.require_account(arg.to_account_id, "transfers.to_account_id")?;
        let transfer = Transfer {
            id: self.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    fn get_transfer(&self, id: i64) -> Result<Transfer, StorageError> {
        self.read()
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("transfer", id))
    }

    fn list_transfers(&self, arg: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        let tables = self.read();
        page(
            tables
                .transfers
                .values()
                .filter(|t| t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id)
                .cloned(),
            arg.limit,
            arg.offset,
        )
    }

    fn create_user(&self, arg: &CreateUserParams) -> Result<User, StorageError> {
        let mut tables = self.write();
        if tables.users.contains_key(&arg.username) {
            return Err(StorageError::UniqueViolation(format!("username {} is taken", arg.username)));
        }
        if tables.users.values().any(|u| u.email == arg.email) {
            return Err(StorageError::UniqueViolation(format!("email {} is taken", arg.email)));
        }
        let user = User {
            username: arg.username.clone(),
            hashed_password: arg.hashed_password.clone(),
            full_name: arg.full_name.clone(),
            email: arg.email.clone(),
            password_changed_at: PASSWORD_NEVER_CHANGED,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    fn get_user(&self, username: &str) -> Result<User, StorageError> {
        self.read()
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| StorageError::not_found("user", username))
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn LedgerTx + '_>, StorageError> {
        ctx.check()?;
        let id = self.next_tx();
        tracing::debug!(tx_id = id, "In-memory transaction started");
        Ok(Box::new(InMemoryTx {
            storage: self,
            id,
            ctx: ctx.clone(),
            writes: Vec::new(),
            locked: Vec::new(),
            finished: false,
        }))
    }
}

enum PendingWrite {
    Transfer(Transfer),
    Entry(Entry),
    Balance { account_id: i64, amount: i64 },
}

/// Checks buffered writes against the committed tables and returns the final
/// row of every account whose balance changes. Accounts referenced by buffered
/// rows may have been deleted since they were first checked.
fn settle(tables: &Tables, writes: &[PendingWrite]) -> Result<BTreeMap<i64, Account>, StorageError> {
    let mut balances: BTreeMap<i64, Account> = BTreeMap::new();
    for write in writes {
        match write {
            PendingWrite::Transfer(t) => {
                tables.require_account(t.from_account_id, "transfers.from_account_id")?;
                tables.require_account(t.to_account_id, "transfers.to_account_id")?;
            }
            PendingWrite::Entry(e) => tables.require_account(e.account_id, "entries.account_id")?,
            PendingWrite::Balance { account_id, amount } => {
                let current = match balances.get(account_id) {
                    Some(account) => account,
                    None => tables.account(*account_id)?,
                };
                let updated = add_balance(current, *amount)?;
                balances.insert(*account_id, updated);
            }
        }
    }
    Ok(balances)
}

pub struct InMemoryTx<'a> {
    storage: &'a InMemoryStorage,
    id: TransactionId,
    ctx: TxContext,
    writes: Vec<PendingWrite>,
    locked: Vec<i64>,
    finished: bool,
}

impl InMemoryTx<'_> {
    fn lock(&mut self, account_id: i64) -> Result<(), StorageError> {
        if !self.locked.contains(&account_id) {
            self.storage.row_locks.acquire(account_id, self.id, &self.ctx)?;
            self.locked.push(account_id);
        }
        Ok(())
    }

    /// The account as this transaction sees it: committed row plus own pending deltas.
    fn view(&self, account_id: i64) -> Result<Account, StorageError> {
        let mut account = self.storage.read().account(account_id)?.clone();
        for write in &self.writes {
            if let PendingWrite::Balance { account_id: id, amount } = write {
                if *id == account_id {
                    account = add_balance(&account, *amount)?;
                }
            }
        }
        Ok(account)
    }

    fn finish(&mut self) -> Vec<PendingWrite> {
        self.finished = true;
        self.storage.row_locks.release_all(self.id, &self.locked);
        mem::take(&mut self.writes)
    }
}

impl LedgerTx for InMemoryTx<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn create_transfer(&mut self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        {
            let tables = self.storage.read();
            tables.require_account(arg.from_account_id, "transfers.from_account_id")?;
            tables.require_account(arg.to_account_id, "transfers.to_account_id")?;
        }
        let transfer = Transfer {
            id: self.storage.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.writes.push(PendingWrite::Transfer(transfer.clone()));
        Ok(transfer)
    }

    fn create_entry(&mut self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.storage.read().require_account(arg.account_id, "entries.account_id")?;
        let entry = Entry {
            id: self.storage.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.writes.push(PendingWrite::Entry(entry.clone()));
        Ok(entry)
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StorageError> {
        self.lock(id)?;
        self.view(id)
    }

    fn update_account(&mut self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        self.lock(arg.id)?;
        let updated = add_balance(&self.view(arg.id)?, arg.amount)?;
        self.writes.push(PendingWrite::Balance { account_id: arg.id, amount: arg.amount });
        Ok(updated)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let storage = self.storage;
        let mut tables = storage.write();

        let balances = match settle(&tables, &self.writes) {
            Ok(balances) => balances,
            Err(err) => {
                drop(tables);
                self.finish();
                tracing::debug!(tx_id = self.id, error = %err, "In-memory transaction aborted at commit");
                return Err(err);
            }
        };

        for write in mem::take(&mut self.writes) {
            match write {
                PendingWrite::Transfer(t) => {
                    tables.transfers.insert(t.id, t);
                }
                PendingWrite::Entry(e) => {
                    tables.entries.insert(e.id, e);
                }
                PendingWrite::Balance { .. } => {}
            }
        }
        tables.accounts.extend(balances);
        drop(tables);

        self.finish();
        tracing::debug!(tx_id = self.id, "In-memory transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish();
        tracing::debug!(tx_id = self.id, "In-memory transaction rolled back");
        Ok(())
    }
}

impl Drop for InMemoryTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
            tracing::debug!(tx_id = self.id, "In-memory transaction dropped, rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use simplebank_core::{transfer_tx, Currency, TransferTxParams};

    use super::*;

    fn seed(storage: &InMemoryStorage, owner: &str, balance: i64) -> Account {
        storage
            .create_user(&CreateUserParams {
                username: owner.to_string(),
                hashed_password: "secret".to_string(),
                full_name: owner.to_uppercase(),
                email: format!("{owner}@example.com"),
            })
            .unwrap();
        storage
            .create_account(&CreateAccountParams { owner: owner.to_string(), balance, currency: Currency::Usd })
            .unwrap()
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let storage = InMemoryStorage::new();
        let a = seed(&storage, "alice", 100);
        let b = seed(&storage, "bob", 50);

        let mut tx = storage.begin(&TxContext::background()).unwrap();
        let entry = tx.create_entry(&CreateEntryParams { account_id: a.id, amount: -30 }).unwrap();
        let updated = tx.update_account(&UpdateAccountParams { id: a.id, amount: -30 }).unwrap();
        assert_eq!(updated.balance, 70);

        assert_eq!(storage.get_account(a.id).unwrap().balance, 100);
        assert!(storage.get_entry(entry.id).unwrap_err().is_not_found());

        tx.commit().unwrap();
        assert_eq!(storage.get_account(a.id).unwrap().balance, 70);
        assert_eq!(storage.get_entry(entry.id).unwrap(), entry);
        assert_eq!(storage.get_account(b.id).unwrap().balance, 50);
    }

    #[test]
    fn dropped_transaction_releases_locks_and_discards_writes() {
        let storage = InMemoryStorage::new();
        let a = seed(&storage, "alice", 100);

        {
            let mut tx = storage.begin(&TxContext::background()).unwrap();
            tx.get_account_for_update(a.id).unwrap();
            tx.update_account(&UpdateAccountParams { id: a.id, amount: 5 }).unwrap();
        }

        assert_eq!(storage.row_locks.holder(a.id), None);
        assert_eq!(storage.get_account(a.id).unwrap().balance, 100);
        // The row is free again for an auto-committed update.
        assert_eq!(storage.update_account(&UpdateAccountParams { id: a.id, amount: 5 }).unwrap().balance, 105);
    }

    #[test]
    fn commit_fails_when_referenced_account_was_deleted() {
        let storage = InMemoryStorage::new();
        let a = seed(&storage, "alice", 0);

        let mut tx = storage.begin(&TxContext::background()).unwrap();
        tx.create_entry(&CreateEntryParams { account_id: a.id, amount: 1 }).unwrap();
        storage.delete_account(a.id).unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StorageError::ForeignKeyViolation(_)));
        assert!(storage.list_entries(&ListEntriesParams { account_id: a.id, limit: 5, offset: 0 }).unwrap().is_empty());
    }

    #[test]
    fn self_transfer_nets_to_zero() {
        let storage = InMemoryStorage::new();
        let a = seed(&storage, "alice", 100);

        let result = transfer_tx(
            &storage,
            &TxContext::background(),
            &TransferTxParams { from_account_id: a.id, to_account_id: a.id, amount: 10 },
        )
        .unwrap();

        assert_eq!(result.from_account.balance, 90);
        assert_eq!(result.to_account.balance, 100);
        assert_eq!(storage.get_account(a.id).unwrap().balance, 100);
    }

    #[test]
    fn settle_fails_before_anything_is_applied() {
        let storage = InMemoryStorage::new();
        let a = seed(&storage, "alice", i64::MAX - 5);
        let b = seed(&storage, "bob", 0);
        let now = OffsetDateTime::now_utc();
        let writes = vec![
            PendingWrite::Transfer(Transfer { id: 1, from_account_id: b.id, to_account_id: a.id, amount: 10, created_at: now }),
            PendingWrite::Entry(Entry { id: 1, account_id: b.id, amount: -10, created_at: now }),
            PendingWrite::Balance { account_id: b.id, amount: -10 },
            PendingWrite::Balance { account_id: a.id, amount: 3 },
            PendingWrite::Balance { account_id: a.id, amount: 7 },
        ];

        let err = settle(&storage.read(), &writes).unwrap_err();
        assert!(matches!(err, StorageError::Other(_)), "{err:?}");

        let balances = settle(&storage.read(), &writes[..4]).unwrap();
        assert_eq!(balances[&a.id].balance, i64::MAX - 2);
        assert_eq!(balances[&b.id].balance, -10);
    }

    #[test]
    fn negative_pagination_is_rejected() {
        let storage = InMemoryStorage::new();
        let err = storage
            .list_entries(&ListEntriesParams { account_id: 1, limit: -1, offset: 0 })
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}
