use thiserror::Error;

use crate::{
    context::TxContext,
    models::{
        read::{ListAccountsParams, ListEntriesParams, ListTransfersParams},
        write::{
            CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
            UpdateAccountParams,
        },
        Account, Entry, Transfer, User,
    },
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),
    #[error("timed out waiting for a row lock")]
    LockTimeout,
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Other(String),
}

/// Coarse classification callers branch on, e.g. to pick a 404 over a 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    TransactionFailure,
    Validation,
    Other,
}

impl StorageError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StorageError::NotFound { entity, key: key.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::Validation(_) => ErrorKind::Validation,
            StorageError::UniqueViolation(_)
            | StorageError::ForeignKeyViolation(_)
            | StorageError::LockTimeout
            | StorageError::Deadlock(_)
            | StorageError::Cancelled
            | StorageError::DeadlineExceeded
            | StorageError::NoActiveTransaction
            | StorageError::Connection(_) => ErrorKind::TransactionFailure,
            StorageError::Corrupt(_) | StorageError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type TransactionId = u64;

/// Rejects negative pagination arguments before they reach a backend.
pub fn check_page(limit: i64, offset: i64) -> Result<(), StorageError> {
    if limit < 0 || offset < 0 {
        return Err(StorageError::Validation(format!(
            "limit and offset must be non-negative, got limit={limit} offset={offset}"
        )));
    }
    Ok(())
}

/// One open transaction against a backend.
///
/// Every write stays invisible to other transactions until [`LedgerTx::commit`].
/// Dropping a transaction without committing rolls it back.
pub trait LedgerTx {
    fn id(&self) -> TransactionId;

    fn create_transfer(&mut self, arg: &CreateTransferParams) -> Result<Transfer, StorageError>;
    fn create_entry(&mut self, arg: &CreateEntryParams) -> Result<Entry, StorageError>;

    /// Reads an account and takes an exclusive lock on its row, held until the
    /// transaction ends.
    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StorageError>;

    /// Adds `arg.amount` to the balance, locking the row first if this
    /// transaction does not already hold it.
    fn update_account(&mut self, arg: &UpdateAccountParams) -> Result<Account, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Row accessors of the ledger store. Each call outside [`StorageBackend::begin`]
/// is a single auto-committed statement.
pub trait StorageBackend: Send + Sync {
    // Accounts
    fn create_account(&self, arg: &CreateAccountParams) -> Result<Account, StorageError>;
    fn get_account(&self, id: i64) -> Result<Account, StorageError>;
    fn list_accounts(&self, arg: &ListAccountsParams) -> Result<Vec<Account>, StorageError>;
    fn update_account(&self, arg: &UpdateAccountParams) -> Result<Account, StorageError>;
    fn delete_account(&self, id: i64) -> Result<(), StorageError>;

    // Entries
    fn create_entry(&self, arg: &CreateEntryParams) -> Result<Entry, StorageError>;
    fn get_entry(&self, id: i64) -> Result<Entry, StorageError>;
    fn list_entries(&self, arg: &ListEntriesParams) -> Result<Vec<Entry>, StorageError>;

    // Transfers
    fn create_transfer(&self, arg: &CreateTransferParams) -> Result<Transfer, StorageError>;
    fn get_transfer(&self, id: i64) -> Result<Transfer, StorageError>;
    fn list_transfers(&self, arg: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError>;

    // Users
    fn create_user(&self, arg: &CreateUserParams) -> Result<User, StorageError>;
    fn get_user(&self, username: &str) -> Result<User, StorageError>;

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn LedgerTx + '_>, StorageError>;
}
