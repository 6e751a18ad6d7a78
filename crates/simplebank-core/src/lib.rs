//! Core types and traits for simplebank storage backends.
//!
//! This crate provides the `StorageBackend` trait, the row types it moves,
//! and the money-transfer transaction that runs on top of any backend.

pub mod context;
pub mod models;
pub mod random;
pub mod storage;
pub mod transfer;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export key types at crate root for convenience
pub use context::TxContext;
pub use models::read::{ListAccountsParams, ListEntriesParams, ListTransfersParams, TransferTxResult};
pub use models::write::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams, TransferTxParams,
    UpdateAccountParams,
};
pub use models::{Account, Currency, Entry, ParseCurrencyError, Transfer, User, PASSWORD_NEVER_CHANGED};
pub use storage::{check_page, ErrorKind, LedgerTx, StorageBackend, StorageError, TransactionId};
pub use transfer::{exec_tx, move_money, transfer_tx, Ledger};
