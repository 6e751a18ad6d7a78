use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread,
    time::Duration,
};

use rusqlite::{ffi, params, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use simplebank_core::{
    check_page, Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    Currency, Entry, LedgerTx, ListAccountsParams, ListEntriesParams, ListTransfersParams, StorageBackend,
    StorageError, Transfer, TransactionId, TxContext, UpdateAccountParams, User, PASSWORD_NEVER_CHANGED,
};
use time::OffsetDateTime;

/// Poll interval while another transaction holds the connection.
const BUSY_POLL: Duration = Duration::from_millis(5);

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, hashed_password, full_name, email, password_changed_at, created_at";

/// SQLite-backed store. One connection serves every caller, so an open
/// transaction excludes all other work until it finishes.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(sql_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                hashed_password TEXT NOT NULL,
                full_name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                password_changed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL REFERENCES users(username),
                balance INTEGER NOT NULL,
                currency TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (owner, currency)
            );

            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                amount INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_account_id INTEGER NOT NULL REFERENCES accounts(id),
                to_account_id INTEGER NOT NULL REFERENCES accounts(id),
                amount INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_from_to ON transfers(from_account_id, to_account_id);
            ",
        )
        .map_err(sql_err)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the connection, giving up when `ctx` is cancelled or past its deadline.
    fn conn_within(&self, ctx: &TxContext) -> Result<MutexGuard<'_, Connection>, StorageError> {
        loop {
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if ctx.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                    match ctx.remaining() {
                        Some(left) if left.is_zero() => return Err(StorageError::LockTimeout),
                        Some(left) => thread::sleep(left.min(BUSY_POLL)),
                        None => thread::sleep(BUSY_POLL),
                    }
                }
            }
        }
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) => {
            let detail = msg.clone().unwrap_or_else(|| err.to_string());
            match err.extended_code {
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => StorageError::ForeignKeyViolation(detail),
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    StorageError::UniqueViolation(detail)
                }
                _ => match err.code {
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageError::LockTimeout,
                    ErrorCode::CannotOpen => StorageError::Connection(detail),
                    _ => StorageError::Other(detail),
                },
            }
        }
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            StorageError::Corrupt(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn to_micros(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000) as i64
}

fn time_at(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let micros: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    let currency: String = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: currency
            .parse::<Currency>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        created_at: time_at(row, 4)?,
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        created_at: time_at(row, 3)?,
    })
}

fn transfer_from_row(row: &Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        from_account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: time_at(row, 4)?,
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        username: row.get(0)?,
        hashed_password: row.get(1)?,
        full_name: row.get(2)?,
        email: row.get(3)?,
        password_changed_at: time_at(row, 4)?,
        created_at: time_at(row, 5)?,
    })
}

// Statements shared by auto-committed calls and open transactions.

fn insert_entry(conn: &Connection, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
    conn.query_row(
        &format!("INSERT INTO entries (account_id, amount, created_at) VALUES (?1, ?2, ?3) RETURNING {ENTRY_COLUMNS}"),
        params![arg.account_id, arg.amount, to_micros(OffsetDateTime::now_utc())],
        entry_from_row,
    )
    .map_err(sql_err)
}

fn insert_transfer(conn: &Connection, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
    conn.query_row(
        &format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at)
             VALUES (?1, ?2, ?3, ?4) RETURNING {TRANSFER_COLUMNS}"
        ),
        params![
            arg.from_account_id,
            arg.to_account_id,
            arg.amount,
            to_micros(OffsetDateTime::now_utc())
        ],
        transfer_from_row,
    )
    .map_err(sql_err)
}

fn select_account(conn: &Connection, id: i64) -> Result<Account, StorageError> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        params![id],
        account_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| StorageError::not_found("account", id))
}

fn add_account_balance(conn: &Connection, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
    conn.query_row(
        &format!("UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 RETURNING {ACCOUNT_COLUMNS}"),
        params![arg.amount, arg.id],
        account_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| StorageError::not_found("account", arg.id))
}

impl StorageBackend for SqliteStorage {
    fn create_account(&self, arg: &CreateAccountParams) -> Result<Account, StorageError> {
        self.conn()
            .query_row(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency, created_at)
                     VALUES (?1, ?2, ?3, ?4) RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![
                    arg.owner,
                    arg.balance,
                    arg.currency.code(),
                    to_micros(OffsetDateTime::now_utc())
                ],
                account_from_row,
            )
            .map_err(sql_err)
    }

    fn get_account(&self, id: i64) -> Result<Account, StorageError> {
        select_account(&self.conn(), id)
    }

    fn list_accounts(&self, arg: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        check_page(arg.limit, arg.offset)?;
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = ?1 ORDER BY id LIMIT ?2 OFFSET ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![arg.owner, arg.limit, arg.offset], account_from_row)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn update_account(&self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        add_account_balance(&self.conn(), arg)
    }

    fn delete_account(&self, id: i64) -> Result<(), StorageError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(sql_err)?;
        if deleted == 0 {
            return Err(StorageError::not_found("account", id));
        }
        Ok(())
    }

    fn create_entry(&self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        insert_entry(&self.conn(), arg)
    }

    fn get_entry(&self, id: i64) -> Result<Entry, StorageError> {
        self.conn()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                params![id],
                entry_from_row,
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StorageError::not_found("entry", id))
    }

    fn list_entries(&self, arg: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        check_page(arg.limit, arg.offset)?;
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![arg.account_id, arg.limit, arg.offset], entry_from_row)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn create_transfer(&self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        insert_transfer(&self.conn(), arg)
    }

    fn get_transfer(&self, id: i64) -> Result<Transfer, StorageError> {
        self.conn()
            .query_row(
                &format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = ?1"),
                params![id],
                transfer_from_row,
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StorageError::not_found("transfer", id))
    }

    fn list_transfers(&self, arg: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        check_page(arg.limit, arg.offset)?;
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfers
                 WHERE from_account_id = ?1 OR to_account_id = ?2
                 ORDER BY id LIMIT ?3 OFFSET ?4"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![arg.from_account_id, arg.to_account_id, arg.limit, arg.offset],
                transfer_from_row,
            )
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    fn create_user(&self, arg: &CreateUserParams) -> Result<User, StorageError> {
        self.conn()
            .query_row(
                &format!(
                    "INSERT INTO users (username, hashed_password, full_name, email, password_changed_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING {USER_COLUMNS}"
                ),
                params![
                    arg.username,
                    arg.hashed_password,
                    arg.full_name,
                    arg.email,
                    to_micros(PASSWORD_NEVER_CHANGED),
                    to_micros(OffsetDateTime::now_utc())
                ],
                user_from_row,
            )
            .map_err(sql_err)
    }

    fn get_user(&self, username: &str) -> Result<User, StorageError> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                user_from_row,
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StorageError::not_found("user", username))
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn LedgerTx + '_>, StorageError> {
        let conn = self.conn_within(ctx)?;
        ctx.check()?;
        // IMMEDIATE takes the write lock up front, so the first row read is
        // already exclusive.
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;
        let id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id = id, "SQLite transaction started");
        Ok(Box::new(SqliteTx { conn, id, finished: false }))
    }
}

/// An open `BEGIN IMMEDIATE` transaction. Holds the connection until it ends.
pub struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    id: TransactionId,
    finished: bool,
}

impl LedgerTx for SqliteTx<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn create_transfer(&mut self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        insert_transfer(&self.conn, arg)
    }

    fn create_entry(&mut self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        insert_entry(&self.conn, arg)
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StorageError> {
        select_account(&self.conn, id)
    }

    fn update_account(&mut self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        add_account_balance(&self.conn, arg)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(tx_id = self.id, error = %rollback, "Rollback after failed SQLite commit failed");
            }
            return Err(sql_err(e));
        }
        tracing::debug!(tx_id = self.id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK").map_err(sql_err)?;
        tracing::debug!(tx_id = self.id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => tracing::debug!(tx_id = self.id, "SQLite transaction dropped, rolled back"),
            Err(e) => tracing::warn!(tx_id = self.id, error = %e, "Rollback of dropped SQLite transaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use simplebank_core::transfer_tx;
    use simplebank_core::TransferTxParams;

    use super::*;

    fn seed(storage: &SqliteStorage, owner: &str, balance: i64) -> Account {
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
    fn test_sqlite_transfer_persists() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let a = seed(&storage, "alice", 100);
        let b = seed(&storage, "bob", 50);

        let result = transfer_tx(
            &storage,
            &TxContext::background(),
            &TransferTxParams { from_account_id: a.id, to_account_id: b.id, amount: 30 },
        )
        .unwrap();

        assert_eq!(storage.get_account(a.id).unwrap().balance, 70);
        assert_eq!(storage.get_account(b.id).unwrap().balance, 80);
        assert_eq!(storage.get_transfer(result.transfer.id).unwrap(), result.transfer);
        assert_eq!(storage.get_entry(result.from_entry.id).unwrap().amount, -30);
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let a = seed(&storage, "alice", 100);

        let mut tx = storage.begin(&TxContext::background()).unwrap();
        tx.create_entry(&CreateEntryParams { account_id: a.id, amount: 10 }).unwrap();
        let inside = tx.update_account(&UpdateAccountParams { id: a.id, amount: 10 }).unwrap();
        assert_eq!(inside.balance, 110);
        tx.rollback().unwrap();

        assert_eq!(storage.get_account(a.id).unwrap().balance, 100);
        let entries = storage
            .list_entries(&ListEntriesParams { account_id: a.id, limit: 5, offset: 0 })
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_sqlite_dropped_transaction_rolls_back() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let a = seed(&storage, "alice", 100);

        {
            let mut tx = storage.begin(&TxContext::background()).unwrap();
            tx.update_account(&UpdateAccountParams { id: a.id, amount: -40 }).unwrap();
        }

        assert_eq!(storage.get_account(a.id).unwrap().balance, 100);
    }

    #[test]
    fn test_sqlite_constraint_errors_are_classified() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let a = seed(&storage, "alice", 0);

        let dup = storage
            .create_account(&CreateAccountParams { owner: "alice".to_string(), balance: 0, currency: Currency::Usd })
            .unwrap_err();
        assert!(matches!(dup, StorageError::UniqueViolation(_)), "{dup:?}");

        let orphan = storage
            .create_entry(&CreateEntryParams { account_id: a.id + 1000, amount: 1 })
            .unwrap_err();
        assert!(matches!(orphan, StorageError::ForeignKeyViolation(_)), "{orphan:?}");
    }

    #[test]
    fn test_sqlite_failed_commit_rolls_back() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let conn = storage.conn();
        conn.execute_batch(
            "BEGIN IMMEDIATE;
             PRAGMA defer_foreign_keys = ON;
             INSERT INTO entries (account_id, amount, created_at) VALUES (999, 1, 0);",
        )
        .unwrap();

        let tx: Box<dyn LedgerTx + '_> = Box::new(SqliteTx { conn, id: 1, finished: false });
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");

        let conn = storage.conn();
        assert!(conn.is_autocommit());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_sqlite_begin_gives_up_when_cancelled() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let holder = storage.begin(&TxContext::background()).unwrap();

        let ctx = TxContext::background();
        let err = thread::scope(|s| {
            let waiter = s.spawn(|| storage.begin(&ctx).map(|_| ()));
            thread::sleep(Duration::from_millis(50));
            ctx.cancel();
            waiter.join().unwrap().unwrap_err()
        });
        assert!(matches!(err, StorageError::Cancelled), "{err:?}");
        holder.rollback().unwrap();
    }

    #[test]
    fn test_sqlite_timestamps_keep_microseconds() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        seed(&storage, "alice", 0);

        let user = storage.get_user("alice").unwrap();
        assert_eq!(user.password_changed_at, PASSWORD_NEVER_CHANGED);
        assert_eq!(user.created_at.nanosecond() % 1_000, 0);
    }
}
