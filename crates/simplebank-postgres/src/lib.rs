//! PostgreSQL store on a pool of blocking `postgres` clients.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use postgres::{error::SqlState, CancelToken, Client, Config, GenericClient, NoTls, Row};
use r2d2::{ManageConnection, Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use simplebank_core::{
    check_page, Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    Currency, Entry, LedgerTx, ListAccountsParams, ListEntriesParams, ListTransfersParams, StorageBackend,
    StorageError, Transfer, TransactionId, TxContext, UpdateAccountParams, User, PASSWORD_NEVER_CHANGED,
};

/// Serialises schema creation when several processes start at once.
const SCHEMA_LOCK_KEY: i64 = 0x5b_a4_c0_de;

/// How long a caller without a deadline waits for a free connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest single pool wait, so cancellation is noticed while queued.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// How often an open transaction looks at its context's cancel flag.
const WATCH_INTERVAL: Duration = Duration::from_millis(10);

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, hashed_password, full_name, email, password_changed_at, created_at";

/// A pooled client, plus a flag set when its session state can no longer be
/// trusted (a rollback failed, or a cancel request may still be in flight).
pub struct PgConnection {
    client: Client,
    poisoned: bool,
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for PgConnection {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

/// `r2d2_postgres` manager that also drops poisoned connections instead of
/// handing them out again.
pub struct LedgerConnectionManager(PostgresConnectionManager<NoTls>);

impl ManageConnection for LedgerConnectionManager {
    type Connection = PgConnection;
    type Error = postgres::Error;

    fn connect(&self) -> Result<PgConnection, postgres::Error> {
        let client = self.0.connect()?;
        tracing::debug!("Opened PostgreSQL connection");
        Ok(PgConnection { client, poisoned: false })
    }

    fn is_valid(&self, conn: &mut PgConnection) -> Result<(), postgres::Error> {
        self.0.is_valid(&mut conn.client)
    }

    fn has_broken(&self, conn: &mut PgConnection) -> bool {
        conn.poisoned || self.0.has_broken(&mut conn.client)
    }
}

pub struct PostgresStorage {
    pool: Pool<LedgerConnectionManager>,
    tx_counter: AtomicU64,
}

impl PostgresStorage {
    pub fn new(connection_string: &str, max_connections: usize) -> Result<Self, StorageError> {
        let config: Config = connection_string
            .parse()
            .map_err(|e| StorageError::Connection(format!("invalid PostgreSQL URL: {e}")))?;
        let max_size = u32::try_from(max_connections).unwrap_or(u32::MAX).max(1);

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(CONNECT_TIMEOUT)
            .build(LedgerConnectionManager(PostgresConnectionManager::new(config, NoTls)))
            .map_err(|e| StorageError::Connection(format!("PostgreSQL connection failed: {e}")))?;

        let storage = Self {
            pool,
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn client(&self) -> Result<PooledConnection<LedgerConnectionManager>, StorageError> {
        self.connection(&TxContext::background())
    }

    /// Waits for a free connection until `ctx` is cancelled or expires.
    fn connection(&self, ctx: &TxContext) -> Result<PooledConnection<LedgerConnectionManager>, StorageError> {
        let give_up = Instant::now() + ctx.remaining().unwrap_or(CONNECT_TIMEOUT);
        loop {
            ctx.check()?;
            let left = give_up.saturating_duration_since(Instant::now());
            match self.pool.get_timeout(left.min(WAIT_SLICE)) {
                Ok(conn) => return Ok(conn),
                Err(e) if left <= WAIT_SLICE => {
                    ctx.check()?;
                    return Err(StorageError::Connection(format!("no PostgreSQL connection available: {e}")));
                }
                Err(_) => {}
            }
        }
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut client = self.client()?;
        let mut tx = client.transaction().map_err(pg_err)?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&SCHEMA_LOCK_KEY])
            .map_err(pg_err)?;
        tx.batch_execute(
            "
            CREATE TABLE IF NOT EXISTS users (
                username VARCHAR PRIMARY KEY,
                hashed_password VARCHAR NOT NULL,
                full_name VARCHAR NOT NULL,
                email VARCHAR NOT NULL UNIQUE,
                password_changed_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                owner VARCHAR NOT NULL REFERENCES users(username),
                balance BIGINT NOT NULL,
                currency VARCHAR NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (owner, currency)
            );

            CREATE TABLE IF NOT EXISTS entries (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                from_account_id BIGINT NOT NULL REFERENCES accounts(id),
                to_account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_from_to ON transfers(from_account_id, to_account_id);
            ",
        )
        .map_err(pg_err)?;
        tx.commit().map_err(pg_err)
    }
}

fn pg_err(e: postgres::Error) -> StorageError {
    if e.is_closed() {
        return StorageError::Connection(e.to_string());
    }
    match e.as_db_error() {
        Some(db) => classify(db.code(), db.message().to_string()),
        None => StorageError::Other(e.to_string()),
    }
}

fn classify(code: &SqlState, detail: String) -> StorageError {
    if *code == SqlState::FOREIGN_KEY_VIOLATION {
        StorageError::ForeignKeyViolation(detail)
    } else if *code == SqlState::UNIQUE_VIOLATION {
        StorageError::UniqueViolation(detail)
    } else if *code == SqlState::LOCK_NOT_AVAILABLE {
        StorageError::LockTimeout
    } else if *code == SqlState::QUERY_CANCELED {
        StorageError::DeadlineExceeded
    } else if *code == SqlState::T_R_DEADLOCK_DETECTED {
        StorageError::Deadlock(detail)
    } else if *code == SqlState::NO_ACTIVE_SQL_TRANSACTION {
        StorageError::NoActiveTransaction
    } else {
        StorageError::Other(detail)
    }
}

/// Session settings that make the server give up at the context's deadline.
fn timeout_sql(left: Duration) -> String {
    let ms = left.as_millis().max(1);
    format!("SET LOCAL lock_timeout = '{ms}ms'; SET LOCAL statement_timeout = '{ms}ms'")
}

fn col<'a, T: postgres::types::FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T, StorageError> {
    row.try_get(idx).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn account_from_row(row: &Row) -> Result<Account, StorageError> {
    let currency: &str = col(row, 3)?;
    Ok(Account {
        id: col(row, 0)?,
        owner: col(row, 1)?,
        balance: col(row, 2)?,
        currency: currency
            .parse::<Currency>()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?,
        created_at: col(row, 4)?,
    })
}

fn entry_from_row(row: &Row) -> Result<Entry, StorageError> {
    Ok(Entry {
        id: col(row, 0)?,
        account_id: col(row, 1)?,
        amount: col(row, 2)?,
        created_at: col(row, 3)?,
    })
}

fn transfer_from_row(row: &Row) -> Result<Transfer, StorageError> {
    Ok(Transfer {
        id: col(row, 0)?,
        from_account_id: col(row, 1)?,
        to_account_id: col(row, 2)?,
        amount: col(row, 3)?,
        created_at: col(row, 4)?,
    })
}

fn user_from_row(row: &Row) -> Result<User, StorageError> {
    Ok(User {
        username: col(row, 0)?,
        hashed_password: col(row, 1)?,
        full_name: col(row, 2)?,
        email: col(row, 3)?,
        password_changed_at: col(row, 4)?,
        created_at: col(row, 5)?,
    })
}

// Statements shared by auto-committed calls and open transactions.

fn insert_entry(client: &mut impl GenericClient, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
    let row = client
        .query_one(
            &*format!("INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"),
            &[&arg.account_id, &arg.amount],
        )
        .map_err(pg_err)?;
    entry_from_row(&row)
}

fn insert_transfer(client: &mut impl GenericClient, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
    let row = client
        .query_one(
            &*format!(
                "INSERT INTO transfers (from_account_id, to_account_id, amount)
                 VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
            ),
            &[&arg.from_account_id, &arg.to_account_id, &arg.amount],
        )
        .map_err(pg_err)?;
    transfer_from_row(&row)
}

fn add_account_balance(client: &mut impl GenericClient, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
    client
        .query_opt(
            &*format!("UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"),
            &[&arg.amount, &arg.id],
        )
        .map_err(pg_err)?
        .ok_or_else(|| StorageError::not_found("account", arg.id))
        .and_then(|row| account_from_row(&row))
}

fn select_by_id<T>(
    client: &mut impl GenericClient,
    sql: &str,
    id: i64,
    entity: &'static str,
    from_row: fn(&Row) -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    client
        .query_opt(sql, &[&id])
        .map_err(pg_err)?
        .ok_or_else(|| StorageError::not_found(entity, id))
        .and_then(|row| from_row(&row))
}

fn collect<T>(rows: Vec<Row>, from_row: fn(&Row) -> Result<T, StorageError>) -> Result<Vec<T>, StorageError> {
    rows.iter().map(from_row).collect()
}

impl StorageBackend for PostgresStorage {
    fn create_account(&self, arg: &CreateAccountParams) -> Result<Account, StorageError> {
        let row = self
            .client()?
            .query_one(
                &*format!(
                    "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
                ),
                &[&arg.owner, &arg.balance, &arg.currency.code()],
            )
            .map_err(pg_err)?;
        account_from_row(&row)
    }

    fn get_account(&self, id: i64) -> Result<Account, StorageError> {
        select_by_id(
            &mut self.client()?.client,
            &*format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"),
            id,
            "account",
            account_from_row,
        )
    }

    fn list_accounts(&self, arg: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        check_page(arg.limit, arg.offset)?;
        let rows = self
            .client()?
            .query(
                &*format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"),
                &[&arg.owner, &arg.limit, &arg.offset],
            )
            .map_err(pg_err)?;
        collect(rows, account_from_row)
    }

    fn update_account(&self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        add_account_balance(&mut self.client()?.client, arg)
    }

    fn delete_account(&self, id: i64) -> Result<(), StorageError> {
        let deleted = self
            .client()?
            .execute("DELETE FROM accounts WHERE id = $1", &[&id])
            .map_err(pg_err)?;
        if deleted == 0 {
            return Err(StorageError::not_found("account", id));
        }
        Ok(())
    }

    fn create_entry(&self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        insert_entry(&mut self.client()?.client, arg)
    }

    fn get_entry(&self, id: i64) -> Result<Entry, StorageError> {
        select_by_id(
            &mut self.client()?.client,
            &*format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"),
            id,
            "entry",
            entry_from_row,
        )
    }

    fn list_entries(&self, arg: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        check_page(arg.limit, arg.offset)?;
        let rows = self
            .client()?
            .query(
                &*format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"),
                &[&arg.account_id, &arg.limit, &arg.offset],
            )
            .map_err(pg_err)?;
        collect(rows, entry_from_row)
    }

    fn create_transfer(&self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        insert_transfer(&mut self.client()?.client, arg)
    }

    fn get_transfer(&self, id: i64) -> Result<Transfer, StorageError> {
        select_by_id(
            &mut self.client()?.client,
            &*format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"),
            id,
            "transfer",
            transfer_from_row,
        )
    }

    fn list_transfers(&self, arg: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        check_page(arg.limit, arg.offset)?;
        let rows = self
            .client()?
            .query(
                &*format!(
                    "SELECT {TRANSFER_COLUMNS} FROM transfers
                     WHERE from_account_id = $1 OR to_account_id = $2
                     ORDER BY id LIMIT $3 OFFSET $4"
                ),
                &[&arg.from_account_id, &arg.to_account_id, &arg.limit, &arg.offset],
            )
            .map_err(pg_err)?;
        collect(rows, transfer_from_row)
    }

    fn create_user(&self, arg: &CreateUserParams) -> Result<User, StorageError> {
        let row = self
            .client()?
            .query_one(
                &*format!(
                    "INSERT INTO users (username, hashed_password, full_name, email, password_changed_at)
                     VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
                ),
                &[&arg.username, &arg.hashed_password, &arg.full_name, &arg.email, &PASSWORD_NEVER_CHANGED],
            )
            .map_err(pg_err)?;
        user_from_row(&row)
    }

    fn get_user(&self, username: &str) -> Result<User, StorageError> {
        self.client()?
            .query_opt(&*format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"), &[&username])
            .map_err(pg_err)?
            .ok_or_else(|| StorageError::not_found("user", username))
            .and_then(|row| user_from_row(&row))
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn LedgerTx + '_>, StorageError> {
        let mut conn = self.connection(ctx)?;
        ctx.check()?;
        conn.batch_execute("BEGIN").map_err(pg_err)?;
        let id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let watch = CancelWatch::spawn(ctx, conn.cancel_token(), id);
        let mut tx = PostgresTx { conn, id, ctx: ctx.clone(), watch, finished: false };

        // The server enforces the deadline on lock waits and statements.
        if let Some(left) = ctx.remaining() {
            tx.conn.batch_execute(&timeout_sql(left)).map_err(pg_err)?;
        }

        tracing::debug!(tx_id = id, "PostgreSQL transaction started");
        Ok(Box::new(tx))
    }
}

#[derive(Default)]
struct WatchState {
    stopped: bool,
    fired: bool,
}

/// Sends a server-side cancel for the transaction's running statement once
/// its context is cancelled, so a blocked row lock wait returns.
struct CancelWatch {
    state: Arc<Mutex<WatchState>>,
}

impl CancelWatch {
    fn spawn(ctx: &TxContext, token: CancelToken, tx_id: TransactionId) -> Self {
        let state = Arc::new(Mutex::new(WatchState::default()));
        let shared = state.clone();
        let ctx = ctx.clone();
        thread::spawn(move || loop {
            {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if state.stopped {
                    return;
                }
                if ctx.is_cancelled() {
                    state.fired = true;
                    match token.cancel_query(NoTls) {
                        Ok(()) => tracing::debug!(tx_id, "Cancelled running PostgreSQL statement"),
                        Err(e) => tracing::warn!(tx_id, error = %e, "PostgreSQL cancel request failed"),
                    }
                    return;
                }
            }
            thread::sleep(WATCH_INTERVAL);
        });
        Self { state }
    }

    /// Stops watching. Returns whether a cancel request was sent.
    fn stop(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stopped = true;
        state.fired
    }
}

/// An open transaction on one pooled connection.
pub struct PostgresTx {
    conn: PooledConnection<LedgerConnectionManager>,
    id: TransactionId,
    ctx: TxContext,
    watch: CancelWatch,
    finished: bool,
}

impl PostgresTx {
    /// A statement cancelled on the caller's behalf reports `Cancelled`
    /// rather than a timeout.
    fn interrupted(&self, err: StorageError) -> StorageError {
        match err {
            StorageError::DeadlineExceeded if self.ctx.is_cancelled() => StorageError::Cancelled,
            err => err,
        }
    }
}

impl LedgerTx for PostgresTx {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn create_transfer(&mut self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        insert_transfer(&mut self.conn.client, arg).map_err(|e| self.interrupted(e))
    }

    fn create_entry(&mut self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        insert_entry(&mut self.conn.client, arg).map_err(|e| self.interrupted(e))
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StorageError> {
        // NO KEY UPDATE leaves the row's key free for the KEY SHARE locks that
        // foreign-key checks on entries and transfers take.
        select_by_id(
            &mut self.conn.client,
            &*format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"),
            id,
            "account",
            account_from_row,
        )
        .map_err(|e| self.interrupted(e))
    }

    fn update_account(&mut self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        add_account_balance(&mut self.conn.client, arg).map_err(|e| self.interrupted(e))
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        if let Err(e) = self.conn.batch_execute("COMMIT") {
            if let Err(rollback) = self.conn.batch_execute("ROLLBACK") {
                tracing::warn!(tx_id = self.id, error = %rollback, "Rollback after failed PostgreSQL commit failed");
                self.conn.poisoned = true;
            }
            return Err(self.interrupted(pg_err(e)));
        }
        tracing::debug!(tx_id = self.id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        if let Err(e) = self.conn.batch_execute("ROLLBACK") {
            self.conn.poisoned = true;
            return Err(pg_err(e));
        }
        tracing::debug!(tx_id = self.id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresTx {
    fn drop(&mut self) {
        if !self.finished {
            match self.conn.batch_execute("ROLLBACK") {
                Ok(()) => tracing::debug!(tx_id = self.id, "PostgreSQL transaction dropped, rolled back"),
                Err(e) => {
                    tracing::warn!(tx_id = self.id, error = %e, "Rollback of dropped PostgreSQL transaction failed");
                    self.conn.poisoned = true;
                }
            }
        }
        // A late cancel request could hit the next borrower's statement.
        if self.watch.stop() {
            self.conn.poisoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstates_map_to_storage_errors() {
        let kind = |code: &SqlState| classify(code, "detail".to_string());
        assert!(matches!(kind(&SqlState::FOREIGN_KEY_VIOLATION), StorageError::ForeignKeyViolation(d) if d == "detail"));
        assert!(matches!(kind(&SqlState::UNIQUE_VIOLATION), StorageError::UniqueViolation(_)));
        assert!(matches!(kind(&SqlState::LOCK_NOT_AVAILABLE), StorageError::LockTimeout));
        assert!(matches!(kind(&SqlState::QUERY_CANCELED), StorageError::DeadlineExceeded));
        assert!(matches!(kind(&SqlState::T_R_DEADLOCK_DETECTED), StorageError::Deadlock(_)));
        assert!(matches!(kind(&SqlState::NO_ACTIVE_SQL_TRANSACTION), StorageError::NoActiveTransaction));
        assert!(matches!(kind(&SqlState::SYNTAX_ERROR), StorageError::Other(_)));
    }

    #[test]
    fn timeouts_follow_the_deadline() {
        assert_eq!(
            timeout_sql(Duration::from_millis(1500)),
            "SET LOCAL lock_timeout = '1500ms'; SET LOCAL statement_timeout = '1500ms'"
        );
        // Zero would disable the server-side timeout.
        assert_eq!(
            timeout_sql(Duration::from_micros(10)),
            "SET LOCAL lock_timeout = '1ms'; SET LOCAL statement_timeout = '1ms'"
        );
    }

    #[test]
    fn watch_reports_whether_it_fired() {
        let state = Arc::new(Mutex::new(WatchState::default()));
        let watch = CancelWatch { state: state.clone() };
        assert!(!watch.stop());
        assert!(state.lock().unwrap().stopped);

        state.lock().unwrap().fired = true;
        assert!(watch.stop());
    }
}
