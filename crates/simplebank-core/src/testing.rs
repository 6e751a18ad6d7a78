//! Behaviour every storage backend must share.
//!
//! Backend crates run the whole suite with [`storage_conformance_tests!`](crate::storage_conformance_tests).
//! Fixtures only ever touch rows they created, so the suite can run against a
//! shared database.

use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use crate::{
    context::TxContext,
    models::{
        read::{ListAccountsParams, ListEntriesParams, ListTransfersParams, TransferTxResult},
        write::{
            CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
            TransferTxParams, UpdateAccountParams,
        },
        Account, Currency, Entry, Transfer, User, PASSWORD_NEVER_CHANGED,
    },
    random::RandomGen,
    storage::{ErrorKind, LedgerTx, StorageBackend, StorageError, TransactionId},
    transfer::transfer_tx,
};

/// Expands every shared test for one backend. An optional bracketed list of
/// attributes is applied to each generated test:
///
/// ```ignore
/// storage_conformance_tests!(InMemoryStorage::new());
/// storage_conformance_tests!([#[ignore = "requires PostgreSQL"]] connect());
/// ```
#[macro_export]
macro_rules! storage_conformance_tests {
    (@test [$($meta:tt)*] $factory:expr; $name:ident) => {
        #[test]
        $($meta)*
        fn $name() {
            let store = $factory;
            let mut gen = $crate::random::RandomGen::from_entropy();
            $crate::testing::$name(&store, &mut gen);
        }
    };
    (@tests $metas:tt $factory:expr; $($name:ident),* $(,)?) => {
        $(
            $crate::storage_conformance_tests!(@test $metas $factory; $name);
        )*
    };
    ([$($meta:tt)*] $factory:expr) => {
        $crate::storage_conformance_tests!(@tests [$($meta)*] $factory;
            create_and_get_user,
            duplicate_username_is_unique_violation,
            create_and_get_account,
            account_owner_must_exist,
            one_account_per_owner_and_currency,
            missing_rows_are_not_found,
            update_account_adds_delta,
            delete_account,
            delete_referenced_account_is_rejected,
            list_accounts_by_owner,
            create_and_get_entry,
            entry_account_must_exist,
            list_entries_paginates,
            create_and_get_transfer,
            list_transfers_paginates,
            transfer_example_scenario,
            transfer_reconciles_balances_with_entries,
            concurrent_transfers_same_direction,
            concurrent_transfers_both_directions,
            failed_balance_update_rolls_back,
            transfer_to_missing_account_changes_nothing,
            cancelled_transfer_changes_nothing,
            blocked_transfer_gives_up_at_deadline,
            cancel_interrupts_blocked_transfer,
        );
    };
    ($factory:expr) => {
        $crate::storage_conformance_tests!([] $factory);
    };
}

// ---- fixtures -------------------------------------------------------------

pub fn create_random_user(store: &dyn StorageBackend, gen: &mut RandomGen) -> User {
    let arg = CreateUserParams {
        username: gen.owner(),
        hashed_password: gen.string(32),
        full_name: gen.owner(),
        email: gen.email(),
    };
    let user = store.create_user(&arg).unwrap();

    assert_eq!(user.username, arg.username);
    assert_eq!(user.hashed_password, arg.hashed_password);
    assert_eq!(user.full_name, arg.full_name);
    assert_eq!(user.email, arg.email);
    assert_eq!(user.password_changed_at, PASSWORD_NEVER_CHANGED);
    user
}

pub fn create_account_with_balance(store: &dyn StorageBackend, gen: &mut RandomGen, balance: i64) -> Account {
    let user = create_random_user(store, gen);
    let arg = CreateAccountParams {
        owner: user.username,
        balance,
        currency: gen.currency(),
    };
    let account = store.create_account(&arg).unwrap();

    assert_eq!(account.owner, arg.owner);
    assert_eq!(account.balance, arg.balance);
    assert_eq!(account.currency, arg.currency);
    assert!(account.id > 0);
    account
}

pub fn create_random_account(store: &dyn StorageBackend, gen: &mut RandomGen) -> Account {
    let balance = gen.money();
    create_account_with_balance(store, gen, balance)
}

pub fn create_random_entry(store: &dyn StorageBackend, gen: &mut RandomGen, account: &Account) -> Entry {
    let arg = CreateEntryParams { account_id: account.id, amount: gen.money() };
    let entry = store.create_entry(&arg).unwrap();

    assert_eq!(entry.account_id, arg.account_id);
    assert_eq!(entry.amount, arg.amount);
    assert!(entry.id > 0);
    entry
}

pub fn create_random_transfer(store: &dyn StorageBackend, gen: &mut RandomGen, from: &Account, to: &Account) -> Transfer {
    let arg = CreateTransferParams {
        from_account_id: from.id,
        to_account_id: to.id,
        amount: gen.int(1, 1000),
    };
    let transfer = store.create_transfer(&arg).unwrap();

    assert_eq!(transfer.from_account_id, arg.from_account_id);
    assert_eq!(transfer.to_account_id, arg.to_account_id);
    assert_eq!(transfer.amount, arg.amount);
    assert!(transfer.id > 0);
    transfer
}

fn all_entries(store: &dyn StorageBackend, account_id: i64) -> Vec<Entry> {
    store
        .list_entries(&ListEntriesParams { account_id, limit: 1000, offset: 0 })
        .unwrap()
}

fn all_transfers(store: &dyn StorageBackend, a: i64, b: i64) -> Vec<Transfer> {
    store
        .list_transfers(&ListTransfersParams { from_account_id: a, to_account_id: b, limit: 1000, offset: 0 })
        .unwrap()
}

fn balance(store: &dyn StorageBackend, id: i64) -> i64 {
    store.get_account(id).unwrap().balance
}

fn transfer_params(from: &Account, to: &Account, amount: i64) -> TransferTxParams {
    TransferTxParams { from_account_id: from.id, to_account_id: to.id, amount }
}

// ---- users ----------------------------------------------------------------

pub fn create_and_get_user(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let user = create_random_user(store, gen);
    let fetched = store.get_user(&user.username).unwrap();
    assert_eq!(fetched, user);
}

pub fn duplicate_username_is_unique_violation(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let user = create_random_user(store, gen);
    let err = store
        .create_user(&CreateUserParams {
            username: user.username.clone(),
            hashed_password: gen.string(32),
            full_name: gen.owner(),
            email: gen.email(),
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::UniqueViolation(_)), "{err:?}");
}

// ---- accounts -------------------------------------------------------------

pub fn create_and_get_account(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    let fetched = store.get_account(account.id).unwrap();
    assert_eq!(fetched, account);
}

pub fn account_owner_must_exist(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let err = store
        .create_account(&CreateAccountParams { owner: gen.owner(), balance: 0, currency: Currency::Usd })
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");
}

pub fn one_account_per_owner_and_currency(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    let err = store
        .create_account(&CreateAccountParams {
            owner: account.owner.clone(),
            balance: 0,
            currency: account.currency,
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::UniqueViolation(_)), "{err:?}");
}

pub fn missing_rows_are_not_found(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let missing = i64::MAX - gen.int(0, 1000);
    assert_eq!(store.get_account(missing).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.get_entry(missing).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.get_transfer(missing).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.get_user(&gen.owner()).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        store.update_account(&UpdateAccountParams { id: missing, amount: 1 }).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(store.delete_account(missing).unwrap_err().kind(), ErrorKind::NotFound);
}

pub fn update_account_adds_delta(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    let delta = gen.int(-500, 500);
    let updated = store.update_account(&UpdateAccountParams { id: account.id, amount: delta }).unwrap();

    assert_eq!(updated.id, account.id);
    assert_eq!(updated.owner, account.owner);
    assert_eq!(updated.currency, account.currency);
    assert_eq!(updated.balance, account.balance + delta);
    assert_eq!(balance(store, account.id), account.balance + delta);
}

pub fn delete_account(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    store.delete_account(account.id).unwrap();
    assert!(store.get_account(account.id).unwrap_err().is_not_found());
}

pub fn delete_referenced_account_is_rejected(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    create_random_entry(store, gen, &account);

    let err = store.delete_account(account.id).unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");
    assert_eq!(store.get_account(account.id).unwrap(), account);
}

pub fn list_accounts_by_owner(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let user = create_random_user(store, gen);
    let mut created = Vec::new();
    for currency in Currency::ALL {
        created.push(
            store
                .create_account(&CreateAccountParams { owner: user.username.clone(), balance: 0, currency })
                .unwrap(),
        );
    }
    // Someone else's account must not show up.
    create_random_account(store, gen);

    let first = store
        .list_accounts(&ListAccountsParams { owner: user.username.clone(), limit: 2, offset: 0 })
        .unwrap();
    let rest = store
        .list_accounts(&ListAccountsParams { owner: user.username.clone(), limit: 2, offset: 2 })
        .unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(rest.len(), 1);
    let listed: Vec<Account> = first.into_iter().chain(rest).collect();
    assert_eq!(listed, created);
}

// ---- entries --------------------------------------------------------------

pub fn create_and_get_entry(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    let entry = create_random_entry(store, gen, &account);
    let fetched = store.get_entry(entry.id).unwrap();
    assert_eq!(fetched, entry);
}

pub fn entry_account_must_exist(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let missing = i64::MAX - gen.int(0, 1000);
    let err = store.create_entry(&CreateEntryParams { account_id: missing, amount: 10 }).unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation(_)), "{err:?}");
}

pub fn list_entries_paginates(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let account = create_random_account(store, gen);
    let other = create_random_account(store, gen);
    for _ in 0..10 {
        create_random_entry(store, gen, &account);
        create_random_entry(store, gen, &other);
    }

    let page = |offset| {
        store
            .list_entries(&ListEntriesParams { account_id: account.id, limit: 5, offset })
            .unwrap()
    };
    let first = page(0);
    let second = page(5);

    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);
    assert!(first.iter().chain(&second).all(|e| e.account_id == account.id));
    let first_ids: HashSet<i64> = first.iter().map(|e| e.id).collect();
    assert!(second.iter().all(|e| !first_ids.contains(&e.id)));
    assert!(page(10).is_empty());
}

// ---- transfers ------------------------------------------------------------

pub fn create_and_get_transfer(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let from = create_random_account(store, gen);
    let to = create_random_account(store, gen);
    let transfer = create_random_transfer(store, gen, &from, &to);
    let fetched = store.get_transfer(transfer.id).unwrap();
    assert_eq!(fetched, transfer);
}

pub fn list_transfers_paginates(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_random_account(store, gen);
    let b = create_random_account(store, gen);
    let outsider = create_random_account(store, gen);
    for i in 0..10 {
        create_random_transfer(store, gen, &a, &b);
        if i % 3 == 0 {
            // Neither leaves `a` nor arrives at `b`.
            create_random_transfer(store, gen, &b, &a);
            create_random_transfer(store, gen, &outsider, &a);
        }
    }

    let page = |offset| {
        store
            .list_transfers(&ListTransfersParams { from_account_id: a.id, to_account_id: b.id, limit: 5, offset })
            .unwrap()
    };
    let first = page(0);
    let second = page(5);

    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);
    for t in first.iter().chain(&second) {
        assert!(t.from_account_id == a.id || t.to_account_id == b.id, "{t:?}");
    }
    let first_ids: HashSet<i64> = first.iter().map(|t| t.id).collect();
    assert!(second.iter().all(|t| !first_ids.contains(&t.id)));
    assert!(page(10).is_empty());
}

pub fn transfer_example_scenario(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 100);
    let b = create_account_with_balance(store, gen, 50);

    let result = transfer_tx(store, &TxContext::background(), &transfer_params(&a, &b, 30)).unwrap();

    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(balance(store, a.id), 70);
    assert_eq!(balance(store, b.id), 80);

    assert_eq!(store.get_transfer(result.transfer.id).unwrap(), result.transfer);
    assert_eq!(all_transfers(store, a.id, b.id), vec![result.transfer.clone()]);
    let a_entries = all_entries(store, a.id);
    let b_entries = all_entries(store, b.id);
    assert_eq!(a_entries.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![-30]);
    assert_eq!(b_entries.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![30]);
}

fn check_transfer_result(store: &dyn StorageBackend, arg: &TransferTxParams, result: &TransferTxResult) {
    let transfer = &result.transfer;
    assert!(transfer.id > 0);
    assert_eq!(transfer.from_account_id, arg.from_account_id);
    assert_eq!(transfer.to_account_id, arg.to_account_id);
    assert_eq!(transfer.amount, arg.amount);
    assert_eq!(store.get_transfer(transfer.id).unwrap(), *transfer);

    assert_eq!(result.from_entry.account_id, arg.from_account_id);
    assert_eq!(result.from_entry.amount, -arg.amount);
    assert_eq!(store.get_entry(result.from_entry.id).unwrap(), result.from_entry);

    assert_eq!(result.to_entry.account_id, arg.to_account_id);
    assert_eq!(result.to_entry.amount, arg.amount);
    assert_eq!(store.get_entry(result.to_entry.id).unwrap(), result.to_entry);

    assert_eq!(result.from_account.id, arg.from_account_id);
    assert_eq!(result.to_account.id, arg.to_account_id);
}

pub fn transfer_reconciles_balances_with_entries(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 10_000);
    let b = create_account_with_balance(store, gen, 10_000);

    for _ in 0..6 {
        let (from, to) = if gen.int(0, 1) == 0 { (&a, &b) } else { (&b, &a) };
        let arg = transfer_params(from, to, gen.int(1, 500));
        let before_from = balance(store, from.id);
        let before_to = balance(store, to.id);

        let result = transfer_tx(store, &TxContext::background(), &arg).unwrap();
        check_transfer_result(store, &arg, &result);
        assert_eq!(result.from_account.balance, before_from - arg.amount);
        assert_eq!(result.to_account.balance, before_to + arg.amount);
    }

    for account in [&a, &b] {
        let entry_sum: i64 = all_entries(store, account.id).iter().map(|e| e.amount).sum();
        assert_eq!(balance(store, account.id), account.balance + entry_sum);
    }
}

pub fn concurrent_transfers_same_direction(store: &dyn StorageBackend, gen: &mut RandomGen) {
    const N: i64 = 5;
    let a = create_account_with_balance(store, gen, 1_000);
    let b = create_account_with_balance(store, gen, 1_000);
    let amount = 10;
    let arg = transfer_params(&a, &b, amount);
    let barrier = Arc::new(Barrier::new(N as usize));

    let results: Vec<Result<TransferTxResult, StorageError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|_| {
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    transfer_tx(store, &TxContext::background(), &arg)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen_multiples = HashSet::new();
    let mut transfer_ids = HashSet::new();
    let mut entry_ids = HashSet::new();
    for result in results {
        let result = result.unwrap();
        check_transfer_result(store, &arg, &result);
        assert!(transfer_ids.insert(result.transfer.id));
        assert!(entry_ids.insert(result.from_entry.id));
        assert!(entry_ids.insert(result.to_entry.id));

        // Each committed transfer observes the balances left by the ones before it.
        let moved = a.balance - result.from_account.balance;
        assert_eq!(moved, result.to_account.balance - b.balance);
        assert!(moved > 0 && moved % amount == 0);
        let k = moved / amount;
        assert!((1..=N).contains(&k));
        assert!(seen_multiples.insert(k), "two transfers observed the same balance");
    }

    assert_eq!(balance(store, a.id), a.balance - N * amount);
    assert_eq!(balance(store, b.id), b.balance + N * amount);
    assert_eq!(all_entries(store, a.id).len(), N as usize);
    assert_eq!(all_entries(store, b.id).len(), N as usize);
}

pub fn concurrent_transfers_both_directions(store: &dyn StorageBackend, gen: &mut RandomGen) {
    const N: usize = 10;
    let a = create_account_with_balance(store, gen, 1_000);
    let b = create_account_with_balance(store, gen, 1_000);
    let amount = 10;
    let barrier = Arc::new(Barrier::new(N));

    thread::scope(|s| {
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let barrier = barrier.clone();
                let arg = if i % 2 == 0 {
                    transfer_params(&a, &b, amount)
                } else {
                    transfer_params(&b, &a, amount)
                };
                s.spawn(move || {
                    barrier.wait();
                    // Bounded so a deadlock fails the test instead of hanging it.
                    transfer_tx(store, &TxContext::with_timeout(Duration::from_secs(30)), &arg)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    });

    assert_eq!(balance(store, a.id), a.balance);
    assert_eq!(balance(store, b.id), b.balance);
    // `from = a OR to = a` covers both directions.
    let transfers = all_transfers(store, a.id, a.id);
    assert_eq!(transfers.len(), N);
    assert_eq!(transfers.iter().filter(|t| t.from_account_id == a.id).count(), N / 2);
    assert_eq!(transfers.iter().filter(|t| t.from_account_id == b.id).count(), N / 2);
}

pub fn failed_balance_update_rolls_back(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 500);
    let b = create_account_with_balance(store, gen, 500);

    for fail_on in [a.id, b.id] {
        let faulty = FaultyStore::new(store, fail_on);
        let err = transfer_tx(&faulty, &TxContext::background(), &transfer_params(&a, &b, 40)).unwrap_err();
        assert!(matches!(err, StorageError::Connection(_)), "{err:?}");
    }

    assert_eq!(balance(store, a.id), 500);
    assert_eq!(balance(store, b.id), 500);
    assert!(all_entries(store, a.id).is_empty());
    assert!(all_entries(store, b.id).is_empty());
    assert!(all_transfers(store, a.id, b.id).is_empty());
}

pub fn transfer_to_missing_account_changes_nothing(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 500);
    let missing = i64::MAX - gen.int(0, 1000);

    for arg in [
        TransferTxParams { from_account_id: a.id, to_account_id: missing, amount: 25 },
        TransferTxParams { from_account_id: missing, to_account_id: a.id, amount: 25 },
    ] {
        let err = transfer_tx(store, &TxContext::background(), &arg).unwrap_err();
        assert!(
            matches!(err.kind(), ErrorKind::NotFound | ErrorKind::TransactionFailure),
            "{err:?}"
        );
    }

    assert_eq!(balance(store, a.id), 500);
    assert!(all_entries(store, a.id).is_empty());
    assert!(all_transfers(store, a.id, a.id).is_empty());
}

pub fn cancelled_transfer_changes_nothing(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 500);
    let b = create_account_with_balance(store, gen, 500);
    let ctx = TxContext::background();
    ctx.cancel();

    let err = transfer_tx(store, &ctx, &transfer_params(&a, &b, 40)).unwrap_err();
    assert!(matches!(err, StorageError::Cancelled), "{err:?}");
    assert_eq!(balance(store, a.id), 500);
    assert!(all_transfers(store, a.id, b.id).is_empty());
}

/// A transfer waiting on a row another transaction holds must give up once
/// its deadline passes, and leave nothing behind.
pub fn blocked_transfer_gives_up_at_deadline(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 500);
    let b = create_account_with_balance(store, gen, 500);

    let mut holder = store.begin(&TxContext::background()).unwrap();
    holder.get_account_for_update(a.id).unwrap();

    let outcome = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let ctx = TxContext::with_timeout(Duration::from_millis(300));
            transfer_tx(store, &ctx, &transfer_params(&a, &b, 40))
        });
        thread::sleep(Duration::from_millis(600));
        holder.rollback().unwrap();
        waiter.join().unwrap()
    });

    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionFailure, "{err:?}");
    assert_eq!(balance(store, a.id), 500);
    assert_eq!(balance(store, b.id), 500);
    assert!(all_transfers(store, a.id, b.id).is_empty());
}

pub fn cancel_interrupts_blocked_transfer(store: &dyn StorageBackend, gen: &mut RandomGen) {
    let a = create_account_with_balance(store, gen, 500);
    let b = create_account_with_balance(store, gen, 500);

    let mut holder = store.begin(&TxContext::background()).unwrap();
    holder.get_account_for_update(a.id).unwrap();

    // No deadline: only the cancel can end the wait.
    let ctx = TxContext::background();
    let outcome = thread::scope(|s| {
        let waiter = s.spawn(|| transfer_tx(store, &ctx, &transfer_params(&a, &b, 40)));
        thread::sleep(Duration::from_millis(200));
        ctx.cancel();
        waiter.join().unwrap()
    });
    holder.rollback().unwrap();

    let err = outcome.unwrap_err();
    assert!(matches!(err, StorageError::Cancelled), "{err:?}");
    assert_eq!(balance(store, a.id), 500);
    assert_eq!(balance(store, b.id), 500);
    assert!(all_transfers(store, a.id, b.id).is_empty());
}

// ---- fault injection ------------------------------------------------------

/// Delegates to a real backend, but any transaction it opens fails when it
/// updates the balance of `fail_update_on`.
pub struct FaultyStore<'a> {
    inner: &'a dyn StorageBackend,
    fail_update_on: i64,
}

impl<'a> FaultyStore<'a> {
    pub fn new(inner: &'a dyn StorageBackend, fail_update_on: i64) -> Self {
        Self { inner, fail_update_on }
    }
}

struct FaultyTx<'a> {
    inner: Box<dyn LedgerTx + 'a>,
    fail_update_on: i64,
}

impl LedgerTx for FaultyTx<'_> {
    fn id(&self) -> TransactionId {
        self.inner.id()
    }

    fn create_transfer(&mut self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        self.inner.create_transfer(arg)
    }

    fn create_entry(&mut self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.inner.create_entry(arg)
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account, StorageError> {
        self.inner.get_account_for_update(id)
    }

    fn update_account(&mut self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        if arg.id == self.fail_update_on {
            return Err(StorageError::Connection(format!("injected fault updating account {}", arg.id)));
        }
        self.inner.update_account(arg)
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.rollback()
    }
}

impl StorageBackend for FaultyStore<'_> {
    fn create_account(&self, arg: &CreateAccountParams) -> Result<Account, StorageError> {
        self.inner.create_account(arg)
    }

    fn get_account(&self, id: i64) -> Result<Account, StorageError> {
        self.inner.get_account(id)
    }

    fn list_accounts(&self, arg: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        self.inner.list_accounts(arg)
    }

    fn update_account(&self, arg: &UpdateAccountParams) -> Result<Account, StorageError> {
        self.inner.update_account(arg)
    }

    fn delete_account(&self, id: i64) -> Result<(), StorageError> {
        self.inner.delete_account(id)
    }

    fn create_entry(&self, arg: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.inner.create_entry(arg)
    }

    fn get_entry(&self, id: i64) -> Result<Entry, StorageError> {
        self.inner.get_entry(id)
    }

    fn list_entries(&self, arg: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        self.inner.list_entries(arg)
    }

    fn create_transfer(&self, arg: &CreateTransferParams) -> Result<Transfer, StorageError> {
        self.inner.create_transfer(arg)
    }

    fn get_transfer(&self, id: i64) -> Result<Transfer, StorageError> {
        self.inner.get_transfer(id)
    }

    fn list_transfers(&self, arg: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        self.inner.list_transfers(arg)
    }

    fn create_user(&self, arg: &CreateUserParams) -> Result<User, StorageError> {
        self.inner.create_user(arg)
    }

    fn get_user(&self, username: &str) -> Result<User, StorageError> {
        self.inner.get_user(username)
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn LedgerTx + '_>, StorageError> {
        Ok(Box::new(FaultyTx {
            inner: self.inner.begin(ctx)?,
            fail_update_on: self.fail_update_on,
        }))
    }
}
