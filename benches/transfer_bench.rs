use criterion::{black_box, criterion_group, criterion_main, Criterion};
use simplebank_core::{
    transfer_tx, Account, CreateAccountParams, CreateUserParams, Currency, StorageBackend, TransferTxParams,
    TxContext,
};
use simplebank_memory::InMemoryStorage;
use simplebank_sqlite::SqliteStorage;

fn seed(store: &dyn StorageBackend) -> (Account, Account) {
    let mut accounts = ["alice", "bob"].into_iter().map(|owner| {
        store
            .create_user(&CreateUserParams {
                username: owner.to_string(),
                hashed_password: "x".to_string(),
                full_name: owner.to_string(),
                email: format!("{owner}@example.com"),
            })
            .unwrap();
        store
            .create_account(&CreateAccountParams {
                owner: owner.to_string(),
                balance: 1_000_000_000,
                currency: Currency::Usd,
            })
            .unwrap()
    });
    (accounts.next().unwrap(), accounts.next().unwrap())
}

fn bench_transfer(c: &mut Criterion, name: &str, store: &dyn StorageBackend) {
    let (a, b) = seed(store);
    let ctx = TxContext::background();
    let mut forward = true;
    c.bench_function(name, |bench| {
        bench.iter(|| {
            let (from, to) = if forward { (a.id, b.id) } else { (b.id, a.id) };
            forward = !forward;
            let params = TransferTxParams { from_account_id: from, to_account_id: to, amount: 1 };
            black_box(transfer_tx(store, &ctx, &params).unwrap());
        })
    });
}

fn bench_memory_transfer(c: &mut Criterion) {
    bench_transfer(c, "transfer_tx_memory", &InMemoryStorage::new());
}

fn bench_sqlite_transfer(c: &mut Criterion) {
    bench_transfer(c, "transfer_tx_sqlite", &SqliteStorage::new(":memory:").unwrap());
}

criterion_group!(benches, bench_memory_transfer, bench_sqlite_transfer);
criterion_main!(benches);
