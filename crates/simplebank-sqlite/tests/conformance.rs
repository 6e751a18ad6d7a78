use simplebank_sqlite::SqliteStorage;

simplebank_core::storage_conformance_tests!(SqliteStorage::new(":memory:").unwrap());
