use simplebank_memory::InMemoryStorage;

simplebank_core::storage_conformance_tests!(InMemoryStorage::new());
