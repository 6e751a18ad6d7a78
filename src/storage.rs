use std::sync::Arc;

use simplebank_core::{StorageBackend, StorageError};
use simplebank_memory::InMemoryStorage;
use simplebank_postgres::PostgresStorage;
use simplebank_sqlite::SqliteStorage;

use crate::config::{Backend, DatabaseConfig};

/// Opens the backend named in the `[database]` section.
pub fn open(config: &DatabaseConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let store: Arc<dyn StorageBackend> = match config.backend {
        Backend::Memory => Arc::new(InMemoryStorage::new()),
        Backend::Sqlite => Arc::new(SqliteStorage::new(&config.url)?),
        Backend::Postgres => Arc::new(PostgresStorage::new(&config.url, config.max_connections)?),
    };
    tracing::info!(backend = ?config.backend, "Storage backend ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_sqlite_in_memory() {
        let config = DatabaseConfig {
            backend: Backend::Sqlite,
            url: ":memory:".to_string(),
            max_connections: 1,
        };
        let store = open(&config).unwrap();
        assert!(store.get_user("nobody").unwrap_err().is_not_found());
    }

    #[test]
    fn bad_postgres_url_is_a_connection_error() {
        let config = DatabaseConfig {
            backend: Backend::Postgres,
            url: "not a url ===".to_string(),
            max_connections: 1,
        };
        assert!(matches!(open(&config), Err(StorageError::Connection(_))));
    }
}
