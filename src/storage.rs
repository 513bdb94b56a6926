use std::sync::Arc;

use crate::{
    config::{Backend, DbDriver, StorageConfig},
    file_storage::FileStorage,
    postgres_storage::PostgresStorage,
    sqlite_storage::SqliteStorage,
};

// Re-export core storage types so engines and callers share one path
pub use hbnb_core::storage::{storage_key, Storage, StorageError};

/// Builds the engine selected by `config` and loads its durable state.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match config.backend {
        Backend::File => Arc::new(FileStorage::new(&config.file.path)),
        Backend::Db => match config.database.driver {
            DbDriver::Sqlite => Arc::new(SqliteStorage::new(&config.database.path, config.is_test())?),
            DbDriver::Postgres => Arc::new(PostgresStorage::new(
                &config.database.connection_string(),
                config.is_test(),
            )?),
        },
    };
    storage.reload()?;
    tracing::info!(backend = %config.backend, "Storage opened");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbnb_core::{Model, State};
    use tempfile::tempdir;

    #[test]
    fn test_open_file_storage_loads_saved_state() {
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.file.path = dir.path().join("file.json").to_string_lossy().into_owned();

        let storage = open_storage(&config).unwrap();
        let state = State::create(storage.as_ref()).unwrap();
        storage.save().unwrap();

        let reopened = open_storage(&config).unwrap();
        assert!(reopened.get("State", state.id()).unwrap().is_some());
    }

    #[test]
    fn test_open_sqlite_storage() {
        let mut config = StorageConfig::default();
        config.backend = Backend::Db;
        config.database.path = ":memory:".to_string();

        let storage = open_storage(&config).unwrap();
        assert_eq!(storage.count(None).unwrap(), 0);
    }

    #[test]
    fn test_open_file_storage_rejects_invalid_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        std::fs::write(&path, "not json").unwrap();
        let mut config = StorageConfig::default();
        config.file.path = path.to_string_lossy().into_owned();

        assert!(matches!(open_storage(&config), Err(StorageError::Serialization(_))));
    }
}
