use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::{Entity, EntityKind, ModelError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    Model(#[from] ModelError),
    #[error("database error: {0}")]
    Database(String),
    #[error("{0}")]
    Other(String),
}

/// Composite key of a stored entity, `"<Type>.<id>"`.
pub fn storage_key(kind: EntityKind, id: &str) -> String {
    format!("{}.{}", kind.name(), id)
}

/// The contract every storage engine honours.
///
/// Type names are the entity tags (`"City"`, `"User"`, ...). A name outside
/// the registry is never an error on the read paths: it matches nothing.
pub trait Storage: Send + Sync {
    /// Every live entity keyed by `"<Type>.<id>"`, optionally limited to one type.
    fn all(&self, kind: Option<&str>) -> Result<BTreeMap<String, Entity>, StorageError>;

    /// Exact lookup by type name and id.
    fn get(&self, kind: &str, id: &str) -> Result<Option<Entity>, StorageError>;

    /// Registers `entity` as pending. Registering the same id again replaces
    /// the pending copy. Entities that fail [`Entity::validate`] are refused.
    ///
    /// The relational engines collapse repeated `Place.amenity_ids`; the file
    /// engine keeps the list as given.
    fn new(&self, entity: &Entity) -> Result<(), StorageError>;

    /// Durably persists everything registered so far.
    fn save(&self) -> Result<(), StorageError>;

    /// Removes `entity` from the live set. `None` is a no-op.
    ///
    /// When the removal becomes durable is engine specific: the file engine
    /// writes it out immediately, the relational engines at the next `save`.
    fn delete(&self, entity: Option<&Entity>) -> Result<(), StorageError>;

    fn count(&self, kind: Option<&str>) -> Result<usize, StorageError>;

    /// Repopulates the live set from durable state, discarding anything not
    /// yet saved.
    fn reload(&self) -> Result<(), StorageError>;

    /// Releases the engine's working state.
    fn close(&self) -> Result<(), StorageError>;
}
