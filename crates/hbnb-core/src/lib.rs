//! Core types and traits for hbnb storage engines.
//!
//! This crate provides the entity model (`BaseModel` and the six concrete
//! entity types), the type-tag registry used to rebuild entities from stored
//! records, and the `Storage` trait every engine implements.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    Amenity, BaseModel, City, Entity, EntityKind, FieldMap, Model, ModelError, Place, Review,
    State, Timestamp, User, TYPE_TAG,
};
pub use storage::{storage_key, Storage, StorageError};
