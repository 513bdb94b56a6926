pub mod config;
pub mod file_storage;
pub mod postgres_storage;
pub(crate) mod relational;
pub mod sqlite_storage;
pub mod storage;

pub use hbnb_core::{
    Amenity, BaseModel, City, Entity, EntityKind, FieldMap, Model, ModelError, Place, Review, State,
    Timestamp, User, TYPE_TAG,
};
pub use storage::{open_storage, Storage, StorageError};
