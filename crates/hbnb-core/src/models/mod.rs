use std::{fmt::Display, str::FromStr};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::storage::{storage_key, Storage, StorageError};

mod base;
mod entities;

pub use base::{BaseModel, Timestamp};
pub use entities::{Amenity, City, Place, Review, State, User};

/// Field name → value, the shape of a serialized entity.
pub type FieldMap = serde_json::Map<String, Value>;

/// Reserved field carrying the concrete type name of a serialized entity.
pub const TYPE_TAG: &str = "__class__";

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("field must not be null: {0}")]
    NullField(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("updated_at precedes created_at for {id}")]
    TimestampOrder { id: String },
    #[error("unknown entity type: {0}")]
    UnknownKind(String),
}

/// The closed set of entity types the storage engines understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Amenity,
    City,
    Place,
    Review,
    State,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Amenity,
        EntityKind::City,
        EntityKind::Place,
        EntityKind::Review,
        EntityKind::State,
        EntityKind::User,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Amenity => "Amenity",
            EntityKind::City => "City",
            EntityKind::Place => "Place",
            EntityKind::Review => "Review",
            EntityKind::State => "State",
            EntityKind::User => "User",
        }
    }

    /// Looks up a type by its tag. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ModelError::UnknownKind(s.to_string()))
    }
}

/// Behaviour shared by the six entity types.
///
/// `create`, `save` and `delete` are the lifecycle hooks callers use; they
/// route through whichever `Storage` is active without knowing which one.
pub trait Model: Clone + Default + Serialize + DeserializeOwned + Into<Entity> {
    const KIND: EntityKind;

    fn base(&self) -> &BaseModel;

    /// Stamps `updated_at` with the current time.
    fn touch(&mut self);

    fn id(&self) -> &str {
        self.base().id()
    }

    fn key(&self) -> String {
        storage_key(Self::KIND, self.id())
    }

    /// Builds a fresh instance and registers it with `storage` as new.
    fn create(storage: &dyn Storage) -> Result<Self, StorageError> {
        let model = Self::default();
        storage.new(&model.clone().into())?;
        Ok(model)
    }

    /// Stamps `updated_at`, refreshes the stored copy and persists everything
    /// pending in `storage`.
    fn save(&mut self, storage: &dyn Storage) -> Result<(), StorageError> {
        self.touch();
        storage.new(&self.clone().into())?;
        storage.save()
    }

    fn delete(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        storage.delete(Some(&self.clone().into()))
    }
}

fn reconstruct<T: Model>(fields: &FieldMap) -> Result<Entity, ModelError> {
    let base = BaseModel::from_fields(fields)?;
    let model: T = serde_json::from_value(Value::Object(fields.clone())).map_err(|e| {
        ModelError::InvalidField {
            field: T::KIND.name().to_string(),
            reason: e.to_string(),
        }
    })?;
    let mut entity: Entity = model.into();
    *entity.base_mut() = base;
    Ok(entity)
}

/// Any stored object, tagged with its concrete type.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Amenity(Amenity),
    City(City),
    Place(Place),
    Review(Review),
    State(State),
    User(User),
}

impl Entity {
    /// Rebuilds an entity of `kind` from its serialized fields.
    ///
    /// Identity and timestamps are taken verbatim; the type tag is ignored.
    /// The result is not registered with any storage.
    pub fn from_fields(kind: EntityKind, fields: &FieldMap) -> Result<Self, ModelError> {
        match kind {
            EntityKind::Amenity => reconstruct::<Amenity>(fields),
            EntityKind::City => reconstruct::<City>(fields),
            EntityKind::Place => reconstruct::<Place>(fields),
            EntityKind::Review => reconstruct::<Review>(fields),
            EntityKind::State => reconstruct::<State>(fields),
            EntityKind::User => reconstruct::<User>(fields),
        }
    }

    /// Rebuilds an entity from a record carrying its own type tag.
    pub fn from_record(fields: &FieldMap) -> Result<Self, ModelError> {
        let tag = match fields.get(TYPE_TAG) {
            Some(Value::String(tag)) => tag.as_str(),
            Some(_) => {
                return Err(ModelError::InvalidField {
                    field: TYPE_TAG.to_string(),
                    reason: "expected a string".to_string(),
                })
            }
            None => return Err(ModelError::MissingField(TYPE_TAG)),
        };
        let kind = tag.parse::<EntityKind>()?;
        Self::from_fields(kind, fields)
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Amenity(_) => EntityKind::Amenity,
            Entity::City(_) => EntityKind::City,
            Entity::Place(_) => EntityKind::Place,
            Entity::Review(_) => EntityKind::Review,
            Entity::State(_) => EntityKind::State,
            Entity::User(_) => EntityKind::User,
        }
    }

    pub fn base(&self) -> &BaseModel {
        match self {
            Entity::Amenity(m) => &m.base,
            Entity::City(m) => &m.base,
            Entity::Place(m) => &m.base,
            Entity::Review(m) => &m.base,
            Entity::State(m) => &m.base,
            Entity::User(m) => &m.base,
        }
    }

    fn base_mut(&mut self) -> &mut BaseModel {
        match self {
            Entity::Amenity(m) => &mut m.base,
            Entity::City(m) => &mut m.base,
            Entity::Place(m) => &mut m.base,
            Entity::Review(m) => &mut m.base,
            Entity::State(m) => &mut m.base,
            Entity::User(m) => &mut m.base,
        }
    }

    pub fn id(&self) -> &str {
        self.base().id()
    }

    /// Composite storage key, `"<Type>.<id>"`.
    pub fn key(&self) -> String {
        storage_key(self.kind(), self.id())
    }

    pub fn touch(&mut self) {
        self.base_mut().touch();
    }

    /// Checks the values that have no faithful serialized form. JSON has no
    /// NaN or infinity, so a Place with a non-finite coordinate is rejected
    /// before any engine accepts it.
    pub fn validate(&self) -> Result<(), ModelError> {
        if let Entity::Place(place) = self {
            for (field, value) in [("latitude", place.latitude), ("longitude", place.longitude)] {
                if !value.is_finite() {
                    return Err(ModelError::InvalidField {
                        field: field.to_string(),
                        reason: format!("{} is not a finite number", value),
                    });
                }
            }
        }
        Ok(())
    }

    /// Field map of this entity with timestamps as ISO-8601 strings and the
    /// type tag added.
    ///
    /// The user's password digest is written under `password` only when
    /// `for_persistence` is set, so it reaches durable storage but is not
    /// exposed otherwise.
    pub fn to_serializable(&self, for_persistence: bool) -> FieldMap {
        let value = match self {
            Entity::Amenity(m) => serde_json::to_value(m),
            Entity::City(m) => serde_json::to_value(m),
            Entity::Place(m) => serde_json::to_value(m),
            Entity::Review(m) => serde_json::to_value(m),
            Entity::State(m) => serde_json::to_value(m),
            Entity::User(m) => serde_json::to_value(m),
        };
        let mut fields = match value {
            Ok(Value::Object(fields)) => fields,
            // plain structs of strings and numbers always serialize to objects
            _ => FieldMap::new(),
        };

        self.base().write_fields(&mut fields);
        if let (Entity::User(user), true) = (self, for_persistence) {
            fields.insert("password".to_string(), Value::String(user.password_hash.clone()));
        }
        fields.insert(TYPE_TAG.to_string(), Value::String(self.kind().name().to_string()));
        fields
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields = self.to_serializable(false);
        fields.remove(TYPE_TAG);
        write!(f, "[{}] ({}) {}", self.kind(), self.id(), Value::Object(fields))
    }
}
