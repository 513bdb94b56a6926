use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{BaseModel, Entity, EntityKind, Model};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    #[serde(skip)]
    pub(crate) base: BaseModel,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct City {
    #[serde(skip)]
    pub(crate) base: BaseModel,
    pub state_id: String,
    pub name: String,
}

/// A registered user. The password is only ever held as a SHA-256 hex digest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    #[serde(skip)]
    pub(crate) base: BaseModel,
    pub email: String,
    #[serde(rename = "password", skip_serializing)]
    pub(crate) password_hash: String,
    pub first_name: String,
    pub last_name: String,
}

impl User {
    pub fn set_password(&mut self, plain: &str) {
        self.password_hash = hash_password(plain);
    }

    pub fn verify_password(&self, plain: &str) -> bool {
        if self.password_hash.is_empty() {
            return false;
        }
        hash_password(plain)
            .as_bytes()
            .ct_eq(self.password_hash.as_bytes())
            .into()
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }
}

fn hash_password(plain: &str) -> String {
    format!("{:x}", Sha256::digest(plain.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Place {
    #[serde(skip)]
    pub(crate) base: BaseModel,
    pub city_id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub number_rooms: i32,
    pub number_bathrooms: i32,
    pub max_guest: i32,
    pub price_by_night: i32,
    pub latitude: f64,
    pub longitude: f64,
    /// Kept as given by the file engine. The relational engines store one
    /// link per amenity, so a repeated id comes back once.
    pub amenity_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Review {
    #[serde(skip)]
    pub(crate) base: BaseModel,
    pub place_id: String,
    pub user_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Amenity {
    #[serde(skip)]
    pub(crate) base: BaseModel,
    pub name: String,
}

macro_rules! impl_model {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Model for $ty {
                const KIND: EntityKind = EntityKind::$ty;

                fn base(&self) -> &BaseModel {
                    &self.base
                }

                fn touch(&mut self) {
                    self.base.touch();
                }
            }

            impl From<$ty> for Entity {
                fn from(value: $ty) -> Self {
                    Entity::$ty(value)
                }
            }

            impl TryFrom<Entity> for $ty {
                type Error = Entity;

                fn try_from(value: Entity) -> Result<Self, Self::Error> {
                    match value {
                        Entity::$ty(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_model!(Amenity, City, Place, Review, State, User);
