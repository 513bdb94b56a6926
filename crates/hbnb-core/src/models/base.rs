use std::fmt::Display;

use serde_json::Value;
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use super::{FieldMap, ModelError};

/// Naive UTC instant with microsecond precision.
///
/// Rendered as `YYYY-MM-DDTHH:MM:SS.ffffff`, which is both the persisted
/// format and the only format accepted when parsing (a value without the
/// fractional part is also accepted and means `.000000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        let now = OffsetDateTime::now_utc();
        // truncate to microseconds
        let now = now.replace_nanosecond(now.microsecond() * 1_000).unwrap_or(now);
        Self(PrimitiveDateTime::new(now.date(), now.time()))
    }

    pub fn parse(s: &str) -> Option<Self> {
        PrimitiveDateTime::parse(
            s,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"),
        )
        .or_else(|_| {
            PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        })
        .ok()
        .map(Self)
    }

    pub fn as_datetime(&self) -> PrimitiveDateTime {
        self.0
    }
}

impl From<PrimitiveDateTime> for Timestamp {
    fn from(value: PrimitiveDateTime) -> Self {
        let truncated = value.replace_nanosecond(value.microsecond() * 1_000).unwrap_or(value);
        Self(truncated)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.0.date();
        let t = self.0.time();
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
            d.year(),
            d.month() as u8,
            d.day(),
            t.hour(),
            t.minute(),
            t.second(),
            t.microsecond()
        )
    }
}

/// Identity and timestamps shared by every entity.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseModel {
    id: String,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl Default for BaseModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseModel {
    /// Fresh identity, `created_at == updated_at == now`.
    pub fn new() -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Reads `id`, `created_at` and `updated_at` from a stored record.
    ///
    /// All three must be present and non-null; nothing is defaulted.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, ModelError> {
        let id = match fields.get("id") {
            None => return Err(ModelError::MissingField("id")),
            Some(Value::Null) => return Err(ModelError::NullField("id")),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(ModelError::InvalidField {
                    field: "id".to_string(),
                    reason: format!("expected a string, got {}", other),
                })
            }
        };

        let created_at = timestamp_field(fields, "created_at")?;
        let updated_at = timestamp_field(fields, "updated_at")?;
        if updated_at < created_at {
            return Err(ModelError::TimestampOrder { id });
        }

        Ok(Self {
            id,
            created_at,
            updated_at,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Advances `updated_at` to now. Never moves it below `created_at`.
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now().max(self.created_at);
    }

    pub(crate) fn write_fields(&self, fields: &mut FieldMap) {
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        fields.insert("created_at".to_string(), Value::String(self.created_at.to_string()));
        fields.insert("updated_at".to_string(), Value::String(self.updated_at.to_string()));
    }
}

fn timestamp_field(fields: &FieldMap, field: &'static str) -> Result<Timestamp, ModelError> {
    match fields.get(field) {
        None => Err(ModelError::MissingField(field)),
        Some(Value::Null) => Err(ModelError::NullField(field)),
        Some(Value::String(s)) => Timestamp::parse(s).ok_or_else(|| ModelError::InvalidTimestamp {
            field,
            value: s.clone(),
        }),
        Some(other) => Err(ModelError::InvalidTimestamp {
            field,
            value: other.to_string(),
        }),
    }
}
