//! Table layout and row mapping shared by the SQL engines.
//!
//! Every entity type owns one table whose columns mirror the entity's
//! persisted field map. Rows are rebuilt through the same reconstruction path
//! the file engine uses, so both backends agree on validation.

use std::collections::HashMap;

use hbnb_core::{Entity, EntityKind, FieldMap, StorageError};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnType {
    Text,
    Integer,
    Real,
}

pub(crate) struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    /// Parent table, for foreign key columns.
    pub references: Option<&'static str>,
}

pub(crate) struct Table {
    pub kind: EntityKind,
    pub name: &'static str,
    pub columns: &'static [Column],
}

const fn text(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Text, references: None }
}

const fn integer(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Integer, references: None }
}

const fn real(name: &'static str) -> Column {
    Column { name, ty: ColumnType::Real, references: None }
}

const fn parent(name: &'static str, table: &'static str) -> Column {
    Column { name, ty: ColumnType::Text, references: Some(table) }
}

/// Tables in creation order, parents before children.
pub(crate) const TABLES: [Table; 6] = [
    Table {
        kind: EntityKind::State,
        name: "states",
        columns: &[text("id"), text("created_at"), text("updated_at"), text("name")],
    },
    Table {
        kind: EntityKind::User,
        name: "users",
        columns: &[
            text("id"),
            text("created_at"),
            text("updated_at"),
            text("email"),
            text("password"),
            text("first_name"),
            text("last_name"),
        ],
    },
    Table {
        kind: EntityKind::Amenity,
        name: "amenities",
        columns: &[text("id"), text("created_at"), text("updated_at"), text("name")],
    },
    Table {
        kind: EntityKind::City,
        name: "cities",
        columns: &[
            text("id"),
            text("created_at"),
            text("updated_at"),
            parent("state_id", "states"),
            text("name"),
        ],
    },
    Table {
        kind: EntityKind::Place,
        name: "places",
        columns: &[
            text("id"),
            text("created_at"),
            text("updated_at"),
            parent("city_id", "cities"),
            parent("user_id", "users"),
            text("name"),
            text("description"),
            integer("number_rooms"),
            integer("number_bathrooms"),
            integer("max_guest"),
            integer("price_by_night"),
            real("latitude"),
            real("longitude"),
        ],
    },
    Table {
        kind: EntityKind::Review,
        name: "reviews",
        columns: &[
            text("id"),
            text("created_at"),
            text("updated_at"),
            parent("place_id", "places"),
            parent("user_id", "users"),
            text("text"),
        ],
    },
];

/// Link table holding `Place.amenity_ids`, in list order. The key is
/// `(place_id, amenity_id)`, so a repeated id is stored once.
pub(crate) const PLACE_AMENITY: &str = "place_amenity";

const AMENITY_IDS: &str = "amenity_ids";

pub(crate) fn table_for(kind: EntityKind) -> &'static Table {
    match kind {
        EntityKind::State => &TABLES[0],
        EntityKind::User => &TABLES[1],
        EntityKind::Amenity => &TABLES[2],
        EntityKind::City => &TABLES[3],
        EntityKind::Place => &TABLES[4],
        EntityKind::Review => &TABLES[5],
    }
}

/// Resolves a type name to its table; unknown names map to nothing.
pub(crate) fn table_named(kind: &str) -> Option<&'static Table> {
    EntityKind::from_name(kind).map(table_for)
}

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl Dialect {
    fn column_type(self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (_, ColumnType::Text) => "TEXT",
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (Dialect::Postgres, ColumnType::Integer) => "BIGINT",
            (Dialect::Sqlite, ColumnType::Real) => "REAL",
            (Dialect::Postgres, ColumnType::Real) => "DOUBLE PRECISION",
        }
    }

    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Postgres => format!("${}", index),
        }
    }
}

fn foreign_key(column: &str, parent: &str) -> String {
    format!(
        "FOREIGN KEY ({}) REFERENCES {}(id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED",
        column, parent
    )
}

/// `CREATE TABLE IF NOT EXISTS` for every table. Foreign keys are deferred so
/// referential integrity is checked when the session commits.
pub(crate) fn create_schema_sql(dialect: Dialect) -> String {
    let mut sql = String::new();
    for table in &TABLES {
        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let key = if c.name == "id" { " PRIMARY KEY" } else { " NOT NULL" };
                format!("{} {}{}", c.name, dialect.column_type(c.ty), key)
            })
            .collect();
        for column in table.columns {
            if let Some(parent) = column.references {
                defs.push(foreign_key(column.name, parent));
            }
        }
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
            table.name,
            defs.join(",\n    ")
        ));
    }
    sql.push_str(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    place_id TEXT NOT NULL,\n    amenity_id TEXT NOT NULL,\n    position {} NOT NULL,\n    PRIMARY KEY (place_id, amenity_id),\n    {},\n    {}\n);\n",
        PLACE_AMENITY,
        dialect.column_type(ColumnType::Integer),
        foreign_key("place_id", "places"),
        foreign_key("amenity_id", "amenities"),
    ));
    sql
}

/// Drops every table, children first.
pub(crate) fn drop_schema_sql(dialect: Dialect) -> String {
    let suffix = match dialect {
        Dialect::Sqlite => "",
        Dialect::Postgres => " CASCADE",
    };
    let mut sql = format!("DROP TABLE IF EXISTS {}{};\n", PLACE_AMENITY, suffix);
    for table in TABLES.iter().rev() {
        sql.push_str(&format!("DROP TABLE IF EXISTS {}{};\n", table.name, suffix));
    }
    sql
}

fn column_list(table: &Table) -> String {
    table.columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
}

pub(crate) fn select_all_sql(table: &Table) -> String {
    format!("SELECT {} FROM {} ORDER BY id", column_list(table), table.name)
}

pub(crate) fn select_by_id_sql(table: &Table, dialect: Dialect) -> String {
    format!(
        "SELECT {} FROM {} WHERE id = {}",
        column_list(table),
        table.name,
        dialect.placeholder(1)
    )
}

pub(crate) fn count_sql(table: &Table) -> String {
    format!("SELECT COUNT(*) FROM {}", table.name)
}

pub(crate) fn delete_sql(table: &Table, dialect: Dialect) -> String {
    format!("DELETE FROM {} WHERE id = {}", table.name, dialect.placeholder(1))
}

/// Insert-or-update keyed on `id`. An update never deletes the row, so child
/// rows are not cascaded away when a parent is saved again.
pub(crate) fn upsert_sql(table: &Table, dialect: Dialect) -> String {
    let placeholders: Vec<String> = (1..=table.columns.len()).map(|i| dialect.placeholder(i)).collect();
    let updates: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.name != "id")
        .map(|c| format!("{} = excluded.{}", c.name, c.name))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET {}",
        table.name,
        column_list(table),
        placeholders.join(", "),
        updates.join(", ")
    )
}

pub(crate) fn clear_links_sql(dialect: Dialect) -> String {
    format!("DELETE FROM {} WHERE place_id = {}", PLACE_AMENITY, dialect.placeholder(1))
}

pub(crate) fn insert_link_sql(dialect: Dialect) -> String {
    format!(
        "INSERT INTO {} (place_id, amenity_id, position) VALUES ({}, {}, {}) ON CONFLICT DO NOTHING",
        PLACE_AMENITY,
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3)
    )
}

pub(crate) fn select_links_sql(dialect: Dialect) -> String {
    format!(
        "SELECT amenity_id FROM {} WHERE place_id = {} ORDER BY position",
        PLACE_AMENITY,
        dialect.placeholder(1)
    )
}

pub(crate) fn select_all_links_sql() -> String {
    format!("SELECT place_id, amenity_id FROM {} ORDER BY place_id, position", PLACE_AMENITY)
}

/// Row values for `entity`, in the table's column order, plus the amenity ids
/// of a Place.
pub(crate) fn entity_to_row(entity: &Entity) -> Result<(Vec<SqlValue>, Vec<String>), StorageError> {
    entity.validate()?;
    let table = table_for(entity.kind());
    let fields = entity.to_serializable(true);

    let mut values = Vec::with_capacity(table.columns.len());
    for column in table.columns {
        let field = fields.get(column.name);
        let value = match (column.ty, field) {
            (ColumnType::Text, Some(Value::String(s))) => SqlValue::Text(s.clone()),
            (ColumnType::Integer, Some(v)) if v.is_i64() => SqlValue::Integer(v.as_i64().unwrap_or_default()),
            (ColumnType::Real, Some(v)) if v.is_number() => SqlValue::Real(v.as_f64().unwrap_or_default()),
            _ => {
                return Err(StorageError::Other(format!(
                    "{} has no value for column {}.{}",
                    entity.key(),
                    table.name,
                    column.name
                )))
            }
        };
        values.push(value);
    }

    let amenity_ids = match fields.get(AMENITY_IDS) {
        Some(Value::Array(ids)) => ids.iter().filter_map(|id| id.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    };
    Ok((values, amenity_ids))
}

/// Rebuilds an entity from a row read in the table's column order.
pub(crate) fn row_to_entity(
    table: &Table,
    row: Vec<SqlValue>,
    amenity_ids: Option<Vec<String>>,
) -> Result<Entity, StorageError> {
    let mut fields = FieldMap::new();
    for (column, value) in table.columns.iter().zip(row) {
        let value = match value {
            SqlValue::Text(s) => Value::String(s),
            SqlValue::Integer(i) => Value::from(i),
            SqlValue::Real(f) => Value::from(f),
        };
        fields.insert(column.name.to_string(), value);
    }
    if let Some(ids) = amenity_ids {
        fields.insert(AMENITY_IDS.to_string(), Value::from(ids));
    }
    Entity::from_fields(table.kind, &fields).map_err(StorageError::from)
}

/// Groups `(place_id, amenity_id)` pairs by place, keeping their order.
pub(crate) fn group_links(pairs: Vec<(String, String)>) -> HashMap<String, Vec<String>> {
    let mut links: HashMap<String, Vec<String>> = HashMap::new();
    for (place_id, amenity_id) in pairs {
        links.entry(place_id).or_default().push(amenity_id);
    }
    links
}
