use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use rusqlite::{
    params,
    types::{ToSqlOutput, Value as SqliteValue, ValueRef},
    Connection, Row, ToSql,
};

use hbnb_core::{Entity, EntityKind};

use crate::{
    relational::{
        clear_links_sql, count_sql, create_schema_sql, delete_sql, drop_schema_sql, entity_to_row,
        group_links, insert_link_sql, row_to_entity, select_all_links_sql, select_all_sql,
        select_by_id_sql, select_links_sql, table_for, table_named, upsert_sql, ColumnType,
        Dialect, SqlValue, Table, TABLES,
    },
    storage::{Storage, StorageError},
};

const DIALECT: Dialect = Dialect::Sqlite;

/// Relational engine on an embedded SQLite database.
///
/// The session is an open transaction on the engine's connection. `new` and
/// `delete` are staged in it and only become durable when `save` commits.
pub struct SqliteStorage {
    session: Mutex<Session>,
}

struct Session {
    conn: Connection,
    active: bool,
}

fn db_error(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
        })
    }
}

fn read_row(table: &Table, row: &Row<'_>) -> rusqlite::Result<Vec<SqlValue>> {
    table
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            Ok(match column.ty {
                ColumnType::Text => SqlValue::Text(row.get(i)?),
                ColumnType::Integer => SqlValue::Integer(row.get(i)?),
                ColumnType::Real => SqlValue::Real(row.get(i)?),
            })
        })
        .collect()
}

impl SqliteStorage {
    /// Opens the database at `path` (`:memory:` for a private in-memory one).
    /// With `reset` every table is dropped first.
    pub fn new(path: &str, reset: bool) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(db_error)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_error)?;

        if reset {
            conn.execute_batch(&drop_schema_sql(DIALECT)).map_err(db_error)?;
            tracing::info!(path, "SQLite schema reset");
        }

        Ok(Self {
            session: Mutex::new(Session { conn, active: false }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>, StorageError> {
        self.session
            .lock()
            .map_err(|_| StorageError::Other("sqlite session lock poisoned".to_string()))
    }
}

impl Session {
    /// Ensures the schema exists and begins a fresh session.
    fn open(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(&create_schema_sql(DIALECT)).map_err(db_error)?;
        self.begin()
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN").map_err(db_error)?;
        self.active = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if self.active {
            self.active = false;
            self.conn.execute_batch("ROLLBACK").map_err(db_error)?;
        }
        Ok(())
    }

    fn connection(&mut self) -> Result<&Connection, StorageError> {
        if !self.active {
            self.open()?;
        }
        Ok(&self.conn)
    }

    fn links_of(conn: &Connection, place_id: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = conn.prepare(&select_links_sql(DIALECT)).map_err(db_error)?;
        let rows = stmt
            .query_map(params![place_id], |row| row.get::<_, String>(0))
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    fn all_links(conn: &Connection) -> Result<HashMap<String, Vec<String>>, StorageError> {
        let mut stmt = conn.prepare(&select_all_links_sql()).map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_error)?;
        let pairs = rows.collect::<Result<Vec<_>, _>>().map_err(db_error)?;
        Ok(group_links(pairs))
    }

    fn load_table(
        conn: &Connection,
        table: &Table,
        links: &mut HashMap<String, Vec<String>>,
        out: &mut BTreeMap<String, Entity>,
    ) -> Result<(), StorageError> {
        let mut stmt = conn.prepare(&select_all_sql(table)).map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| read_row(table, row))
            .map_err(db_error)?;
        for row in rows {
            let row = row.map_err(db_error)?;
            let amenity_ids = match table.kind {
                EntityKind::Place => match &row[0] {
                    SqlValue::Text(id) => Some(links.remove(id).unwrap_or_default()),
                    _ => Some(Vec::new()),
                },
                _ => None,
            };
            let entity = row_to_entity(table, row, amenity_ids)?;
            out.insert(entity.key(), entity);
        }
        Ok(())
    }

    fn stage(conn: &Connection, entity: &Entity) -> Result<(), StorageError> {
        let table = table_for(entity.kind());
        let (values, amenity_ids) = entity_to_row(entity)?;
        conn.execute(&upsert_sql(table, DIALECT), rusqlite::params_from_iter(values.iter()))
            .map_err(db_error)?;

        if table.kind == EntityKind::Place {
            conn.execute(&clear_links_sql(DIALECT), params![entity.id()])
                .map_err(db_error)?;
            let mut stmt = conn.prepare(&insert_link_sql(DIALECT)).map_err(db_error)?;
            for (position, amenity_id) in amenity_ids.iter().enumerate() {
                stmt.execute(params![entity.id(), amenity_id, position as i64])
                    .map_err(db_error)?;
            }
        }
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn all(&self, kind: Option<&str>) -> Result<BTreeMap<String, Entity>, StorageError> {
        let mut session = self.lock()?;
        let conn = session.connection()?;

        let tables: Vec<&Table> = match kind {
            None => TABLES.iter().collect(),
            Some(name) => table_named(name).into_iter().collect(),
        };

        let mut links = if tables.iter().any(|t| t.kind == EntityKind::Place) {
            Session::all_links(conn)?
        } else {
            HashMap::new()
        };

        let mut result = BTreeMap::new();
        for table in tables {
            Session::load_table(conn, table, &mut links, &mut result)?;
        }
        Ok(result)
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Entity>, StorageError> {
        let Some(table) = table_named(kind) else {
            return Ok(None);
        };
        let mut session = self.lock()?;
        let conn = session.connection()?;

        let mut stmt = conn.prepare(&select_by_id_sql(table, DIALECT)).map_err(db_error)?;
        let mut rows = stmt.query(params![id]).map_err(db_error)?;
        let row = match rows.next().map_err(db_error)? {
            Some(row) => read_row(table, row).map_err(db_error)?,
            None => return Ok(None),
        };

        let amenity_ids = match table.kind {
            EntityKind::Place => Some(Session::links_of(conn, id)?),
            _ => None,
        };
        row_to_entity(table, row, amenity_ids).map(Some)
    }

    fn new(&self, entity: &Entity) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        let conn = session.connection()?;
        Session::stage(conn, entity)?;
        tracing::debug!(key = %entity.key(), "Entity staged");
        Ok(())
    }

    fn save(&self) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        if !session.active {
            return session.open();
        }

        if let Err(e) = session.conn.execute_batch("COMMIT") {
            tracing::warn!(error = %e, "SQLite commit failed, rolling back session");
            if let Err(rollback_err) = session.rollback() {
                tracing::warn!(error = %rollback_err, "SQLite rollback after failed commit failed");
            }
            session.active = false;
            session.begin()?;
            return Err(db_error(e));
        }
        tracing::debug!("SQLite session committed");
        session.begin()
    }

    fn delete(&self, entity: Option<&Entity>) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        let conn = session.connection()?;
        let Some(entity) = entity else {
            return Ok(());
        };
        let table = table_for(entity.kind());
        conn.execute(&delete_sql(table, DIALECT), params![entity.id()])
            .map_err(db_error)?;
        tracing::debug!(key = %entity.key(), "Entity delete staged");
        Ok(())
    }

    fn count(&self, kind: Option<&str>) -> Result<usize, StorageError> {
        let mut session = self.lock()?;
        let conn = session.connection()?;

        let tables: Vec<&Table> = match kind {
            None => TABLES.iter().collect(),
            Some(name) => table_named(name).into_iter().collect(),
        };
        let mut total = 0;
        for table in tables {
            let n: i64 = conn
                .query_row(&count_sql(table), [], |row| row.get(0))
                .map_err(db_error)?;
            total += n as usize;
        }
        Ok(total)
    }

    fn reload(&self) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        session.rollback()?;
        session.open()?;
        tracing::debug!("SQLite session opened");
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        session.rollback()?;
        tracing::debug!("SQLite session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbnb_core::{Amenity, City, Model, Place, State, User};
    use tempfile::tempdir;

    fn memory() -> SqliteStorage {
        let storage = SqliteStorage::new(":memory:", false).unwrap();
        storage.reload().unwrap();
        storage
    }

    fn state_with_city(storage: &SqliteStorage) -> (State, City) {
        let mut state = State::create(storage).unwrap();
        state.name = "California".to_string();
        state.save(storage).unwrap();
        let mut city = City::create(storage).unwrap();
        city.state_id = state.id().to_string();
        city.name = "Fresno".to_string();
        city.save(storage).unwrap();
        (state, city)
    }

    #[test]
    fn test_staged_entity_visible_in_session() {
        let storage = memory();
        let state = State::create(&storage).unwrap();
        assert_eq!(storage.count(Some("State")).unwrap(), 1);
        assert!(storage.all(Some("State")).unwrap().contains_key(&state.key()));
    }

    #[test]
    fn test_reload_discards_uncommitted() {
        let storage = memory();
        let saved = State::create(&storage).unwrap();
        storage.save().unwrap();
        let pending = State::create(&storage).unwrap();

        storage.reload().unwrap();
        assert!(storage.get("State", saved.id()).unwrap().is_some());
        assert!(storage.get("State", pending.id()).unwrap().is_none());
    }

    #[test]
    fn test_get_round_trips_fields() {
        let storage = memory();
        let mut user = User::create(&storage).unwrap();
        user.email = "owner@example.com".to_string();
        user.set_password("pw");
        user.save(&storage).unwrap();

        match storage.get("User", user.id()).unwrap() {
            Some(Entity::User(stored)) => {
                assert_eq!(stored, user);
                assert!(stored.verify_password("pw"));
            }
            other => panic!("Expected User, got {:?}", other),
        }
    }

    #[test]
    fn test_place_amenities_round_trip() {
        let storage = memory();
        let (_, city) = state_with_city(&storage);
        let user = User::create(&storage).unwrap();
        let wifi = Amenity::create(&storage).unwrap();
        let pool = Amenity::create(&storage).unwrap();
        let mut place = Place::create(&storage).unwrap();
        place.city_id = city.id().to_string();
        place.user_id = user.id().to_string();
        place.amenity_ids = vec![pool.id().to_string(), wifi.id().to_string()];
        place.save(&storage).unwrap();

        let stored = storage.get("Place", place.id()).unwrap().unwrap();
        assert_eq!(stored, Entity::Place(place.clone()));
        let all = storage.all(Some("Place")).unwrap();
        assert_eq!(all[&place.key()], Entity::Place(place));
    }

    #[test]
    fn test_repeated_amenity_id_stored_once() {
        let storage = memory();
        let wifi = Amenity::create(&storage).unwrap();
        let mut place = Place::create(&storage).unwrap();
        place.amenity_ids = vec![wifi.id().to_string(), wifi.id().to_string()];
        storage.new(&place.clone().into()).unwrap();

        match storage.get("Place", place.id()).unwrap() {
            Some(Entity::Place(stored)) => assert_eq!(stored.amenity_ids, vec![wifi.id().to_string()]),
            other => panic!("Expected Place, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_coordinate_refused() {
        let storage = memory();
        let mut place = Place::create(&storage).unwrap();
        place.latitude = f64::NAN;
        assert!(matches!(place.save(&storage), Err(StorageError::Model(_))));
        assert_eq!(storage.count(Some("Place")).unwrap(), 1);
    }

    #[test]
    fn test_commit_rejects_dangling_reference() {
        let storage = memory();
        let mut city = City::create(&storage).unwrap();
        city.state_id = "no-such-state".to_string();

        let err = city.save(&storage).unwrap_err();
        assert!(matches!(err, StorageError::Database(_)));
        // the session was rolled back and replaced
        assert_eq!(storage.count(Some("City")).unwrap(), 0);
        State::create(&storage).unwrap();
        storage.save().unwrap();
        assert_eq!(storage.count(Some("State")).unwrap(), 1);
    }

    #[test]
    fn test_delete_cascades_to_children() {
        let storage = memory();
        let (state, city) = state_with_city(&storage);

        state.delete(&storage).unwrap();
        storage.save().unwrap();
        assert!(storage.get("State", state.id()).unwrap().is_none());
        assert!(storage.get("City", city.id()).unwrap().is_none());
    }

    #[test]
    fn test_delete_is_durable_only_after_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hbnb.db");
        let path = path.to_str().unwrap();
        let storage = SqliteStorage::new(path, false).unwrap();
        storage.reload().unwrap();
        let mut state = State::create(&storage).unwrap();
        state.save(&storage).unwrap();
        let observer = SqliteStorage::new(path, false).unwrap();
        observer.reload().unwrap();

        state.delete(&storage).unwrap();
        assert!(storage.get("State", state.id()).unwrap().is_none());
        assert!(observer.get("State", state.id()).unwrap().is_some());
        observer.close().unwrap();

        storage.save().unwrap();
        assert!(observer.get("State", state.id()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_kind_is_empty() {
        let storage = memory();
        State::create(&storage).unwrap();
        assert_eq!(storage.count(Some("BaseModel")).unwrap(), 0);
        assert!(storage.all(Some("BaseModel")).unwrap().is_empty());
        assert!(storage.get("BaseModel", "x").unwrap().is_none());
    }

    #[test]
    fn test_reset_drops_existing_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hbnb.db");
        let path = path.to_str().unwrap();
        {
            let storage = SqliteStorage::new(path, false).unwrap();
            State::create(&storage).unwrap();
            storage.save().unwrap();
            assert_eq!(storage.count(None).unwrap(), 1);
        }

        let storage = SqliteStorage::new(path, true).unwrap();
        storage.reload().unwrap();
        assert_eq!(storage.count(None).unwrap(), 0);
    }

    #[test]
    fn test_close_ends_session() {
        let storage = memory();
        State::create(&storage).unwrap();
        storage.close().unwrap();
        assert_eq!(storage.count(None).unwrap(), 0);
    }
}
