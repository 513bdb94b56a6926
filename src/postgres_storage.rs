use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use postgres::{types::ToSql, Client, NoTls, Row};

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

const DIALECT: Dialect = Dialect::Postgres;

/// Relational engine on a PostgreSQL server, with the same session semantics
/// as [`crate::sqlite_storage::SqliteStorage`].
pub struct PostgresStorage {
    session: Mutex<Session>,
}

struct Session {
    client: Client,
    active: bool,
}

fn db_error(e: postgres::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn params(values: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    values
        .iter()
        .map(|value| match value {
            SqlValue::Text(s) => s as &(dyn ToSql + Sync),
            SqlValue::Integer(i) => i as &(dyn ToSql + Sync),
            SqlValue::Real(f) => f as &(dyn ToSql + Sync),
        })
        .collect()
}

fn read_row(table: &Table, row: &Row) -> Result<Vec<SqlValue>, postgres::Error> {
    table
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            Ok(match column.ty {
                ColumnType::Text => SqlValue::Text(row.try_get(i)?),
                ColumnType::Integer => SqlValue::Integer(row.try_get(i)?),
                ColumnType::Real => SqlValue::Real(row.try_get(i)?),
            })
        })
        .collect()
}

impl PostgresStorage {
    /// Connects with a libpq style connection string. With `reset` every
    /// table is dropped first.
    pub fn new(connection_string: &str, reset: bool) -> Result<Self, StorageError> {
        let mut client = Client::connect(connection_string, NoTls)
            .map_err(|e| StorageError::Database(format!("PostgreSQL connection failed: {}", e)))?;

        if reset {
            client.batch_execute(&drop_schema_sql(DIALECT)).map_err(db_error)?;
            tracing::info!("PostgreSQL schema reset");
        }

        Ok(Self {
            session: Mutex::new(Session {
                client,
                active: false,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>, StorageError> {
        self.session
            .lock()
            .map_err(|_| StorageError::Other("postgres session lock poisoned".to_string()))
    }
}

impl Session {
    fn open(&mut self) -> Result<(), StorageError> {
        self.client
            .batch_execute(&create_schema_sql(DIALECT))
            .map_err(db_error)?;
        self.begin()
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        self.client.batch_execute("BEGIN").map_err(db_error)?;
        self.active = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if self.active {
            self.active = false;
            self.client.batch_execute("ROLLBACK").map_err(db_error)?;
        }
        Ok(())
    }

    /// A failed statement leaves the transaction aborted, and COMMIT on an
    /// aborted transaction rolls back without an error. Drop the session and
    /// begin a fresh one.
    fn restart(&mut self) {
        let restarted = self.rollback().and_then(|_| self.begin());
        if let Err(e) = restarted {
            self.active = false;
            tracing::warn!(error = %e, "PostgreSQL session restart failed");
        }
    }

    fn client(&mut self) -> Result<&mut Client, StorageError> {
        if !self.active {
            self.open()?;
        }
        Ok(&mut self.client)
    }

    fn all_links(client: &mut Client) -> Result<HashMap<String, Vec<String>>, StorageError> {
        let rows = client.query(&select_all_links_sql(), &[]).map_err(db_error)?;
        let pairs = rows
            .iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect::<Result<Vec<(String, String)>, postgres::Error>>()
            .map_err(db_error)?;
        Ok(group_links(pairs))
    }

    fn links_of(client: &mut Client, place_id: &str) -> Result<Vec<String>, StorageError> {
        let rows = client
            .query(&select_links_sql(DIALECT), &[&place_id])
            .map_err(db_error)?;
        rows.iter()
            .map(|row| row.try_get(0))
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_error)
    }

    fn load_table(
        client: &mut Client,
        table: &Table,
        links: &mut HashMap<String, Vec<String>>,
        out: &mut BTreeMap<String, Entity>,
    ) -> Result<(), StorageError> {
        let rows = client.query(&select_all_sql(table), &[]).map_err(db_error)?;
        for row in &rows {
            let values = read_row(table, row).map_err(db_error)?;
            let amenity_ids = match (table.kind, &values[0]) {
                (EntityKind::Place, SqlValue::Text(id)) => Some(links.remove(id).unwrap_or_default()),
                (EntityKind::Place, _) => Some(Vec::new()),
                _ => None,
            };
            let entity = row_to_entity(table, values, amenity_ids)?;
            out.insert(entity.key(), entity);
        }
        Ok(())
    }

    fn stage(client: &mut Client, entity: &Entity) -> Result<(), StorageError> {
        let table = table_for(entity.kind());
        let (values, amenity_ids) = entity_to_row(entity)?;
        client
            .execute(&upsert_sql(table, DIALECT), &params(&values))
            .map_err(db_error)?;

        if table.kind == EntityKind::Place {
            let place_id = entity.id();
            client
                .execute(&clear_links_sql(DIALECT), &[&place_id])
                .map_err(db_error)?;
            let insert = client.prepare(&insert_link_sql(DIALECT)).map_err(db_error)?;
            for (position, amenity_id) in amenity_ids.iter().enumerate() {
                client
                    .execute(&insert, &[&place_id, amenity_id, &(position as i64)])
                    .map_err(db_error)?;
            }
        }
        Ok(())
    }
}

impl Storage for PostgresStorage {
    fn all(&self, kind: Option<&str>) -> Result<BTreeMap<String, Entity>, StorageError> {
        let mut session = self.lock()?;
        let client = session.client()?;

        let tables: Vec<&Table> = match kind {
            None => TABLES.iter().collect(),
            Some(name) => table_named(name).into_iter().collect(),
        };
        let mut links = if tables.iter().any(|t| t.kind == EntityKind::Place) {
            Session::all_links(client)?
        } else {
            HashMap::new()
        };

        let mut result = BTreeMap::new();
        for table in tables {
            Session::load_table(client, table, &mut links, &mut result)?;
        }
        Ok(result)
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Entity>, StorageError> {
        let Some(table) = table_named(kind) else {
            return Ok(None);
        };
        let mut session = self.lock()?;
        let client = session.client()?;

        let row = client
            .query_opt(&select_by_id_sql(table, DIALECT), &[&id])
            .map_err(db_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let values = read_row(table, &row).map_err(db_error)?;

        let amenity_ids = match table.kind {
            EntityKind::Place => Some(Session::links_of(client, id)?),
            _ => None,
        };
        row_to_entity(table, values, amenity_ids).map(Some)
    }

    fn new(&self, entity: &Entity) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        let client = session.client()?;
        if let Err(e) = Session::stage(client, entity) {
            if matches!(e, StorageError::Database(_)) {
                tracing::warn!(key = %entity.key(), error = %e, "Staging failed, discarding session");
                session.restart();
            }
            return Err(e);
        }
        tracing::debug!(key = %entity.key(), "Entity staged");
        Ok(())
    }

    fn save(&self) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        if !session.active {
            return session.open();
        }

        if let Err(e) = session.client.batch_execute("COMMIT") {
            tracing::warn!(error = %e, "PostgreSQL commit failed, rolling back session");
            if let Err(rollback_err) = session.rollback() {
                tracing::warn!(error = %rollback_err, "PostgreSQL rollback after failed commit failed");
            }
            session.active = false;
            session.begin()?;
            return Err(db_error(e));
        }
        tracing::debug!("PostgreSQL session committed");
        session.begin()
    }

    fn delete(&self, entity: Option<&Entity>) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        let client = session.client()?;
        let Some(entity) = entity else {
            return Ok(());
        };
        let table = table_for(entity.kind());
        if let Err(e) = client.execute(&delete_sql(table, DIALECT), &[&entity.id()]) {
            tracing::warn!(key = %entity.key(), error = %e, "Delete failed, discarding session");
            session.restart();
            return Err(db_error(e));
        }
        tracing::debug!(key = %entity.key(), "Entity delete staged");
        Ok(())
    }

    fn count(&self, kind: Option<&str>) -> Result<usize, StorageError> {
        let mut session = self.lock()?;
        let client = session.client()?;

        let tables: Vec<&Table> = match kind {
            None => TABLES.iter().collect(),
            Some(name) => table_named(name).into_iter().collect(),
        };
        let mut total = 0;
        for table in tables {
            let row = client.query_one(&count_sql(table), &[]).map_err(db_error)?;
            let n: i64 = row.try_get(0).map_err(db_error)?;
            total += n as usize;
        }
        Ok(total)
    }

    fn reload(&self) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        session.rollback()?;
        session.open()?;
        tracing::debug!("PostgreSQL session opened");
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut session = self.lock()?;
        session.rollback()?;
        tracing::debug!("PostgreSQL session closed");
        Ok(())
    }
}
