use std::{
    collections::BTreeMap,
    fs,
    io::{BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use hbnb_core::{storage_key, Entity, EntityKind, FieldMap, TYPE_TAG};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::storage::{Storage, StorageError};

/// Default location of the JSON document.
pub const DEFAULT_FILE_PATH: &str = "file.json";

/// Keeps every entity in memory and writes the whole set to one JSON document.
///
/// The document maps `"<Type>.<id>"` to the entity's persisted field map.
/// Writes go to a temporary file in the same directory which is then renamed
/// over the target, so a crash mid-write leaves the previous version intact.
///
/// Nothing coordinates two processes pointed at the same file: whichever
/// saves last wins and the other's unsaved changes are lost.
pub struct FileStorage {
    path: PathBuf,
    objects: RwLock<BTreeMap<String, Entity>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_objects(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Entity>>, StorageError> {
        self.objects
            .read()
            .map_err(|_| StorageError::Other("file storage lock poisoned".to_string()))
    }

    fn write_objects(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Entity>>, StorageError> {
        self.objects
            .write()
            .map_err(|_| StorageError::Other("file storage lock poisoned".to_string()))
    }

    fn load(&self) -> Result<BTreeMap<String, Entity>, StorageError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No storage file, starting empty");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: BTreeMap<String, Value> = serde_json::from_str(&contents)?;
        let mut objects = BTreeMap::new();
        for (key, record) in document {
            let Value::Object(fields) = record else {
                tracing::warn!(%key, "Skipping record that is not an object");
                continue;
            };
            let kind = fields
                .get(TYPE_TAG)
                .and_then(Value::as_str)
                .and_then(EntityKind::from_name);
            let Some(kind) = kind else {
                tracing::warn!(%key, "Skipping record with unknown type tag");
                continue;
            };
            let entity = Entity::from_fields(kind, &fields)?;
            objects.insert(entity.key(), entity);
        }
        Ok(objects)
    }

    fn write_file(&self, objects: &BTreeMap<String, Entity>) -> Result<(), StorageError> {
        for entity in objects.values() {
            entity.validate()?;
        }
        let document: FieldMap = objects
            .iter()
            .map(|(key, entity)| (key.clone(), Value::Object(entity.to_serializable(true))))
            .collect();

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &document)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StorageError::IOError(e.error))?;

        tracing::debug!(path = %self.path.display(), objects = objects.len(), "Storage file written");
        Ok(())
    }
}

impl Storage for FileStorage {
    fn all(&self, kind: Option<&str>) -> Result<BTreeMap<String, Entity>, StorageError> {
        let objects = self.read_objects()?;
        let Some(name) = kind else {
            return Ok(objects.clone());
        };
        let result = match EntityKind::from_name(name) {
            Some(kind) => objects
                .iter()
                .filter(|(_, entity)| entity.kind() == kind)
                .map(|(key, entity)| (key.clone(), entity.clone()))
                .collect(),
            None => BTreeMap::new(),
        };
        Ok(result)
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<Entity>, StorageError> {
        let Some(kind) = EntityKind::from_name(kind) else {
            return Ok(None);
        };
        Ok(self.read_objects()?.get(&storage_key(kind, id)).cloned())
    }

    fn new(&self, entity: &Entity) -> Result<(), StorageError> {
        entity.validate()?;
        self.write_objects()?.insert(entity.key(), entity.clone());
        Ok(())
    }

    fn save(&self) -> Result<(), StorageError> {
        let objects = self.read_objects()?;
        self.write_file(&objects)
    }

    fn delete(&self, entity: Option<&Entity>) -> Result<(), StorageError> {
        let Some(entity) = entity else {
            return Ok(());
        };
        let mut objects = self.write_objects()?;
        if objects.remove(&entity.key()).is_some() {
            tracing::debug!(key = %entity.key(), "Entity deleted");
            self.write_file(&objects)?;
        }
        Ok(())
    }

    fn count(&self, kind: Option<&str>) -> Result<usize, StorageError> {
        let objects = self.read_objects()?;
        let count = match kind {
            None => objects.len(),
            Some(name) => match EntityKind::from_name(name) {
                Some(kind) => objects.values().filter(|e| e.kind() == kind).count(),
                None => 0,
            },
        };
        Ok(count)
    }

    fn reload(&self) -> Result<(), StorageError> {
        let loaded = self.load()?;
        tracing::debug!(path = %self.path.display(), objects = loaded.len(), "Storage file loaded");
        *self.write_objects()? = loaded;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbnb_core::{City, Model, Place, State};
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.json"));
        storage.reload().unwrap();
        assert_eq!(storage.count(None).unwrap(), 0);
        assert!(storage.all(None).unwrap().is_empty());
    }

    #[test]
    fn test_new_overwrites_same_key() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.json"));
        let mut state = State::create(&storage).unwrap();
        state.name = "Nevada".to_string();
        storage.new(&state.clone().into()).unwrap();

        assert_eq!(storage.count(Some("State")).unwrap(), 1);
        let stored = storage.get("State", state.id()).unwrap().unwrap();
        assert_eq!(stored, Entity::State(state));
    }

    #[test]
    fn test_save_writes_tagged_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        let storage = FileStorage::new(&path);
        let mut city = City::create(&storage).unwrap();
        city.name = "Austin".to_string();
        city.save(&storage).unwrap();

        let document: FieldMap = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let record = document[&city.key()].as_object().unwrap();
        assert_eq!(record[TYPE_TAG], Value::from("City"));
        assert_eq!(record["name"], Value::from("Austin"));
        assert_eq!(record["updated_at"], Value::from(city.base().updated_at().to_string()));
    }

    #[test]
    fn test_save_leaves_no_temporary_files() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.json"));
        State::create(&storage).unwrap();
        storage.save().unwrap();
        storage.save().unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_save_error_propagates() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("missing").join("file.json"));
        State::create(&storage).unwrap();
        assert!(matches!(storage.save(), Err(StorageError::IOError(_))));
    }

    #[test]
    fn test_non_finite_coordinate_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        let storage = FileStorage::new(&path);
        let mut place = Place::create(&storage).unwrap();
        place.save(&storage).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        place.latitude = f64::NAN;
        assert!(matches!(place.save(&storage), Err(StorageError::Model(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);

        let other = FileStorage::new(&path);
        other.reload().unwrap();
        match other.get("Place", place.id()).unwrap() {
            Some(Entity::Place(stored)) => assert_eq!(stored.latitude, 0.0),
            other => panic!("Expected Place, got {:?}", other),
        }
    }

    #[test]
    fn test_save_replaces_whole_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        let storage = FileStorage::new(&path);
        let first = State::create(&storage).unwrap();
        storage.save().unwrap();
        let second = State::create(&storage).unwrap();
        storage.save().unwrap();

        let document: FieldMap = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document.len(), 2);
        assert!(document.contains_key(&first.key()));
        assert!(document.contains_key(&second.key()));
    }

    #[test]
    fn test_reload_skips_unknown_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        fs::write(
            &path,
            r#"{
                "BaseModel.1": {"__class__": "BaseModel", "id": "1",
                    "created_at": "2024-01-01T00:00:00.000000", "updated_at": "2024-01-01T00:00:00.000000"},
                "State.2": {"__class__": "State", "id": "2", "name": "Ohio",
                    "created_at": "2024-01-01T00:00:00.000000", "updated_at": "2024-01-02T00:00:00.000000"}
            }"#,
        )
        .unwrap();

        let storage = FileStorage::new(&path);
        storage.reload().unwrap();
        assert_eq!(storage.count(None).unwrap(), 1);
        match storage.get("State", "2").unwrap() {
            Some(Entity::State(state)) => assert_eq!(state.name, "Ohio"),
            other => panic!("Expected State, got {:?}", other),
        }
    }

    #[test]
    fn test_reload_rejects_invalid_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        fs::write(
            &path,
            r#"{"City.x": {"__class__": "City", "id": null,
                "created_at": "2024-01-01T00:00:00.000000", "updated_at": "2024-01-01T00:00:00.000000"}}"#,
        )
        .unwrap();

        let storage = FileStorage::new(&path);
        let state = State::create(&storage).unwrap();
        assert!(matches!(storage.reload(), Err(StorageError::Model(_))));
        // the failed reload leaves the live set alone
        assert!(storage.get("State", state.id()).unwrap().is_some());
    }

    #[test]
    fn test_reload_discards_unsaved_changes() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.json"));
        let saved = State::create(&storage).unwrap();
        storage.save().unwrap();
        let unsaved = State::create(&storage).unwrap();

        storage.close().unwrap();
        assert!(storage.get("State", saved.id()).unwrap().is_some());
        assert!(storage.get("State", unsaved.id()).unwrap().is_none());
    }

    #[test]
    fn test_delete_persists_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        let storage = FileStorage::new(&path);
        let state = State::create(&storage).unwrap();
        storage.save().unwrap();

        state.delete(&storage).unwrap();
        assert!(storage.get("State", state.id()).unwrap().is_none());

        let other = FileStorage::new(&path);
        other.reload().unwrap();
        assert_eq!(other.count(None).unwrap(), 0);
    }

    #[test]
    fn test_delete_none_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        let storage = FileStorage::new(&path);
        storage.delete(None).unwrap();
        assert!(!path.exists());
    }
}
