use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use super::index::VectorIndex;
use super::vectors::{model_id_hash, VectorStorage, VectorStorageError};
use super::{Neighbor, RowStore, StoreError};
use crate::eid::Eid;
use crate::lock::FileLock;
use crate::rows::{EntityKind, Row, RowCreate, RowUpdate};
use crate::storage::{BackendLocal, StorageManager};

const ROWS_FILE: &str = "rows.csv";
const VECTORS_FILE: &str = "vectors.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub rows: usize,
    pub indexed: usize,
}

struct State {
    /// Keyed by id; id order is the store's natural row order.
    rows: BTreeMap<Eid, Row>,
    index: VectorIndex,
}

/// Rows in `rows.csv`, vectors in `vectors.bin`, both in one directory.
///
/// The directory is locked for as long as the store is open.
pub struct LocalStore {
    state: RwLock<State>,
    files: BackendLocal,
    vectors: VectorStorage,
    model_id: [u8; 32],
    _lock: FileLock,
}

impl LocalStore {
    /// Open (or create) the store in `dir`.
    ///
    /// Vectors written for a different model, or by an incompatible file
    /// version, are discarded so every row becomes eligible for indexing.
    pub fn open(dir: &Path, model_name: &str) -> Result<Self, StoreError> {
        let files = BackendLocal::new(dir)?;
        let lock = FileLock::try_acquire(dir)?;
        let model_id = model_id_hash(model_name);
        let vectors = VectorStorage::new(dir.join(VECTORS_FILE));

        let now = Instant::now();
        let rows = Self::load_rows(&files)?;
        log::debug!(
            "took {}ms to read {} rows",
            now.elapsed().as_micros() as f64 / 1000.0,
            rows.len()
        );

        let mut index = if vectors.exists() {
            match vectors.load(&model_id) {
                Ok(index) => index,
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("embedding model changed to '{model_name}', dropping stored vectors");
                    VectorIndex::new(0)
                }
                Err(e @ VectorStorageError::VersionMismatch(..))
                | Err(e @ VectorStorageError::ChecksumMismatch)
                | Err(e @ VectorStorageError::InvalidFormat(_)) => {
                    log::warn!("discarding unreadable vectors: {e}");
                    VectorIndex::new(0)
                }
                Err(VectorStorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("discarding truncated vectors file: {e}");
                    VectorIndex::new(0)
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            VectorIndex::new(0)
        };

        // drop vectors of deleted rows and of rows edited outside the store
        let orphaned: Vec<Eid> = index
            .iter()
            .filter(|(id, entry)| {
                rows.get(*id)
                    .map(|row| row.content_hash() != entry.content_hash)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &orphaned {
            index.remove(id);
        }
        if !orphaned.is_empty() {
            log::info!("dropped {} stale vectors", orphaned.len());
        }

        log::info!(
            "opened store at {} ({} rows, {} indexed)",
            dir.display(),
            rows.len(),
            index.len()
        );

        Ok(Self {
            state: RwLock::new(State { rows, index }),
            files,
            vectors,
            model_id,
            _lock: lock,
        })
    }

    fn load_rows(files: &BackendLocal) -> Result<BTreeMap<Eid, Row>, StoreError> {
        if !files.exists(ROWS_FILE) {
            return Ok(BTreeMap::new());
        }

        let data = files.read(ROWS_FILE)?;
        let mut reader = csv::Reader::from_reader(data.as_slice());

        let mut rows = BTreeMap::new();
        for record in reader.deserialize() {
            let row: Row = record?;
            rows.insert(row.id.clone(), row);
        }

        Ok(rows)
    }

    fn save_rows(&self, rows: &BTreeMap<Eid, Row>) -> Result<(), StoreError> {
        let mut writer = csv::Writer::from_writer(vec![]);
        for row in rows.values() {
            writer.serialize(row)?;
        }
        let data = writer
            .into_inner()
            .map_err(|e| StoreError::Internal(format!("failed to flush rows: {e}")))?;

        self.files.write(ROWS_FILE, &data)?;
        Ok(())
    }

    fn save_vectors(&self, index: &VectorIndex) -> Result<(), StoreError> {
        self.vectors.save(index, &self.model_id)?;
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {e}")))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {e}")))
    }

    pub fn create(&self, create: RowCreate) -> Result<Row, StoreError> {
        let row = Row {
            id: Eid::new(),
            kind: create.kind,
            type_tag: create.type_tag.unwrap_or_default(),
            title: create.title,
            description: create.description.unwrap_or_default(),
        };

        let mut state = self.write_state()?;
        state.rows.insert(row.id.clone(), row.clone());
        self.save_rows(&state.rows)?;

        Ok(row)
    }

    pub fn get(&self, id: &Eid) -> Result<Row, StoreError> {
        self.read_state()?
            .rows
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Apply `update` to a row. A vector computed from the previous text is
    /// cleared so the next sweep re-indexes the row.
    pub fn update(&self, id: &Eid, update: RowUpdate) -> Result<Row, StoreError> {
        let mut state = self.write_state()?;

        let row = state
            .rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let previous_hash = row.content_hash();

        if let Some(type_tag) = update.type_tag {
            row.type_tag = type_tag;
        }
        if let Some(title) = update.title {
            row.title = title;
        }
        if let Some(description) = update.description {
            row.description = description;
        }

        let row = row.clone();
        self.save_rows(&state.rows)?;

        if row.content_hash() != previous_hash && state.index.remove(id).is_some() {
            log::debug!("text of {id} changed, vector cleared");
            self.save_vectors(&state.index)?;
        }

        Ok(row)
    }

    pub fn delete(&self, id: &Eid) -> Result<(), StoreError> {
        let mut state = self.write_state()?;

        if state.rows.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.save_rows(&state.rows)?;

        if state.index.remove(id).is_some() {
            self.save_vectors(&state.index)?;
        }

        Ok(())
    }

    /// Forget every stored vector, e.g. after the text synthesis rule changed.
    pub fn clear_vectors(&self) -> Result<usize, StoreError> {
        let mut state = self.write_state()?;
        let cleared = state.index.len();

        state.index.clear();
        self.vectors.delete()?;

        Ok(cleared)
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let state = self.read_state()?;
        Ok(StoreCounts {
            rows: state.rows.len(),
            indexed: state.index.len(),
        })
    }
}

#[async_trait]
impl RowStore for LocalStore {
    async fn missing_vectors(&self, kind: EntityKind, limit: usize) -> Result<Vec<Row>, StoreError> {
        let state = self.read_state()?;

        Ok(state
            .rows
            .values()
            .filter(|row| row.kind == kind && !state.index.contains(&row.id))
            .filter(|row| row.embedding_text().is_some())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_vector(&self, row: &Row, vector: Vec<f32>) -> Result<(), StoreError> {
        let mut state = self.write_state()?;

        let current = state
            .rows
            .get(&row.id)
            .ok_or_else(|| StoreError::NotFound(row.id.clone()))?;

        let content_hash = row.content_hash();
        if current.content_hash() != content_hash {
            return Err(StoreError::Stale(row.id.clone()));
        }

        state.index.insert(row.id.clone(), content_hash, vector)?;

        if let Err(e) = self.save_vectors(&state.index) {
            state.index.remove(&row.id);
            return Err(e);
        }

        Ok(())
    }

    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<Neighbor>, StoreError> {
        let state = self.read_state()?;

        let ranked = state.index.nearest(query, limit)?;

        Ok(ranked
            .into_iter()
            .filter_map(|(id, distance)| {
                state.rows.get(&id).map(|row| Neighbor {
                    row: row.clone(),
                    distance,
                })
            })
            .collect())
    }
}
