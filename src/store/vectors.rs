//! Binary storage for row vectors.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - row_id: [u8; 26] (ULID, ASCII)
//! - content_hash: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::eid::{Eid, EID_LEN};
use crate::store::index::{VectorEntry, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

/// SHA256 of the model name; vectors from another model are not comparable.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    Sha256::digest(model_name.as_bytes()).into()
}

pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the vector index, rejecting files written for another model.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::new(dimensions);

        for _ in 0..header.entry_count {
            let (id, content_hash, embedding) = read_entry(&mut reader, dimensions)?;
            if let Err(e) = index.insert(id.clone(), content_hash, embedding) {
                log::warn!("skipping stored vector for {id}: {e}");
            }
        }

        Ok(index)
    }

    /// Save the vector index.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(e) = write_to_file(&temp_path, index, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn write_to_file(
    path: &Path,
    index: &VectorIndex,
    model_id: &[u8; 32],
) -> Result<(), VectorStorageError> {
    let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
        VectorStorageError::InvalidFormat(format!(
            "{} dimensions do not fit the header",
            index.dimensions()
        ))
    })?;

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_header(
        &mut writer,
        &Header {
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
        },
    )?;

    for (id, entry) in index.iter() {
        write_entry(&mut writer, id, entry)?;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[43..47]));
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    Ok(Header {
        model_id,
        dimensions: u16::from_le_bytes(le_array(&header_bytes[33..35])),
        entry_count: u64::from_le_bytes(le_array(&header_bytes[35..43])),
    })
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = FORMAT_VERSION;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_entry(
    reader: &mut impl Read,
    dimensions: usize,
) -> Result<(Eid, u64, Vec<f32>), VectorStorageError> {
    let mut id_bytes = [0u8; EID_LEN];
    reader.read_exact(&mut id_bytes)?;
    let id = Eid::from_fixed_bytes(&id_bytes)
        .ok_or_else(|| VectorStorageError::InvalidFormat("row id is not valid utf8".into()))?;

    let mut hash_bytes = [0u8; 8];
    reader.read_exact(&mut hash_bytes)?;
    let content_hash = u64::from_le_bytes(hash_bytes);

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        embedding.push(f32::from_le_bytes(float_bytes));
    }

    Ok((id, content_hash, embedding))
}

fn write_entry(
    writer: &mut impl Write,
    id: &Eid,
    entry: &VectorEntry,
) -> Result<(), VectorStorageError> {
    let id_bytes = id.to_fixed_bytes().ok_or_else(|| {
        VectorStorageError::InvalidFormat(format!("row id {id} is not a {EID_LEN}-byte ulid"))
    })?;

    writer.write_all(&id_bytes)?;
    writer.write_all(&entry.content_hash.to_le_bytes())?;

    for &value in &entry.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn test_model_id() -> [u8; 32] {
        model_id_hash("test-model")
    }

    #[test]
    fn test_save_and_load_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));

        storage.save(&VectorIndex::new(0), &test_model_id()).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&test_model_id()).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimensions(), 0);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));

        let a = Eid::new();
        let b = Eid::new();
        let mut index = VectorIndex::new(3);
        index.insert(a.clone(), 100, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(b.clone(), 200, vec![0.0, 0.5, 0.5]).unwrap();

        storage.save(&index, &test_model_id()).unwrap();

        let loaded = storage.load(&test_model_id()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimensions(), 3);
        assert_eq!(loaded.get(&a).unwrap().content_hash, 100);
        assert_eq!(loaded.get(&b).unwrap().embedding, vec![0.0, 0.5, 0.5]);
    }

    #[test]
    fn test_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));

        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let result = storage.load(&model_id_hash("another-model"));
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));
    }

    #[test]
    fn test_rejects_non_ulid_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let mut index = VectorIndex::new(2);
        index.insert(Eid::from("not-a-ulid"), 1, vec![1.0, 0.0]).unwrap();

        assert!(matches!(
            storage.save(&index, &test_model_id()),
            Err(VectorStorageError::InvalidFormat(_))
        ));
        assert!(!path.with_extension("tmp").exists());
        assert!(!storage.exists());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let mut index = VectorIndex::new(3);
        index.insert(Eid::new(), 100, vec![1.0, 0.0, 0.0]).unwrap();
        storage.save(&index, &test_model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&test_model_id());
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));

        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();
        storage.delete().unwrap();
        assert!(!storage.exists());
    }
}
