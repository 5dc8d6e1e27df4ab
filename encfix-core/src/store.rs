use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type FileId = u64;

pub const STORE_FILE: &str = "filecache.json";
pub const LOCK_FILE: &str = "filecache.lock";

/// The version tag and encrypted flag, always written as a pair.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionMeta {
    pub encrypted_version: u32,
    pub encrypted: bool,
}

impl VersionMeta {
    pub fn at(version: u32) -> Self {
        Self { encrypted_version: version, encrypted: version > 0 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub size: u64,
    #[serde(flatten)]
    pub meta: VersionMeta,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("metadata store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata store {0:?} is locked by another process")]
    Locked(PathBuf),
    #[error("no metadata for file id {0}")]
    UnknownId(FileId),
    #[error("no metadata for path {0}")]
    UnknownPath(String),
    #[error("file id {id} now belongs to {actual}, expected {expected}")]
    IdMismatch { id: FileId, expected: String, actual: String },
}

/// Key-value metadata keyed by logical file path (`/<user>/files/...`).
///
/// Besides plain reads and writes the store keeps a small journal of pending
/// baselines so a repair interrupted between a speculative write and its
/// verdict can be undone on the next run.
pub trait MetaStore {
    fn get(&self, path: &str) -> Result<Option<FileRecord>, StoreError>;
    fn get_by_id(&self, id: FileId) -> Result<Option<FileRecord>, StoreError>;
    fn put(&mut self, path: &str, meta: VersionMeta) -> Result<(), StoreError>;
    /// Register a file or refresh its size and metadata; ids are stable across calls.
    fn insert(&mut self, path: &str, size: u64, meta: VersionMeta)
        -> Result<FileRecord, StoreError>;
    fn note_pending(&mut self, path: &str, baseline: VersionMeta) -> Result<(), StoreError>;
    fn clear_pending(&mut self, path: &str) -> Result<(), StoreError>;
    fn pending(&self) -> Result<Vec<(String, VersionMeta)>, StoreError>;
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct CacheTable {
    next_id: FileId,
    entries: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pending: BTreeMap<String, VersionMeta>,
}

impl CacheTable {
    fn get(&self, path: &str) -> Option<FileRecord> {
        self.entries.get(path).cloned()
    }

    fn get_by_id(&self, id: FileId) -> Option<FileRecord> {
        self.entries.values().find(|r| r.id == id).cloned()
    }

    fn put(&mut self, path: &str, meta: VersionMeta) -> Result<(), StoreError> {
        let rec = self
            .entries
            .get_mut(path)
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
        rec.meta = meta;
        Ok(())
    }

    fn insert(&mut self, path: &str, size: u64, meta: VersionMeta) -> FileRecord {
        if let Some(rec) = self.entries.get_mut(path) {
            rec.size = size;
            rec.meta = meta;
            return rec.clone();
        }
        self.next_id += 1;
        let rec = FileRecord { id: self.next_id, path: path.to_string(), size, meta };
        self.entries.insert(path.to_string(), rec.clone());
        rec
    }
}

/// In-process store; counts metadata writes so tests can assert on them.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    table: CacheTable,
    writes: usize,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls since creation.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl MetaStore for MemoryMetaStore {
    fn get(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table.get(path))
    }

    fn get_by_id(&self, id: FileId) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table.get_by_id(id))
    }

    fn put(&mut self, path: &str, meta: VersionMeta) -> Result<(), StoreError> {
        self.table.put(path, meta)?;
        self.writes += 1;
        Ok(())
    }

    fn insert(
        &mut self,
        path: &str,
        size: u64,
        meta: VersionMeta,
    ) -> Result<FileRecord, StoreError> {
        Ok(self.table.insert(path, size, meta))
    }

    fn note_pending(&mut self, path: &str, baseline: VersionMeta) -> Result<(), StoreError> {
        self.table.pending.insert(path.to_string(), baseline);
        Ok(())
    }

    fn clear_pending(&mut self, path: &str) -> Result<(), StoreError> {
        self.table.pending.remove(path);
        Ok(())
    }

    fn pending(&self) -> Result<Vec<(String, VersionMeta)>, StoreError> {
        Ok(self.table.pending.iter().map(|(p, m)| (p.clone(), *m)).collect())
    }
}

/// `filecache.json` under the data directory, rewritten atomically on every change.
///
/// Holds an exclusive lock on `filecache.lock` for its whole lifetime, so two
/// repair runs can never interleave writes against the same files.
#[derive(Debug)]
pub struct JsonMetaStore {
    path: PathBuf,
    table: CacheTable,
    _lock: File,
}

impl JsonMetaStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let lock_path = data_dir.join(LOCK_FILE);
        let lock = OpenOptions::new().create(true).truncate(false).write(true).open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(lock_path));
        }
        let path = data_dir.join(STORE_FILE);
        let table = match File::open(&path) {
            Ok(f) => serde_json::from_reader(io::BufReader::new(f))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => CacheTable::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, table, _lock: lock })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(serde_json::to_string_pretty(&self.table)?.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MetaStore for JsonMetaStore {
    fn get(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table.get(path))
    }

    fn get_by_id(&self, id: FileId) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.table.get_by_id(id))
    }

    fn put(&mut self, path: &str, meta: VersionMeta) -> Result<(), StoreError> {
        self.table.put(path, meta)?;
        self.persist()
    }

    fn insert(
        &mut self,
        path: &str,
        size: u64,
        meta: VersionMeta,
    ) -> Result<FileRecord, StoreError> {
        let rec = self.table.insert(path, size, meta);
        self.persist()?;
        Ok(rec)
    }

    fn note_pending(&mut self, path: &str, baseline: VersionMeta) -> Result<(), StoreError> {
        self.table.pending.insert(path.to_string(), baseline);
        self.persist()
    }

    fn clear_pending(&mut self, path: &str) -> Result<(), StoreError> {
        if self.table.pending.remove(path).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn pending(&self) -> Result<Vec<(String, VersionMeta)>, StoreError> {
        Ok(self.table.pending.iter().map(|(p, m)| (p.clone(), *m)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_across_reinsert() {
        let mut s = MemoryMetaStore::new();
        let a = s.insert("/u/files/a", 1, VersionMeta::at(1)).unwrap();
        let b = s.insert("/u/files/b", 1, VersionMeta::at(1)).unwrap();
        let a2 = s.insert("/u/files/a", 9, VersionMeta::at(4)).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, a2.id);
        assert_eq!(s.get_by_id(a.id).unwrap().unwrap().meta.encrypted_version, 4);
    }

    #[test]
    fn put_on_unknown_path_fails() {
        let mut s = MemoryMetaStore::new();
        assert!(matches!(s.put("/u/files/x", VersionMeta::at(1)), Err(StoreError::UnknownPath(_))));
        assert_eq!(s.writes(), 0);
    }

    #[test]
    fn json_store_round_trips_and_locks() {
        let td = tempfile::tempdir().unwrap();
        {
            let mut s = JsonMetaStore::open(td.path()).unwrap();
            s.insert("/u/files/a", 3, VersionMeta { encrypted_version: 5, encrypted: false })
                .unwrap();
            s.note_pending("/u/files/a", VersionMeta::at(2)).unwrap();
            assert!(matches!(JsonMetaStore::open(td.path()), Err(StoreError::Locked(_))));
        }
        let s = JsonMetaStore::open(td.path()).unwrap();
        let rec = s.get("/u/files/a").unwrap().unwrap();
        assert_eq!(rec.meta, VersionMeta { encrypted_version: 5, encrypted: false });
        assert_eq!(s.pending().unwrap(), vec![("/u/files/a".to_string(), VersionMeta::at(2))]);
    }
}
