use crate::repair::EncryptedFile;
use crate::store::{MetaStore, StoreError, VersionMeta};
use tracing::{debug, warn};

/// How candidate versions reach the store while a repair is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Each candidate is written before it is verified. The baseline is noted in
    /// the store journal first so an interrupted run can be undone.
    Speculative,
    /// Candidates are staged in memory; only a committed value is written.
    Deferred,
}

/// Bookkeeping around one file's version metadata.
///
/// The store has no multi-write atomicity; the transaction remembers the
/// original pair and puts it back unless a verified candidate is committed.
/// Dropping an unfinished transaction restores the baseline.
pub struct MetaTxn<'s, S: MetaStore + ?Sized> {
    store: &'s mut S,
    path: String,
    baseline: VersionMeta,
    mode: WriteMode,
    staged: Option<VersionMeta>,
    dirty: bool,
    noted: bool,
    finished: bool,
}

impl<'s, S: MetaStore + ?Sized> MetaTxn<'s, S> {
    pub fn open(store: &'s mut S, file: &EncryptedFile, mode: WriteMode) -> Result<Self, StoreError> {
        let rec = store.get_by_id(file.id)?.ok_or(StoreError::UnknownId(file.id))?;
        if rec.path != file.path {
            return Err(StoreError::IdMismatch {
                id: file.id,
                expected: file.path.clone(),
                actual: rec.path,
            });
        }
        Ok(Self {
            store,
            path: rec.path,
            baseline: rec.meta,
            mode,
            staged: None,
            dirty: false,
            noted: false,
            finished: false,
        })
    }

    pub fn try_version(&mut self, version: u32) -> Result<(), StoreError> {
        let meta = VersionMeta::at(version);
        if self.mode == WriteMode::Speculative {
            if !self.noted {
                self.store.note_pending(&self.path, self.baseline)?;
                self.noted = true;
            }
            self.store.put(&self.path, meta)?;
            self.dirty = true;
        }
        self.staged = Some(meta);
        Ok(())
    }

    /// Make the last tried candidate permanent. Without a candidate this is a no-op.
    pub fn commit(mut self) -> Result<VersionMeta, StoreError> {
        let Some(meta) = self.staged else {
            self.finished = true;
            return Ok(self.baseline);
        };
        if self.mode == WriteMode::Deferred {
            self.store.put(&self.path, meta)?;
        }
        if self.noted {
            self.store.clear_pending(&self.path)?;
            self.noted = false;
        }
        self.dirty = false;
        self.finished = true;
        debug!(path = %self.path, version = meta.encrypted_version, "committed version");
        Ok(meta)
    }

    pub fn rollback(mut self) -> Result<VersionMeta, StoreError> {
        self.restore()?;
        self.finished = true;
        Ok(self.baseline)
    }

    fn restore(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            self.store.put(&self.path, self.baseline)?;
            self.dirty = false;
        }
        if self.noted {
            self.store.clear_pending(&self.path)?;
            self.noted = false;
        }
        self.staged = None;
        Ok(())
    }
}

impl<S: MetaStore + ?Sized> Drop for MetaTxn<'_, S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.restore() {
            warn!(path = %self.path, error = %e, "could not restore baseline version");
        }
    }
}

/// Put back every baseline still noted as pending, e.g. after a crash mid-search.
pub fn recover_interrupted<S: MetaStore + ?Sized>(
    store: &mut S,
) -> Result<Vec<(String, VersionMeta)>, StoreError> {
    let pending = store.pending()?;
    for (path, baseline) in &pending {
        if store.get(path)?.is_some() {
            store.put(path, *baseline)?;
            warn!(path = %path, version = baseline.encrypted_version, "restored version left by an interrupted repair");
        }
        store.clear_pending(path)?;
    }
    Ok(pending)
}
