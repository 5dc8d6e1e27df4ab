use crate::config::SearchLimits;
use crate::oracle::{DecryptVerify, Verified, VerifyError};
use crate::report::{RepairOutcome, UnfixableCause};
use crate::scan::{scan_path, BlockScan, ScanError};
use crate::store::{FileId, MetaStore, StoreError, VersionMeta};
use crate::txn::{MetaTxn, WriteMode};
use crate::walk::TreeEntry;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A file as seen at the start of one repair attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedFile {
    pub id: FileId,
    /// Logical path, `/<user>/files/<rel>`.
    pub path: String,
    pub disk_path: PathBuf,
    pub declared: VersionMeta,
    pub size_bytes: u64,
}

impl EncryptedFile {
    /// Join a walked entry with its stored metadata; `None` when the store has no record.
    pub fn load<S: MetaStore + ?Sized>(
        store: &S,
        entry: &TreeEntry,
    ) -> Result<Option<Self>, StoreError> {
        Ok(store.get(&entry.logical_path)?.map(|rec| Self {
            id: rec.id,
            path: rec.path,
            disk_path: entry.disk_path.clone(),
            declared: rec.meta,
            size_bytes: entry.size,
        }))
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Decrement,
    Increment,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One candidate trial.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepairAttempt {
    pub candidate: u32,
    pub direction: Direction,
    pub outcome: AttemptOutcome,
}

/// Hooks for the operator trace. Every method defaults to doing nothing.
pub trait RepairObserver {
    /// The declared version did not verify; a search is about to start.
    fn attempting_fix(&mut self, _file: &EncryptedFile) {}
    fn attempt(&mut self, _file: &EncryptedFile, _attempt: &RepairAttempt) {}
    /// The file decrypts under `version`.
    fn verified(&mut self, _file: &EncryptedFile, _version: u32, _result: &Verified) {}
}

impl RepairObserver for () {}

/// Ordered candidates for a file whose declared version failed to verify.
///
/// The decrement phase walks down from `declared - 1` to `min(1, actual)`. When
/// the embedded tag is above the declared version an increment phase follows,
/// walking up from `declared + 1` to `actual + transitions`. Both phases move one
/// step at a time; equal versions produce an empty plan.
pub fn candidate_plan(declared: u32, scan: &BlockScan, limits: SearchLimits) -> Vec<(u32, Direction)> {
    let actual = scan.version;
    let cap = limits.max_candidates as usize;
    let mut plan = Vec::new();
    if actual == declared {
        return plan;
    }

    let floor = actual.min(1);
    let mut v = declared;
    while v > floor && plan.len() < cap {
        v -= 1;
        plan.push((v, Direction::Decrement));
    }

    if actual > declared {
        let ceiling = actual.saturating_add(scan.transitions);
        let mut v = declared;
        while v < ceiling && plan.len() < cap {
            v += 1;
            plan.push((v, Direction::Increment));
        }
    }
    plan
}

/// Finds and commits a working version for one file at a time.
pub struct RepairEngine<'a, S: MetaStore + ?Sized, O: DecryptVerify + ?Sized> {
    store: &'a mut S,
    oracle: &'a O,
    limits: SearchLimits,
}

impl<'a, S: MetaStore + ?Sized, O: DecryptVerify + ?Sized> RepairEngine<'a, S, O> {
    pub fn new(store: &'a mut S, oracle: &'a O, limits: SearchLimits) -> Self {
        Self { store, oracle, limits }
    }

    /// Scan the file's blocks and repair it. Scan failures end the file as
    /// unfixable without touching metadata.
    pub fn inspect(
        &mut self,
        file: &EncryptedFile,
        observer: &mut dyn RepairObserver,
    ) -> Result<RepairOutcome, StoreError> {
        let restored_version = file.declared.encrypted_version;
        if file.size_bytes == 0 {
            return self.repair(file, None, observer);
        }
        match scan_path(&file.disk_path) {
            Ok(scanned) => self.repair(file, scanned.as_ref(), observer),
            Err(ScanError::Malformed { block, reason }) => {
                warn!(path = %file.path, block, %reason, "malformed block layout");
                Ok(RepairOutcome::Unfixable {
                    restored_version,
                    cause: UnfixableCause::MalformedContent {
                        reason: format!("block {block}: {reason}"),
                    },
                })
            }
            Err(ScanError::Io(e)) => Ok(RepairOutcome::Unfixable {
                restored_version,
                cause: UnfixableCause::OracleIo { reason: e.to_string() },
            }),
        }
    }

    /// Decide the outcome for `file` given its scan result.
    ///
    /// A file that verifies under its declared version is never written, whatever
    /// its block tag says. Otherwise candidates from [`candidate_plan`] are tried in
    /// order; the first that verifies is committed, and if none does the original
    /// metadata is restored.
    pub fn repair(
        &mut self,
        file: &EncryptedFile,
        scanned: Option<&BlockScan>,
        observer: &mut dyn RepairObserver,
    ) -> Result<RepairOutcome, StoreError> {
        let Some(scan) = scanned else {
            return Ok(RepairOutcome::AlreadyOk);
        };
        let declared = file.declared.encrypted_version;

        match self.oracle.verify(&file.disk_path, declared) {
            Ok(v) => {
                observer.verified(file, declared, &v);
                return Ok(RepairOutcome::AlreadyOk);
            }
            Err(VerifyError::Io(e)) => {
                warn!(path = %file.path, error = %e, "verification failed on storage error");
                return Ok(RepairOutcome::Unfixable {
                    restored_version: declared,
                    cause: UnfixableCause::OracleIo { reason: e.to_string() },
                });
            }
            Err(VerifyError::Mismatch { reason, .. }) => {
                debug!(path = %file.path, declared, actual = scan.version, %reason, "declared version does not verify");
            }
        }

        observer.attempting_fix(file);
        if scan.version == declared {
            return Ok(RepairOutcome::Unfixable {
                restored_version: declared,
                cause: UnfixableCause::ContentCorrupt,
            });
        }

        let mode = if self.oracle.dry_run() { WriteMode::Deferred } else { WriteMode::Speculative };
        let plan = candidate_plan(declared, scan, self.limits);
        let mut txn = MetaTxn::open(&mut *self.store, file, mode)?;
        for (candidate, direction) in plan {
            txn.try_version(candidate)?;
            match self.oracle.verify(&file.disk_path, candidate) {
                Ok(v) => {
                    let attempt =
                        RepairAttempt { candidate, direction, outcome: AttemptOutcome::Success };
                    observer.attempt(file, &attempt);
                    observer.verified(file, candidate, &v);
                    let meta = txn.commit()?;
                    info!(path = %file.path, from = declared, to = meta.encrypted_version, "fixed encrypted version");
                    return Ok(RepairOutcome::Fixed { final_version: meta.encrypted_version });
                }
                Err(VerifyError::Mismatch { .. }) => {
                    let attempt =
                        RepairAttempt { candidate, direction, outcome: AttemptOutcome::Failure };
                    observer.attempt(file, &attempt);
                }
                Err(VerifyError::Io(e)) => {
                    let restored = txn.rollback()?;
                    warn!(path = %file.path, candidate, error = %e, "search abandoned on storage error");
                    return Ok(RepairOutcome::Unfixable {
                        restored_version: restored.encrypted_version,
                        cause: UnfixableCause::OracleIo { reason: e.to_string() },
                    });
                }
            }
        }

        let restored = txn.rollback()?;
        info!(path = %file.path, version = restored.encrypted_version, "no working version found");
        Ok(RepairOutcome::Unfixable {
            restored_version: restored.encrypted_version,
            cause: UnfixableCause::SearchExhausted,
        })
    }
}
