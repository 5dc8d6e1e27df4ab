use crate::config::RepairConfig;
use crate::localize::FluentLoc;
use crate::oracle::{DecryptVerify, Verified};
use crate::progress::Progress;
use crate::repair::{
    AttemptOutcome, Direction, EncryptedFile, RepairAttempt, RepairEngine, RepairObserver,
};
use crate::report::{RepairOutcome, RepairReport, UnfixableCause};
use crate::store::{MetaStore, StoreError};
use crate::txn::recover_interrupted;
use crate::users::UserDirectory;
use crate::walk::{walk, WalkError};
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, info};

/// Whose files a run visits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    User(String),
    AllUsers,
}

#[derive(Debug, Error)]
pub enum FixError {
    #[error("user {0} does not exist")]
    UserNotFound(String),
    #[error("path {0} does not exist")]
    PathNotFound(String),
    #[error("refusing path filter {filter}: {reason}")]
    UnsafePath { filter: String, reason: String },
    #[error("could not list users: {0}")]
    ListUsers(#[source] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not write output: {0}")]
    Output(#[from] io::Error),
}

fn say<W: Write>(out: &mut W, loc: &FluentLoc, code: &str, args: &[(&str, &str)]) -> io::Result<()> {
    writeln!(out, "{}", loc.msg(code, args))
}

/// Writes the per-candidate trace lines while the engine works on one file.
struct TraceObserver<'o, W: Write> {
    out: &'o mut W,
    loc: &'o FluentLoc,
    progress: &'o Progress,
    said_ok: bool,
    error: Option<io::Error>,
}

impl<W: Write> TraceObserver<'_, W> {
    fn line(&mut self, code: &str, args: &[(&str, &str)]) {
        if self.error.is_none() {
            if let Err(e) = say(self.out, self.loc, code, args) {
                self.error = Some(e);
            }
        }
    }
}

impl<W: Write> RepairObserver for TraceObserver<'_, W> {
    fn attempting_fix(&mut self, file: &EncryptedFile) {
        self.line("attempt-fix", &[("path", &file.path)]);
    }

    fn attempt(&mut self, _file: &EncryptedFile, attempt: &RepairAttempt) {
        self.progress.inc_candidate();
        let code = match attempt.direction {
            Direction::Decrement => "decrement",
            Direction::Increment => "increment",
        };
        self.line(code, &[("version", &attempt.candidate.to_string())]);
        if attempt.outcome == AttemptOutcome::Failure {
            debug!(candidate = attempt.candidate, "candidate rejected");
        }
    }

    fn verified(&mut self, file: &EncryptedFile, version: u32, result: &Verified) {
        debug!(path = %file.path, version, bytes = result.plaintext_len, checksum = %result.checksum, "content verified");
        self.said_ok = true;
        self.line("file-ok", &[("path", &file.path)]);
    }
}

/// One invocation of the repair command: walk, repair each file, report.
pub struct FixRun<'a, S: MetaStore + ?Sized, O: DecryptVerify + ?Sized, W: Write> {
    users: &'a UserDirectory,
    store: &'a mut S,
    oracle: &'a O,
    config: &'a RepairConfig,
    loc: FluentLoc,
    progress: Progress,
    out: W,
    recovered: bool,
}

impl<'a, S: MetaStore + ?Sized, O: DecryptVerify + ?Sized, W: Write> FixRun<'a, S, O, W> {
    pub fn new(
        users: &'a UserDirectory,
        store: &'a mut S,
        oracle: &'a O,
        config: &'a RepairConfig,
        out: W,
    ) -> Self {
        Self {
            users,
            store,
            oracle,
            config,
            loc: FluentLoc::builtin(&config.locale),
            progress: Progress::new(config.progress),
            out,
            recovered: false,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Visit every file of `target` (narrowed by `filter`) and repair it.
    ///
    /// For a single user, an unknown user or filter path aborts before any file
    /// is touched. In all-users mode a filter that does not exist for one user is
    /// reported and that user is passed over.
    ///
    /// Baselines left pending by an interrupted run are restored once the first
    /// target resolves, before any file is visited. A run that fails to resolve
    /// its target writes nothing.
    pub fn run(&mut self, target: &Target, filter: Option<&str>) -> Result<RepairReport, FixError> {
        let mut report = RepairReport::new();
        self.progress.start();
        let res = match target {
            Target::User(user) => self.run_user(user, filter, &mut report),
            Target::AllUsers => self.run_all(filter, &mut report),
        };
        self.progress.stop();
        res?;

        let s = report.summary();
        let total = (s.ok + s.fixed + s.unfixable + s.skipped).to_string();
        say(
            &mut self.out,
            &self.loc,
            "summary",
            &[
                ("total", &total),
                ("ok", &s.ok.to_string()),
                ("fixed", &s.fixed.to_string()),
                ("unfixable", &s.unfixable.to_string()),
                ("skipped", &s.skipped.to_string()),
            ],
        )?;
        info!(ok = s.ok, fixed = s.fixed, unfixable = s.unfixable, skipped = s.skipped, "run finished");
        Ok(report)
    }

    fn recover(&mut self) -> Result<(), FixError> {
        if self.recovered {
            return Ok(());
        }
        self.recovered = true;
        for (path, meta) in recover_interrupted(&mut *self.store)? {
            let version = meta.encrypted_version.to_string();
            say(&mut self.out, &self.loc, "recovered", &[("path", &path), ("version", &version)])?;
        }
        Ok(())
    }

    fn run_all(&mut self, filter: Option<&str>, report: &mut RepairReport) -> Result<(), FixError> {
        let users = self.users.users().map_err(FixError::ListUsers)?;
        for user in users {
            say(&mut self.out, &self.loc, "processing-user", &[("user", &user)])?;
            match self.run_user(&user, filter, report) {
                Ok(()) => {}
                Err(FixError::PathNotFound(p)) => report.mark_unresolved(p),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn run_user(
        &mut self,
        user: &str,
        filter: Option<&str>,
        report: &mut RepairReport,
    ) -> Result<(), FixError> {
        let files = match walk(self.users, user, filter, self.config.path_policy) {
            Ok(w) => w,
            Err(WalkError::UserNotFound(u)) => {
                say(&mut self.out, &self.loc, "user-missing", &[("user", &u)])?;
                return Err(FixError::UserNotFound(u));
            }
            Err(WalkError::PathNotFound(p)) => {
                say(&mut self.out, &self.loc, "path-missing", &[("path", &p)])?;
                return Err(FixError::PathNotFound(p));
            }
            Err(WalkError::UnsafePath { filter, source }) => {
                let reason = source.to_string();
                say(&mut self.out, &self.loc, "path-unsafe", &[("path", &filter), ("reason", &reason)])?;
                return Err(FixError::UnsafePath { filter, reason });
            }
        };
        self.recover()?;
        self.progress.set_stage(&format!("user {}", files.user()));

        for item in files {
            let entry = match item {
                Ok(entry) => entry,
                Err(skipped) => {
                    say(
                        &mut self.out,
                        &self.loc,
                        "skipped",
                        &[("path", &skipped.logical_path), ("reason", &skipped.reason)],
                    )?;
                    report.push(skipped.logical_path, RepairOutcome::Skipped { reason: skipped.reason });
                    continue;
                }
            };
            say(&mut self.out, &self.loc, "verify-start", &[("path", &entry.logical_path)])?;
            let Some(file) = EncryptedFile::load(&*self.store, &entry)? else {
                let reason = "no encryption metadata".to_string();
                say(&mut self.out, &self.loc, "skipped", &[("path", &entry.logical_path), ("reason", &reason)])?;
                report.push(entry.logical_path, RepairOutcome::Skipped { reason });
                continue;
            };

            let outcome = {
                let mut obs = TraceObserver {
                    out: &mut self.out,
                    loc: &self.loc,
                    progress: &self.progress,
                    said_ok: false,
                    error: None,
                };
                let mut engine =
                    RepairEngine::new(&mut *self.store, self.oracle, self.config.limits);
                let outcome = engine.inspect(&file, &mut obs)?;
                if let Some(e) = obs.error {
                    return Err(e.into());
                }
                if outcome == RepairOutcome::AlreadyOk && !obs.said_ok {
                    say(obs.out, obs.loc, "file-ok", &[("path", &file.path)])?;
                }
                outcome
            };
            self.verdict(&file, &outcome)?;
            self.progress.inc_file();
            report.push(file.path, outcome);
        }
        Ok(())
    }

    fn verdict(&mut self, file: &EncryptedFile, outcome: &RepairOutcome) -> io::Result<()> {
        let path = file.path.as_str();
        match outcome {
            RepairOutcome::AlreadyOk => Ok(()),
            RepairOutcome::Fixed { final_version } => {
                self.progress.inc_fixed();
                let v = final_version.to_string();
                say(&mut self.out, &self.loc, "fixed", &[("path", path), ("version", &v)])
            }
            RepairOutcome::Unfixable { restored_version, cause } => {
                let v = restored_version.to_string();
                match cause {
                    UnfixableCause::SearchExhausted => {
                        say(&mut self.out, &self.loc, "restored", &[("path", path), ("version", &v)])
                    }
                    UnfixableCause::ContentCorrupt => say(
                        &mut self.out,
                        &self.loc,
                        "content-corrupt",
                        &[("path", path), ("version", &v)],
                    ),
                    UnfixableCause::MalformedContent { reason } => say(
                        &mut self.out,
                        &self.loc,
                        "malformed",
                        &[("path", path), ("reason", reason)],
                    ),
                    UnfixableCause::OracleIo { reason } => say(
                        &mut self.out,
                        &self.loc,
                        "oracle-io",
                        &[("path", path), ("reason", reason)],
                    ),
                }
            }
            RepairOutcome::Skipped { reason } => {
                say(&mut self.out, &self.loc, "skipped", &[("path", path), ("reason", reason)])
            }
        }
    }
}
