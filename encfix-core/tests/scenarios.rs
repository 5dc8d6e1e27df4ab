use encfix_core::config::RepairConfig;
use encfix_core::format::{seal, MasterKey};
use encfix_core::oracle::SealedBlockOracle;
use encfix_core::report::{RepairOutcome, UnfixableCause};
use encfix_core::run::{FixError, FixRun, Target};
use encfix_core::store::{MemoryMetaStore, MetaStore, VersionMeta};
use encfix_core::users::UserDirectory;

const SECRET: &[u8] = b"scenario master secret";

struct Fixture {
    _td: tempfile::TempDir,
    users: UserDirectory,
    store: MemoryMetaStore,
    key: MasterKey,
}

impl Fixture {
    fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        let users = UserDirectory::new(td.path());
        Self { _td: td, users, store: MemoryMetaStore::new(), key: MasterKey::from_secret(SECRET) }
    }

    /// Seal `plain` under `sealed_with` into `rel` and record `declared` in the store.
    fn put(&mut self, user: &str, rel: &str, plain: &[u8], sealed_with: u32, declared: u32) -> String {
        let key = self.key.clone();
        self.put_raw(user, rel, declared, |out| {
            if sealed_with == 0 {
                out.extend_from_slice(plain);
            } else {
                seal(plain, out, &key, sealed_with).unwrap();
            }
        })
    }

    fn put_raw(&mut self, user: &str, rel: &str, declared: u32, fill: impl FnOnce(&mut Vec<u8>)) -> String {
        let tree = self.users.ensure(user).unwrap();
        let disk = tree.files_root.join(rel);
        std::fs::create_dir_all(disk.parent().unwrap()).unwrap();
        let mut bytes = Vec::new();
        fill(&mut bytes);
        std::fs::write(&disk, &bytes).unwrap();
        let logical = format!("{}/{}", tree.logical_root(), rel);
        self.store.insert(&logical, bytes.len() as u64, VersionMeta::at(declared)).unwrap();
        logical
    }

    fn declared(&self, logical: &str) -> u32 {
        self.store.get(logical).unwrap().unwrap().meta.encrypted_version
    }

    fn run(
        &mut self,
        target: Target,
        filter: Option<&str>,
    ) -> (Result<encfix_core::report::RepairReport, FixError>, String) {
        let oracle = SealedBlockOracle::new(self.key.clone());
        let config = RepairConfig::default();
        let mut run = FixRun::new(&self.users, &mut self.store, &oracle, &config, Vec::new());
        let res = run.run(&target, filter);
        let out = String::from_utf8(run.into_output()).unwrap();
        (res, out)
    }
}

fn user(u: &str) -> Target {
    Target::User(u.to_string())
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| rng.u8(..)).collect()
}

fn trace_lines(out: &str) -> Vec<&str> {
    out.lines()
        .filter(|l| l.starts_with("Decrement") || l.starts_with("Increment"))
        .collect()
}

#[test]
fn scenario_a_decrements_then_climbs_to_the_block_version() {
    let mut fx = Fixture::new();
    let path = fx.put("alice", "a.txt", &payload(20_000, 1), 5, 2);

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert_eq!(
        trace_lines(&out),
        vec![
            "Decrement the encrypted version to 1",
            "Increment the encrypted version to 3",
            "Increment the encrypted version to 4",
            "Increment the encrypted version to 5",
        ]
    );
    assert!(out.contains(&format!("Verifying the content of file \"{path}\"")));
    assert!(out.contains(&format!("Attempting to fix the path: \"{path}\"")));
    assert!(out.contains(&format!("Fixed the file: \"{path}\" with version 5")));
    assert_eq!(report.outcome_of(&path), Some(&RepairOutcome::Fixed { final_version: 5 }));
    assert_eq!(fx.declared(&path), 5);
    assert!(report.is_success());
}

#[test]
fn scenario_b_two_steps_down() {
    let mut fx = Fixture::new();
    let path = fx.put("alice", "docs/b.txt", b"hello block world", 4, 6);

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert_eq!(
        trace_lines(&out),
        vec!["Decrement the encrypted version to 5", "Decrement the encrypted version to 4"]
    );
    assert!(out.contains(&format!("The file \"{path}\" is: OK")));
    assert!(out.contains(&format!("Fixed the file: \"{path}\" with version 4")));
    assert_eq!(report.outcome_of(&path), Some(&RepairOutcome::Fixed { final_version: 4 }));
    assert_eq!(fx.declared(&path), 4);
}

#[test]
fn scenario_c_no_candidate_restores_declared_version() {
    let mut fx = Fixture::new();
    let foreign = MasterKey::from_secret(b"some other instance");
    let path = fx.put_raw("alice", "c.txt", 15, |out| {
        seal(&payload(9_000, 3)[..], out, &foreign, 20).unwrap();
    });

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert!(out.contains(&format!(
        "No fix found for \"{path}\", restored version to original: 15"
    )));
    assert_eq!(
        report.outcome_of(&path),
        Some(&RepairOutcome::Unfixable {
            restored_version: 15,
            cause: UnfixableCause::SearchExhausted
        })
    );
    // Read back from the store, not the console.
    assert_eq!(fx.store.get(&path).unwrap().unwrap().meta, VersionMeta::at(15));
    assert_eq!(fx.store.writes(), 0);
    assert!(!report.is_success());
}

#[test]
fn scenario_d_missing_filter_path() {
    let mut fx = Fixture::new();
    fx.put("alice", "a.txt", b"content", 1, 1);

    let (res, out) = fx.run(user("alice"), Some("/non-exist"));

    assert!(out.contains("Please provide a valid path."));
    assert!(!out.contains("Verifying"));
    assert!(matches!(res, Err(FixError::PathNotFound(p)) if p == "/alice/files/non-exist"));
}

#[test]
fn scenario_e_missing_user() {
    let mut fx = Fixture::new();
    fx.put("alice", "a.txt", b"content", 1, 1);

    let (res, out) = fx.run(user("mallory"), None);

    assert!(out.contains("User id mallory does not exist"));
    assert!(!out.contains("Verifying"));
    assert!(matches!(res, Err(FixError::UserNotFound(u)) if u == "mallory"));
}

#[test]
fn plaintext_with_stale_version_is_fixed_to_zero() {
    let mut fx = Fixture::new();
    let path = fx.put("alice", "plain.txt", b"never encrypted", 0, 3);

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert_eq!(
        trace_lines(&out),
        vec![
            "Decrement the encrypted version to 2",
            "Decrement the encrypted version to 1",
            "Decrement the encrypted version to 0",
        ]
    );
    assert_eq!(report.outcome_of(&path), Some(&RepairOutcome::Fixed { final_version: 0 }));
    let meta = fx.store.get(&path).unwrap().unwrap().meta;
    assert_eq!(meta, VersionMeta { encrypted_version: 0, encrypted: false });
}

#[test]
fn agreeing_versions_that_fail_are_content_corruption() {
    let mut fx = Fixture::new();
    let path = fx.put_raw("alice", "rot.bin", 2, |out| {
        let key = MasterKey::from_secret(SECRET);
        seal(&payload(4_000, 9)[..], &mut *out, &key, 2).unwrap();
        let mid = out.len() / 2;
        out[mid] ^= 0x40;
    });

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert!(trace_lines(&out).is_empty());
    assert_eq!(
        report.outcome_of(&path),
        Some(&RepairOutcome::Unfixable { restored_version: 2, cause: UnfixableCause::ContentCorrupt })
    );
    assert_eq!(fx.store.writes(), 0);
}

#[test]
fn malformed_file_does_not_disturb_its_neighbours() {
    let mut fx = Fixture::new();
    let a = fx.put("alice", "a.txt", b"first", 3, 2);
    let bad = fx.put_raw("alice", "b.txt", 1, |out| {
        out.extend_from_slice(b"EVB1");
        out.extend_from_slice(&[0xEE; 60]);
    });
    let c = fx.put("alice", "c.txt", b"third", 1, 1);

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert_eq!(report.entries().len(), 3);
    assert_eq!(report.outcome_of(&a), Some(&RepairOutcome::Fixed { final_version: 3 }));
    assert!(matches!(
        report.outcome_of(&bad),
        Some(RepairOutcome::Unfixable { restored_version: 1, cause: UnfixableCause::MalformedContent { .. } })
    ));
    assert_eq!(report.outcome_of(&c), Some(&RepairOutcome::AlreadyOk));
    assert!(out.contains("has a malformed block layout"));
    assert_eq!(fx.declared(&bad), 1);
}

#[test]
fn single_file_filter_reports_exactly_that_file() {
    let mut fx = Fixture::new();
    fx.put("alice", "a.txt", b"a", 2, 1);
    let target = fx.put("alice", "sub/b.txt", b"b", 2, 1);
    fx.put("alice", "sub/c.txt", b"c", 2, 1);

    let (res, _) = fx.run(user("alice"), Some("/sub/b.txt"));
    let report = res.unwrap();

    assert_eq!(report.entries().len(), 1);
    assert_eq!(report.entries()[0].path, target);
}

#[test]
fn files_without_metadata_are_skipped() {
    let mut fx = Fixture::new();
    let tree = fx.users.ensure("alice").unwrap();
    std::fs::write(tree.files_root.join("stray.bin"), b"untracked").unwrap();

    let (res, out) = fx.run(user("alice"), None);
    let report = res.unwrap();

    assert!(matches!(
        report.outcome_of("/alice/files/stray.bin"),
        Some(RepairOutcome::Skipped { .. })
    ));
    assert!(report.is_success());
    assert!(out.contains("Skipping \"/alice/files/stray.bin\""));
}

#[test]
fn empty_file_is_ok_without_a_search() {
    let mut fx = Fixture::new();
    let path = fx.put_raw("alice", "empty", 4, |_| {});

    let (res, out) = fx.run(user("alice"), None);

    assert_eq!(res.unwrap().outcome_of(&path), Some(&RepairOutcome::AlreadyOk));
    assert!(out.contains(&format!("The file \"{path}\" is: OK")));
    assert_eq!(fx.store.writes(), 0);
}

#[test]
fn all_users_mode_visits_everyone_and_notes_missing_filters() {
    let mut fx = Fixture::new();
    let a = fx.put("alice", "docs/a.txt", b"a", 2, 1);
    let b = fx.put("bob", "other/b.txt", b"b", 1, 1);

    let (res, out) = fx.run(Target::AllUsers, None);
    let report = res.unwrap();
    assert!(out.contains("Processing files for alice"));
    assert!(out.contains("Processing files for bob"));
    assert_eq!(report.outcome_of(&a), Some(&RepairOutcome::Fixed { final_version: 2 }));
    assert_eq!(report.outcome_of(&b), Some(&RepairOutcome::AlreadyOk));

    let (res, out) = fx.run(Target::AllUsers, Some("/docs"));
    let report = res.unwrap();
    assert_eq!(report.entries().len(), 1);
    assert!(out.contains("Path \"/bob/files/docs\" does not exist."));
    assert_eq!(report.unresolved(), ["/bob/files/docs".to_string()]);
    assert!(!report.is_success());
}

#[test]
fn interrupted_baselines_wait_for_a_resolved_target() {
    let mut fx = Fixture::new();
    // Sealed at 1, but an interrupted speculative write left 9 behind.
    let a = fx.put("alice", "a.txt", b"content", 1, 9);
    fx.store.note_pending(&a, VersionMeta::at(1)).unwrap();

    let (res, out) = fx.run(user("mallory"), None);
    assert!(matches!(res, Err(FixError::UserNotFound(_))));
    assert!(!out.contains("Restored"));
    assert_eq!(fx.store.writes(), 0);
    assert_eq!(fx.store.pending().unwrap().len(), 1);

    let (res, out) = fx.run(user("alice"), Some("/non-exist"));
    assert!(matches!(res, Err(FixError::PathNotFound(_))));
    assert_eq!(fx.store.writes(), 0);
    assert_eq!(fx.declared(&a), 9);

    let (res, out_ok) = fx.run(user("alice"), None);
    let report = res.unwrap();
    assert!(!out.contains("Restored"));
    assert!(out_ok.contains(&format!("Restored version 1 of \"{a}\" left by an interrupted repair")));
    assert_eq!(report.outcome_of(&a), Some(&RepairOutcome::AlreadyOk));
    assert_eq!(fx.declared(&a), 1);
    assert!(fx.store.pending().unwrap().is_empty());
}
