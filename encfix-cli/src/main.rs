use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use encfix_core::config::{RepairConfig, SearchLimits};
use encfix_core::format::{seal, MasterKey};
use encfix_core::oracle::SealedBlockOracle;
use encfix_core::path_safety::{normalize, PathPolicy};
use encfix_core::run::{FixError, FixRun, Target};
use encfix_core::scan::scan_path;
use encfix_core::store::{JsonMetaStore, MetaStore, VersionMeta};
use encfix_core::users::UserDirectory;

#[derive(Parser)]
#[command(name = "encfix", version, about = "Repair encrypted-version metadata that disagrees with file content")]
struct Cli {
    /// Debug-level diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Only errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Verify files and repair their encrypted-version metadata
    Fix {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        key_file: PathBuf,
        /// User whose files are checked
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        user: Option<String>,
        /// Check every user under the data directory
        #[arg(long)]
        all: bool,
        /// File or directory relative to the user's files, e.g. /Documents
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = false)]
        follow_symlinks: bool,
        #[arg(long, default_value_t = false)]
        progress: bool,
        /// Write a JSON report of every outcome
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long, default_value_t = SearchLimits::default().max_candidates)]
        max_candidates: u32,
    },
    /// Encrypt a file into a user's tree and record its metadata
    Seal {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        key_file: PathBuf,
        user: String,
        rel_path: String,
        source: PathBuf,
        /// 0 stores the file unencrypted
        #[arg(long, default_value_t = 1)]
        version: u32,
    },
    /// Show stored metadata next to the block tag found in the content
    Stat {
        #[arg(long)]
        data_dir: PathBuf,
        user: String,
        rel_path: String,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    match cli.cmd {
        Cmd::Fix { data_dir, key_file, user, all: _, path, follow_symlinks, progress, report, max_candidates } => {
            let config = RepairConfig {
                path_policy: PathPolicy { follow_symlinks },
                limits: SearchLimits { max_candidates },
                progress,
                ..RepairConfig::default()
            };
            let target = match user {
                Some(u) => Target::User(u),
                None => Target::AllUsers,
            };
            fix(&data_dir, &key_file, &target, path.as_deref(), &config, report.as_deref())
        }
        Cmd::Seal { data_dir, key_file, user, rel_path, source, version } => {
            seal_into(&data_dir, &key_file, &user, &rel_path, &source, version)?;
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Stat { data_dir, user, rel_path } => {
            stat(&data_dir, &user, &rel_path)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `ENCFIX_LOG` > `RUST_LOG` > `-v`/`-q`; diagnostics go to stderr so stdout
/// carries only the operator lines.
fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::ERROR
    } else {
        Level::WARN
    };
    let filter = std::env::var("ENCFIX_LOG")
        .ok()
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level.as_str()));
    let layer = fmt::layer().with_writer(io::stderr).with_target(verbose).without_time();
    tracing_subscriber::registry().with(filter).with(layer).init();
}

fn fix(
    data_dir: &Path,
    key_file: &Path,
    target: &Target,
    filter: Option<&str>,
    config: &RepairConfig,
    report_path: Option<&Path>,
) -> Result<ExitCode> {
    let key = MasterKey::from_file(key_file)?;
    let oracle = SealedBlockOracle::new(key);
    let users = UserDirectory::new(data_dir);
    let mut store = JsonMetaStore::open(data_dir)
        .with_context(|| format!("open metadata store in {}", data_dir.display()))?;

    let stdout = io::stdout();
    let mut run = FixRun::new(&users, &mut store, &oracle, config, stdout.lock());
    let report = match run.run(target, filter) {
        Ok(report) => report,
        // Already explained on stdout.
        Err(FixError::UserNotFound(_) | FixError::PathNotFound(_) | FixError::UnsafePath { .. }) => {
            return Ok(ExitCode::FAILURE)
        }
        Err(e) => return Err(e.into()),
    };
    run.into_output().flush()?;

    if let Some(p) = report_path {
        fs::write(p, report.to_json_pretty()?)
            .with_context(|| format!("write report {}", p.display()))?;
    }
    Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn logical_path(root: &str, rel: &Path) -> String {
    format!("{}/{}", root, rel.to_string_lossy().replace('\\', "/"))
}

fn seal_into(
    data_dir: &Path,
    key_file: &Path,
    user: &str,
    rel_path: &str,
    source: &Path,
    version: u32,
) -> Result<()> {
    let rel = normalize(Path::new(rel_path))?;
    if rel.as_os_str().is_empty() {
        bail!("relative path {rel_path:?} names no file");
    }
    let key = MasterKey::from_file(key_file)?;
    let tree = UserDirectory::new(data_dir).ensure(user)?;
    let mut store = JsonMetaStore::open(data_dir)
        .with_context(|| format!("open metadata store in {}", data_dir.display()))?;

    let dest = tree.files_root.join(&rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut input = BufReader::new(
        File::open(source).with_context(|| format!("open {}", source.display()))?,
    );
    let mut out = BufWriter::new(
        File::create(&dest).with_context(|| format!("create {}", dest.display()))?,
    );
    if version == 0 {
        io::copy(&mut input, &mut out)?;
    } else {
        seal(&mut input, &mut out, &key, version)?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    let size = fs::metadata(&dest)?.len();
    let logical = logical_path(&tree.logical_root(), &rel);
    let rec = store.insert(&logical, size, VersionMeta::at(version))?;
    println!("Sealed {} as version {} (id {}, {} bytes)", rec.path, version, rec.id, size);
    Ok(())
}

fn stat(data_dir: &Path, user: &str, rel_path: &str) -> Result<()> {
    let users = UserDirectory::new(data_dir);
    let Some(tree) = users.resolve(user) else {
        bail!("user {user} does not exist");
    };
    let rel = normalize(Path::new(rel_path))?;
    let logical = logical_path(&tree.logical_root(), &rel);
    let store = JsonMetaStore::open(data_dir)
        .with_context(|| format!("open metadata store in {}", data_dir.display()))?;

    match store.get(&logical)? {
        Some(rec) => println!(
            "{}: id {} size {} declared version {} encrypted {}",
            rec.path, rec.id, rec.size, rec.meta.encrypted_version, rec.meta.encrypted
        ),
        None => println!("{logical}: no metadata"),
    }
    let disk = tree.files_root.join(&rel);
    match scan_path(&disk).with_context(|| format!("scan {}", disk.display()))? {
        Some(s) => println!(
            "  content: block version {} ({} blocks, {} transitions{}{})",
            s.version,
            s.blocks,
            s.transitions,
            if s.sealed { "" } else { ", plaintext" },
            if s.torn_tail { ", torn tail" } else { "" },
        ),
        None => println!("  content: empty"),
    }
    Ok(())
}
