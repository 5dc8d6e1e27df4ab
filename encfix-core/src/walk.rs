use crate::path_safety::{validate_path, PathError, PathPolicy};
use crate::users::{UserDirectory, UserTree};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("user {0} does not exist")]
    UserNotFound(String),
    #[error("path {0} does not exist")]
    PathNotFound(String),
    #[error("refusing path filter {filter}: {source}")]
    UnsafePath {
        filter: String,
        #[source]
        source: PathError,
    },
}

/// A regular file found under a user's tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub logical_path: String,
    pub disk_path: PathBuf,
    pub size: u64,
}

/// An entry the walk could not turn into a [`TreeEntry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedEntry {
    pub logical_path: String,
    pub reason: String,
}

enum Source {
    Single(Option<TreeEntry>),
    Tree(walkdir::IntoIter),
}

/// Lazy, single-pass sequence of files under one user's tree.
pub struct FileWalk {
    tree: UserTree,
    source: Source,
    canonical_root: Option<PathBuf>,
}

impl FileWalk {
    pub fn user(&self) -> &str {
        &self.tree.user
    }

    fn logical(&self, disk: &Path) -> String {
        let rel = pathdiff::diff_paths(disk, &self.tree.files_root)
            .unwrap_or_else(|| disk.to_path_buf());
        logical_path(&self.tree, &rel)
    }

    fn next_in_tree(&mut self) -> Option<Result<TreeEntry, SkippedEntry>> {
        loop {
            let Source::Tree(it) = &mut self.source else {
                return None;
            };
            let ent = match it.next()? {
                Ok(ent) => ent,
                Err(e) => {
                    let logical = e
                        .path()
                        .map(|p| self.logical(p))
                        .unwrap_or_else(|| self.tree.logical_root());
                    return Some(Err(SkippedEntry { logical_path: logical, reason: e.to_string() }));
                }
            };
            if !ent.file_type().is_file() {
                if ent.path_is_symlink() {
                    debug!(path = %ent.path().display(), "not following symlink");
                }
                continue;
            }
            let logical_path = self.logical(ent.path());
            if let Some(root) = &self.canonical_root {
                let escapes = std::fs::canonicalize(ent.path())
                    .map(|p| !p.starts_with(root))
                    .unwrap_or(true);
                if escapes {
                    return Some(Err(SkippedEntry {
                        logical_path,
                        reason: "symlink target escapes the user's tree".into(),
                    }));
                }
            }
            return Some(match ent.metadata() {
                Ok(md) => Ok(TreeEntry {
                    logical_path,
                    disk_path: ent.path().to_path_buf(),
                    size: md.len(),
                }),
                Err(e) => Err(SkippedEntry { logical_path, reason: e.to_string() }),
            });
        }
    }
}

impl Iterator for FileWalk {
    type Item = Result<TreeEntry, SkippedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Source::Single(slot) = &mut self.source {
            return slot.take().map(Ok);
        }
        self.next_in_tree()
    }
}

fn logical_path(tree: &UserTree, rel: &Path) -> String {
    let rel = rel.to_string_lossy().replace('\\', "/");
    let rel = rel.trim_matches('/');
    if rel.is_empty() {
        tree.logical_root()
    } else {
        format!("{}/{}", tree.logical_root(), rel)
    }
}

/// Files to visit for `user`, optionally narrowed by `filter`.
///
/// The filter is relative to the user's file root (a leading `/` is allowed).
/// A file filter yields exactly that file; a directory filter yields every
/// regular file strictly beneath it, depth first with siblings sorted by file
/// name. A directory's contents therefore come right after the directory, so
/// `a/x` is visited before `a.txt` even though `a.txt` sorts first as a full
/// path. Nothing is yielded when the user or the filter does not resolve.
pub fn walk(
    users: &UserDirectory,
    user: &str,
    filter: Option<&str>,
    policy: PathPolicy,
) -> Result<FileWalk, WalkError> {
    let tree = users.resolve(user).ok_or_else(|| WalkError::UserNotFound(user.to_string()))?;
    let filter = filter.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty());

    let target = match filter {
        None => tree.files_root.clone(),
        Some(f) => match validate_path(&tree.files_root, Path::new(f), policy) {
            Ok(p) => p,
            Err(PathError::Missing(_)) => {
                return Err(WalkError::PathNotFound(logical_path(&tree, Path::new(f))))
            }
            Err(source) => return Err(WalkError::UnsafePath { filter: f.to_string(), source }),
        },
    };

    let md = std::fs::metadata(&target)
        .map_err(|_| WalkError::PathNotFound(logical_path(&tree, Path::new(filter.unwrap_or("")))))?;
    let canonical_root = if policy.follow_symlinks {
        std::fs::canonicalize(&tree.files_root).ok()
    } else {
        None
    };

    let source = if md.is_file() {
        let rel = Path::new(filter.unwrap_or(""));
        Source::Single(Some(TreeEntry {
            logical_path: logical_path(&tree, rel),
            disk_path: target,
            size: md.len(),
        }))
    } else if md.is_dir() {
        let it = WalkDir::new(&target)
            .min_depth(1)
            .follow_links(policy.follow_symlinks)
            .sort_by_file_name()
            .into_iter();
        Source::Tree(it)
    } else {
        return Err(WalkError::PathNotFound(logical_path(&tree, Path::new(filter.unwrap_or("")))));
    };

    Ok(FileWalk { tree, source, canonical_root })
}
