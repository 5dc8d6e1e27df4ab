use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("parent traversal not allowed: {0:?}")]
    ParentTraversal(PathBuf),
    #[error("symlink encountered (not following): {0:?}")]
    Symlink(PathBuf),
    #[error("path escapes root: {0:?}")]
    Escapes(PathBuf),
    #[error("path does not exist: {0:?}")]
    Missing(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Drop root, prefix and `.` components; refuse `..`.
///
/// Filters are given relative to a user's file root, so a leading `/` means
/// "the user's root", not the filesystem root.
pub fn normalize(rel: &Path) -> Result<PathBuf, PathError> {
    let mut out = PathBuf::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => return Err(PathError::ParentTraversal(rel.to_path_buf())),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

/// Resolve `rel` under `root`, refusing anything that could leave it.
///
/// Without `follow_symlinks` any symlink on the way is rejected. With it, the
/// canonical target must still live under the canonical root.
pub fn validate_path(root: &Path, rel: &Path, policy: PathPolicy) -> Result<PathBuf, PathError> {
    let clean = normalize(rel)?;
    let candidate = root.join(&clean);
    match std::fs::symlink_metadata(&candidate) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PathError::Missing(candidate))
        }
        Err(e) => return Err(e.into()),
    }
    if !policy.follow_symlinks {
        let mut cur = root.to_path_buf();
        for comp in clean.components() {
            cur.push(comp);
            if std::fs::symlink_metadata(&cur)?.file_type().is_symlink() {
                return Err(PathError::Symlink(cur));
            }
        }
        return Ok(candidate);
    }
    let root_can = std::fs::canonicalize(root)?;
    let cand_can = match std::fs::canonicalize(&candidate) {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PathError::Missing(candidate))
        }
        Err(e) => return Err(e.into()),
    };
    if !cand_can.starts_with(&root_can) {
        return Err(PathError::Escapes(clean));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_slash_is_relative_to_root() {
        assert_eq!(normalize(Path::new("/sub/./a.txt")).unwrap(), PathBuf::from("sub/a.txt"));
    }

    #[test]
    fn parent_components_are_refused() {
        assert!(matches!(
            normalize(Path::new("sub/../../etc")),
            Err(PathError::ParentTraversal(_))
        ));
    }
}
