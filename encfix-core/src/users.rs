use std::io;
use std::path::PathBuf;

/// Maps user ids to their file trees under a data directory.
///
/// Layout: `<data_dir>/<user>/files/...`. A user exists when their `files`
/// directory exists; an existing user may well have an empty tree.
#[derive(Clone, Debug)]
pub struct UserDirectory {
    data_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserTree {
    pub user: String,
    pub files_root: PathBuf,
}

impl UserTree {
    /// Logical prefix used for every path in this tree, `/<user>/files`.
    pub fn logical_root(&self) -> String {
        format!("/{}/files", self.user)
    }
}

fn is_valid_user_id(user: &str) -> bool {
    !user.is_empty()
        && user != "."
        && user != ".."
        && !user.contains(['/', '\\'])
        && !user.chars().any(char::is_control)
}

impl UserDirectory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn resolve(&self, user: &str) -> Option<UserTree> {
        if !is_valid_user_id(user) {
            return None;
        }
        let files_root = self.data_dir.join(user).join("files");
        files_root.is_dir().then(|| UserTree { user: user.to_string(), files_root })
    }

    /// Create the tree for `user` if it does not exist yet.
    pub fn ensure(&self, user: &str) -> io::Result<UserTree> {
        if !is_valid_user_id(user) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid user id {user:?}"),
            ));
        }
        let files_root = self.data_dir.join(user).join("files");
        std::fs::create_dir_all(&files_root)?;
        Ok(UserTree { user: user.to_string(), files_root })
    }

    /// All known users, sorted by id.
    pub fn users(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        for ent in std::fs::read_dir(&self.data_dir)? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = ent.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if is_valid_user_id(&name) && ent.path().join("files").is_dir() {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_invalid_users_do_not_resolve() {
        let td = tempfile::tempdir().unwrap();
        let dir = UserDirectory::new(td.path());
        dir.ensure("alice").unwrap();
        std::fs::create_dir_all(td.path().join("stray")).unwrap();
        assert!(dir.resolve("alice").is_some());
        assert!(dir.resolve("bob").is_none());
        assert!(dir.resolve("stray").is_none());
        assert!(dir.resolve("..").is_none());
        assert!(dir.resolve("").is_none());
        assert_eq!(dir.users().unwrap(), vec!["alice".to_string()]);
    }
}
