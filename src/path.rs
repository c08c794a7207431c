//! Local <-> remote path mapping.
//!
//! Mapping is a pure function of the two session roots and the input path.
//! Remote paths always use forward slashes.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

/// Maps paths under the local sync root onto the remote root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    local_root: PathBuf,
    remote_root: String,
}

impl PathMapper {
    /// Build a mapper. A trailing separator on `local_root` is trimmed and
    /// `remote_root` is stored in canonical form (ending with `/`).
    pub fn new(local_root: impl Into<PathBuf>, remote_root: impl Into<String>) -> Self {
        let local_root = trim_trailing_separator(local_root.into());
        let mut remote_root = remote_root.into().replace('\\', "/");
        if !remote_root.ends_with('/') {
            remote_root.push('/');
        }
        Self {
            local_root,
            remote_root,
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Remote root in canonical form, always ending with `/`.
    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Path of `path` relative to the local root, forward-slash separated,
    /// without a leading slash. Paths outside the root are returned whole
    /// (normalised the same way).
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.local_root).unwrap_or(path);
        let joined = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                Component::ParentDir => Some("..".to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        joined.trim_start_matches('/').to_string()
    }

    /// `remote_root + relative(path)`
    pub fn to_remote(&self, path: &Path) -> String {
        format!("{}{}", self.remote_root, self.relative(path))
    }

    /// Inverse of [`to_remote`](Self::to_remote) for paths under the remote root.
    pub fn to_local(&self, remote_path: &str) -> PathBuf {
        let rel = remote_path
            .strip_prefix(self.remote_root.as_str())
            .or_else(|| remote_path.strip_prefix(self.remote_root.trim_end_matches('/')))
            .unwrap_or(remote_path)
            .trim_start_matches('/');
        let mut local = self.local_root.clone();
        for part in rel.split('/').filter(|p| !p.is_empty()) {
            local.push(part);
        }
        local
    }
}

fn trim_trailing_separator(path: PathBuf) -> PathBuf {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches(['/', MAIN_SEPARATOR]);
    if trimmed.is_empty() || trimmed.len() == text.len() {
        return path;
    }
    PathBuf::from(trimmed)
}

/// Strip a leading `~/` home prefix; remote tools resolve relative paths
/// against the login directory already.
pub fn strip_home_prefix(remote_path: &str) -> &str {
    remote_path.strip_prefix("~/").unwrap_or(remote_path)
}

/// Shorten a path for display: keep only the last three components.
pub fn truncate_path(path: impl AsRef<Path>) -> String {
    let text = path.as_ref().to_string_lossy().replace('\\', "/");
    let parts: Vec<&str> = text.split('/').collect();
    if parts.len() <= 3 {
        return text;
    }
    format!("...{}", parts[parts.len() - 3..].join("/"))
}

/// Join remote path segments with `/`, ignoring empty pieces.
pub fn join_remote(base: &str, child: &str) -> String {
    match (base.trim_end_matches('/'), child.trim_start_matches('/')) {
        ("", child) => child.to_string(),
        (base, "") => base.to_string(),
        (base, child) => format!("{}/{}", base, child),
    }
}

/// Final component of a remote path.
pub fn remote_basename(remote_path: &str) -> &str {
    let trimmed = remote_path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parent of a remote path, `"."` when there is none.
pub fn remote_parent(remote_path: &str) -> &str {
    let trimmed = remote_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => ".",
    }
}
