//! Ignore filter scoped to the sync root.
//!
//! Patterns use gitignore syntax and are read from `<local root>/.syncignore`.
//! Matching is done against remote paths, so the matcher is rooted at the
//! remote root.

use crate::error::Result;
use crate::path::strip_home_prefix;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct SyncIgnore {
    root: PathBuf,
    matcher: Option<Gitignore>,
    /// Name of the ignore file inside the local root, once one is in place
    file_name: Option<String>,
}

impl SyncIgnore {
    /// Filter that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the ignore file for `local_root`, looking in the current working
    /// directory as a fallback.
    pub fn load(local_root: &Path, remote_root: &str, file_name: &str) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load_from(local_root, remote_root, file_name, &cwd)
    }

    /// Like [`load`](Self::load) with an explicit fallback directory.
    ///
    /// When the file is missing from `local_root` but present in `fallback_dir`,
    /// it is copied into `local_root` so later runs find it there.
    pub fn load_from(
        local_root: &Path,
        remote_root: &str,
        file_name: &str,
        fallback_dir: &Path,
    ) -> Result<Self> {
        let local_file = local_root.join(file_name);
        let source = if local_file.is_file() {
            local_file
        } else {
            let fallback = fallback_dir.join(file_name);
            if !fallback.is_file() {
                debug!(file = file_name, "No ignore file found");
                return Ok(Self::empty_at(remote_root));
            }
            std::fs::copy(&fallback, &local_file)?;
            info!(
                "Copied ignore file '{}' into '{}'",
                fallback.display(),
                local_root.display()
            );
            fallback
        };

        let text = std::fs::read_to_string(&source)?;
        let mut filter = Self::build(remote_root, Some(&source), text.lines())?;
        filter.file_name = Some(file_name.to_string());
        Ok(filter)
    }

    /// Build from in-memory patterns.
    pub fn from_patterns<'a, I>(remote_root: &str, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::build(remote_root, None, patterns)
    }

    fn empty_at(remote_root: &str) -> Self {
        Self {
            root: matcher_root(remote_root),
            matcher: None,
            file_name: None,
        }
    }

    fn build<'a, I>(remote_root: &str, origin: Option<&Path>, lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let root = matcher_root(remote_root);
        let mut builder = GitignoreBuilder::new(&root);
        for line in lines {
            builder.add_line(origin.map(Path::to_path_buf), line)?;
        }
        let matcher = builder.build()?;
        let matcher = if matcher.is_empty() { None } else { Some(matcher) };
        Ok(Self {
            root,
            matcher,
            file_name: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    /// The ignore file's name in the local root, if one was loaded. It does
    /// not count as local content when deciding whether to pull.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Whether `path` itself matches (whitelist rules win over ignores).
    ///
    /// Used during tree walks, where a matching directory prunes its subtree.
    pub fn matches(&self, path: &str, is_dir: bool) -> bool {
        match &self.matcher {
            Some(m) => m.matched(self.normalize(path), is_dir).is_ignore(),
            None => false,
        }
    }

    /// Whether `path` or any of its parent directories under the root matches.
    ///
    /// Used for single events, which carry no walk context.
    pub fn matches_with_parents(&self, path: &str, is_dir: bool) -> bool {
        if self.matches(path, is_dir) {
            return true;
        }
        let normalized = self.normalize(path);
        let mut current = normalized.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() || dir == self.root {
                break;
            }
            if self.matches(&dir.to_string_lossy(), true) {
                return true;
            }
            current = dir.parent();
        }
        false
    }

    fn normalize(&self, path: &str) -> PathBuf {
        PathBuf::from(strip_home_prefix(path))
    }
}

fn matcher_root(remote_root: &str) -> PathBuf {
    let root = strip_home_prefix(remote_root).trim_end_matches('/');
    PathBuf::from(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_matches_nothing() {
        let filter = SyncIgnore::empty();
        assert!(filter.is_empty());
        assert!(!filter.matches("app/anything", false));
    }

    #[test]
    fn test_patterns_scoped_to_remote_root() -> anyhow::Result<()> {
        let filter = SyncIgnore::from_patterns(
            "~/app/",
            ["node_modules/", "*.log", "!keep.log", "/build"],
        )?;

        assert!(filter.matches("app/node_modules", true));
        assert!(!filter.matches("app/node_modules", false));
        assert!(filter.matches("app/logs/server.log", false));
        assert!(!filter.matches("app/keep.log", false));
        assert!(filter.matches("app/build", true));
        assert!(!filter.matches("app/src/build", true));
        assert!(!filter.matches("app/src/main.go", false));
        // home prefix is accepted on queried paths too
        assert!(filter.matches("~/app/x.log", false));
        Ok(())
    }

    #[test]
    fn test_matches_with_parents() -> anyhow::Result<()> {
        let filter = SyncIgnore::from_patterns("app", ["vendor/"])?;
        assert!(!filter.matches("app/vendor/lib/a.go", false));
        assert!(filter.matches_with_parents("app/vendor/lib/a.go", false));
        assert!(!filter.matches_with_parents("app/src/a.go", false));
        Ok(())
    }

    #[test]
    fn test_load_from_local_root() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let cwd = TempDir::new()?;
        std::fs::write(root.path().join(".syncignore"), "*.tmp\n")?;

        let filter = SyncIgnore::load_from(root.path(), "app", ".syncignore", cwd.path())?;
        assert!(filter.matches("app/x.tmp", false));
        Ok(())
    }

    #[test]
    fn test_load_copies_fallback_into_root() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let cwd = TempDir::new()?;
        std::fs::write(cwd.path().join(".syncignore"), "cache/\n")?;

        let filter = SyncIgnore::load_from(root.path(), "app", ".syncignore", cwd.path())?;
        assert!(filter.matches("app/cache", true));
        assert_eq!(filter.file_name(), Some(".syncignore"));
        assert_eq!(
            std::fs::read_to_string(root.path().join(".syncignore"))?,
            "cache/\n"
        );
        Ok(())
    }

    #[test]
    fn test_load_without_any_file() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let cwd = TempDir::new()?;
        let filter = SyncIgnore::load_from(root.path(), "app", ".syncignore", cwd.path())?;
        assert!(filter.is_empty());
        assert_eq!(filter.file_name(), None);
        assert!(!root.path().join(".syncignore").exists());
        Ok(())
    }
}
