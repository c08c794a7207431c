//! Event state machine.
//!
//! Collapses editor atomic-save bursts and paired rename events into single
//! remote operations. The machine is pure: filesystem checks go through
//! [`LocalFs`] and the result of each step is an [`Action`] for the engine
//! to carry out.

use crate::path::truncate_path;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Write,
    Remove,
    Rename,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Create => "create",
            EventKind::Write => "write",
            EventKind::Remove => "remove",
            EventKind::Rename => "rename",
        };
        f.write_str(name)
    }
}

/// One filesystem change, consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: EventKind,
}

impl FileEvent {
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Remote work produced by one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateFolders(PathBuf),
    Upload(PathBuf),
    Delete(PathBuf),
    /// Move the remote copy of `from` to the remote path of `to`.
    Rename { from: PathBuf, to: PathBuf },
}

/// Filesystem queries the machine depends on.
pub trait LocalFs {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
}

/// The real local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl LocalFs for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// Session mode. Each variant carries only the path it needs, so a swap
/// target and a rename source are never held at the same time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Idle,
    /// Absorbing an atomic save of `target`.
    Swapping { target: PathBuf },
    /// First half of a rename pair seen; `source` existed at that point.
    RenamePending { source: PathBuf },
}

#[derive(Debug, Default)]
pub struct SyncState {
    mode: SyncMode,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> &SyncMode {
        &self.mode
    }

    pub fn is_swapping(&self) -> bool {
        matches!(self.mode, SyncMode::Swapping { .. })
    }

    /// Feed one event; returns the remote action to take, if any.
    pub fn step<F: LocalFs>(&mut self, event: &FileEvent, fs: &F) -> Option<Action> {
        let path = &event.path;

        if let SyncMode::Swapping { target } = &self.mode {
            if event.kind != EventKind::Remove {
                return None;
            }
            let target = target.clone();
            warn!(
                "File '{}' finished to swap, update sent.",
                truncate_path(&target)
            );
            self.mode = SyncMode::Idle;
            return Some(Action::Upload(target));
        }

        match event.kind {
            EventKind::Create => {
                if self.start_swap(path, fs) {
                    return None;
                }
                if fs.is_dir(path) {
                    Some(Action::CreateFolders(path.clone()))
                } else {
                    Some(Action::Upload(path.clone()))
                }
            }
            EventKind::Write => {
                if fs.is_dir(path) {
                    debug!(path = %path.display(), "Ignoring write on directory");
                    return None;
                }
                Some(Action::Upload(path.clone()))
            }
            EventKind::Remove => Some(Action::Delete(path.clone())),
            EventKind::Rename => self.rename(path, fs),
        }
    }

    fn rename<F: LocalFs>(&mut self, path: &Path, fs: &F) -> Option<Action> {
        if fs.exists(path) {
            if let SyncMode::RenamePending { source } = &self.mode {
                debug!(previous = %source.display(), "Replacing pending rename source");
            }
            self.mode = SyncMode::RenamePending {
                source: path.to_path_buf(),
            };
            return None;
        }
        if self.start_swap(path, fs) {
            return None;
        }
        match std::mem::take(&mut self.mode) {
            SyncMode::RenamePending { source } => Some(Action::Rename {
                from: path.to_path_buf(),
                to: source,
            }),
            _ => Some(Action::Delete(path.to_path_buf())),
        }
    }

    fn start_swap<F: LocalFs>(&mut self, path: &Path, fs: &F) -> bool {
        let Some(target) = swap_target(path, fs) else {
            return false;
        };
        warn!(
            "File '{}' is swapping, next events will be ignored.",
            truncate_path(&target)
        );
        self.mode = SyncMode::Swapping { target };
        true
    }
}

/// Find the file an editor is atomically replacing through `path`.
///
/// A path that still exists is not a swap file. Otherwise the extension is
/// shortened one character at a time (`a.txt.swp`, `a.txt.sw`, `a.txt.s`,
/// `a.txt.`, `a.txt`) until an existing sibling file turns up. Running out
/// of extension means no swap.
pub fn swap_target<F: LocalFs>(path: &Path, fs: &F) -> Option<PathBuf> {
    if fs.exists(path) {
        return None;
    }
    shorten(path.to_path_buf(), fs)
}

fn shorten<F: LocalFs>(path: PathBuf, fs: &F) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        // dotfile, no extension to shorten
        return None;
    }

    let shorter = if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{}.{}", stem, &ext[..ext.len() - last_char_len(ext)])
    };
    let candidate = path.with_file_name(OsString::from(shorter));
    // only files are saved atomically
    if fs.exists(&candidate) && !fs.is_dir(&candidate) {
        return Some(candidate);
    }
    if ext.is_empty() {
        return None;
    }
    shorten(candidate, fs)
}

fn last_char_len(s: &str) -> usize {
    s.chars().next_back().map_or(0, char::len_utf8)
}
