//! Sync session: initial pull, then live mirroring of local changes.

use crate::config::{SyncConfig, DEFAULT_EVENT_QUEUE_CAPACITY};
use crate::error::{Result, SyncError};
use crate::filter::SyncIgnore;
use crate::path::{truncate_path, PathMapper};
use crate::sync::state::{Action, FileEvent, LocalFs, RealFs, SyncState};
use crate::sync::watcher::EventWatcher;
use crate::transport::{Content, RemoteTransport};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Session settings that do not change once watching starts.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Pull from the remote even when the local root is not empty
    pub force_sync: bool,
    /// Extensions (without the dot) whose events never reach the state machine
    pub ignored_extensions: Vec<String>,
    pub event_queue_capacity: usize,
    pub ignore: Arc<SyncIgnore>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_sync: false,
            ignored_extensions: vec!["swp".to_string(), "swx".to_string()],
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            ignore: Arc::new(SyncIgnore::empty()),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig, ignore: Arc<SyncIgnore>, force_sync: bool) -> Self {
        Self {
            force_sync,
            ignored_extensions: config.ignored_extensions.clone(),
            event_queue_capacity: config.event_queue_capacity,
            ignore,
        }
    }
}

pub struct SyncSession {
    transport: Arc<dyn RemoteTransport>,
    mapper: PathMapper,
    /// Remote root exactly as given; passed through to bulk operations
    remote_root: String,
    options: SyncOptions,
    state: SyncState,
}

impl SyncSession {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        options: SyncOptions,
    ) -> Result<Self> {
        let local_root = local_root.into();
        let meta = std::fs::metadata(&local_root)?;
        if !meta.is_dir() {
            return Err(SyncError::Validation(
                "You must pass a directory, not a file in source dir".to_string(),
            ));
        }
        let remote_root = remote_root.into();
        Ok(Self {
            transport,
            mapper: PathMapper::new(local_root, remote_root.clone()),
            remote_root,
            options,
            state: SyncState::new(),
        })
    }

    pub fn local_root(&self) -> &Path {
        self.mapper.local_root()
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Pull the remote tree when the local root is empty or a refresh is
    /// forced. Returns whether a pull happened.
    ///
    /// The ignore file alone does not make the root non-empty; it may have
    /// just been copied in from the working directory.
    pub async fn sync_folder(&self) -> Result<bool> {
        let local_root = self.mapper.local_root();
        let empty = dir_is_empty(local_root, self.options.ignore.file_name())?;
        if !empty && !self.options.force_sync {
            info!("No need to synchronize from remote, directory not empty.");
            return Ok(false);
        }
        info!(
            "Synchronizing folder '{}' from the remote folder '{}' ...",
            truncate_path(local_root),
            truncate_path(&self.remote_root)
        );
        self.transport
            .copy_remote_folder(local_root, &self.remote_root)
            .await?;
        info!("Synchronization finished.");
        Ok(true)
    }

    /// Bootstrap, then mirror local changes until `cancel` fires or the
    /// watcher stops. Failures on single events are logged and skipped.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            pulled = self.sync_folder() => {
                pulled?;
            }
        }

        let root = self.mapper.local_root().to_path_buf();
        let (watcher, mut events) = EventWatcher::start(&root, self.options.event_queue_capacity)?;
        info!("Start watching for change in folder '{}'", truncate_path(&root));

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = self.handle_event(event).await {
                error!("Event has errored: {}", e);
            }
        }

        drop(watcher);
        info!("Stopped watching '{}'", truncate_path(&root));
        Ok(())
    }

    /// Process one event: filter, advance the state machine, run its action.
    pub async fn handle_event(&mut self, event: FileEvent) -> Result<()> {
        if self.is_ignored(&event.path) {
            debug!(path = %event.path.display(), "Ignored event");
            return Ok(());
        }
        info!(
            "Received event: '{}' for file '{}'",
            event.kind,
            truncate_path(&event.path)
        );
        match self.state.step(&event, &RealFs) {
            Some(action) => self.apply(action).await,
            None => Ok(()),
        }
    }

    /// Events dropped before the state machine: configured extensions,
    /// purely numeric names, and ignore-file matches.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if let Some((_, ext)) = name.rsplit_once('.') {
            if self.options.ignored_extensions.iter().any(|e| e == ext) {
                return true;
            }
        }
        if name.parse::<i64>().is_ok() {
            return true;
        }
        let remote = self.mapper.to_remote(path);
        self.options
            .ignore
            .matches_with_parents(&remote, RealFs.is_dir(path))
    }

    async fn apply(&self, action: Action) -> Result<()> {
        match action {
            Action::CreateFolders(path) => {
                let relative = self.mapper.relative(&path);
                self.transport
                    .create_folders(&self.remote_root, &relative)
                    .await
            }
            Action::Upload(path) => self.upload(&path).await,
            Action::Delete(path) => self.transport.delete(&self.mapper.to_remote(&path)).await,
            Action::Rename { from, to } => {
                self.transport
                    .rename(&self.mapper.to_remote(&from), &self.mapper.to_remote(&to))
                    .await
            }
        }
    }

    async fn upload(&self, path: &Path) -> Result<()> {
        let remote = self.mapper.to_remote(path);
        let file = File::open(path).map_err(|e| SyncError::transfer("upload", remote.as_str(), e))?;
        let meta = file
            .metadata()
            .map_err(|e| SyncError::transfer("upload", remote.as_str(), e))?;
        let content: Content = Box::new(file);
        self.transport
            .copy_content(content, meta.len(), &remote, file_mode(&meta))
            .await
    }
}

fn dir_is_empty(path: &Path, skip: Option<&str>) -> Result<bool> {
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if skip.is_some_and(|name| entry.file_name() == name) {
            continue;
        }
        return Ok(false);
    }
    Ok(true)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
