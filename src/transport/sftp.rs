//! Structured file-transfer transport over the sftp subsystem.
//!
//! One sftp channel is opened at construction and shared by every
//! operation. Each primitive takes the client's I/O lock, so a long walk
//! leaves room for keep-alives and forwarded connections between entries.

use crate::error::{Result, SyncError};
use crate::filter::SyncIgnore;
use crate::path::{strip_home_prefix, truncate_path, PathMapper};
use crate::ssh::SecureClient;
use crate::transport::{folders_to_create, run_blocking, Content, ProgressSink, RemoteTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{FileStat, Sftp};
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mode for directories created on either side
const DIR_MODE: i32 = 0o755;

/// Used when the server reports no permission bits
const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Clone)]
pub struct SftpTransport {
    client: SecureClient,
    sftp: Arc<Mutex<Sftp>>,
    ignore: Arc<SyncIgnore>,
    progress: ProgressSink,
}

impl SftpTransport {
    /// Open the sftp subsystem on `client`.
    pub fn new(client: SecureClient, ignore: Arc<SyncIgnore>) -> Result<Self> {
        let sftp = client.blocking(|s| s.sftp())?;
        Ok(Self {
            client,
            sftp: Arc::new(Mutex::new(sftp)),
            ignore,
            progress: ProgressSink::disabled(),
        })
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp) -> T) -> T {
        self.client.blocking(|_| f(&self.sftp.lock()))
    }

    fn download_tree(&self, local_root: &Path, remote_root: &str) -> Result<()> {
        let root = remote_dir(remote_root);
        let mapper = PathMapper::new(local_root, root.to_string_lossy());
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match self.with_sftp(|sftp| sftp.readdir(&dir)) {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(SyncError::transfer("download", remote_root, e)),
                Err(e) => {
                    warn!("Unable to list remote folder '{}': {}", dir.display(), e);
                    continue;
                }
            };

            for (path, stat) in entries {
                let is_dir = stat.is_dir();
                if self.ignore.matches(&path.to_string_lossy(), is_dir) {
                    debug!(path = %path.display(), "Ignored by filter");
                    continue;
                }
                let local = mapper.to_local(&path.to_string_lossy());
                if is_dir {
                    if let Err(e) = fs::create_dir_all(&local) {
                        warn!("Unable to create folder '{}': {}", truncate_path(&local), e);
                        continue;
                    }
                    pending.push(path);
                } else if stat.is_file() {
                    if let Err(e) = self.download_file(&path, &local, &stat) {
                        warn!("{}", e);
                    }
                } else {
                    debug!(path = %path.display(), "Skipping special file");
                }
            }
        }
        Ok(())
    }

    fn download_file(&self, remote: &Path, local: &Path, stat: &FileStat) -> Result<()> {
        let label = remote.to_string_lossy().into_owned();
        let fail = |e: &dyn std::fmt::Display| SyncError::transfer("download", label.as_str(), e);

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| fail(&e))?;
        }
        let mode = stat.perm.map_or(DEFAULT_FILE_MODE, |p| p & 0o7777);
        let mut out = open_local(local, mode).map_err(|e| fail(&e))?;
        let size = stat.size.unwrap_or(0);
        let message = format!(
            "Downloading file '{}' to '{}'...",
            label,
            truncate_path(local)
        );

        let copied = self.with_sftp(|sftp| -> Result<u64> {
            let file = sftp.open(remote).map_err(|e| fail(&e))?;
            let mut reader = self.progress.wrap(file, size, message);
            io::copy(&mut reader, &mut out).map_err(|e| fail(&e))
        })?;
        debug!(remote = %label, bytes = copied, "Download finished");
        Ok(())
    }

    fn upload(&self, content: Content, size: u64, remote_path: &str, mode: u32) -> Result<()> {
        let target = Path::new(strip_home_prefix(remote_path));
        let fail = |e: &dyn std::fmt::Display| SyncError::transfer("upload", remote_path, e);
        let mut reader = self
            .progress
            .wrap(content, size, format!("Uploading file to '{}'...", remote_path))
            .take(size);

        self.with_sftp(|sftp| {
            let mut file = sftp.create(target).map_err(|e| fail(&e))?;
            let copied = io::copy(&mut reader, &mut file).map_err(|e| fail(&e))?;
            if copied != size {
                return Err(fail(&format!(
                    "source ended after {} of {} bytes",
                    copied, size
                )));
            }
            sftp.setstat(target, permissions(mode)).map_err(|e| fail(&e))
        })?;
        debug!(remote = %remote_path, bytes = size, "Upload finished");
        Ok(())
    }

    fn make_dirs(&self, remote_root: &str, relative_dir: &str) -> Result<()> {
        for folder in folders_to_create(strip_home_prefix(remote_root), relative_dir) {
            let path = PathBuf::from(&folder);
            self.with_sftp(|sftp| match sftp.mkdir(&path, DIR_MODE) {
                Ok(()) => Ok(()),
                // already there
                Err(e) => match sftp.stat(&path) {
                    Ok(stat) if stat.is_dir() => Ok(()),
                    _ => Err(SyncError::transfer("mkdir", folder.as_str(), e)),
                },
            })?;
        }
        Ok(())
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        let target = PathBuf::from(strip_home_prefix(remote_path));
        let stat = self
            .with_sftp(|sftp| sftp.lstat(&target))
            .map_err(|e| SyncError::transfer("delete", remote_path, e))?;
        if stat.is_dir() {
            self.remove_dir(&target)
        } else {
            self.with_sftp(|sftp| sftp.unlink(&target))
                .map_err(|e| SyncError::transfer("delete", remote_path, e))
        }
    }

    /// Children first, then the directory itself.
    fn remove_dir(&self, dir: &Path) -> Result<()> {
        let fail = |e: ssh2::Error| SyncError::transfer("delete", dir.to_string_lossy(), e);
        let entries = self.with_sftp(|sftp| sftp.readdir(dir)).map_err(fail)?;
        for (path, stat) in entries {
            if stat.is_dir() {
                self.remove_dir(&path)?;
            } else {
                self.with_sftp(|sftp| sftp.unlink(&path))
                    .map_err(|e| SyncError::transfer("delete", path.to_string_lossy(), e))?;
            }
        }
        self.with_sftp(|sftp| sftp.rmdir(dir)).map_err(fail)
    }

    fn move_path(&self, old_remote_path: &str, new_remote_path: &str) -> Result<()> {
        let from = Path::new(strip_home_prefix(old_remote_path));
        let to = Path::new(strip_home_prefix(new_remote_path));
        self.with_sftp(|sftp| sftp.rename(from, to, None))
            .map_err(|e| SyncError::transfer("rename", old_remote_path, e))
    }
}

#[async_trait]
impl RemoteTransport for SftpTransport {
    async fn copy_remote_folder(&self, local_root: &Path, remote_root: &str) -> Result<()> {
        info!(
            "Downloading folder '{}' to '{}'",
            remote_root,
            truncate_path(local_root)
        );
        let this = self.clone();
        let local = local_root.to_path_buf();
        let remote = remote_root.to_string();
        run_blocking("download", remote_root, move || this.download_tree(&local, &remote)).await
    }

    async fn copy_content(
        &self,
        content: Content,
        size: u64,
        remote_path: &str,
        mode: u32,
    ) -> Result<()> {
        let this = self.clone();
        let remote = remote_path.to_string();
        run_blocking("upload", remote_path, move || {
            this.upload(content, size, &remote, mode)
        })
        .await
    }

    async fn create_folders(&self, remote_root: &str, relative_dir: &str) -> Result<()> {
        let this = self.clone();
        let root = remote_root.to_string();
        let relative = relative_dir.to_string();
        run_blocking("mkdir", relative_dir, move || this.make_dirs(&root, &relative)).await
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let this = self.clone();
        let remote = remote_path.to_string();
        run_blocking("delete", remote_path, move || this.remove(&remote)).await
    }

    async fn rename(&self, old_remote_path: &str, new_remote_path: &str) -> Result<()> {
        let this = self.clone();
        let from = old_remote_path.to_string();
        let to = new_remote_path.to_string();
        run_blocking("rename", old_remote_path, move || this.move_path(&from, &to)).await
    }
}

/// Remote directory to walk, `~/` stripped; the login directory when empty.
fn remote_dir(remote_root: &str) -> PathBuf {
    match strip_home_prefix(remote_root).trim_end_matches('/') {
        "" => PathBuf::from("."),
        root => PathBuf::from(root),
    }
}

fn permissions(mode: u32) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode & 0o7777),
        atime: None,
        mtime: None,
    }
}

fn open_local(path: &Path, mode: u32) -> io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}
