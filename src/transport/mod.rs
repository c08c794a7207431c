//! Remote transport: bulk file operations against the container.
//!
//! Two interchangeable implementations of [`RemoteTransport`]:
//! - `sftp`: structured file-transfer subsystem
//! - `scp`: framed copy-stream against remote `scp` processes
//!
//! The sync engine only sees the trait. Remote paths may carry a `~/` home
//! prefix; both implementations strip it before use.

pub mod progress;
pub mod scp;
pub mod sftp;

use crate::config::TransportKind;
use crate::error::{Result, SyncError};
use crate::filter::SyncIgnore;
use crate::path::join_remote;
use crate::ssh::SecureClient;
use async_trait::async_trait;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

pub use progress::ProgressSink;
pub use scp::ScpTransport;
pub use sftp::SftpTransport;

/// Content uploaded by [`RemoteTransport::copy_content`].
pub type Content = Box<dyn Read + Send>;

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Populate `local_root` from `remote_root`. Individual entry failures are
    /// logged and skipped; only a failure to list the root is an error.
    async fn copy_remote_folder(&self, local_root: &Path, remote_root: &str) -> Result<()>;

    /// Upload exactly `size` bytes to `remote_path` with permission bits `mode`.
    async fn copy_content(
        &self,
        content: Content,
        size: u64,
        remote_path: &str,
        mode: u32,
    ) -> Result<()>;

    /// Create every segment of `relative_dir` under `remote_root`, in order.
    async fn create_folders(&self, remote_root: &str, relative_dir: &str) -> Result<()>;

    /// Remove `remote_path`, recursively for directories.
    async fn delete(&self, remote_path: &str) -> Result<()>;

    async fn rename(&self, old_remote_path: &str, new_remote_path: &str) -> Result<()>;
}

/// Directories to create, outermost first: `("app", "a/b")` gives
/// `["app/a", "app/a/b"]`. Segment `i` is created under segments `0..i`.
pub fn folders_to_create(remote_root: &str, relative_dir: &str) -> Vec<String> {
    let segments: Vec<&str> = relative_dir.split('/').filter(|s| !s.is_empty()).collect();
    (1..=segments.len())
        .map(|i| join_remote(remote_root, &segments[..i].join("/")))
        .collect()
}

/// Run a blocking transport operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(op: &'static str, path: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::transfer(op, path, e))?
}

/// Build the transport selected by `kind`.
pub fn connect_transport(
    kind: TransportKind,
    client: SecureClient,
    ignore: Arc<SyncIgnore>,
    progress: ProgressSink,
) -> Result<Arc<dyn RemoteTransport>> {
    Ok(match kind {
        TransportKind::Sftp => Arc::new(SftpTransport::new(client, ignore)?.with_progress(progress)),
        TransportKind::Scp => Arc::new(ScpTransport::new(client).with_progress(progress)),
    })
}
