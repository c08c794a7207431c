//! Copy-stream transport: drives remote `scp` processes over exec channels.
//!
//! Every operation opens its own session channel and closes it again,
//! whether the operation succeeds or not. Uploads and directory creation
//! speak the framed protocol in [`wire`] to a remote `scp -t` sink. Bulk
//! download runs `scp -f` remotely and `scp -t` locally and cross-wires
//! their streams through the channel.

pub mod wire;

use crate::error::{Result, SyncError};
use crate::path::{remote_basename, remote_parent, strip_home_prefix, truncate_path};
use crate::ssh::channel::{copy_and_close, split_channel};
use crate::ssh::SecureClient;
use crate::transport::{run_blocking, Content, ProgressSink, RemoteTransport};
use async_trait::async_trait;
use ssh2::{Channel, Session};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};
use wire::{send_dirs, send_file, shell_quote, Record};

/// Mode for directories created by the transport
const DIR_MODE: u32 = 0o755;

pub struct ScpTransport {
    client: SecureClient,
    progress: ProgressSink,
}

impl ScpTransport {
    pub fn new(client: SecureClient) -> Self {
        Self {
            client,
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }
}

#[async_trait]
impl RemoteTransport for ScpTransport {
    async fn copy_remote_folder(&self, local_root: &Path, remote_root: &str) -> Result<()> {
        info!(
            "Downloading folder '{}' to '{}'",
            remote_root,
            truncate_path(local_root)
        );
        let client = self.client.clone();
        let local = local_root.to_path_buf();
        let remote = remote_root.to_string();
        run_blocking("download", remote_root, move || {
            download_tree(&client, &local, &remote)
        })
        .await
    }

    async fn copy_content(
        &self,
        content: Content,
        size: u64,
        remote_path: &str,
        mode: u32,
    ) -> Result<()> {
        let target = strip_home_prefix(remote_path).to_string();
        let command = format!("scp -qt {}", shell_quote(remote_parent(&target)));
        let record = Record::file(mode, size, remote_basename(&target));
        let content = self
            .progress
            .wrap(content, size, format!("Uploading file to '{}'...", remote_path));

        let client = self.client.clone();
        run_blocking("upload", remote_path, move || {
            client.blocking(|session| {
                exec(session, &command, "upload", &target, |channel| {
                    let mut acks = channel.stream(0);
                    send_file(&mut acks, channel, &record, content)
                })
            })
        })
        .await?;
        debug!(remote = %remote_path, bytes = size, "Upload finished");
        Ok(())
    }

    async fn create_folders(&self, remote_root: &str, relative_dir: &str) -> Result<()> {
        let segments: Vec<String> = relative_dir
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Ok(());
        }
        let root = strip_home_prefix(remote_root).trim_end_matches('/');
        let root = if root.is_empty() { "." } else { root }.to_string();
        let command = format!("scp -qrt {}", shell_quote(&root));
        let path = relative_dir.to_string();

        let client = self.client.clone();
        run_blocking("mkdir", relative_dir, move || {
            let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
            client.blocking(|session| {
                exec(session, &command, "mkdir", &path, |channel| {
                    let mut acks = channel.stream(0);
                    send_dirs(&mut acks, channel, &segments, DIR_MODE)
                })
            })
        })
        .await
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let target = strip_home_prefix(remote_path).to_string();
        let command = delete_command(&target);
        let client = self.client.clone();
        run_blocking("delete", remote_path, move || {
            client.blocking(|session| exec(session, &command, "delete", &target, |_| Ok(())))
        })
        .await
    }

    async fn rename(&self, old_remote_path: &str, new_remote_path: &str) -> Result<()> {
        let command = rename_command(
            strip_home_prefix(old_remote_path),
            strip_home_prefix(new_remote_path),
        );
        let path = old_remote_path.to_string();
        let client = self.client.clone();
        run_blocking("rename", old_remote_path, move || {
            client.blocking(|session| exec(session, &command, "rename", &path, |_| Ok(())))
        })
        .await
    }
}

fn delete_command(remote_path: &str) -> String {
    format!("rm -rf -- {}", shell_quote(remote_path))
}

fn rename_command(old: &str, new: &str) -> String {
    format!("mv -- {} {}", shell_quote(old), shell_quote(new))
}

fn download_command(remote_root: &str) -> String {
    let root = strip_home_prefix(remote_root).trim_end_matches('/');
    let root = if root.is_empty() { "." } else { root };
    format!("cd {} && scp -qrf .", shell_quote(root))
}

/// Run `command` on a fresh channel, hand the channel to `talk`, then close
/// it and check the exit status. The channel is closed on every path.
fn exec<T>(
    session: &Session,
    command: &str,
    op: &'static str,
    path: &str,
    talk: impl FnOnce(&mut Channel) -> Result<T>,
) -> Result<T> {
    let mut channel = session
        .channel_session()
        .map_err(|e| SyncError::transfer(op, path, e))?;
    debug!(command, "exec");
    let result = match channel.exec(command) {
        Ok(()) => talk(&mut channel),
        Err(e) => Err(SyncError::transfer(op, path, e)),
    };
    let status = close_channel(&mut channel);

    let value = result?;
    match status {
        Ok((0, _)) => Ok(value),
        Ok((code, stderr)) => Err(SyncError::transfer(
            op,
            path,
            format!("remote command exited with status {}: {}", code, stderr.trim()),
        )),
        Err(e) => Err(SyncError::transfer(op, path, e)),
    }
}

/// Signal end of input, drain stderr, close, and collect the exit status.
fn close_channel(channel: &mut Channel) -> std::result::Result<(i32, String), ssh2::Error> {
    let _ = channel.send_eof();
    let mut stderr = String::new();
    let _ = channel.stderr().read_to_string(&mut stderr);
    channel.wait_eof()?;
    channel.close()?;
    channel.wait_close()?;
    Ok((channel.exit_status()?, stderr))
}

/// Remote `scp -f` feeding a local `scp -t`.
fn download_tree(client: &SecureClient, local_root: &Path, remote_root: &str) -> Result<()> {
    let transfer_err = |e: &dyn std::fmt::Display| SyncError::transfer("download", remote_root, e);

    let command = download_command(remote_root);
    let channel = client
        .blocking(|session| {
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;
            Ok::<_, ssh2::Error>(channel)
        })
        .map_err(|e| transfer_err(&e))?;
    let (remote_out, mut remote_in) = split_channel(client.clone(), channel);

    let mut child = match spawn_local_sink(local_root) {
        Ok(child) => child,
        Err(e) => {
            let _ = remote_in.finish();
            return Err(transfer_err(&e));
        }
    };
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill();
        let _ = remote_in.finish();
        return Err(transfer_err(&"local scp streams unavailable"));
    };

    let received = std::thread::scope(|scope| {
        scope.spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                warn!("scp: {}", line);
            }
        });
        let upstream = scope.spawn(|| copy_and_close(stdout, &mut remote_in));
        let received = copy_and_close(remote_out, stdin);
        if let Ok(Err(e)) = upstream.join() {
            debug!("download ack stream ended: {}", e);
        }
        received
    });

    let remote_status = remote_in.finish();
    let local_status = child.wait();

    let received = received.map_err(|e| transfer_err(&e))?;
    match remote_status {
        Ok(0) => {}
        // nothing arrived: the root itself could not be read
        Ok(code) if received == 0 => {
            return Err(transfer_err(&format!(
                "remote scp exited with status {}",
                code
            )))
        }
        Ok(code) => warn!("Remote scp exited with status {}, some entries were skipped", code),
        Err(e) => return Err(transfer_err(&e)),
    }
    match local_status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("Local scp exited with {}, some entries were skipped", status),
        Err(e) => warn!("Local scp did not exit cleanly: {}", e),
    }
    info!(bytes = received, "Download finished");
    Ok(())
}

fn spawn_local_sink(local_root: &Path) -> std::io::Result<std::process::Child> {
    Command::new("scp")
        .arg("-qrt")
        .arg(local_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}
