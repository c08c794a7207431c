//! Configuration file and defaults.
//!
//! Precedence: defaults < config file < CLI flags (applied by the binary).

use crate::error::{Result, SyncError};
use crate::ssh::ForwardSpec;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default keep-alive tick
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default capacity of the watcher -> consumer queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 50;

pub const DEFAULT_REMOTE_ROOT: &str = "~/app";
pub const DEFAULT_SOURCE_PREFIX: &str = "sync";
pub const DEFAULT_IGNORE_FILE: &str = ".syncignore";

/// Which remote transfer protocol drives the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Structured file-transfer subsystem
    #[default]
    Sftp,
    /// Framed copy-stream against a remote `scp -t`
    Scp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub keepalive_interval_secs: u64,
    pub event_queue_capacity: usize,
    /// Extensions (without dot) dropped before reaching the sync engine
    pub ignored_extensions: Vec<String>,
    pub transport: TransportKind,
    pub remote_root: String,
    pub source_prefix: String,
    pub ignore_file: String,
    /// App instance index encoded in the SSH username
    pub instance_index: u32,
    pub forward: Vec<ForwardSpec>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: DEFAULT_KEEPALIVE_SECS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            ignored_extensions: vec!["swp".to_string(), "swx".to_string()],
            transport: TransportKind::default(),
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            source_prefix: DEFAULT_SOURCE_PREFIX.to_string(),
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            instance_index: 0,
            forward: Vec::new(),
        }
    }
}

/// `$XDG_CONFIG_HOME/cfsync/config.toml`, or `cfsync.toml` when no config dir exists.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("cfsync").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("cfsync.toml"))
}

impl SyncConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields defaults; an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        if !path.exists() {
            if explicit {
                return Err(SyncError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config: SyncConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keepalive_interval_secs == 0 {
            return Err(SyncError::Config(
                "keepalive_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(SyncError::Config(
                "event_queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Local folder used when no source is given: `./<prefix>-<app>`
    pub fn source_dir(&self, app_name: &str, source: Option<&str>) -> PathBuf {
        match source {
            Some(s) if !s.is_empty() => PathBuf::from(s),
            _ => PathBuf::from(format!("./{}-{}", self.source_prefix, app_name)),
        }
    }

    /// Remote folder: the remote root, or a sub-folder of it.
    pub fn target_dir(&self, target: Option<&str>) -> String {
        match target {
            Some(t) if !t.is_empty() => {
                if t.starts_with('/') {
                    format!("{}{}", self.remote_root, t)
                } else {
                    format!("{}/{}", self.remote_root, t)
                }
            }
            _ => self.remote_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.event_queue_capacity, 50);
        assert_eq!(config.ignored_extensions, vec!["swp", "swx"]);
        assert_eq!(config.transport, TransportKind::Sftp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "transport = \"scp\"\nevent_queue_capacity = 8\n\n[[forward]]\nlisten = \"127.0.0.1:9000\"\nconnect = \"localhost:8080\"\n",
        )?;

        let config = SyncConfig::load(Some(&path))?;
        assert_eq!(config.transport, TransportKind::Scp);
        assert_eq!(config.event_queue_capacity, 8);
        assert_eq!(config.remote_root, "~/app");
        assert_eq!(config.forward.len(), 1);
        assert_eq!(config.forward[0].connect, "localhost:8080");
        Ok(())
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = SyncConfig::load(Some(Path::new("/nonexistent/cfsync.toml"))).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_invalid_values_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "keepalive_interval_secs = 0\n")?;
        assert!(SyncConfig::load(Some(&path)).is_err());

        std::fs::write(&path, "transport = [1, 2]\n")?;
        assert!(matches!(
            SyncConfig::load(Some(&path)),
            Err(SyncError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_source_and_target_dirs() {
        let config = SyncConfig::default();
        assert_eq!(config.source_dir("myapp", None), PathBuf::from("./sync-myapp"));
        assert_eq!(config.source_dir("myapp", Some("/tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(config.target_dir(None), "~/app");
        assert_eq!(config.target_dir(Some("public")), "~/app/public");
        assert_eq!(config.target_dir(Some("/public")), "~/app/public");
    }

    #[test]
    fn test_transport_values() {
        assert_eq!(TransportKind::from_str("SCP", true).unwrap(), TransportKind::Scp);
        assert_eq!(TransportKind::from_str("sftp", false).unwrap(), TransportKind::Sftp);
        assert!(TransportKind::from_str("ftp", true).is_err());

        let names: Vec<_> = TransportKind::value_variants()
            .iter()
            .filter_map(|v| v.to_possible_value())
            .map(|v| v.get_name().to_string())
            .collect();
        assert_eq!(names, ["sftp", "scp"]);
    }
}
