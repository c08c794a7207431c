//! Platform metadata boundary.
//!
//! The SSH endpoint, host-key fingerprint, app record and one-time SSH code
//! come from the platform API. cfsync only consumes them; the provider that
//! talks to the API lives outside this crate. `FileMetadataProvider` reads a
//! JSON snapshot of that data so the tool can run standalone.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Environment variable that can carry the one-time SSH code.
pub const SSH_CODE_ENV: &str = "CFSYNC_SSH_CODE";

/// SSH access information advertised by the platform (`/v2/info`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    pub app_ssh_endpoint: String,
    #[serde(default)]
    pub app_ssh_host_key_fingerprint: String,
}

/// The subset of the application record the tunnel needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub guid: String,
    pub state: String,
    /// Scheduled on the container backend that supports SSH
    #[serde(default)]
    pub diego: bool,
}

pub trait MetadataProvider: Send + Sync {
    fn ssh_info(&self) -> Result<SshInfo>;
    fn app(&self, name: &str) -> Result<AppInfo>;
    /// One-time password for the SSH login
    fn ssh_code(&self) -> Result<String>;
    fn skip_host_validation(&self) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
struct MetadataDocument {
    ssh_info: SshInfo,
    #[serde(default)]
    apps: HashMap<String, AppInfo>,
    #[serde(default)]
    ssh_code: Option<String>,
    #[serde(default)]
    skip_host_validation: bool,
}

/// Metadata read from a JSON document.
#[derive(Debug, Clone)]
pub struct FileMetadataProvider {
    doc: MetadataDocument,
}

impl FileMetadataProvider {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read metadata {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let doc: MetadataDocument = serde_json::from_str(text)?;
        Ok(Self { doc })
    }
}

impl MetadataProvider for FileMetadataProvider {
    fn ssh_info(&self) -> Result<SshInfo> {
        Ok(self.doc.ssh_info.clone())
    }

    fn app(&self, name: &str) -> Result<AppInfo> {
        self.doc
            .apps
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::Validation(format!("App {} not found", name)))
    }

    fn ssh_code(&self) -> Result<String> {
        if let Ok(code) = std::env::var(SSH_CODE_ENV) {
            if !code.trim().is_empty() {
                return Ok(code.trim().to_string());
            }
        }
        self.doc
            .ssh_code
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SyncError::Config("no one-time ssh code available".to_string()))
    }

    fn skip_host_validation(&self) -> bool {
        self.doc.skip_host_validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const DOC: &str = r#"{
        "ssh_info": {
            "app_ssh_endpoint": "ssh.example.com:2222",
            "app_ssh_host_key_fingerprint": "a6:d1:08:0b:b0:cb:9b:5f:c4:ba:44:2a:97:26:19:8a"
        },
        "apps": {
            "web": { "guid": "1234-abcd", "state": "STARTED", "diego": true }
        },
        "ssh_code": "onetime"
    }"#;

    #[test]
    #[serial]
    fn test_reads_document() {
        std::env::remove_var(SSH_CODE_ENV);
        let provider = FileMetadataProvider::from_json(DOC).unwrap();
        let info = provider.ssh_info().unwrap();
        assert_eq!(info.app_ssh_endpoint, "ssh.example.com:2222");
        assert_eq!(info.app_ssh_host_key_fingerprint.len(), 47);

        let app = provider.app("web").unwrap();
        assert_eq!(app.guid, "1234-abcd");
        assert!(app.diego);
        assert_eq!(provider.ssh_code().unwrap(), "onetime");
        assert!(!provider.skip_host_validation());
    }

    #[test]
    fn test_unknown_app() {
        let provider = FileMetadataProvider::from_json(DOC).unwrap();
        assert!(matches!(provider.app("api"), Err(SyncError::Validation(_))));
    }

    #[test]
    #[serial]
    fn test_env_code_wins() {
        std::env::set_var(SSH_CODE_ENV, "from-env");
        let provider = FileMetadataProvider::from_json(DOC).unwrap();
        assert_eq!(provider.ssh_code().unwrap(), "from-env");
        std::env::remove_var(SSH_CODE_ENV);
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            FileMetadataProvider::from_json("{"),
            Err(SyncError::Config(_))
        ));
    }
}
