//! Host key fingerprints.
//!
//! The expected fingerprint's length selects its encoding:
//! 47 chars is colon-separated hex MD5, 59 is colon-separated hex SHA-1,
//! 43 is unpadded base64 SHA-256. An empty expectation never verifies.

use crate::error::{Result, SyncError};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ssh2::{HashType, Session};

/// Inclusive of the colon between bytes
pub const MD5_FINGERPRINT_LENGTH: usize = 47;
/// Inclusive of the colon between bytes
pub const SHA1_FINGERPRINT_LENGTH: usize = 59;
pub const SHA256_FINGERPRINT_LENGTH: usize = 43;

/// How the server's host key is checked during connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// No verification at all
    Skip,
    /// Compare against this fingerprint
    Expect(String),
}

impl HostKeyCheck {
    pub fn new(skip: bool, expected: impl Into<String>) -> Self {
        if skip {
            HostKeyCheck::Skip
        } else {
            HostKeyCheck::Expect(expected.into())
        }
    }
}

/// Digests of the server host key as received during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDigests {
    pub md5: Vec<u8>,
    pub sha1: Vec<u8>,
    pub sha256: Vec<u8>,
}

impl KeyDigests {
    pub fn from_session(session: &Session) -> Result<Self> {
        let hash = |kind: HashType| {
            session
                .host_key_hash(kind)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| SyncError::Connection("server sent no host key".to_string()))
        };
        Ok(Self {
            md5: hash(HashType::Md5)?,
            sha1: hash(HashType::Sha1)?,
            sha256: hash(HashType::Sha256)?,
        })
    }

    pub fn md5_fingerprint(&self) -> String {
        hex_fingerprint(&self.md5)
    }

    pub fn sha1_fingerprint(&self) -> String {
        hex_fingerprint(&self.sha1)
    }

    pub fn sha256_fingerprint(&self) -> String {
        STANDARD_NO_PAD.encode(&self.sha256)
    }
}

/// Lowercase hex bytes joined by `:`.
pub fn hex_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Check `digests` against the configured expectation.
pub fn verify_host_key(check: &HostKeyCheck, digests: &KeyDigests) -> Result<()> {
    let expected = match check {
        HostKeyCheck::Skip => return Ok(()),
        HostKeyCheck::Expect(expected) => expected,
    };

    let fingerprint = match expected.len() {
        SHA256_FINGERPRINT_LENGTH => digests.sha256_fingerprint(),
        SHA1_FINGERPRINT_LENGTH => digests.sha1_fingerprint(),
        MD5_FINGERPRINT_LENGTH => digests.md5_fingerprint(),
        0 => {
            return Err(SyncError::HostKey {
                message: "Unable to verify identity of host.".to_string(),
                fingerprint: digests.md5_fingerprint(),
            })
        }
        _ => {
            return Err(SyncError::HostKey {
                message: "Unsupported host key fingerprint format".to_string(),
                fingerprint: digests.md5_fingerprint(),
            })
        }
    };

    if &fingerprint != expected {
        return Err(SyncError::HostKey {
            message: "Host key verification failed.".to_string(),
            fingerprint,
        });
    }
    Ok(())
}
