//! cfsync: mirror a local folder into a running application container.
//!
//! The local tree is pulled from the container once (when empty or forced),
//! then every local change is pushed over a single SSH connection.

pub mod config;
pub mod error;
pub mod filter;
pub mod path;
pub mod platform;
pub mod ssh;
pub mod sync;
pub mod transport;

pub use config::{SyncConfig, TransportKind};
pub use error::{Result, SyncError};
pub use filter::SyncIgnore;
pub use path::PathMapper;
pub use sync::{SyncOptions, SyncSession};
pub use transport::RemoteTransport;
