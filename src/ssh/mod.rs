//! Secure tunnel to the application container.
//!
//! - `client`: authenticated session, I/O lock, keep-alive, teardown
//! - `fingerprint`: host key verification
//! - `channel`: channel read/write halves and the two-task relay
//! - `forward`: local port forwarding

pub mod channel;
pub mod client;
pub mod fingerprint;
pub mod forward;

pub use channel::{relay, split_channel, ChannelReader, ChannelWriter, CloseWrite, RelayStats};
pub use client::{spawn_keepalive, ConnectTarget, KeepAlive, SecureClient, SecureShell};
pub use fingerprint::{verify_host_key, HostKeyCheck, KeyDigests};
pub use forward::{start_forwarding, Dialer, ForwardSpec, Forwarder};
