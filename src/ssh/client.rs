//! SSH connection to an application container.
//!
//! One authenticated libssh2 session per sync run. libssh2 serialises all
//! traffic on a session, so every user goes through [`SecureClient`]'s I/O
//! lock: blocking operations hold it for their whole duration, channel pumps
//! take it per non-blocking attempt.

use crate::error::{Result, SyncError};
use crate::platform::AppInfo;
use crate::ssh::fingerprint::{verify_host_key, HostKeyCheck, KeyDigests};
use crate::ssh::forward::{start_forwarding, Dialer, ForwardSpec, Forwarder};
use crate::ssh::channel::{split_channel, ChannelReader, ChannelWriter};
use parking_lot::Mutex;
use ssh2::Session;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Required application state for SSH access
const STARTED_STATE: &str = "STARTED";

/// Everything needed to reach one application instance.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub app_name: String,
    pub app: AppInfo,
    /// `host:port` of the SSH proxy
    pub endpoint: String,
    pub instance_index: u32,
}

impl ConnectTarget {
    /// Username understood by the SSH proxy: `cf:<app guid>/<instance index>`
    pub fn username(&self) -> String {
        format!("cf:{}/{}", self.app.guid, self.instance_index)
    }

    /// The app must be started and scheduled on the SSH-capable backend.
    pub fn validate(&self) -> Result<()> {
        if !self.app.state.eq_ignore_ascii_case(STARTED_STATE) {
            return Err(SyncError::Validation(format!(
                "Application {:?} is not in the {} state",
                self.app_name, STARTED_STATE
            )));
        }
        if !self.app.diego {
            return Err(SyncError::Validation(format!(
                "Application {:?} is not running on Diego",
                self.app_name
            )));
        }
        Ok(())
    }
}

struct ClientInner {
    session: Session,
    io_lock: Mutex<()>,
}

/// Shared handle to an authenticated session.
#[derive(Clone)]
pub struct SecureClient {
    inner: Arc<ClientInner>,
}

impl SecureClient {
    /// Dial, verify the host key and authenticate with the one-time token.
    ///
    /// Blocking; call from a blocking context.
    pub fn connect(target: &ConnectTarget, token: &str, host_key: &HostKeyCheck) -> Result<Self> {
        target.validate()?;

        let tcp = TcpStream::connect(&target.endpoint).map_err(|e| {
            SyncError::Connection(format!("dial {} failed: {}", target.endpoint, e))
        })?;
        tcp.set_nodelay(true)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        let digests = KeyDigests::from_session(&session)?;
        verify_host_key(host_key, &digests)?;

        session.userauth_password(&target.username(), token)?;
        if !session.authenticated() {
            return Err(SyncError::Connection(format!(
                "authentication failed for {}",
                target.username()
            )));
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                session,
                io_lock: Mutex::new(()),
            }),
        })
    }

    /// Run `f` with exclusive use of the session in blocking mode.
    pub fn blocking<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        let _guard = self.inner.io_lock.lock();
        f(&self.inner.session)
    }

    /// Run one non-blocking attempt; `f` may observe `WouldBlock`.
    pub fn nonblocking<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        let _guard = self.inner.io_lock.lock();
        self.inner.session.set_blocking(false);
        let out = f(&self.inner.session);
        self.inner.session.set_blocking(true);
        out
    }

    /// Open a `direct-tcpip` channel to `addr` (`host:port`) on the remote side.
    pub fn open_direct_tcpip(&self, addr: &str) -> io::Result<(ChannelReader, ChannelWriter)> {
        let (host, port) = split_host_port(addr)?;
        let channel = self
            .blocking(|s| s.channel_direct_tcpip(host, port, None))
            .map_err(io::Error::from)?;
        Ok(split_channel(self.clone(), channel))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.blocking(|s| s.disconnect(None, "closed by cfsync", None))?;
        Ok(())
    }
}

impl Dialer for SecureClient {
    type Reader = ChannelReader;
    type Writer = ChannelWriter;

    fn dial(&self, addr: &str) -> io::Result<(ChannelReader, ChannelWriter)> {
        self.open_direct_tcpip(addr)
    }
}

fn split_host_port(addr: &str) -> io::Result<(&str, u16)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("bad address '{}'", addr));
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

// =============================================================================
// Keep-alive
// =============================================================================

/// Something that can be pinged to keep a connection open.
pub trait KeepAlive: Send + Sync + 'static {
    fn send_keepalive(&self) -> Result<()>;
}

impl KeepAlive for SecureClient {
    fn send_keepalive(&self) -> Result<()> {
        self.blocking(|s| s.keepalive_send())?;
        Ok(())
    }
}

/// Ping `target` every `interval` until `cancel` fires. Send failures are
/// ignored; liveness is advisory.
pub fn spawn_keepalive<K: KeepAlive>(
    target: Arc<K>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let target = target.clone();
                    match tokio::task::spawn_blocking(move || target.send_keepalive()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("keepalive failed: {}", e),
                        Err(e) => debug!("keepalive task failed: {}", e),
                    }
                }
            }
        }
    })
}

// =============================================================================
// SecureShell: connection + keep-alive + forwards
// =============================================================================

/// Owns the connection and everything hanging off it.
///
/// Teardown order is fixed: keep-alive, forwarded listeners, connection.
pub struct SecureShell {
    client: SecureClient,
    keepalive: Option<(CancellationToken, JoinHandle<()>)>,
    forwarders: Vec<Forwarder>,
}

impl SecureShell {
    pub async fn connect(
        target: ConnectTarget,
        token: String,
        host_key: HostKeyCheck,
    ) -> Result<Self> {
        // validate before dialing so ineligible apps never touch the network
        target.validate()?;
        info!("Authenticating for ssh ...");
        let client = tokio::task::spawn_blocking(move || {
            SecureClient::connect(&target, &token, &host_key)
        })
        .await
        .map_err(|e| SyncError::Connection(e.to_string()))??;
        info!("Finished authenticating for ssh.");

        Ok(Self {
            client,
            keepalive: None,
            forwarders: Vec::new(),
        })
    }

    pub fn client(&self) -> &SecureClient {
        &self.client
    }

    pub fn start_keepalive(&mut self, interval: Duration) {
        if self.keepalive.is_some() {
            return;
        }
        self.client
            .blocking(|s| s.set_keepalive(true, interval.as_secs().max(1) as u32));
        let cancel = CancellationToken::new();
        let handle = spawn_keepalive(Arc::new(self.client.clone()), interval, cancel.clone());
        self.keepalive = Some((cancel, handle));
    }

    /// Start a listener and accept loop for every spec.
    pub async fn local_port_forward(&mut self, specs: &[ForwardSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let forwarder = start_forwarding(Arc::new(self.client.clone()), specs).await?;
        self.forwarders.push(forwarder);
        Ok(())
    }

    pub fn forwarders(&self) -> &[Forwarder] {
        &self.forwarders
    }

    pub async fn close(mut self) -> Result<()> {
        if let Some((cancel, handle)) = self.keepalive.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.close().await;
        }
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.disconnect())
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?
    }
}
