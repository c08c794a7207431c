//! Local port forwarding through the SSH connection.
//!
//! Each spec gets a listener and an accept loop. Every accepted connection
//! is relayed to the remote address by two copy tasks; the relay ends once
//! both directions have finished.

use crate::error::{Result, SyncError};
use crate::ssh::channel::{relay, CloseWrite};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A local listen address paired with a remote connect address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub listen: String,
    pub connect: String,
}

impl FromStr for ForwardSpec {
    type Err = SyncError;

    /// `[bind_address:]port:host:hostport`, as for `ssh -L`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (listen, connect) = match parts.as_slice() {
            [port, host, host_port] => (format!("127.0.0.1:{}", port), format!("{}:{}", host, host_port)),
            [bind, port, host, host_port] => (format!("{}:{}", bind, port), format!("{}:{}", host, host_port)),
            _ => {
                return Err(SyncError::Config(format!(
                    "invalid forward spec '{}', expected [bind_address:]port:host:hostport",
                    s
                )))
            }
        };
        Ok(Self { listen, connect })
    }
}

/// Opens the remote end of a forwarded connection. Blocking.
pub trait Dialer: Send + Sync + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + CloseWrite + Send + 'static;

    fn dial(&self, addr: &str) -> io::Result<(Self::Reader, Self::Writer)>;
}

/// Running accept loops for a set of forward specs.
pub struct Forwarder {
    cancel: CancellationToken,
    local_addrs: Vec<SocketAddr>,
    loops: Vec<JoinHandle<()>>,
}

impl Forwarder {
    /// Bound addresses, in spec order (useful when a spec asks for port 0).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting and drop every listener. Errors are not reported.
    pub async fn close(self) {
        self.cancel.cancel();
        for handle in self.loops {
            let _ = handle.await;
        }
    }
}

/// Bind a listener per spec and start its accept loop.
pub async fn start_forwarding<D: Dialer>(dialer: Arc<D>, specs: &[ForwardSpec]) -> Result<Forwarder> {
    let cancel = CancellationToken::new();
    let mut local_addrs = Vec::with_capacity(specs.len());
    let mut loops = Vec::with_capacity(specs.len());

    for spec in specs {
        let listener = match TcpListener::bind(&spec.listen).await {
            Ok(l) => l,
            Err(e) => {
                cancel.cancel();
                return Err(SyncError::Connection(format!(
                    "cannot listen on {}: {}",
                    spec.listen, e
                )));
            }
        };
        let addr = listener.local_addr()?;
        info!("Forwarding {} -> {}", addr, spec.connect);
        local_addrs.push(addr);
        loops.push(tokio::spawn(accept_loop(
            listener,
            spec.connect.clone(),
            dialer.clone(),
            cancel.child_token(),
        )));
    }

    Ok(Forwarder {
        cancel,
        local_addrs,
        loops,
    })
}

async fn accept_loop<D: Dialer>(
    listener: TcpListener,
    connect: String,
    dialer: Arc<D>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, remote = %connect, "Accepted forwarded connection");
                tokio::spawn(handle_connection(
                    stream,
                    connect.clone(),
                    dialer.clone(),
                    cancel.clone(),
                ));
            }
            Err(e) if is_transient(&e) => {
                debug!("transient accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                warn!("Stopped forwarding to {}: {}", connect, e);
                break;
            }
        }
    }
}

async fn handle_connection<D: Dialer>(
    stream: TcpStream,
    connect: String,
    dialer: Arc<D>,
    cancel: CancellationToken,
) {
    if let Err(e) = relay_connection(stream, &connect, dialer, cancel).await {
        error!("connect to {} failed: {}", connect, e);
    }
}

async fn relay_connection<D: Dialer>(
    stream: TcpStream,
    connect: &str,
    dialer: Arc<D>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let local = stream.into_std()?;
    local.set_nonblocking(false)?;

    let addr = connect.to_string();
    let remote = tokio::task::spawn_blocking(move || dialer.dial(&addr))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

    // Unblock the local half if the forward is shut down mid-relay.
    let closer = local.try_clone()?;
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            cancel.cancelled().await;
            let _ = closer.shutdown(Shutdown::Both);
        }
    });

    let local_halves = (local.try_clone()?, local);
    let stats = relay(local_halves, remote).await;
    watcher.abort();

    let stats = stats?;
    debug!(
        remote = %connect,
        sent = stats.forward,
        received = stats.backward,
        "Forwarded connection closed"
    );
    Ok(())
}

/// Accept errors worth retrying after a short pause.
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOBUFS;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    /// Dials the "remote" address directly over loopback.
    struct LoopbackDialer;

    impl Dialer for LoopbackDialer {
        type Reader = StdTcpStream;
        type Writer = StdTcpStream;

        fn dial(&self, addr: &str) -> io::Result<(StdTcpStream, StdTcpStream)> {
            let stream = StdTcpStream::connect(addr)?;
            Ok((stream.try_clone()?, stream))
        }
    }

    #[test]
    fn test_parse_forward_spec() {
        let spec: ForwardSpec = "9000:localhost:8080".parse().unwrap();
        assert_eq!(spec.listen, "127.0.0.1:9000");
        assert_eq!(spec.connect, "localhost:8080");

        let spec: ForwardSpec = "0.0.0.0:9000:10.0.0.5:5432".parse().unwrap();
        assert_eq!(spec.listen, "0.0.0.0:9000");
        assert_eq!(spec.connect, "10.0.0.5:5432");

        assert!("9000".parse::<ForwardSpec>().is_err());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forward_relays_to_remote_service() {
        // echo service standing in for the container-side port
        let service = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let service_addr = service.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut conn, _) = service.accept().unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).unwrap();
            buf.reverse();
            conn.write_all(&buf).unwrap();
        });

        let spec = ForwardSpec {
            listen: "127.0.0.1:0".to_string(),
            connect: service_addr.to_string(),
        };
        let forwarder = start_forwarding(Arc::new(LoopbackDialer), &[spec]).await.unwrap();
        let local = forwarder.local_addrs()[0];

        let reply = tokio::task::spawn_blocking(move || {
            let mut client = StdTcpStream::connect(local).unwrap();
            client.write_all(b"abc").unwrap();
            client.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).unwrap();
            reply
        })
        .await
        .unwrap();
        assert_eq!(reply, b"cba");

        forwarder.close().await;
        // listener is gone once the accept loop exits
        assert!(StdTcpStream::connect(local).is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let spec = ForwardSpec {
            listen: taken.local_addr().unwrap().to_string(),
            connect: "127.0.0.1:1".to_string(),
        };
        let result = start_forwarding(Arc::new(LoopbackDialer), &[spec]).await;
        assert!(matches!(result, Err(SyncError::Connection(_))));
    }
}
