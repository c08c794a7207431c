//! Channel I/O and bidirectional relays.
//!
//! [`ChannelReader`]/[`ChannelWriter`] present one SSH channel as independent
//! blocking read and write halves. Each attempt runs non-blocking under the
//! client's I/O lock, so a reader waiting for data never stalls the writer or
//! other channels on the same session.

use crate::ssh::client::SecureClient;
use ssh2::{Channel, Stream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::process::ChildStdin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Back-off between non-blocking attempts that found nothing to do
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Relay copy buffer
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Half-close the write direction so the peer sees end of stream.
pub trait CloseWrite {
    fn close_write(&mut self) -> io::Result<()>;
}

impl CloseWrite for TcpStream {
    fn close_write(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl CloseWrite for ChildStdin {
    // the pipe closes when the handle is dropped at the end of the copy
    fn close_write(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<T: CloseWrite + ?Sized> CloseWrite for &mut T {
    fn close_write(&mut self) -> io::Result<()> {
        (**self).close_write()
    }
}

impl CloseWrite for Vec<u8> {
    fn close_write(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct ChannelReader {
    client: SecureClient,
    stream: Stream,
    cancel: Option<CancellationToken>,
}

pub struct ChannelWriter {
    client: SecureClient,
    channel: Channel,
    cancel: Option<CancellationToken>,
}

/// Split `channel` into independently usable halves.
pub fn split_channel(client: SecureClient, channel: Channel) -> (ChannelReader, ChannelWriter) {
    let stream = channel.stream(0);
    (
        ChannelReader {
            client: client.clone(),
            stream,
            cancel: None,
        },
        ChannelWriter {
            client,
            channel,
            cancel: None,
        },
    )
}

impl ChannelReader {
    /// Reads report end of stream once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl ChannelWriter {
    /// Writes fail with `BrokenPipe` once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Wait for the remote side to close and return its exit status.
    pub fn finish(mut self) -> io::Result<i32> {
        let Self {
            client, channel, ..
        } = &mut self;
        retry_would_block(client, None, |_| channel.wait_eof().map_err(io::Error::from))?;
        retry_would_block(client, None, |_| channel.close().map_err(io::Error::from))?;
        retry_would_block(client, None, |_| channel.wait_close().map_err(io::Error::from))?;
        client.blocking(|_| channel.exit_status()).map_err(io::Error::from)
    }
}

fn is_cancelled(cancel: &Option<CancellationToken>) -> bool {
    cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
}

/// Repeat a non-blocking attempt until it stops reporting `WouldBlock`.
fn retry_would_block<T>(
    client: &SecureClient,
    cancel: Option<&CancellationToken>,
    mut attempt: impl FnMut(&ssh2::Session) -> io::Result<T>,
) -> io::Result<T> {
    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        match client.nonblocking(&mut attempt) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL_INTERVAL),
            other => return other,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Self {
            client,
            stream,
            cancel,
        } = self;
        match retry_would_block(client, cancel.as_ref(), |_| stream.read(buf)) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted && is_cancelled(cancel) => Ok(0),
            other => other,
        }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Self {
            client,
            channel,
            cancel,
        } = self;
        match retry_would_block(client, cancel.as_ref(), |_| channel.write(buf)) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted && is_cancelled(cancel) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "relay cancelled"))
            }
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let Self {
            client, channel, ..
        } = self;
        retry_would_block(client, None, |_| channel.flush())
    }
}

impl CloseWrite for ChannelWriter {
    fn close_write(&mut self) -> io::Result<()> {
        let Self {
            client, channel, ..
        } = self;
        retry_would_block(client, None, |_| channel.send_eof().map_err(io::Error::from))
    }
}

// =============================================================================
// Relay
// =============================================================================

/// Bytes moved in each direction of a finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// a -> b
    pub forward: u64,
    /// b -> a
    pub backward: u64,
}

/// Copy `src` into `dst` until `src` is exhausted, then close `dst`.
pub fn copy_and_close<R, W>(mut src: R, mut dst: W) -> io::Result<u64>
where
    R: Read,
    W: Write + CloseWrite,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let result = loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]) {
            break Err(e);
        }
        total += n as u64;
    };
    let _ = dst.flush();
    let _ = dst.close_write();
    result
}

/// Run two independent copy tasks (`a -> b`, `b -> a`) and wait for both.
///
/// Each task closes its destination when its source ends; errors in one
/// direction do not stop the other.
pub async fn relay<AR, AW, BR, BW>(a: (AR, AW), b: (BR, BW)) -> io::Result<RelayStats>
where
    AR: Read + Send + 'static,
    AW: Write + CloseWrite + Send + 'static,
    BR: Read + Send + 'static,
    BW: Write + CloseWrite + Send + 'static,
{
    let (a_read, a_write) = a;
    let (b_read, b_write) = b;

    let forward = tokio::task::spawn_blocking(move || copy_and_close(a_read, b_write));
    let backward = tokio::task::spawn_blocking(move || copy_and_close(b_read, a_write));
    let (forward, backward) = tokio::join!(forward, backward);

    let flatten = |r: std::result::Result<io::Result<u64>, tokio::task::JoinError>| {
        r.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    };
    Ok(RelayStats {
        forward: flatten(forward)?,
        backward: flatten(backward)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    struct Sink {
        data: Vec<u8>,
        closed: bool,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CloseWrite for Sink {
        fn close_write(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_copy_and_close_closes_destination() {
        let mut sink = Sink {
            data: Vec::new(),
            closed: false,
        };
        let copied = copy_and_close(Cursor::new(b"hello relay".to_vec()), &mut sink).unwrap();
        assert_eq!(copied, 11);
        assert_eq!(sink.data, b"hello relay");
        assert!(sink.closed);
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_moves_both_directions_and_completes() {
        // user <-> (a | relay | b) <-> service
        let (mut user, a) = socket_pair();
        let (b, mut service) = socket_pair();

        let a_halves = (a.try_clone().unwrap(), a);
        let b_halves = (b.try_clone().unwrap(), b);
        let relay_task = tokio::spawn(relay(a_halves, b_halves));

        let io_thread = std::thread::spawn(move || {
            user.write_all(b"ping").unwrap();
            user.close_write().unwrap();

            let mut got = Vec::new();
            service.read_to_end(&mut got).unwrap();
            assert_eq!(got, b"ping");

            service.write_all(b"pong!").unwrap();
            service.close_write().unwrap();

            let mut back = Vec::new();
            user.read_to_end(&mut back).unwrap();
            assert_eq!(back, b"pong!");
        });

        let stats = relay_task.await.unwrap().unwrap();
        io_thread.join().unwrap();
        assert_eq!(stats, RelayStats { forward: 4, backward: 5 });
    }
}
