use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::config::ProxyConfig;

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Absolute deadlines for one tunnel session.
///
/// All four are anchored to the moment the tunnel starts; a session that
/// outlives any of them is torn down, active or not.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub client_read: Instant,
    pub client_write: Instant,
    pub dest_read: Instant,
    pub dest_write: Instant,
}

impl Deadlines {
    pub fn starting_now(config: &ProxyConfig) -> Self {
        let now = Instant::now();
        Self {
            client_read: now + config.client_read_timeout,
            client_write: now + config.client_write_timeout,
            dest_read: now + config.dest_read_timeout,
            dest_write: now + config.dest_write_timeout,
        }
    }
}

/// Relay bytes between a hijacked client transport and the dialed
/// destination until either side closes, errs, or hits a deadline.
///
/// Two independent workers run concurrently, one per direction. The first
/// one to finish aborts its sibling; both streams' halves are dropped on the
/// way out, so both connections are closed no matter which direction ended
/// and the peer never stays blocked past its own deadline.
pub async fn run<C, D>(client: C, dest: D, deadlines: Deadlines) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (dest_read, dest_write) = tokio::io::split(dest);

    let mut upstream = tokio::spawn(relay(
        client_read,
        deadlines.client_read,
        dest_write,
        deadlines.dest_write,
    ));
    let mut downstream = tokio::spawn(relay(
        dest_read,
        deadlines.dest_read,
        client_write,
        deadlines.client_write,
    ));

    let first = tokio::select! {
        res = &mut upstream => {
            downstream.abort();
            let _ = (&mut downstream).await;
            res
        }
        res = &mut downstream => {
            upstream.abort();
            let _ = (&mut upstream).await;
            res
        }
    };

    match first {
        Ok(Ok(copied)) => {
            debug!(bytes = copied, "tunnel closed");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Copy bytes from `src` to `dst` under absolute deadlines.
///
/// Returns the byte count on clean EOF. A deadline expiry surfaces as a
/// `TimedOut` error; it is not distinguished from any other read/write
/// failure beyond its text. The write side is half-closed on the way out so
/// the peer observes EOF promptly.
async fn relay<R, W>(
    mut src: R,
    read_deadline: Instant,
    mut dst: W,
    write_deadline: Instant,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut copied = 0u64;

    let result = loop {
        let n = match timeout_at(read_deadline, src.read(&mut buf)).await {
            Ok(Ok(0)) => break Ok(copied),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")),
        };

        match timeout_at(write_deadline, dst.write_all(&buf[..n])).await {
            Ok(Ok(())) => copied += n as u64,
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                break Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            }
        }
    };

    let _ = timeout_at(write_deadline, dst.shutdown()).await;
    result
}
