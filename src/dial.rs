use std::time::Duration;

use tokio::net::TcpStream;

/// Error type for destination connection attempts
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial tcp {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial tcp {addr}: timed out after {timeout:?}")]
    TimedOut { addr: String, timeout: Duration },
}

/// Result type for dial operations
pub type DialResult<T> = Result<T, DialError>;

/// Open a TCP connection to `addr`, bounded by `timeout`.
///
/// The error carries the target address and the underlying cause; its
/// rendering is what per-request failure responses surface to the client.
pub async fn dial_with_timeout(addr: &str, timeout: Duration) -> DialResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(DialError::TimedOut {
            addr: addr.to_string(),
            timeout,
        }),
    }
}
