//! TCP transport for sync sessions.
//!
//! One session per connection. Every network operation of a session is
//! bounded by the session's idle timeout through [`with_timeout`].

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::{Result, SyncError};

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SyncError::Config(format!("Endpoint '{}' is not host:port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| SyncError::Config(format!("Invalid port in endpoint '{}'", s)))?;

        // [::1]:9000
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(SyncError::Config(format!("Missing host in endpoint '{}'", s)));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Run `fut`, failing with [`SyncError::Timeout`] if it does not finish
/// within `limit`.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(format!("{} after {:?}", what, limit))),
    }
}

/// Open a TCP connection to `endpoint`, bounded by `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let what = format!("connecting to {}", endpoint);
    let stream = with_timeout(timeout, &what, async {
        TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| SyncError::io(format!("Failed to connect to {}", endpoint), e))
    })
    .await?;

    stream
        .set_nodelay(true)
        .map_err(|e| SyncError::io("Failed to set TCP_NODELAY", e))?;
    tracing::debug!("connected to {}", endpoint);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_and_display() {
        let ep: Endpoint = "localhost:9000".parse().unwrap();
        assert_eq!(ep, Endpoint::new("localhost", 9000));
        assert_eq!(ep.to_string(), "localhost:9000");

        let v6: Endpoint = "[::1]:7".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:7");

        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("localhost:http".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let err = with_timeout(Duration::from_millis(20), "sleeping", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);

        let err = connect(&endpoint, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
