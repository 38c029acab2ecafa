//! Connection manager: dials new control and work connections to the gateway

use crate::ControlError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Any bidirectional byte stream usable as a gateway connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Produces new connections to the gateway
///
/// Transport and protocol selection happen behind this trait; callers only
/// see byte streams.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Dial a new connection to the gateway
    async fn connect(&self) -> Result<BoxedStream, ControlError>;

    /// Release dial resources held for the session that just ended
    ///
    /// Must be idempotent. The service reuses the connector for the next
    /// session, so a later `connect` starts afresh.
    async fn close(&self);
}

/// Plain TCP connector; every connection is an independent socket
#[derive(Debug)]
pub struct TcpConnector {
    server_addr: String,
    dial_timeout: Duration,
}

impl TcpConnector {
    pub fn new(server_addr: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            server_addr: server_addr.into(),
            dial_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, ControlError> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| ControlError::Timeout(format!("dialing {}", self.server_addr)))?
            .map_err(|e| {
                ControlError::ConnectionError(format!(
                    "Failed to connect to {}: {}",
                    self.server_addr, e
                ))
            })?;

        stream.set_nodelay(true)?;
        debug!("Connected to gateway at {}", self.server_addr);

        Ok(Box::new(stream))
    }

    async fn close(&self) {
        // Nothing is shared between TCP connections
        debug!("Session to {} released", self.server_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_dials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(5));
        let mut stream = connector.connect().await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connector_usable_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            listener.accept().await.unwrap();
        });

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(5));
        connector.close().await;
        connector.close().await;

        assert!(connector.connect().await.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_dial_is_connection_error() {
        // Grab a free port and release it so nothing listens there
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(5));
        assert!(matches!(
            connector.connect().await,
            Err(ControlError::ConnectionError(_))
        ));
    }
}
