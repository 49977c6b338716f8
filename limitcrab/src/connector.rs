//! Connection factories
//!
//! A [`Connector`] is the only way the pool creates new transport endpoints.
//! Timeouts, TLS or test doubles all live behind this trait.

use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A byte stream to the remote store
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Creates new transport sessions to the remote store
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxTransport>;
}

/// Dials a TCP address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: None,
            nodelay: true,
        }
    }

    /// Fail the dial if it takes longer than `timeout`
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Enable or disable TCP nodelay
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxTransport> {
        let stream = match self.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(self.addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", self.addr),
                    )
                })??,
            None => TcpStream::connect(self.addr).await?,
        };

        if self.nodelay {
            stream.set_nodelay(true)?;
        }

        Ok(Box::new(stream))
    }
}

/// Dials a unix domain socket
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> io::Result<BoxTransport> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }
}

/// Adapts a closure returning a future of a transport
///
/// ```
/// use limitcrab::connector::FnConnector;
///
/// let connector = FnConnector::new(|| async {
///     let (client, _server) = tokio::io::duplex(1024);
///     Ok::<_, std::io::Error>(client)
/// });
/// ```
pub struct FnConnector<F> {
    f: F,
}

impl<F> FnConnector<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, T> Connector for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<T>> + Send,
    T: Transport + 'static,
{
    async fn connect(&self) -> io::Result<BoxTransport> {
        let transport = (self.f)().await?;
        Ok(Box::new(transport))
    }
}
