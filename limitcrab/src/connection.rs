use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::Credentials;
use crate::connector::{BoxTransport, Connector};
use crate::error::{Result, StoreError};
use crate::resp::{self, Reply, ReplyParser};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One session with the remote store
///
/// A connection is owned by exactly one caller at a time. Once an I/O or
/// protocol error is seen it is marked broken and must not be reused.
pub struct Connection {
    id: u64,
    stream: BoxTransport,
    read_buf: BytesMut,
    write_buf: BytesMut,
    broken: bool,
}

impl Connection {
    /// Wrap an already established transport
    pub fn new(stream: BoxTransport) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            broken: false,
        }
    }

    /// Dial through `connector` and authenticate if credentials are given
    pub async fn open(connector: &dyn Connector, credentials: Option<&Credentials>) -> Result<Self> {
        let stream = connector.connect().await?;
        let mut conn = Self::new(stream);
        debug!(conn = conn.id, "opened connection");

        if let Some(credentials) = credentials {
            conn.authenticate(credentials).await?;
        }
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send `AUTH [username] password`
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        let result = match &credentials.username {
            Some(username) => {
                self.request(&["AUTH", username.as_str(), credentials.password.as_str()])
                    .await
            }
            None => self.request(&["AUTH", credentials.password.as_str()]).await,
        };

        match result {
            Ok(Reply::Status(_)) => {
                debug!(conn = self.id, "authenticated");
                Ok(())
            }
            Ok(other) => {
                self.broken = true;
                Err(StoreError::Auth(format!("unexpected AUTH reply: {other:?}")))
            }
            Err(StoreError::Server(msg)) => {
                self.broken = true;
                Err(StoreError::Auth(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Write one command
    pub async fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<()> {
        self.write_buf.clear();
        resp::encode_command(args, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one reply
    pub async fn receive(&mut self) -> Result<Reply> {
        loop {
            if let Some((reply, consumed)) = ReplyParser::new().parse(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(reply);
            }

            self.read_buf.reserve(4096);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(if self.read_buf.is_empty() {
                    StoreError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    ))
                } else {
                    StoreError::protocol("connection closed in the middle of a reply")
                });
            }
        }
    }

    /// Send a command and wait for its reply
    ///
    /// Error replies are returned as [`StoreError::Server`] and leave the
    /// connection usable. Any other failure marks it broken.
    pub async fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        // Stays set if the round trip fails or its future is dropped.
        self.broken = true;

        self.send(args).await?;
        let reply = self.receive().await?;

        self.broken = false;
        trace!(conn = self.id, "round trip complete");

        match reply {
            Reply::Error(msg) => Err(StoreError::Server(msg)),
            reply => Ok(reply),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .finish()
    }
}
