use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection pool exhausted ({max} connections in use)")]
    PoolExhausted { max: usize },

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Server returned error: {0}")]
    Server(String),

    #[error("{context}: {source}")]
    Setup {
        context: &'static str,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn setup(context: &'static str, source: StoreError) -> Self {
        Self::Setup {
            context,
            source: Box::new(source),
        }
    }

    /// Whether the connection that produced this error can no longer be
    /// trusted to be at a reply boundary.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Protocol(_) | Self::Auth(_) => true,
            Self::Setup { source, .. } => source.is_connection_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
