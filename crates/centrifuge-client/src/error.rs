use tokio_tungstenite::tungstenite;

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not connected")]
    NotConnected,

    #[error("not subscribed to channel {0}")]
    NotSubscribed(String),

    #[error("subscription to channel {0} already exists")]
    DuplicateSubscription(String),

    #[error("operation timed out")]
    Timeout,

    #[error("channel {channel}: {message} (code={code})")]
    Channel {
        channel: String,
        code: u32,
        message: String,
    },

    #[error("server error: code={code}, {message}")]
    Server { code: u32, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("client closed")]
    Closed,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl Error {
    /// `true` for failures of the underlying connection (as opposed to
    /// state or protocol errors reported by the client or server).
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::WebSocket(_) | Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
