use crate::address::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure before a response was received: DNS, timeout, TCP reset,
    /// websocket drop.
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    /// Non-2xx HTTP response with a server-supplied body. Raw status is kept as `i16`;
    /// out-of-range codes coerce to `-1` (see `ProtocolError::new`).
    #[error("protocol error: code={code}, body={body:?}")]
    ProtocolError { code: i16, body: Option<String> },

    /// `ProtocolError` with code 404 on a message send: the address has no devices.
    #[error("unregistered user: {addr}")]
    UnregisteredUserError { addr: Address },

    /// An outgoing or incoming identity key change. Replayable once the application
    /// calls `accept()`, which flips `accepted` to true.
    #[error("identity key error for {addr} (accepted={accepted})")]
    IdentityKeyError {
        addr: Address,
        identity_key: Vec<u8>,
        accepted: bool,
    },

    /// A duplicate/out-of-order message counter observed by the session cipher.
    #[error("message counter error: {0}")]
    MessageCounterError(String),

    /// Prekey bundle missing, malformed, or already consumed.
    #[error("prekey error: {0}")]
    PreKeyError(String),

    /// Session construction failed (bad bundle, signature mismatch, etc).
    #[error("session init error: {0}")]
    SessionInitError(String),

    /// Catch-all for the signal primitive's session-layer failures, distinct from the
    /// three specific kinds above.
    #[error("session error: {0}")]
    SessionError(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("element missing: {0}")]
    ElementMissing(String),
}

impl Error {
    /// Build a `ProtocolError`, coercing an out-of-range status code to `-1`.
    ///
    /// Preserved intentionally: downstream recovery logic keys off this exact
    /// coercion and must keep seeing `-1` for codes that don't fit in `i16`.
    pub fn protocol(code: i64, body: Option<String>) -> Self {
        let code = i16::try_from(code).unwrap_or(-1);
        Error::ProtocolError { code, body }
    }

    /// The HTTP status code if this is a `ProtocolError`, otherwise `None`.
    pub fn status_code(&self) -> Option<i16> {
        match self {
            Error::ProtocolError { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The server-supplied body if this is a `ProtocolError`, otherwise `None`.
    pub fn protocol_body(&self) -> Option<&str> {
        match self {
            Error::ProtocolError { body, .. } => body.as_deref(),
            _ => None,
        }
    }

    pub fn is_untrusted_identity(&self) -> bool {
        matches!(self, Error::IdentityKeyError { .. })
    }
}
