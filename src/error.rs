use std::fmt;
use std::sync::Arc;
use crate::codes::{disconnect, open};

/// Result type for our [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error that occured while handling SSH connection.
///
/// This enum is `#[non_exhaustive]`, so we reserve the right to add more variants and don't
/// consider this to break backwards compatibility.
///
/// The error is cheap to clone: when the session fails, the same error is delivered to every
/// pending operation.
#[derive(thiserror::Error, Debug, Clone)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    #[error("cryptography error: {0}")]
    Crypto(&'static str),
    #[error("randomness error: {0}")]
    Random(&'static str),
    #[error("mac verification failed")]
    Mac,
    #[error("signature verification failed")]
    Signature,
    #[error("server public key was not accepted")]
    PubkeyAccept(#[source] Arc<dyn std::error::Error + Send + Sync>),
    #[error("public key format is invalid")]
    PubkeyFormat,
    #[error("private key does not support algorithm {0:?}")]
    PrivkeyAlgo(&'static str),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("channel protocol error: {0}")]
    ChannelProtocol(&'static str),
    #[error("could not decode bytes: {0}")]
    Decode(&'static str),
    #[error("compression error: {0}")]
    Compress(&'static str),
    #[error("key exchange failed: {0}")]
    Kex(&'static str),
    #[error("unsupported protocol version: {0}")]
    Version(&'static str),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("could not negotiate algorithm: {0}")]
    AlgoNegotiate(AlgoNegotiateError),
    #[error("packet {0} not implemented")]
    PacketNotImplemented(u8),
    #[error("service {0:?} is not available")]
    ServiceNotAvailable(String),
    #[error("operation is not supported by this side of the connection")]
    WrongRole,
    #[error("another authentication method is pending")]
    AuthMethodPending,
    #[error("authentication method was aborted")]
    AuthAborted,
    #[error("authentication failed")]
    AuthFailed,
    #[error("too many failed authentication attempts")]
    AuthExhausted,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("could not open channel: {0}")]
    ChannelOpen(ChannelOpenError),
    #[error("channel request failed")]
    ChannelReq,
    #[error("peer sent more data than the channel window allows")]
    ChannelWindowExceeded,
    #[error("operation timed out")]
    Timeout,
    #[error("operation was abandoned before it produced a result")]
    Aborted,
    #[error("session is closed")]
    SessionClosed,
    #[error("IO error when reading")]
    ReadIo(#[source] Arc<std::io::Error>),
    #[error("IO error when writing")]
    WriteIo(#[source] Arc<std::io::Error>),
    #[error("connection unexpectedly closed by peer")]
    PeerClosed,
    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectError),
}

impl Error {
    /// Reason code that we send in `SSH_MSG_DISCONNECT` when this error terminates the session.
    ///
    /// Returns `None` for errors that do not warrant a disconnect message (I/O errors and
    /// disconnects initiated by the peer).
    pub fn disconnect_reason(&self) -> Option<u32> {
        Some(match self {
            Error::AlgoNegotiate(_) | Error::Kex(_) | Error::Signature | Error::PubkeyAccept(_) |
                Error::PubkeyFormat => disconnect::KEY_EXCHANGE_FAILED,
            Error::Mac => disconnect::MAC_ERROR,
            Error::Compress(_) => disconnect::COMPRESSION_ERROR,
            Error::Version(_) => disconnect::PROTOCOL_VERSION_NOT_SUPPORTED,
            Error::ServiceNotAvailable(_) => disconnect::SERVICE_NOT_AVAILABLE,
            Error::AuthExhausted | Error::AuthFailed => disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
            Error::Protocol(_) | Error::Decode(_) | Error::ChannelProtocol(_) |
                Error::PacketNotImplemented(_) => disconnect::PROTOCOL_ERROR,
            Error::ReadIo(_) | Error::WriteIo(_) | Error::PeerClosed |
                Error::PeerDisconnected(_) | Error::SessionClosed => return None,
            _ => disconnect::BY_APPLICATION,
        })
    }

    /// Is this error fatal only for a single channel, leaving the session alive?
    pub(crate) fn is_channel_fatal(&self) -> bool {
        matches!(self, Error::ChannelProtocol(_) | Error::ChannelWindowExceeded | Error::Decode(_))
    }
}

/// Error that occured because we could not negotiate an algorithm.
///
/// During the SSH key exchange, the client and the server must negotiate which cryptographic
/// algorithms (such as ciphers or MACs) to use, as described in RFC 4253, section 7.1. This error
/// occurs when there is no intersection between the set of algorithms supported by us and by the
/// peer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("for {algo_name:}, our algos are {our_algos:?}, their algos are {their_algos:?}")]
pub struct AlgoNegotiateError {
    /// Human readable name of the algorithm.
    pub algo_name: String,
    /// The set of algorithms supplied by us.
    pub our_algos: Vec<String>,
    /// The set of algorithms supplied by the peer.
    pub their_algos: Vec<String>,
}

/// Error that describes a disconnect.
///
/// This corresponds to the `SSH_MSG_DISCONNECT` packet described in RFC 4253, section 11.1. We
/// use it both for disconnects that we receive from the peer and for disconnects that we send.
#[derive(Debug, Clone, thiserror::Error)]
pub struct DisconnectError {
    /// Machine-readable reason code (see [`codes::disconnect`][crate::codes::disconnect]).
    pub reason_code: u32,
    /// Human-readable description of the error.
    pub description: String,
    /// Language tag of `description` (per RFC 3066).
    pub description_lang: String,
}

impl DisconnectError {
    /// Creates a disconnect error with the given code and description.
    pub fn new(reason_code: u32, description: impl Into<String>) -> Self {
        Self { reason_code, description: description.into(), description_lang: "".into() }
    }

    /// Creates a disconnect error with [`BY_APPLICATION`][disconnect::BY_APPLICATION] code.
    pub fn by_app() -> Self {
        Self::new(disconnect::BY_APPLICATION, "")
    }

    /// Translates the [`reason_code`][Self::reason_code] into a string.
    pub fn reason_to_str(&self) -> Option<&'static str> {
        disconnect::to_str(self.reason_code)
    }
}

impl From<&Error> for DisconnectError {
    fn from(err: &Error) -> Self {
        let reason_code = err.disconnect_reason().unwrap_or(disconnect::BY_APPLICATION);
        Self::new(reason_code, err.to_string())
    }
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_reason(f, disconnect::to_str(self.reason_code), self.reason_code, &self.description)
    }
}

/// Error that occured when opening a channel.
///
/// This corresponds to the `SSH_MSG_CHANNEL_OPEN_FAILURE` packet described in RFC 4254, section
/// 5.1.
#[derive(Debug, Clone, thiserror::Error)]
pub struct ChannelOpenError {
    /// Machine-readable reason code (see [`codes::open`][crate::codes::open]).
    pub reason_code: u32,
    /// Human-readable description of the error.
    pub description: String,
    /// Language tag of `description` (per RFC 3066).
    pub description_lang: String,
}

impl ChannelOpenError {
    /// Creates an open error with the given code and description.
    pub fn new(reason_code: u32, description: impl Into<String>) -> Self {
        Self { reason_code, description: description.into(), description_lang: "".into() }
    }
}

impl fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_reason(f, open::to_str(self.reason_code), self.reason_code, &self.description)
    }
}

fn fmt_reason(
    f: &mut fmt::Formatter,
    reason: Option<&'static str>,
    reason_code: u32,
    description: &str,
) -> fmt::Result {
    write!(f, "peer returned error ")?;
    if let Some(reason) = reason {
        write!(f, "`{}` ({})", reason, reason_code)?;
    } else {
        write!(f, "{}", reason_code)?;
    }
    if !description.is_empty() {
        write!(f, ": {:?}", description)?;
    }
    Ok(())
}
