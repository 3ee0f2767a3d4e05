//! Error types shared by the client and the server.

use thiserror::Error;

use crate::codec::CodecError;
use crate::protocol::HandshakeError;

/// Errors surfaced by RPC operations.
///
/// Variants carry strings rather than source errors so that a single
/// connection failure can be handed to every call still waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// I/O or handshake failure; fatal to the connection
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation attempted after the client was closed
    #[error("connection is shut down")]
    Shutdown,

    /// Unresolvable service/method, or a method that panicked
    #[error("rpc server: service/method request ill-formed: {0}")]
    MalformedRequest(String),

    /// Body could not be deserialized
    #[error("reading body: {0}")]
    Decode(String),

    /// Value could not be serialized
    #[error("encoding body: {0}")]
    Encode(String),

    /// Error string returned by the invoked method
    #[error("{0}")]
    Remote(String),

    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc: invalid service name: {0:?}")]
    InvalidService(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Connection(err.to_string())
    }
}

impl From<HandshakeError> for RpcError {
    fn from(err: HandshakeError) -> Self {
        RpcError::Connection(err.to_string())
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(msg) => RpcError::Decode(msg),
            CodecError::Encode(msg) => RpcError::Encode(msg),
            // An oversized outgoing frame is refused before it touches the stream
            err @ CodecError::FrameTooLarge(..) => RpcError::Encode(err.to_string()),
            other => RpcError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_mapping() {
        let err: RpcError = CodecError::Decode("bad".to_string()).into();
        assert_eq!(err, RpcError::Decode("bad".to_string()));

        let err: RpcError = CodecError::FrameTooLarge(11, 10).into();
        assert!(matches!(err, RpcError::Encode(_)));

        let err: RpcError = CodecError::Io(std::io::Error::other("reset")).into();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[test]
    fn test_remote_error_is_opaque() {
        let err = RpcError::Remote("divide by zero".to_string());
        assert_eq!(err.to_string(), "divide by zero");
    }
}
