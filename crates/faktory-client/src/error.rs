//! Client error taxonomy.
//!
//! Variants fall into two propagation classes: errors bound to a single
//! operation ([`ClientError::Server`], [`ClientError::Unexpected`],
//! [`ClientError::NotWritable`]) leave the rest of the session untouched;
//! session-level errors (connection, handshake, protocol) drain every
//! in-flight operation with [`ClientError::ConnectionLost`].

use faktory_protocol::PROTOCOL_VERSION;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Unparseable endpoint or contradictory options; raised before any
    /// socket is opened.
    #[error("config: {0}")]
    Config(String),
    /// TCP-level failure: refusal, DNS, or a dropped socket.
    #[error("connect: {0}")]
    Connect(String),
    /// The server rejected our HELLO or greeted us incorrectly.
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("server speaks protocol v{server}, this client requires v{client}", client = PROTOCOL_VERSION)]
    VersionMismatch { server: u64 },
    /// Undecodable reply or a reply with nothing awaiting it; the session
    /// is poisoned and torn down.
    #[error("protocol: {0}")]
    Protocol(String),
    /// An explicit `-message` reply.  Fails only the operation it answers.
    #[error("server: {0}")]
    Server(String),
    /// The reply's status line did not match the caller's expectation.
    #[error("expected reply '{expected}', got '{got}'")]
    Unexpected { expected: String, got: String },
    /// Operation issued while the connection is not writable.
    #[error("connection is not writable")]
    NotWritable,
    /// The connection died while this operation was in flight.
    #[error("connection lost")]
    ConnectionLost,
}

impl ClientError {
    /// Whether the engine may retry the connection after this error.
    /// Handshake rejections and protocol desync are not retried blindly;
    /// transport-level failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connect(_) | ClientError::ConnectionLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ClientError::Connect("refused".to_owned()).is_retryable());
        assert!(ClientError::ConnectionLost.is_retryable());
    }

    #[test]
    fn handshake_and_per_op_errors_are_not() {
        assert!(!ClientError::VersionMismatch { server: 3 }.is_retryable());
        assert!(!ClientError::Handshake("nope".to_owned()).is_retryable());
        assert!(!ClientError::NotWritable.is_retryable());
    }

    #[test]
    fn version_mismatch_names_both_versions() {
        let msg = ClientError::VersionMismatch { server: 3 }.to_string();
        assert!(msg.contains("v3"));
        assert!(msg.contains("v2"));
    }
}
