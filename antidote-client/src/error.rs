//! Client error types.

use crate::transaction::TransactionState;
use antidote_protocol::{ErrorCode, ModelError, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] ModelError),

    #[error("cannot {operation} a transaction that is {state}")]
    TransactionState {
        state: TransactionState,
        operation: &'static str,
    },

    #[error("request timeout")]
    Timeout,

    #[error("server error: {code} - {message}")]
    Server { code: ErrorCode, message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl ClientError {
    /// Returns whether the network failed, as opposed to the request being
    /// refused.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::ConnectionClosed
        )
    }

    /// Returns whether the request itself was objected to, locally or by the
    /// server.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidOperation(_)
                | ClientError::TransactionState { .. }
                | ClientError::Server { .. }
        )
    }

    /// Returns the server error code, if the server refused the request.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}
