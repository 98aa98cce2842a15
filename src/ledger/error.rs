//! Errors raised while talking to the ledger node.
//!
//! Ledger nodes report most conditions only through a JSON-RPC error code and
//! message. [`RpcError::kind`] is the single place where those are mapped to a
//! typed [`RpcErrorKind`]; callers branch on the kind, never on the text.

use thiserror::Error;

/// Failure of a single ledger RPC round trip.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection refused, DNS failure, timeout at the HTTP layer.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with a non-success HTTP status.
    #[error("HTTP status {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON-RPC level error object.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The response did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// What a caller should do about an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Network hiccup or overloaded node; try again.
    Transient,
    /// The node evicted the log filter; recreate it.
    FilterNotFound,
    /// The contract reverted while executing the call.
    Reverted,
    /// The request itself is invalid and will never succeed as-is.
    Malformed,
}

// Standard JSON-RPC codes plus the geth/parity revert code.
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const EXECUTION_ERROR: i64 = 3;

impl RpcError {
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            RpcError::Transport(_) | RpcError::Http { .. } | RpcError::Decode(_) => {
                RpcErrorKind::Transient
            }
            RpcError::Rpc { code, message } => {
                let message = message.to_ascii_lowercase();
                if message.contains("filter not found") {
                    RpcErrorKind::FilterNotFound
                } else if *code == EXECUTION_ERROR || message.contains("execution reverted") {
                    RpcErrorKind::Reverted
                } else if matches!(*code, INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS)
                    || message.contains("invalid sender")
                    || message.contains("intrinsic gas too low")
                {
                    RpcErrorKind::Malformed
                } else {
                    RpcErrorKind::Transient
                }
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == RpcErrorKind::Transient
    }
}
