use alloy_primitives::Address;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::ledger::{ContractError, JobId, RpcError};
use crate::pipeline::StoreError;
use crate::synchronizer::SyncError;
use crate::vault::VaultError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("ledger node unreachable: {0}")]
    Connectivity(#[source] RpcError),

    #[error("ledger node is not in sync")]
    NotInSync,

    #[error("{contract} contract at {address} does not answer as expected: {source}")]
    ContractMismatch {
        contract: &'static str,
        address: Address,
        #[source]
        source: ContractError,
    },

    #[error("worker is not listed among the workers of job {0}")]
    NotAssigned(JobId),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("transaction error: {0}")]
    Broker(#[from] BrokerError),

    #[error("contract read failed: {0}")]
    Contract(#[from] ContractError),

    #[error("state sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("content store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether an error should stop what is being done or be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fatal,
    Retryable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Fatal => write!(f, "Fatal"),
            ErrorKind::Retryable => write!(f, "Retryable"),
        }
    }
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Contract(e) if e.is_transient() => ErrorKind::Retryable,
            NodeError::Sync(SyncError::Read(e)) if e.is_transient() => ErrorKind::Retryable,
            NodeError::Broker(BrokerError::Rpc(e)) if e.is_transient() => ErrorKind::Retryable,
            NodeError::Store(_) => ErrorKind::Retryable,
            _ => ErrorKind::Fatal,
        }
    }
}
