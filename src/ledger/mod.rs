pub mod abi;
mod client;
pub mod contracts;
mod error;
pub mod events;
mod rpc;
#[cfg(test)]
pub(crate) mod testing;

pub use client::JsonRpcClient;
pub use contracts::{ContractError, JobContract, JobDetails, JobId, WorkerContract};
pub use error::{RpcError, RpcErrorKind};
pub use events::{EventError, EventRecord};
pub use rpc::{BlockHeader, CallRequest, FilterId, Ledger, Log, LogFilter, Receipt};
