use std::fmt;
use std::future::Future;

use alloy_primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};

use super::error::RpcError;

/// Server-side log subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(pub String);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which logs a filter should report. `None` in `topics` matches anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topics: Vec<Option<B256>>,
    pub from_block: Option<u64>,
}

impl LogFilter {
    pub fn starting_at(mut self, block: u64) -> Self {
        self.from_block = Some(block);
        self
    }

    pub fn matches(&self, log: &Log) -> bool {
        log.address == self.address
            && self.from_block.is_none_or(|from| log.block_number.is_none_or(|b| b >= from))
            && self
                .topics
                .iter()
                .enumerate()
                .all(|(i, want)| match want {
                    Some(topic) => log.topics.get(i) == Some(topic),
                    None => true,
                })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: B256,
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Read-only call, or the skeleton of a transaction for gas estimation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
}

impl CallRequest {
    pub fn new(to: Address, data: Bytes) -> Self {
        Self { from: None, to, data }
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }
}

/// The JSON-RPC surface of a ledger node this daemon depends on.
///
/// Implemented over HTTP by [`JsonRpcClient`](super::JsonRpcClient) and by
/// in-memory mocks in tests.
pub trait Ledger: Send + Sync + 'static {
    fn chain_id(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// `true` while the node is still catching up with the network.
    fn syncing(&self) -> impl Future<Output = Result<bool, RpcError>> + Send;

    fn latest_block(&self) -> impl Future<Output = Result<BlockHeader, RpcError>> + Send;

    /// `eth_call` against the latest block.
    fn call(&self, request: &CallRequest) -> impl Future<Output = Result<Bytes, RpcError>> + Send;

    fn new_filter(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = Result<FilterId, RpcError>> + Send;

    /// Logs matched since the previous poll of the same filter.
    fn filter_changes(
        &self,
        id: &FilterId,
    ) -> impl Future<Output = Result<Vec<Log>, RpcError>> + Send;

    fn uninstall_filter(
        &self,
        id: &FilterId,
    ) -> impl Future<Output = Result<bool, RpcError>> + Send;

    /// Transaction count including transactions still in the pool.
    fn pending_nonce(&self, account: Address) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<u128, RpcError>> + Send;

    fn estimate_gas(
        &self,
        request: &CallRequest,
    ) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: Bytes,
    ) -> impl Future<Output = Result<B256, RpcError>> + Send;

    /// `None` while the transaction is not mined yet.
    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<Receipt>, RpcError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(block: u64, topics: Vec<B256>) -> Log {
        Log {
            address: Address::repeat_byte(1),
            topics,
            data: Bytes::new(),
            block_number: Some(block),
            log_index: Some(0),
        }
    }

    #[test]
    fn filter_matches_address_topics_and_block() {
        let t0 = B256::repeat_byte(0xaa);
        let t1 = B256::repeat_byte(0xbb);
        let filter = LogFilter {
            address: Address::repeat_byte(1),
            topics: vec![Some(t0), None],
            from_block: None,
        }
        .starting_at(10);

        assert!(filter.matches(&log(10, vec![t0, t1])));
        assert!(!filter.matches(&log(9, vec![t0, t1])));
        assert!(!filter.matches(&log(12, vec![t1])));

        let mut other = log(12, vec![t0]);
        other.address = Address::repeat_byte(2);
        assert!(!filter.matches(&other));
    }
}
