//! In-memory ledger used by unit tests across the crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};

use super::abi::{self, Token};
use super::error::RpcError;
use super::rpc::{BlockHeader, CallRequest, FilterId, Ledger, Log, LogFilter, Receipt};

/// What happens to the next transaction sent to the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptPlan {
    Success,
    Failed,
    NeverMined,
}

struct MockFilter {
    filter: LogFilter,
    delivered: usize,
}

struct MockState {
    chain_id: u64,
    syncing: bool,
    block: BlockHeader,
    by_selector: HashMap<(Address, [u8; 4]), Vec<u8>>,
    by_calldata: HashMap<(Address, Bytes), Vec<u8>>,
    call_counts: HashMap<(Address, [u8; 4]), usize>,
    logs: Vec<Log>,
    filters: HashMap<String, MockFilter>,
    next_filter: u64,
    filters_created: usize,
    pending_nonce: u64,
    gas_price: u128,
    gas_estimate: u64,
    revert_estimates: bool,
    injected: HashMap<&'static str, VecDeque<RpcError>>,
    sent: Vec<Bytes>,
    plans: VecDeque<ReceiptPlan>,
    receipts: HashMap<B256, Option<Receipt>>,
}

pub struct MockLedger {
    state: Mutex<MockState>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                chain_id: 1337,
                syncing: false,
                block: BlockHeader {
                    number: 100,
                    timestamp: 1_700_000_000,
                },
                by_selector: HashMap::new(),
                by_calldata: HashMap::new(),
                call_counts: HashMap::new(),
                logs: Vec::new(),
                filters: HashMap::new(),
                next_filter: 1,
                filters_created: 0,
                pending_nonce: 0,
                gas_price: 1_000_000_000,
                gas_estimate: 50_000,
                revert_estimates: false,
                injected: HashMap::new(),
                sent: Vec::new(),
                plans: VecDeque::new(),
                receipts: HashMap::new(),
            }),
        }
    }
}

fn reverted() -> RpcError {
    RpcError::Rpc {
        code: 3,
        message: "execution reverted".into(),
    }
}

impl MockLedger {
    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn word_u64(value: u64) -> Vec<u8> {
        U256::from(value).to_be_bytes::<32>().to_vec()
    }

    /// Answer every call to `signature` on `contract` with `data`.
    pub fn set_call(&self, contract: Address, signature: &str, data: Vec<u8>) {
        self.with(|s| s.by_selector.insert((contract, abi::selector(signature)), data));
    }

    /// Answer one exact call, arguments included.
    pub fn set_call_with(&self, contract: Address, signature: &str, args: &[Token], data: Vec<u8>) {
        let calldata = abi::encode_call(signature, args);
        self.with(|s| s.by_calldata.insert((contract, calldata), data));
    }

    pub fn call_count(&self, contract: Address, signature: &str) -> usize {
        self.with(|s| {
            s.call_counts
                .get(&(contract, abi::selector(signature)))
                .copied()
                .unwrap_or(0)
        })
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.with(|s| s.syncing = syncing);
    }

    pub fn set_block(&self, number: u64, timestamp: u64) {
        self.with(|s| s.block = BlockHeader { number, timestamp });
    }

    pub fn push_log(&self, log: Log) {
        self.with(|s| s.logs.push(log));
    }

    /// Forget every installed filter, as a node does after idling.
    pub fn evict_filters(&self) {
        self.with(|s| s.filters.clear());
    }

    pub fn filters_created(&self) -> usize {
        self.with(|s| s.filters_created)
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.with(|s| s.pending_nonce = nonce);
    }

    pub fn set_gas_price(&self, price: u128) {
        self.with(|s| s.gas_price = price);
    }

    pub fn revert_estimates(&self, revert: bool) {
        self.with(|s| s.revert_estimates = revert);
    }

    /// Fail the next call of `method` (the JSON-RPC method name) with `error`.
    pub fn inject_error(&self, method: &'static str, error: RpcError) {
        self.with(|s| s.injected.entry(method).or_default().push_back(error));
    }

    pub fn plan_receipts(&self, plans: &[ReceiptPlan]) {
        self.with(|s| s.plans.extend(plans.iter().copied()));
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.with(|s| s.sent.clone())
    }

    /// Mines the `index`th sent transaction after the fact.
    pub fn mine(&self, index: usize, success: bool) {
        self.with(|s| {
            let hash = keccak256(&s.sent[index]);
            let receipt = Receipt {
                transaction_hash: hash,
                success,
                block_number: Some(s.block.number),
            };
            s.receipts.insert(hash, Some(receipt));
        });
    }

    /// Whether a log filter on `address` is currently installed.
    pub fn has_filter_on(&self, address: Address) -> bool {
        self.with(|s| s.filters.values().any(|f| f.filter.address == address))
    }

    fn injected(&self, method: &'static str) -> Result<(), RpcError> {
        self.with(|s| match s.injected.get_mut(method).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        })
    }
}

impl Ledger for MockLedger {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.injected("eth_chainId")?;
        Ok(self.with(|s| s.chain_id))
    }

    async fn syncing(&self) -> Result<bool, RpcError> {
        self.injected("eth_syncing")?;
        Ok(self.with(|s| s.syncing))
    }

    async fn latest_block(&self) -> Result<BlockHeader, RpcError> {
        self.injected("eth_getBlockByNumber")?;
        Ok(self.with(|s| s.block))
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        self.injected("eth_call")?;
        self.with(|s| {
            let mut sel = [0u8; 4];
            if let Some(head) = request.data.get(..4) {
                sel.copy_from_slice(head);
            }
            *s.call_counts.entry((request.to, sel)).or_default() += 1;
            s.by_calldata
                .get(&(request.to, request.data.clone()))
                .or_else(|| s.by_selector.get(&(request.to, sel)))
                .map(|data| Bytes::from(data.clone()))
                .ok_or_else(reverted)
        })
    }

    async fn new_filter(&self, filter: &LogFilter) -> Result<FilterId, RpcError> {
        self.injected("eth_newFilter")?;
        Ok(self.with(|s| {
            let id = format!("0x{:x}", s.next_filter);
            s.next_filter += 1;
            s.filters_created += 1;
            // Without a start block only logs arriving after installation are reported.
            let delivered = if filter.from_block.is_some() { 0 } else { s.logs.len() };
            s.filters.insert(
                id.clone(),
                MockFilter {
                    filter: filter.clone(),
                    delivered,
                },
            );
            FilterId(id)
        }))
    }

    async fn filter_changes(&self, id: &FilterId) -> Result<Vec<Log>, RpcError> {
        self.injected("eth_getFilterChanges")?;
        self.with(|s| {
            let logs = &s.logs;
            let entry = s.filters.get_mut(&id.0).ok_or(RpcError::Rpc {
                code: -32000,
                message: "filter not found".into(),
            })?;
            let fresh = logs[entry.delivered..]
                .iter()
                .filter(|log| entry.filter.matches(log))
                .cloned()
                .collect();
            entry.delivered = logs.len();
            Ok(fresh)
        })
    }

    async fn uninstall_filter(&self, id: &FilterId) -> Result<bool, RpcError> {
        Ok(self.with(|s| s.filters.remove(&id.0).is_some()))
    }

    async fn pending_nonce(&self, _account: Address) -> Result<u64, RpcError> {
        self.injected("eth_getTransactionCount")?;
        Ok(self.with(|s| s.pending_nonce))
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        self.injected("eth_gasPrice")?;
        Ok(self.with(|s| s.gas_price))
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> Result<u64, RpcError> {
        self.injected("eth_estimateGas")?;
        self.with(|s| {
            if s.revert_estimates {
                Err(reverted())
            } else {
                Ok(s.gas_estimate)
            }
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError> {
        self.injected("eth_sendRawTransaction")?;
        Ok(self.with(|s| {
            let hash = keccak256(&raw);
            let block = s.block.number;
            let receipt = match s.plans.pop_front().unwrap_or(ReceiptPlan::Success) {
                ReceiptPlan::NeverMined => None,
                plan => Some(Receipt {
                    transaction_hash: hash,
                    success: plan == ReceiptPlan::Success,
                    block_number: Some(block),
                }),
            };
            s.receipts.insert(hash, receipt);
            s.sent.push(raw);
            hash
        }))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError> {
        self.injected("eth_getTransactionReceipt")?;
        Ok(self.with(|s| s.receipts.get(&hash).cloned().flatten()))
    }
}
