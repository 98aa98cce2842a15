//! Typed handles for the protocol contracts this node reads.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::{Address, B256, Bytes, U256};
use thiserror::Error;
use tokio::sync::OnceCell;

use super::abi::{self, AbiError, Token};
use super::error::{RpcError, RpcErrorKind};
use super::events::{self, EventError, EventRecord};
use super::rpc::{CallRequest, Ledger, Log, LogFilter};
use crate::state_machine::State;

pub const CURRENT_STATE: &str = "currentState()";
pub const ACTIVE_JOB: &str = "activeJob()";
pub const OWNER: &str = "owner()";
pub const KERNEL: &str = "kernel()";
pub const DATASET: &str = "dataset()";
pub const ACTIVE_WORKERS_COUNT: &str = "activeWorkersCount()";
pub const ACTIVE_WORKERS: &str = "activeWorkers(uint256)";
pub const JOB_DETAILS: &str = "getCognitiveJobDetails(bytes32)";
pub const IPFS_ADDRESS: &str = "ipfsAddress()";

/// Upper bound on `activeWorkersCount`; each worker costs one call.
pub const MAX_JOB_WORKERS: u64 = 256;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("unexpected return data: {0}")]
    Abi(#[from] AbiError),

    #[error("content reference is not UTF-8")]
    InvalidReference,

    #[error("job reports {0} active workers, more than {MAX_JOB_WORKERS}")]
    TooManyWorkers(u64),
}

impl ContractError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ContractError::Rpc(e) if e.kind() == RpcErrorKind::Transient)
    }
}

/// Identifier of a cognitive job as returned by the ledger.
///
/// The all-zero word means "no job" and never becomes a `JobId`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(B256);

impl JobId {
    pub fn from_word(word: B256) -> Option<Self> {
        (!word.is_zero()).then_some(Self(word))
    }

    pub fn word(&self) -> B256 {
        self.0
    }

    /// The job contract address for deployments with one contract per job.
    pub fn as_address(&self) -> Address {
        Address::from_word(self.0)
    }

    fn is_address(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_address() {
            write!(f, "{}", self.as_address())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({self})")
    }
}

/// A deployed contract plus the ledger used to reach it.
pub struct ContractHandle<L> {
    ledger: Arc<L>,
    address: Address,
    owner: OnceCell<Address>,
}

impl<L: Ledger> ContractHandle<L> {
    pub fn new(ledger: Arc<L>, address: Address) -> Self {
        Self {
            ledger,
            address,
            owner: OnceCell::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn call(&self, signature: &str, args: &[Token]) -> Result<Bytes, ContractError> {
        let request = CallRequest::new(self.address, abi::encode_call(signature, args));
        Ok(self.ledger.call(&request).await?)
    }

    /// Sanity check that the address really hosts a protocol contract. Only
    /// the first successful call reaches the ledger.
    pub async fn verify(&self) -> Result<Address, ContractError> {
        let owner = self
            .owner
            .get_or_try_init(|| async {
                let data = self.call(OWNER, &[]).await?;
                Ok::<_, ContractError>(abi::decode_address(&data, 0)?)
            })
            .await?;
        Ok(*owner)
    }

    async fn call_u8(&self, signature: &str, args: &[Token]) -> Result<u8, ContractError> {
        Ok(abi::decode_u8(&self.call(signature, args).await?, 0)?)
    }

    async fn call_address(
        &self,
        signature: &str,
        args: &[Token],
    ) -> Result<Address, ContractError> {
        Ok(abi::decode_address(&self.call(signature, args).await?, 0)?)
    }
}

/// This node's on-ledger worker contract.
pub struct WorkerContract<L> {
    handle: ContractHandle<L>,
}

impl<L: Ledger> WorkerContract<L> {
    pub fn new(ledger: Arc<L>, address: Address) -> Self {
        Self {
            handle: ContractHandle::new(ledger, address),
        }
    }

    pub fn address(&self) -> Address {
        self.handle.address()
    }

    pub async fn verify(&self) -> Result<Address, ContractError> {
        self.handle.verify().await
    }

    pub async fn current_state(&self) -> Result<State, ContractError> {
        self.handle.call_u8(CURRENT_STATE, &[]).await
    }

    pub async fn active_job(&self) -> Result<Option<JobId>, ContractError> {
        let data = self.handle.call(ACTIVE_JOB, &[]).await?;
        Ok(JobId::from_word(abi::word(&data, 0)?))
    }

    pub fn log_filter(&self) -> LogFilter {
        events::state_changed_filter(self.address())
    }

    pub fn decode_event(&self, log: &Log) -> Result<EventRecord, EventError> {
        events::decode_state_changed(log)
    }
}

/// Kernel, dataset and participants of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetails {
    pub kernel: Address,
    pub dataset: Address,
    pub workers: Vec<Address>,
    pub state: State,
}

enum JobBinding<L> {
    /// One contract per job; the job id is its address.
    Contract(ContractHandle<L>),
    /// Shared controller contract keyed by job id.
    Controller(ContractHandle<L>),
}

/// Read access to one job, in either deployment generation.
pub struct JobContract<L> {
    id: JobId,
    binding: JobBinding<L>,
}

impl<L: Ledger> JobContract<L> {
    pub fn per_job(ledger: Arc<L>, id: JobId) -> Self {
        Self {
            id,
            binding: JobBinding::Contract(ContractHandle::new(ledger, id.as_address())),
        }
    }

    pub fn via_controller(ledger: Arc<L>, controller: Address, id: JobId) -> Self {
        Self {
            id,
            binding: JobBinding::Controller(ContractHandle::new(ledger, controller)),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn current_state(&self) -> Result<State, ContractError> {
        match &self.binding {
            JobBinding::Contract(job) => job.call_u8(CURRENT_STATE, &[]).await,
            JobBinding::Controller(_) => Ok(self.details().await?.state),
        }
    }

    pub async fn details(&self) -> Result<JobDetails, ContractError> {
        match &self.binding {
            JobBinding::Contract(job) => {
                let kernel = job.call_address(KERNEL, &[]).await?;
                let dataset = job.call_address(DATASET, &[]).await?;
                let count = abi::decode_u64(&job.call(ACTIVE_WORKERS_COUNT, &[]).await?, 0)?;
                if count > MAX_JOB_WORKERS {
                    return Err(ContractError::TooManyWorkers(count));
                }
                let mut workers = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let index = Token::Uint(U256::from(i));
                    workers.push(job.call_address(ACTIVE_WORKERS, &[index]).await?);
                }
                let state = job.call_u8(CURRENT_STATE, &[]).await?;
                Ok(JobDetails {
                    kernel,
                    dataset,
                    workers,
                    state,
                })
            }
            JobBinding::Controller(controller) => {
                let data = controller
                    .call(JOB_DETAILS, &[Token::Word(self.id.word())])
                    .await?;
                Ok(JobDetails {
                    kernel: abi::decode_address(&data, 0)?,
                    dataset: abi::decode_address(&data, 1)?,
                    workers: abi::decode_address_array(&data, 4)?,
                    state: abi::decode_u8(&data, 7)?,
                })
            }
        }
    }

    pub fn log_filter(&self) -> LogFilter {
        match &self.binding {
            JobBinding::Contract(job) => events::state_changed_filter(job.address()),
            JobBinding::Controller(controller) => {
                events::job_state_changed_filter(controller.address(), self.id)
            }
        }
    }

    pub fn decode_event(&self, log: &Log) -> Result<EventRecord, EventError> {
        match &self.binding {
            JobBinding::Contract(_) => events::decode_state_changed(log),
            JobBinding::Controller(_) => events::decode_job_state_changed(log, self.id),
        }
    }
}

/// Kernel or dataset contract: resolves to a content-addressed reference.
pub async fn artifact_reference<L: Ledger>(
    ledger: &Arc<L>,
    artifact: Address,
) -> Result<String, ContractError> {
    let handle = ContractHandle::new(Arc::clone(ledger), artifact);
    let data = handle.call(IPFS_ADDRESS, &[]).await?;
    String::from_utf8(abi::decode_bytes(&data, 0)?).map_err(|_| ContractError::InvalidReference)
}
