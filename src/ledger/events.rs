use alloy_primitives::{Address, B256};
use thiserror::Error;

use super::abi::{self, AbiError};
use super::contracts::JobId;
use super::rpc::{Log, LogFilter};
use crate::state_machine::State;

pub const STATE_CHANGED: &str = "StateChanged(uint8,uint8)";
pub const JOB_STATE_CHANGED: &str = "JobStateChanged(bytes32,uint8,uint8)";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("log is not a {0} event")]
    UnexpectedTopic(&'static str),

    #[error("event belongs to job {0}")]
    ForeignJob(B256),

    #[error("undecodable event payload: {0}")]
    Abi(#[from] AbiError),
}

/// A state change reported by the ledger log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub contract: Address,
    pub old_state: State,
    pub new_state: State,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
}

impl EventRecord {
    /// Position of the record in the ledger's total log order, when known.
    pub fn cursor(&self) -> Option<(u64, u64)> {
        Some((self.block_number?, self.log_index.unwrap_or(0)))
    }
}

/// `StateChanged` emitted by a per-contract state machine.
pub fn state_changed_filter(contract: Address) -> LogFilter {
    LogFilter {
        address: contract,
        topics: vec![Some(abi::event_topic(STATE_CHANGED))],
        from_block: None,
    }
}

/// `JobStateChanged` on the shared controller, scoped to one job by topic 1.
pub fn job_state_changed_filter(controller: Address, job: JobId) -> LogFilter {
    LogFilter {
        address: controller,
        topics: vec![Some(abi::event_topic(JOB_STATE_CHANGED)), Some(job.word())],
        from_block: None,
    }
}

fn record(log: &Log) -> Result<EventRecord, EventError> {
    Ok(EventRecord {
        contract: log.address,
        old_state: abi::decode_u8(&log.data, 0)?,
        new_state: abi::decode_u8(&log.data, 1)?,
        block_number: log.block_number,
        log_index: log.log_index,
    })
}

pub fn decode_state_changed(log: &Log) -> Result<EventRecord, EventError> {
    if log.topics.first() != Some(&abi::event_topic(STATE_CHANGED)) {
        return Err(EventError::UnexpectedTopic("StateChanged"));
    }
    record(log)
}

pub fn decode_job_state_changed(log: &Log, job: JobId) -> Result<EventRecord, EventError> {
    if log.topics.first() != Some(&abi::event_topic(JOB_STATE_CHANGED)) {
        return Err(EventError::UnexpectedTopic("JobStateChanged"));
    }
    match log.topics.get(1) {
        Some(id) if *id == job.word() => record(log),
        Some(id) => Err(EventError::ForeignJob(*id)),
        None => Err(EventError::UnexpectedTopic("JobStateChanged")),
    }
}
