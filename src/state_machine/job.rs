use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::contract::{MachineKind, StatefulContract};
use super::engine::{State, StateMachine, StateTable, StateTableEntry};
use crate::ledger::{
    ContractError, EventError, EventRecord, JobContract, JobId, Ledger, Log, LogFilter,
};

/// Lifecycle of an on-ledger cognitive job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobState {
    Uninitialized = 0,
    GatheringWorkers = 1,
    InsufficientWorkers = 2,
    DataValidation = 3,
    InvalidData = 4,
    Cognition = 5,
    PartialResult = 6,
    Completed = 7,
    Destroyed = 0xFF,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::Uninitialized,
        JobState::GatheringWorkers,
        JobState::InsufficientWorkers,
        JobState::DataValidation,
        JobState::InvalidData,
        JobState::Cognition,
        JobState::PartialResult,
        JobState::Completed,
        JobState::Destroyed,
    ];

    pub fn code(self) -> State {
        self as State
    }

    pub fn from_code(code: State) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            JobState::Uninitialized => "Uninitialized",
            JobState::GatheringWorkers => "GatheringWorkers",
            JobState::InsufficientWorkers => "InsufficientWorkers",
            JobState::DataValidation => "DataValidation",
            JobState::InvalidData => "InvalidData",
            JobState::Cognition => "Cognition",
            JobState::PartialResult => "PartialResult",
            JobState::Completed => "Completed",
            JobState::Destroyed => "Destroyed",
        }
    }

    pub fn transits_to(self) -> &'static [JobState] {
        use JobState::*;
        match self {
            Uninitialized => &[GatheringWorkers],
            GatheringWorkers => &[InsufficientWorkers, DataValidation],
            InsufficientWorkers => &[Destroyed],
            DataValidation => &[InvalidData, InsufficientWorkers, Cognition, Destroyed],
            InvalidData => &[Destroyed],
            Cognition => &[PartialResult, Completed],
            PartialResult => &[Destroyed],
            Completed => &[Destroyed],
            Destroyed => &[],
        }
    }

    /// Entering this state ends the node's involvement with the job.
    pub fn ends_job(self) -> bool {
        matches!(self, JobState::Completed | JobState::Destroyed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait CognitiveJobDelegate: Send + Sync {
    /// Stop tracking `job` and release what was allocated for it.
    fn terminate_job(&self, job: JobId);
}

pub fn job_table(job: JobId, delegate: Arc<dyn CognitiveJobDelegate>) -> StateTable {
    JobState::ALL.into_iter().fold(StateTable::new(), |table, state| {
        let targets: Vec<State> = state.transits_to().iter().map(|s| s.code()).collect();
        let mut entry = StateTableEntry::new(state.name(), &targets);
        if state.ends_job() {
            let delegate = Arc::clone(&delegate);
            entry = entry.on_enter(move |_| delegate.terminate_job(job));
        }
        let entry = entry.on_exit(move |to| {
            debug!(
                %job,
                from = state.name(),
                to = JobState::from_code(to).map_or("Unknown", JobState::name),
                "leaving job state"
            )
        });
        table.with(state.code(), entry)
    })
}

/// A job this node takes part in, mirrored from the ledger.
pub struct CognitiveJob<L> {
    machine: StateMachine,
    contract: JobContract<L>,
}

impl<L: Ledger> CognitiveJob<L> {
    pub fn new(
        contract: JobContract<L>,
        delegate: Arc<dyn CognitiveJobDelegate>,
        strict: bool,
    ) -> Self {
        let table = job_table(contract.id(), delegate);
        Self {
            machine: StateMachine::new("CognitiveJob", table, strict),
            contract,
        }
    }
}

impl<L: Ledger> StatefulContract for CognitiveJob<L> {
    fn kind(&self) -> MachineKind {
        MachineKind::CognitiveJob
    }

    fn machine(&self) -> &StateMachine {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut StateMachine {
        &mut self.machine
    }

    fn log_filter(&self) -> LogFilter {
        self.contract.log_filter()
    }

    fn decode_event(&self, log: &Log) -> Result<EventRecord, EventError> {
        self.contract.decode_event(log)
    }

    async fn read_state(&self) -> Result<State, ContractError> {
        self.contract.current_state().await
    }
}
