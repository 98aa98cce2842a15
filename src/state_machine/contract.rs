use std::fmt;
use std::future::Future;

use super::engine::{State, StateMachine};
use crate::ledger::{ContractError, EventError, EventRecord, Log, LogFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    WorkerNode,
    CognitiveJob,
}

impl fmt::Display for MachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineKind::WorkerNode => write!(f, "worker"),
            MachineKind::CognitiveJob => write!(f, "job"),
        }
    }
}

/// A ledger contract whose lifecycle is mirrored by a local [`StateMachine`].
///
/// The event synchronizer owns the implementor and is the only code that
/// ever calls [`StateMachine::set_state`] on it.
pub trait StatefulContract: Send + 'static {
    fn kind(&self) -> MachineKind;

    fn machine(&self) -> &StateMachine;

    fn machine_mut(&mut self) -> &mut StateMachine;

    /// Log subscription for this contract's state change events.
    fn log_filter(&self) -> LogFilter;

    fn decode_event(&self, log: &Log) -> Result<EventRecord, EventError>;

    /// Authoritative state as the ledger reports it right now.
    fn read_state(&self) -> impl Future<Output = Result<State, ContractError>> + Send;
}
