mod contract;
mod engine;
mod job;
mod worker;

pub use contract::{MachineKind, StatefulContract};
pub use engine::{
    DESTROYED, State, StateMachine, StateTable, StateTableEntry, Transition, TransitionError,
    UNINITIALIZED,
};
pub use job::{CognitiveJob, CognitiveJobDelegate, JobState, job_table};
pub use worker::{WorkerNode, WorkerNodeDelegate, WorkerState, worker_table};

#[cfg(test)]
pub(crate) use worker::tests::SpyDelegate;
