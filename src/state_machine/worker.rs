use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::contract::{MachineKind, StatefulContract};
use super::engine::{State, StateMachine, StateTable, StateTableEntry};
use crate::broker::Action;
use crate::ledger::{ContractError, EventError, EventRecord, Ledger, Log, LogFilter, WorkerContract};

/// Lifecycle of the on-ledger worker contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Uninitialized = 0,
    Offline = 1,
    Idle = 2,
    Assigned = 3,
    ReadyForDataValidation = 4,
    ValidatingData = 5,
    ReadyForComputing = 6,
    Computing = 7,
    InsufficientStake = 8,
    UnderPenalty = 9,
    Destroyed = 0xFF,
}

impl WorkerState {
    pub const ALL: [WorkerState; 11] = [
        WorkerState::Uninitialized,
        WorkerState::Offline,
        WorkerState::Idle,
        WorkerState::Assigned,
        WorkerState::ReadyForDataValidation,
        WorkerState::ValidatingData,
        WorkerState::ReadyForComputing,
        WorkerState::Computing,
        WorkerState::InsufficientStake,
        WorkerState::UnderPenalty,
        WorkerState::Destroyed,
    ];

    pub fn code(self) -> State {
        self as State
    }

    pub fn from_code(code: State) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            WorkerState::Uninitialized => "Uninitialized",
            WorkerState::Offline => "Offline",
            WorkerState::Idle => "Idle",
            WorkerState::Assigned => "Assigned",
            WorkerState::ReadyForDataValidation => "ReadyForDataValidation",
            WorkerState::ValidatingData => "ValidatingData",
            WorkerState::ReadyForComputing => "ReadyForComputing",
            WorkerState::Computing => "Computing",
            WorkerState::InsufficientStake => "InsufficientStake",
            WorkerState::UnderPenalty => "UnderPenalty",
            WorkerState::Destroyed => "Destroyed",
        }
    }

    /// States the ledger protocol allows this one to move to.
    pub fn transits_to(self) -> &'static [WorkerState] {
        use WorkerState::*;
        match self {
            Uninitialized => &[Idle, Offline, InsufficientStake],
            Offline => &[Idle],
            Idle => &[Offline, Assigned, UnderPenalty, Destroyed],
            Assigned => &[Offline, ReadyForDataValidation, UnderPenalty],
            ReadyForDataValidation => &[Offline, ValidatingData, Idle, UnderPenalty],
            ValidatingData => &[Offline, Idle, ReadyForComputing, UnderPenalty],
            ReadyForComputing => &[Offline, Idle, Computing, UnderPenalty],
            Computing => &[Offline, Idle, UnderPenalty],
            InsufficientStake => &[Offline, Idle, Destroyed],
            UnderPenalty => &[Offline, Idle, InsufficientStake],
            Destroyed => &[],
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Callbacks fired when the worker machine enters a state.
///
/// Hooks run synchronously inside the state write, so implementations must
/// only record or forward the request and return immediately.
pub trait WorkerNodeDelegate: Send + Sync {
    /// Resolve the active job and start tracking it. `then` is submitted once
    /// a job id is known.
    fn create_cognitive_job(&self, then: Option<Action>);
    fn start_validating(&self);
    fn start_computing(&self);
    fn state_transact(&self, action: Action);
}

/// Transition table of the worker contract with this node's hooks attached.
pub fn worker_table(delegate: Arc<dyn WorkerNodeDelegate>) -> StateTable {
    WorkerState::ALL.into_iter().fold(StateTable::new(), |table, state| {
        let targets: Vec<State> = state.transits_to().iter().map(|s| s.code()).collect();
        let entry = StateTableEntry::new(state.name(), &targets);
        let delegate = Arc::clone(&delegate);
        let entry = match state {
            WorkerState::Offline => {
                entry.on_enter(move |_| delegate.state_transact(Action::Alive))
            }
            WorkerState::Assigned => entry.on_enter(move |_| {
                delegate.create_cognitive_job(Some(Action::AcceptAssignment))
            }),
            WorkerState::ReadyForDataValidation => entry.on_enter(move |_| {
                delegate.create_cognitive_job(None);
                delegate.state_transact(Action::ProcessToDataValidation);
            }),
            WorkerState::ValidatingData => entry.on_enter(move |_| {
                delegate.create_cognitive_job(None);
                delegate.start_validating();
            }),
            WorkerState::ReadyForComputing => {
                entry.on_enter(move |_| delegate.state_transact(Action::ProcessToCognition))
            }
            WorkerState::Computing => entry.on_enter(move |_| delegate.start_computing()),
            _ => entry,
        };
        let entry = entry.on_exit(move |to| {
            debug!(
                from = state.name(),
                to = WorkerState::from_code(to).map_or("Unknown", WorkerState::name),
                "leaving worker state"
            )
        });
        table.with(state.code(), entry)
    })
}

/// This node's worker contract and the machine mirroring it.
pub struct WorkerNode<L> {
    machine: StateMachine,
    contract: WorkerContract<L>,
}

impl<L: Ledger> WorkerNode<L> {
    pub fn new(
        contract: WorkerContract<L>,
        delegate: Arc<dyn WorkerNodeDelegate>,
        strict: bool,
    ) -> Self {
        Self {
            machine: StateMachine::new("WorkerNode", worker_table(delegate), strict),
            contract,
        }
    }
}

impl<L: Ledger> StatefulContract for WorkerNode<L> {
    fn kind(&self) -> MachineKind {
        MachineKind::WorkerNode
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state_machine::{TransitionError, UNINITIALIZED};
    use std::sync::Mutex;

    /// Records every delegate call in order.
    #[derive(Default)]
    pub(crate) struct SpyDelegate {
        pub calls: Mutex<Vec<String>>,
    }

    impl SpyDelegate {
        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl WorkerNodeDelegate for SpyDelegate {
        fn create_cognitive_job(&self, then: Option<Action>) {
            let then = then.map_or("none".to_string(), |a| a.method().to_string());
            self.calls.lock().unwrap().push(format!("create_job then {then}"));
        }
        fn start_validating(&self) {
            self.calls.lock().unwrap().push("validate".into());
        }
        fn start_computing(&self) {
            self.calls.lock().unwrap().push("compute".into());
        }
        fn state_transact(&self, action: Action) {
            self.calls.lock().unwrap().push(format!("transact {}", action.method()));
        }
    }

    fn machine() -> (StateMachine, Arc<SpyDelegate>) {
        let spy = Arc::new(SpyDelegate::default());
        let sm = StateMachine::new("WorkerNode", worker_table(spy.clone()), true);
        (sm, spy)
    }

    fn code(s: WorkerState) -> State {
        s.code()
    }

    #[test]
    fn codes_round_trip() {
        for state in WorkerState::ALL {
            assert_eq!(WorkerState::from_code(state.code()), Some(state));
        }
        assert_eq!(WorkerState::from_code(10), None);
        assert_eq!(WorkerState::Destroyed.code(), 0xFF);
    }

    #[test]
    fn first_assignment_from_fresh_machine() {
        let (mut sm, spy) = machine();
        sm.set_state(code(WorkerState::Offline)).unwrap();
        assert_eq!(spy.take(), vec!["transact alive"]);
    }

    #[test]
    fn uninitialized_cannot_jump_to_assigned() {
        let (mut sm, _) = machine();
        sm.set_state(UNINITIALIZED).unwrap();
        assert_eq!(
            sm.set_state(3),
            Err(TransitionError::NotPermitted { from: 0, to: 3 })
        );
        assert_eq!(sm.current_state(), Some(UNINITIALIZED));
    }

    #[test]
    fn idle_to_assigned_only_creates_the_job() {
        let (mut sm, spy) = machine();
        sm.set_state(code(WorkerState::Idle)).unwrap();
        assert!(spy.take().is_empty());

        sm.set_state(code(WorkerState::Assigned)).unwrap();
        assert_eq!(spy.take(), vec!["create_job then acceptAssignment"]);
    }

    #[test]
    fn idle_to_penalty_is_legal() {
        let (mut sm, spy) = machine();
        sm.set_state(2).unwrap();
        sm.set_state(9).unwrap();
        assert!(spy.take().is_empty());
    }

    #[test]
    fn insufficient_stake_cannot_be_assigned() {
        let (mut sm, _) = machine();
        sm.set_state(8).unwrap();
        assert_eq!(sm.set_state(3), Err(TransitionError::NotPermitted { from: 8, to: 3 }));
    }

    #[test]
    fn happy_path_hooks() {
        let (mut sm, spy) = machine();
        for s in [
            WorkerState::Idle,
            WorkerState::Assigned,
            WorkerState::ReadyForDataValidation,
            WorkerState::ValidatingData,
            WorkerState::ReadyForComputing,
            WorkerState::Computing,
            WorkerState::Idle,
        ] {
            sm.set_state(s.code()).unwrap();
        }
        assert_eq!(
            spy.take(),
            vec![
                "create_job then acceptAssignment",
                "create_job then none",
                "transact processToDataValidation",
                "create_job then none",
                "validate",
                "transact processToCognition",
                "compute",
            ]
        );
    }

    #[test]
    fn legality_matches_the_table_for_every_pair() {
        for from in WorkerState::ALL {
            for to in WorkerState::ALL {
                let (mut sm, _) = machine();
                sm.set_state(from.code()).unwrap();
                let result = sm.set_state(to.code());
                if from.transits_to().contains(&to) {
                    assert!(result.is_ok(), "{from} -> {to}");
                } else {
                    assert_eq!(
                        result,
                        Err(TransitionError::NotPermitted { from: from.code(), to: to.code() })
                    );
                    assert_eq!(sm.current_state(), Some(from.code()));
                }
            }
        }
    }

    #[test]
    fn destroyed_is_final() {
        let (mut sm, _) = machine();
        sm.set_state(code(WorkerState::Destroyed)).unwrap();
        for to in WorkerState::ALL {
            assert!(sm.set_state(to.code()).is_err());
        }
    }
}
