use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

/// Integer code of one lifecycle stage of a ledger contract.
pub type State = u8;

/// Every ledger-backed machine starts here before its first explicit assignment.
pub const UNINITIALIZED: State = 0x00;
/// Terminal state shared by every ledger-backed machine.
pub const DESTROYED: State = 0xFF;

/// Called with the state being left (`None` on the very first assignment).
pub type EnterHook = Box<dyn Fn(Option<State>) + Send + Sync>;
/// Called with the state about to be entered.
pub type ExitHook = Box<dyn Fn(State) + Send + Sync>;

/// Immutable description of one state: its label, where it may go and what
/// happens on the way in and out.
pub struct StateTableEntry {
    name: &'static str,
    transits_to: Vec<State>,
    on_enter: EnterHook,
    on_exit: ExitHook,
}

impl StateTableEntry {
    /// Entry with no-op hooks.
    pub fn new(name: &'static str, transits_to: &[State]) -> Self {
        Self {
            name,
            transits_to: transits_to.to_vec(),
            on_enter: Box::new(|_| {}),
            on_exit: Box::new(|_| {}),
        }
    }

    pub fn on_enter(mut self, hook: impl Fn(Option<State>) + Send + Sync + 'static) -> Self {
        self.on_enter = Box::new(hook);
        self
    }

    pub fn on_exit(mut self, hook: impl Fn(State) + Send + Sync + 'static) -> Self {
        self.on_exit = Box::new(hook);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn transits_to(&self) -> &[State] {
        &self.transits_to
    }

    pub fn permits(&self, to: State) -> bool {
        self.transits_to.contains(&to)
    }
}

impl fmt::Debug for StateTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTableEntry")
            .field("name", &self.name)
            .field("transits_to", &self.transits_to)
            .finish_non_exhaustive()
    }
}

/// Mapping from state code to its entry. Built once per machine and never
/// mutated afterwards.
#[derive(Debug, Default)]
pub struct StateTable {
    entries: BTreeMap<State, StateTableEntry>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, state: State, entry: StateTableEntry) -> Self {
        self.entries.insert(state, entry);
        self
    }

    pub fn get(&self, state: State) -> Option<&StateTableEntry> {
        self.entries.get(&state)
    }

    /// Human readable label for logs; unknown codes render as `Unknown`.
    pub fn name(&self, state: State) -> &'static str {
        self.get(state).map_or("Unknown", StateTableEntry::name)
    }
}

/// Rejected assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("state transition from {from} to {to} is not permitted")]
    NotPermitted { from: State, to: State },

    #[error("state {0} is not defined in the state table")]
    UnknownState(State),
}

/// What an accepted `set_state` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Hooks ran and the machine now holds `to`.
    Entered { from: Option<State>, to: State },
    /// Lenient machine: the move was not in the table and was dropped.
    Ignored { from: State, to: State },
}

/// Transition-table driven state holder.
///
/// Once a state is held, every assignment must be listed in the current
/// entry's `transits_to`. A strict machine rejects anything else with
/// [`TransitionError::NotPermitted`]; a lenient one logs and ignores it.
/// On success the old state's `on_exit` runs strictly before the new
/// state's `on_enter`.
pub struct StateMachine {
    label: &'static str,
    current: Option<State>,
    table: StateTable,
    strict: bool,
}

impl StateMachine {
    pub fn new(label: &'static str, table: StateTable, strict: bool) -> Self {
        Self {
            label,
            current: None,
            table,
            strict,
        }
    }

    /// `None` until the first explicit assignment.
    pub fn current_state(&self) -> Option<State> {
        self.current
    }

    pub fn table(&self) -> &StateTable {
        &self.table
    }

    pub fn set_state(&mut self, to: State) -> Result<Transition, TransitionError> {
        if self.table.get(to).is_none() {
            return Err(TransitionError::UnknownState(to));
        }

        let from = self.current;
        if let Some(from) = from {
            let entry = self
                .table
                .get(from)
                .ok_or(TransitionError::UnknownState(from))?;
            if !entry.permits(to) {
                if self.strict {
                    return Err(TransitionError::NotPermitted { from, to });
                }
                info!(
                    machine = self.label,
                    from = self.table.name(from),
                    to = self.table.name(to),
                    "unregistered state transition ignored"
                );
                return Ok(Transition::Ignored { from, to });
            }
            (entry.on_exit)(to);
        }

        self.current = Some(to);
        debug!(
            machine = self.label,
            from = from.map_or("<none>", |s| self.table.name(s)),
            to = self.table.name(to),
            "entering state"
        );
        if let Some(entry) = self.table.get(to) {
            (entry.on_enter)(from);
        }

        Ok(Transition::Entered { from, to })
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("label", &self.label)
            .field("current", &self.current)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}
