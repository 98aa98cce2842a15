use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::ledger::JobId;
use crate::state_machine::MachineKind;

/// One observed change in the node's situation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    LedgerLink { connected: bool },
    MachineState { kind: MachineKind, state: &'static str },
    JobAssigned(Option<JobId>),
    Artifacts { kernel: String, dataset: String },
    ResultProvided(String),
    /// Job finished; forget everything job related.
    CompleteReset,
}

/// Receives status updates from anywhere in the node.
pub trait StatusObserver: Send + Sync {
    fn update(&self, update: StatusUpdate);
}

/// Snapshot of what the node currently believes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub ledger_connected: bool,
    pub worker_state: Option<String>,
    pub job_id: Option<String>,
    pub job_state: Option<String>,
    pub kernel: Option<String>,
    pub dataset: Option<String>,
    pub last_result: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            ledger_connected: false,
            worker_state: None,
            job_id: None,
            job_state: None,
            kernel: None,
            dataset: None,
            last_result: None,
            updated_at: Utc::now(),
        }
    }
}

impl NodeStatus {
    fn apply(&mut self, update: StatusUpdate) {
        match update {
            StatusUpdate::LedgerLink { connected } => self.ledger_connected = connected,
            StatusUpdate::MachineState { kind: MachineKind::WorkerNode, state } => {
                self.worker_state = Some(state.to_string())
            }
            StatusUpdate::MachineState { kind: MachineKind::CognitiveJob, state } => {
                self.job_state = Some(state.to_string())
            }
            StatusUpdate::JobAssigned(job) => self.job_id = job.map(|j| j.to_string()),
            StatusUpdate::Artifacts { kernel, dataset } => {
                self.kernel = Some(kernel);
                self.dataset = Some(dataset);
            }
            StatusUpdate::ResultProvided(reference) => self.last_result = Some(reference),
            StatusUpdate::CompleteReset => {
                self.job_id = None;
                self.job_state = None;
                self.kernel = None;
                self.dataset = None;
            }
        }
        self.updated_at = Utc::now();
    }
}

/// Keeps the latest [`NodeStatus`] and lets readers subscribe to changes.
pub struct StatusBoard {
    tx: watch::Sender<NodeStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NodeStatus::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> NodeStatus {
        self.tx.borrow().clone()
    }
}

impl StatusObserver for StatusBoard {
    fn update(&self, update: StatusUpdate) {
        self.tx.send_modify(|status| status.apply(update));
    }
}
