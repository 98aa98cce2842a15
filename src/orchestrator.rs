use std::sync::Arc;

use alloy_primitives::Address;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{Action, BrokerError, TransactionBroker};
use crate::config::{JobProtocol, NodeConfig};
use crate::error::NodeError;
use crate::ledger::contracts::{ContractHandle, artifact_reference};
use crate::ledger::{JobContract, JobId, Ledger, WorkerContract};
use crate::pipeline::{CognitivePipeline, ContentStore, JobSpec, PipelineDelegate};
use crate::state_machine::{
    CognitiveJob, CognitiveJobDelegate, State, WorkerNode, WorkerNodeDelegate,
};
use crate::synchronizer::EventSynchronizer;
use crate::telemetry::{StatusObserver, StatusUpdate};
use crate::vault::{VaultError, Wallet};

/// Requests raised by state hooks and pipeline callbacks, handled one at a
/// time by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeIntent {
    CreateJob { then: Option<Action> },
    StartValidating,
    StartComputing,
    Transact(Action),
    TerminateJob(JobId),
    ValidationComplete(bool),
    ComputeComplete { success: bool, result: Option<String> },
    TrainingProgress(u8),
}

/// Delegate handed to state machines and the pipeline. Every callback becomes
/// a [`NodeIntent`] so hooks never block the synchronizer that fired them.
#[derive(Clone)]
pub struct HookSender {
    tx: mpsc::UnboundedSender<NodeIntent>,
}

impl HookSender {
    fn send(&self, intent: NodeIntent) {
        if let Err(e) = self.tx.send(intent) {
            debug!(intent = ?e.0, "orchestrator gone, intent dropped");
        }
    }
}

impl WorkerNodeDelegate for HookSender {
    fn create_cognitive_job(&self, then: Option<Action>) {
        self.send(NodeIntent::CreateJob { then });
    }

    fn start_validating(&self) {
        self.send(NodeIntent::StartValidating);
    }

    fn start_computing(&self) {
        self.send(NodeIntent::StartComputing);
    }

    fn state_transact(&self, action: Action) {
        self.send(NodeIntent::Transact(action));
    }
}

impl CognitiveJobDelegate for HookSender {
    fn terminate_job(&self, job: JobId) {
        self.send(NodeIntent::TerminateJob(job));
    }
}

impl PipelineDelegate for HookSender {
    fn on_validation_complete(&self, success: bool) {
        self.send(NodeIntent::ValidationComplete(success));
    }

    fn on_compute_complete(&self, success: bool, result: Option<String>) {
        self.send(NodeIntent::ComputeComplete { success, result });
    }

    fn on_training_progress(&self, percent: u8) {
        self.send(NodeIntent::TrainingProgress(percent));
    }
}

/// How [`Orchestrator::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// The runtime must be replaced by a fresh process.
    Restart,
}

struct ActiveJob {
    id: JobId,
    cancel: watch::Sender<bool>,
    spec: Option<JobSpec>,
}

/// Owns the worker node, the job being worked on and the only transaction
/// broker of the process.
pub struct Orchestrator<L, P, S> {
    config: NodeConfig,
    ledger: Arc<L>,
    worker: WorkerContract<L>,
    broker: TransactionBroker<L>,
    pipeline: Arc<P>,
    store: Arc<S>,
    status: Arc<dyn StatusObserver>,
    hooks: HookSender,
    intents: mpsc::UnboundedReceiver<NodeIntent>,
    shutdown: watch::Sender<bool>,
    worker_state: watch::Receiver<Option<State>>,
    job: Option<ActiveJob>,
}

async fn verify_contract<L: Ledger>(
    ledger: &Arc<L>,
    contract: &'static str,
    address: Address,
) -> Result<Address, NodeError> {
    let owner = ContractHandle::new(Arc::clone(ledger), address)
        .verify()
        .await
        .map_err(|source| NodeError::ContractMismatch {
            contract,
            address,
            source,
        })?;
    debug!(contract, %address, %owner, "contract verified");
    Ok(owner)
}

impl<L: Ledger, P: CognitivePipeline, S: ContentStore> Orchestrator<L, P, S> {
    /// Checks the ledger, the contracts and the wallet, reads the worker's
    /// state and starts following it.
    pub async fn start(
        config: NodeConfig,
        ledger: Arc<L>,
        wallet: Wallet,
        pipeline: Arc<P>,
        store: Arc<S>,
        status: Arc<dyn StatusObserver>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        match ledger.syncing().await {
            Ok(false) => {}
            Ok(true) => return Err(NodeError::NotInSync),
            Err(e) => return Err(NodeError::Connectivity(e)),
        }
        status.update(StatusUpdate::LedgerLink { connected: true });

        let worker_address = config.ledger.worker_contract;
        let worker = WorkerContract::new(Arc::clone(&ledger), worker_address);
        worker
            .verify()
            .await
            .map_err(|source| NodeError::ContractMismatch {
                contract: "worker",
                address: worker_address,
                source,
            })?;
        verify_contract(&ledger, "market", config.ledger.market_contract).await?;
        if let (JobProtocol::JobController, Some(controller)) =
            (config.ledger.job_protocol, config.ledger.job_controller)
        {
            verify_contract(&ledger, "job controller", controller).await?;
        }

        if wallet.address() != config.vault.account {
            return Err(VaultError::AccountMismatch {
                expected: config.vault.account,
                found: wallet.address(),
            }
            .into());
        }

        let chain_id = match config.ledger.chain_id {
            Some(id) => id,
            None => ledger.chain_id().await.map_err(NodeError::Connectivity)?,
        };
        info!(
            chain_id,
            account = %wallet.address(),
            worker = %worker_address,
            "ledger connection ready"
        );

        let broker = TransactionBroker::new(
            Arc::clone(&ledger),
            wallet,
            chain_id,
            worker_address,
            config.ledger.market_contract,
            config.broker.clone(),
        );

        let (tx, intents) = mpsc::unbounded_channel();
        let hooks = HookSender { tx };
        let node = WorkerNode::new(
            WorkerContract::new(Arc::clone(&ledger), worker_address),
            Arc::new(hooks.clone()),
            config.strict_transitions,
        );
        let mut sync = EventSynchronizer::new(
            Arc::clone(&ledger),
            node,
            config.sync.clone(),
            Arc::clone(&status),
        );
        sync.process_state().await?;
        let worker_state = sync.subscribe();

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(sync.run(shutdown_rx));

        Ok(Self {
            config,
            ledger,
            worker,
            broker,
            pipeline,
            store,
            status,
            hooks,
            intents,
            shutdown,
            worker_state,
            job: None,
        })
    }

    /// Latest worker state seen by the synchronizer.
    pub fn worker_state(&self) -> Option<State> {
        *self.worker_state.borrow()
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.job.as_ref().map(|job| job.id)
    }

    /// Handles intents until shutdown is requested or the process has to be
    /// relaunched.
    pub async fn run(mut self) -> Result<Exit, NodeError> {
        let exit = loop {
            tokio::select! {
                step = self.step() => {
                    if let Some(exit) = step? {
                        break exit;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break Exit::Shutdown;
                }
            }
        };
        self.stop();
        Ok(exit)
    }

    /// Waits for the next intent and handles it.
    pub async fn step(&mut self) -> Result<Option<Exit>, NodeError> {
        match self.intents.recv().await {
            Some(intent) => self.handle(intent).await,
            None => Ok(Some(Exit::Shutdown)),
        }
    }

    fn stop(&mut self) {
        self.drop_job();
        self.shutdown.send_replace(true);
    }

    async fn handle(&mut self, intent: NodeIntent) -> Result<Option<Exit>, NodeError> {
        debug!(?intent, "handling intent");
        match intent {
            NodeIntent::CreateJob { then } => {
                if self.ensure_job().await.is_some()
                    && let Some(action) = then
                {
                    self.transact(action).await;
                }
            }
            NodeIntent::StartValidating => self.start_validating().await,
            NodeIntent::StartComputing => self.start_computing().await,
            NodeIntent::Transact(action) => self.transact(action).await,
            NodeIntent::TerminateJob(id) => {
                if self.active_job() == Some(id) {
                    info!(job = %id, "job finished, releasing it");
                    self.drop_job();
                }
            }
            NodeIntent::ValidationComplete(valid) => {
                let action = if valid {
                    Action::AcceptValidData
                } else {
                    Action::ReportInvalidData
                };
                self.transact(action).await;
            }
            NodeIntent::ComputeComplete {
                success: true,
                result: Some(reference),
            } => {
                info!(result = %reference, "computing complete, providing results");
                self.status.update(StatusUpdate::ResultProvided(reference.clone()));
                self.status.update(StatusUpdate::CompleteReset);
                self.transact(Action::ProvideResults(reference)).await;
            }
            NodeIntent::ComputeComplete { .. } => {
                error!("computing failed, relaunching to retry the work in a clean process");
                return Ok(Some(Exit::Restart));
            }
            NodeIntent::TrainingProgress(percent) => {
                if let Err(e) = self
                    .broker
                    .submit_unconfirmed(Action::ReportProgress(percent))
                    .await
                {
                    warn!(percent, error = %e, "progress report not sent");
                }
            }
        }
        Ok(None)
    }

    async fn transact(&mut self, action: Action) {
        match self.broker.submit(action).await {
            Ok(_) => {}
            Err(BrokerError::Critical { action, reason }) => {
                error!(%action, %reason, "giving up on the current job");
                self.drop_job();
            }
            Err(e) => warn!(error = %e, "transaction not completed"),
        }
    }

    fn job_contract(&self, id: JobId) -> JobContract<L> {
        match (self.config.ledger.job_protocol, self.config.ledger.job_controller) {
            (JobProtocol::JobController, Some(controller)) => {
                JobContract::via_controller(Arc::clone(&self.ledger), controller, id)
            }
            _ => JobContract::per_job(Arc::clone(&self.ledger), id),
        }
    }

    /// Returns the worker's active job as the ledger reports it, switching
    /// over when it is not the one being tracked.
    async fn ensure_job(&mut self) -> Option<JobId> {
        let id = match self.worker.active_job().await {
            Ok(Some(id)) => id,
            Ok(None) => {
                info!("worker has no active job");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "cannot read active job");
                return None;
            }
        };

        match self.active_job() {
            Some(tracked) if tracked == id => return Some(id),
            Some(tracked) => {
                info!(old = %tracked, new = %id, "active job changed");
                self.drop_job();
            }
            None => {}
        }

        let job = CognitiveJob::new(
            self.job_contract(id),
            Arc::new(self.hooks.clone()),
            self.config.strict_transitions,
        );
        let mut sync = EventSynchronizer::new(
            Arc::clone(&self.ledger),
            job,
            self.config.sync.clone(),
            Arc::clone(&self.status),
        );
        if let Err(e) = sync.process_state().await {
            warn!(job = %id, error = %e, "cannot read job state, will retry");
            return None;
        }
        info!(job = %id, "tracking cognitive job");

        let (cancel, cancel_rx) = watch::channel(false);
        tokio::spawn(sync.run(cancel_rx));
        self.status.update(StatusUpdate::JobAssigned(Some(id)));
        self.job = Some(ActiveJob {
            id,
            cancel,
            spec: None,
        });
        Some(id)
    }

    fn drop_job(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel.send_replace(true);
            self.status.update(StatusUpdate::CompleteReset);
        }
    }

    /// Resolves and downloads kernel and dataset of `id`.
    async fn resolve_spec(&self, id: JobId) -> Result<JobSpec, NodeError> {
        let details = self.job_contract(id).details().await?;
        let batch = details
            .workers
            .iter()
            .position(|w| *w == self.worker.address())
            .ok_or(NodeError::NotAssigned(id))?;

        let kernel_ref = artifact_reference(&self.ledger, details.kernel).await?;
        let dataset_ref = artifact_reference(&self.ledger, details.dataset).await?;
        self.status.update(StatusUpdate::Artifacts {
            kernel: kernel_ref.clone(),
            dataset: dataset_ref.clone(),
        });

        let dir = self.config.content.work_dir.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let kernel = self.store.download(&kernel_ref, &dir.join("kernel")).await?;
        let dataset = self.store.download(&dataset_ref, &dir.join("dataset")).await?;
        info!(
            job = %id,
            batch,
            kernel = %kernel_ref,
            dataset = %dataset_ref,
            "job artifacts ready"
        );

        Ok(JobSpec {
            job: id,
            kernel,
            dataset,
            batch,
            output: dir.join("result"),
        })
    }

    async fn job_spec(&mut self) -> Result<Option<JobSpec>, NodeError> {
        let Some(id) = self.ensure_job().await else {
            return Ok(None);
        };
        if let Some(spec) = self.job.as_ref().and_then(|job| job.spec.clone()) {
            return Ok(Some(spec));
        }
        let spec = self.resolve_spec(id).await?;
        if let Some(job) = self.job.as_mut() {
            job.spec = Some(spec.clone());
        }
        Ok(Some(spec))
    }

    async fn start_validating(&mut self) {
        let spec = match self.job_spec().await {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                warn!("validation requested without an active job");
                return;
            }
            Err(e) => {
                warn!(error = %e, "cannot load job data");
                self.hooks.on_validation_complete(false);
                return;
            }
        };
        let pipeline = Arc::clone(&self.pipeline);
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            let result = pipeline.validate(&spec).await;
            if let Err(e) = &result {
                warn!(job = %spec.job, error = %e, "data validation failed");
            }
            hooks.on_validation_complete(result.is_ok());
        });
    }

    async fn start_computing(&mut self) {
        let spec = match self.job_spec().await {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                warn!("computing requested without an active job");
                return;
            }
            Err(e) => {
                error!(error = %e, "cannot load job data for computing");
                self.hooks.on_compute_complete(false, None);
                return;
            }
        };
        let pipeline = Arc::clone(&self.pipeline);
        let store = Arc::clone(&self.store);
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            let output = match pipeline.compute(&spec, &hooks).await {
                Ok(output) => output,
                Err(e) => {
                    error!(job = %spec.job, error = %e, "computing failed");
                    hooks.on_compute_complete(false, None);
                    return;
                }
            };
            match store.upload(&output).await {
                Ok(reference) => hooks.on_compute_complete(true, Some(reference)),
                Err(e) => {
                    error!(job = %spec.job, error = %e, "cannot upload results");
                    hooks.on_compute_complete(false, None);
                }
            }
        });
    }
}
