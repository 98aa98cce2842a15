//! Keeps a local state machine in step with its ledger contract.
//!
//! The synchronizer owns the contract it watches and is the only writer of
//! its state. It polls a log filter at a rate derived from the observed block
//! time and recreates the filter when the node forgets it or it goes quiet
//! for too long.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::ledger::{
    BlockHeader, ContractError, EventRecord, FilterId, Ledger, RpcError, RpcErrorKind,
};
use crate::state_machine::{State, StatefulContract, Transition, TransitionError};
use crate::telemetry::{StatusObserver, StatusUpdate};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot read contract state: {0}")]
    Read(#[from] ContractError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Derives the poll interval from how fast blocks are being produced.
#[derive(Debug, Clone)]
pub struct BlockPacer {
    last: Option<BlockHeader>,
    fallback: Duration,
    slack: Duration,
    floor: Duration,
}

impl BlockPacer {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            last: None,
            fallback: config.fallback_interval(),
            slack: config.slack(),
            floor: config.min_interval(),
        }
    }

    /// Interval until the next poll given the newest block header.
    ///
    /// With at least one new block since the previous call this is the mean
    /// block time minus the slack, never below the floor. Otherwise it is the
    /// fallback interval.
    pub fn next_interval(&mut self, header: BlockHeader) -> Duration {
        let interval = match self.last {
            Some(last) if header.number > last.number => {
                let blocks = header.number - last.number;
                let elapsed_ms =
                    header.timestamp.saturating_sub(last.timestamp).saturating_mul(1000);
                Duration::from_millis(elapsed_ms / blocks)
                    .saturating_sub(self.slack)
                    .max(self.floor)
            }
            _ => self.fallback,
        };
        self.last = Some(header);
        interval
    }
}

pub struct EventSynchronizer<L, C> {
    ledger: Arc<L>,
    target: C,
    config: SyncConfig,
    pacer: BlockPacer,
    filter: Option<FilterId>,
    installed: bool,
    last_poll: Instant,
    last_block: u64,
    cursor: Option<(u64, u64)>,
    connected: Option<bool>,
    state_tx: watch::Sender<Option<State>>,
    observer: Arc<dyn StatusObserver>,
}

impl<L: Ledger, C: StatefulContract> EventSynchronizer<L, C> {
    pub fn new(
        ledger: Arc<L>,
        target: C,
        config: SyncConfig,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        let (state_tx, _) = watch::channel(target.machine().current_state());
        Self {
            ledger,
            pacer: BlockPacer::new(&config),
            target,
            config,
            filter: None,
            installed: false,
            last_poll: Instant::now(),
            last_block: 0,
            cursor: None,
            connected: None,
            state_tx,
            observer,
        }
    }

    /// Snapshots of the machine's state, published after every accepted write.
    pub fn subscribe(&self) -> watch::Receiver<Option<State>> {
        self.state_tx.subscribe()
    }

    /// Reads the ledger state and performs the first assignment.
    pub async fn process_state(&mut self) -> Result<Transition, SyncError> {
        let state = self.target.read_state().await?;
        let transition = self.target.machine_mut().set_state(state)?;
        info!(
            machine = %self.target.kind(),
            state = self.target.machine().table().name(state),
            "initial state read from ledger"
        );
        self.publish();
        Ok(transition)
    }

    /// Applies one ledger event. Replays and no-op events return `None`.
    pub fn apply(&mut self, record: EventRecord) -> Option<Transition> {
        if let Some(at) = record.cursor() {
            if self.cursor.is_some_and(|seen| at <= seen) {
                trace!(
                    machine = %self.target.kind(),
                    block = at.0,
                    index = at.1,
                    "event already applied"
                );
                return None;
            }
            self.cursor = Some(at);
            self.last_block = self.last_block.max(at.0);
        }
        if self.target.machine().current_state() == Some(record.new_state) {
            debug!(
                machine = %self.target.kind(),
                state = self.target.machine().table().name(record.new_state),
                "duplicate state event ignored"
            );
            return None;
        }
        self.set_state(record.new_state)
    }

    fn set_state(&mut self, to: State) -> Option<Transition> {
        let kind = self.target.kind();
        let machine = self.target.machine_mut();
        let from = machine.current_state();
        let from_name = from.map_or("<none>", |s| machine.table().name(s));
        let to_name = machine.table().name(to);
        match machine.set_state(to) {
            Ok(transition @ Transition::Entered { .. }) => {
                info!(machine = %kind, from = from_name, to = to_name, "state changed");
                self.publish();
                Some(transition)
            }
            Ok(transition) => Some(transition),
            Err(e) => {
                warn!(
                    machine = %kind,
                    from = from_name,
                    to = to_name,
                    error = %e,
                    "ledger transition dropped"
                );
                None
            }
        }
    }

    fn publish(&self) {
        let current = self.target.machine().current_state();
        self.state_tx.send_replace(current);
        if let Some(state) = current {
            self.observer.update(StatusUpdate::MachineState {
                kind: self.target.kind(),
                state: self.target.machine().table().name(state),
            });
        }
    }

    fn link(&mut self, connected: bool) {
        if self.connected != Some(connected) {
            self.connected = Some(connected);
            self.observer.update(StatusUpdate::LedgerLink { connected });
        }
    }

    fn observe_block(&mut self, header: BlockHeader) -> Duration {
        self.last_block = self.last_block.max(header.number);
        self.link(true);
        self.pacer.next_interval(header)
    }

    async fn install(&mut self, from_block: u64) -> Result<(), RpcError> {
        if let Some(old) = self.filter.take()
            && let Err(e) = self.ledger.uninstall_filter(&old).await
        {
            debug!(filter = %old, error = %e, "cannot uninstall stale filter");
        }
        let filter = self.target.log_filter().starting_at(from_block);
        let id = self.ledger.new_filter(&filter).await?;
        debug!(machine = %self.target.kind(), filter = %id, from_block, "log filter installed");
        self.filter = Some(id);
        self.last_poll = Instant::now();
        Ok(())
    }

    /// Replaces the filter, starting a few blocks back, and reconciles with
    /// the ledger state in case events were lost in between.
    async fn reinstall(&mut self) -> Result<(), RpcError> {
        let from = self.last_block.saturating_sub(self.config.rewind_blocks);
        warn!(machine = %self.target.kind(), from_block = from, "recreating log filter");
        self.install(from).await?;
        match self.target.read_state().await {
            Ok(state) if self.target.machine().current_state() != Some(state) => {
                info!(machine = %self.target.kind(), "state drifted while the filter was gone");
                self.set_state(state);
            }
            Ok(_) => {}
            Err(e) => warn!(machine = %self.target.kind(), error = %e, "cannot reconcile state"),
        }
        Ok(())
    }

    /// Fetches and applies new events. Returns how many logs were received.
    pub async fn poll_once(&mut self) -> Result<usize, RpcError> {
        if self.filter.is_none() && !self.installed {
            self.install(self.last_block).await?;
            self.installed = true;
        } else if self.filter.is_none()
            || self.last_poll.elapsed() >= self.config.idle_threshold()
        {
            self.reinstall().await?;
        }

        let Some(id) = self.filter.clone() else {
            return Ok(0);
        };
        let logs = match self.ledger.filter_changes(&id).await {
            Ok(logs) => logs,
            Err(e) if e.kind() == RpcErrorKind::FilterNotFound => {
                self.filter = None;
                self.reinstall().await?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        self.last_poll = Instant::now();

        for log in &logs {
            match self.target.decode_event(log) {
                Ok(record) => {
                    self.apply(record);
                }
                Err(e) => {
                    warn!(machine = %self.target.kind(), error = %e, "undecodable log skipped")
                }
            }
        }
        Ok(logs.len())
    }

    /// One round of the run loop. Returns how long to wait before the next.
    async fn tick(&mut self) -> Duration {
        let kind = self.target.kind();
        let interval = match self.ledger.latest_block().await {
            Ok(header) => self.observe_block(header),
            Err(e) => {
                warn!(machine = %kind, error = %e, "cannot read latest block");
                self.link(false);
                self.config.fallback_interval()
            }
        };

        match self.poll_once().await {
            Ok(count) if count > 0 => trace!(machine = %kind, count, "logs received"),
            Ok(_) => {}
            Err(e) => warn!(machine = %kind, error = %e, "event poll failed"),
        }
        interval
    }

    /// Polls until `cancel` turns `true` or its sender goes away.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let kind = self.target.kind();
        info!(machine = %kind, "event synchronizer started");

        while !*cancel.borrow() {
            let interval = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                result = cancel.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(id) = self.filter.take()
            && let Err(e) = self.ledger.uninstall_filter(&id).await
        {
            debug!(filter = %id, error = %e, "cannot uninstall filter on shutdown");
        }
        info!(machine = %kind, "event synchronizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::events::fixtures;
    use crate::ledger::testing::MockLedger;
    use crate::ledger::{JobContract, JobId, WorkerContract, contracts};
    use crate::state_machine::{CognitiveJob, CognitiveJobDelegate, SpyDelegate, WorkerNode};
    use crate::telemetry::StatusBoard;
    use alloy_primitives::{Address, B256};

    const WORKER: Address = Address::repeat_byte(0x10);

    fn config() -> SyncConfig {
        SyncConfig {
            fallback_interval_ms: 10,
            slack_ms: 0,
            min_interval_ms: 1,
            idle_threshold_secs: 3600,
            rewind_blocks: 2,
        }
    }

    fn header(number: u64, timestamp: u64) -> BlockHeader {
        BlockHeader { number, timestamp }
    }

    fn worker_sync(
        ledger: &Arc<MockLedger>,
        config: SyncConfig,
    ) -> (
        EventSynchronizer<MockLedger, WorkerNode<MockLedger>>,
        Arc<SpyDelegate>,
        Arc<StatusBoard>,
    ) {
        let spy = Arc::new(SpyDelegate::default());
        let node = WorkerNode::new(
            WorkerContract::new(Arc::clone(ledger), WORKER),
            spy.clone(),
            false,
        );
        let board = Arc::new(StatusBoard::new());
        let sync = EventSynchronizer::new(Arc::clone(ledger), node, config, board.clone());
        (sync, spy, board)
    }

    fn set_ledger_state(ledger: &MockLedger, state: u64) {
        ledger.set_call(WORKER, contracts::CURRENT_STATE, MockLedger::word_u64(state));
    }

    #[test]
    fn pacer_falls_back_without_new_blocks() {
        let mut pacer = BlockPacer::new(&SyncConfig::default());
        assert_eq!(pacer.next_interval(header(10, 1000)), Duration::from_secs(5));
        assert_eq!(pacer.next_interval(header(10, 1000)), Duration::from_secs(5));
    }

    #[test]
    fn pacer_follows_block_time() {
        let mut pacer = BlockPacer::new(&SyncConfig::default());
        pacer.next_interval(header(10, 1000));
        // Two blocks in 30 seconds, minus 500ms of slack.
        assert_eq!(pacer.next_interval(header(12, 1030)), Duration::from_millis(14_500));
        // A block in the same second as the previous one hits the floor.
        assert_eq!(pacer.next_interval(header(13, 1030)), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn initial_read_assigns_without_exit_hooks() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 1);
        let (mut sync, spy, board) = worker_sync(&ledger, config());
        let states = sync.subscribe();

        let transition = sync.process_state().await.unwrap();
        assert_eq!(transition, Transition::Entered { from: None, to: 1 });
        assert_eq!(*states.borrow(), Some(1));
        assert_eq!(spy.take(), vec!["transact alive"]);
        assert_eq!(board.snapshot().worker_state.as_deref(), Some("Offline"));
    }

    #[tokio::test]
    async fn initial_read_failure_is_reported() {
        let ledger = Arc::new(MockLedger::default());
        let (mut sync, _, _) = worker_sync(&ledger, config());
        assert!(matches!(sync.process_state().await, Err(SyncError::Read(_))));
    }

    #[tokio::test]
    async fn duplicate_events_fire_hooks_once() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let (mut sync, spy, _) = worker_sync(&ledger, config());
        sync.process_state().await.unwrap();
        sync.poll_once().await.unwrap();

        ledger.push_log(fixtures::state_changed(WORKER, 2, 3, 101, 0));
        ledger.push_log(fixtures::state_changed(WORKER, 2, 3, 101, 1));
        assert_eq!(sync.poll_once().await.unwrap(), 2);

        assert_eq!(sync.target.machine().current_state(), Some(3));
        assert_eq!(spy.take(), vec!["create_job then acceptAssignment"]);
    }

    #[tokio::test]
    async fn illegal_ledger_transitions_are_dropped() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 8);
        let (mut sync, spy, _) = worker_sync(&ledger, config());
        sync.process_state().await.unwrap();
        sync.poll_once().await.unwrap();

        ledger.push_log(fixtures::state_changed(WORKER, 8, 3, 101, 0));
        sync.poll_once().await.unwrap();
        assert_eq!(sync.target.machine().current_state(), Some(8));
        assert!(spy.take().is_empty());
    }

    #[tokio::test]
    async fn evicted_filter_is_recreated_and_replay_is_skipped() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let (mut sync, spy, _) = worker_sync(&ledger, config());
        sync.process_state().await.unwrap();
        sync.observe_block(header(100, 1_700_000_000));
        sync.poll_once().await.unwrap();
        assert_eq!(ledger.filters_created(), 1);

        ledger.push_log(fixtures::state_changed(WORKER, 2, 3, 101, 0));
        sync.poll_once().await.unwrap();
        assert_eq!(spy.take(), vec!["create_job then acceptAssignment"]);

        // The node forgets the filter; one more event arrives in the gap.
        ledger.evict_filters();
        ledger.push_log(fixtures::state_changed(WORKER, 3, 4, 102, 0));
        set_ledger_state(&ledger, 3);
        assert_eq!(sync.poll_once().await.unwrap(), 0);
        assert_eq!(ledger.filters_created(), 2);

        // The rewound filter replays block 101 (already applied) and 102.
        assert_eq!(sync.poll_once().await.unwrap(), 2);
        assert_eq!(sync.target.machine().current_state(), Some(4));
        assert_eq!(
            spy.take(),
            vec!["create_job then none", "transact processToDataValidation"]
        );
    }

    #[tokio::test]
    async fn recreation_reconciles_drifted_state() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let (mut sync, _, _) = worker_sync(&ledger, config());
        sync.process_state().await.unwrap();
        sync.poll_once().await.unwrap();

        ledger.evict_filters();
        set_ledger_state(&ledger, 9);
        sync.poll_once().await.unwrap();
        assert_eq!(sync.target.machine().current_state(), Some(9));
    }

    #[tokio::test]
    async fn idle_filters_are_recreated() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let idle = SyncConfig { idle_threshold_secs: 0, ..config() };
        let (mut sync, _, _) = worker_sync(&ledger, idle);
        sync.process_state().await.unwrap();
        sync.poll_once().await.unwrap();
        sync.poll_once().await.unwrap();
        sync.poll_once().await.unwrap();
        assert_eq!(ledger.filters_created(), 3);
    }

    #[tokio::test]
    async fn transient_errors_surface_without_losing_the_filter() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let (mut sync, _, _) = worker_sync(&ledger, config());
        sync.process_state().await.unwrap();
        sync.poll_once().await.unwrap();

        ledger.inject_error("eth_getFilterChanges", RpcError::Decode("boom".into()));
        assert!(sync.poll_once().await.is_err());
        ledger.push_log(fixtures::state_changed(WORKER, 2, 9, 101, 0));
        sync.poll_once().await.unwrap();
        assert_eq!(sync.target.machine().current_state(), Some(9));
        assert_eq!(ledger.filters_created(), 1);
    }

    #[tokio::test]
    async fn run_applies_events_until_cancelled() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let (mut sync, _, board) = worker_sync(&ledger, config());
        sync.process_state().await.unwrap();
        let mut states = sync.subscribe();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(sync.run(cancel_rx));

        // Wait for the filter before emitting, it only reports later logs.
        while ledger.filters_created() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        ledger.push_log(fixtures::state_changed(WORKER, 2, 1, 101, 0));
        states.wait_for(|s| *s == Some(1)).await.unwrap();
        assert!(board.snapshot().ledger_connected);

        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_block_source_falls_back_and_reports_the_link() {
        let ledger = Arc::new(MockLedger::default());
        set_ledger_state(&ledger, 2);
        let slow = SyncConfig { fallback_interval_ms: 750, ..config() };
        let (mut sync, _, board) = worker_sync(&ledger, slow);
        sync.process_state().await.unwrap();

        ledger.set_block(100, 1_700_000_000);
        sync.tick().await;
        assert!(board.snapshot().ledger_connected);

        ledger.set_block(102, 1_700_000_002);
        ledger.inject_error("eth_getBlockByNumber", RpcError::Decode("refused".into()));
        ledger.push_log(fixtures::state_changed(WORKER, 2, 9, 101, 0));
        assert_eq!(sync.tick().await, Duration::from_millis(750));
        assert!(!board.snapshot().ledger_connected);
        // Events are still polled while the block source is down.
        assert_eq!(sync.target.machine().current_state(), Some(9));

        // Two blocks in two seconds since the last header seen.
        assert_eq!(sync.tick().await, Duration::from_secs(1));
        assert!(board.snapshot().ledger_connected);
    }

    #[derive(Default)]
    struct NoTeardown;

    impl CognitiveJobDelegate for NoTeardown {
        fn terminate_job(&self, _job: JobId) {}
    }

    #[tokio::test]
    async fn controller_jobs_only_see_their_own_events() {
        let ledger = Arc::new(MockLedger::default());
        let controller = Address::repeat_byte(0xcc);
        let mine = JobId::from_word(B256::repeat_byte(1)).unwrap();
        let theirs = JobId::from_word(B256::repeat_byte(2)).unwrap();

        let job = CognitiveJob::new(
            JobContract::via_controller(Arc::clone(&ledger), controller, mine),
            Arc::new(NoTeardown),
            true,
        );
        let mut sync = EventSynchronizer::new(
            Arc::clone(&ledger),
            job,
            config(),
            Arc::new(StatusBoard::new()),
        );
        sync.apply(EventRecord {
            contract: controller,
            old_state: 0,
            new_state: 1,
            block_number: Some(100),
            log_index: Some(0),
        });
        sync.poll_once().await.unwrap();

        ledger.push_log(fixtures::job_state_changed(controller, theirs, 1, 2, 101));
        ledger.push_log(fixtures::job_state_changed(controller, mine, 1, 3, 102));
        sync.poll_once().await.unwrap();
        assert_eq!(sync.target.machine().current_state(), Some(3));
    }
}
