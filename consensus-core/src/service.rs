//! The consensus service loop.
//!
//! A dedicated thread owns the engine lifecycle: it performs WAL recovery,
//! executes the engine's asynchronous block-manager requests, polls step
//! timers, forwards broadcasts, and reports commits and skip patches. The
//! engine itself sits behind a shared mutex so the syncer can feed inbound
//! messages and query round state; the resulting outputs are funneled back
//! to this thread over a channel.

use {
    crate::{
        block::BlockManager,
        commit_vote::CommitVoteList,
        config::ConsensusConfig,
        engine::{read_wal, ConsensusEngine, ConsensusError},
        timeout::TimeoutScheduler,
        types::{CommittedBlock, ConsensusMessage, EngineOutput, EngineRequest, SkipPatch},
        validator_set::ValidatorSet,
        wal::ConsensusWal,
    },
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::{debug, error, info, warn},
    solana_hash::Hash,
    solana_signer::Signer,
    std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

/// Poll interval when no timer is close to firing.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Notifications emitted by the service for the node to act on.
#[derive(Debug)]
pub enum ConsensusEvent {
    /// A block was finalized.
    Committed(CommittedBlock),
    /// Skip-transaction evidence is ready for submission.
    SkipPatch(SkipPatch),
    /// The (height, round, step) coordinate changed; the syncer should
    /// re-beacon and re-evaluate peers.
    StepChanged,
}

/// Long-running consensus driver thread.
pub struct ConsensusService {
    thread: JoinHandle<()>,
}

impl ConsensusService {
    /// Recover from the WAL (when a directory is given), start the engine,
    /// and spawn the service thread.
    ///
    /// Returns the service handle plus the shared engine for the syncer.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: ConsensusConfig,
        wallet: Arc<dyn Signer + Send + Sync>,
        validators: ValidatorSet,
        wal_dir: Option<&Path>,
        start_height: u64,
        prev_block_id: Hash,
        prev_commit: CommitVoteList,
        block_manager: Box<dyn BlockManager>,
        outputs_rx: Receiver<EngineOutput>,
        broadcast_tx: Sender<ConsensusMessage>,
        events_tx: Sender<ConsensusEvent>,
        exit: Arc<AtomicBool>,
    ) -> Result<(Self, Arc<Mutex<ConsensusEngine>>), ConsensusError> {
        // Read (and repair) the WAL before the writers reopen the files.
        let recovered = match wal_dir {
            Some(dir) => Some(read_wal(dir)?),
            None => None,
        };
        let wal = match wal_dir {
            Some(dir) => Some(ConsensusWal::open(dir, &config.wal)?),
            None => None,
        };

        let scheduler = TimeoutScheduler::new(config.clone());
        let mut engine = ConsensusEngine::new(config, wallet, validators, wal);

        let initial = match recovered {
            Some(recovered) => {
                // A commit record past the caller's view moves the start
                // height forward; the block store already holds the block.
                let (height, block_id, commit) = match &recovered.commit {
                    Some(record) if record.height >= start_height => (
                        record.height + 1,
                        record.block_id,
                        record.votes.clone(),
                    ),
                    _ => (start_height, prev_block_id, prev_commit),
                };
                info!("recovering consensus at height {height}");
                engine.start_recovered(height, block_id, commit, recovered)?
            }
            None => engine.start(start_height, prev_block_id, prev_commit)?,
        };

        let engine = Arc::new(Mutex::new(engine));
        let thread_engine = Arc::clone(&engine);
        let thread = Builder::new()
            .name("tesseraConsensus".to_string())
            .spawn(move || {
                let mut worker = ServiceWorker {
                    engine: thread_engine,
                    block_manager,
                    scheduler,
                    outputs_rx,
                    broadcast_tx,
                    events_tx,
                    exit,
                };
                worker.run(initial);
            })
            .map_err(|e| ConsensusError::Wal(crate::wal::WalError::Io(e)))?;

        Ok((Self { thread }, engine))
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

struct ServiceWorker {
    engine: Arc<Mutex<ConsensusEngine>>,
    block_manager: Box<dyn BlockManager>,
    scheduler: TimeoutScheduler,
    outputs_rx: Receiver<EngineOutput>,
    broadcast_tx: Sender<ConsensusMessage>,
    events_tx: Sender<ConsensusEvent>,
    exit: Arc<AtomicBool>,
}

impl ServiceWorker {
    fn run(&mut self, initial: EngineOutput) {
        if let Err(e) = self.process_output(initial) {
            error!("consensus halted during startup: {e}");
            return;
        }

        loop {
            if self.exit.load(Ordering::Relaxed) {
                info!("consensus service: exit requested");
                break;
            }

            let wait = self
                .scheduler
                .remaining()
                .map(|d| d.min(TIMEOUT_POLL_INTERVAL))
                .unwrap_or(TIMEOUT_POLL_INTERVAL);

            let result = match self.outputs_rx.recv_timeout(wait) {
                Ok(output) => self.process_output(output),
                Err(RecvTimeoutError::Timeout) => self.check_timers(),
                Err(RecvTimeoutError::Disconnected) => {
                    info!("consensus service: input channel closed");
                    break;
                }
            };
            if let Err(e) = result {
                if e.is_fatal() {
                    // Safety cannot be guaranteed without the WAL; halt and
                    // let the restart replay it.
                    error!("consensus halted: {e}");
                    break;
                }
                debug!("consensus service dropped input: {e}");
            }
        }
    }

    fn check_timers(&mut self) -> Result<(), ConsensusError> {
        let Some((step, round)) = self.scheduler.check_expired() else {
            return Ok(());
        };
        self.scheduler.cancel();
        let output = self.lock_engine().on_timeout(step, round)?;
        self.process_output(output)
    }

    fn process_output(&mut self, output: EngineOutput) -> Result<(), ConsensusError> {
        let mut pending = vec![output];
        while let Some(output) = pending.pop() {
            for msg in output.messages {
                if self.broadcast_tx.send(msg).is_err() {
                    warn!("broadcast channel closed");
                }
            }
            if let Some(committed) = output.committed {
                let _ = self.events_tx.send(ConsensusEvent::Committed(committed));
            }
            if let Some(patch) = output.skip_patch {
                let _ = self.events_tx.send(ConsensusEvent::SkipPatch(patch));
            }
            if output.step_changed {
                let (step, round) = {
                    let engine = self.lock_engine();
                    (engine.step(), engine.round())
                };
                self.scheduler.start(step, round);
                let _ = self.events_tx.send(ConsensusEvent::StepChanged);
            }
            for request in output.requests {
                pending.push(self.run_request(request)?);
            }
        }
        Ok(())
    }

    // Block-manager work runs without holding the engine lock; the
    // completion entry points drop stale results themselves.
    fn run_request(&mut self, request: EngineRequest) -> Result<EngineOutput, ConsensusError> {
        match request {
            EngineRequest::Propose { height, round } => {
                let prev_votes = self.lock_engine().prev_commit().clone();
                let result = self.block_manager.propose(height, &prev_votes);
                self.lock_engine().on_block_proposed(height, round, result)
            }
            EngineRequest::Import {
                height,
                round,
                block,
            } => {
                let result = self.block_manager.import(height, &block);
                self.lock_engine().on_block_imported(height, round, result)
            }
            EngineRequest::Finalize {
                height,
                block,
                votes,
            } => {
                let result = self
                    .block_manager
                    .import(height, &block)
                    .and_then(|candidate| self.block_manager.finalize(&candidate, &votes));
                self.lock_engine().on_block_finalized(height, result)
            }
            EngineRequest::WaitTransactions { height } => {
                // The block manager is polled on the service thread; a
                // mempool signal would shortcut this in a full node.
                debug!("waiting for transactions at height {height}");
                while !self.block_manager.has_pending_transactions() {
                    if self.exit.load(Ordering::Relaxed) {
                        return Ok(EngineOutput::default());
                    }
                    thread::sleep(TIMEOUT_POLL_INTERVAL);
                }
                self.lock_engine().on_transactions_available()
            }
        }
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, ConsensusEngine> {
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{block::testing::MemoryBlockManager, wal::WalConfig},
        crossbeam_channel::unbounded,
        solana_keypair::Keypair,
        tempfile::TempDir,
    };

    fn quick_config() -> ConsensusConfig {
        ConsensusConfig {
            timeout_propose_ms: 50,
            timeout_propose_delta_ms: 10,
            timeout_prevote_ms: 50,
            timeout_precommit_ms: 50,
            timeout_commit_ms: 20,
            wal: WalConfig {
                housekeeping_interval: Duration::from_millis(100),
                sync_interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn collect_commits(
        events_rx: &Receiver<ConsensusEvent>,
        want: usize,
        budget: Duration,
    ) -> Vec<CommittedBlock> {
        let deadline = std::time::Instant::now() + budget;
        let mut commits = Vec::new();
        while commits.len() < want && std::time::Instant::now() < deadline {
            match events_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ConsensusEvent::Committed(c)) => commits.push(c),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        commits
    }

    // A single-validator chain finalizes heights on its own: propose,
    // self-polka, commit, next height.
    #[test]
    fn test_single_validator_chain_advances() {
        let kp = Arc::new(Keypair::new());
        let validators = ValidatorSet::new(vec![kp.pubkey()]);
        let (_outputs_tx, outputs_rx) = unbounded();
        let (broadcast_tx, _broadcast_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let exit = Arc::new(AtomicBool::new(false));

        let (service, engine) = ConsensusService::start(
            quick_config(),
            kp,
            validators.clone(),
            None,
            1,
            Hash::default(),
            CommitVoteList::empty(),
            Box::new(MemoryBlockManager::new(validators)),
            outputs_rx,
            broadcast_tx,
            events_tx,
            exit.clone(),
        )
        .unwrap();

        let commits = collect_commits(&events_rx, 3, Duration::from_secs(10));
        exit.store(true, Ordering::Relaxed);
        service.join().unwrap();

        assert!(commits.len() >= 3, "got {} commits", commits.len());
        for (i, c) in commits.iter().take(3).enumerate() {
            let height = i as u64 + 1;
            assert_eq!(c.height, height);
            assert_eq!(c.block_id, MemoryBlockManager::block_id(height));
        }
        let engine = engine.lock().unwrap();
        assert!(engine.height() >= 3);
    }

    // Stopping and restarting with the same WAL directory resumes past the
    // recorded commits instead of re-running height 1.
    #[test]
    fn test_restart_resumes_from_wal() {
        let kp = Arc::new(Keypair::new());
        let validators = ValidatorSet::new(vec![kp.pubkey()]);
        let dir = TempDir::new().unwrap();

        let first_run_top = {
            let (_outputs_tx, outputs_rx) = unbounded();
            let (broadcast_tx, _broadcast_rx) = unbounded();
            let (events_tx, events_rx) = unbounded();
            let exit = Arc::new(AtomicBool::new(false));
            let (service, _engine) = ConsensusService::start(
                quick_config(),
                kp.clone(),
                validators.clone(),
                Some(dir.path()),
                1,
                Hash::default(),
                CommitVoteList::empty(),
                Box::new(MemoryBlockManager::new(validators.clone())),
                outputs_rx,
                broadcast_tx,
                events_tx,
                exit.clone(),
            )
            .unwrap();
            let commits = collect_commits(&events_rx, 2, Duration::from_secs(10));
            exit.store(true, Ordering::Relaxed);
            service.join().unwrap();
            assert!(commits.len() >= 2);
            commits.last().unwrap().height
        };

        let (_outputs_tx, outputs_rx) = unbounded();
        let (broadcast_tx, _broadcast_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let exit = Arc::new(AtomicBool::new(false));
        let (service, engine) = ConsensusService::start(
            quick_config(),
            kp,
            validators.clone(),
            Some(dir.path()),
            1, // the caller's stale view; the WAL moves us forward
            Hash::default(),
            CommitVoteList::empty(),
            Box::new(MemoryBlockManager::new(validators)),
            outputs_rx,
            broadcast_tx,
            events_tx,
            exit.clone(),
        )
        .unwrap();

        let commits = collect_commits(&events_rx, 1, Duration::from_secs(10));
        exit.store(true, Ordering::Relaxed);
        service.join().unwrap();

        assert!(!commits.is_empty());
        assert!(
            commits[0].height > first_run_top,
            "resumed at {} after stopping at {first_run_top}",
            commits[0].height
        );
        let engine = engine.lock().unwrap();
        assert!(engine.height() > first_run_top);
    }
}
