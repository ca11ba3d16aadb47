// Kernel facade: one live state, many drafts, one commit at a time.
//
// Commits are serialised by `commit_lock`. Draft work and live reads never
// take it. A ledger integrity failure latches `halted`; from then on every
// commit is refused until the process is restarted against a verified
// ledger.

use crate::config::{DraftLimits, NodeConfig};
use crate::constants::Constants;
use crate::error::KernelError;
use crate::gate;
use crate::ledger::{CommitMarker, HashChainLedger, LedgerRecord};
use crate::pipeline::{CommitOutcome, CommitPipeline};
use crate::replay::{ReplayEngine, ReplayIntegrityError, ReplayReport};
use crate::state::State;
use crate::storage::LedgerStore;
use crate::store::{self, Draft, DraftHandle, StateStore, StoreError};
use crate::transition::Event;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Poll interval while waiting on the commit lock with a deadline.
const LOCK_POLL: Duration = Duration::from_millis(2);

/// Source of marker timestamps. Transition math never reads it.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

pub struct Kernel {
    constants: Constants,
    store: StateStore,
    pipeline: CommitPipeline,
    ledger: RwLock<HashChainLedger>,
    commit_lock: Mutex<()>,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
    clock: Arc<dyn Clock>,
    storage: Option<LedgerStore>,
}

impl Kernel {
    /// In-memory kernel at genesis.
    pub fn new(constants: Constants, limits: DraftLimits) -> Self {
        Self {
            constants,
            store: StateStore::new(constants, limits),
            pipeline: CommitPipeline::standard(),
            ledger: RwLock::new(HashChainLedger::new()),
            commit_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            clock: Arc::new(SystemClock),
            storage: None,
        }
    }

    /// Kernel backed by a snapshot in `data_dir`, restored by replay.
    pub fn open<P: AsRef<Path>>(
        constants: Constants,
        limits: DraftLimits,
        data_dir: P,
    ) -> Result<Self, KernelError> {
        let storage = LedgerStore::new(data_dir)?;
        let persisted = storage.load(&constants)?;
        let mut kernel = Self::new(constants, limits);
        if let Some(snap) = persisted {
            kernel.restore(snap.records)?;
        }
        kernel.storage = Some(storage);
        Ok(kernel)
    }

    pub fn from_config(cfg: &NodeConfig) -> Result<Self, KernelError> {
        cfg.validate()?;
        match &cfg.storage.data_dir {
            Some(dir) => Self::open(cfg.constants, cfg.draft_limits.clone(), dir),
            None => Ok(Self::new(cfg.constants, cfg.draft_limits.clone())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pipeline(mut self, pipeline: CommitPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Verify, replay and install a persisted ledger. This is the only path
    /// through which replay writes live state.
    pub fn restore(&mut self, records: Vec<LedgerRecord>) -> Result<(), KernelError> {
        let ledger = HashChainLedger::from_records(records).map_err(|e| {
            error!(error = %e, "persisted ledger failed verification");
            e
        })?;
        let state = ReplayEngine::new(&self.constants, &self.pipeline)
            .replay(&ledger)
            .map_err(|e| {
                error!(error = %e, sequence = ?e.sequence(), "persisted ledger failed replay");
                e
            })?;
        info!(
            markers = ledger.len(),
            tick = state.tick,
            cycle = state.cycle,
            "ledger restored by replay"
        );
        self.store.install(state);
        *self.ledger.get_mut().unwrap_or_else(PoisonError::into_inner) = ledger;
        Ok(())
    }

    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    pub fn state(&self) -> Arc<State> {
        self.store.live()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn begin_draft(&self, session: &str) -> Result<DraftHandle, KernelError> {
        Ok(self.store.begin_draft(session)?)
    }

    pub fn mutate(&self, handle: &DraftHandle, event: Event) -> Result<Draft, KernelError> {
        Ok(self.store.mutate(handle, event)?)
    }

    /// Mutate the session's draft, opening one first if needed.
    pub fn update(&self, session: &str, event: Event) -> Result<Draft, KernelError> {
        let handle = match self.store.handle_for(session) {
            Some(h) => h,
            None => self.store.begin_draft(session)?,
        };
        self.mutate(&handle, event)
    }

    pub fn discard(&self, handle: &DraftHandle) -> Result<(), KernelError> {
        Ok(self.store.discard(handle)?)
    }

    pub fn draft(&self, handle: &DraftHandle) -> Result<Draft, KernelError> {
        Ok(self.store.draft(handle)?)
    }

    pub fn handle_for(&self, session: &str) -> Option<DraftHandle> {
        self.store.handle_for(session)
    }

    /// Commit, waiting as long as needed for the commit lock.
    pub fn commit(&self, handle: &DraftHandle) -> Result<CommitOutcome, KernelError> {
        let guard = store::lock(&self.commit_lock);
        self.commit_locked(guard, handle)
    }

    /// Commit only if no other commit is in flight.
    pub fn try_commit(&self, handle: &DraftHandle) -> Result<CommitOutcome, KernelError> {
        let guard = match self.commit_lock.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(KernelError::ConcurrentCommitConflict),
        };
        self.commit_locked(guard, handle)
    }

    /// Commit, giving up with `CommitTimeout` if the lock is not acquired in time.
    pub fn commit_with_timeout(
        &self,
        handle: &DraftHandle,
        timeout: Duration,
    ) -> Result<CommitOutcome, KernelError> {
        let start = Instant::now();
        loop {
            match self.try_commit(handle) {
                Err(KernelError::ConcurrentCommitConflict) => {
                    if start.elapsed() >= timeout {
                        return Err(KernelError::CommitTimeout {
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    thread::sleep(LOCK_POLL);
                }
                other => return other,
            }
        }
    }

    fn commit_locked(
        &self,
        _guard: MutexGuard<'_, ()>,
        handle: &DraftHandle,
    ) -> Result<CommitOutcome, KernelError> {
        self.ensure_running()?;

        let slot = self.store.slot(handle)?;
        let mut draft = store::lock(&slot);
        if draft.id != handle.draft_id() {
            return Err(StoreError::UnknownDraft {
                session: handle.session().to_string(),
            }
            .into());
        }

        // Commit-level rule, not a gate result: every marker must record ops
        // so replay can re-derive it.
        if draft.is_empty() {
            return Err(KernelError::EmptyCommit {
                session: handle.session().to_string(),
            });
        }

        let live = self.store.live();
        if !draft.base_state.same_bits(&live) {
            let rebased = draft
                .rebase(*live, &self.constants, self.store.limits())
                .map_err(|e| {
                    info!(session = handle.session(), error = %e, "draft no longer applies to live state");
                    e
                })?;
            debug!(
                session = handle.session(),
                from_tick = draft.base_state.tick,
                to_tick = live.tick,
                "draft rebased onto newer live state"
            );
            *draft = rebased;
        }

        if let Err(rejected) = gate::check(&draft, &self.constants) {
            info!(session = handle.session(), reason = %rejected.reason, "commit rejected by gate");
            return Err(rejected.into());
        }

        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        let outcome = match self.pipeline.execute(
            &draft,
            &self.constants,
            &self.store,
            &mut ledger,
            self.clock.now_ms(),
        ) {
            Ok(o) => o,
            Err(e) => {
                if e.stage == crate::pipeline::StageId::Finalization {
                    self.halt(format!("live state and ledger tip disagree: {e}"));
                } else {
                    warn!(session = handle.session(), stage = %e.stage, reason = %e.reason, "commit aborted");
                }
                return Err(e.into());
            }
        };

        draft.mode = crate::state::Mode::Live;
        self.store.close(handle, &slot);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(&self.constants, ledger.records()) {
                error!(error = %e, sequence = outcome.marker.sequence, "ledger snapshot save failed");
            }
        }

        info!(
            session = handle.session(),
            sequence = outcome.marker.sequence,
            tick = outcome.state.tick,
            cycle = outcome.state.cycle,
            stability = %outcome.state.stability,
            ops = draft.pending_ops.len(),
            "commit finalized"
        );
        Ok(outcome)
    }

    pub fn tip(&self) -> Option<CommitMarker> {
        self.ledger_read().tip().cloned()
    }

    pub fn marker(&self, sequence: u64) -> Option<CommitMarker> {
        self.ledger_read().get(sequence).map(|r| r.marker.clone())
    }

    pub fn ledger_len(&self) -> u64 {
        self.ledger_read().len()
    }

    /// Recheck hashes and links over `range`. A tamper finding halts the kernel.
    pub fn verify(&self, range: RangeInclusive<u64>) -> bool {
        match self.ledger_read().verify_detailed(range) {
            Ok(()) => true,
            Err(e) => {
                if e.is_integrity_fault() {
                    self.halt(e.to_string());
                }
                false
            }
        }
    }

    pub fn replay(&self, range: RangeInclusive<u64>) -> Result<ReplayReport, KernelError> {
        let ledger = self.ledger_read();
        let engine = ReplayEngine::new(&self.constants, &self.pipeline);
        self.checked_replay(engine.replay_range(&ledger, range))
    }

    /// Replay everything committed so far; an empty ledger verifies trivially.
    pub fn replay_all(&self) -> Result<ReplayReport, KernelError> {
        let ledger = self.ledger_read();
        let engine = ReplayEngine::new(&self.constants, &self.pipeline);
        self.checked_replay(engine.replay_all(&ledger))
    }

    fn checked_replay(
        &self,
        result: Result<ReplayReport, ReplayIntegrityError>,
    ) -> Result<ReplayReport, KernelError> {
        match result {
            Ok(report) => {
                debug!(from = report.from, to = report.to, "replay verified");
                Ok(report)
            }
            Err(e) => {
                if e.is_integrity_fault() {
                    self.halt(e.to_string());
                }
                Err(e.into())
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        store::lock(&self.halt_reason).clone()
    }

    fn halt(&self, reason: String) {
        error!(reason = %reason, "ledger integrity fault; refusing further commits");
        let mut slot = store::lock(&self.halt_reason);
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> Result<(), KernelError> {
        if self.is_halted() {
            return Err(KernelError::Halted {
                reason: self.halt_reason().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn ledger_read(&self) -> std::sync::RwLockReadGuard<'_, HashChainLedger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn ledger_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashChainLedger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }
}
