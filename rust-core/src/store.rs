// Live state plus per-session drafts.
//
// The live value is an `Arc<State>` behind a lock that is only held long
// enough to clone or swap the pointer, so readers always see a state that
// was fully committed. Each draft sits in its own slot; mutating one
// session's draft never waits on another session.

use crate::config::DraftLimits;
use crate::constants::Constants;
use crate::state::{Mode, Stability, State};
use crate::transition::{self, Event, TransitionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("session {session} already has an open draft")]
    AlreadyDrafting { session: String },
    #[error("no open draft for session {session}")]
    UnknownDraft { session: String },
    #[error("session id must not be empty")]
    InvalidSession,
    #[error("open draft limit reached ({limit})")]
    TooManyDrafts { limit: usize },
    #[error("draft operation limit reached ({limit})")]
    DraftLimitExceeded { limit: usize },
    #[error("cycle requires {required} stable ticks, draft has {streak}")]
    HoldNotSatisfied { required: u64, streak: u64 },
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Proof of ownership over one open draft.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DraftHandle {
    session: String,
    draft_id: u64,
}

impl DraftHandle {
    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn draft_id(&self) -> u64 {
        self.draft_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: u64,
    pub session: String,
    pub base_state: State,
    pub working: State,
    pub mode: Mode,
    pub pending_ops: Vec<Event>,
    /// Consecutive trailing ops that left the working copy Stable.
    pub stable_streak: u64,
}

impl Draft {
    pub fn new(id: u64, session: impl Into<String>, base_state: State, mode: Mode) -> Self {
        Draft {
            id,
            session: session.into(),
            base_state,
            working: base_state,
            mode,
            pending_ops: Vec::new(),
            stable_streak: 0,
        }
    }

    /// Apply one event to the working copy. The draft is unchanged on error.
    pub fn push(&mut self, event: Event, constants: &Constants) -> Result<(), TransitionError> {
        let next = transition::apply(self.working, event, constants)?;
        self.working = next;
        self.pending_ops.push(event);
        self.stable_streak = if next.stability == Stability::Stable {
            self.stable_streak + 1
        } else {
            0
        };
        Ok(())
    }

    /// `push` under the session limits: op cap and the `Cycle` hold window.
    pub fn push_checked(
        &mut self,
        event: Event,
        constants: &Constants,
        limits: &DraftLimits,
    ) -> Result<(), StoreError> {
        if self.pending_ops.len() >= limits.max_pending_ops {
            return Err(StoreError::DraftLimitExceeded {
                limit: limits.max_pending_ops,
            });
        }
        if event == Event::Cycle && limits.hold_ticks > 0 && self.stable_streak < limits.hold_ticks
        {
            return Err(StoreError::HoldNotSatisfied {
                required: limits.hold_ticks,
                streak: self.stable_streak,
            });
        }
        self.push(event, constants)?;
        Ok(())
    }

    /// Re-apply the pending ops on top of a newer base. The limits are
    /// checked again because the hold window depends on the base.
    pub fn rebase(
        &self,
        base: State,
        constants: &Constants,
        limits: &DraftLimits,
    ) -> Result<Draft, StoreError> {
        let mut out = Draft::new(self.id, self.session.clone(), base, self.mode);
        for ev in &self.pending_ops {
            out.push_checked(*ev, constants, limits)?;
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.pending_ops.is_empty()
    }
}

pub(crate) type DraftSlot = Arc<Mutex<Draft>>;

pub struct StateStore {
    constants: Constants,
    limits: DraftLimits,
    live: RwLock<Arc<State>>,
    drafts: Mutex<HashMap<String, DraftSlot>>,
    next_id: AtomicU64,
}

impl StateStore {
    pub fn new(constants: Constants, limits: DraftLimits) -> Self {
        let genesis = State::genesis(&constants);
        Self::with_live(constants, limits, genesis)
    }

    pub fn with_live(constants: Constants, limits: DraftLimits, live: State) -> Self {
        Self {
            constants,
            limits,
            live: RwLock::new(Arc::new(live)),
            drafts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    pub fn limits(&self) -> &DraftLimits {
        &self.limits
    }

    pub fn live(&self) -> Arc<State> {
        Arc::clone(&self.live.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn begin_draft(&self, session: &str) -> Result<DraftHandle, StoreError> {
        if session.is_empty() {
            return Err(StoreError::InvalidSession);
        }
        let mut drafts = self.drafts_map();
        if drafts.contains_key(session) {
            return Err(StoreError::AlreadyDrafting {
                session: session.to_string(),
            });
        }
        if drafts.len() >= self.limits.max_open_drafts {
            return Err(StoreError::TooManyDrafts {
                limit: self.limits.max_open_drafts,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let base = *self.live();
        let draft = Draft::new(id, session, base, Mode::Sim);
        drafts.insert(session.to_string(), Arc::new(Mutex::new(draft)));
        debug!(session, draft_id = id, tick = base.tick, "draft opened");
        Ok(DraftHandle {
            session: session.to_string(),
            draft_id: id,
        })
    }

    pub fn mutate(&self, handle: &DraftHandle, event: Event) -> Result<Draft, StoreError> {
        let slot = self.slot(handle)?;
        let mut draft = lock(&slot);
        if draft.id != handle.draft_id {
            return Err(self.unknown(handle));
        }
        draft.push_checked(event, &self.constants, &self.limits)?;
        Ok(draft.clone())
    }

    pub fn discard(&self, handle: &DraftHandle) -> Result<(), StoreError> {
        // Slot lock is taken without holding the map lock; commit locks in
        // the opposite order.
        let slot = self.slot(handle)?;
        if lock(&slot).id != handle.draft_id {
            return Err(self.unknown(handle));
        }
        let mut drafts = self.drafts_map();
        match drafts.get(&handle.session) {
            Some(current) if Arc::ptr_eq(current, &slot) => {
                drafts.remove(&handle.session);
            }
            _ => return Err(self.unknown(handle)),
        }
        debug!(session = %handle.session, draft_id = handle.draft_id, "draft discarded");
        Ok(())
    }

    pub fn draft(&self, handle: &DraftHandle) -> Result<Draft, StoreError> {
        let slot = self.slot(handle)?;
        let draft = lock(&slot);
        if draft.id != handle.draft_id {
            return Err(self.unknown(handle));
        }
        Ok(draft.clone())
    }

    /// Handle of the session's open draft, if any.
    pub fn handle_for(&self, session: &str) -> Option<DraftHandle> {
        let slot = self.drafts_map().get(session).cloned()?;
        let id = lock(&slot).id;
        Some(DraftHandle {
            session: session.to_string(),
            draft_id: id,
        })
    }

    pub fn open_drafts(&self) -> usize {
        self.drafts_map().len()
    }

    /// Swap the live pointer. Only the commit pipeline and restore call this.
    pub(crate) fn install(&self, state: State) {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        *live = Arc::new(state);
    }

    pub(crate) fn slot(&self, handle: &DraftHandle) -> Result<DraftSlot, StoreError> {
        self.drafts_map()
            .get(&handle.session)
            .cloned()
            .ok_or_else(|| self.unknown(handle))
    }

    /// Drop a committed draft. No-op if the session already moved on.
    pub(crate) fn close(&self, handle: &DraftHandle, slot: &DraftSlot) {
        let mut drafts = self.drafts_map();
        if let Some(current) = drafts.get(&handle.session) {
            if Arc::ptr_eq(current, slot) {
                drafts.remove(&handle.session);
            }
        }
    }

    fn drafts_map(&self) -> MutexGuard<'_, HashMap<String, DraftSlot>> {
        lock(&self.drafts)
    }

    fn unknown(&self, handle: &DraftHandle) -> StoreError {
        StoreError::UnknownDraft {
            session: handle.session.clone(),
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
