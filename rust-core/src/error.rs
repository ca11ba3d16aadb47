use crate::config::ConfigError;
use crate::gate::GateRejected;
use crate::ledger::LedgerError;
use crate::pipeline::PipelineStageError;
use crate::replay::ReplayIntegrityError;
use crate::storage::StorageError;
use crate::store::StoreError;
use crate::transition::TransitionError;
use thiserror::Error;

/// Everything the kernel facade can return.
///
/// Transition, store, gate, pipeline and lock errors are recoverable: the
/// caller's draft is still open and live state is unchanged. Ledger and
/// replay integrity failures are fatal and latch the kernel into a halted
/// state until an operator intervenes.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gate(#[from] GateRejected),
    #[error(transparent)]
    Pipeline(#[from] PipelineStageError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Replay(#[from] ReplayIntegrityError),
    #[error("draft for session {session} has no operations to commit")]
    EmptyCommit { session: String },
    #[error("another commit is in flight")]
    ConcurrentCommitConflict,
    #[error("gave up waiting for the commit lock after {waited_ms} ms")]
    CommitTimeout { waited_ms: u64 },
    #[error("kernel halted: {reason}")]
    Halted { reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KernelError {
    pub fn is_fatal(&self) -> bool {
        match self {
            KernelError::Ledger(e) => e.is_integrity_fault(),
            KernelError::Replay(e) => e.is_integrity_fault(),
            KernelError::Halted { .. } => true,
            _ => false,
        }
    }

    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Transition(_) | KernelError::Store(StoreError::Transition(_)) => {
                "transition_error"
            }
            KernelError::Store(StoreError::AlreadyDrafting { .. }) => "already_drafting",
            KernelError::Store(StoreError::UnknownDraft { .. }) => "unknown_draft",
            KernelError::Store(StoreError::InvalidSession) => "invalid_session",
            KernelError::Store(StoreError::TooManyDrafts { .. })
            | KernelError::Store(StoreError::DraftLimitExceeded { .. }) => "draft_limit",
            KernelError::Store(StoreError::HoldNotSatisfied { .. }) => "hold_not_satisfied",
            KernelError::Gate(_) => "gate_rejected",
            KernelError::EmptyCommit { .. } => "empty_commit",
            KernelError::Pipeline(_) => "pipeline_stage_error",
            KernelError::Ledger(LedgerError::RangeOutOfBounds { .. })
            | KernelError::Replay(ReplayIntegrityError::Range(_)) => "bad_range",
            KernelError::Ledger(_) => "hash_mismatch",
            KernelError::Replay(_) => "replay_integrity_error",
            KernelError::ConcurrentCommitConflict => "concurrent_commit_conflict",
            KernelError::CommitTimeout { .. } => "commit_timeout",
            KernelError::Halted { .. } => "halted",
            KernelError::Storage(_) => "storage_error",
            KernelError::Config(_) => "config_error",
        }
    }
}
