// Deterministic replay of the commit ledger.
//
// Starting from the genesis state, every marker's recorded ops are pushed
// through the transition engine, the gate rules and pipeline stages 1-5
// again with the same constants. The recomputed state hash, stage results
// and back-link must match what the marker recorded; the first mismatch is
// reported with its sequence number.

use crate::constants::Constants;
use crate::gate;
use crate::ledger::{HashChainLedger, LedgerError, LedgerRecord};
use crate::pipeline::{recorded_ops, CommitPipeline};
use crate::state::{state_hash, Hash, Mode, State, ZERO_HASH};
use crate::store::Draft;
use serde::Serialize;
use std::ops::RangeInclusive;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayIntegrityError {
    #[error("marker {sequence} records no operations")]
    MissingOps { sequence: u64 },
    #[error("marker {sequence}: recorded ops no longer apply: {detail}")]
    TransitionFailed { sequence: u64, detail: String },
    #[error("marker {sequence}: gate rejects the recorded draft: {detail}")]
    GateRejected { sequence: u64, detail: String },
    #[error("marker {sequence}: pipeline failed during replay: {detail}")]
    PipelineFailed { sequence: u64, detail: String },
    #[error("marker {sequence}: prev_hash does not link to the replayed predecessor")]
    ChainBroken { sequence: u64 },
    #[error("marker {sequence}: replayed state hash {actual} differs from recorded {expected}")]
    HashMismatch {
        sequence: u64,
        expected: String,
        actual: String,
    },
    #[error("marker {sequence}: replayed stage results differ from the recorded ones")]
    StageDivergence { sequence: u64 },
    #[error("marker {sequence}: stored state differs from the replayed state")]
    StateDivergence { sequence: u64 },
    #[error("marker {sequence}: sequence number out of order")]
    SequenceGap { sequence: u64 },
    #[error(transparent)]
    Range(LedgerError),
}

impl ReplayIntegrityError {
    /// First divergent marker, when the error names one.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            ReplayIntegrityError::MissingOps { sequence }
            | ReplayIntegrityError::TransitionFailed { sequence, .. }
            | ReplayIntegrityError::GateRejected { sequence, .. }
            | ReplayIntegrityError::PipelineFailed { sequence, .. }
            | ReplayIntegrityError::ChainBroken { sequence }
            | ReplayIntegrityError::HashMismatch { sequence, .. }
            | ReplayIntegrityError::StageDivergence { sequence }
            | ReplayIntegrityError::StateDivergence { sequence }
            | ReplayIntegrityError::SequenceGap { sequence } => Some(*sequence),
            ReplayIntegrityError::Range(_) => None,
        }
    }

    /// A bad range is a caller mistake; everything else is an integrity fault.
    pub fn is_integrity_fault(&self) -> bool {
        !matches!(self, ReplayIntegrityError::Range(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReplayReport {
    pub from: u64,
    pub to: u64,
    /// Markers re-executed, always counted from genesis.
    pub markers_replayed: u64,
    pub final_state: State,
    pub final_state_hash: String,
}

pub struct ReplayEngine<'a> {
    constants: &'a Constants,
    pipeline: &'a CommitPipeline,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(constants: &'a Constants, pipeline: &'a CommitPipeline) -> Self {
        Self {
            constants,
            pipeline,
        }
    }

    /// Replay the whole ledger and return the reconstructed live state.
    pub fn replay(&self, ledger: &HashChainLedger) -> Result<State, ReplayIntegrityError> {
        self.replay_records(ledger.records())
    }

    /// Replay the whole ledger into a report. An empty ledger reports the
    /// genesis state with nothing replayed.
    pub fn replay_all(&self, ledger: &HashChainLedger) -> Result<ReplayReport, ReplayIntegrityError> {
        if ledger.is_empty() {
            let genesis = State::genesis(self.constants);
            return Ok(ReplayReport {
                from: 0,
                to: 0,
                markers_replayed: 0,
                final_state: genesis,
                final_state_hash: hex::encode(state_hash(&genesis)),
            });
        }
        self.replay_range(ledger, 1..=ledger.len())
    }

    /// Replay from genesis through `range.end()`, after checking the hash
    /// chain over `range`.
    pub fn replay_range(
        &self,
        ledger: &HashChainLedger,
        range: RangeInclusive<u64>,
    ) -> Result<ReplayReport, ReplayIntegrityError> {
        let (from, to) = (*range.start(), *range.end());
        ledger.verify_detailed(range).map_err(|e| match e {
            LedgerError::RangeOutOfBounds { .. } => ReplayIntegrityError::Range(e),
            LedgerError::HashMismatch { sequence } => ReplayIntegrityError::HashMismatch {
                sequence,
                expected: ledger
                    .get(sequence)
                    .map(|r| hex::encode(r.marker.state_hash))
                    .unwrap_or_default(),
                actual: ledger
                    .get(sequence)
                    .map(|r| hex::encode(state_hash(&r.state)))
                    .unwrap_or_default(),
            },
            LedgerError::ChainBroken { sequence } => ReplayIntegrityError::ChainBroken { sequence },
            LedgerError::SequenceGap { expected, .. } => {
                ReplayIntegrityError::SequenceGap { sequence: expected }
            }
        })?;

        let prefix = &ledger.records()[..to as usize];
        let final_state = self.replay_records(prefix)?;
        Ok(ReplayReport {
            from,
            to,
            markers_replayed: to,
            final_state,
            final_state_hash: hex::encode(state_hash(&final_state)),
        })
    }

    fn replay_records(&self, records: &[LedgerRecord]) -> Result<State, ReplayIntegrityError> {
        let mut state = State::genesis(self.constants);
        let mut prev_hash: Hash = ZERO_HASH;
        for (i, record) in records.iter().enumerate() {
            let expected_seq = i as u64 + 1;
            if record.marker.sequence != expected_seq {
                return Err(ReplayIntegrityError::SequenceGap {
                    sequence: expected_seq,
                });
            }
            state = self.step(state, prev_hash, record)?;
            prev_hash = record.marker.state_hash;
        }
        Ok(state)
    }

    fn step(
        &self,
        prev: State,
        prev_hash: Hash,
        record: &LedgerRecord,
    ) -> Result<State, ReplayIntegrityError> {
        let marker = &record.marker;
        let sequence = marker.sequence;

        if marker.prev_hash != prev_hash {
            return Err(ReplayIntegrityError::ChainBroken { sequence });
        }

        let ops = recorded_ops(&marker.stage_results)
            .filter(|ops| !ops.is_empty())
            .ok_or(ReplayIntegrityError::MissingOps { sequence })?;

        let mut draft = Draft::new(sequence, "replay", prev, Mode::Replay);
        for ev in ops {
            draft
                .push(*ev, self.constants)
                .map_err(|e| ReplayIntegrityError::TransitionFailed {
                    sequence,
                    detail: e.to_string(),
                })?;
        }
        gate::check_contents(&draft, self.constants).map_err(|e| {
            ReplayIntegrityError::GateRejected {
                sequence,
                detail: e.reason.to_string(),
            }
        })?;

        let prepared = self
            .pipeline
            .prepare(&draft, self.constants)
            .map_err(|e| ReplayIntegrityError::PipelineFailed {
                sequence,
                detail: e.to_string(),
            })?;

        let actual = state_hash(&prepared.state);
        if actual != marker.state_hash {
            return Err(ReplayIntegrityError::HashMismatch {
                sequence,
                expected: hex::encode(marker.state_hash),
                actual: hex::encode(actual),
            });
        }
        if prepared.stage_results != marker.stage_results {
            return Err(ReplayIntegrityError::StageDivergence { sequence });
        }
        if !prepared.state.same_bits(&record.state) {
            return Err(ReplayIntegrityError::StateDivergence { sequence });
        }
        Ok(prepared.state)
    }
}
