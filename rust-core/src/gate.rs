// Commit gate: pure predicate over (draft, constants).
// Re-derives the working copy from the base instead of trusting it.

use crate::constants::Constants;
use crate::state::{Mode, State};
use crate::store::Draft;
use crate::transition::{self, Event};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateReason {
    /// Only `Sim` drafts may be promoted.
    NotSimMode { mode: Mode },
    LoadExceeded { sigma: f64, sigma_max: f64 },
    MalformedOp {
        index: usize,
        event: Event,
        detail: String,
    },
    /// Working copy does not match base + ops.
    WorkingDrift,
    InvariantViolated { detail: String },
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateReason::NotSimMode { mode } => write!(f, "draft mode {mode:?} cannot be committed"),
            GateReason::LoadExceeded { sigma, sigma_max } => {
                write!(f, "load {sigma:.4} exceeds sigma_max {sigma_max:.4}")
            }
            GateReason::MalformedOp {
                index,
                event,
                detail,
            } => write!(f, "op #{index} ({event}) is malformed: {detail}"),
            GateReason::WorkingDrift => f.write_str("working state diverged from base + ops"),
            GateReason::InvariantViolated { detail } => write!(f, "invariant violated: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("gate rejected commit: {reason}")]
pub struct GateRejected {
    pub reason: GateReason,
}

impl From<GateReason> for GateRejected {
    fn from(reason: GateReason) -> Self {
        GateRejected { reason }
    }
}

pub fn check(draft: &Draft, constants: &Constants) -> Result<(), GateRejected> {
    if draft.mode != Mode::Sim {
        return Err(GateReason::NotSimMode { mode: draft.mode }.into());
    }
    check_contents(draft, constants)
}

/// Everything except the mode rule. Replay re-runs this on drafts rebuilt
/// in `Replay` mode.
pub fn check_contents(draft: &Draft, constants: &Constants) -> Result<(), GateRejected> {
    // Every op must be valid from the base, not just from the working copy.
    check_invariants(&draft.base_state)?;
    let mut cur = draft.base_state;
    for (index, event) in draft.pending_ops.iter().enumerate() {
        cur = transition::apply(cur, *event, constants).map_err(|e| GateReason::MalformedOp {
            index,
            event: *event,
            detail: e.to_string(),
        })?;
        check_invariants(&cur)?;
    }
    if !cur.same_bits(&draft.working) {
        return Err(GateReason::WorkingDrift.into());
    }

    let sigma = transition::sigma(&cur, constants);
    if sigma > constants.sigma_max {
        return Err(GateReason::LoadExceeded {
            sigma,
            sigma_max: constants.sigma_max,
        }
        .into());
    }

    Ok(())
}

fn check_invariants(state: &State) -> Result<(), GateRejected> {
    if state.cycle > state.tick {
        return Err(GateReason::InvariantViolated {
            detail: format!("cycle {} > tick {}", state.cycle, state.tick),
        }
        .into());
    }
    if !state.entropy.is_finite() || state.entropy < 0.0 {
        return Err(GateReason::InvariantViolated {
            detail: format!("entropy {} out of range", state.entropy),
        }
        .into());
    }
    Ok(())
}
