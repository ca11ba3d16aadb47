// Transition engine: pure, deterministic, no IO and no clock.
// Each call takes the constants explicitly; nothing is read from globals.

use crate::constants::Constants;
use crate::state::{Stability, State};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Unconditional entropy injection.
    Pressure,
    /// Damped entropy release, floored at zero.
    Release,
    /// Explicit decision: advances `cycle` and decays entropy.
    Cycle,
    /// Clears entropy; never touches `cycle`.
    Reset,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Pressure => "pressure",
            Event::Release => "release",
            Event::Cycle => "cycle",
            Event::Reset => "reset",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    /// Collapsed states accept `Reset` only.
    #[error("event {event} not allowed while {stability}")]
    InvalidEvent { event: Event, stability: Stability },
    #[error("tick or cycle counter overflow")]
    CounterOverflow,
    #[error("entropy left the finite range")]
    NonFinite,
}

/// Classify entropy into one of the four bands.
/// Stable < b1 <= Warning < (b1+b2)/2 <= Unstable < b2 <= Collapsed.
pub fn stability(entropy: f64, constants: &Constants) -> Stability {
    if entropy < constants.b1 {
        Stability::Stable
    } else if entropy < constants.unstable_floor() {
        Stability::Warning
    } else if entropy < constants.b2 {
        Stability::Unstable
    } else {
        Stability::Collapsed
    }
}

/// Normalised load the commit gate compares against `sigma_max`.
pub fn sigma(state: &State, constants: &Constants) -> f64 {
    state.entropy / constants.b2
}

/// Headroom left before collapse.
pub fn boundary(entropy: f64, constants: &Constants) -> f64 {
    (constants.b2 - entropy).max(0.0)
}

pub fn apply(state: State, event: Event, constants: &Constants) -> Result<State, TransitionError> {
    if !state.entropy.is_finite() || state.entropy < 0.0 {
        return Err(TransitionError::NonFinite);
    }
    // Collapsed accepts nothing but Reset.
    let current = stability(state.entropy, constants);
    if current == Stability::Collapsed && event != Event::Reset {
        return Err(TransitionError::InvalidEvent {
            event,
            stability: current,
        });
    }

    let tick = state
        .tick
        .checked_add(1)
        .ok_or(TransitionError::CounterOverflow)?;

    let (cycle, entropy) = match event {
        Event::Pressure => (state.cycle, state.entropy + constants.alpha),
        Event::Release => (state.cycle, (state.entropy - constants.beta).max(0.0)),
        Event::Reset => (state.cycle, 0.0),
        Event::Cycle => (
            state
                .cycle
                .checked_add(1)
                .ok_or(TransitionError::CounterOverflow)?,
            state.entropy * constants.gamma,
        ),
    };

    settle(tick, cycle, entropy, constants)
}

/// Fold a sequence of events; stops at the first failure and reports its index.
pub fn apply_all(
    state: State,
    events: &[Event],
    constants: &Constants,
) -> Result<State, (usize, TransitionError)> {
    let mut cur = state;
    for (i, ev) in events.iter().enumerate() {
        cur = apply(cur, *ev, constants).map_err(|e| (i, e))?;
    }
    Ok(cur)
}

/// Derive the dependent fields from the raw counters and entropy.
pub(crate) fn settle(
    tick: u64,
    cycle: u64,
    entropy: f64,
    constants: &Constants,
) -> Result<State, TransitionError> {
    if !entropy.is_finite() {
        return Err(TransitionError::NonFinite);
    }
    // Normalise -0.0 so equal states hash equally.
    let entropy = if entropy <= 0.0 { 0.0 } else { entropy };
    Ok(State {
        tick,
        cycle,
        entropy,
        boundary: boundary(entropy, constants),
        stability: stability(entropy, constants),
    })
}
