// Commit pipeline.
//
// Six stages in a fixed order. Stages 1-5 are pure functions of the draft and
// the constants and only write into a scratch `Workspace`; stage 6 is the
// single externally visible write (ledger append + live pointer swap). Any
// error before stage 6 leaves the ledger, the live state and the draft as
// they were.

use crate::constants::Constants;
use crate::ledger::{CommitMarker, HashChainLedger};
use crate::state::{state_hash, Stability, State};
use crate::store::{Draft, StateStore};
use crate::transition::{self, Event};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on simulated steps in a forecast.
pub const MAX_FORECAST_STEPS: u64 = 4_096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Reallocation,
    Recalibration,
    Topology,
    Recalculation,
    Forecast,
    Finalization,
}

impl StageId {
    /// 1-based position in the pipeline.
    pub fn position(self) -> usize {
        match self {
            StageId::Reallocation => 1,
            StageId::Recalibration => 2,
            StageId::Topology => 3,
            StageId::Recalculation => 4,
            StageId::Forecast => 5,
            StageId::Finalization => 6,
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.position())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("pipeline stage {stage} failed: {reason}")]
pub struct PipelineStageError {
    pub stage: StageId,
    pub reason: String,
}

impl PipelineStageError {
    pub fn new(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// Per-stage output recorded in the commit marker.
/// Stage 1 carries the ops, which is what replay re-applies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageResult {
    Reallocation {
        ops: Vec<Event>,
        inflow: f64,
        outflow: f64,
    },
    Recalibration {
        capacity: f64,
        load: f64,
    },
    Topology {
        from_tick: u64,
        to_tick: u64,
        from_cycle: u64,
        to_cycle: u64,
    },
    Recalculation {
        entropy: f64,
        boundary: f64,
        stability: Stability,
    },
    Forecast {
        /// `None` when collapse is not reached within the forecast horizon.
        pressures_to_collapse: Option<u64>,
        /// `None` when natural decay alone does not reach Stable in the horizon.
        decay_ticks_to_stable: Option<u64>,
    },
}

impl StageResult {
    pub fn stage(&self) -> StageId {
        match self {
            StageResult::Reallocation { .. } => StageId::Reallocation,
            StageResult::Recalibration { .. } => StageId::Recalibration,
            StageResult::Topology { .. } => StageId::Topology,
            StageResult::Recalculation { .. } => StageId::Recalculation,
            StageResult::Forecast { .. } => StageId::Forecast,
        }
    }
}

/// Ops recorded by a marker's reallocation result.
pub fn recorded_ops(results: &[StageResult]) -> Option<&[Event]> {
    results.iter().find_map(|r| match r {
        StageResult::Reallocation { ops, .. } => Some(ops.as_slice()),
        _ => None,
    })
}

/// Scratch space threaded through stages 1-5.
#[derive(Clone, Debug)]
pub struct Workspace {
    pub base: State,
    pub working: State,
    pub ops: Vec<Event>,
    /// Entropy after folding every op (stage 1).
    pub folded_entropy: Option<f64>,
    pub cycles: u64,
    /// Capacity left below collapse (stage 2).
    pub capacity: Option<f64>,
    /// Topology checked (stage 3).
    pub linked: bool,
    /// Recalculated state (stage 4).
    pub recalculated: Option<State>,
}

impl Workspace {
    pub fn from_draft(draft: &Draft) -> Self {
        Self {
            base: draft.base_state,
            working: draft.working,
            ops: draft.pending_ops.clone(),
            folded_entropy: None,
            cycles: 0,
            capacity: None,
            linked: false,
            recalculated: None,
        }
    }
}

pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;
    fn run(&self, ws: &mut Workspace, constants: &Constants)
        -> Result<StageResult, PipelineStageError>;
}

/// Stage 1: fold the ops into entropy inflow / outflow.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reallocation;

impl Stage for Reallocation {
    fn id(&self) -> StageId {
        StageId::Reallocation
    }

    fn run(&self, ws: &mut Workspace, constants: &Constants) -> Result<StageResult, PipelineStageError> {
        let mut cur = ws.base;
        let mut inflow = 0.0;
        let mut outflow = 0.0;
        let mut cycles = 0u64;
        for (i, ev) in ws.ops.iter().enumerate() {
            let next = transition::apply(cur, *ev, constants)
                .map_err(|e| PipelineStageError::new(self.id(), format!("op #{i}: {e}")))?;
            let delta = next.entropy - cur.entropy;
            if delta >= 0.0 {
                inflow += delta;
            } else {
                outflow -= delta;
            }
            if *ev == Event::Cycle {
                cycles += 1;
            }
            cur = next;
        }
        ws.folded_entropy = Some(cur.entropy);
        ws.cycles = cycles;
        Ok(StageResult::Reallocation {
            ops: ws.ops.clone(),
            inflow,
            outflow,
        })
    }
}

/// Stage 2: capacity and load from the folded entropy.
#[derive(Debug, Default, Clone, Copy)]
pub struct Recalibration;

impl Stage for Recalibration {
    fn id(&self) -> StageId {
        StageId::Recalibration
    }

    fn run(&self, ws: &mut Workspace, constants: &Constants) -> Result<StageResult, PipelineStageError> {
        let entropy = ws
            .folded_entropy
            .ok_or_else(|| PipelineStageError::new(self.id(), "reallocation output missing"))?;
        let capacity = constants.b2 - entropy;
        let load = entropy / constants.b2;
        if !capacity.is_finite() || !load.is_finite() {
            return Err(PipelineStageError::new(self.id(), "non-finite capacity"));
        }
        ws.capacity = Some(capacity);
        Ok(StageResult::Recalibration { capacity, load })
    }
}

/// Stage 3: link the commit into the tick/cycle graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct Topology;

impl Stage for Topology {
    fn id(&self) -> StageId {
        StageId::Topology
    }

    fn run(&self, ws: &mut Workspace, _constants: &Constants) -> Result<StageResult, PipelineStageError> {
        if ws.capacity.is_none() {
            return Err(PipelineStageError::new(self.id(), "recalibration output missing"));
        }
        let (from_tick, from_cycle) = (ws.base.tick, ws.base.cycle);
        let to_tick = from_tick
            .checked_add(ws.ops.len() as u64)
            .ok_or_else(|| PipelineStageError::new(self.id(), "tick overflow"))?;
        let to_cycle = from_cycle
            .checked_add(ws.cycles)
            .ok_or_else(|| PipelineStageError::new(self.id(), "cycle overflow"))?;
        if to_tick <= from_tick {
            return Err(PipelineStageError::new(self.id(), "tick edge is not forward"));
        }
        if to_cycle > to_tick {
            return Err(PipelineStageError::new(
                self.id(),
                format!("cycle {to_cycle} would exceed tick {to_tick}"),
            ));
        }
        ws.linked = true;
        Ok(StageResult::Topology {
            from_tick,
            to_tick,
            from_cycle,
            to_cycle,
        })
    }
}

/// Stage 4: re-derive the committed state and compare with the working copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct Recalculation;

impl Stage for Recalculation {
    fn id(&self) -> StageId {
        StageId::Recalculation
    }

    fn run(&self, ws: &mut Workspace, constants: &Constants) -> Result<StageResult, PipelineStageError> {
        let entropy = ws
            .folded_entropy
            .ok_or_else(|| PipelineStageError::new(self.id(), "reallocation output missing"))?;
        if !ws.linked {
            return Err(PipelineStageError::new(self.id(), "topology output missing"));
        }
        let tick = ws.base.tick + ws.ops.len() as u64;
        let cycle = ws.base.cycle + ws.cycles;
        let state = transition::settle(tick, cycle, entropy, constants)
            .map_err(|e| PipelineStageError::new(self.id(), e.to_string()))?;
        if !state.same_bits(&ws.working) {
            return Err(PipelineStageError::new(self.id(), "working copy drifted"));
        }
        ws.recalculated = Some(state);
        Ok(StageResult::Recalculation {
            entropy: state.entropy,
            boundary: state.boundary,
            stability: state.stability,
        })
    }
}

/// Stage 5: projections from the recalculated state. Never mutates it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Forecast;

impl Stage for Forecast {
    fn id(&self) -> StageId {
        StageId::Forecast
    }

    fn run(&self, ws: &mut Workspace, constants: &Constants) -> Result<StageResult, PipelineStageError> {
        let state = ws
            .recalculated
            .ok_or_else(|| PipelineStageError::new(self.id(), "recalculation output missing"))?;
        Ok(StageResult::Forecast {
            pressures_to_collapse: pressures_to_collapse(state.entropy, constants),
            decay_ticks_to_stable: decay_ticks_to_stable(state.entropy, constants),
        })
    }
}

/// Pressures needed to reach Collapsed, counted the way the engine adds.
pub fn pressures_to_collapse(entropy: f64, constants: &Constants) -> Option<u64> {
    let mut e = entropy;
    for n in 0..=MAX_FORECAST_STEPS {
        if e >= constants.b2 {
            return Some(n);
        }
        e += constants.alpha;
    }
    None
}

/// Idle ticks until natural decay `e * (1 - k)` brings entropy below b1.
pub fn decay_ticks_to_stable(entropy: f64, constants: &Constants) -> Option<u64> {
    let mut e = entropy;
    for n in 0..=MAX_FORECAST_STEPS {
        if e < constants.b1 {
            return Some(n);
        }
        e *= 1.0 - constants.k;
    }
    None
}

/// Output of stages 1-5.
#[derive(Clone, Debug, PartialEq)]
pub struct Prepared {
    pub state: State,
    pub stage_results: Vec<StageResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub state: State,
    pub marker: CommitMarker,
}

pub struct CommitPipeline {
    stages: [Box<dyn Stage>; 5],
}

impl Default for CommitPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl CommitPipeline {
    pub fn standard() -> Self {
        Self {
            stages: [
                Box::new(Reallocation),
                Box::new(Recalibration),
                Box::new(Topology),
                Box::new(Recalculation),
                Box::new(Forecast),
            ],
        }
    }

    /// Swap the implementation of one of stages 1-5; order stays fixed.
    pub fn replace_stage(&mut self, stage: Box<dyn Stage>) -> Result<(), PipelineStageError> {
        let id = stage.id();
        if id == StageId::Finalization {
            return Err(PipelineStageError::new(id, "finalization is not replaceable"));
        }
        self.stages[id.position() - 1] = stage;
        Ok(())
    }

    /// Stages 1-5. Pure: used by commit and by replay.
    pub fn prepare(&self, draft: &Draft, constants: &Constants) -> Result<Prepared, PipelineStageError> {
        let mut ws = Workspace::from_draft(draft);
        let mut stage_results = Vec::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            let result = stage.run(&mut ws, constants)?;
            if result.stage().position() != i + 1 {
                return Err(PipelineStageError::new(
                    stage.id(),
                    format!("stage in slot {} returned {:?} output", i + 1, result.stage()),
                ));
            }
            stage_results.push(result);
        }
        let state = ws.recalculated.ok_or_else(|| {
            PipelineStageError::new(StageId::Recalculation, "no recalculated state")
        })?;
        Ok(Prepared {
            state,
            stage_results,
        })
    }

    /// Full run, stages 1-6. The caller holds the commit lock.
    pub fn execute(
        &self,
        draft: &Draft,
        constants: &Constants,
        store: &StateStore,
        ledger: &mut HashChainLedger,
        timestamp_ms: u64,
    ) -> Result<CommitOutcome, PipelineStageError> {
        let prepared = self.prepare(draft, constants)?;

        // Stage 6: the draft must extend exactly what the ledger last recorded.
        let anchored = if ledger.is_empty() {
            draft.base_state.same_bits(&State::genesis(constants))
        } else {
            state_hash(&draft.base_state) == ledger.tip_hash()
        };
        if !anchored {
            return Err(PipelineStageError::new(
                StageId::Finalization,
                "draft base does not match the ledger tip",
            ));
        }
        let marker = ledger.append(prepared.state, prepared.stage_results, timestamp_ms);
        store.install(prepared.state);
        Ok(CommitOutcome {
            state: prepared.state,
            marker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DraftLimits;
    use crate::state::Mode;

    fn draft(ops: &[Event], c: &Constants) -> Draft {
        let mut d = Draft::new(1, "s", State::genesis(c), Mode::Sim);
        for ev in ops {
            d.push(*ev, c).unwrap();
        }
        d
    }

    struct Failing(StageId);

    impl Stage for Failing {
        fn id(&self) -> StageId {
            self.0
        }
        fn run(&self, _: &mut Workspace, _: &Constants) -> Result<StageResult, PipelineStageError> {
            Err(PipelineStageError::new(self.0, "forced"))
        }
    }

    #[test]
    fn results_come_out_in_stage_order() {
        let c = Constants::default();
        let d = draft(&[Event::Pressure, Event::Pressure, Event::Cycle], &c);
        let p = CommitPipeline::standard().prepare(&d, &c).unwrap();
        let order: Vec<_> = p.stage_results.iter().map(|r| r.stage().position()).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert!(p.state.same_bits(&d.working));
        assert_eq!(recorded_ops(&p.stage_results), Some(d.pending_ops.as_slice()));
    }

    #[test]
    fn reallocation_splits_flows() {
        let c = Constants::default();
        let d = draft(&[Event::Pressure, Event::Pressure, Event::Release], &c);
        let p = CommitPipeline::standard().prepare(&d, &c).unwrap();
        match &p.stage_results[0] {
            StageResult::Reallocation { inflow, outflow, .. } => {
                assert!((inflow - 0.24).abs() < 1e-9);
                assert!((outflow - 0.10).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn topology_records_edges() {
        let c = Constants::default();
        let d = draft(&[Event::Release, Event::Cycle], &c);
        let p = CommitPipeline::standard().prepare(&d, &c).unwrap();
        assert_eq!(
            p.stage_results[2],
            StageResult::Topology {
                from_tick: 0,
                to_tick: 2,
                from_cycle: 0,
                to_cycle: 1
            }
        );
    }

    #[test]
    fn forecast_counts() {
        let c = Constants::default();
        assert_eq!(pressures_to_collapse(0.0, &c), Some(9));
        assert_eq!(pressures_to_collapse(1.2, &c), Some(0));
        assert_eq!(decay_ticks_to_stable(0.1, &c), Some(0));
        let n = decay_ticks_to_stable(0.36, &c).unwrap();
        assert!(n > 0);
        let still = 0.36 * (1.0f64 - c.k).powi(n as i32 - 1);
        assert!(still >= c.b1);

        let frozen = Constants { alpha: 0.0, k: 0.0, ..c };
        assert_eq!(pressures_to_collapse(0.5, &frozen), None);
        assert_eq!(decay_ticks_to_stable(0.5, &frozen), None);
    }

    #[test]
    fn stage_four_failure_leaves_everything_untouched() {
        let c = Constants::default();
        let store = StateStore::new(c, DraftLimits::default());
        let mut ledger = HashChainLedger::new();
        let mut pipeline = CommitPipeline::standard();
        pipeline
            .replace_stage(Box::new(Failing(StageId::Recalculation)))
            .unwrap();

        let before = *store.live();
        let d = draft(&[Event::Pressure], &c);
        let err = pipeline.execute(&d, &c, &store, &mut ledger, 1).unwrap_err();
        assert_eq!(err.stage, StageId::Recalculation);
        assert_eq!(*store.live(), before);
        assert!(ledger.is_empty());
    }

    #[test]
    fn finalization_cannot_be_replaced() {
        let mut pipeline = CommitPipeline::standard();
        assert!(pipeline
            .replace_stage(Box::new(Failing(StageId::Finalization)))
            .is_err());
    }

    #[test]
    fn drifted_working_copy_fails_recalculation() {
        let c = Constants::default();
        let mut d = draft(&[Event::Pressure], &c);
        d.working.entropy += 1e-6;
        let err = CommitPipeline::standard().prepare(&d, &c).unwrap_err();
        assert_eq!(err.stage, StageId::Recalculation);
    }

    #[test]
    fn unanchored_base_is_refused() {
        let c = Constants::default();
        let store = StateStore::new(c, DraftLimits::default());
        let mut ledger = HashChainLedger::new();
        let mut d = draft(&[], &c);
        d.base_state = transition::apply(d.base_state, Event::Pressure, &c).unwrap();
        d.working = d.base_state;
        d.push(Event::Release, &c).unwrap();
        let err = CommitPipeline::standard()
            .execute(&d, &c, &store, &mut ledger, 1)
            .unwrap_err();
        assert_eq!(err.stage, StageId::Finalization);
        assert!(ledger.is_empty());
    }

    #[test]
    fn execute_appends_and_swaps() {
        let c = Constants::default();
        let store = StateStore::new(c, DraftLimits::default());
        let mut ledger = HashChainLedger::new();
        let d = draft(&[Event::Pressure, Event::Pressure], &c);
        let out = CommitPipeline::standard()
            .execute(&d, &c, &store, &mut ledger, 42)
            .unwrap();
        assert_eq!(out.marker.sequence, 1);
        assert_eq!(out.marker.timestamp_ms, 42);
        assert_eq!(out.marker.state_hash, state_hash(&out.state));
        assert_eq!(*store.live(), out.state);
        assert_eq!(store.live().stability, Stability::Warning);
    }
}
