//! Handle-based simulator front end.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::ProcessorConfig;
use crate::error::QprocResult;
use crate::matrix::Matrix2x2;
use crate::precision::Real;
use crate::processor::{ProcessorState, QubitProcessor, States, StatesKind};
use crate::state::QubitStates;

/// Opaque identifier of a register owned by a [`Simulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatesHandle(u64);

impl StatesHandle {
    /// Raw id.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StatesHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "qstates#{}", self.0)
    }
}

/// Owns a processor and the registers created through it, addressed by
/// [`StatesHandle`].
///
/// Passing a handle that was never issued, or was already destroyed, panics.
pub struct Simulator<R: Real> {
    processor: QubitProcessor<R>,
    states: FxHashMap<StatesHandle, QubitStates<R>>,
    next_handle: u64,
}

impl<R: Real> Simulator<R> {
    /// Create and initialize a simulator.
    pub fn new(config: ProcessorConfig) -> QprocResult<Self> {
        Ok(Self::with_processor(QubitProcessor::with_config(config)?))
    }

    /// Wrap an existing processor.
    pub fn with_processor(processor: QubitProcessor<R>) -> Self {
        Self {
            processor,
            states: FxHashMap::default(),
            next_handle: 1,
        }
    }

    /// Underlying processor.
    pub fn processor(&self) -> &QubitProcessor<R> {
        &self.processor
    }

    /// Lifecycle state of the processor.
    pub fn state(&self) -> ProcessorState {
        self.processor.state()
    }

    /// Number of live registers.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True if no registers are live.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// True if `handle` refers to a live register.
    pub fn contains(&self, handle: StatesHandle) -> bool {
        self.states.contains_key(&handle)
    }

    /// Allocate a register in `|0…0⟩`.
    pub fn initialize_qubit_states(&mut self, n_lanes: u32) -> QprocResult<StatesHandle> {
        let qstates = self.processor.initialize_qubit_states(n_lanes)?;
        Ok(self.insert(qstates))
    }

    /// Drop a register and return its memory to the pool.
    pub fn destroy_qubit_states(&mut self, handle: StatesHandle) -> QprocResult<()> {
        // Queued jobs may still reference the chunks.
        self.processor.synchronize()?;
        if self.states.remove(&handle).is_none() {
            panic!("unknown qubit states handle {handle}");
        }
        debug!(%handle, "qubit states destroyed");
        Ok(())
    }

    /// Reinitialize a register to `|0…0⟩`.
    pub fn reset_qubit_states(&mut self, handle: StatesHandle) -> QprocResult<()> {
        self.processor
            .reset_qubit_states(lookup_mut(&mut self.states, handle))
    }

    /// Lane count of a register.
    pub fn lane_count(&self, handle: StatesHandle) -> u32 {
        lookup(&self.states, handle).n_lanes()
    }

    /// Apply `mat` to `lane`.
    pub fn apply_gate(
        &mut self,
        mat: &Matrix2x2,
        handle: StatesHandle,
        lane: u32,
    ) -> QprocResult<()> {
        self.processor
            .apply_gate(mat, lookup_mut(&mut self.states, handle), lane)
    }

    /// Apply `mat` to `target_lane` where every control lane is 1.
    pub fn apply_controlled_gate(
        &mut self,
        mat: &Matrix2x2,
        handle: StatesHandle,
        control_lanes: &[u32],
        target_lane: u32,
    ) -> QprocResult<()> {
        self.processor.apply_controlled_gate(
            mat,
            lookup_mut(&mut self.states, handle),
            control_lanes,
            target_lane,
        )
    }

    /// Move the lane-1 amplitudes of a collapsed lane back onto 0.
    pub fn apply_reset(&mut self, handle: StatesHandle, lane: u32) -> QprocResult<()> {
        self.processor
            .apply_reset(lookup_mut(&mut self.states, handle), lane)
    }

    /// Probability of observing 1 on `lane`.
    pub fn calc_probability(&mut self, handle: StatesHandle, lane: u32) -> QprocResult<f64> {
        self.processor
            .calc_probability(lookup(&self.states, handle), lane)
    }

    /// Collapse `lane` onto `value`, whose probability was `prob`.
    pub fn decohere(
        &mut self,
        value: u32,
        prob: f64,
        handle: StatesHandle,
        lane: u32,
    ) -> QprocResult<()> {
        self.processor
            .decohere(value, prob, lookup_mut(&mut self.states, handle), lane)
    }

    /// Collapse `lane` and split it off; see
    /// [`QubitProcessor::decohere_and_separate`]. The source handle stays
    /// valid.
    pub fn decohere_and_separate(
        &mut self,
        value: u32,
        prob: f64,
        handle: StatesHandle,
        lane: u32,
    ) -> QprocResult<(StatesHandle, StatesHandle)> {
        let (kept, separated) = self.processor.decohere_and_separate(
            value,
            prob,
            lookup(&self.states, handle),
            lane,
        )?;
        Ok((self.insert(kept), self.insert(separated)))
    }

    /// Tensor product of registers into a new one; the inputs stay valid.
    pub fn join(&mut self, handles: &[StatesHandle], n_new_lanes: u32) -> QprocResult<StatesHandle> {
        let list: Vec<_> = handles.iter().map(|&h| lookup(&self.states, h)).collect();
        let joined = self.processor.join(&list, n_new_lanes)?;
        Ok(self.insert(joined))
    }

    /// Read amplitudes or probabilities of the product of `handles`.
    pub fn get_states(
        &mut self,
        handles: &[StatesHandle],
        kind: StatesKind,
        begin: u64,
        end: u64,
    ) -> QprocResult<States<R>> {
        let list: Vec<_> = handles.iter().map(|&h| lookup(&self.states, h)).collect();
        self.processor.get_states(&list, kind, begin, end)
    }

    /// Block until every queued job has completed.
    pub fn synchronize(&mut self) -> QprocResult<()> {
        self.processor.synchronize()
    }

    fn insert(&mut self, qstates: QubitStates<R>) -> StatesHandle {
        let handle = StatesHandle(self.next_handle);
        self.next_handle += 1;
        debug!(%handle, n_lanes = qstates.n_lanes(), "qubit states registered");
        self.states.insert(handle, qstates);
        handle
    }
}

fn lookup<R: Real>(
    states: &FxHashMap<StatesHandle, QubitStates<R>>,
    handle: StatesHandle,
) -> &QubitStates<R> {
    states
        .get(&handle)
        .unwrap_or_else(|| panic!("unknown qubit states handle {handle}"))
}

fn lookup_mut<R: Real>(
    states: &mut FxHashMap<StatesHandle, QubitStates<R>>,
    handle: StatesHandle,
) -> &mut QubitStates<R> {
    states
        .get_mut(&handle)
        .unwrap_or_else(|| panic!("unknown qubit states handle {handle}"))
}
