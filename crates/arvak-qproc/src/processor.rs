//! The qubit processor: plans index ranges and dispatches kernels.

use num_complex::Complex;
use num_traits::One;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

use crate::bitperm::BitPermTable;
use crate::config::{BackendKind, ConfigError, ProcessorConfig};
use crate::device::{Completion, Device, DeviceWorker};
use crate::dispatch::{ParallelDispatcher, partition};
use crate::error::{QprocError, QprocResult};
use crate::kernel::{self, ProductLayout};
use crate::matrix::Matrix2x2;
use crate::pool::{Affinity, ChunkPool};
use crate::precision::Real;
use crate::state::QubitStates;
use crate::transfer::TransferPipeline;

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Created, no workers or memory pools yet.
    Uninitialized,
    /// Idle; every issued job has completed.
    Ready,
    /// Device jobs are queued or running.
    Executing,
}

/// What [`QubitProcessor::get_states`] reads out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatesKind {
    /// Complex amplitudes.
    Amplitude,
    /// Probabilities `|a|²`.
    Probability,
}

/// Values read out by [`QubitProcessor::get_states`].
#[derive(Debug, Clone, PartialEq)]
pub enum States<R> {
    /// One complex amplitude per index.
    Amplitudes(Vec<Complex<R>>),
    /// One probability per index.
    Probabilities(Vec<R>),
}

impl<R> States<R> {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            States::Amplitudes(values) => values.len(),
            States::Probabilities(values) => values.len(),
        }
    }

    /// True if no values were read.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Backend {
    Cpu {
        dispatcher: ParallelDispatcher,
    },
    Devices {
        workers: Vec<DeviceWorker>,
        pipeline: TransferPipeline,
    },
}

struct Runtime<R: Real> {
    backend: Backend,
    pool: Arc<ChunkPool<R>>,
    max_po2_per_chunk: u32,
}

/// Executes gate and measurement operations on chunked state vectors.
///
/// On the CPU backend every call completes before it returns. On the device
/// backend calls return once their jobs are queued; [`synchronize`] waits for
/// them. Before queuing new work on any state the processor waits for the
/// previous call's jobs, so dependent calls issued back to back never overlap.
///
/// Calls block on worker completions and must be made from a blocking
/// context. Inside a tokio runtime, run them through
/// `tokio::task::spawn_blocking`.
///
/// [`synchronize`]: QubitProcessor::synchronize
pub struct QubitProcessor<R: Real> {
    id: u64,
    config: ProcessorConfig,
    runtime: Option<Runtime<R>>,
    pending: Vec<Completion<()>>,
    perm_cache: Option<Arc<BitPermTable>>,
}

impl<R: Real> QubitProcessor<R> {
    /// Create an uninitialized processor.
    pub fn new(config: ProcessorConfig) -> QprocResult<Self> {
        config.validate()?;
        if config.precision != R::PRECISION {
            return Err(ConfigError::ValidationError(format!(
                "configured precision {:?} does not match processor precision {:?}",
                config.precision,
                R::PRECISION
            ))
            .into());
        }
        Ok(Self {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            config,
            runtime: None,
            pending: Vec::new(),
            perm_cache: None,
        })
    }

    /// Create and initialize a processor.
    pub fn with_config(config: ProcessorConfig) -> QprocResult<Self> {
        let mut processor = Self::new(config)?;
        processor.initialize()?;
        Ok(processor)
    }

    /// Start worker threads and memory pools. Calling it again is a no-op.
    #[instrument(skip(self), fields(backend = ?self.config.backend))]
    pub fn initialize(&mut self) -> QprocResult<()> {
        if self.runtime.is_some() {
            return Ok(());
        }
        let config = &self.config;
        let max_po2_per_chunk = config.resolve_max_po2_per_chunk();
        let (backend, pool) = match config.backend {
            BackendKind::Cpu => (
                Backend::Cpu {
                    dispatcher: ParallelDispatcher::new(config.n_workers)?,
                },
                ChunkPool::new([(Affinity::Host, config.host_memory_bytes)]),
            ),
            BackendKind::Devices => {
                let workers = (0..config.devices.count)
                    .map(|id| {
                        DeviceWorker::spawn(Arc::new(Device::new(
                            id,
                            config.devices.memory_bytes,
                            config.devices.host_store_bytes,
                        )))
                    })
                    .collect::<QprocResult<Vec<_>>>()?;
                let pool = ChunkPool::new(
                    (0..config.devices.count)
                        .map(|id| (Affinity::Device(id), config.devices.memory_bytes)),
                );
                let pipeline = TransferPipeline::new(workers.len(), &config.transfer)?;
                (Backend::Devices { workers, pipeline }, pool)
            }
        };

        info!(
            precision = ?R::PRECISION,
            max_po2_per_chunk,
            "qubit processor initialized"
        );
        self.runtime = Some(Runtime {
            backend,
            pool: Arc::new(pool),
            max_po2_per_chunk,
        });
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        match (&self.runtime, self.pending.is_empty()) {
            (None, _) => ProcessorState::Uninitialized,
            (Some(_), true) => ProcessorState::Ready,
            (Some(_), false) => ProcessorState::Executing,
        }
    }

    /// Configuration the processor was created with.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Block until every queued job has completed.
    ///
    /// All jobs are waited on even if one fails; the first failure is
    /// returned.
    pub fn synchronize(&mut self) -> QprocResult<()> {
        let mut first_error = None;
        for completion in self.pending.drain(..) {
            if let Err(e) = completion.wait() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Wait for outstanding work and give pooled memory back.
    pub fn reset(&mut self) -> QprocResult<()> {
        self.synchronize()?;
        self.perm_cache = None;
        if let Some(runtime) = &self.runtime {
            runtime.pool.clear();
            if let Backend::Devices { workers, .. } = &runtime.backend {
                for worker in workers {
                    worker.device().host_store().clear();
                }
            }
        }
        debug!("qubit processor reset");
        Ok(())
    }

    /// Allocate a register of `n_lanes` lanes in `|0…0⟩`.
    #[instrument(skip(self))]
    pub fn initialize_qubit_states(&mut self, n_lanes: u32) -> QprocResult<QubitStates<R>> {
        assert!(n_lanes < 63, "lane count {n_lanes} too large");
        let runtime = self.runtime()?;
        let mut qstates =
            QubitStates::allocate(&runtime.pool, self.id, n_lanes, runtime.max_po2_per_chunk)?;
        debug!(n_chunks = qstates.n_chunks(), "qubit states allocated");
        self.reset_qubit_states(&mut qstates)?;
        Ok(qstates)
    }

    /// Reinitialize an existing register to `|0…0⟩` in place.
    pub fn reset_qubit_states(&mut self, qstates: &mut QubitStates<R>) -> QprocResult<()> {
        self.check_owner(qstates);
        let view = qstates.view();
        self.launch(qstates.n_states(), move |begin, end| {
            kernel::fill_zero(&view, begin, end);
            if begin == 0 {
                kernel::set(&view, 0, Complex::one());
            }
        })
    }

    /// Apply `mat` to `lane`.
    #[instrument(skip(self, mat, qstates))]
    pub fn apply_gate(
        &mut self,
        mat: &Matrix2x2,
        qstates: &mut QubitStates<R>,
        lane: u32,
    ) -> QprocResult<()> {
        self.check_owner(qstates);
        check_lane(qstates, lane);
        let mat = mat.cast::<R>();
        let view = qstates.view();
        self.launch(qstates.n_states() / 2, move |begin, end| {
            kernel::apply_unary_gate(&view, &mat, lane, begin, end);
        })
    }

    /// Apply `mat` to `target_lane` where every control lane is 1.
    #[instrument(skip(self, mat, qstates))]
    pub fn apply_controlled_gate(
        &mut self,
        mat: &Matrix2x2,
        qstates: &mut QubitStates<R>,
        control_lanes: &[u32],
        target_lane: u32,
    ) -> QprocResult<()> {
        self.check_owner(qstates);
        check_lane(qstates, target_lane);
        let mut control_bits = 0u64;
        for &lane in control_lanes {
            check_lane(qstates, lane);
            assert!(lane != target_lane, "control lane {lane} is also the target");
            assert!(control_bits & (1 << lane) == 0, "control lane {lane} given twice");
            control_bits |= 1 << lane;
        }
        if control_lanes.is_empty() {
            return self.apply_gate(mat, qstates, target_lane);
        }

        let target_bit = 1u64 << target_lane;
        let perm = self.perm_table(control_bits | target_bit, qstates.n_lanes());
        let mat = mat.cast::<R>();
        let view = qstates.view();
        let n_work = perm.n_indices();
        self.launch(n_work, move |begin, end| {
            kernel::apply_control_gate(&view, &mat, &perm, control_bits, target_bit, begin, end);
        })
    }

    /// Move the lane-1 amplitudes of a collapsed lane back onto 0.
    #[instrument(skip(self, qstates))]
    pub fn apply_reset(&mut self, qstates: &mut QubitStates<R>, lane: u32) -> QprocResult<()> {
        self.check_owner(qstates);
        check_lane(qstates, lane);
        let view = qstates.view();
        self.launch(qstates.n_states() / 2, move |begin, end| {
            kernel::apply_reset(&view, lane, begin, end);
        })
    }

    /// Probability of observing 1 on `lane`, clamped to `[0, 1]`.
    #[instrument(skip(self, qstates))]
    pub fn calc_probability(&mut self, qstates: &QubitStates<R>, lane: u32) -> QprocResult<f64> {
        self.check_owner(qstates);
        check_lane(qstates, lane);
        let view = qstates.view();
        let prob = self.reduce(qstates.n_states() / 2, move |begin, end| {
            kernel::calc_prob(&view, lane, begin, end)
        })?;
        // Round-off can carry the sum slightly past 1.
        Ok(prob.as_f64().clamp(0.0, 1.0))
    }

    /// Collapse `lane` onto `value`, whose probability was `prob`.
    #[instrument(skip(self, qstates))]
    pub fn decohere(
        &mut self,
        value: u32,
        prob: f64,
        qstates: &mut QubitStates<R>,
        lane: u32,
    ) -> QprocResult<()> {
        self.check_owner(qstates);
        check_lane(qstates, lane);
        check_observation(value, prob);
        let prob = R::from_f64(prob);
        let view = qstates.view();
        self.launch(qstates.n_states() / 2, move |begin, end| {
            if value == 0 {
                kernel::measure_set0(&view, lane, prob, begin, end);
            } else {
                kernel::measure_set1(&view, lane, prob, begin, end);
            }
        })
    }

    /// Collapse `lane` onto `value` and split it off.
    ///
    /// Returns the remaining `n - 1` lanes (higher lanes shift down by one)
    /// and a one-lane register in `|value⟩`. The source is left untouched.
    #[instrument(skip(self, qstates))]
    pub fn decohere_and_separate(
        &mut self,
        value: u32,
        prob: f64,
        qstates: &QubitStates<R>,
        lane: u32,
    ) -> QprocResult<(QubitStates<R>, QubitStates<R>)> {
        self.check_owner(qstates);
        check_lane(qstates, lane);
        check_observation(value, prob);

        let runtime = self.runtime()?;
        let kept = QubitStates::allocate(
            &runtime.pool,
            self.id,
            qstates.n_lanes() - 1,
            runtime.max_po2_per_chunk,
        )?;
        let prob = R::from_f64(prob);
        let src = qstates.view();
        let dst = kept.view();
        self.launch(kept.n_states(), move |begin, end| {
            kernel::copy_collapsed(&src, &dst, lane, value, prob, begin, end);
        })?;

        let mut separated = self.initialize_qubit_states(1)?;
        if value == 1 {
            self.apply_gate(&Matrix2x2::pauli_x(), &mut separated, 0)?;
        }
        Ok((kept, separated))
    }

    /// Tensor product of independent registers.
    ///
    /// The first register occupies the lowest lanes: joint index
    /// `Σ local_k << offset_k`, with `offset_k` the lane count of the
    /// registers before it. Lanes beyond the inputs' total start in `|0⟩`.
    #[instrument(skip(self, qstates_list), fields(n_parts = qstates_list.len()))]
    pub fn join(
        &mut self,
        qstates_list: &[&QubitStates<R>],
        n_new_lanes: u32,
    ) -> QprocResult<QubitStates<R>> {
        assert!(n_new_lanes < 63, "lane count {n_new_lanes} too large");
        let layout = self.product_layout(qstates_list);
        assert!(
            layout.n_lanes() <= n_new_lanes,
            "joined registers have {} lanes, more than the requested {n_new_lanes}",
            layout.n_lanes()
        );
        let runtime = self.runtime()?;
        let joined =
            QubitStates::allocate(&runtime.pool, self.id, n_new_lanes, runtime.max_po2_per_chunk)?;
        let dst = joined.view();
        self.launch(joined.n_states(), move |begin, end| {
            kernel::write_product(&layout, &dst, begin, end);
        })?;
        Ok(joined)
    }

    /// Read amplitudes or probabilities of the product of `qstates_list` for
    /// joint indices `[begin, end)`.
    pub fn get_states(
        &mut self,
        qstates_list: &[&QubitStates<R>],
        kind: StatesKind,
        begin: u64,
        end: u64,
    ) -> QprocResult<States<R>> {
        Ok(match kind {
            StatesKind::Amplitude => {
                States::Amplitudes(self.get_amplitudes(qstates_list, begin, end)?)
            }
            StatesKind::Probability => {
                States::Probabilities(self.get_probabilities(qstates_list, begin, end)?)
            }
        })
    }

    /// Amplitudes of the product of `qstates_list` for joint indices
    /// `[begin, end)`, composed the same way as [`join`](Self::join).
    pub fn get_amplitudes(
        &mut self,
        qstates_list: &[&QubitStates<R>],
        begin: u64,
        end: u64,
    ) -> QprocResult<Vec<Complex<R>>> {
        self.get_values(qstates_list, begin, end, |amp| amp)
    }

    /// Probabilities `|a|²` of the product of `qstates_list` for joint indices
    /// `[begin, end)`.
    pub fn get_probabilities(
        &mut self,
        qstates_list: &[&QubitStates<R>],
        begin: u64,
        end: u64,
    ) -> QprocResult<Vec<R>> {
        self.get_values(qstates_list, begin, end, |amp| amp.norm_sqr())
    }

    #[instrument(skip(self, qstates_list, convert), fields(n_parts = qstates_list.len()))]
    fn get_values<V>(
        &mut self,
        qstates_list: &[&QubitStates<R>],
        begin: u64,
        end: u64,
        convert: fn(Complex<R>) -> V,
    ) -> QprocResult<Vec<V>>
    where
        V: Copy + Default + Send + Sync + 'static,
    {
        let layout = self.product_layout(qstates_list);
        assert!(
            layout.n_lanes() < 63,
            "lane count {} too large",
            layout.n_lanes()
        );
        assert!(
            begin <= end && end <= 1 << layout.n_lanes(),
            "range {begin}..{end} out of bounds for {} lanes",
            layout.n_lanes()
        );
        self.synchronize()?;

        let mut values = vec![V::default(); (end - begin) as usize];
        match &self.runtime()?.backend {
            Backend::Cpu { dispatcher } => {
                dispatcher.distribute_mut(&mut values, |_, offset, piece| {
                    fill_values(&layout, convert, piece, begin + offset);
                });
            }
            Backend::Devices { workers, pipeline } => {
                let producer = move |staged: &mut [V], span_begin: u64, _span_end: u64| {
                    fill_values(&layout, convert, staged, span_begin);
                };
                pipeline.run_d2h(&mut values, workers, begin, end, Arc::new(producer))?;
            }
        }
        Ok(values)
    }

    fn product_layout(&self, qstates_list: &[&QubitStates<R>]) -> ProductLayout<R> {
        for qstates in qstates_list {
            self.check_owner(qstates);
        }
        ProductLayout::new(qstates_list.iter().map(|qs| qs.view()).collect())
    }

    fn runtime(&self) -> QprocResult<&Runtime<R>> {
        self.runtime.as_ref().ok_or(QprocError::NotInitialized)
    }

    fn check_owner(&self, qstates: &QubitStates<R>) {
        assert_eq!(
            qstates.owner(),
            self.id,
            "qubit states were created by another processor"
        );
    }

    fn perm_table(&mut self, fixed_mask: u64, n_lanes: u32) -> Arc<BitPermTable> {
        if let Some(table) = &self.perm_cache {
            if table.fixed_mask() == fixed_mask && table.n_lanes() == n_lanes {
                return Arc::clone(table);
            }
        }
        let bits: Vec<u32> = (0..64).filter(|&bit| fixed_mask & (1 << bit) != 0).collect();
        let table = Arc::new(BitPermTable::new(&bits, n_lanes));
        self.perm_cache = Some(Arc::clone(&table));
        table
    }

    /// Run `job` over work indices `[0, n_work)`.
    fn launch<F>(&mut self, n_work: u64, job: F) -> QprocResult<()>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.synchronize()?;
        let runtime = self.runtime.as_ref().ok_or(QprocError::NotInitialized)?;
        match &runtime.backend {
            Backend::Cpu { dispatcher } => {
                dispatcher.distribute(|_, begin, end| job(begin, end), 0, n_work);
            }
            Backend::Devices { workers, .. } => {
                let job = Arc::new(job);
                for (worker, (begin, end)) in workers.iter().zip(partition(0, n_work, workers.len())) {
                    let job = Arc::clone(&job);
                    self.pending.push(worker.submit(move |_| job(begin, end)));
                }
            }
        }
        Ok(())
    }

    /// Run `job` over work indices `[0, n_work)` and combine the partial
    /// results pairwise after every worker has finished.
    fn reduce<F>(&mut self, n_work: u64, job: F) -> QprocResult<R>
    where
        F: Fn(u64, u64) -> R + Send + Sync + 'static,
    {
        self.synchronize()?;
        let partials = match &self.runtime()?.backend {
            Backend::Cpu { dispatcher } => {
                dispatcher.distribute_collect(|_, begin, end| job(begin, end), 0, n_work)
            }
            Backend::Devices { workers, .. } => {
                let job = Arc::new(job);
                let completions: Vec<_> = workers
                    .iter()
                    .zip(partition(0, n_work, workers.len()))
                    .map(|(worker, (begin, end))| {
                        let job = Arc::clone(&job);
                        worker.submit(move |_| job(begin, end))
                    })
                    .collect();
                completions
                    .into_iter()
                    .map(Completion::wait)
                    .collect::<QprocResult<Vec<_>>>()?
            }
        };
        Ok(kernel::pairwise_reduce(&partials))
    }
}

fn fill_values<R: Real, V>(
    layout: &ProductLayout<R>,
    convert: fn(Complex<R>) -> V,
    out: &mut [V],
    first: u64,
) {
    for (i, value) in out.iter_mut().enumerate() {
        *value = convert(layout.amplitude(first + i as u64));
    }
}

fn check_lane<R: Real>(qstates: &QubitStates<R>, lane: u32) {
    assert!(
        lane < qstates.n_lanes(),
        "lane {lane} out of range for {} lanes",
        qstates.n_lanes()
    );
}

fn check_observation(value: u32, prob: f64) {
    assert!(value <= 1, "observed value must be 0 or 1, got {value}");
    assert!(
        prob > 0.0 && prob <= 1.0,
        "observation probability must be in (0, 1], got {prob}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::Precision;

    fn devices() -> ProcessorConfig {
        ProcessorConfig::devices(2, 1 << 20).with_max_po2_per_chunk(3)
    }

    #[test]
    fn test_operations_require_initialize() {
        let mut proc = QubitProcessor::<f64>::new(ProcessorConfig::cpu()).unwrap();
        assert_eq!(proc.state(), ProcessorState::Uninitialized);

        let err = proc.initialize_qubit_states(2).unwrap_err();
        assert!(matches!(err, QprocError::NotInitialized));

        proc.initialize().unwrap();
        assert_eq!(proc.state(), ProcessorState::Ready);
        assert!(proc.initialize_qubit_states(2).is_ok());
    }

    #[test]
    fn test_precision_mismatch_is_rejected() {
        let config = ProcessorConfig::cpu().with_precision(Precision::F32);
        let err = QubitProcessor::<f64>::new(config).err().unwrap();
        assert!(matches!(err, QprocError::Config(_)));
    }

    #[test]
    fn test_device_jobs_leave_executing_on_synchronize() {
        let mut proc = QubitProcessor::<f64>::with_config(devices()).unwrap();
        let mut qs = proc.initialize_qubit_states(5).unwrap();
        proc.apply_gate(&Matrix2x2::hadamard(), &mut qs, 4).unwrap();
        assert_eq!(proc.state(), ProcessorState::Executing);

        proc.synchronize().unwrap();
        assert_eq!(proc.state(), ProcessorState::Ready);
        assert!((proc.calc_probability(&qs, 4).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_perm_table_is_cached_per_mask() {
        let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let a = proc.perm_table(0b101, 4);
        let b = proc.perm_table(0b101, 4);
        let c = proc.perm_table(0b011, 4);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.fixed_mask(), 0b011);
    }

    #[test]
    fn test_reset_returns_chunks() {
        let mut proc = QubitProcessor::<f64>::with_config(devices()).unwrap();
        let qs = proc.initialize_qubit_states(6).unwrap();
        drop(qs);
        proc.reset().unwrap();

        let pool = &proc.runtime().unwrap().pool;
        assert!(pool.usage().iter().all(|&(_, used)| used == 0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_lane_out_of_range_panics() {
        let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let mut qs = proc.initialize_qubit_states(2).unwrap();
        let _ = proc.apply_gate(&Matrix2x2::pauli_x(), &mut qs, 2);
    }

    #[test]
    #[should_panic(expected = "also the target")]
    fn test_control_on_target_panics() {
        let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let mut qs = proc.initialize_qubit_states(2).unwrap();
        let _ = proc.apply_controlled_gate(&Matrix2x2::pauli_x(), &mut qs, &[1], 1);
    }

    #[test]
    #[should_panic(expected = "another processor")]
    fn test_foreign_states_panic() {
        let mut a = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let mut b = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let qs = a.initialize_qubit_states(1).unwrap();
        let _ = b.calc_probability(&qs, 0);
    }

    #[test]
    fn test_probability_never_exceeds_one() {
        let mut proc = QubitProcessor::<f32>::with_config(
            ProcessorConfig::cpu().with_precision(Precision::F32),
        )
        .unwrap();
        for step in 1..200 {
            let theta = f64::from(step) * 0.0157;
            let mut qs = proc.initialize_qubit_states(1).unwrap();
            proc.apply_gate(&Matrix2x2::ry(theta), &mut qs, 0).unwrap();
            proc.apply_gate(&Matrix2x2::ry(std::f64::consts::PI - theta), &mut qs, 0)
                .unwrap();

            let p = proc.calc_probability(&qs, 0).unwrap();
            assert!((0.0..=1.0).contains(&p), "theta {theta}: p = {p}");
            proc.decohere(1, p, &mut qs, 0).unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn test_oversized_join_panics() {
        let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let qs = proc.initialize_qubit_states(1).unwrap();
        let _ = proc.join(&[&qs], 63);
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn test_oversized_read_panics() {
        let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let parts: Vec<_> = (0..63)
            .map(|_| proc.initialize_qubit_states(1).unwrap())
            .collect();
        let list: Vec<_> = parts.iter().collect();
        let _ = proc.get_amplitudes(&list, 0, 1);
    }

    #[test]
    #[should_panic(expected = "(0, 1]")]
    fn test_zero_probability_panics() {
        let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
        let mut qs = proc.initialize_qubit_states(1).unwrap();
        let _ = proc.decohere(1, 0.0, &mut qs, 0);
    }
}
