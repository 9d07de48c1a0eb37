//! Double-buffered device-to-host transfers.
//!
//! A span `[begin, end)` is divided among the device workers, and each
//! worker's share among `contexts_per_worker` contexts. A context owns one
//! host staging buffer and walks its share in steps of `exec_stride`
//! elements: the device fills the staging buffer, the host copies it into the
//! output, and the context is relaunched on its next step. While one context's
//! result is being copied, the device is already filling the next context's
//! buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument, trace};

use crate::config::TransferConfig;
use crate::device::{Completion, DeviceWorker};
use crate::dispatch::{ParallelDispatcher, default_workers};
use crate::error::{QprocError, QprocResult};

/// Staging steps are rounded down to a multiple of this many elements.
const EXEC_STRIDE_ALIGN: u64 = 1 << 10;

/// Sizes derived for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    /// Elements assigned to each worker.
    pub worker_stride: u64,
    /// Elements assigned to each context.
    pub ctx_stride: u64,
    /// Elements moved per device launch, the staging buffer length.
    pub exec_stride: u64,
}

struct Context<V> {
    worker: usize,
    // Set once the staging buffer has been charged to the worker's store.
    charged: bool,
    buffer: Option<Vec<V>>,
    running: Option<Completion<Vec<V>>>,
    ctx_end: u64,
    cur_begin: u64,
    cur_end: u64,
    stride: u64,
}

impl<V> Context<V>
where
    V: Copy + Send + Sync + 'static,
{
    fn set_span(&mut self, ctx_begin: u64, ctx_end: u64) {
        self.ctx_end = ctx_end;
        self.cur_begin = ctx_begin;
        self.cur_end = (ctx_begin + self.stride).min(ctx_end);
    }

    fn launch<P>(&mut self, worker: &DeviceWorker, producer: &Arc<P>) -> bool
    where
        P: Fn(&mut [V], u64, u64) + Send + Sync + 'static,
    {
        if self.cur_begin == self.ctx_end {
            return false;
        }
        let Some(mut buffer) = self.buffer.take() else {
            return false;
        };
        let (begin, end) = (self.cur_begin, self.cur_end);
        let producer = Arc::clone(producer);
        self.running = Some(worker.submit(move |_| {
            producer(&mut buffer[..(end - begin) as usize], begin, end);
            buffer
        }));
        true
    }

    fn sync_and_copy(
        &mut self,
        out: &mut [V],
        out_begin: u64,
        copier: &ParallelDispatcher,
    ) -> QprocResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let buffer = running.wait()?;
        let len = (self.cur_end - self.cur_begin) as usize;
        let offset = (self.cur_begin - out_begin) as usize;
        let staged = &buffer[..len];
        copier.distribute_mut(&mut out[offset..offset + len], |_, piece_offset, piece| {
            let start = piece_offset as usize;
            piece.copy_from_slice(&staged[start..start + piece.len()]);
        });
        self.buffer = Some(buffer);
        Ok(())
    }

    fn update_span(&mut self) {
        self.cur_begin = self.cur_end;
        self.cur_end = (self.cur_begin + self.stride).min(self.ctx_end);
    }
}

struct WorkerShare<'a, V> {
    out: &'a mut [V],
    out_begin: u64,
    contexts: Vec<Context<V>>,
}

/// Moves device-produced spans into host memory with overlapped copies.
pub struct TransferPipeline {
    contexts_per_worker: usize,
    max_context_bytes: usize,
    runner: ParallelDispatcher,
    copier: ParallelDispatcher,
}

impl TransferPipeline {
    /// Create a pipeline for `n_workers` device workers.
    pub fn new(n_workers: usize, config: &TransferConfig) -> QprocResult<Self> {
        let n_workers = n_workers.max(1);
        let n_copy_workers =
            (default_workers() / n_workers).clamp(1, config.max_copy_workers.max(1));
        debug!(n_workers, n_copy_workers, "transfer pipeline created");
        Ok(Self {
            contexts_per_worker: config.contexts_per_worker.max(2),
            max_context_bytes: config.max_context_bytes,
            runner: ParallelDispatcher::new(Some(n_workers))?,
            copier: ParallelDispatcher::new(Some(n_copy_workers))?,
        })
    }

    /// Staging contexts per worker.
    pub fn contexts_per_worker(&self) -> usize {
        self.contexts_per_worker
    }

    /// Compute strides for moving `[begin, end)` through `workers`.
    pub fn plan<V>(&self, workers: &[DeviceWorker], begin: u64, end: u64) -> QprocResult<TransferPlan> {
        let n_contexts = self.contexts_per_worker as u64;
        let element = std::mem::size_of::<V>().max(1);

        let (device, remaining) = workers
            .iter()
            .map(|w| (w.device().id(), w.device().host_store().remaining()))
            .min_by_key(|&(_, remaining)| remaining)
            .unwrap_or((0, 0));
        let capacity = remaining.min(self.max_context_bytes);

        let mut exec_stride = (capacity / element) as u64 / n_contexts;
        if exec_stride >= EXEC_STRIDE_ALIGN {
            exec_stride -= exec_stride % EXEC_STRIDE_ALIGN;
        }
        if exec_stride == 0 {
            return Err(QprocError::HostMemoryExhausted {
                device,
                requested: element * self.contexts_per_worker,
                remaining,
            });
        }

        let span = end - begin;
        let worker_stride = span.div_ceil(workers.len().max(1) as u64);
        let ctx_stride = worker_stride.div_ceil(n_contexts);
        Ok(TransferPlan {
            worker_stride,
            ctx_stride,
            exec_stride,
        })
    }

    /// Fill `out` with the values `producer` generates on the devices for
    /// `[begin, end)`; `out[i]` receives index `begin + i`.
    ///
    /// The producer is called on a device thread with a staging slice and the
    /// global range it covers.
    #[instrument(skip(self, out, workers, producer), fields(n_workers = workers.len()))]
    pub fn run_d2h<V, P>(
        &self,
        out: &mut [V],
        workers: &[DeviceWorker],
        begin: u64,
        end: u64,
        producer: Arc<P>,
    ) -> QprocResult<()>
    where
        V: Copy + Default + Send + Sync + 'static,
        P: Fn(&mut [V], u64, u64) + Send + Sync + 'static,
    {
        assert_eq!(
            out.len() as u64,
            end - begin,
            "output length must match the transferred span"
        );
        if begin == end || workers.is_empty() {
            return Ok(());
        }

        let plan = self.plan::<V>(workers, begin, end)?;
        trace!(?plan, "transfer planned");
        let n_contexts = self.contexts_per_worker as u64;

        let mut shares = Vec::with_capacity(workers.len());
        let mut rest = out;
        let mut allocated: QprocResult<()> = Ok(());
        for (worker_idx, worker) in workers.iter().enumerate() {
            let share_begin = (plan.ctx_stride * n_contexts * worker_idx as u64 + begin).min(end);
            let share_end = (share_begin + plan.ctx_stride * n_contexts).min(end);
            let (share_out, tail) =
                std::mem::take(&mut rest).split_at_mut((share_end - share_begin) as usize);
            rest = tail;

            let mut contexts = Vec::with_capacity(self.contexts_per_worker);
            for ictx in 0..n_contexts {
                let span_idx = n_contexts * worker_idx as u64 + ictx;
                let ctx_begin = (plan.ctx_stride * span_idx + begin).min(end);
                let ctx_end = (ctx_begin + plan.ctx_stride).min(end);
                let buffer = match worker.device().host_store().allocate::<V>(plan.exec_stride as usize) {
                    Ok(buffer) => Some(buffer),
                    Err(e) => {
                        allocated = Err(e);
                        None
                    }
                };
                let mut ctx = Context {
                    worker: worker_idx,
                    charged: buffer.is_some(),
                    buffer,
                    running: None,
                    ctx_end: 0,
                    cur_begin: 0,
                    cur_end: 0,
                    stride: plan.exec_stride,
                };
                ctx.set_span(ctx_begin, ctx_end);
                contexts.push(ctx);
            }
            shares.push(Mutex::new(Some(WorkerShare {
                out: share_out,
                out_begin: share_begin,
                contexts,
            })));
        }

        let outcomes: Vec<(Vec<Context<V>>, QprocResult<()>)> = if allocated.is_ok() {
            let n_runners = self.runner.n_workers();
            self.runner
                .run_collect(|runner_idx| {
                    (runner_idx..shares.len())
                        .step_by(n_runners)
                        .filter_map(|worker_idx| {
                            let mut share = shares[worker_idx]
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .take()?;
                            let outcome = self.run_queue(&mut share, &workers[worker_idx], &producer);
                            Some((share.contexts, outcome))
                        })
                        .collect::<Vec<_>>()
                })
                .into_iter()
                .flatten()
                .collect()
        } else {
            shares
                .into_iter()
                .filter_map(|s| s.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner))
                .map(|share| (share.contexts, Ok(())))
                .collect()
        };

        // Staging buffers go back to the host stores for the next transfer,
        // including after a failure.
        let mut first_error = allocated.err();
        for (contexts, outcome) in outcomes {
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
            for ctx in contexts {
                let mut store = workers[ctx.worker].device().host_store();
                match ctx.buffer {
                    Some(buffer) => store.release(buffer),
                    // Lost with a faulted job.
                    None if ctx.charged => {
                        store.discard(ctx.stride as usize * std::mem::size_of::<V>());
                    }
                    None => {}
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn run_queue<V, P>(
        &self,
        share: &mut WorkerShare<'_, V>,
        worker: &DeviceWorker,
        producer: &Arc<P>,
    ) -> QprocResult<()>
    where
        V: Copy + Send + Sync + 'static,
        P: Fn(&mut [V], u64, u64) + Send + Sync + 'static,
    {
        let mut running = VecDeque::with_capacity(share.contexts.len());
        for (idx, ctx) in share.contexts.iter_mut().enumerate() {
            if ctx.launch(worker, producer) {
                running.push_back(idx);
            }
        }
        // After a failure the remaining contexts are drained so their
        // buffers come back, but not relaunched.
        let mut first_error = None;
        while let Some(idx) = running.pop_front() {
            let ctx = &mut share.contexts[idx];
            if let Err(e) = ctx.sync_and_copy(share.out, share.out_begin, &self.copier) {
                first_error.get_or_insert(e);
                continue;
            }
            if first_error.is_some() {
                continue;
            }
            ctx.update_span();
            if ctx.launch(worker, producer) {
                running.push_back(idx);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    fn workers(n: usize, host_store_bytes: usize) -> Vec<DeviceWorker> {
        (0..n)
            .map(|id| DeviceWorker::spawn(Arc::new(Device::new(id, 1 << 20, host_store_bytes))).unwrap())
            .collect()
    }

    #[test]
    fn test_plan_follows_smallest_store() {
        let pipeline = TransferPipeline::new(2, &TransferConfig::default()).unwrap();
        let mut ws = workers(2, 1 << 20);
        ws.push(DeviceWorker::spawn(Arc::new(Device::new(2, 1 << 20, 64 << 10))).unwrap());
        let plan = pipeline.plan::<u64>(&ws, 0, 10_000).unwrap();
        // 64 KiB / 8 bytes / 2 contexts = 4096 elements.
        assert_eq!(plan.exec_stride, 4096);
        assert_eq!(plan.worker_stride, 3334);
        assert_eq!(plan.ctx_stride, 1667);
    }

    #[test]
    fn test_plan_caps_context_memory() {
        let config = TransferConfig {
            max_context_bytes: 48 << 10,
            ..TransferConfig::default()
        };
        let pipeline = TransferPipeline::new(1, &config).unwrap();
        let plan = pipeline.plan::<u64>(&workers(1, 1 << 20), 0, 100).unwrap();
        // 48 KiB / 8 / 2 = 3072, already a multiple of 1024.
        assert_eq!(plan.exec_stride, 3072);
    }

    #[test]
    fn test_empty_store_is_exhaustion() {
        let pipeline = TransferPipeline::new(1, &TransferConfig::default()).unwrap();
        let err = pipeline.plan::<u64>(&workers(1, 8), 0, 100).unwrap_err();
        assert!(matches!(err, QprocError::HostMemoryExhausted { .. }));
    }

    #[test]
    fn test_buffers_return_to_store() {
        let pipeline = TransferPipeline::new(1, &TransferConfig::default()).unwrap();
        let ws = workers(1, 1 << 16);
        let mut out = vec![0u64; 5000];
        pipeline
            .run_d2h(&mut out, &ws, 0, 5000, Arc::new(|buf: &mut [u64], b: u64, _e: u64| {
                for (i, v) in buf.iter_mut().enumerate() {
                    *v = b + i as u64;
                }
            }))
            .unwrap();
        assert_eq!(out, (0..5000).collect::<Vec<_>>());
        let store = ws[0].device().host_store();
        assert_eq!(store.remaining(), 1 << 16);
        assert_eq!(store.used(), 1 << 16);
    }

    #[test]
    fn test_producer_fault_surfaces() {
        let pipeline = TransferPipeline::new(1, &TransferConfig::default()).unwrap();
        let ws = workers(1, 1 << 16);
        let mut out = vec![0u32; 10];
        let err = pipeline
            .run_d2h(&mut out, &ws, 0, 10, Arc::new(|_: &mut [u32], _: u64, _: u64| {
                panic!("device fault")
            }))
            .unwrap_err();
        assert!(matches!(err, QprocError::DeviceFault { .. }));

        // Both staging buffers were lost with their jobs.
        let store = ws[0].device().host_store();
        assert_eq!(store.used(), 0);
        assert_eq!(store.remaining(), 1 << 16);
    }
}
