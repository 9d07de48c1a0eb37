//! Transfer pipeline output must equal a plain synchronous copy.

mod common;

use std::sync::Arc;

use arvak_qproc::TransferConfig;
use arvak_qproc::device::{Device, DeviceWorker};
use arvak_qproc::transfer::TransferPipeline;
use common::init_tracing;
use proptest::prelude::*;

fn value_at(idx: u64) -> u64 {
    idx.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ 0x5555
}

fn workers(n: usize) -> Vec<DeviceWorker> {
    (0..n)
        .map(|id| DeviceWorker::spawn(Arc::new(Device::new(id, 1 << 20, 1 << 16))).unwrap())
        .collect()
}

/// `contexts` staging contexts of `capacity` u64 values each.
fn pipeline(n_workers: usize, contexts: usize, capacity: usize) -> TransferPipeline {
    let config = TransferConfig {
        contexts_per_worker: contexts,
        max_context_bytes: capacity * contexts * std::mem::size_of::<u64>(),
        max_copy_workers: 2,
    };
    TransferPipeline::new(n_workers, &config).unwrap()
}

fn transfer(pipeline: &TransferPipeline, workers: &[DeviceWorker], begin: u64, end: u64) -> Vec<u64> {
    let mut out = vec![0u64; (end - begin) as usize];
    let producer = |staged: &mut [u64], span_begin: u64, span_end: u64| {
        assert_eq!(staged.len() as u64, span_end - span_begin);
        for (i, v) in staged.iter_mut().enumerate() {
            *v = value_at(span_begin + i as u64);
        }
    };
    pipeline
        .run_d2h(&mut out, workers, begin, end, Arc::new(producer))
        .unwrap();
    out
}

fn direct(begin: u64, end: u64) -> Vec<u64> {
    (begin..end).map(value_at).collect()
}

#[test]
fn test_boundary_spans_match_direct_copy() {
    init_tracing();
    let capacity = 32;
    let workers = workers(2);
    let pipeline = pipeline(workers.len(), 2, capacity);
    assert_eq!(
        pipeline.plan::<u64>(&workers, 0, 1).unwrap().exec_stride,
        capacity as u64
    );

    let capacity = capacity as u64;
    for span in [0, 1, capacity, 7 * capacity + 5] {
        for begin in [0, 3] {
            let end = begin + span;
            assert_eq!(
                transfer(&pipeline, &workers, begin, end),
                direct(begin, end),
                "span {span} at {begin}"
            );
        }
    }
}

#[test]
fn test_single_worker_many_rounds() {
    init_tracing();
    let workers = workers(1);
    let pipeline = pipeline(1, 3, 4);
    assert_eq!(transfer(&pipeline, &workers, 10, 1010), direct(10, 1010));
}

#[test]
fn test_pipeline_is_reusable() {
    init_tracing();
    let workers = workers(3);
    let pipeline = pipeline(3, 2, 16);
    for _ in 0..4 {
        assert_eq!(transfer(&pipeline, &workers, 5, 500), direct(5, 500));
    }
    for worker in &workers {
        assert_eq!(worker.device().host_store().remaining(), 1 << 16);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_any_span_matches_direct_copy(
        n_workers in 1_usize..=4,
        contexts in 2_usize..=4,
        capacity in 1_usize..=48,
        begin in 0_u64..100,
        span in 0_u64..600,
    ) {
        init_tracing();
        let workers = workers(n_workers);
        let pipeline = pipeline(n_workers, contexts, capacity);
        prop_assert_eq!(
            transfer(&pipeline, &workers, begin, begin + span),
            direct(begin, begin + span)
        );
    }
}
