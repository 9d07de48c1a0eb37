//! Range kernels over a state vector.
//!
//! Every kernel takes a half-open range of *work indices*. For a lane `l` a
//! work index `i` stands for the amplitude pair `idx0 = insert_zero_bit(i, l)`
//! and `idx1 = idx0 | 1 << l`, so disjoint work ranges touch disjoint
//! amplitudes and can run concurrently without locks.

use num_complex::Complex;
use num_traits::{One, Zero};

use crate::bitperm::BitPermTable;
use crate::precision::Real;
use crate::state::StateView;

/// Terms summed directly before the pairwise reduction splits.
const PAIRWISE_BLOCK: u64 = 64;

/// Insert a zero bit at position `lane`, shifting higher bits up.
#[inline]
pub fn insert_zero_bit(idx: u64, lane: u32) -> u64 {
    let low = idx & ((1 << lane) - 1);
    let high = (idx >> lane) << (lane + 1);
    high | low
}

/// Sum `f(i)` over `[begin, end)` by recursive halving.
///
/// Round-off grows with the depth of the tree, O(log N), instead of with the
/// number of terms.
pub fn pairwise_sum<R: Real>(begin: u64, end: u64, f: &impl Fn(u64) -> R) -> R {
    if end - begin <= PAIRWISE_BLOCK {
        return (begin..end).fold(R::zero(), |acc, i| acc + f(i));
    }
    let mid = begin + (end - begin) / 2;
    pairwise_sum(begin, mid, f) + pairwise_sum(mid, end, f)
}

/// Pairwise reduction of partial sums.
pub fn pairwise_reduce<R: Real>(values: &[R]) -> R {
    match values {
        [] => R::zero(),
        [v] => *v,
        _ => {
            let (lo, hi) = values.split_at(values.len() / 2);
            pairwise_reduce(lo) + pairwise_reduce(hi)
        }
    }
}

/// Apply `mat` to every amplitude pair of `lane`.
pub fn apply_unary_gate<R: Real>(
    view: &StateView<R>,
    mat: &[Complex<R>; 4],
    lane: u32,
    begin: u64,
    end: u64,
) {
    let bit = 1u64 << lane;
    for i in begin..end {
        let idx0 = insert_zero_bit(i, lane);
        let idx1 = idx0 | bit;
        // SAFETY: work index `i` exclusively owns `idx0` and `idx1`.
        unsafe { rotate(view, mat, idx0, idx1) };
    }
}

/// Apply `mat` to the pairs of `target_bit` whose `control_bits` are all set.
///
/// Work indices run over `[0, perm.n_indices())`; `perm` must exclude every
/// control bit and the target bit.
pub fn apply_control_gate<R: Real>(
    view: &StateView<R>,
    mat: &[Complex<R>; 4],
    perm: &BitPermTable,
    control_bits: u64,
    target_bit: u64,
    begin: u64,
    end: u64,
) {
    for i in begin..end {
        let idx0 = perm.permute(i) | control_bits;
        let idx1 = idx0 | target_bit;
        // SAFETY: `permute` is injective, so work index `i` owns both slots.
        unsafe { rotate(view, mat, idx0, idx1) };
    }
}

#[inline]
unsafe fn rotate<R: Real>(view: &StateView<R>, mat: &[Complex<R>; 4], idx0: u64, idx1: u64) {
    // SAFETY: forwarded from the caller.
    unsafe {
        let a0 = view.load(idx0);
        let a1 = view.load(idx1);
        view.store(idx0, mat[0] * a0 + mat[1] * a1);
        view.store(idx1, mat[2] * a0 + mat[3] * a1);
    }
}

/// Sum of `|a|²` over the amplitudes whose `lane` bit is 1.
pub fn calc_prob<R: Real>(view: &StateView<R>, lane: u32, begin: u64, end: u64) -> R {
    let bit = 1u64 << lane;
    pairwise_sum(begin, end, &|i| {
        // SAFETY: reads only; no writer runs during a reduction.
        unsafe { view.load(insert_zero_bit(i, lane) | bit) }.norm_sqr()
    })
}

/// Collapse `lane` onto 0: zero the lane-1 half and scale the rest by
/// `1/√prob`.
pub fn measure_set0<R: Real>(view: &StateView<R>, lane: u32, prob: R, begin: u64, end: u64) {
    collapse(view, lane, prob, false, begin, end);
}

/// Collapse `lane` onto 1: zero the lane-0 half and scale the rest by
/// `1/√prob`.
pub fn measure_set1<R: Real>(view: &StateView<R>, lane: u32, prob: R, begin: u64, end: u64) {
    collapse(view, lane, prob, true, begin, end);
}

fn collapse<R: Real>(view: &StateView<R>, lane: u32, prob: R, one: bool, begin: u64, end: u64) {
    let bit = 1u64 << lane;
    let norm = R::one() / prob.sqrt();
    for i in begin..end {
        let idx0 = insert_zero_bit(i, lane);
        let (keep, cleared) = if one { (idx0 | bit, idx0) } else { (idx0, idx0 | bit) };
        // SAFETY: work index `i` exclusively owns both slots.
        unsafe {
            view.store(keep, view.load(keep) * norm);
            view.store(cleared, Complex::zero());
        }
    }
}

/// Move the lane-1 amplitude into the lane-0 slot and clear the lane-1 slot.
///
/// Meant for a lane that has already been collapsed.
pub fn apply_reset<R: Real>(view: &StateView<R>, lane: u32, begin: u64, end: u64) {
    let bit = 1u64 << lane;
    for i in begin..end {
        let idx0 = insert_zero_bit(i, lane);
        let idx1 = idx0 | bit;
        // SAFETY: work index `i` exclusively owns both slots.
        unsafe {
            view.store(idx0, view.load(idx1));
            view.store(idx1, Complex::zero());
        }
    }
}

/// Zero global indices `[begin, end)`.
pub fn fill_zero<R: Real>(view: &StateView<R>, begin: u64, end: u64) {
    for idx in begin..end {
        // SAFETY: the range is owned by the caller.
        unsafe { view.store(idx, Complex::zero()) };
    }
}

/// Write a single amplitude.
pub fn set<R: Real>(view: &StateView<R>, idx: u64, value: Complex<R>) {
    // SAFETY: called with no concurrent task on this state.
    unsafe { view.store(idx, value) };
}

/// Copy the `value` half of `lane` from `src` into the one-lane-smaller `dst`,
/// scaled by `1/√prob`. Work indices are indices of `dst`.
pub fn copy_collapsed<R: Real>(
    src: &StateView<R>,
    dst: &StateView<R>,
    lane: u32,
    value: u32,
    prob: R,
    begin: u64,
    end: u64,
) {
    let bit = u64::from(value) << lane;
    let norm = R::one() / prob.sqrt();
    for i in begin..end {
        // SAFETY: `src` is only read; `i` is owned in `dst`.
        unsafe {
            let amp = src.load(insert_zero_bit(i, lane) | bit);
            dst.store(i, amp * norm);
        }
    }
}

/// Tensor product of independent states, little-endian: the first part
/// occupies the lowest lanes.
#[derive(Clone)]
pub struct ProductLayout<R: Real> {
    parts: Vec<(StateView<R>, u32)>,
    n_lanes: u32,
}

impl<R: Real> ProductLayout<R> {
    /// Build the layout; part `k` is shifted by the lane count of the parts
    /// before it.
    pub fn new(views: Vec<StateView<R>>) -> Self {
        let mut offset = 0;
        let parts = views
            .into_iter()
            .map(|view| {
                let shift = offset;
                offset += view.n_lanes();
                (view, shift)
            })
            .collect();
        Self {
            parts,
            n_lanes: offset,
        }
    }

    /// Total lane count of the parts.
    pub fn n_lanes(&self) -> u32 {
        self.n_lanes
    }

    /// Product amplitude at joint index `idx`. Indices with bits above the
    /// parts' lanes are zero.
    #[inline]
    pub fn amplitude(&self, idx: u64) -> Complex<R> {
        if idx >> self.n_lanes != 0 {
            return Complex::zero();
        }
        self.parts.iter().fold(Complex::one(), |acc, (view, shift)| {
            let local = (idx >> shift) & (view.n_states() - 1);
            // SAFETY: parts are read-only while the product is formed.
            acc * unsafe { view.load(local) }
        })
    }
}

/// Write the product of `layout` into `dst` for global indices `[begin, end)`.
pub fn write_product<R: Real>(layout: &ProductLayout<R>, dst: &StateView<R>, begin: u64, end: u64) {
    for idx in begin..end {
        // SAFETY: the range of `dst` is owned by the caller.
        unsafe { dst.store(idx, layout.amplitude(idx)) };
    }
}
