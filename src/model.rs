//! Per-node linear models and the fitting algorithms that produce them.
//!
//! A node's model maps a key straight to a slot index: `a * key + b`,
//! clamped to the slot range. Fitting happens on a sorted key segment at
//! build time, either with the maximum-conflict-degree method (FMCD) or
//! with a two-anchor fallback through the 1/3 and 2/3 quantiles.

use crate::kv::{to_f64, Key};

/// Slot-position model. `a` is non-negative for every non-degenerate node,
/// which is what keeps the tree order-preserving.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LinearModel {
    pub a: f64,
    pub b: f64,
}

impl LinearModel {
    pub(crate) fn predict_double<K: Key>(&self, key: K) -> f64 {
        self.a * to_f64(key) + self.b
    }

    /// Slot index for `key` in a node with `num_items` slots. Pathological
    /// keys whose projection blows past the integer range clamp to the last
    /// slot instead of overflowing.
    #[inline]
    pub(crate) fn predict<K: Key>(&self, key: K, num_items: usize) -> usize {
        let v = self.predict_double(key);
        if v > (i64::MAX / 2) as f64 {
            return num_items - 1;
        }
        if v < 0.0 {
            return 0;
        }
        (num_items - 1).min(v as usize)
    }
}

/// Target density multiplier for built slot arrays; small segments get more
/// slack, huge ones stay tight.
pub(crate) fn gap_factor(size: usize) -> usize {
    if size >= 1_000_000 {
        1
    } else if size >= 100_000 {
        2
    } else {
        5
    }
}

/// A fitted model together with the slot capacity it was fitted for.
pub(crate) struct SegmentFit {
    pub model: LinearModel,
    pub num_items: usize,
    /// True when FMCD gave up and the two-anchor fallback was used.
    pub fmcd_broken: bool,
}

/// Fit a model over a sorted, duplicate-free key segment with more than two
/// keys. Panics if the fit degenerates to a non-finite or negative slope,
/// which only malformed (unsorted/duplicated) input can produce.
pub(crate) fn fit_segment<K: Key>(keys: &[K], use_fmcd: bool, build_lr_remain: f64) -> SegmentFit {
    let size = keys.len();
    debug_assert!(size > 2);
    let gap = gap_factor(size);

    let (model, num_items, fmcd_broken) = if use_fmcd {
        match fmcd_fit(keys, gap) {
            Some((model, num_items)) => (model, num_items, false),
            None => {
                let (model, num_items) = three_point_fit(keys, gap);
                (model, num_items, true)
            }
        }
    } else {
        let (model, num_items) = three_point_fit(keys, gap);
        (model, num_items, false)
    };

    assert!(model.a.is_finite() && model.b.is_finite(), "degenerate model fit");
    assert!(model.a >= 0.0, "model slope must be non-negative");

    // Symmetric left/right padding, folded into the intercept.
    let lr_remains = (size as f64 * build_lr_remain) as usize;
    SegmentFit {
        model: LinearModel {
            a: model.a,
            b: model.b + lr_remains as f64,
        },
        num_items: num_items + lr_remains * 2,
        fmcd_broken,
    }
}

/// FMCD: find the largest slope such that no two keys `D` apart land closer
/// than one slot, growing the conflict degree `D` until the key spacing
/// admits it. Gives up ("broken") when `3D` exceeds the segment.
///
/// `Ut` carries a small additive epsilon so the final `a = 1/Ut` stays
/// strictly below the derived bound.
fn fmcd_fit<K: Key>(keys: &[K], gap: usize) -> Option<(LinearModel, usize)> {
    let size = keys.len();
    let l = size * (gap + 1);

    let mut i = 0usize;
    let mut d = 1usize;
    debug_assert!(d <= size - 1 - d);
    let spacing = |d: usize| (to_f64(keys[size - 1 - d]) - to_f64(keys[d])) / ((l - 2) as f64) + 1e-6;
    let mut ut = spacing(d);
    while i < size - 1 - d {
        while i + d < size && to_f64(keys[i + d]) - to_f64(keys[i]) >= ut {
            i += 1;
        }
        if i + d >= size {
            break;
        }
        d += 1;
        if d * 3 > size {
            break;
        }
        debug_assert!(d <= size - 1 - d);
        ut = spacing(d);
    }

    if d * 3 <= size {
        let a = 1.0 / ut;
        let b = (l as f64 - a * (to_f64(keys[size - 1 - d]) + to_f64(keys[d]))) / 2.0;
        Some((LinearModel { a, b }, l))
    } else {
        None
    }
}

/// Fallback fit through two anchor points at the 1/3 and 2/3 ranks, each
/// anchored between a key and its successor. Target arithmetic is integer
/// (matching the slot grid) before widening.
fn three_point_fit<K: Key>(keys: &[K], gap: usize) -> (LinearModel, usize) {
    let size = keys.len();
    let mid1_pos = (size - 1) / 3;
    let mid2_pos = (size - 1) * 2 / 3;
    debug_assert!(mid1_pos < mid2_pos);
    debug_assert!(mid2_pos < size - 1);

    let mid1_key = (to_f64(keys[mid1_pos]) + to_f64(keys[mid1_pos + 1])) / 2.0;
    let mid2_key = (to_f64(keys[mid2_pos]) + to_f64(keys[mid2_pos + 1])) / 2.0;

    let num_items = size * (gap + 1);
    let half = (gap + 1) / 2;
    let mid1_target = (mid1_pos * (gap + 1) + half) as f64;
    let mid2_target = (mid2_pos * (gap + 1) + half) as f64;

    let a = (mid2_target - mid1_target) / (mid2_key - mid1_key);
    let b = mid1_target - a * mid1_key;
    (LinearModel { a, b }, num_items)
}

#[cfg(test)]
mod model_tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rand_distr::Uniform;

    fn sorted_unique_keys(size: usize, seed: u64) -> Vec<u64> {
        let range = Uniform::new(0u64, u64::MAX / 2);
        let mut keys: Vec<u64> = StdRng::seed_from_u64(seed)
            .sample_iter(&range)
            .take(size * 2)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys.truncate(size);
        assert_eq!(keys.len(), size);
        keys
    }

    #[test]
    fn predict_clamps_to_slot_range() {
        let model = LinearModel { a: 1.0, b: 0.0 };
        assert_eq!(model.predict(0u64, 8), 0);
        assert_eq!(model.predict(3u64, 8), 3);
        assert_eq!(model.predict(100u64, 8), 7);
    }

    #[test]
    fn predict_guards_overflow() {
        // Tightly packed keys produce a steep slope; a key far outside the
        // built range must clamp to the last slot, not overflow.
        let keys: Vec<u64> = (0..8).collect();
        let fit = fit_segment(&keys, true, 0.0);
        let pos = fit.model.predict(1_000_000_000u64, fit.num_items);
        assert_eq!(pos, fit.num_items - 1);
    }

    #[test]
    fn predict_clamps_negative_projection() {
        let model = LinearModel { a: 2.0, b: -100.0 };
        assert_eq!(model.predict(1u64, 16), 0);
    }

    #[test]
    fn fmcd_succeeds_on_uniform_keys() {
        let keys = sorted_unique_keys(10_000, 7);
        let fit = fit_segment(&keys, true, 0.0);
        assert!(!fit.fmcd_broken);
        assert!(fit.model.a > 0.0);
        assert_eq!(fit.num_items, keys.len() * (gap_factor(keys.len()) + 1));
    }

    #[test]
    fn fmcd_breaks_on_clustered_keys() {
        // Two dense clusters separated by a huge gap defeat the conflict
        // degree bound and force the fallback fit.
        let mut keys: Vec<u64> = (0..500).collect();
        keys.extend((0..500).map(|i| u64::MAX / 2 + i));
        let fit = fit_segment(&keys, true, 0.0);
        assert!(fit.fmcd_broken);
        assert!(fit.model.a.is_finite() && fit.model.a >= 0.0);
    }

    #[test]
    fn three_point_fit_orders_anchor_keys() {
        let keys = sorted_unique_keys(999, 21);
        let fit = fit_segment(&keys, false, 0.0);
        assert!(!fit.fmcd_broken);
        let lo = fit.model.predict(keys[0], fit.num_items);
        let hi = fit.model.predict(keys[keys.len() - 1], fit.num_items);
        assert!(lo < hi);
    }

    #[test]
    fn lr_remain_pads_symmetrically() {
        let keys = sorted_unique_keys(1_000, 3);
        let plain = fit_segment(&keys, true, 0.0);
        let padded = fit_segment(&keys, true, 0.1);
        let lr = (keys.len() as f64 * 0.1) as usize;
        assert_eq!(padded.num_items, plain.num_items + 2 * lr);
        assert_eq!(padded.model.b, plain.model.b + lr as f64);
    }

    #[test]
    fn gap_factor_tiers() {
        assert_eq!(gap_factor(10), 5);
        assert_eq!(gap_factor(99_999), 5);
        assert_eq!(gap_factor(100_000), 2);
        assert_eq!(gap_factor(999_999), 2);
        assert_eq!(gap_factor(1_000_000), 1);
    }
}
