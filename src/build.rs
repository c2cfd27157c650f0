//! Recursive bulk builder: turns a sorted, duplicate-free key/value array
//! into a subtree by fitting a model per segment and sweeping keys into the
//! slots it predicts. Consecutive keys that collide on a slot become a child
//! segment, built by the same loop off an explicit work stack.

use crate::kv::{Key, Value};
use crate::model::fit_segment;
use crate::node::{alloc_node, build_two, Node, TwoNodePool};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals over every model fit performed by this index.
pub(crate) struct FitCounters {
    pub fmcd_success: AtomicU64,
    pub fmcd_broken: AtomicU64,
}

impl FitCounters {
    pub(crate) fn new() -> Self {
        Self {
            fmcd_success: AtomicU64::new(0),
            fmcd_broken: AtomicU64::new(0),
        }
    }
}

pub(crate) struct Builder<'a, K: Key, V: Value> {
    pub pool: &'a TwoNodePool<K, V>,
    pub counters: &'a FitCounters,
    pub use_fmcd: bool,
    pub build_lr_remain: f64,
}

/// Where a finished segment's node gets attached.
enum Attach<K: Key, V: Value> {
    Root,
    Child {
        parent: *mut Node<K, V>,
        pos: usize,
    },
}

struct Segment<K: Key, V: Value> {
    begin: usize,
    end: usize,
    attach: Attach<K, V>,
}

impl<'a, K: Key, V: Value> Builder<'a, K, V> {
    /// Build a subtree over `keys`/`values` (ascending, unique, len >= 2)
    /// and return its root. The result is unpublished; the caller decides
    /// where it becomes visible.
    pub(crate) fn build_bulk(&self, keys: &[K], values: &[V]) -> *mut Node<K, V> {
        debug_assert_eq!(keys.len(), values.len());
        debug_assert!(keys.len() >= 2);

        let mut root: *mut Node<K, V> = std::ptr::null_mut();
        let mut stack = vec![Segment {
            begin: 0,
            end: keys.len(),
            attach: Attach::Root,
        }];

        while let Some(Segment { begin, end, attach }) = stack.pop() {
            debug_assert!(end - begin >= 2);
            let built = if end - begin == 2 {
                build_two(
                    self.pool,
                    keys[begin],
                    values[begin],
                    keys[begin + 1],
                    values[begin + 1],
                )
            } else {
                self.build_segment(keys, values, begin, end, &mut stack)
            };

            match attach {
                Attach::Root => root = built,
                Attach::Child { parent, pos } => unsafe {
                    (*parent).store_child(pos, built);
                },
            }
        }

        debug_assert!(!root.is_null());
        root
    }

    fn build_segment(
        &self,
        keys: &[K],
        values: &[V],
        begin: usize,
        end: usize,
        stack: &mut Vec<Segment<K, V>>,
    ) -> *mut Node<K, V> {
        let seg_keys = &keys[begin..end];
        let size = end - begin;

        let fit = fit_segment(seg_keys, self.use_fmcd, self.build_lr_remain);
        if self.use_fmcd {
            if fit.fmcd_broken {
                self.counters.fmcd_broken.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.fmcd_success.fetch_add(1, Ordering::Relaxed);
            }
        }

        let fixed = size > 1_000_000;
        let ptr = alloc_node::<K, V>(fit.model, fit.num_items, size, fixed);
        let node = unsafe { &*ptr };

        // Sweep left to right, grouping runs of keys that predict into the
        // same slot. Singletons become leaves, longer runs become child
        // segments.
        let mut item_i = node.predict(seg_keys[0]);
        let mut offset = 0usize;
        while offset < size {
            let mut next = offset + 1;
            let mut next_i = 0usize;
            while next < size {
                next_i = node.predict(seg_keys[next]);
                if next_i == item_i {
                    next += 1;
                } else {
                    break;
                }
            }
            if next == offset + 1 {
                node.clear_none(item_i);
                unsafe { node.store_entry(item_i, seg_keys[offset], values[begin + offset]) };
            } else {
                node.clear_none(item_i);
                node.set_child_bit(item_i);
                stack.push(Segment {
                    begin: begin + offset,
                    end: begin + next,
                    attach: Attach::Child { parent: ptr, pos: item_i },
                });
            }
            if next >= size {
                break;
            }
            item_i = next_i;
            offset = next;
        }

        ptr
    }
}

#[cfg(test)]
mod build_tests {
    use super::*;
    use crate::node::destroy_subtree;

    fn builder<'a>(
        pool: &'a TwoNodePool<u64, u64>,
        counters: &'a FitCounters,
    ) -> Builder<'a, u64, u64> {
        Builder {
            pool,
            counters,
            use_fmcd: true,
            build_lr_remain: 0.0,
        }
    }

    /// Walk a built subtree checking its structural invariants and
    /// returning the in-order entries.
    fn check_subtree(ptr: *mut Node<u64, u64>) -> Vec<(u64, u64)> {
        let node = unsafe { &*ptr };
        let mut entries = Vec::new();
        let mut own_leaves = 0usize;
        let mut child_sizes = 0usize;
        for pos in 0..node.num_items {
            if node.is_none(pos) {
                assert!(!node.is_child(pos), "none slot with child bit at {pos}");
            } else if node.is_child(pos) {
                let child = unsafe { node.child_at(pos) };
                child_sizes += unsafe { &*child }.subtree_size();
                entries.extend(check_subtree(child));
            } else {
                let (key, value) = unsafe { node.entry_at(pos) };
                assert_eq!(node.predict(key), pos, "leaf {key} not on predicted slot");
                own_leaves += 1;
                entries.push((key, value));
            }
        }
        assert_eq!(node.subtree_size(), own_leaves + child_sizes);
        entries
    }

    #[test]
    fn bulk_build_roundtrip() {
        let pool = TwoNodePool::new();
        let counters = FitCounters::new();
        let keys: Vec<u64> = (0..5_000).map(|i| i * 3 + 7).collect();
        let values: Vec<u64> = (0..5_000).collect();

        let root = builder(&pool, &counters).build_bulk(&keys, &values);
        let entries = check_subtree(root);
        assert_eq!(entries.len(), keys.len());
        for (i, (key, value)) in entries.into_iter().enumerate() {
            assert_eq!(key, keys[i]);
            assert_eq!(value, values[i]);
        }
        assert!(counters.fmcd_success.load(Ordering::Relaxed) > 0);
        unsafe { destroy_subtree(root, &pool) };
    }

    #[test]
    fn bulk_build_two_pair_input() {
        let pool = TwoNodePool::new();
        let counters = FitCounters::new();
        let root = builder(&pool, &counters).build_bulk(&[4, 9], &[40, 90]);
        assert!(unsafe { &*root }.is_two);
        assert_eq!(check_subtree(root), vec![(4, 40), (9, 90)]);
        unsafe { destroy_subtree(root, &pool) };
    }

    #[test]
    fn clustered_keys_build_nested_children() {
        let pool = TwoNodePool::new();
        let counters = FitCounters::new();
        // A run of adjacent keys inside a sparse span collides on slots and
        // has to recurse.
        let mut keys: Vec<u64> = (0..64u64).map(|i| i * 1_000_000).collect();
        keys.extend(64_000_000..64_000_256u64);
        keys.sort_unstable();
        let values: Vec<u64> = (0..keys.len() as u64).collect();

        let root = builder(&pool, &counters).build_bulk(&keys, &values);
        let entries = check_subtree(root);
        assert_eq!(entries.len(), keys.len());
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        unsafe { destroy_subtree(root, &pool) };
    }
}
