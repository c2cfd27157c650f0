//! The index proper: optimistic reads, lock-coupled inserts, and adaptive
//! subtree rebuilds.
//!
//! Every descent is speculative. A reader snapshots each node's version,
//! reads through it, and re-validates before trusting anything; a writer
//! upgrades the terminal node's snapshot to a write lock for the one-slot
//! commit. Any validation failure anywhere restarts the whole operation
//! from the root after a short backoff. Rebuilds write-lock a subtree root,
//! freeze and scan the subtree, build a replacement, and retire the old
//! nodes through the epoch reclaimer.

use crate::build::{Builder, FitCounters};
use crate::entry::Entry;
use crate::epoch::{self, EpochGuard};
use crate::kv::{Key, Value};
use crate::lock::{restart_backoff, Lresult, Restart};
use crate::node::{
    build_none, build_two, destroy_subtree, free_erased, Node, TwoNodePool,
};
use itertools::Itertools;
use log::{debug, info};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Hard cap on insert descent depth; deeper trees indicate a broken model
/// fit and are treated as a structural error.
const MAX_DEPTH: usize = 128;

/// Construction-time tuning.
#[derive(Clone, Debug)]
pub struct Options {
    /// Fraction of extra left/right slot padding added to built nodes,
    /// in `[0, 0.5)`.
    pub build_lr_remain: f64,
    /// Use the FMCD fit, falling back to the three-point fit when it
    /// breaks; `false` selects the three-point fit unconditionally.
    pub use_fmcd: bool,
    /// Suppress informational log output from construction and bulk builds.
    pub quiet: bool,
    /// Number of two-key nodes to preallocate into the recycler.
    pub two_node_pool: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            build_lr_remain: 0.0,
            use_fmcd: true,
            quiet: true,
            two_node_pool: 1024,
        }
    }
}

/// Model-fit counters, as reported by [`Clipp::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FitStats {
    pub fmcd_success_times: u64,
    pub fmcd_broken_times: u64,
}

/// Leaf depth distribution, as reported by [`Clipp::depth_stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthStats {
    pub max_depth: usize,
    pub avg_depth: f64,
}

/// A concurrent learned index over primitive-integer keys.
///
/// Point lookups and point inserts may run under arbitrary concurrency.
/// Keys are assumed unique across inserts; bulk loads take strictly
/// ascending input. Values are stored by copy.
pub struct Clipp<K: Key, V: Value> {
    root: AtomicPtr<Node<K, V>>,
    pool: TwoNodePool<K, V>,
    counters: FitCounters,
    options: Options,
}

unsafe impl<K: Key, V: Value> Send for Clipp<K, V> {}
unsafe impl<K: Key, V: Value> Sync for Clipp<K, V> {}

impl<K: Key, V: Value> Default for Clipp<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> Clipp<K, V> {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        assert!(
            (0.0..0.5).contains(&options.build_lr_remain),
            "build_lr_remain must lie in [0, 0.5)"
        );
        let pool = TwoNodePool::new();
        pool.warm(options.two_node_pool);
        if !options.quiet {
            info!("two-node pool warmed with {} nodes", pool.len());
            if options.use_fmcd {
                info!("fmcd fitting enabled");
            }
        }
        Self {
            root: AtomicPtr::new(build_none()),
            pool,
            counters: FitCounters::new(),
            options,
        }
    }

    fn builder(&self) -> Builder<'_, K, V> {
        Builder {
            pool: &self.pool,
            counters: &self.counters,
            use_fmcd: self.options.use_fmcd,
            build_lr_remain: self.options.build_lr_remain,
        }
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        unsafe { &*self.root.load(Ordering::Acquire) }.subtree_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Value stored under `key`, skipping the existence check.
    ///
    /// The caller asserts the key is present; if it is not, the returned
    /// value is whatever the predicted slot holds.
    pub fn at(&self, key: K) -> V {
        let _guard = EpochGuard::new();
        let mut restart_count = 0;
        loop {
            match self.try_read(key, true) {
                Ok(value) => return value.unwrap(),
                Err(Restart) => {
                    restart_count += 1;
                    restart_backoff(restart_count);
                }
            }
        }
    }

    /// Validated lookup: `None` when the key is absent.
    pub fn get(&self, key: K) -> Option<V> {
        let _guard = EpochGuard::new();
        let mut restart_count = 0;
        loop {
            match self.try_read(key, false) {
                Ok(value) => return value,
                Err(Restart) => {
                    restart_count += 1;
                    restart_backoff(restart_count);
                }
            }
        }
    }

    pub fn exists(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// One validated descent. `skip_check` selects the fast path that
    /// trusts the caller about the key's presence.
    fn try_read(&self, key: K, skip_check: bool) -> Lresult<Option<V>> {
        let mut node = self.root.load(Ordering::Acquire);
        let mut version = unsafe { &*node }.lock.read_lock()?;
        // The root may have been replaced between the load and the lock.
        if self.root.load(Ordering::Acquire) != node {
            return Err(Restart);
        }

        let mut parent: Option<(*mut Node<K, V>, u64)> = None;
        loop {
            let n = unsafe { &*node };
            let pos = n.predict(key);

            if let Some((p, p_version)) = parent.take() {
                unsafe { &*p }.lock.read_unlock(p_version)?;
            }

            if n.is_child(pos) {
                let child = unsafe { n.child_at(pos) };
                // The snapshot must still hold, or the pointer is stale.
                n.lock.check(version)?;
                parent = Some((node, version));
                version = unsafe { &*child }.lock.read_lock()?;
                node = child;
            } else if skip_check {
                let (_, value) = unsafe { n.entry_at(pos) };
                n.lock.read_unlock(version)?;
                return Ok(Some(value));
            } else if n.is_none(pos) {
                n.lock.read_unlock(version)?;
                return Ok(None);
            } else {
                let (stored, value) = unsafe { n.entry_at(pos) };
                n.lock.read_unlock(version)?;
                return Ok((stored == key).then_some(value));
            }
        }
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Insert a key assumed not to be present. Inserting a duplicate key is
    /// a precondition violation and panics.
    pub fn insert(&self, key: K, value: V) {
        let _guard = EpochGuard::new();
        let mut path: Vec<*mut Node<K, V>> = Vec::with_capacity(16);
        let mut restart_count = 0;
        let insert_to_data = loop {
            path.clear();
            match self.descend_insert(key, value, &mut path) {
                Ok(flag) => break flag,
                Err(Restart) => {
                    // The optimistic counter bumps from the failed attempt
                    // must not survive, or quiescent accounting drifts.
                    for &p in &path {
                        let n = unsafe { &*p };
                        n.size.fetch_sub(1, Ordering::Relaxed);
                        n.num_inserts.fetch_sub(1, Ordering::Relaxed);
                    }
                    restart_count += 1;
                    restart_backoff(restart_count);
                }
            }
        };

        for &p in &path {
            unsafe { &*p }
                .num_insert_to_data
                .fetch_add(insert_to_data, Ordering::Relaxed);
        }

        self.adjust(&path, key);
    }

    /// Descend to the terminal slot and commit. Returns the
    /// slot-became-data flag; the traversed path (with its optimistic
    /// `size`/`num_inserts` bumps applied) accumulates in `path` either way.
    fn descend_insert(
        &self,
        key: K,
        value: V,
        path: &mut Vec<*mut Node<K, V>>,
    ) -> Lresult<u32> {
        let mut node = self.root.load(Ordering::Acquire);
        let mut version = unsafe { &*node }.lock.read_lock()?;
        if self.root.load(Ordering::Acquire) != node {
            return Err(Restart);
        }

        let mut parent: Option<(*mut Node<K, V>, u64)> = None;
        loop {
            assert!(path.len() < MAX_DEPTH, "insert path depth exceeded {MAX_DEPTH}");
            path.push(node);
            let n = unsafe { &*node };
            n.size.fetch_add(1, Ordering::Relaxed);
            n.num_inserts.fetch_add(1, Ordering::Relaxed);

            if let Some((p, p_version)) = parent.take() {
                unsafe { &*p }.lock.read_unlock(p_version)?;
            }

            let pos = n.predict(key);
            if n.is_none(pos) {
                n.lock.upgrade_to_write(version)?;
                n.clear_none(pos);
                unsafe { n.store_entry(pos, key, value) };
                n.lock.write_unlock();
                return Ok(0);
            } else if !n.is_child(pos) {
                n.lock.upgrade_to_write(version)?;
                let (other_key, other_value) = unsafe { n.entry_at(pos) };
                let two = build_two(&self.pool, key, value, other_key, other_value);
                unsafe { n.store_child(pos, two) };
                n.set_child_bit(pos);
                n.lock.write_unlock();
                return Ok(1);
            } else {
                parent = Some((node, version));
                let child = unsafe { n.child_at(pos) };
                n.lock.check(version)?;
                version = unsafe { &*child }.lock.read_lock()?;
                node = child;
            }
        }
    }

    // ------------------------------------------------------------------
    // Adaptive rebuild
    // ------------------------------------------------------------------

    /// Walk the insert path from the root down and rebuild the first node
    /// whose model has drifted. A rebuild higher up supersedes any deeper
    /// candidate, so the walk stops after one rebuild.
    fn adjust(&self, path: &[*mut Node<K, V>], key: K) {
        let mut restart_count = 0;
        'restart: loop {
            if restart_count > 0 {
                restart_backoff(restart_count);
            }
            for (i, &ptr) in path.iter().enumerate() {
                let node = unsafe { &*ptr };
                let version = match node.lock.read_lock() {
                    Ok(v) => v,
                    // Obsolete: a concurrent rebuild above already replaced
                    // this node and everything below it.
                    Err(Restart) => return,
                };

                let num_inserts = node.num_inserts.load(Ordering::Relaxed) as u64;
                let num_insert_to_data = node.num_insert_to_data.load(Ordering::Relaxed) as u64;
                let size = node.subtree_size();
                let need_rebuild = !node.fixed
                    && size >= node.build_size * 4
                    && size >= 64
                    && num_insert_to_data * 10 >= num_inserts;

                if !need_rebuild {
                    if node.lock.read_unlock(version).is_err() {
                        restart_count += 1;
                        continue 'restart;
                    }
                    continue;
                }

                if node.lock.upgrade_to_write(version).is_err() {
                    restart_count += 1;
                    continue 'restart;
                }
                let parent = if i > 0 { Some(path[i - 1]) } else { None };
                self.rebuild_subtree(ptr, parent, key);
                return;
            }
            return;
        }
    }

    /// Rebuild the write-locked subtree rooted at `ptr`, splice the
    /// replacement into `parent` (or the root pointer), and retire the old
    /// nodes through the epoch reclaimer.
    fn rebuild_subtree(&self, ptr: *mut Node<K, V>, parent: Option<*mut Node<K, V>>, key: K) {
        let node = unsafe { &*ptr };
        let hint = node.subtree_size();
        let mut keys: Vec<K> = Vec::with_capacity(hint);
        let mut values: Vec<V> = Vec::with_capacity(hint);
        let mut retired: Vec<*mut Node<K, V>> = Vec::new();
        self.collect_frozen(ptr, &mut keys, &mut values, &mut retired);
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]));

        debug!(
            "rebuilding subtree of {} entries (built at {})",
            keys.len(),
            node.build_size
        );
        let new_node = self.builder().build_bulk(&keys, &values);

        match parent {
            Some(parent) => {
                let parent = unsafe { &*parent };
                let pos = parent.predict(key);
                unsafe { parent.store_child(pos, new_node) };
            }
            None => self.root.store(new_node, Ordering::Release),
        }

        // Readers and writers still inside the old subtree revalidate,
        // observe obsolescence, and restart into the replacement.
        node.lock.mark_obsolete_and_unlock();
        for &old in &retired {
            epoch::retire(old as *mut (), free_erased::<K, V>);
        }
    }

    /// In-order scan of a subtree being retired. The subtree root is
    /// already write-locked by the caller; every descendant is frozen
    /// (marked obsolete) before its slots are read, so each node's content
    /// is final by the time it is copied out and any straggling writer is
    /// forced to restart into the rebuilt subtree.
    fn collect_frozen(
        &self,
        ptr: *mut Node<K, V>,
        keys: &mut Vec<K>,
        values: &mut Vec<V>,
        retired: &mut Vec<*mut Node<K, V>>,
    ) {
        retired.push(ptr);
        let node = unsafe { &*ptr };
        for pos in 0..node.num_items {
            if node.is_none(pos) {
                continue;
            }
            if node.is_child(pos) {
                loop {
                    let child = unsafe { node.child_at(pos) };
                    if unsafe { &*child }.lock.freeze() {
                        self.collect_frozen(child, keys, values, retired);
                        break;
                    }
                    // Lost the freeze race: a concurrent rebuild retired
                    // this child and has already spliced its replacement
                    // into our slot. Re-read the edge.
                    std::hint::spin_loop();
                }
            } else {
                let (k, v) = unsafe { node.entry_at(pos) };
                keys.push(k);
                values.push(v);
            }
        }
    }

    // ------------------------------------------------------------------
    // Bulk load
    // ------------------------------------------------------------------

    /// Replace the whole index with `pairs`, which must be strictly
    /// ascending by key. Exclusive access makes this safe to run without
    /// the optimistic protocol.
    pub fn bulk_load(&mut self, pairs: &[Entry<K, V>]) {
        for (a, b) in pairs.iter().tuple_windows() {
            assert!(a.key < b.key, "bulk load requires strictly ascending keys");
        }

        // Build the replacement before tearing the old tree down so the
        // root pointer never dangles.
        let new_root = match pairs {
            [] | [_] => build_none(),
            [first, second] => build_two(
                &self.pool,
                first.key,
                first.value,
                second.key,
                second.value,
            ),
            _ => {
                let keys: Vec<K> = pairs.iter().map(|e| e.key).collect();
                let values: Vec<V> = pairs.iter().map(|e| e.value).collect();
                self.builder().build_bulk(&keys, &values)
            }
        };

        let old = self.root.swap(new_root, Ordering::Relaxed);
        unsafe { destroy_subtree(old, &self.pool) };
        if let [single] = pairs {
            self.insert(single.key, single.value);
        }
        if !self.options.quiet {
            info!("bulk loaded {} entries", pairs.len());
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// In-order contents. Quiescent use only: the walk takes no locks.
    pub fn to_entries(&self) -> Vec<Entry<K, V>> {
        let mut out = Vec::with_capacity(self.len());
        Self::collect_quiescent(self.root.load(Ordering::Acquire), &mut out);
        out
    }

    fn collect_quiescent(ptr: *mut Node<K, V>, out: &mut Vec<Entry<K, V>>) {
        let node = unsafe { &*ptr };
        for pos in 0..node.num_items {
            if node.is_none(pos) {
                continue;
            }
            if node.is_child(pos) {
                Self::collect_quiescent(unsafe { node.child_at(pos) }, out);
            } else {
                let (k, v) = unsafe { node.entry_at(pos) };
                out.push(Entry::new(k, v));
            }
        }
    }

    /// Check every structural invariant, panicking on the first violation.
    /// Quiescent use only.
    pub fn verify(&self) {
        let mut stack = vec![self.root.load(Ordering::Acquire)];
        let mut last_key: Option<K> = None;
        // Slot-level checks per node, plus a global in-order sweep.
        while let Some(ptr) = stack.pop() {
            let node = unsafe { &*ptr };
            assert!(node.model.a.is_finite() && node.model.b.is_finite());
            assert!(node.model.a >= 0.0);
            let mut sum_size = 0usize;
            for pos in 0..node.num_items {
                if node.is_none(pos) {
                    assert!(!node.is_child(pos), "empty slot carries a child bit");
                } else if node.is_child(pos) {
                    let child = unsafe { node.child_at(pos) };
                    sum_size += unsafe { &*child }.subtree_size();
                    stack.push(child);
                } else {
                    let (k, _) = unsafe { node.entry_at(pos) };
                    assert_eq!(node.predict(k), pos, "leaf not on its predicted slot");
                    sum_size += 1;
                }
            }
            assert_eq!(
                node.subtree_size(),
                sum_size,
                "subtree size disagrees with slot contents"
            );
        }
        for entry in self.to_entries() {
            if let Some(last) = last_key {
                assert!(last < entry.key, "in-order scan is not strictly ascending");
            }
            last_key = Some(entry.key);
        }
    }

    /// Leaf depth distribution over the whole tree.
    pub fn depth_stats(&self) -> DepthStats {
        let mut stack = vec![(self.root.load(Ordering::Acquire), 1usize)];
        let mut max_depth = 1usize;
        let mut sum_depth = 0usize;
        let mut sum_leaves = 0usize;
        while let Some((ptr, depth)) = stack.pop() {
            let node = unsafe { &*ptr };
            for pos in 0..node.num_items {
                if node.is_child(pos) {
                    stack.push((unsafe { node.child_at(pos) }, depth + 1));
                } else if !node.is_none(pos) {
                    max_depth = max_depth.max(depth);
                    sum_depth += depth;
                    sum_leaves += 1;
                }
            }
        }
        DepthStats {
            max_depth,
            avg_depth: if sum_leaves == 0 {
                0.0
            } else {
                sum_depth as f64 / sum_leaves as f64
            },
        }
    }

    pub fn print_depth(&self) {
        let stats = self.depth_stats();
        info!(
            "max_depth = {}, avg_depth = {:.2}",
            stats.max_depth, stats.avg_depth
        );
    }

    /// Approximate memory footprint in bytes. `total` charges every slot,
    /// `ignore_child` charges headers only for nodes that carry slots.
    pub fn index_size(&self, total: bool, ignore_child: bool) -> usize {
        let mut stack = vec![self.root.load(Ordering::Acquire)];
        let mut bytes = 0usize;
        while let Some(ptr) = stack.pop() {
            let node = unsafe { &*ptr };
            let mut has_slots = false;
            if !ignore_child {
                bytes += Node::<K, V>::header_bytes();
            }
            for pos in 0..node.num_items {
                if ignore_child {
                    bytes += Node::<K, V>::slot_bytes();
                    has_slots = true;
                } else if total {
                    bytes += Node::<K, V>::slot_bytes();
                }
                if node.is_child(pos) {
                    if !total {
                        bytes += Node::<K, V>::slot_bytes();
                    }
                    stack.push(unsafe { node.child_at(pos) });
                }
            }
            if ignore_child && has_slots {
                bytes += Node::<K, V>::header_bytes();
            }
        }
        bytes
    }

    pub fn stats(&self) -> FitStats {
        FitStats {
            fmcd_success_times: self.counters.fmcd_success.load(Ordering::Relaxed),
            fmcd_broken_times: self.counters.fmcd_broken.load(Ordering::Relaxed),
        }
    }

    pub fn print_stats(&self) {
        let stats = self.stats();
        info!(
            "fmcd_success_times = {}, fmcd_broken_times = {}",
            stats.fmcd_success_times, stats.fmcd_broken_times
        );
    }

    /// Node-by-node dump of the whole tree, for debugging small indexes.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut stack = vec![self.root.load(Ordering::Acquire)];
        while let Some(ptr) = stack.pop() {
            let node = unsafe { &*ptr };
            write!(
                out,
                "Node({:p}, a = {}, b = {}, num_items = {})[",
                ptr, node.model.a, node.model.b, node.num_items
            )
            .unwrap();
            for pos in 0..node.num_items {
                if pos > 0 {
                    out.push_str(", ");
                }
                if node.is_none(pos) {
                    out.push_str("None");
                } else if node.is_child(pos) {
                    let child = unsafe { node.child_at(pos) };
                    write!(out, "Child({:p})", child).unwrap();
                    stack.push(child);
                } else {
                    let (k, _) = unsafe { node.entry_at(pos) };
                    write!(out, "Key({:?})", k).unwrap();
                }
            }
            out.push_str("]\n");
        }
        out
    }
}

impl<K: Key, V: Value> Drop for Clipp<K, V> {
    fn drop(&mut self) {
        let root = self.root.load(Ordering::Relaxed);
        unsafe { destroy_subtree(root, &self.pool) };
    }
}
