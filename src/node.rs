//! Node storage: slot arrays, the two parallel bitmaps classifying each
//! slot, and the recycling pool for 8-slot two-key nodes.
//!
//! A slot's meaning is carried entirely by the bitmaps: `none` set means the
//! slot is empty, otherwise `child` set means it holds a pointer to a
//! descendant, otherwise it holds a `(key, value)` leaf. The slot payloads
//! themselves live in `UnsafeCell`s and are read speculatively; the version
//! lock protocol is what makes those reads meaningful.

use crate::kv::{Key, Value};
use crate::lock::VersionLock;
use crate::model::LinearModel;
use crossbeam_queue::SegQueue;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Slot capacity of the recyclable two-key micro-node.
pub(crate) const TWO_NODE_ITEMS: usize = 8;

/// One slot: leaf payload or child edge, discriminated by the owning node's
/// bitmaps rather than by a tag.
pub(crate) union Slot<K: Key, V: Value> {
    pub entry: (K, V),
    pub child: *mut Node<K, V>,
}

impl<K: Key, V: Value> Clone for Slot<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Key, V: Value> Copy for Slot<K, V> {}

pub(crate) struct Node<K: Key, V: Value> {
    pub lock: VersionLock,
    /// Recyclable 8-slot two-key layout marker.
    pub is_two: bool,
    /// A fixed node never triggers a rebuild.
    pub fixed: bool,
    /// Subtree entry count when this node was (re)built.
    pub build_size: usize,
    /// Current subtree entry count, bumped after each insert commit.
    pub size: AtomicUsize,
    pub num_inserts: AtomicU32,
    /// Inserts through this node that turned a slot into data (leaf fill or
    /// leaf-to-child conversion) somewhere on their path. Updated outside
    /// this node's write lock.
    pub num_insert_to_data: AtomicU32,
    pub num_items: usize,
    pub model: LinearModel,
    pub items: Box<[UnsafeCell<Slot<K, V>>]>,
    pub none_bitmap: Box<[AtomicU8]>,
    pub child_bitmap: Box<[AtomicU8]>,
}

// Slots are only dereferenced under the version protocol or exclusive
// ownership; everything else is atomics.
unsafe impl<K: Key, V: Value> Send for Node<K, V> {}
unsafe impl<K: Key, V: Value> Sync for Node<K, V> {}

fn bitmap_blocks(num_items: usize) -> usize {
    (num_items + 7) / 8
}

fn empty_bitmaps(num_items: usize) -> (Box<[AtomicU8]>, Box<[AtomicU8]>) {
    let blocks = bitmap_blocks(num_items);
    let none: Box<[AtomicU8]> = (0..blocks).map(|_| AtomicU8::new(0xff)).collect();
    let child: Box<[AtomicU8]> = (0..blocks).map(|_| AtomicU8::new(0)).collect();
    (none, child)
}

fn null_slots<K: Key, V: Value>(num_items: usize) -> Box<[UnsafeCell<Slot<K, V>>]> {
    (0..num_items)
        .map(|_| {
            UnsafeCell::new(Slot {
                child: ptr::null_mut(),
            })
        })
        .collect()
}

impl<K: Key, V: Value> Node<K, V> {
    #[inline]
    pub(crate) fn predict(&self, key: K) -> usize {
        self.model.predict(key, self.num_items)
    }

    #[inline]
    pub(crate) fn is_none(&self, pos: usize) -> bool {
        self.none_bitmap[pos >> 3].load(Ordering::Relaxed) >> (pos & 7) & 1 == 1
    }

    #[inline]
    pub(crate) fn is_child(&self, pos: usize) -> bool {
        self.child_bitmap[pos >> 3].load(Ordering::Relaxed) >> (pos & 7) & 1 == 1
    }

    #[inline]
    pub(crate) fn set_none(&self, pos: usize) {
        self.none_bitmap[pos >> 3].fetch_or(1 << (pos & 7), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_none(&self, pos: usize) {
        self.none_bitmap[pos >> 3].fetch_and(!(1 << (pos & 7)), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_child_bit(&self, pos: usize) {
        self.child_bitmap[pos >> 3].fetch_or(1 << (pos & 7), Ordering::Relaxed);
    }

    /// Speculative leaf read. Caller must validate the node's version before
    /// trusting the result.
    #[inline]
    pub(crate) unsafe fn entry_at(&self, pos: usize) -> (K, V) {
        unsafe { (*self.items[pos].get()).entry }
    }

    /// Speculative child-pointer read; same validation contract as
    /// `entry_at`.
    #[inline]
    pub(crate) unsafe fn child_at(&self, pos: usize) -> *mut Node<K, V> {
        unsafe { (*self.items[pos].get()).child }
    }

    /// Store a leaf. Caller holds the write lock or exclusive ownership.
    #[inline]
    pub(crate) unsafe fn store_entry(&self, pos: usize, key: K, value: V) {
        unsafe { (*self.items[pos].get()).entry = (key, value) };
    }

    /// Store a child edge. Same exclusivity contract as `store_entry`.
    #[inline]
    pub(crate) unsafe fn store_child(&self, pos: usize, child: *mut Node<K, V>) {
        unsafe { (*self.items[pos].get()).child = child };
    }

    #[inline]
    pub(crate) fn subtree_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Header + slot-array footprint in bytes, for the introspection
    /// accounting.
    pub(crate) fn header_bytes() -> usize {
        mem::size_of::<Self>()
    }

    pub(crate) fn slot_bytes() -> usize {
        mem::size_of::<Slot<K, V>>()
    }
}

/// Allocate an unpublished node shell with all slots empty.
pub(crate) fn alloc_node<K: Key, V: Value>(
    model: LinearModel,
    num_items: usize,
    build_size: usize,
    fixed: bool,
) -> *mut Node<K, V> {
    let (none_bitmap, child_bitmap) = empty_bitmaps(num_items);
    Box::into_raw(Box::new(Node {
        lock: VersionLock::new(),
        is_two: false,
        fixed,
        build_size,
        size: AtomicUsize::new(build_size),
        num_inserts: AtomicU32::new(0),
        num_insert_to_data: AtomicU32::new(0),
        num_items,
        model,
        items: null_slots(num_items),
        none_bitmap,
        child_bitmap,
    }))
}

/// The single-slot node an empty tree consists of.
pub(crate) fn build_none<K: Key, V: Value>() -> *mut Node<K, V> {
    let node = alloc_node(LinearModel { a: 0.0, b: 0.0 }, 1, 0, false);
    unsafe { &*node }.set_none(0);
    node
}

pub(crate) unsafe fn free_node<K: Key, V: Value>(ptr: *mut Node<K, V>) {
    drop(unsafe { Box::from_raw(ptr) });
}

/// Type-erased deallocation routine handed to the epoch reclaimer.
pub(crate) unsafe fn free_erased<K: Key, V: Value>(ptr: *mut ()) {
    unsafe { free_node(ptr as *mut Node<K, V>) };
}

/// Lock-free recycling pool for two-key nodes, in the spirit of a free-id
/// queue: logically deleted two-nodes go back here instead of to the
/// allocator.
pub(crate) struct TwoNodePool<K: Key, V: Value> {
    pending: SegQueue<PooledNode<K, V>>,
}

struct PooledNode<K: Key, V: Value>(*mut Node<K, V>);

// Pooled nodes are unpublished: the pool is their only owner.
unsafe impl<K: Key, V: Value> Send for PooledNode<K, V> {}

impl<K: Key, V: Value> TwoNodePool<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            pending: SegQueue::new(),
        }
    }

    /// Preallocate `count` two-nodes so early leaf conversions skip the
    /// allocator.
    pub(crate) fn warm(&self, count: usize) {
        for _ in 0..count {
            self.pending.push(PooledNode(fresh_two_shell::<K, V>()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Return a logically deleted two-node to the pool. Caller passes
    /// exclusive ownership of an unreachable node.
    pub(crate) unsafe fn recycle(&self, node: *mut Node<K, V>) {
        let n = unsafe { &*node };
        debug_assert!(n.is_two);
        debug_assert_eq!(n.build_size, 2);
        debug_assert_eq!(n.num_items, TWO_NODE_ITEMS);
        n.size.store(2, Ordering::Relaxed);
        n.num_inserts.store(0, Ordering::Relaxed);
        n.num_insert_to_data.store(0, Ordering::Relaxed);
        n.none_bitmap[0].store(0xff, Ordering::Relaxed);
        n.child_bitmap[0].store(0, Ordering::Relaxed);
        self.pending.push(PooledNode(node));
    }

    fn take(&self) -> *mut Node<K, V> {
        match self.pending.pop() {
            Some(PooledNode(node)) => node,
            None => fresh_two_shell(),
        }
    }
}

impl<K: Key, V: Value> Drop for TwoNodePool<K, V> {
    fn drop(&mut self) {
        while let Some(PooledNode(node)) = self.pending.pop() {
            unsafe { free_node(node) };
        }
    }
}

fn fresh_two_shell<K: Key, V: Value>() -> *mut Node<K, V> {
    let node = alloc_node::<K, V>(LinearModel { a: 0.0, b: 0.0 }, TWO_NODE_ITEMS, 2, false);
    unsafe { &mut *node }.is_two = true;
    node
}

/// Tear down a whole subtree from an exclusive context (bulk load replacing
/// the tree, or drop). Two-nodes go back to the pool; everything else is
/// freed outright.
pub(crate) unsafe fn destroy_subtree<K: Key, V: Value>(
    root: *mut Node<K, V>,
    pool: &TwoNodePool<K, V>,
) {
    let mut stack = vec![root];
    while let Some(ptr) = stack.pop() {
        let node = unsafe { &*ptr };
        for pos in 0..node.num_items {
            if node.is_child(pos) {
                stack.push(unsafe { node.child_at(pos) });
            }
        }
        if node.is_two {
            unsafe { pool.recycle(ptr) };
        } else {
            unsafe { free_node(ptr) };
        }
    }
}

/// Build a two-key node: the model is anchored so the keys land on slots
/// `8/3` and `2*8/3` of the 8-slot layout.
pub(crate) fn build_two<K: Key, V: Value>(
    pool: &TwoNodePool<K, V>,
    mut key1: K,
    mut value1: V,
    mut key2: K,
    mut value2: V,
) -> *mut Node<K, V> {
    if key1 > key2 {
        mem::swap(&mut key1, &mut key2);
        mem::swap(&mut value1, &mut value2);
    }
    assert!(key1 < key2, "two-key node requires distinct keys");

    let ptr = pool.take();
    {
        let node = unsafe { &mut *ptr };
        node.lock.reset();

        let mid1_target = (TWO_NODE_ITEMS / 3) as f64;
        let mid2_target = (TWO_NODE_ITEMS * 2 / 3) as f64;
        let k1 = crate::kv::to_f64(key1);
        let k2 = crate::kv::to_f64(key2);
        let a = (mid2_target - mid1_target) / (k2 - k1);
        let b = mid1_target - a * k1;
        assert!(a.is_finite() && b.is_finite(), "degenerate two-key model");
        node.model = LinearModel { a, b };
    }

    let node = unsafe { &*ptr };
    let pos1 = node.predict(key1);
    assert!(node.is_none(pos1));
    node.clear_none(pos1);
    unsafe { node.store_entry(pos1, key1, value1) };

    let pos2 = node.predict(key2);
    assert!(node.is_none(pos2));
    node.clear_none(pos2);
    unsafe { node.store_entry(pos2, key2, value2) };

    ptr
}

#[cfg(test)]
mod node_tests {
    use super::*;

    #[test]
    fn empty_node_is_single_none_slot() {
        let ptr = build_none::<u64, u64>();
        let node = unsafe { &*ptr };
        assert_eq!(node.num_items, 1);
        assert!(node.is_none(0));
        assert!(!node.is_child(0));
        assert_eq!(node.subtree_size(), 0);
        unsafe { free_node(ptr) };
    }

    #[test]
    fn two_node_places_keys_on_distinct_slots() {
        let pool = TwoNodePool::new();
        let ptr = build_two(&pool, 10u64, 1u64, 20u64, 2u64);
        let node = unsafe { &*ptr };
        let p1 = node.predict(10);
        let p2 = node.predict(20);
        assert_ne!(p1, p2);
        assert_eq!(p1, TWO_NODE_ITEMS / 3);
        assert_eq!(p2, TWO_NODE_ITEMS * 2 / 3);
        assert_eq!(unsafe { node.entry_at(p1) }, (10, 1));
        assert_eq!(unsafe { node.entry_at(p2) }, (20, 2));
        unsafe { free_node(ptr) };
    }

    #[test]
    fn two_node_swaps_misordered_input() {
        let pool = TwoNodePool::new();
        let ptr = build_two(&pool, 20u64, 2u64, 10u64, 1u64);
        let node = unsafe { &*ptr };
        assert_eq!(unsafe { node.entry_at(node.predict(10)) }, (10, 1));
        assert_eq!(unsafe { node.entry_at(node.predict(20)) }, (20, 2));
        unsafe { free_node(ptr) };
    }

    #[test]
    fn pool_recycles_two_nodes() {
        let pool = TwoNodePool::new();
        pool.warm(4);
        assert_eq!(pool.len(), 4);

        let ptr = build_two(&pool, 1u64, 1u64, 2u64, 2u64);
        assert_eq!(pool.len(), 3);
        unsafe { pool.recycle(ptr) };
        assert_eq!(pool.len(), 4);

        // A recycled shell comes back clean and reusable.
        let again = build_two(&pool, 5u64, 50u64, 9u64, 90u64);
        let node = unsafe { &*again };
        assert_eq!(unsafe { node.entry_at(node.predict(5)) }, (5, 50));
        assert_eq!(unsafe { node.entry_at(node.predict(9)) }, (9, 90));
        assert_eq!(node.subtree_size(), 2);
        unsafe { pool.recycle(again) };
    }

    #[test]
    fn bitmap_transitions() {
        let ptr = alloc_node::<u64, u64>(LinearModel { a: 1.0, b: 0.0 }, 20, 0, false);
        let node = unsafe { &*ptr };
        for pos in 0..20 {
            assert!(node.is_none(pos));
            assert!(!node.is_child(pos));
        }
        node.clear_none(13);
        node.set_child_bit(13);
        assert!(!node.is_none(13));
        assert!(node.is_child(13));
        assert!(node.is_none(12) && node.is_none(14));
        unsafe { free_node(ptr) };
    }
}
