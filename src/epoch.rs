//! Three-epoch deferred reclamation.
//!
//! Retired nodes cannot be freed while some reader still holds a pointer
//! obtained during its descent. Every public read or insert pins the current
//! epoch for its duration; a retired object is buried in the retiring
//! thread's bucket for that epoch and freed only after the global epoch has
//! advanced far enough that nobody who could have seen it is still inside.
//!
//! Global state is one process-wide singleton: the current epoch plus a
//! registry of per-thread epoch slots. The retirement buckets themselves
//! stay thread-local; a thread that exits hands its unfreed buckets to a
//! global orphan list drained on a later epoch advancement.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Sentinel for a thread that is not inside a critical section.
const OUTSIDE: u32 = 3;

/// Ask for an epoch advancement every this many retirements.
const ADVANCE_INTERVAL: usize = 64;

const NEXT_EPOCH: [u32; 3] = [1, 2, 0];
const PREVIOUS_EPOCH: [u32; 3] = [2, 0, 1];

/// A retired allocation paired with its deallocation routine.
pub(crate) struct Retired {
    ptr: *mut (),
    free: unsafe fn(*mut ()),
}

// Retired pointers are exclusively owned once scheduled; the free routine is
// the only remaining access path.
unsafe impl Send for Retired {}

impl Retired {
    unsafe fn release(self) {
        unsafe { (self.free)(self.ptr) }
    }
}

/// Per-thread slot visible to the advancement check.
struct EpochSlot {
    local_epoch: AtomicU32,
}

struct LocalState {
    slot: Arc<EpochSlot>,
    buckets: [Vec<Retired>; 3],
    previously_accessed: u32,
    wants_advance: bool,
}

impl Drop for LocalState {
    fn drop(&mut self) {
        let global = global();
        {
            let mut orphans = global.orphans.lock();
            for epoch in 0..3 {
                orphans[epoch].append(&mut self.buckets[epoch]);
            }
        }
        global
            .registry
            .lock()
            .retain(|slot| !Arc::ptr_eq(slot, &self.slot));
    }
}

struct Reclaimer {
    current_epoch: AtomicU32,
    registry: Mutex<Vec<Arc<EpochSlot>>>,
    orphans: Mutex<[Vec<Retired>; 3]>,
}

impl Reclaimer {
    fn new() -> Self {
        Self {
            current_epoch: AtomicU32::new(0),
            registry: Mutex::new(Vec::new()),
            orphans: Mutex::new([Vec::new(), Vec::new(), Vec::new()]),
        }
    }

    /// True iff no thread is still pinned to the epoch preceding `epoch`,
    /// which is the one whose retirements would become freeable next.
    fn can_advance(&self, epoch: u32) -> bool {
        let previous = PREVIOUS_EPOCH[epoch as usize];
        self.registry
            .lock()
            .iter()
            .all(|slot| slot.local_epoch.load(Ordering::Acquire) != previous)
    }

    /// Orphan buckets for `epoch` were filled at least one full revolution
    /// ago once the global epoch comes back around to `epoch`.
    fn drain_orphans(&self, epoch: u32) {
        let drained = std::mem::take(&mut self.orphans.lock()[epoch as usize]);
        for retired in drained {
            unsafe { retired.release() };
        }
    }
}

fn global() -> &'static Reclaimer {
    static GLOBAL: OnceLock<Reclaimer> = OnceLock::new();
    GLOBAL.get_or_init(Reclaimer::new)
}

thread_local! {
    static LOCAL: RefCell<Option<LocalState>> = const { RefCell::new(None) };
}

fn with_local<R>(f: impl FnOnce(&mut LocalState) -> R) -> R {
    LOCAL.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let state = borrow.get_or_insert_with(|| {
            let slot = Arc::new(EpochSlot {
                local_epoch: AtomicU32::new(OUTSIDE),
            });
            global().registry.lock().push(Arc::clone(&slot));
            LocalState {
                slot,
                buckets: [Vec::new(), Vec::new(), Vec::new()],
                previously_accessed: OUTSIDE,
                wants_advance: false,
            }
        });
        f(state)
    })
}

/// Pins the calling thread inside the current epoch until dropped.
pub(crate) struct EpochGuard {
    _not_send: std::marker::PhantomData<*mut ()>,
}

impl EpochGuard {
    pub(crate) fn new() -> Self {
        let reclaimer = global();
        let epoch = reclaimer.current_epoch.load(Ordering::Acquire);
        let wants_advance = with_local(|local| {
            debug_assert_eq!(local.slot.local_epoch.load(Ordering::Relaxed), OUTSIDE);
            if local.previously_accessed != epoch {
                // Nobody can still be two epochs behind, so this thread's
                // bucket for the epoch we are re-entering is dead weight.
                for retired in local.buckets[epoch as usize].drain(..) {
                    unsafe { retired.release() };
                }
                local.wants_advance = false;
                local.previously_accessed = epoch;
            }
            local.slot.local_epoch.store(epoch, Ordering::Release);
            local.wants_advance
        });

        if wants_advance && reclaimer.can_advance(epoch) {
            let next = NEXT_EPOCH[epoch as usize];
            if reclaimer
                .current_epoch
                .compare_exchange(epoch, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                reclaimer.drain_orphans(next);
            }
        }

        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        with_local(|local| {
            local.slot.local_epoch.store(OUTSIDE, Ordering::Release);
        });
    }
}

/// Schedule `ptr` to be freed with `free` once no pinned thread can still
/// observe it. Must be called while pinned.
pub(crate) fn retire(ptr: *mut (), free: unsafe fn(*mut ())) {
    with_local(|local| {
        let epoch = local.slot.local_epoch.load(Ordering::Relaxed);
        debug_assert_ne!(epoch, OUTSIDE);
        let bucket = &mut local.buckets[epoch as usize];
        bucket.push(Retired { ptr, free });
        local.wants_advance = bucket.len() % ADVANCE_INTERVAL == 0;
    });
}

#[cfg(test)]
mod epoch_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    unsafe fn free_tracked(ptr: *mut ()) {
        drop(unsafe { Box::from_raw(ptr as *mut Tracked) });
        DROPS.fetch_add(1, Ordering::SeqCst);
    }

    fn retire_tracked() {
        let ptr = Box::into_raw(Box::new(Tracked)) as *mut ();
        retire(ptr, free_tracked);
    }

    #[test]
    fn retired_objects_eventually_freed() {
        let before = DROPS.load(Ordering::SeqCst);
        let scheduled = ADVANCE_INTERVAL * 4;
        for _ in 0..scheduled {
            let _guard = EpochGuard::new();
            retire_tracked();
        }
        // Keep churning critical sections, each with a retirement so the
        // advancement hint keeps firing, until reclamation has cycled
        // through at least as many objects as were scheduled above.
        let mut churned = 0usize;
        while DROPS.load(Ordering::SeqCst) - before < scheduled {
            churned += 1;
            assert!(churned < ADVANCE_INTERVAL * 1_000, "reclamation stalled");
            let _guard = EpochGuard::new();
            retire_tracked();
        }
    }

    #[test]
    fn pinned_reader_blocks_advancement() {
        let reclaimer = global();
        let _outer = EpochGuard::new();
        let pinned = LOCAL.with(|cell| {
            cell.borrow()
                .as_ref()
                .unwrap()
                .slot
                .local_epoch
                .load(Ordering::Acquire)
        });
        assert_ne!(pinned, OUTSIDE);
        // Advancing out of `pinned + 1` would require nobody pinned at
        // `pinned`, so that advancement must be refused while we hold the
        // guard.
        let blocked = NEXT_EPOCH[pinned as usize];
        assert_eq!(PREVIOUS_EPOCH[blocked as usize], pinned);
        assert!(!reclaimer.can_advance(blocked));
    }

    #[test]
    fn thread_exit_hands_buckets_to_orphans() {
        let before = DROPS.load(Ordering::SeqCst);
        std::thread::spawn(|| {
            let _guard = EpochGuard::new();
            retire_tracked();
        })
        .join()
        .unwrap();
        // The exited thread's retirement is parked in the orphan list, not
        // freed while potentially visible; churn until reclamation moves.
        let mut churned = 0usize;
        while DROPS.load(Ordering::SeqCst) == before {
            churned += 1;
            assert!(churned < ADVANCE_INTERVAL * 1_000, "reclamation stalled");
            let _guard = EpochGuard::new();
            retire_tracked();
        }
    }
}
