//! Allocation registry: the concurrent address → record map.
//!
//! The sole source of truth about live allocations. One mutex covers
//! insert, lookup and delete; nothing else is locked, so deadlock is
//! structurally impossible. The table's own storage is the delicate part:
//! it must come from the *real* allocator, never from the intercepted
//! entry points, or a bookkeeping insert would recurse into the tracker.
//! `RealHeap` routes hashbrown's allocations at the binder's raw pointers
//! to make that true by construction.

use core::alloc::Layout;
use core::ffi::c_void;
use core::ptr::{self, NonNull};

use allocator_api2::alloc::{AllocError, Allocator};
use hashbrown::HashMap;

use crate::binder;
use crate::classify::Provenance;
use crate::sync::Mutex;

/// Upper bound on captured return addresses per allocation.
pub const MAX_STACK_FRAMES: usize = 16;

/// Per-live-allocation metadata. The stack copy is inline, so one record
/// is one real-allocator block and the caller's capture buffer can be
/// reused the moment `add` returns.
#[derive(Clone, Copy)]
pub struct AllocationRecord {
    /// Bytes requested (product of the two counts for calloc).
    pub size: usize,
    /// Wall-clock second at tracking time. Diagnostic only.
    pub timestamp: libc::time_t,
    /// Return addresses, most recent first.
    pub stack: [usize; MAX_STACK_FRAMES],
    pub stack_len: usize,
    /// Assigned at insert, never changed.
    pub provenance: Provenance,
}

impl AllocationRecord {
    pub fn new(size: usize, provenance: Provenance, frames: &[usize]) -> Self {
        let mut stack = [0usize; MAX_STACK_FRAMES];
        let stack_len = frames.len().min(MAX_STACK_FRAMES);
        stack[..stack_len].copy_from_slice(&frames[..stack_len]);
        AllocationRecord {
            size,
            timestamp: unsafe { libc::time(ptr::null_mut()) },
            stack,
            stack_len,
            provenance,
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.stack[..self.stack_len]
    }
}

/// Backing allocator for the table: straight to the resolved real
/// malloc/free, bypassing the interception layer entirely.
#[derive(Clone, Copy, Default)]
pub struct RealHeap;

// The real malloc guarantees max_align_t alignment; hashbrown's control
// and bucket layouts never need more.
const REAL_MALLOC_ALIGN: usize = 16;

unsafe impl Allocator for RealHeap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > REAL_MALLOC_ALIGN {
            return Err(AllocError);
        }
        let real = binder::get().ok_or(AllocError)?;
        let ptr = unsafe { (real.malloc)(layout.size().max(1)) };
        let ptr = NonNull::new(ptr as *mut u8).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        if let Some(real) = binder::get() {
            (real.free)(ptr.as_ptr() as *mut c_void);
        }
    }
}

pub type Table = HashMap<usize, AllocationRecord, ahash::RandomState, RealHeap>;

static TABLE: Mutex<Option<Table>> = Mutex::new(None);

/// Create the (empty) table. Called once from runtime init, after the
/// binder has resolved; creating an empty hashbrown map does not allocate.
pub fn init() {
    let mut table = TABLE.lock();
    if table.is_none() {
        // Fixed seeds: seeding from the OS would drag getrandom into the
        // allocator path, and pointer keys need no DoS hardening.
        let hasher = ahash::RandomState::with_seeds(
            0x9e37_79b9_7f4a_7c15,
            0x6c62_272e_07bb_0142,
            0x5851_f42d_4c95_7f2d,
            0x1405_7b7e_f767_814f,
        );
        *table = Some(Table::with_hasher_in(hasher, RealHeap));
    }
}

/// Insert a record for `address`. An address already present is replaced:
/// either the tracker missed a free event or the real allocator recycled
/// the address before the removal was observed, and the fresh record is
/// the truthful one in both cases.
///
/// Returns `false` when record storage could not be obtained; the caller
/// owns the one-line diagnostic, and the user's allocation stands.
pub fn add(address: usize, record: AllocationRecord) -> bool {
    let mut table = TABLE.lock();
    let Some(map) = table.as_mut() else {
        return true;
    };
    if map.try_reserve(1).is_err() {
        return false;
    }
    map.insert(address, record);
    true
}

/// Atomic lookup-and-remove. The returned record (and any storage release
/// its drop implies) is handed back to the caller, outside the lock.
pub fn remove(address: usize) -> Option<AllocationRecord> {
    TABLE.lock().as_mut()?.remove(&address)
}

/// O(1) membership test for release validation.
pub fn contains(address: usize) -> bool {
    TABLE
        .lock()
        .as_ref()
        .map_or(false, |map| map.contains_key(&address))
}

/// Take the whole table for the shutdown drain. Single-threaded by then;
/// dropping the returned table releases its storage to the real
/// allocator.
pub fn take() -> Option<Table> {
    TABLE.lock().take()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_for_tests() {
        unsafe { binder::resolve() };
        init();
    }

    fn record(size: usize, provenance: Provenance) -> AllocationRecord {
        AllocationRecord::new(size, provenance, &[0x1000, 0x2000, 0x3000])
    }

    // Addresses are disjoint per test: the registry is process-global and
    // the harness runs tests concurrently.

    #[test]
    fn add_then_remove_round_trips() {
        init_for_tests();
        let addr = 0xa11c_0001;
        assert!(add(addr, record(128, Provenance::User)));
        assert!(contains(addr));
        let rec = remove(addr).expect("record present");
        assert_eq!(rec.size, 128);
        assert_eq!(rec.frames(), &[0x1000, 0x2000, 0x3000]);
        assert!(!contains(addr));
        assert!(remove(addr).is_none());
    }

    #[test]
    fn reinsert_replaces_stale_record() {
        init_for_tests();
        let addr = 0xa11c_0002;
        assert!(add(addr, record(10, Provenance::User)));
        assert!(add(addr, record(99, Provenance::Libc)));
        let rec = remove(addr).expect("record present");
        assert_eq!(rec.size, 99);
        assert_eq!(rec.provenance, Provenance::Libc);
        assert!(!contains(addr));
    }

    #[test]
    fn stack_copies_are_bounded_and_private() {
        let mut frames = [0usize; 40];
        for (i, f) in frames.iter_mut().enumerate() {
            *f = 0x5000 + i;
        }
        let rec = AllocationRecord::new(1, Provenance::User, &frames);
        assert_eq!(rec.stack_len, MAX_STACK_FRAMES);
        assert_eq!(rec.frames()[0], 0x5000);
        assert_eq!(rec.frames()[MAX_STACK_FRAMES - 1], 0x5000 + MAX_STACK_FRAMES - 1);
    }

    #[test]
    fn short_stacks_keep_their_length() {
        let rec = AllocationRecord::new(1, Provenance::User, &[0xaa]);
        assert_eq!(rec.stack_len, 1);
        assert_eq!(rec.frames(), &[0xaa]);
    }
}
