//! Interception façade: the replacement allocator entry points.
//!
//! Every exported symbol funnels through the same skeleton: make sure the
//! runtime is up, delegate to the real allocator, then record the effect
//! in the registry unless this thread is already inside tracker code.
//! The per-thread reentrancy guard is what keeps the tracker from eating
//! its own tail: any allocation the tracking path itself causes arrives
//! here with the guard already set and is passed straight through,
//! untracked.

use core::cell::Cell;
use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::binder;
use crate::classify;
use crate::config;
use crate::registry::{self, AllocationRecord};
use crate::report;

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Once set, release validation is disabled: registry teardown and
/// destructor-phase frees are expected to target addresses the registry
/// no longer knows.
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Frames captured before trimming tracker-internal entries; the stored
/// stack is bounded separately by the registry.
const RAW_FRAMES: usize = 32;

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// RAII token for the reentrancy guard. `enter` fails when this thread is
/// already inside tracker code, or when its TLS is being torn down; both
/// cases degrade to the raw real-allocator call.
struct Guard;

impl Guard {
    fn enter() -> Option<Guard> {
        IN_TRACKER
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(Guard)
                }
            })
            .unwrap_or(None)
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = IN_TRACKER.try_with(|flag| flag.set(false));
    }
}

/// Bring the runtime up. Idempotent; called from the library constructor
/// and defensively from every entry point.
pub unsafe fn ensure_initialized() {
    if STATE.load(Ordering::Acquire) != READY {
        init_slow();
    }
}

#[cold]
#[inline(never)]
unsafe fn init_slow() {
    if STATE
        .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Init is owned elsewhere: another thread, or this one re-entered
        // through dlsym's own allocation. Either way the caller falls back
        // to the bootstrap arena; spinning here would deadlock the
        // self-reentry case.
        return;
    }
    binder::resolve();
    config::load();
    classify::init();
    registry::init();
    STATE.store(READY, Ordering::Release);
}

fn ready() -> bool {
    STATE.load(Ordering::Acquire) == READY
}

/// Replacement `malloc`.
///
/// # Safety
///
/// Same contract as C `malloc`.
pub unsafe fn malloc(size: usize) -> *mut c_void {
    ensure_initialized();
    if !ready() {
        return binder::arena_alloc(size);
    }
    let ptr = (binder::real().malloc)(size);
    if !ptr.is_null() {
        if let Some(_guard) = Guard::enter() {
            track(ptr as usize, size);
        }
    }
    ptr
}

/// Replacement `calloc`; the tracked size is the (saturating) product of
/// the two counts.
///
/// # Safety
///
/// Same contract as C `calloc`.
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    ensure_initialized();
    if !ready() {
        // Arena blocks come from .bss and are handed out exactly once, so
        // the zero-fill contract holds without a memset.
        return binder::arena_alloc(nmemb.saturating_mul(size));
    }
    let ptr = (binder::real().calloc)(nmemb, size);
    if !ptr.is_null() {
        if let Some(_guard) = Guard::enter() {
            track(ptr as usize, nmemb.saturating_mul(size));
        }
    }
    ptr
}

/// Replacement `free`, with release validation.
///
/// # Safety
///
/// Same contract as C `free`.
pub unsafe fn free(ptr: *mut c_void) {
    ensure_initialized();
    if ptr.is_null() {
        return;
    }
    if binder::arena_contains(ptr) {
        // Bootstrap memory is never reclaimed.
        return;
    }
    if SHUTTING_DOWN.load(Ordering::Acquire) {
        if let Some(real) = binder::get() {
            (real.free)(ptr);
        }
        return;
    }
    if !ready() {
        return;
    }
    let real = binder::real();
    match Guard::enter() {
        // Tracker-internal release of untracked memory (or TLS teardown):
        // hand it straight to the real allocator.
        None => (real.free)(ptr),
        Some(guard) => {
            let removed = registry::remove(ptr as usize);
            let owned = removed.is_some();
            if !owned {
                // Double free or invalid free. The real free is suppressed:
                // releasing an address the allocator did not hand out (or
                // already reclaimed) would corrupt its arena and turn this
                // report into a crash somewhere else.
                report_corruption(ptr as usize);
            }
            drop(guard);
            if owned {
                (real.free)(ptr);
            }
        }
    }
}

/// Replacement `realloc`. Null pointer degenerates to `malloc`, zero size
/// to `free`; otherwise the old record is retired and the result, moved
/// or in place, is tracked afresh.
///
/// # Safety
///
/// Same contract as C `realloc`.
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    ensure_initialized();
    if ptr.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(ptr);
        return ptr::null_mut();
    }
    if binder::arena_contains(ptr) {
        // Migrate bootstrap memory onto the real heap. The original length
        // is unknown; the copy is capped by what is left of the arena.
        let fresh = malloc(size);
        if !fresh.is_null() {
            let copy = size.min(binder::arena_tail_len(ptr));
            ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, copy);
        }
        return fresh;
    }
    if !ready() {
        return ptr::null_mut();
    }
    let fresh = (binder::real().realloc)(ptr, size);
    if let Some(_guard) = Guard::enter() {
        drop(registry::remove(ptr as usize));
        if !fresh.is_null() {
            track(fresh as usize, size);
        }
    }
    fresh
}

/// Shutdown hook: drain the registry and report what is still live.
/// Runs once, after user threads are done; the shutting-down flag goes up
/// before any teardown free so destructor-phase releases pass unscathed.
///
/// # Safety
///
/// Must only run during library unload or from a single-threaded test.
pub unsafe fn shutdown() {
    if SHUTTING_DOWN.swap(true, Ordering::AcqRel) {
        return;
    }
    if !ready() {
        return;
    }
    let Some(table) = registry::take() else {
        return;
    };
    if !table.is_empty() {
        report::leaks(&table);
    }
    drop(table);
}

/// Capture, classify and record one successful allocation. Runs with the
/// guard held.
unsafe fn track(address: usize, size: usize) {
    let mut raw = [0usize; RAW_FRAMES];
    let len = capture_stack(&mut raw);
    let (start, provenance) = classify::get().judge(&raw[..len]);
    let record = AllocationRecord::new(size, provenance, &raw[start..len]);
    if !registry::add(address, record) {
        report::storage_failure();
    }
}

fn report_corruption(address: usize) {
    let mut raw = [0usize; RAW_FRAMES];
    let len = capture_stack(&mut raw);
    let (start, _) = classify::get().judge(&raw[..len]);
    report::corruption(address, &raw[start..len]);
}

fn capture_stack(buf: &mut [usize; RAW_FRAMES]) -> usize {
    let mut len = 0;
    backtrace::trace(|frame| {
        buf[len] = frame.ip() as usize;
        len += 1;
        len < RAW_FRAMES
    });
    len
}
