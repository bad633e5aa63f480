//! Real-allocator binder.
//!
//! The preload library exports `malloc`/`free`/`calloc`/`realloc` itself,
//! so calling `libc::malloc` from tracker code would loop straight back
//! into the interception layer. The genuine libc implementations are
//! reached through `dlsym(RTLD_NEXT, ...)`, the next definition after
//! this object in the link chain, resolved exactly once during runtime
//! init and published process-wide.
//!
//! glibc's `dlsym` may itself call `calloc` before resolution finishes.
//! Those requests are served from a small fixed bump arena; arena
//! addresses are recognized later so a `free` of one is dropped instead of
//! being handed to an allocator that never issued it.

use core::ffi::{c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

pub type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void;

/// The next-in-chain allocator primitives. Write-once at init, read-only
/// for the lifetime of the loaded library.
pub struct RealAllocator {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
}

static REAL: OnceCell<RealAllocator> = OnceCell::new();

/// Resolve the real allocator. Called once from runtime init; terminates
/// the process if the chain cannot supply the primitives we are standing
/// in for.
///
/// # Safety
///
/// Must not run concurrently with itself; the runtime's init state machine
/// guarantees a single caller.
pub unsafe fn resolve() {
    let malloc = lookup(c"malloc");
    let free = lookup(c"free");
    let calloc = lookup(c"calloc");
    let realloc = lookup(c"realloc");

    let (Some(malloc), Some(free), Some(calloc), Some(realloc)) =
        (malloc, free, calloc, realloc)
    else {
        bootstrap_failure();
    };

    let _ = REAL.set(RealAllocator {
        malloc: core::mem::transmute::<*mut c_void, MallocFn>(malloc),
        free: core::mem::transmute::<*mut c_void, FreeFn>(free),
        calloc: core::mem::transmute::<*mut c_void, CallocFn>(calloc),
        realloc: core::mem::transmute::<*mut c_void, ReallocFn>(realloc),
    });
}

pub fn get() -> Option<&'static RealAllocator> {
    REAL.get()
}

/// The resolved allocator. Only valid after `resolve`; the runtime never
/// reaches tracking code before init completes.
pub fn real() -> &'static RealAllocator {
    debug_assert!(REAL.get().is_some(), "binder queried before resolve");
    match REAL.get() {
        Some(real) => real,
        // Unreachable post-init; keep the non-debug path total.
        None => bootstrap_failure(),
    }
}

unsafe fn lookup(name: &CStr) -> Option<*mut c_void> {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if sym.is_null() {
        None
    } else {
        Some(sym)
    }
}

/// No formatted I/O here: stdio may re-enter the very allocator that just
/// failed to resolve. One raw write, then an async-signal-safe exit.
fn bootstrap_failure() -> ! {
    const MSG: &[u8] = b"[memtrace] fatal: real allocator not found in link chain\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, MSG.as_ptr() as *const c_void, MSG.len());
        libc::_exit(1);
    }
}

// ---------------------------------------------------------------------------
// Bootstrap arena
// ---------------------------------------------------------------------------

const ARENA_SIZE: usize = 64 * 1024;
const ARENA_ALIGN: usize = 16;

static mut ARENA: [u8; ARENA_SIZE] = [0u8; ARENA_SIZE];
static ARENA_USED: AtomicUsize = AtomicUsize::new(0);

/// Bump-allocate from the bootstrap arena. Never reused, never freed;
/// returns null when the arena is exhausted.
pub fn arena_alloc(size: usize) -> *mut c_void {
    let size = (size.max(1) + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1);
    let mut offset = ARENA_USED.load(Ordering::Relaxed);
    loop {
        let Some(end) = offset.checked_add(size) else {
            return ptr::null_mut();
        };
        if end > ARENA_SIZE {
            return ptr::null_mut();
        }
        match ARENA_USED.compare_exchange_weak(
            offset,
            end,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                return unsafe { ptr::addr_of_mut!(ARENA).cast::<u8>().add(offset) as *mut c_void }
            }
            Err(current) => offset = current,
        }
    }
}

pub fn arena_contains(ptr: *const c_void) -> bool {
    let base = unsafe { ptr::addr_of!(ARENA) as usize };
    (base..base + ARENA_SIZE).contains(&(ptr as usize))
}

/// Bytes between `ptr` and the end of the arena; caps how much a
/// `realloc` away from the arena may copy.
pub fn arena_tail_len(ptr: *const c_void) -> usize {
    let base = unsafe { ptr::addr_of!(ARENA) as usize };
    ARENA_SIZE.saturating_sub((ptr as usize).saturating_sub(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_hands_out_aligned_disjoint_blocks() {
        let a = arena_alloc(10) as usize;
        let b = arena_alloc(1) as usize;
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_eq!(a % ARENA_ALIGN, 0);
        assert_eq!(b % ARENA_ALIGN, 0);
        assert!(b >= a + 16);
    }

    #[test]
    fn arena_membership_is_exact() {
        let p = arena_alloc(32);
        assert!(arena_contains(p));
        assert!(!arena_contains(ptr::null()));
        let stack_local = 0u8;
        assert!(!arena_contains(&stack_local as *const u8 as *const c_void));
    }

    #[test]
    fn arena_tail_shrinks_toward_end() {
        let p = arena_alloc(16);
        let tail = arena_tail_len(p);
        assert!(tail >= 16);
        assert!(tail <= ARENA_SIZE);
    }
}
