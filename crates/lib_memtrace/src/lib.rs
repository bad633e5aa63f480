//! Companion crate to [`memtrace`]. This crate compiles into a dynamic
//! library that can be loaded via `LD_PRELOAD` to stand in front of the
//! system allocator: the dynamic linker resolves the target program's
//! `malloc`/`free`/`calloc`/`realloc` to the symbols exported here, and
//! each call is recorded by the `memtrace` runtime before (or after)
//! being forwarded to the genuine libc implementation.
//!
//! The constructor initializes the runtime before `main`; the destructor
//! drains the allocation registry and emits the leak report when the
//! library is unloaded at process exit.

use libc::c_void;
use memtrace::runtime;

/// When this library is loaded with `LD_PRELOAD`, this `malloc`
/// implementation catches allocations performed by the program, records
/// them in the allocation registry, and forwards to the real libc malloc.
///
/// # Safety
///
/// Same contract as C `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    runtime::malloc(size)
}

/// Replacement `free`: validates the release against the registry before
/// forwarding; a release of an unowned address is reported and withheld
/// from the real allocator.
///
/// # Safety
///
/// Same contract as C `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    runtime::free(ptr)
}

/// # Safety
///
/// Same contract as C `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
    runtime::calloc(nmemb, size)
}

/// # Safety
///
/// Same contract as C `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    runtime::realloc(ptr, size)
}

/// Library constructor: bring the runtime up before `main`, while the
/// process is still single-threaded.
#[used]
#[link_section = ".init_array"]
static MEMTRACE_CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn ctor() {
        runtime::ensure_initialized();
    }
    ctor
};

/// Library destructor: drain the registry and report leaks on unload.
#[used]
#[link_section = ".fini_array"]
static MEMTRACE_DTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn dtor() {
        runtime::shutdown();
    }
    dtor
};
