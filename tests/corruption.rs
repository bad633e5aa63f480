//! Release-validation tests: double frees and invalid frees.
//!
//! Everything lives in one test function on purpose. A detected double
//! free is suppressed before it reaches the real allocator, but that
//! safety net only holds if no concurrent test re-acquires the recycled
//! address in between; a single sequential scenario keeps the process
//! honest.

use memtrace::{registry, runtime};

#[test]
fn double_and_invalid_frees_are_detected_and_suppressed() {
    unsafe {
        runtime::ensure_initialized();

        // Double free: the second release finds no record and must not
        // reach the real allocator (the process would be at the mercy of
        // glibc's abort otherwise).
        let p = runtime::malloc(100);
        assert!(!p.is_null());
        runtime::free(p);
        assert!(!registry::contains(p as usize));
        runtime::free(p);
        assert!(!registry::contains(p as usize));

        // Interleaved variant: a=200, b=300, free a, free b, free a again.
        let a = runtime::malloc(200);
        let b = runtime::malloc(300);
        assert!(!a.is_null() && !b.is_null());
        runtime::free(a);
        runtime::free(b);
        runtime::free(a);
        assert!(!registry::contains(a as usize));
        assert!(!registry::contains(b as usize));

        // Invalid free of a stack address: reported, suppressed, and the
        // process carries on.
        let mut local = 42i32;
        runtime::free(&mut local as *mut i32 as *mut libc::c_void);
        assert_eq!(local, 42);

        // Invalid free of a wild address.
        runtime::free(0xdead_0000usize as *mut libc::c_void);

        // The tracker is still fully functional afterwards.
        let q = runtime::malloc(64);
        assert!(!q.is_null());
        assert!(registry::contains(q as usize));
        runtime::free(q);
        assert!(!registry::contains(q as usize));
    }
}
