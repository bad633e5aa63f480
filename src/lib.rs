//! `memtrace` is a heap lifetime profiler for native programs. It watches
//! a target process from inside, preloaded ahead of the system allocator
//! with no recompilation or instrumentation of the target, and reports
//! three classes of bugs when the process exits or misbehaves:
//!
//! - **memory leaks**: allocations still live at program termination,
//! - **double frees**: releasing an address that was already released,
//! - **invalid frees**: releasing an address the allocator never issued.
//!
//! Each finding carries the allocation-site (or release-site) stack trace
//! as raw return addresses; feed them to `addr2line` or a debugger for
//! source positions.
//!
//! ## Using `memtrace` on a program
//!
//! Build the companion [`lib_memtrace`] crate, which compiles into a
//! shared object exporting `malloc`, `free`, `calloc` and `realloc`, and
//! preload it:
//!
//! ```bash
//! LD_PRELOAD=libmemtrace_preload.so ./my_program
//! ```
//!
//! The dynamic linker resolves the program's allocator calls to the
//! preloaded library first; each call is recorded in the allocation
//! registry and then forwarded to the genuine libc implementation,
//! reached via `dlsym(RTLD_NEXT, ...)`. On process exit the registry is
//! drained and anything still live is printed to stderr:
//!
//! ```text
//! ========== MEMORY LEAKS ==========
//! [LEAK] 0x55d2c8a012a0: 1024 bytes
//!   ./my_program(make_buffer+0x1f) [0x55d2c79e41b3]
//!   ...
//!
//! Summary:
//!   Real leaks: 2 allocation(s), 1536 bytes
//!   Libc infrastructure: 3 allocation(s), 1184 bytes (ignored)
//! ==================================
//! ```
//!
//! Allocations libc makes for its own machinery (stdio buffers, locale
//! data) are classified at insert time and summarized instead of being
//! itemized as leaks.
//!
//! ## Configuration
//!
//! | variable | effect |
//! |---|---|
//! | `MEMTRACE_STACK_TRACES=0` | omit stack frames from leak and corruption reports |
//!
//! ## What it will not do
//!
//! Out-of-bounds detection, sampling, statically-allocated memory and
//! targets statically linked against libc are all out of scope, as is
//! symbolizing addresses into source lines: addresses are emitted
//! verbatim.

pub mod binder;
pub mod classify;
pub mod config;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod sync;

pub use classify::Provenance;
pub use registry::{AllocationRecord, MAX_STACK_FRAMES};
