//! Runtime configuration, read once during initialization.
//!
//! Everything here must stay allocation-free: `load` runs on the first
//! intercepted allocator call, before the process heap can be trusted.

use core::ffi::CStr;

use once_cell::sync::OnceCell;

/// Stack traces in reports are on unless the variable is set to exactly `0`.
const STACK_TRACES_VAR: &CStr = c"MEMTRACE_STACK_TRACES";

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Emit captured frames in leak and corruption reports.
    pub stack_traces: bool,
}

const DEFAULT: Config = Config { stack_traces: true };

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Read configuration from the environment. Idempotent; later calls keep
/// the first result.
///
/// # Safety
///
/// Calls `libc::getenv`, which must not race with `setenv` in another
/// thread. Invoked from runtime init, before the target program is
/// meaningfully multi-threaded.
pub unsafe fn load() {
    let stack_traces = match getenv(STACK_TRACES_VAR) {
        Some(value) => !matches!(value.to_bytes(), b"0"),
        None => DEFAULT.stack_traces,
    };
    let _ = CONFIG.set(Config { stack_traces });
}

pub fn get() -> Config {
    CONFIG.get().copied().unwrap_or(DEFAULT)
}

unsafe fn getenv(name: &CStr) -> Option<&'static CStr> {
    let value = libc::getenv(name.as_ptr());
    if value.is_null() {
        None
    } else {
        Some(CStr::from_ptr(value))
    }
}
