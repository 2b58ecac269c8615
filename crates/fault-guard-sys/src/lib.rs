//! Raw bindings to the fault-guarded copy shim compiled by `build.rs`.
//!
//! `sigsetjmp`/`siglongjmp` cannot be used soundly from Rust, so the recovery
//! logic lives in C and this crate only declares its surface.

use std::ffi::{c_int, c_void};

extern "C" {
    /// Installs the process-wide SIGSEGV/SIGBUS handlers. Idempotent.
    ///
    /// Returns 0 on success or an errno value. Previously installed handlers are
    /// kept and receive every fault that does not happen inside a guarded copy.
    pub fn fault_guard_install() -> c_int;

    /// Copies `len` bytes from `src` to `dst`, returning 1 on success and 0 if
    /// the read faulted. `dst` must be valid for `len` bytes; `src` may be any
    /// address.
    pub fn fault_guard_copy(dst: *mut c_void, src: *const c_void, len: usize) -> c_int;

    /// Returns non-zero while the calling thread is inside `fault_guard_copy`.
    pub fn fault_guard_is_active() -> c_int;
}
