use std::ffi::{c_int, c_void};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// Profiler state stays consistent across a panicking callback, so poisoned
// locks are taken over instead of propagated.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

extern "C" {
    pub fn extract_si_value_sival_ptr(info: *mut libc::siginfo_t) -> *mut c_void;
    pub fn extract_si_code(info: *mut libc::siginfo_t) -> c_int;
    pub fn queue_signal_to_thread(
        tgid: libc::pid_t,
        tid: libc::pid_t,
        sig: c_int,
        value: *mut c_void,
    ) -> c_int;
}
