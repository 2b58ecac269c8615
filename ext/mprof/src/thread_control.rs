use crate::error::Result;
use crate::threads;
use crate::unwind::RegisterState;

/// Pauses individual threads so their registers and stack can be inspected.
///
/// The sampling thread owns one instance for the duration of a run.
pub trait ThreadControl: Send {
    fn prepare(&mut self) -> Result<()>;

    fn release(&mut self);

    /// Pauses `tid`, passes its registers to `inspect` and resumes it before
    /// returning. Returns false if the thread could not be paused, for example
    /// because it exited after being enumerated.
    ///
    /// `inspect` runs while the target may hold arbitrary locks (including the
    /// allocator's), so it must not allocate or log.
    fn with_paused_thread(&mut self, tid: u32, inspect: &mut dyn FnMut(RegisterState)) -> bool;

    fn current_thread_id(&self) -> u32 {
        threads::current_thread_id()
    }

    fn list_threads(&mut self, out: &mut Vec<u32>) -> bool {
        threads::list_threads(out)
    }

    fn thread_name(&self, tid: u32) -> Option<String> {
        threads::thread_name(tid)
    }
}
