#![deny(unsafe_op_in_unsafe_fn)]

//! Pauses one thread at a time by queueing SIGPROF to it.
//!
//! The handler publishes the interrupted PC and FP into a pause slot, then
//! blocks on a futex until the sampling thread marks the slot resumed. Slots
//! live in a static pool, so a signal that lands after the sampler gave up on
//! it finds a withdrawn request instead of freed memory.

use std::ffi::{c_int, c_void};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::thread_control::ThreadControl;
use crate::unwind::RegisterState;
use crate::util::*;

const PAUSE_SIGNAL: c_int = libc::SIGPROF;
const SLOT_COUNT: usize = 16;

// The slot state word is `generation << PHASE_BITS | phase`. Every request
// bumps the generation, so a late signal from an abandoned request can never
// claim the slot for the next one.
const PHASE_BITS: u32 = 3;
const PHASE_MASK: u32 = (1 << PHASE_BITS) - 1;
const GENERATION_MASK: u32 = u32::MAX >> PHASE_BITS;
// si_value carries `generation << SLOT_BITS | slot index`.
const SLOT_BITS: u32 = 8;

const IDLE: u32 = 0;
const REQUESTED: u32 = 1;
const CAPTURING: u32 = 2;
const CAPTURED: u32 = 3;
const RESUMED: u32 = 4;

const CAPTURE_TIMEOUT_NS: u64 = 20_000_000;
const PARK_TIMEOUT_NS: u64 = 200_000_000;

fn state_word(generation: u32, phase: u32) -> u32 {
    (generation & GENERATION_MASK) << PHASE_BITS | phase
}

fn phase_of(state: u32) -> u32 {
    state & PHASE_MASK
}

fn encode_request(index: usize, generation: u32) -> usize {
    (generation as usize) << SLOT_BITS | index
}

fn decode_request(value: usize) -> (usize, u32) {
    (
        value & ((1 << SLOT_BITS) - 1),
        (value >> SLOT_BITS) as u32 & GENERATION_MASK,
    )
}

struct PauseSlot {
    claimed: AtomicBool,
    generation: AtomicU32,
    state: AtomicU32,
    target: AtomicU32,
    pc: AtomicU64,
    fp: AtomicU64,
}

impl PauseSlot {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            state: AtomicU32::new(IDLE),
            target: AtomicU32::new(0),
            pc: AtomicU64::new(0),
            fp: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & GENERATION_MASK
    }

    // Runs in the signal handler.
    fn capture(&self, generation: u32, tid: u32, regs: RegisterState) -> bool {
        if self.target.load(Ordering::Acquire) != tid {
            return false;
        }
        if self
            .state
            .compare_exchange(
                state_word(generation, REQUESTED),
                state_word(generation, CAPTURING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Withdrawn, or the slot moved on to a newer request
            return false;
        }
        self.pc.store(regs.pc, Ordering::Relaxed);
        self.fp.store(regs.fp, Ordering::Relaxed);
        self.state.store(state_word(generation, CAPTURED), Ordering::Release);
        futex_wake(&self.state);
        true
    }

    // Runs in the signal handler, after a successful capture.
    fn park(&self, generation: u32) {
        let state = wait_while(&self.state, state_word(generation, CAPTURED), PARK_TIMEOUT_NS);
        let _ = self.state.compare_exchange(
            state,
            state_word(generation, IDLE),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        futex_wake(&self.state);
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: PauseSlot = PauseSlot::new();
static SLOTS: [PauseSlot; SLOT_COUNT] = [EMPTY_SLOT; SLOT_COUNT];

// Previously installed disposition, for signals that are not pause requests.
static PREVIOUS_ACTION: OnceLock<std::result::Result<libc::sigaction, i32>> = OnceLock::new();

fn install_signal_handler() -> Result<()> {
    let installed = PREVIOUS_ACTION.get_or_init(|| {
        let mut sa: libc::sigaction = unsafe { mem::zeroed() };
        sa.sa_sigaction = handle_pause_request as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
        unsafe { libc::sigemptyset(&mut sa.sa_mask) };

        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        let err = unsafe { libc::sigaction(PAUSE_SIGNAL, &sa, &mut previous) };
        if err != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
        }
        log::debug!("Pause signal handler installed");
        Ok(previous)
    });
    match installed {
        Ok(_) => Ok(()),
        Err(errno) => Err(Error::Signal(io::Error::from_raw_os_error(*errno))),
    }
}

fn monotonic_nanos() -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

// Raw futex calls are async-signal-safe, unlike Mutex/Condvar or park.
fn futex_wait(word: &AtomicU32, expected: u32, timeout_ns: u64) {
    let timeout = libc::timespec {
        tv_sec: (timeout_ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (timeout_ns % 1_000_000_000) as libc::c_long,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            &timeout as *const libc::timespec,
        )
    };
}

fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        )
    };
}

fn wait_while(word: &AtomicU32, current: u32, timeout_ns: u64) -> u32 {
    let deadline = monotonic_nanos().saturating_add(timeout_ns);
    loop {
        let state = word.load(Ordering::Acquire);
        if state != current {
            return state;
        }
        let now = monotonic_nanos();
        if now >= deadline {
            return state;
        }
        futex_wait(word, current, deadline - now);
    }
}

#[cfg(target_os = "linux")]
fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(target_os = "android")]
fn errno_location() -> *mut c_int {
    unsafe { libc::__errno() }
}

#[cfg(target_arch = "x86_64")]
unsafe fn registers_from_context(ucontext: *mut c_void) -> Option<RegisterState> {
    const REG_RBP: usize = 10;
    const REG_RIP: usize = 16;

    if ucontext.is_null() {
        return None;
    }
    let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
    Some(RegisterState {
        pc: uc.uc_mcontext.gregs[REG_RIP] as u64,
        fp: uc.uc_mcontext.gregs[REG_RBP] as u64,
    })
}

#[cfg(target_arch = "aarch64")]
unsafe fn registers_from_context(ucontext: *mut c_void) -> Option<RegisterState> {
    if ucontext.is_null() {
        return None;
    }
    let uc = unsafe { &*(ucontext as *const libc::ucontext_t) };
    Some(RegisterState {
        pc: uc.uc_mcontext.pc,
        fp: uc.uc_mcontext.regs[29],
    })
}

fn forward_to_previous(sig: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let Some(Ok(previous)) = PREVIOUS_ACTION.get() else {
        return;
    };
    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        return;
    }
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            unsafe { mem::transmute(handler) };
        f(sig, info, ucontext);
    } else {
        let f: extern "C" fn(c_int) = unsafe { mem::transmute(handler) };
        f(sig);
    }
}

extern "C" fn handle_pause_request(sig: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    // futex timeouts set errno
    let errno = errno_location();
    let saved_errno = unsafe { *errno };
    serve_pause_request(sig, info, ucontext);
    unsafe { *errno = saved_errno };
}

// Async-signal-safe: atomics and raw syscalls only.
fn serve_pause_request(sig: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    if info.is_null() {
        return;
    }
    if unsafe { extract_si_code(info) } != libc::SI_QUEUE {
        forward_to_previous(sig, info, ucontext);
        return;
    }
    let (index, generation) = decode_request(unsafe { extract_si_value_sival_ptr(info) } as usize);
    let Some(slot) = SLOTS.get(index) else {
        forward_to_previous(sig, info, ucontext);
        return;
    };

    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
    let Some(regs) = (unsafe { registers_from_context(ucontext) }) else {
        return;
    };
    if slot.capture(generation, tid, regs) {
        slot.park(generation);
    }
}

#[derive(Debug)]
pub struct SignalPauser {
    slot: Option<usize>,
    pid: libc::pid_t,
}

impl SignalPauser {
    pub fn new() -> Self {
        Self {
            slot: None,
            pid: unsafe { libc::getpid() },
        }
    }

    fn claim_slot() -> Option<usize> {
        SLOTS.iter().position(|slot| {
            slot.claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }
}

impl Default for SignalPauser {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalPauser {
    fn drop(&mut self) {
        self.release();
    }
}

impl ThreadControl for SignalPauser {
    fn prepare(&mut self) -> Result<()> {
        install_signal_handler()?;
        if self.slot.is_none() {
            self.slot = Some(Self::claim_slot().ok_or(Error::NoPauseSlot)?);
        }
        self.pid = unsafe { libc::getpid() };
        Ok(())
    }

    fn release(&mut self) {
        if let Some(index) = self.slot.take() {
            let slot = &SLOTS[index];
            slot.target.store(0, Ordering::Release);
            slot.claimed.store(false, Ordering::Release);
        }
    }

    fn with_paused_thread(&mut self, tid: u32, inspect: &mut dyn FnMut(RegisterState)) -> bool {
        let Some(index) = self.slot else {
            return false;
        };
        let slot = &SLOTS[index];
        let generation = slot.next_generation();
        let requested = state_word(generation, REQUESTED);
        let idle = state_word(generation, IDLE);

        slot.target.store(tid, Ordering::Release);
        slot.state.store(requested, Ordering::Release);
        let rc = unsafe {
            queue_signal_to_thread(
                self.pid,
                tid as libc::pid_t,
                PAUSE_SIGNAL,
                encode_request(index, generation) as *mut c_void,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            slot.state.store(idle, Ordering::Release);
            slot.target.store(0, Ordering::Release);
            if err.raw_os_error() == Some(libc::ESRCH) {
                log::trace!("Thread {} exited before it could be paused", tid);
            } else {
                log::debug!("Failed to signal thread {}: {}", tid, err);
            }
            return false;
        }

        let mut state = wait_while(&slot.state, requested, CAPTURE_TIMEOUT_NS);
        if state == requested {
            match slot
                .state
                .compare_exchange(requested, idle, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    slot.target.store(0, Ordering::Release);
                    log::trace!("Thread {} did not respond to the pause signal", tid);
                    return false;
                }
                Err(current) => state = current,
            }
        }
        if phase_of(state) == CAPTURING {
            state = wait_while(&slot.state, state, CAPTURE_TIMEOUT_NS);
        }
        let captured = state_word(generation, CAPTURED);
        if state != captured {
            slot.target.store(0, Ordering::Release);
            log::debug!("Thread {} left the pause handler early", tid);
            return false;
        }

        let regs = RegisterState {
            pc: slot.pc.load(Ordering::Relaxed),
            fp: slot.fp.load(Ordering::Relaxed),
        };
        inspect(regs);

        let resumed = state_word(generation, RESUMED);
        // Fails only if the handler already gave up parking
        if slot
            .state
            .compare_exchange(captured, resumed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            futex_wake(&slot.state);
            if wait_while(&slot.state, resumed, PARK_TIMEOUT_NS) == resumed {
                let _ = slot.state.compare_exchange(
                    resumed,
                    idle,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        slot.target.store(0, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_image::is_valid_userspace_addr;
    use crate::threads::current_thread_id;
    use std::hint::black_box;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    fn spawn_spinner() -> (u32, Arc<AtomicUsize>, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let progress = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let handle = {
            let progress = Arc::clone(&progress);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                tx.send(current_thread_id()).unwrap();
                while !done.load(Ordering::Relaxed) {
                    progress.fetch_add(black_box(1), Ordering::Relaxed);
                }
            })
        };
        (rx.recv().unwrap(), progress, done, handle)
    }

    #[test]
    fn test_pauses_and_resumes_thread() {
        let (tid, progress, done, handle) = spawn_spinner();
        let mut pauser = SignalPauser::new();
        pauser.prepare().unwrap();

        let mut captured = None;
        let mut frozen = None;
        let paused = pauser.with_paused_thread(tid, &mut |regs| {
            captured = Some(regs);
            let before = progress.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(5));
            frozen = Some(before == progress.load(Ordering::Relaxed));
        });
        assert!(paused);
        assert!(is_valid_userspace_addr(captured.unwrap().pc));
        assert_eq!(frozen, Some(true));

        // Runs again once resumed
        let after = progress.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(5));
        assert!(progress.load(Ordering::Relaxed) > after);

        done.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        pauser.release();
    }

    #[test]
    fn test_exited_thread_is_skipped() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || tx.send(current_thread_id()).unwrap())
            .join()
            .unwrap();
        let tid = rx.recv().unwrap();

        let mut pauser = SignalPauser::new();
        pauser.prepare().unwrap();
        let mut called = false;
        assert!(!pauser.with_paused_thread(tid, &mut |_| called = true));
        assert!(!called);
    }

    #[test]
    fn test_requires_prepare() {
        let mut pauser = SignalPauser::new();
        assert!(!pauser.with_paused_thread(current_thread_id(), &mut |_| {}));
    }

    #[test]
    fn test_release_frees_slot() {
        let mut pauser = SignalPauser::new();
        pauser.prepare().unwrap();
        let index = pauser.slot.unwrap();
        assert!(SLOTS[index].claimed.load(Ordering::Acquire));
        pauser.release();
        assert!(pauser.slot.is_none());
    }

    #[test]
    fn test_request_encoding() {
        let value = encode_request(15, GENERATION_MASK);
        assert_eq!(decode_request(value), (15, GENERATION_MASK));
        assert_eq!(decode_request(encode_request(3, 7)), (3, 7));
        assert_eq!(phase_of(state_word(GENERATION_MASK, RESUMED)), RESUMED);
    }

    #[test]
    fn test_late_signal_cannot_claim_newer_request() {
        let slot = PauseSlot::new();
        let stale = slot.next_generation();
        let current = slot.next_generation();
        slot.target.store(42, Ordering::Release);
        slot.state.store(state_word(current, REQUESTED), Ordering::Release);

        let regs = RegisterState {
            pc: 0x1111_0000,
            fp: 0x2222_0000,
        };
        assert!(!slot.capture(stale, 42, regs));
        assert_eq!(slot.pc.load(Ordering::Relaxed), 0);
        assert!(!slot.capture(current, 7, regs));
        assert_eq!(
            slot.state.load(Ordering::Acquire),
            state_word(current, REQUESTED)
        );

        assert!(slot.capture(current, 42, regs));
        assert_eq!(
            slot.state.load(Ordering::Acquire),
            state_word(current, CAPTURED)
        );
        assert_eq!(slot.pc.load(Ordering::Relaxed), 0x1111_0000);
        assert_eq!(slot.fp.load(Ordering::Relaxed), 0x2222_0000);
    }

    #[test]
    fn test_withdrawn_request_is_not_captured() {
        let slot = PauseSlot::new();
        let generation = slot.next_generation();
        slot.target.store(42, Ordering::Release);
        slot.state.store(state_word(generation, IDLE), Ordering::Release);
        let regs = RegisterState { pc: 1, fp: 2 };
        assert!(!slot.capture(generation, 42, regs));
    }

    fn mean_pause_latency(tid: u32, pauses: u32) -> Duration {
        let mut pauser = SignalPauser::new();
        pauser.prepare().unwrap();
        let started = Instant::now();
        for _ in 0..pauses {
            assert!(pauser.with_paused_thread(tid, &mut |_| {}));
        }
        started.elapsed() / pauses
    }

    #[test]
    fn test_pause_latency_is_bounded() {
        let (tid, _progress, done, spinner) = spawn_spinner();
        let spinning = mean_pause_latency(tid, 200);
        done.store(true, Ordering::Relaxed);
        spinner.join().unwrap();

        let (tx, rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let sleeper = thread::spawn(move || {
            tx.send(current_thread_id()).unwrap();
            let _ = stop_rx.recv();
        });
        let sleeping = mean_pause_latency(rx.recv().unwrap(), 200);
        drop(stop_tx);
        sleeper.join().unwrap();

        assert!(spinning < Duration::from_millis(2), "{:?}", spinning);
        assert!(sleeping < Duration::from_millis(2), "{:?}", sleeping);
    }
}
