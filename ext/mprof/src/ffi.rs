#![allow(non_camel_case_types)]
#![deny(unsafe_op_in_unsafe_fn)]

//! C ABI. Null handles are tolerated everywhere: they make queries return
//! false/null and commands do nothing.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr::{self, null, null_mut};
use std::slice;
use std::sync::RwLock;

use crate::binary_image::{BinaryImage, BuildId};
use crate::configuration::{PriorityClass, SamplingConfig};
use crate::profile::Profile;
use crate::serialization::serializer::ProfileSerializer;
use crate::session::launch;
use crate::session::EncodedProfile;
use crate::stack_trace::{StackFrame, StackTrace};
use crate::timer_thread_sampler::ThreadSampler;
use crate::util::{read, write};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mprof_sampling_config {
    pub interval_ns: u64,
    pub current_thread_only: bool,
    pub max_buffer_size: u32,
    pub max_stack_depth: u32,
    pub max_thread_count: u32,
    /// 0 user-interactive, 1 user-initiated, 2 default, 3 utility, 4 background.
    pub priority_class: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mprof_stack_frame {
    pub instruction_pointer: u64,
    pub load_address: u64,
    pub build_id: [u8; 16],
    /// Null if unresolved.
    pub filename: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mprof_stack_trace {
    pub thread_id: u32,
    pub thread_name: *const c_char,
    pub timestamp: u64,
    pub sampling_interval_ns: u64,
    pub frames: *const mprof_stack_frame,
    pub frame_count: u32,
}

/// Everything pointed to is valid only for the duration of the call.
pub type mprof_trace_callback = Option<
    unsafe extern "C" fn(traces: *const mprof_stack_trace, count: usize, user_data: *mut c_void),
>;

#[repr(C)]
#[derive(Debug)]
pub struct mprof_encoded_profile {
    pub start: u64,
    pub end: u64,
    /// Release with `mprof_bytes_free`.
    pub bytes: *mut u8,
    pub len: usize,
}

pub struct mprof_profiler {
    sampler: ThreadSampler,
}

pub struct mprof_profile {
    profile: RwLock<Profile>,
}

struct UserData(*mut c_void);

// The pointer is only handed back to the caller's callback.
unsafe impl Send for UserData {}

fn priority_from_raw(raw: c_int) -> PriorityClass {
    match raw {
        1 => PriorityClass::UserInitiated,
        2 => PriorityClass::Default,
        3 => PriorityClass::Utility,
        4 => PriorityClass::Background,
        _ => PriorityClass::UserInteractive,
    }
}

impl From<&mprof_sampling_config> for SamplingConfig {
    fn from(config: &mprof_sampling_config) -> Self {
        Self {
            interval_ns: config.interval_ns,
            current_thread_only: config.current_thread_only,
            max_buffer_size: config.max_buffer_size,
            max_stack_depth: config.max_stack_depth,
            max_thread_count: config.max_thread_count,
            priority_class: priority_from_raw(config.priority_class),
            ignore_thread: None,
        }
    }
}

/// C views over one batch. Owns the strings the views point into.
struct BatchView {
    _strings: Vec<CString>,
    _frames: Vec<Vec<mprof_stack_frame>>,
    traces: Vec<mprof_stack_trace>,
}

impl BatchView {
    fn new(batch: &[StackTrace]) -> Self {
        let mut strings = Vec::new();
        let mut keep = |s: Option<&str>| -> *const c_char {
            match s.and_then(|s| CString::new(s).ok()) {
                Some(owned) => {
                    let ptr = owned.as_ptr();
                    strings.push(owned);
                    ptr
                }
                None => null(),
            }
        };

        let mut frames = Vec::with_capacity(batch.len());
        let mut traces = Vec::with_capacity(batch.len());
        for trace in batch {
            let views: Vec<mprof_stack_frame> = trace
                .frames
                .iter()
                .map(|frame| mprof_stack_frame {
                    instruction_pointer: frame.instruction_pointer,
                    load_address: frame.image.load_address,
                    build_id: frame.image.build_id.0,
                    filename: keep(frame.image.filename.as_deref()),
                })
                .collect();
            traces.push(mprof_stack_trace {
                thread_id: trace.thread_id,
                thread_name: keep(trace.thread_name.as_deref()),
                timestamp: trace.timestamp,
                sampling_interval_ns: trace.sampling_interval_ns,
                frames: views.as_ptr(),
                frame_count: trace.frame_count(),
            });
            frames.push(views);
        }
        Self {
            _strings: strings,
            _frames: frames,
            traces,
        }
    }
}

unsafe fn string_from_raw(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Copies C traces into owned ones.
unsafe fn traces_from_raw(traces: *const mprof_stack_trace, count: usize) -> Vec<StackTrace> {
    if traces.is_null() || count == 0 {
        return Vec::new();
    }
    let raw_traces = unsafe { slice::from_raw_parts(traces, count) };
    raw_traces
        .iter()
        .map(|raw| {
            let frames = if raw.frames.is_null() {
                &[][..]
            } else {
                unsafe { slice::from_raw_parts(raw.frames, raw.frame_count as usize) }
            };
            StackTrace {
                thread_id: raw.thread_id,
                thread_name: unsafe { string_from_raw(raw.thread_name) },
                timestamp: raw.timestamp,
                sampling_interval_ns: raw.sampling_interval_ns,
                frames: frames
                    .iter()
                    .map(|frame| StackFrame {
                        instruction_pointer: frame.instruction_pointer,
                        image: BinaryImage {
                            load_address: frame.load_address,
                            build_id: BuildId(frame.build_id),
                            filename: unsafe { string_from_raw(frame.filename) },
                        },
                    })
                    .collect(),
            }
        })
        .collect()
}

fn bytes_into_raw(bytes: Vec<u8>) -> (*mut u8, usize) {
    let len = bytes.len();
    let ptr = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
    (ptr, len)
}

/// Creates a sampler. `config` may be null for defaults. Returns null if
/// `callback` is null or the configuration is invalid.
#[no_mangle]
pub unsafe extern "C" fn mprof_profiler_create(
    config: *const mprof_sampling_config,
    callback: mprof_trace_callback,
    user_data: *mut c_void,
) -> *mut mprof_profiler {
    crate::init_logging();

    let Some(callback) = callback else {
        log::warn!("mprof_profiler_create: callback is null");
        return null_mut();
    };
    let configuration = match unsafe { config.as_ref() } {
        Some(config) => SamplingConfig::from(config),
        None => SamplingConfig::default(),
    };

    let user_data = UserData(user_data);
    let sampler = ThreadSampler::new(configuration, move |batch: &mut [StackTrace]| {
        let view = BatchView::new(batch);
        // Borrow the wrapper so the closure captures it whole
        let user_data = &user_data;
        unsafe { callback(view.traces.as_ptr(), view.traces.len(), user_data.0) };
    });
    match sampler {
        Ok(sampler) => Box::into_raw(Box::new(mprof_profiler { sampler })),
        Err(err) => {
            log::warn!("mprof_profiler_create: {}", err);
            null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn mprof_profiler_start(profiler: *mut mprof_profiler) -> bool {
    let Some(profiler) = (unsafe { profiler.as_ref() }) else {
        return false;
    };
    match profiler.sampler.start() {
        Ok(()) => true,
        Err(err) => {
            log::debug!("mprof_profiler_start: {}", err);
            false
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn mprof_profiler_stop(profiler: *mut mprof_profiler) {
    if let Some(profiler) = unsafe { profiler.as_ref() } {
        profiler.sampler.stop();
    }
}

#[no_mangle]
pub unsafe extern "C" fn mprof_profiler_is_running(profiler: *const mprof_profiler) -> bool {
    unsafe { profiler.as_ref() }.is_some_and(|profiler| profiler.sampler.is_running())
}

/// Stops the sampler if needed and frees it. Null is ignored.
#[no_mangle]
pub unsafe extern "C" fn mprof_profiler_destroy(profiler: *mut mprof_profiler) {
    if !profiler.is_null() {
        drop(unsafe { Box::from_raw(profiler) });
    }
}

#[no_mangle]
pub extern "C" fn mprof_profile_create(sampling_interval_ns: u64) -> *mut mprof_profile {
    Box::into_raw(Box::new(mprof_profile {
        profile: RwLock::new(Profile::new(sampling_interval_ns)),
    }))
}

#[no_mangle]
pub unsafe extern "C" fn mprof_profile_add_samples(
    profile: *mut mprof_profile,
    traces: *const mprof_stack_trace,
    count: usize,
) {
    let Some(profile) = (unsafe { profile.as_ref() }) else {
        return;
    };
    let traces = unsafe { traces_from_raw(traces, count) };
    write(&profile.profile).add_samples(&traces);
}

/// Writes the pprof encoding to `*out_bytes` and returns its length. The
/// buffer is released with `mprof_bytes_free`. Returns 0 on a null argument.
#[no_mangle]
pub unsafe extern "C" fn mprof_profile_serialize(
    profile: *const mprof_profile,
    out_bytes: *mut *mut u8,
) -> usize {
    let Some(profile) = (unsafe { profile.as_ref() }) else {
        return 0;
    };
    if out_bytes.is_null() {
        return 0;
    }
    let (ptr, len) = bytes_into_raw(ProfileSerializer::serialize(&read(&profile.profile)));
    unsafe { ptr::write(out_bytes, ptr) };
    len
}

#[no_mangle]
pub unsafe extern "C" fn mprof_profile_destroy(profile: *mut mprof_profile) {
    if !profile.is_null() {
        drop(unsafe { Box::from_raw(profile) });
    }
}

/// Frees a buffer returned by this library. `len` must be the length it was
/// returned with.
#[no_mangle]
pub unsafe extern "C" fn mprof_bytes_free(bytes: *mut u8, len: usize) {
    if !bytes.is_null() {
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(bytes, len)) });
    }
}

#[no_mangle]
pub extern "C" fn mprof_launch_profiler_start_testing(
    sample_rate: f64,
    prewarmed: bool,
    timeout_ns: i64,
) -> u32 {
    launch::start_testing(sample_rate, prewarmed, timeout_ns.max(0) as u64).as_raw()
}

#[no_mangle]
pub extern "C" fn mprof_launch_profiler_get_status() -> u32 {
    launch::status().as_raw()
}

#[no_mangle]
pub extern "C" fn mprof_launch_profiler_stop() {
    launch::stop();
}

/// Fills `out` with the launch profile. Returns false (leaving `out`
/// untouched) if there is none.
#[no_mangle]
pub unsafe extern "C" fn mprof_launch_profiler_get_profile(
    out: *mut mprof_encoded_profile,
) -> bool {
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    let Some(EncodedProfile { start, end, bytes }) = launch::profile() else {
        return false;
    };
    let (ptr, len) = bytes_into_raw(bytes);
    *out = mprof_encoded_profile {
        start,
        end,
        bytes: ptr,
        len,
    };
    true
}

#[no_mangle]
pub extern "C" fn mprof_launch_profiler_destroy() {
    launch::destroy();
}
