extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod binary_image;
pub mod configuration;
pub mod error;
pub mod event;
pub mod ffi;
pub mod profile;
pub mod safe_read;
pub mod serialization;
pub mod session;
pub mod stack_trace;
mod thread_control;
pub mod threads;
pub mod timer_thread_sampler;
mod trace_buffer;
pub mod unwind;
mod util;

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod signal_pauser;
#[cfg(not(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
#[path = "signal_pauser_unsupported_platform.rs"]
mod signal_pauser;

pub use binary_image::{BinaryImage, BuildId, ImageCache};
pub use configuration::{PriorityClass, SamplingConfig};
pub use error::{Error, Result};
pub use profile::Profile;
pub use safe_read::{MemoryReader, SafeMemoryReader};
pub use serialization::serializer::ProfileSerializer;
pub use session::status::ProfilerStatus;
pub use session::{EncodedProfile, Session, SessionOptions};
pub use stack_trace::{StackFrame, StackTrace};
pub use timer_thread_sampler::ThreadSampler;

pub fn init_logging() {
    #[cfg(feature = "debug")]
    {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .format_module_path(false)
            .try_init();
    }
}
