use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_INTERVAL_NS: u64 = 1_000_000;
pub const DEFAULT_MAX_BUFFER_SIZE: u32 = 10_000;
pub const DEFAULT_MAX_STACK_DEPTH: u32 = 128;
pub const DEFAULT_MAX_THREAD_COUNT: u32 = 100;
pub const DEFAULT_PRIORITY_CLASS: PriorityClass = PriorityClass::UserInteractive;

/// ~101 Hz, the rate used by the launch profiler.
pub const LAUNCH_INTERVAL_NS: u64 = 9_900_990;
pub const DEFAULT_TIMEOUT_NS: u64 = 5_000_000_000;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SamplingConfig {
    pub interval_ns: u64,
    pub current_thread_only: bool,
    pub max_buffer_size: u32,
    pub max_stack_depth: u32,
    /// 0 means no cap.
    pub max_thread_count: u32,
    pub priority_class: PriorityClass,
    /// Kernel thread id never sampled, in addition to the sampling thread itself.
    pub ignore_thread: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ns: DEFAULT_INTERVAL_NS,
            current_thread_only: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_thread_count: DEFAULT_MAX_THREAD_COUNT,
            priority_class: DEFAULT_PRIORITY_CLASS,
            ignore_thread: None,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ns == 0 {
            return Err(Error::InvalidConfig("interval_ns must be positive"));
        }
        if self.max_buffer_size == 0 {
            return Err(Error::InvalidConfig("max_buffer_size must be positive"));
        }
        if self.max_stack_depth == 0 {
            return Err(Error::InvalidConfig("max_stack_depth must be positive"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityClass {
    UserInteractive,
    UserInitiated,
    Default,
    Utility,
    Background,
}

impl PriorityClass {
    pub fn nice_value(self) -> i32 {
        match self {
            Self::UserInteractive => -10,
            Self::UserInitiated => -5,
            Self::Default => 0,
            Self::Utility => 5,
            Self::Background => 10,
        }
    }
}

impl FromStr for PriorityClass {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user-interactive" => Ok(Self::UserInteractive),
            "user-initiated" => Ok(Self::UserInitiated),
            "default" => Ok(Self::Default),
            "utility" => Ok(Self::Utility),
            "background" => Ok(Self::Background),
            _ => Err(()),
        }
    }
}
