/// Lifecycle of a profiling session. Numeric values are part of the C ABI.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerStatus {
    NotCreated = 0,
    NotStarted = 1,
    Running = 2,
    Stopped = 3,
    Timeout = 4,
    Prewarmed = 5,
    SampledOut = 6,
    AllocationFailed = 7,
    AlreadyStarted = 8,
}

impl ProfilerStatus {
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::NotCreated,
            1 => Self::NotStarted,
            2 => Self::Running,
            3 => Self::Stopped,
            4 => Self::Timeout,
            5 => Self::Prewarmed,
            6 => Self::SampledOut,
            7 => Self::AllocationFailed,
            8 => Self::AlreadyStarted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NotStarted,
    Manual,
    Timeout,
    Prewarmed,
    SampledOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    MemoryAllocationFailed,
    AlreadyStarted,
}

/// Coarse status published to consumers that don't care about the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ContextStatus {
    Running,
    Stopped(StopReason),
    Error(ErrorReason),
}

impl From<ProfilerStatus> for ContextStatus {
    fn from(status: ProfilerStatus) -> Self {
        match status {
            ProfilerStatus::NotCreated | ProfilerStatus::NotStarted => {
                Self::Stopped(StopReason::NotStarted)
            }
            ProfilerStatus::Running => Self::Running,
            ProfilerStatus::Stopped => Self::Stopped(StopReason::Manual),
            ProfilerStatus::Timeout => Self::Stopped(StopReason::Timeout),
            ProfilerStatus::Prewarmed => Self::Stopped(StopReason::Prewarmed),
            ProfilerStatus::SampledOut => Self::Stopped(StopReason::SampledOut),
            ProfilerStatus::AllocationFailed => Self::Error(ErrorReason::MemoryAllocationFailed),
            ProfilerStatus::AlreadyStarted => Self::Error(ErrorReason::AlreadyStarted),
        }
    }
}
