//! The process-launch profiler: one global session that starts before
//! application code runs and is stopped, read and destroyed by the host later.

use std::env;
use std::sync::Mutex;

use super::status::ProfilerStatus;
use super::{EncodedProfile, Session, SessionOptions};
use crate::configuration::{self, SamplingConfig};
use crate::util::lock;

pub const PROFILING_ENABLED_ENV: &str = "MPROF_PROFILING_ENABLED";
pub const PROFILING_SAMPLE_RATE_ENV: &str = "MPROF_PROFILING_SAMPLE_RATE";
/// Set by the OS when the process is launched speculatively.
pub const PREWARM_ENV: &str = "ActivePrewarm";

const DEFAULT_SAMPLE_RATE: f64 = 100.0;

static LAUNCH_SESSION: Mutex<Option<Session>> = Mutex::new(None);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LaunchSettings {
    pub enabled: bool,
    pub sample_rate: f64,
    pub prewarmed: bool,
    pub timeout_ns: u64,
}

impl LaunchSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = lookup(PROFILING_ENABLED_ENV)
            .map(|value| {
                matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes"
                )
            })
            .unwrap_or(false);

        let sample_rate = match lookup(PROFILING_SAMPLE_RATE_ENV) {
            None => DEFAULT_SAMPLE_RATE,
            Some(value) => match value.trim().parse::<f64>() {
                Ok(rate) if !rate.is_nan() => rate.clamp(0.0, 100.0),
                _ => {
                    log::warn!("Ignoring invalid {}: {:?}", PROFILING_SAMPLE_RATE_ENV, value);
                    0.0
                }
            },
        };

        let prewarmed = lookup(PREWARM_ENV).as_deref() == Some("1");

        Self {
            enabled,
            sample_rate,
            prewarmed,
            timeout_ns: configuration::DEFAULT_TIMEOUT_NS,
        }
    }

    pub fn clear_env() {
        env::remove_var(PROFILING_ENABLED_ENV);
        env::remove_var(PROFILING_SAMPLE_RATE_ENV);
    }
}

/// Replaces the launch session with a new one and starts it. The decision
/// (sampled out, prewarmed, running) is made before this returns.
pub fn start_testing(sample_rate: f64, prewarmed: bool, timeout_ns: u64) -> ProfilerStatus {
    crate::init_logging();

    let session = Session::new(SessionOptions {
        sample_rate,
        prewarmed,
        timeout_ns,
        sampling: SamplingConfig {
            interval_ns: configuration::LAUNCH_INTERVAL_NS,
            ..Default::default()
        },
    });
    let status = session.start();
    let previous = lock(&LAUNCH_SESSION).replace(session);
    // Joins the old sampler; done outside the lock
    drop(previous);
    status
}

pub fn status() -> ProfilerStatus {
    lock(&LAUNCH_SESSION)
        .as_ref()
        .map_or(ProfilerStatus::NotCreated, Session::status)
}

pub fn stop() {
    if let Some(session) = lock(&LAUNCH_SESSION).as_ref() {
        session.stop();
    }
}

pub fn profile() -> Option<EncodedProfile> {
    lock(&LAUNCH_SESSION).as_ref().and_then(Session::profile)
}

pub fn destroy() {
    let session = lock(&LAUNCH_SESSION).take();
    drop(session);
}

pub fn auto_start() -> Option<ProfilerStatus> {
    let settings = LaunchSettings::from_env();
    if !settings.enabled {
        return None;
    }
    LaunchSettings::clear_env();
    Some(start_testing(
        settings.sample_rate,
        settings.prewarmed,
        settings.timeout_ns,
    ))
}

#[cfg(feature = "auto-start")]
#[ctor::ctor]
fn launch_profiler_auto_start() {
    auto_start();
}
