pub mod launch;
pub mod status;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use crate::configuration::{self, SamplingConfig};
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::serialization::serializer::ProfileSerializer;
use crate::stack_trace::StackTrace;
use crate::timer_thread_sampler::ThreadSampler;
use crate::util::*;

use self::status::ProfilerStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedProfile {
    pub start: u64,
    pub end: u64,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub sample_rate: f64,
    pub prewarmed: bool,
    /// Sampling stops by itself after this long. 0 disables the timeout.
    pub timeout_ns: u64,
    pub sampling: SamplingConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sample_rate: 100.0,
            prewarmed: false,
            timeout_ns: configuration::DEFAULT_TIMEOUT_NS,
            sampling: SamplingConfig {
                interval_ns: configuration::LAUNCH_INTERVAL_NS,
                ..Default::default()
            },
        }
    }
}

pub fn should_sample(sample_rate: f64) -> bool {
    if sample_rate.is_nan() || sample_rate <= 0.0 {
        return false;
    }
    if sample_rate >= 100.0 {
        return true;
    }
    rand::thread_rng().gen_range(0.0..100.0) < sample_rate
}

/// One profiling run: a sampler feeding an aggregate profile, driven by the
/// status state machine.
pub struct Session {
    inner: Arc<Inner>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    options: SessionOptions,
    status: AtomicU32,
    started_at: AtomicU64,
    sampler: Mutex<Option<ThreadSampler>>,
    profile: Arc<RwLock<Option<Profile>>>,
    cancelled: Mutex<bool>,
    cancel_signal: Condvar,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                status: AtomicU32::new(ProfilerStatus::NotStarted.as_raw()),
                started_at: AtomicU64::new(0),
                sampler: Mutex::new(None),
                profile: Arc::new(RwLock::new(None)),
                cancelled: Mutex::new(false),
                cancel_signal: Condvar::new(),
            }),
            watchdog: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn status(&self) -> ProfilerStatus {
        self.inner.status()
    }

    /// Decides whether this session runs and starts sampling if so. Only the
    /// first call has an effect; later calls return the current status.
    pub fn start(&self) -> ProfilerStatus {
        let inner = &self.inner;
        let mut sampler = lock(&inner.sampler);
        let current = inner.status();
        if current != ProfilerStatus::NotStarted {
            log::debug!("Session already decided ({:?})", current);
            return current;
        }

        let next = if inner.options.prewarmed {
            ProfilerStatus::Prewarmed
        } else if !should_sample(inner.options.sample_rate) {
            ProfilerStatus::SampledOut
        } else {
            match inner.launch_sampler() {
                Ok(started) => {
                    *sampler = Some(started);
                    ProfilerStatus::Running
                }
                Err(Error::AlreadyRunning) => ProfilerStatus::AlreadyStarted,
                Err(Error::Unsupported(reason)) => {
                    log::info!("Profiling unavailable: {}", reason);
                    ProfilerStatus::NotStarted
                }
                Err(err) => {
                    log::warn!("Failed to start sampler: {}", err);
                    ProfilerStatus::AllocationFailed
                }
            }
        };
        if next != ProfilerStatus::Running {
            *write(&inner.profile) = None;
        }
        inner.set_status(next);
        drop(sampler);

        if next == ProfilerStatus::Running && inner.options.timeout_ns > 0 {
            if let Err(err) = self.spawn_watchdog() {
                log::warn!("Failed to start profiling timeout: {}", err);
                inner.halt(ProfilerStatus::AllocationFailed);
                *write(&inner.profile) = None;
                return ProfilerStatus::AllocationFailed;
            }
        }
        log::debug!("Session status: {:?}", next);
        next
    }

    fn spawn_watchdog(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let timeout = Duration::from_nanos(inner.options.timeout_ns);
        let handle = thread::Builder::new()
            .name("mprof.watchdog".to_string())
            .spawn(move || {
                let cancelled = lock(&inner.cancelled);
                let (cancelled, _) = inner
                    .cancel_signal
                    .wait_timeout_while(cancelled, timeout, |cancelled| !*cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
                if *cancelled {
                    return;
                }
                drop(cancelled);
                if inner.halt(ProfilerStatus::Timeout) {
                    log::info!("Profiling timed out after {:?}", timeout);
                }
            })
            .map_err(Error::Spawn)?;
        *lock(&self.watchdog) = Some(handle);
        Ok(())
    }

    fn cancel_watchdog(&self) {
        *lock(&self.inner.cancelled) = true;
        self.inner.cancel_signal.notify_all();
        if let Some(handle) = lock(&self.watchdog).take() {
            let _ = handle.join();
        }
    }

    pub fn stop(&self) {
        self.cancel_watchdog();
        if self.inner.halt(ProfilerStatus::Stopped) {
            log::debug!("Session stopped");
        }
    }

    pub fn profile(&self) -> Option<EncodedProfile> {
        let profile = read(&self.inner.profile);
        profile.as_ref().map(|profile| self.inner.encode(profile))
    }

    /// Like [`Session::profile`], but starts a fresh aggregate so the next
    /// call only covers samples taken after this one.
    pub fn take_profile(&self) -> Option<EncodedProfile> {
        let mut profile = write(&self.inner.profile);
        let interval = self.inner.options.sampling.interval_ns;
        let taken = profile.replace(Profile::new(interval))?;
        Some(self.inner.encode(&taken))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_watchdog();
        self.inner.halt(ProfilerStatus::Stopped);
    }
}

impl Inner {
    fn status(&self) -> ProfilerStatus {
        ProfilerStatus::from_raw(self.status.load(Ordering::Acquire))
            .unwrap_or(ProfilerStatus::NotCreated)
    }

    fn set_status(&self, status: ProfilerStatus) {
        self.status.store(status.as_raw(), Ordering::Release);
    }

    fn launch_sampler(&self) -> Result<ThreadSampler> {
        let interval = self.options.sampling.interval_ns;
        *write(&self.profile) = Some(Profile::new(interval));
        self.started_at.store(epoch_nanos(), Ordering::Release);

        let profile = Arc::clone(&self.profile);
        let sampler = ThreadSampler::new(
            self.options.sampling.clone(),
            move |traces: &mut [StackTrace]| {
                if let Some(profile) = write(&profile).as_mut() {
                    profile.add_samples(traces);
                }
            },
        )?;
        sampler.start()?;
        Ok(sampler)
    }

    /// Stops the sampler and moves a running session to `to`. Returns false if
    /// the session was not running.
    fn halt(&self, to: ProfilerStatus) -> bool {
        let mut sampler = lock(&self.sampler);
        let Some(running) = sampler.take() else {
            return false;
        };
        running.stop();
        self.status
            .compare_exchange(
                ProfilerStatus::Running.as_raw(),
                to.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn encode(&self, profile: &Profile) -> EncodedProfile {
        let started_at = self.started_at.load(Ordering::Acquire);
        let start = profile.start_timestamp().unwrap_or(started_at);
        EncodedProfile {
            start,
            end: profile.end_timestamp().unwrap_or(start).max(start),
            bytes: ProfileSerializer::serialize(profile),
        }
    }
}
