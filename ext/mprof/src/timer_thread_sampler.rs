#![deny(unsafe_op_in_unsafe_fn)]

use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::binary_image::ImageCache;
use crate::configuration::SamplingConfig;
use crate::error::{Error, Result};
use crate::safe_read::{install_fault_handlers, SafeMemoryReader};
use crate::signal_pauser::SignalPauser;
use crate::stack_trace::StackTrace;
use crate::thread_control::ThreadControl;
use crate::threads;
use crate::trace_buffer::{TraceBuffer, TraceBufferError};
use crate::unwind::walk_frame_pointers;
use crate::util::*;

/// Receives each full batch of traces, and the partial batch left at stop.
/// The batch is reused once the callback returns.
pub type TraceCallback = Box<dyn FnMut(&mut [StackTrace]) + Send>;

thread_local! {
    // Identifies the sampler whose loop runs on this thread, if any.
    static CURRENT_SAMPLER: Cell<usize> = const { Cell::new(0) };
}

pub struct ThreadSampler {
    configuration: Arc<SamplingConfig>,
    worker: Arc<Mutex<Worker>>,
    running: Arc<AtomicBool>,
    sampling_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Worker {
    configuration: Arc<SamplingConfig>,
    control: Box<dyn ThreadControl>,
    callback: TraceCallback,
    buffer: TraceBuffer,
    image_cache: ImageCache,
    target_thread: Option<u32>,
    thread_ids: Vec<u32>,
}

impl ThreadSampler {
    pub fn new<F>(configuration: SamplingConfig, callback: F) -> Result<Self>
    where
        F: FnMut(&mut [StackTrace]) + Send + 'static,
    {
        Self::with_control(
            configuration,
            Box::new(SignalPauser::new()),
            Box::new(callback),
        )
    }

    pub(crate) fn with_control(
        configuration: SamplingConfig,
        control: Box<dyn ThreadControl>,
        callback: TraceCallback,
    ) -> Result<Self> {
        configuration.validate()?;
        let configuration = Arc::new(configuration);
        let worker = Worker {
            configuration: Arc::clone(&configuration),
            control,
            callback,
            buffer: TraceBuffer::new(configuration.max_buffer_size as usize),
            image_cache: ImageCache::new(),
            target_thread: None,
            thread_ids: Vec::new(),
        };
        Ok(Self {
            configuration,
            worker: Arc::new(Mutex::new(worker)),
            running: Arc::new(AtomicBool::new(false)),
            sampling_thread: Mutex::new(None),
        })
    }

    pub fn configuration(&self) -> &SamplingConfig {
        &self.configuration
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.running) as usize
    }

    /// Starts the sampling thread. With `current_thread_only`, the thread
    /// calling `start` is the one sampled.
    pub fn start(&self) -> Result<()> {
        let mut sampling_thread = lock(&self.sampling_thread);
        if sampling_thread.is_some() {
            if self.running.load(Ordering::Acquire) {
                return Err(Error::AlreadyRunning);
            }
            // The loop was stopped from inside the callback and never joined
            if let Some(handle) = sampling_thread.take() {
                let _ = handle.join();
            }
        }

        install_fault_handlers()?;
        {
            let mut worker = lock(&self.worker);
            worker.control.prepare()?;
            worker.target_thread = if self.configuration.current_thread_only {
                Some(worker.control.current_thread_id())
            } else {
                None
            };
        }

        self.running.store(true, Ordering::Release);
        let worker = Arc::clone(&self.worker);
        let running = Arc::clone(&self.running);
        let identity = self.identity();
        let spawned = thread::Builder::new()
            .name("mprof.sampler".to_string())
            .spawn(move || {
                CURRENT_SAMPLER.with(|current| current.set(identity));
                let mut worker = lock(&worker);
                worker.run(&running);
            });

        match spawned {
            Ok(handle) => {
                *sampling_thread = Some(handle);
                log::debug!(
                    "Sampler started (interval: {}ns)",
                    self.configuration.interval_ns
                );
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                lock(&self.worker).control.release();
                Err(Error::Spawn(err))
            }
        }
    }

    /// Stops sampling and waits for the final partial batch to be delivered.
    /// No-op if not running.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);

        // Called from our own callback: the loop exits after this batch
        if CURRENT_SAMPLER.with(Cell::get) == self.identity() {
            return;
        }

        let mut sampling_thread = lock(&self.sampling_thread);
        if let Some(handle) = sampling_thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Sampling thread panicked");
            }
            log::debug!("Sampler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for ThreadSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Worker {
    fn run(&mut self, running: &AtomicBool) {
        threads::set_current_thread_priority(self.configuration.priority_class);
        let sampler_thread = self.control.current_thread_id();
        let interval = self.configuration.interval();

        let mut next_tick = Instant::now();
        while running.load(Ordering::Acquire) {
            self.sample_tick(sampler_thread, running);

            next_tick += interval;
            loop {
                let now = Instant::now();
                if now >= next_tick {
                    // Fell behind; don't try to catch up with a burst of ticks
                    next_tick = now;
                    break;
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(next_tick - now);
            }
        }

        self.flush();
        self.control.release();
    }

    fn sample_tick(&mut self, sampler_thread: u32, running: &AtomicBool) {
        if let Some(tid) = self.target_thread {
            self.sample_thread(tid);
            return;
        }

        let mut thread_ids = mem::take(&mut self.thread_ids);
        if !self.control.list_threads(&mut thread_ids) {
            self.thread_ids = thread_ids;
            return;
        }

        let cap = match self.configuration.max_thread_count {
            0 => usize::MAX,
            n => n as usize,
        };
        let mut sampled = 0;
        for &tid in thread_ids.iter() {
            if sampled >= cap || !running.load(Ordering::Relaxed) {
                break;
            }
            if tid == sampler_thread || Some(tid) == self.configuration.ignore_thread {
                continue;
            }
            self.sample_thread(tid);
            sampled += 1;
        }
        self.thread_ids = thread_ids;
    }

    fn sample_thread(&mut self, tid: u32) {
        let depth = self.configuration.max_stack_depth as usize;
        let mut trace = StackTrace::new(tid, self.configuration.interval_ns, depth);
        if let Some(name) = self.control.thread_name(tid) {
            trace.set_thread_name(&name);
        }
        trace.timestamp = epoch_nanos();

        let frames = &mut trace.frames;
        let paused = self.control.with_paused_thread(tid, &mut |regs| {
            walk_frame_pointers(&SafeMemoryReader, regs, depth, frames);
        });
        if !paused || trace.frames.is_empty() {
            return;
        }

        if let Err(TraceBufferError::Full) = self.buffer.push(trace) {
            log::debug!("Trace buffer full. Dropping trace.");
        }
        if self.buffer.is_full() {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut batch = self.buffer.take();
        // Images are resolved here, after every thread was resumed: walking
        // the loader list can block on a lock a paused thread holds.
        self.image_cache.resolve_frames(&mut batch);
        log::trace!("Delivering {} traces", batch.len());
        (self.callback)(&mut batch);
        self.buffer.recycle(batch);
    }
}
