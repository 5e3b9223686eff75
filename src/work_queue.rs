// src/work_queue.rs
//! Bounded work queue with a fixed pool of worker threads.
//!
//! Notification handlers that may block or take further locks are offloaded
//! here instead of running on the notification-delivery thread. The queue
//! is bounded: `submit` never blocks and reports `Full` instead, so the
//! delivering context keeps its latency.
//!
//! ## Shutdown
//!
//! `shutdown` (or drop) refuses new jobs, lets the workers drain what is
//! already queued, and joins them.

use crate::config::WorkerConfig;
use crate::error::WorkQueueError;
use crate::sync::lock;
use anyhow::{Context, Result};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    pub num_workers: usize,
    /// Jobs that may wait before `submit` reports `Full`.
    pub queue_capacity: usize,
    /// Workers are named "{prefix}-{id}".
    pub thread_name_prefix: String,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkQueueConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            num_workers: config.num_workers.max(1),
            queue_capacity: config.queue_capacity,
            thread_name_prefix: "deferred".to_string(),
        }
    }
}

/// Count of submitted jobs that have not finished yet.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *lock(&self.count) += 1;
    }

    fn end(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Decrements the in-flight count even if the job panics.
struct JobGuard<'a>(&'a InFlight);

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

pub struct WorkQueue {
    config: WorkQueueConfig,
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
    shutdown: Arc<AtomicBool>,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(InFlight::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let receiver = Arc::clone(&receiver);
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, worker_id))
                .spawn(move || Self::worker_loop(worker_id, receiver, in_flight))
                .with_context(|| format!("spawning work queue worker {}", worker_id))?;
            workers.push(handle);
        }
        debug!(
            "WorkQueue: started {} worker(s), capacity {}",
            config.num_workers, config.queue_capacity
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            workers,
            in_flight,
            shutdown,
        })
    }

    fn worker_loop(worker_id: usize, receiver: Arc<Mutex<Receiver<Job>>>, in_flight: Arc<InFlight>) {
        loop {
            // The lock is held only while waiting for the next job.
            let job = lock(&receiver).recv();
            match job {
                Ok(job) => {
                    let _guard = JobGuard(&in_flight);
                    job();
                }
                Err(_) => {
                    trace!("WorkQueue: worker {} exiting", worker_id);
                    return;
                }
            }
        }
    }

    /// Queues `job` without blocking.
    pub fn submit<F>(&self, job: F) -> Result<(), WorkQueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WorkQueueError::ShutDown);
        }
        let sender = lock(&self.sender);
        let sender = sender.as_ref().ok_or(WorkQueueError::ShutDown)?;
        self.in_flight.begin();
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.in_flight.end();
                match e {
                    TrySendError::Full(_) => {
                        warn!("WorkQueue: queue full ({} jobs)", self.config.queue_capacity);
                        Err(WorkQueueError::Full)
                    }
                    TrySendError::Disconnected(_) => Err(WorkQueueError::ShutDown),
                }
            }
        }
    }

    /// Waits until every submitted job has finished; false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.in_flight.count);
        while *count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            count = match self.in_flight.idle.wait_timeout(count, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Refuses new jobs, drains the queue and joins the workers.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        lock(&self.sender).take();
        while let Some(handle) = self.workers.pop() {
            if handle.join().is_err() {
                warn!("WorkQueue: a worker panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
