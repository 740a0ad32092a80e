//! Background dispatch of due jobs.
//!
//! A dispatcher runs `max_workers` threads that each claim the next due job
//! of one queue and hand it to a shared [`JobWorker`]. Idle threads sleep on
//! a [`DispatchSignal`] until the next known due time, the poll interval, or
//! a notification that a job (re)entered `pending`, whichever comes first.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use deferq_core::WorkerId;

use crate::config::WorkerConfig;

use super::store::JobStore;
use super::types::JobStatus;
use super::worker::{DelayNotifier, JobWorker};

const MIN_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Wake-up channel between producers and idle dispatcher threads.
///
/// Pass it as the notifier of both the [`Queue`](super::queue::Queue) and
/// the [`JobWorker`] so pushes, resets and reschedules wake sleepers.
#[derive(Debug, Default)]
pub struct DispatchSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl DispatchSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current generation; changes on every notification.
    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = self.lock();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    pub fn wake(&self) {
        let mut generation = self.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DelayNotifier for DispatchSignal {
    fn recompute_delay(&self, _queue: &str) {
        self.wake();
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub completed: u64,
    pub rescheduled: u64,
    pub failed: u64,
    pub commit_errors: u64,
    /// Runs that unwound; their jobs stay in `progress`
    pub panicked: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    signal: Arc<DispatchSignal>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
    started: Instant,
}

impl DispatcherHandle {
    /// Stop claiming, wake idle threads and wait for running jobs to finish.
    pub fn shutdown(mut self) {
        stop(&self.shutdown, &self.signal, &mut self.joins);
    }

    pub fn stats(&self) -> DispatcherStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if !self.joins.is_empty() {
            stop(&self.shutdown, &self.signal, &mut self.joins);
        }
    }
}

pub struct Dispatcher;

impl Dispatcher {
    /// Spawn `config.max_workers` threads consuming `config.queue`.
    pub fn spawn<S: JobStore + 'static>(
        worker: Arc<JobWorker<S>>,
        signal: Arc<DispatchSignal>,
        config: &WorkerConfig,
    ) -> std::io::Result<DispatcherHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let mut joins = Vec::with_capacity(config.max_workers);

        for index in 0..config.max_workers.max(1) {
            let name = format!("{}-{index}", config.name);
            let ctx = LoopContext {
                id: WorkerId::new(),
                name: name.clone(),
                queue: config.queue.clone(),
                poll_interval: config.poll_interval,
                worker: worker.clone(),
                signal: signal.clone(),
                shutdown: shutdown.clone(),
                stats: stats.clone(),
            };

            match thread::Builder::new().name(name).spawn(move || dispatch_loop(ctx)) {
                Ok(join) => joins.push(join),
                Err(e) => {
                    error!(dispatcher = %config.name, error = %e, "failed to spawn worker thread");
                    stop(&shutdown, &signal, &mut joins);
                    return Err(e);
                }
            }
        }

        info!(
            dispatcher = %config.name,
            queue = %config.queue,
            workers = joins.len(),
            "dispatcher started"
        );

        Ok(DispatcherHandle {
            shutdown,
            signal,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

struct LoopContext<S: JobStore> {
    id: WorkerId,
    name: String,
    queue: String,
    poll_interval: Duration,
    worker: Arc<JobWorker<S>>,
    signal: Arc<DispatchSignal>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<DispatcherStats>>,
}

fn dispatch_loop<S: JobStore>(ctx: LoopContext<S>) {
    debug!(worker = %ctx.name, worker_id = %ctx.id, "dispatch loop started");

    while !ctx.shutdown.load(Ordering::SeqCst) {
        let seen = ctx.signal.generation();
        let now = ctx.worker.clock().now();

        match ctx.worker.store().claim_next(&ctx.queue, now) {
            Ok(Some(job)) => {
                debug!(
                    worker_id = %ctx.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "claimed job"
                );
                let job_id = job.id;
                lock_stats(&ctx.stats).running += 1;

                let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.worker.run(job)));

                let mut stats = lock_stats(&ctx.stats);
                stats.running = stats.running.saturating_sub(1);
                stats.processed += 1;
                match result {
                    Ok(Ok(report)) => match report.job.status {
                        JobStatus::Complete => stats.completed += 1,
                        JobStatus::Pending => stats.rescheduled += 1,
                        JobStatus::Failed => stats.failed += 1,
                        JobStatus::Progress => {}
                    },
                    Ok(Err(e)) => {
                        stats.commit_errors += 1;
                        error!(worker = %ctx.name, error = %e, "job commit failed");
                    }
                    Err(_) => {
                        stats.panicked += 1;
                        error!(
                            worker = %ctx.name,
                            job_id = %job_id,
                            "job run panicked, job left in progress"
                        );
                    }
                }
            }
            Ok(None) => {
                let wait = idle_wait(&ctx, now);
                ctx.signal.wait(seen, wait);
            }
            Err(e) => {
                error!(worker = %ctx.name, error = %e, "failed to claim job");
                ctx.signal.wait(seen, ctx.poll_interval);
            }
        }
    }

    debug!(worker = %ctx.name, worker_id = %ctx.id, "dispatch loop stopped");
}

fn idle_wait<S: JobStore>(ctx: &LoopContext<S>, now: chrono::DateTime<chrono::Utc>) -> Duration {
    let until_due = match ctx.worker.store().next_due(&ctx.queue) {
        Ok(Some(due)) => (due - now).to_std().unwrap_or(Duration::ZERO),
        Ok(None) => ctx.poll_interval,
        Err(e) => {
            error!(worker = %ctx.name, error = %e, "failed to read next due time");
            ctx.poll_interval
        }
    };
    until_due.min(ctx.poll_interval).max(MIN_IDLE_WAIT)
}

fn stop(shutdown: &AtomicBool, signal: &DispatchSignal, joins: &mut Vec<thread::JoinHandle<()>>) {
    shutdown.store(true, Ordering::SeqCst);
    signal.wake();
    for join in joins.drain(..) {
        if join.join().is_err() {
            error!("dispatcher thread panicked");
        }
    }
}

fn lock_stats(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}
