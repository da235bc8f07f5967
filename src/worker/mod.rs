//! Background worker threads that drain a transport through a dispatcher.
//!
//! Each worker loops `poll -> route` on its own OS thread, so handlers never
//! run on the thread that published. The transport keeps per-key order: a
//! key is never handed to two workers at once.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::codec::EventCodec;
use crate::dispatcher::{Dispatcher, RouteOutcome};
use crate::transport::Transport;

/// Statistics from one worker, or summed over a pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Deliveries acknowledged.
    pub handled: usize,
    /// Deliveries given back for another attempt.
    pub retried: usize,
    pub dead_lettered: usize,
    pub polls: usize,
    pub transport_errors: usize,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.handled += other.handled;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.polls += other.polls;
        self.transport_errors += other.transport_errors;
    }
}

/// Pool settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerOptions {
    pub workers: usize,
    /// Longest a worker waits in `poll` before checking for shutdown.
    pub poll_interval: Duration,
    /// Thread name prefix; threads are named `<name>-<index>`.
    pub name: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(50),
            name: "event-worker".to_string(),
        }
    }
}

impl WorkerOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Starts worker threads.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use order_events::{Dispatcher, InMemoryTransport, WorkerOptions, WorkerPool};
///
/// let transport = InMemoryTransport::new();
/// let dispatcher = Arc::new(Dispatcher::builder().build());
///
/// let workers = WorkerPool::spawn(transport, dispatcher, WorkerOptions::default().with_workers(2));
/// // ... publish events ...
/// let stats = workers.stop();
/// assert_eq!(stats.dead_lettered, 0);
/// ```
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<T, C>(
        transport: T,
        dispatcher: Arc<Dispatcher<C>>,
        options: WorkerOptions,
    ) -> WorkerHandle
    where
        T: Transport + Clone + 'static,
        C: EventCodec + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let workers = options.workers.max(1);

        let threads = (0..workers)
            .map(|index| {
                let transport = transport.clone();
                let dispatcher = Arc::clone(&dispatcher);
                let stop = Arc::clone(&stop);
                let poll_interval = options.poll_interval;
                let name = format!("{}-{}", options.name, index);

                thread::spawn(move || run(&name, &transport, &dispatcher, &stop, poll_interval))
            })
            .collect();

        tracing::info!(workers, name = %options.name, "worker pool started");

        WorkerHandle {
            stop,
            threads,
            name: options.name,
        }
    }
}

fn run<T, C>(
    name: &str,
    transport: &T,
    dispatcher: &Dispatcher<C>,
    stop: &AtomicBool,
    poll_interval: Duration,
) -> WorkerStats
where
    T: Transport,
    C: EventCodec,
{
    let mut stats = WorkerStats::default();

    while !stop.load(Ordering::Acquire) {
        stats.polls += 1;

        let delivery = match transport.poll(poll_interval) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                stats.transport_errors += 1;
                tracing::warn!(worker = name, error = %err, "poll failed");
                thread::sleep(poll_interval);
                continue;
            }
        };

        match dispatcher.route(transport, delivery) {
            Ok(RouteOutcome::Acked) => stats.handled += 1,
            Ok(RouteOutcome::Retrying { .. }) => stats.retried += 1,
            Ok(RouteOutcome::DeadLettered { .. }) => stats.dead_lettered += 1,
            Err(err) => {
                // The lease runs out and the record comes back.
                stats.transport_errors += 1;
                tracing::warn!(worker = name, error = %err, "could not settle delivery");
            }
        }
    }

    stats
}

/// Running worker pool.
///
/// Dropping the handle signals the workers but does not wait for them. A
/// handler that is still running finishes on its own; until it settles, its
/// record stays leased.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<WorkerStats>>,
    name: String,
}

impl WorkerHandle {
    /// Signal every worker to stop, wait for them and sum their statistics.
    pub fn stop(mut self) -> WorkerStats {
        self.signal_stop();

        let mut total = WorkerStats::default();
        for handle in std::mem::take(&mut self.threads) {
            total += self.join(handle);
        }
        self.log_stopped(total, 0);
        total
    }

    /// Like [`stop`](Self::stop), but wait at most `timeout`.
    ///
    /// Workers still inside a handler by then are detached: they exit after
    /// the handler returns, and their statistics are left out. A delivery
    /// they never settle is redelivered when its lease runs out.
    pub fn stop_timeout(mut self, timeout: Duration) -> WorkerStats {
        self.signal_stop();
        let deadline = Instant::now() + timeout;

        let mut total = WorkerStats::default();
        let mut running = std::mem::take(&mut self.threads);
        loop {
            let (finished, busy): (Vec<_>, Vec<_>) =
                running.into_iter().partition(JoinHandle::is_finished);
            for handle in finished {
                total += self.join(handle);
            }
            running = busy;

            let now = Instant::now();
            if running.is_empty() || now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(5)));
        }

        if !running.is_empty() {
            tracing::warn!(
                name = %self.name,
                detached = running.len(),
                "workers still busy at shutdown deadline; detaching"
            );
        }
        self.log_stopped(total, running.len());
        total
    }

    fn join(&self, handle: JoinHandle<WorkerStats>) -> WorkerStats {
        handle.join().unwrap_or_else(|_| {
            tracing::error!(name = %self.name, "worker thread panicked");
            WorkerStats::default()
        })
    }

    fn log_stopped(&self, total: WorkerStats, detached: usize) {
        tracing::info!(
            name = %self.name,
            handled = total.handled,
            retried = total.retried,
            dead_lettered = total.dead_lettered,
            detached,
            "worker pool stopped"
        );
    }

    /// Signal the workers to stop without waiting.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn workers(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
