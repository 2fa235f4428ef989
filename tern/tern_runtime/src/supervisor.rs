//! Supervisor.
//!
//! A single consumer thread drains the dispatch queue and hands each work
//! item to a freshly spawned worker thread, which coordinates the isolated
//! worker process for that one invocation. The number of workers running at
//! once is bounded by an admission gate; the supervisor never waits for a
//! worker to finish before taking the next item.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tern_core::error::{Error, Result, SetupError};
use tern_core::types::IsolationKind;
use tern_core::utils::deadline::{CancellationToken, Deadline, WAIT_SLICE};
use tern_core::{InvocationId, WorkerId};
use tern_isolation::{IsolationWorker, WorkerReport, WorkerStatus};
use tracing::{debug, error, info, trace, warn};

use crate::system::config::SupervisorConfig;

/// One isolated invocation waiting for a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Isolation kind; never `IsolationKind::None`.
    pub kind: IsolationKind,

    /// Path of the invocation's SyncChannel.
    pub channel: PathBuf,

    /// The invocation.
    pub invocation_id: InvocationId,

    /// When the item was queued.
    pub enqueued_at: Instant,
}

impl WorkItem {
    /// Create a work item stamped with the current time.
    pub fn new(kind: IsolationKind, channel: impl Into<PathBuf>, invocation_id: InvocationId) -> Self {
        Self {
            kind,
            channel: channel.into(),
            invocation_id,
            enqueued_at: Instant::now(),
        }
    }
}

/// Producer side of the dispatch queue.
///
/// Cloned into every caller; the supervisor stops once all clones are gone.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: Sender<WorkItem>,
}

impl WorkQueue {
    /// Create a queue; `capacity` 0 means unbounded.
    pub(crate) fn with_capacity(capacity: usize) -> (Self, Receiver<WorkItem>) {
        let (sender, receiver) = if capacity == 0 {
            unbounded()
        } else {
            bounded(capacity)
        };
        (Self { sender }, receiver)
    }

    /// Queue an item.
    ///
    /// On a bounded queue this waits for space until `deadline`.
    ///
    /// # Errors
    ///
    /// * `SetupError::QueueFull` - No space before the deadline.
    /// * `SetupError::QueueClosed` - The supervisor has stopped.
    pub fn submit(&self, item: WorkItem, deadline: Deadline) -> Result<()> {
        let sent = match deadline.remaining() {
            Some(timeout) => self.sender.send_timeout(item, timeout),
            None => self
                .sender
                .send(item)
                .map_err(|e| SendTimeoutError::Disconnected(e.into_inner())),
        };

        match sent {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SetupError::QueueFull.into()),
            Err(SendTimeoutError::Disconnected(_)) => Err(SetupError::QueueClosed.into()),
        }
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    /// Whether no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// The workers the supervisor can hand items to.
#[derive(Clone)]
pub struct WorkerSet {
    /// Worker for balloon invocations.
    pub balloon: Arc<dyn IsolationWorker>,

    /// Worker for scale invocations.
    pub scale: Arc<dyn IsolationWorker>,
}

impl WorkerSet {
    /// The worker serving `kind`, if any.
    pub fn for_kind(&self, kind: IsolationKind) -> Option<&Arc<dyn IsolationWorker>> {
        match kind {
            IsolationKind::Balloon => Some(&self.balloon),
            IsolationKind::Scale => Some(&self.scale),
            IsolationKind::None => None,
        }
    }
}

/// Snapshot of supervisor counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    /// Items taken from the queue
    pub received: usize,

    /// Worker threads started
    pub spawned: usize,

    /// Invocations whose handler ran, successfully or not
    pub completed: usize,

    /// Invocations that failed in the infrastructure
    pub failed: usize,

    /// Invocations that exceeded their deadline
    pub timed_out: usize,

    /// Scopes that could not be torn down
    pub scopes_leaked: usize,

    /// Workers running now
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicUsize,
    spawned: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    scopes_leaked: AtomicUsize,
}

impl Counters {
    fn record(&self, report: &WorkerReport) {
        let counter = match report.status {
            WorkerStatus::Succeeded | WorkerStatus::HandlerFailed => &self.completed,
            WorkerStatus::TimedOut => &self.timed_out,
            WorkerStatus::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if report.scope_leaked {
            self.scopes_leaked.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bounds the number of workers running at once.
#[derive(Debug)]
struct AdmissionGate {
    limit: usize,
    in_use: Mutex<usize>,
    changed: Condvar,
}

/// A claim on one worker slot; released on drop.
struct Permit {
    gate: Arc<AdmissionGate>,
}

impl AdmissionGate {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_use: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    /// Wait for a free slot. `None` if `cancel` fires first.
    fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Option<Permit> {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.limit {
            if cancel.is_cancelled() {
                return None;
            }
            self.changed.wait_for(&mut in_use, WAIT_SLICE);
        }
        *in_use += 1;
        Some(Permit {
            gate: Arc::clone(self),
        })
    }

    fn in_flight(&self) -> usize {
        *self.in_use.lock()
    }

    /// Wait until no worker is running. `false` if `deadline` passes first.
    fn wait_idle(&self, deadline: Deadline) -> bool {
        let mut in_use = self.in_use.lock();
        while *in_use > 0 {
            if deadline.is_expired() {
                return false;
            }
            self.changed.wait_for(&mut in_use, deadline.slice(WAIT_SLICE));
        }
        true
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut in_use = self.gate.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.gate.changed.notify_all();
    }
}

/// State shared by the supervisor thread and its handle.
struct Shared {
    workers: WorkerSet,
    gate: Arc<AdmissionGate>,
    counters: Counters,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn run_loop(self: &Arc<Self>, receiver: Receiver<WorkItem>) {
        info!(
            max_concurrent_workers = self.gate.limit,
            "Supervisor started"
        );

        loop {
            if self.closing.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                break;
            }

            match receiver.recv_timeout(WAIT_SLICE) {
                Ok(item) => self.dispatch(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Dispatch queue disconnected");
                    break;
                }
            }
        }

        let abandoned = receiver.try_iter().count();
        if abandoned > 0 {
            warn!(abandoned, "Supervisor stopped with queued items");
        }
        info!("Supervisor stopped");
    }

    fn dispatch(self: &Arc<Self>, item: WorkItem) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        trace!(
            invocation_id = %item.invocation_id,
            kind = %item.kind,
            queued_us = item.enqueued_at.elapsed().as_micros() as u64,
            "Dequeued work item"
        );

        let worker = match self.workers.for_kind(item.kind) {
            Some(worker) => Arc::clone(worker),
            None => {
                warn!(invocation_id = %item.invocation_id, kind = %item.kind, "No worker for work item");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let permit = match self.gate.acquire(&self.cancel) {
            Some(permit) => permit,
            None => {
                debug!(invocation_id = %item.invocation_id, "Supervisor cancelled while waiting for a worker slot");
                return;
            }
        };

        let worker_id = WorkerId::new();
        let shared = Arc::clone(self);
        let cancel = self.cancel.child();
        let invocation_id = item.invocation_id;

        let spawned = thread::Builder::new()
            .name(format!("tern-worker-{}", worker_id.short()))
            .spawn(move || {
                let _permit = permit;
                shared.run_worker(worker, item, &cancel);
            });

        match spawned {
            Ok(_) => {
                self.counters.spawned.fetch_add(1, Ordering::Relaxed);
                debug!(invocation_id = %invocation_id, worker_id = %worker_id, "Spawned worker");
            }
            Err(e) => {
                error!(invocation_id = %invocation_id, error = %e, "Failed to spawn worker thread");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn run_worker(&self, worker: Arc<dyn IsolationWorker>, item: WorkItem, cancel: &CancellationToken) {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            worker.run(item.invocation_id, &item.channel, cancel)
        }));

        match result {
            Ok(report) => {
                self.counters.record(&report);
                debug!(
                    invocation_id = %report.invocation_id,
                    kind = %report.kind,
                    status = %report.status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker finished"
                );
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(invocation_id = %item.invocation_id, kind = %item.kind, "Worker panicked");
            }
        }
    }
}

/// The single consumer of the dispatch queue.
pub struct Supervisor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Start the supervisor thread.
    ///
    /// Returns the supervisor and the producer side of its queue.
    pub fn spawn(workers: WorkerSet, config: &SupervisorConfig) -> Result<(Self, WorkQueue)> {
        let (queue, receiver) = WorkQueue::with_capacity(config.queue_capacity);

        let shared = Arc::new(Shared {
            workers,
            gate: Arc::new(AdmissionGate::new(config.max_concurrent_workers)),
            counters: Counters::default(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tern-supervisor".to_string())
            .spawn(move || loop_shared.run_loop(receiver))
            .map_err(|e| Error::Runtime(format!("Failed to spawn supervisor thread: {}", e)))?;

        Ok((
            Self {
                shared,
                handle: Some(handle),
            },
            queue,
        ))
    }

    /// Current counters.
    pub fn stats(&self) -> SupervisorStats {
        let c = &self.shared.counters;
        SupervisorStats {
            received: c.received.load(Ordering::Relaxed),
            spawned: c.spawned.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            scopes_leaked: c.scopes_leaked.load(Ordering::Relaxed),
            in_flight: self.shared.gate.in_flight(),
        }
    }

    /// Whether the supervisor thread is still consuming.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait until no worker is running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.gate.wait_idle(Deadline::after(timeout))
    }

    /// Stop consuming and wait for in-flight workers.
    ///
    /// Workers still running after `grace` are cancelled; their scopes are
    /// still torn down before they exit.
    pub fn shutdown(mut self, grace: Duration) -> SupervisorStats {
        info!("Shutting down supervisor");
        self.stop();

        if !self.shared.gate.wait_idle(Deadline::after(grace)) {
            warn!(
                in_flight = self.shared.gate.in_flight(),
                "Workers still running after {} ms, cancelling",
                grace.as_millis()
            );
            self.shared.cancel.cancel();
            if !self.shared.gate.wait_idle(Deadline::after(grace)) {
                error!(in_flight = self.shared.gate.in_flight(), "Workers did not stop");
            }
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            scopes_leaked = stats.scopes_leaked,
            "Supervisor shut down"
        );
        stats
    }

    fn stop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Supervisor thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tern_core::error::ErrorClass;

    /// Counts calls, holds each one for a while and returns a fixed status.
    struct FakeWorker {
        kind: IsolationKind,
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
        status: WorkerStatus,
        leak: bool,
        panics: bool,
    }

    impl FakeWorker {
        fn new(kind: IsolationKind, hold: Duration, status: WorkerStatus) -> Self {
            Self {
                kind,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                hold,
                status,
                leak: false,
                panics: false,
            }
        }

        fn ok(kind: IsolationKind) -> Arc<Self> {
            Arc::new(Self::new(kind, Duration::ZERO, WorkerStatus::Succeeded))
        }
    }

    impl IsolationWorker for FakeWorker {
        fn kind(&self) -> IsolationKind {
            self.kind
        }

        fn run(&self, invocation_id: InvocationId, _channel: &Path, cancel: &CancellationToken) -> WorkerReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let until = Instant::now() + self.hold;
            while Instant::now() < until && !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panics {
                panic!("worker exploded");
            }
            WorkerReport {
                invocation_id,
                kind: self.kind,
                status: self.status,
                scope_leaked: self.leak,
            }
        }
    }

    fn config(ceiling: usize, capacity: usize) -> SupervisorConfig {
        SupervisorConfig {
            queue_capacity: capacity,
            max_concurrent_workers: ceiling,
            shutdown_timeout_ms: 1_000,
        }
    }

    fn item(kind: IsolationKind) -> WorkItem {
        WorkItem::new(kind, "/nonexistent/tern-test.fifo", InvocationId::new())
    }

    fn wait_until(supervisor: &Supervisor, done: impl Fn(&SupervisorStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&supervisor.stats()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_items_reach_matching_worker() {
        let balloon = FakeWorker::ok(IsolationKind::Balloon);
        let scale = Arc::new(FakeWorker::new(
            IsolationKind::Scale,
            Duration::ZERO,
            WorkerStatus::HandlerFailed,
        ));
        let workers = WorkerSet {
            balloon: balloon.clone(),
            scale: scale.clone(),
        };

        let (supervisor, queue) = Supervisor::spawn(workers, &config(4, 0)).unwrap();
        for kind in [IsolationKind::Balloon, IsolationKind::Scale, IsolationKind::Scale] {
            queue.submit(item(kind), Deadline::never()).unwrap();
        }
        wait_until(&supervisor, |s| s.completed == 3);

        assert_eq!(balloon.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scale.calls.load(Ordering::SeqCst), 2);

        let stats = supervisor.shutdown(Duration::from_secs(1));
        assert_eq!(stats.received, 3);
        assert_eq!(stats.spawned, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_concurrency_ceiling() {
        let balloon = Arc::new(FakeWorker::new(
            IsolationKind::Balloon,
            Duration::from_millis(100),
            WorkerStatus::Succeeded,
        ));
        let workers = WorkerSet {
            balloon: balloon.clone(),
            scale: FakeWorker::ok(IsolationKind::Scale),
        };

        let (supervisor, queue) = Supervisor::spawn(workers, &config(2, 0)).unwrap();
        for _ in 0..6 {
            queue.submit(item(IsolationKind::Balloon), Deadline::never()).unwrap();
        }
        wait_until(&supervisor, |s| s.completed == 6);

        assert_eq!(balloon.calls.load(Ordering::SeqCst), 6);
        assert!(balloon.peak.load(Ordering::SeqCst) <= 2);
        supervisor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_worker_panic_does_not_stop_loop() {
        let balloon = FakeWorker::ok(IsolationKind::Balloon);
        let mut scale = FakeWorker::new(IsolationKind::Scale, Duration::ZERO, WorkerStatus::Succeeded);
        scale.panics = true;
        let workers = WorkerSet {
            balloon,
            scale: Arc::new(scale),
        };

        let (supervisor, queue) = Supervisor::spawn(workers, &config(4, 0)).unwrap();
        queue.submit(item(IsolationKind::Scale), Deadline::never()).unwrap();
        queue.submit(item(IsolationKind::Balloon), Deadline::never()).unwrap();
        wait_until(&supervisor, |s| s.completed == 1 && s.failed == 1);

        let stats = supervisor.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        assert!(supervisor.is_running());
        supervisor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_leaked_scopes_are_counted() {
        let mut scale = FakeWorker::new(
            IsolationKind::Scale,
            Duration::ZERO,
            WorkerStatus::Failed(ErrorClass::Teardown),
        );
        scale.leak = true;
        let workers = WorkerSet {
            balloon: FakeWorker::ok(IsolationKind::Balloon),
            scale: Arc::new(scale),
        };

        let (supervisor, queue) = Supervisor::spawn(workers, &config(4, 0)).unwrap();
        queue.submit(item(IsolationKind::Scale), Deadline::never()).unwrap();
        wait_until(&supervisor, |s| s.failed == 1);

        let stats = supervisor.shutdown(Duration::from_secs(1));
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.scopes_leaked, 1);
    }

    #[test]
    fn test_shutdown_cancels_stuck_workers() {
        let balloon = Arc::new(FakeWorker::new(
            IsolationKind::Balloon,
            Duration::from_secs(30),
            WorkerStatus::Succeeded,
        ));
        let workers = WorkerSet {
            balloon: balloon.clone(),
            scale: FakeWorker::ok(IsolationKind::Scale),
        };

        let (supervisor, queue) = Supervisor::spawn(workers, &config(4, 0)).unwrap();
        queue.submit(item(IsolationKind::Balloon), Deadline::never()).unwrap();
        wait_until(&supervisor, |s| s.in_flight == 1);

        let started = Instant::now();
        let stats = supervisor.shutdown(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.in_flight, 0);
        assert_eq!(balloon.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_stop_is_rejected() {
        let workers = WorkerSet {
            balloon: FakeWorker::ok(IsolationKind::Balloon),
            scale: FakeWorker::ok(IsolationKind::Scale),
        };
        let (supervisor, queue) = Supervisor::spawn(workers, &config(1, 1)).unwrap();

        supervisor.shutdown(Duration::from_millis(100));
        let err = queue
            .submit(item(IsolationKind::Balloon), Deadline::after(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, Error::Setup(SetupError::QueueClosed)));
    }

    #[test]
    fn test_full_queue_times_out() {
        let (queue, _receiver) = WorkQueue::with_capacity(1);

        queue.submit(item(IsolationKind::Scale), Deadline::never()).unwrap();
        assert_eq!(queue.len(), 1);
        let err = queue
            .submit(item(IsolationKind::Scale), Deadline::after(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::Setup(SetupError::QueueFull)));
    }
}
