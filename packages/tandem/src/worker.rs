//! Worker loop: acquire, dispatch, renew, reap.
//!
//! One worker owns a set of job types and a stable `worker_id`. Each
//! iteration reaps at most one expired lease, then tries to acquire the
//! oldest eligible job of its types. Acquired jobs are dispatched onto
//! their own task with a lease-renewal sidecar; the loop keeps acquiring
//! while the store reports more eligible work and otherwise sleeps until
//! the earliest known `scheduled_at`, a bus notification, or the idle
//! poll interval, whichever comes first.
//!
//! Losing the lease cancels the job's signal with `lease_expired`; the
//! job itself is reclaimed by whichever worker next looks for its type.
//! Graceful shutdown stops acquiring, drains in-flight jobs up to a
//! deadline, then cancels their signals with `worker_stopping`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusSubscription, NotifyBus, topics};
use crate::error::{CancelReason, Error, JobFailure, Result};
use crate::events::{EventSink, JobEvent, TracingSink};
use crate::job::{Job, LeaseConfig, RetryConfig, Schedule};
use crate::registry::JobTypeRegistry;
use crate::runtime::{JobSignal, run_processor};
use crate::store::{AcquireJobRequest, JobStore, in_transaction};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identifier; shows up in leases, completions, and logs.
    pub worker_id: String,
    /// Job types this worker owns. `None` means every type the registry
    /// has a processor for.
    pub type_names: Option<Vec<String>>,
    /// Sleep when the store reports nothing scheduled.
    pub poll_interval: Duration,
    /// Minimum delay between successive acquires.
    pub next_job_delay: Duration,
    /// Dispatch slots sharing this worker's acquisition stream.
    pub concurrency: usize,
    /// How long shutdown waits for in-flight jobs before cancelling them.
    pub drain_timeout: Duration,
    /// Backoff for transient store errors in the loop itself.
    pub loop_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            type_names: None,
            poll_interval: Duration::from_millis(1_000),
            next_job_delay: Duration::ZERO,
            concurrency: 1,
            drain_timeout: Duration::from_secs(30),
            loop_retry: RetryConfig {
                initial_delay_ms: 200,
                multiplier: 2.0,
                max_delay_ms: 5_000,
            },
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// A configured worker, ready to [`Worker::start`].
pub struct Worker {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn NotifyBus>,
    registry: Arc<JobTypeRegistry>,
    sink: Arc<dyn EventSink>,
    config: WorkerConfig,
}

struct WorkerInner {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn NotifyBus>,
    registry: Arc<JobTypeRegistry>,
    sink: Arc<dyn EventSink>,
    config: WorkerConfig,
    type_names: Vec<String>,
    /// Longest lease granted at acquisition; the renewal sidecar tightens
    /// it to the acquired type's own lease on the first renewal.
    acquire_lease_ms: u64,
    running: RwLock<HashMap<Uuid, JobSignal>>,
    slots: Arc<Semaphore>,
}

/// Handle to a started worker.
pub struct WorkerHandle {
    worker_id: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Request shutdown and wait for the loop (including the drain phase)
    /// to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            error!(worker_id = %self.worker_id, error = %err, "worker task join failed");
        }
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn NotifyBus>,
        registry: Arc<JobTypeRegistry>,
    ) -> Self {
        Self::with_config(store, bus, registry, WorkerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn NotifyBus>,
        registry: Arc<JobTypeRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            sink: Arc::new(TracingSink),
            config,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Spawn the loop. The worker runs until [`WorkerHandle::stop`].
    pub fn start(self) -> WorkerHandle {
        let type_names = self
            .config
            .type_names
            .clone()
            .unwrap_or_else(|| self.registry.processable_type_names());
        let acquire_lease_ms = type_names
            .iter()
            .map(|name| self.registry.lease_config(name).lease_ms)
            .max()
            .unwrap_or_else(|| LeaseConfig::default().lease_ms);
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let inner = Arc::new(WorkerInner {
            store: self.store,
            bus: self.bus,
            registry: self.registry,
            sink: self.sink,
            type_names,
            acquire_lease_ms,
            running: RwLock::new(HashMap::new()),
            slots,
            config: self.config,
        });

        let shutdown = CancellationToken::new();
        let worker_id = inner.config.worker_id.clone();
        let loop_shutdown = shutdown.clone();
        let task = tokio::spawn(async move { run_loop(inner, loop_shutdown).await });
        WorkerHandle {
            worker_id,
            shutdown,
            task,
        }
    }
}

// ============================================================================
// Main loop
// ============================================================================

enum Tick {
    /// A job went out for processing.
    Dispatched { has_more: bool },
    /// Nothing eligible right now.
    Idle,
}

async fn run_loop(inner: Arc<WorkerInner>, shutdown: CancellationToken) {
    let worker_id = inner.config.worker_id.clone();
    if inner.type_names.is_empty() {
        warn!(worker_id = %worker_id, "worker has no job types to process");
        return;
    }

    info!(
        worker_id = %worker_id,
        types = ?inner.type_names,
        concurrency = inner.config.concurrency,
        "worker starting"
    );
    inner.sink.emit(&JobEvent::WorkerStarted {
        worker_id: worker_id.clone(),
    });

    let topic_names: Vec<String> = inner
        .type_names
        .iter()
        .map(|name| topics::job_type(name))
        .collect();
    let mut notifications = inner.bus.subscribe(&topic_names);

    let mut consecutive_errors: i32 = 0;
    while !shutdown.is_cancelled() {
        match iterate(&inner, &shutdown).await {
            Ok(Tick::Dispatched { has_more }) => {
                consecutive_errors = 0;
                if !inner.config.next_job_delay.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(inner.config.next_job_delay) => {}
                    }
                }
                if has_more {
                    continue;
                }
            }
            Ok(Tick::Idle) => {
                consecutive_errors = 0;
                idle_wait(&inner, &mut notifications, &shutdown).await;
            }
            Err(err) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let delay = inner.config.loop_retry.delay_for_attempt(consecutive_errors);
                error!(
                    worker_id = %worker_id,
                    error = %err,
                    retry_in_ms = delay,
                    "worker iteration failed"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }
        }
    }

    drain(&inner).await;
    info!(worker_id = %worker_id, "worker stopped");
    inner.sink.emit(&JobEvent::WorkerStopped { worker_id });
}

/// One pass: reap, then acquire and dispatch.
async fn iterate(inner: &Arc<WorkerInner>, shutdown: &CancellationToken) -> Result<Tick> {
    reap_expired(inner).await?;

    // Wait for a dispatch slot before claiming, so a claimed job never
    // sits leased behind a full worker.
    let permit = tokio::select! {
        _ = shutdown.cancelled() => return Ok(Tick::Idle),
        permit = inner.slots.clone().acquire_owned() => {
            permit.map_err(|_| Error::InvalidConfig {
                message: "worker slot semaphore closed".to_string(),
            })?
        }
    };

    let type_names = inner.type_names.clone();
    let worker_id = inner.config.worker_id.clone();
    let lease_ms = inner.acquire_lease_ms;
    let acquired = in_transaction(inner.store.as_ref(), move |tx| {
        Box::pin(async move {
            tx.acquire_job(
                AcquireJobRequest::builder()
                    .type_names(type_names)
                    .worker_id(worker_id)
                    .lease_ms(lease_ms)
                    .build(),
            )
            .await
        })
    })
    .await?;

    match acquired.job {
        Some(job) => {
            // Independent token: shutdown cancels these only after the
            // drain deadline, not the instant stop is requested.
            let signal = JobSignal::new(CancellationToken::new());
            inner
                .running
                .write()
                .await
                .insert(job.id, signal.clone());
            let task_inner = Arc::clone(inner);
            tokio::spawn(async move {
                process_job(task_inner, job, signal).await;
                drop(permit);
            });
            Ok(Tick::Dispatched {
                has_more: acquired.has_more,
            })
        }
        None => {
            drop(permit);
            Ok(Tick::Idle)
        }
    }
}

/// Reap at most one expired lease and wake peers for it.
async fn reap_expired(inner: &Arc<WorkerInner>) -> Result<()> {
    let ignored: Vec<Uuid> = inner.running.read().await.keys().copied().collect();
    let type_names = inner.type_names.clone();
    let reaped = in_transaction(inner.store.as_ref(), move |tx| {
        Box::pin(async move { tx.remove_expired_job_lease(&type_names, &ignored).await })
    })
    .await?;

    if let Some(job) = reaped {
        warn!(
            job_id = %job.id,
            type_name = %job.type_name,
            old_worker_id = ?job.leased_by,
            "reclaimed expired lease"
        );
        inner.sink.emit(&JobEvent::LeaseRecovered {
            job_id: job.id,
            type_name: job.type_name.clone(),
            old_worker_id: job.leased_by.clone(),
            new_worker_id: inner.config.worker_id.clone(),
        });
        inner.bus.publish(&topics::job_type(&job.type_name));
    }
    Ok(())
}

/// Sleep until the next known job, a notification, or the poll interval.
async fn idle_wait(
    inner: &Arc<WorkerInner>,
    notifications: &mut BusSubscription,
    shutdown: &CancellationToken,
) {
    let type_names = inner.type_names.clone();
    let next_ms = in_transaction(inner.store.as_ref(), move |tx| {
        Box::pin(async move { tx.next_job_available_in_ms(&type_names).await })
    })
    .await;

    let wait = match next_ms {
        Ok(Some(0)) => return,
        Ok(Some(ms)) => Duration::from_millis(ms).min(inner.config.poll_interval),
        Ok(None) => inner.config.poll_interval,
        Err(err) => {
            debug!(error = %err, "next-job probe failed; falling back to poll interval");
            inner.config.poll_interval
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = notifications.recv() => {
            // Coalesce any burst into the single wake-up we just took.
            notifications.drain();
        }
        _ = tokio::time::sleep(wait) => {}
    }
}

// ============================================================================
// Dispatch
// ============================================================================

async fn process_job(inner: Arc<WorkerInner>, job: Job, signal: JobSignal) {
    let worker_id = inner.config.worker_id.clone();
    let lease = inner.registry.lease_config(&job.type_name);

    inner.sink.emit(&JobEvent::JobAcquired {
        job_id: job.id,
        type_name: job.type_name.clone(),
        worker_id: worker_id.clone(),
        attempt: job.attempt,
    });
    debug!(job_id = %job.id, type_name = %job.type_name, attempt = job.attempt, "processing job");

    // Renewal sidecar: extends the lease until dispatch finishes; cancels
    // the job's signal if the lease cannot be held.
    let renew_stop = CancellationToken::new();
    let renew_task = tokio::spawn(renew_lease_loop(
        Arc::clone(&inner.store),
        job.id,
        worker_id.clone(),
        lease,
        signal.clone(),
        renew_stop.clone(),
    ));

    let (ctx, result) = run_processor(
        Arc::clone(&inner.store),
        Arc::clone(&inner.registry),
        worker_id.clone(),
        job.clone(),
        signal,
    )
    .await;

    renew_stop.cancel();
    let _ = renew_task.await;

    // Topics and events queued by committed completion transactions.
    for topic in ctx.take_topics().await {
        inner.bus.publish(&topic);
    }
    for event in ctx.take_events().await {
        inner.sink.emit(&event);
    }

    if let Err(failure) = result {
        handle_failure(&inner, &job, failure).await;
    }

    inner.running.write().await.remove(&job.id);
}

async fn handle_failure(inner: &Arc<WorkerInner>, job: &Job, failure: JobFailure) {
    let (schedule, message, requested) = match &failure {
        JobFailure::Reschedule { schedule, message } => (*schedule, message.clone(), true),
        JobFailure::Cancelled(reason) => match reason {
            // The job is no longer ours (or no longer exists); whoever
            // reaped it owns the retry.
            CancelReason::LeaseExpired | CancelReason::NotFound => {
                warn!(job_id = %job.id, reason = %reason, "job cancelled; skipping reschedule");
                return;
            }
            reason => (Schedule::Immediate, format!("cancelled: {reason}"), false),
        },
        JobFailure::Unexpected(_) => {
            if let Some(Error::LeaseExpired { .. }) = failure.as_engine_error() {
                warn!(
                    job_id = %job.id,
                    worker_id = %inner.config.worker_id,
                    "lease lost during completion; another worker owns the job now"
                );
                return;
            }
            let retry = inner.registry.retry_config(&job.type_name);
            let delay = retry.delay_for_attempt(job.attempt);
            (
                Schedule::after_ms(delay),
                failure.attempt_error(),
                false,
            )
        }
    };

    warn!(
        job_id = %job.id,
        type_name = %job.type_name,
        attempt = job.attempt,
        error = %message,
        requested,
        "rescheduling job"
    );

    let job_id = job.id;
    let error_message = message.clone();
    let rescheduled = in_transaction(inner.store.as_ref(), move |tx| {
        Box::pin(async move { tx.reschedule_job(job_id, schedule, &error_message).await })
    })
    .await;

    match rescheduled {
        Ok(_) => {
            inner.sink.emit(&JobEvent::JobRescheduled {
                job_id: job.id,
                type_name: job.type_name.clone(),
                attempt: job.attempt,
                error: message,
                requested,
            });
            inner.bus.publish(&topics::job_type(&job.type_name));
        }
        Err(Error::LeaseExpired { .. }) | Err(Error::JobNotFound { .. }) => {
            debug!(job_id = %job.id, "job left this worker before reschedule; nothing to do");
        }
        Err(err) => {
            // The lease will lapse and the job will be reaped.
            error!(job_id = %job.id, error = %err, "failed to reschedule job");
        }
    }
}

/// Periodically extend the lease. A lost lease (or a vanished job)
/// cancels the processor's signal; a transient store error gets exactly
/// one immediate retry before the signal fires.
async fn renew_lease_loop(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    worker_id: String,
    lease: LeaseConfig,
    signal: JobSignal,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(lease.renew_interval_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        match renew_once(&store, job_id, &worker_id, lease.lease_ms).await {
            Ok(()) => continue,
            Err(Error::JobNotFound { .. }) => {
                warn!(job_id = %job_id, "job disappeared while running");
                signal.cancel(CancelReason::NotFound);
                break;
            }
            Err(Error::LeaseExpired { .. }) => {
                warn!(job_id = %job_id, worker_id = %worker_id, "lease lost");
                signal.cancel(CancelReason::LeaseExpired);
                break;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "lease renewal failed; retrying once");
                if renew_once(&store, job_id, &worker_id, lease.lease_ms)
                    .await
                    .is_err()
                {
                    signal.cancel(CancelReason::LeaseExpired);
                    break;
                }
            }
        }
    }
}

async fn renew_once(
    store: &Arc<dyn JobStore>,
    job_id: Uuid,
    worker_id: &str,
    lease_ms: u64,
) -> Result<()> {
    let worker_id = worker_id.to_string();
    in_transaction(store.as_ref(), move |tx| {
        Box::pin(async move {
            tx.renew_job_lease(job_id, &worker_id, lease_ms).await?;
            Ok(())
        })
    })
    .await
}

/// Drain in-flight jobs, then cancel whatever is still running.
async fn drain(inner: &Arc<WorkerInner>) {
    let deadline = tokio::time::Instant::now() + inner.config.drain_timeout;
    loop {
        if inner.running.read().await.is_empty() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let running = inner.running.read().await;
    if !running.is_empty() {
        info!(count = running.len(), "drain deadline reached; cancelling in-flight jobs");
        for signal in running.values() {
            signal.cancel(CancelReason::WorkerStopping);
        }
    }
    drop(running);

    // Give cancelled processors a moment to unwind and reschedule.
    let hard_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !inner.running.read().await.is_empty()
        && tokio::time::Instant::now() < hard_deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
