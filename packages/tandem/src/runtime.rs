//! Per-job execution harness.
//!
//! A processor receives a [`JobContext`] and must complete the job exactly
//! once: either with a final output ([`JobContext::complete`]) or by
//! extending the chain ([`JobContext::continue_with`]). An optional
//! [`JobContext::prepare`] phase runs user side effects inside a store
//! transaction before the work; in [`PrepareMode::Atomic`] that same
//! transaction later carries the completion write, making the side effects
//! all-or-nothing with it.
//!
//! The harness enforces the protocol with three booleans (`prepared`,
//! `completed`, `continued`) and fails re-entrant calls with
//! [`Error::ProtocolViolation`]. User code requests a retry by returning
//! [`JobFailure::Reschedule`]; any other failure goes through the type's
//! exponential retry policy in the worker.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::client::{StartJobChain, start_chain_tree};
use crate::error::{CancelReason, Error, JobFailure, Result};
use crate::events::JobEvent;
use crate::job::{Job, JobChain, JobStatus, Schedule};
use crate::registry::JobTypeRegistry;
use crate::store::{BlockerRef, CreateJobRequest, JobStore, StoreTransaction, in_transaction};
use crate::bus::topics;

// ============================================================================
// Requests
// ============================================================================

/// Transaction strategy for [`JobContext::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    /// Keep the transaction open; the completion write commits with it.
    Atomic,
    /// Commit immediately; completion opens a fresh transaction later.
    Staged,
}

/// A blocker to attach: either a chain started on the spot or one that
/// already exists.
#[derive(Debug, Clone)]
pub enum BlockerSpec {
    Start(StartJobChain),
    Existing(Uuid),
}

impl From<StartJobChain> for BlockerSpec {
    fn from(chain: StartJobChain) -> Self {
        BlockerSpec::Start(chain)
    }
}

impl From<Uuid> for BlockerSpec {
    fn from(chain_id: Uuid) -> Self {
        BlockerSpec::Existing(chain_id)
    }
}

/// The next job of the chain, created atomically with the completion of
/// the current one.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Continuation {
    pub type_name: String,
    pub input: Value,
    #[builder(default)]
    pub schedule: Schedule,
    #[builder(default)]
    pub blockers: Vec<BlockerSpec>,
    /// Defaults to the current job's trace context.
    #[builder(default)]
    pub trace_context: Option<Value>,
}

impl Continuation {
    pub fn new(type_name: impl Into<String>, input: Value) -> Self {
        Continuation::builder()
            .type_name(type_name.into())
            .input(input)
            .build()
    }
}

// ============================================================================
// Cancellation signal
// ============================================================================

/// Cooperative cancellation handle given to each processor invocation.
#[derive(Clone)]
pub struct JobSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl JobSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Fire the signal. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the signal fired. A parent-token cancellation without an
    /// explicit reason reads as a worker shutdown.
    pub fn reason(&self) -> CancelReason {
        self.reason
            .get()
            .copied()
            .unwrap_or(CancelReason::WorkerStopping)
    }

    /// Resolves when the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Bail out early if the signal already fired.
    pub fn check(&self) -> std::result::Result<(), JobFailure> {
        if self.is_cancelled() {
            Err(JobFailure::Cancelled(self.reason()))
        } else {
            Ok(())
        }
    }

    /// Signal-aware sleep: the canonical way for processors to wait.
    pub async fn sleep(&self, duration: Duration) -> std::result::Result<(), JobFailure> {
        tokio::select! {
            _ = self.token.cancelled() => Err(JobFailure::Cancelled(self.reason())),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

// ============================================================================
// Job context
// ============================================================================

#[derive(Default)]
struct ContextState {
    prepared: bool,
    completed: bool,
    continued: bool,
    held_tx: Option<Box<dyn StoreTransaction>>,
    topics: Vec<String>,
    events: Vec<JobEvent>,
}

struct ContextInner {
    job: Job,
    blockers: Vec<JobChain>,
    store: Arc<dyn JobStore>,
    registry: Arc<JobTypeRegistry>,
    worker_id: String,
    signal: JobSignal,
    state: tokio::sync::Mutex<ContextState>,
}

/// Execution context handed to a processor. Cheap to clone; all clones
/// share the protocol state.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl JobContext {
    pub(crate) fn new(
        job: Job,
        blockers: Vec<JobChain>,
        store: Arc<dyn JobStore>,
        registry: Arc<JobTypeRegistry>,
        worker_id: String,
        signal: JobSignal,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                job,
                blockers,
                store,
                registry,
                worker_id,
                signal,
                state: tokio::sync::Mutex::new(ContextState::default()),
            }),
        }
    }

    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    pub fn input(&self) -> &Value {
        &self.inner.job.input
    }

    pub fn attempt(&self) -> i32 {
        self.inner.job.attempt
    }

    pub fn last_attempt_error(&self) -> Option<&str> {
        self.inner.job.last_attempt_error.as_deref()
    }

    /// The blocker chains this job waited on, in attachment order. All of
    /// them are completed by the time the processor runs.
    pub fn blockers(&self) -> &[JobChain] {
        &self.inner.blockers
    }

    pub fn blocker(&self, index: usize) -> Option<&JobChain> {
        self.inner.blockers.get(index)
    }

    pub fn signal(&self) -> &JobSignal {
        &self.inner.signal
    }

    /// Signal-aware sleep, in milliseconds.
    pub async fn sleep(&self, ms: u64) -> std::result::Result<(), JobFailure> {
        self.inner.signal.sleep(Duration::from_millis(ms)).await
    }

    /// Build the control value requesting a retry at an exact schedule.
    pub fn reschedule(&self, schedule: Schedule, message: impl Into<String>) -> JobFailure {
        JobFailure::reschedule(schedule, message)
    }

    fn violation(&self, call: &'static str, message: &str) -> JobFailure {
        JobFailure::from(Error::ProtocolViolation {
            call,
            job_id: self.inner.job.id,
            message: message.to_string(),
        })
    }

    /// Run a preparatory phase inside a store transaction.
    ///
    /// `Atomic` keeps the transaction open so the later completion commits
    /// together with whatever `f` did. `Staged` commits right away and the
    /// completion opens its own transaction. Callable at most once, and
    /// only before completion.
    pub async fn prepare<F>(
        &self,
        mode: PrepareMode,
        f: F,
    ) -> std::result::Result<(), JobFailure>
    where
        F: for<'a> FnOnce(&'a mut dyn StoreTransaction) -> BoxFuture<'a, anyhow::Result<()>>,
    {
        let mut state = self.inner.state.lock().await;
        if state.prepared {
            return Err(self.violation("prepare", "called more than once"));
        }
        if state.completed {
            return Err(self.violation("prepare", "called after completion"));
        }
        state.prepared = true;

        let mut tx = self.inner.store.begin().await.map_err(JobFailure::from)?;
        if let Err(err) = f(tx.as_mut()).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed after prepare error");
            }
            return Err(JobFailure::Unexpected(err));
        }
        match mode {
            PrepareMode::Staged => tx.commit().await.map_err(JobFailure::from)?,
            PrepareMode::Atomic => state.held_tx = Some(tx),
        }
        Ok(())
    }

    /// Complete the job with a final output. Exactly-once: a second
    /// completion call fails without touching the store.
    pub async fn complete(&self, output: Value) -> std::result::Result<(), JobFailure> {
        let mut state = self.inner.state.lock().await;
        if state.completed {
            return Err(self.violation("complete", "called more than once"));
        }
        self.inner
            .registry
            .validate_output(&self.inner.job.type_name, &output)
            .map_err(JobFailure::from)?;
        self.finish(&mut state, output, None).await?;
        Ok(())
    }

    /// Complete the job by appending the next link of the chain. The
    /// continuation commits in the same transaction as the completion;
    /// retries after a crash land on the `(chain_id, chain_index)` unique
    /// key and resolve to the already-inserted row.
    pub async fn continue_with(
        &self,
        continuation: Continuation,
    ) -> std::result::Result<Job, JobFailure> {
        let mut state = self.inner.state.lock().await;
        if state.continued {
            return Err(self.violation("continue_with", "called more than once"));
        }
        if state.completed {
            return Err(self.violation("continue_with", "called after completion"));
        }
        let job = &self.inner.job;
        self.inner
            .registry
            .validate_continuation(&job.type_name, &continuation.type_name)
            .map_err(JobFailure::from)?;
        self.inner
            .registry
            .validate_input(&continuation.type_name, &continuation.input)
            .map_err(JobFailure::from)?;

        let next = self.finish(&mut state, Value::Null, Some(continuation)).await?;
        state.continued = true;
        Ok(next.expect("continuation job present when a continuation was requested"))
    }

    /// The completion transaction. Locks the chain root before the job row
    /// so the blocker-attach path, which takes the same locks in the same
    /// order, serializes against it.
    async fn finish(
        &self,
        state: &mut ContextState,
        output: Value,
        continuation: Option<Continuation>,
    ) -> std::result::Result<Option<Job>, JobFailure> {
        let mut tx = match state.held_tx.take() {
            Some(tx) => tx,
            None => self.inner.store.begin().await.map_err(JobFailure::from)?,
        };

        let result = self
            .finish_in_tx(tx.as_mut(), state, output, continuation)
            .await;
        match result {
            Ok(next) => {
                tx.commit().await.map_err(JobFailure::from)?;
                state.completed = true;
                Ok(next)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed after completion error");
                }
                Err(err)
            }
        }
    }

    async fn finish_in_tx(
        &self,
        tx: &mut dyn StoreTransaction,
        state: &mut ContextState,
        output: Value,
        continuation: Option<Continuation>,
    ) -> std::result::Result<Option<Job>, JobFailure> {
        let job = &self.inner.job;
        let registry = &self.inner.registry;
        let worker_id = &self.inner.worker_id;

        // Lock order: chain root first, then the job row. The blocker
        // attach path takes the same locks in the same order.
        let root = tx.get_job_for_update(job.chain_id).await?;
        let current = if job.id == job.chain_id {
            root
        } else {
            tx.get_job_for_update(job.id).await?
        };
        if current.status != JobStatus::Running
            || current.leased_by.as_deref() != Some(worker_id.as_str())
        {
            return Err(JobFailure::from(Error::LeaseExpired {
                job_id: job.id,
                worker_id: worker_id.clone(),
            }));
        }

        tx.complete_job(job.id, output, Some(worker_id.as_str()))
            .await?;

        let next = match continuation {
            Some(continuation) => {
                let created = tx
                    .create_job(
                        CreateJobRequest::builder()
                            .type_name(continuation.type_name.clone())
                            .chain_id(Some(job.chain_id))
                            .chain_index(job.chain_index + 1)
                            .chain_type_name(job.chain_type_name.clone())
                            .input(continuation.input.clone())
                            .schedule(continuation.schedule)
                            .trace_context(
                                continuation
                                    .trace_context
                                    .clone()
                                    .or_else(|| job.trace_context.clone()),
                            )
                            .root_chain_id(Some(job.root_chain_id))
                            .origin_id(Some(job.id))
                            .build(),
                    )
                    .await?;
                let mut next_job = created.job;

                if !created.deduplicated && !continuation.blockers.is_empty() {
                    let refs = resolve_blocker_specs(
                        tx,
                        registry,
                        &continuation.type_name,
                        continuation.blockers,
                        Some(job.id),
                        &mut state.topics,
                        &mut state.events,
                    )
                    .await?;
                    let attached = tx.add_job_blockers(next_job.id, refs).await?;
                    next_job = attached.job;
                }

                if next_job.status == JobStatus::Pending {
                    state.topics.push(topics::job_type(&next_job.type_name));
                }
                state.events.push(JobEvent::JobContinued {
                    job_id: job.id,
                    type_name: job.type_name.clone(),
                    next_job_id: next_job.id,
                    next_type_name: next_job.type_name.clone(),
                });
                Some(next_job)
            }
            None => {
                // Terminal completion: the chain is done, release whatever
                // was gated on it.
                let unblocked = tx.schedule_blocked_jobs(job.chain_id).await?;
                for unblocked_job in &unblocked.unblocked_jobs {
                    state.topics.push(topics::job_type(&unblocked_job.type_name));
                    state.events.push(JobEvent::JobUnblocked {
                        job_id: unblocked_job.id,
                        type_name: unblocked_job.type_name.clone(),
                    });
                }
                state
                    .topics
                    .push(topics::chain_completed(&job.chain_type_name));
                state.events.push(JobEvent::ChainCompleted {
                    chain_id: job.chain_id,
                    chain_type_name: job.chain_type_name.clone(),
                });
                None
            }
        };

        state.events.push(JobEvent::JobCompleted {
            job_id: job.id,
            type_name: job.type_name.clone(),
            worker_id: worker_id.clone(),
            chain_completed: next.is_none(),
        });
        Ok(next)
    }

    pub(crate) async fn was_completed(&self) -> bool {
        self.inner.state.lock().await.completed
    }

    /// Drain the topics queued by committed transactions. Published by the
    /// worker after the processor returns.
    pub(crate) async fn take_topics(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.state.lock().await.topics)
    }

    pub(crate) async fn take_events(&self) -> Vec<JobEvent> {
        std::mem::take(&mut self.inner.state.lock().await.events)
    }

    /// Roll back a transaction left open by an atomic prepare whose
    /// completion never happened.
    pub(crate) async fn abandon_held_tx(&self) {
        let held = self.inner.state.lock().await.held_tx.take();
        if let Some(tx) = held {
            if let Err(err) = tx.rollback().await {
                tracing::warn!(error = %err, "rollback of abandoned prepare transaction failed");
            }
        }
    }
}

/// Resolve blocker specs into persisted chain references, starting fresh
/// chains as needed, and validate them against the blocked type's rule.
pub(crate) async fn resolve_blocker_specs(
    tx: &mut dyn StoreTransaction,
    registry: &JobTypeRegistry,
    blocked_type_name: &str,
    specs: Vec<BlockerSpec>,
    origin_id: Option<Uuid>,
    topics_out: &mut Vec<String>,
    events_out: &mut Vec<JobEvent>,
) -> Result<Vec<BlockerRef>> {
    let mut refs = Vec::with_capacity(specs.len());
    let mut chain_types = Vec::with_capacity(specs.len());

    for spec in specs {
        match spec {
            BlockerSpec::Start(chain) => {
                let trace = chain.trace_context.clone();
                let created =
                    start_chain_tree(tx, registry, chain, origin_id, topics_out, events_out)
                        .await?;
                chain_types.push(created.job.chain_type_name.clone());
                refs.push(BlockerRef {
                    chain_id: created.job.chain_id,
                    trace_context: trace,
                });
            }
            BlockerSpec::Existing(chain_id) => {
                let chain = tx.get_job_chain_by_id(chain_id).await?;
                chain_types.push(chain.chain_type_name().to_string());
                refs.push(BlockerRef {
                    chain_id,
                    trace_context: chain.root.trace_context.clone(),
                });
            }
        }
    }

    let type_refs: Vec<&str> = chain_types.iter().map(String::as_str).collect();
    registry.validate_blockers(blocked_type_name, &type_refs)?;
    Ok(refs)
}

// ============================================================================
// Dispatch harness
// ============================================================================

/// Run the registered processor for an acquired job. Returns the context
/// (for topic/event draining) alongside the processor verdict.
pub(crate) async fn run_processor(
    store: Arc<dyn JobStore>,
    registry: Arc<JobTypeRegistry>,
    worker_id: String,
    job: Job,
    signal: JobSignal,
) -> (JobContext, std::result::Result<(), JobFailure>) {
    let job_id = job.id;
    let blockers = match in_transaction(store.as_ref(), |tx| {
        Box::pin(async move { tx.get_job_blockers(job_id).await })
    })
    .await
    {
        Ok(blockers) => blockers,
        Err(err) => {
            let ctx = JobContext::new(job, Vec::new(), store, registry, worker_id, signal);
            return (ctx, Err(JobFailure::from(err)));
        }
    };

    let processor = registry.processor(&job.type_name);
    let ctx = JobContext::new(job, blockers, store, registry, worker_id, signal);
    let result = match processor {
        Some(processor) => processor(ctx.clone()).await,
        None => Err(JobFailure::unexpected(anyhow::anyhow!(
            "no processor registered for job type `{}`",
            ctx.job().type_name
        ))),
    };

    // An atomic prepare whose completion never ran must not leak its
    // transaction.
    ctx.abandon_held_tx().await;

    let result = match result {
        Ok(()) if !ctx.was_completed().await => Err(JobFailure::unexpected(anyhow::anyhow!(
            "processor for `{}` returned without completing the job",
            ctx.job().type_name
        ))),
        other => other,
    };
    (ctx, result)
}
