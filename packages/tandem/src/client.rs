//! Public client: start chains, inspect them, wait on them, delete them.
//!
//! The client is pure composition over the store operations and the type
//! registry. Every mutation runs inside a store transaction; notifications
//! publish only after the commit, so a subscriber can never observe a
//! topic for state that did not land.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::bus::{NotifyBus, topics};
use crate::error::{Error, Result};
use crate::events::{EventSink, JobEvent, TracingSink};
use crate::job::{Deduplication, Job, JobChain, JobStatus, Schedule};
use crate::registry::JobTypeRegistry;
use crate::runtime::{BlockerSpec, resolve_blocker_specs};
use crate::store::{
    ChainFilter, CreateJobRequest, CreateJobResult, JobFilter, JobStore, Page, PageRequest,
    StoreTransaction, in_transaction,
};

// ============================================================================
// Requests
// ============================================================================

/// Description of a chain to start. Blockers are declared the same way,
/// so chains of blockers nest.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct StartJobChain {
    pub type_name: String,
    pub input: Value,
    #[builder(default)]
    pub schedule: Schedule,
    #[builder(default)]
    pub deduplication: Option<Deduplication>,
    #[builder(default)]
    pub trace_context: Option<Value>,
    /// Blocker chains gating the root job, in order.
    #[builder(default)]
    pub start_blockers: Vec<BlockerSpec>,
}

impl StartJobChain {
    pub fn new(type_name: impl Into<String>, input: Value) -> Self {
        StartJobChain::builder()
            .type_name(type_name.into())
            .input(input)
            .build()
    }
}

/// Options for [`Client::wait_for_job_chain_completion`].
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct WaitOptions {
    #[builder(default = 100)]
    pub poll_interval_ms: u64,
    #[builder(default = 30_000)]
    pub timeout_ms: u64,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions::builder().build()
    }
}

/// Topics queued inside a [`Client::with_notify`] closure, flushed to the
/// bus only after the transaction commits.
#[derive(Debug, Default)]
pub struct NotifyQueue {
    topics: Vec<String>,
}

impl NotifyQueue {
    pub fn publish(&mut self, topic: impl Into<String>) {
        self.topics.push(topic.into());
    }
}

// ============================================================================
// Client
// ============================================================================

/// Handle for applications to drive the engine.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn NotifyBus>,
    registry: Arc<JobTypeRegistry>,
    sink: Arc<dyn EventSink>,
}

impl Client {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn NotifyBus>,
        registry: Arc<JobTypeRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Start a chain in its own transaction and publish its topics.
    pub async fn start_job_chain(&self, request: StartJobChain) -> Result<Job> {
        let mut queue = NotifyQueue::default();
        let mut events = Vec::new();

        let mut tx = self.store.begin().await?;
        let result = start_chain_tree(
            tx.as_mut(),
            &self.registry,
            request,
            None,
            &mut queue.topics,
            &mut events,
        )
        .await;
        let created = match result {
            Ok(created) => {
                tx.commit().await?;
                created
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed after start_job_chain error");
                }
                return Err(err);
            }
        };

        self.flush(queue, events);
        Ok(created.job)
    }

    /// Start a chain inside a caller-supplied transaction. Topics land on
    /// the queue and publish when the caller's `with_notify` commits.
    pub async fn start_job_chain_in(
        &self,
        tx: &mut dyn StoreTransaction,
        queue: &mut NotifyQueue,
        request: StartJobChain,
    ) -> Result<Job> {
        let mut events = Vec::new();
        let created = start_chain_tree(
            tx,
            &self.registry,
            request,
            None,
            &mut queue.topics,
            &mut events,
        )
        .await?;
        for event in &events {
            self.sink.emit(event);
        }
        Ok(created.job)
    }

    /// Run `f` against a transaction; on commit, publish everything the
    /// closure queued.
    pub async fn with_notify<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(
            &'a mut dyn StoreTransaction,
            &'a mut NotifyQueue,
        ) -> BoxFuture<'a, Result<T>>,
    {
        let mut queue = NotifyQueue::default();
        let mut tx = self.store.begin().await?;
        match f(tx.as_mut(), &mut queue).await {
            Ok(value) => {
                tx.commit().await?;
                self.flush(queue, Vec::new());
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed in with_notify");
                }
                Err(err)
            }
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_job_by_id(job_id).await })
        })
        .await
    }

    pub async fn get_job_chain(&self, chain_id: Uuid) -> Result<JobChain> {
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_job_chain_by_id(chain_id).await })
        })
        .await
    }

    /// The blocker chains of a job, in attachment order.
    pub async fn get_job_blockers(&self, job_id: Uuid) -> Result<Vec<JobChain>> {
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_job_blockers(job_id).await })
        })
        .await
    }

    /// Blocker links crossing out of the given root workflows. A non-empty
    /// result means deletion needs a wider set.
    pub async fn get_external_blockers(
        &self,
        root_chain_ids: Vec<Uuid>,
    ) -> Result<Vec<crate::job::BlockerLink>> {
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.get_external_blockers(&root_chain_ids).await })
        })
        .await
    }

    /// Poll the chain until completion or timeout.
    pub async fn wait_for_job_chain_completion(
        &self,
        chain_id: Uuid,
        options: WaitOptions,
    ) -> Result<JobChain> {
        let started = Instant::now();
        let timeout = Duration::from_millis(options.timeout_ms);
        let poll = Duration::from_millis(options.poll_interval_ms.max(1));

        loop {
            let chain = self.get_job_chain(chain_id).await?;
            if chain.is_completed() {
                return Ok(chain);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::WaitTimeout {
                    chain_id,
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll.min(timeout - elapsed)).await;
        }
    }

    /// Delete whole workflows by their root chain ids: every chain whose
    /// `root_chain_id` is in the set is removed with them. Fails with
    /// [`Error::BlockerReference`] when a chain outside the expansion
    /// still depends on one inside it.
    pub async fn delete_job_chains(&self, root_chain_ids: Vec<Uuid>) -> Result<u64> {
        let roots = root_chain_ids.clone();
        let (deleted, chain_ids) = in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                let mut chain_ids = tx.get_chain_ids_by_root(&roots).await?;
                for root in &roots {
                    if !chain_ids.contains(root) {
                        chain_ids.push(*root);
                    }
                }
                let deleted = tx.delete_jobs_by_chain_ids(&chain_ids).await?;
                Ok((deleted, chain_ids))
            })
        })
        .await?;

        for chain_id in &chain_ids {
            self.bus.publish(&topics::deleted(*chain_id));
        }
        self.sink.emit(&JobEvent::ChainsDeleted {
            chain_ids,
            jobs: deleted,
        });
        Ok(deleted)
    }

    pub async fn list_chains(
        &self,
        filter: ChainFilter,
        page: PageRequest,
    ) -> Result<Page<JobChain>> {
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.list_chains(filter, page).await })
        })
        .await
    }

    pub async fn list_jobs(&self, filter: JobFilter, page: PageRequest) -> Result<Page<Job>> {
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { tx.list_jobs(filter, page).await })
        })
        .await
    }

    fn flush(&self, queue: NotifyQueue, events: Vec<JobEvent>) {
        for topic in queue.topics {
            self.bus.publish(&topic);
        }
        for event in events {
            self.sink.emit(&event);
        }
    }
}

// ============================================================================
// Chain creation
// ============================================================================

/// Create a chain root with its blocker tree inside `tx`.
///
/// Validation runs before any write for this node; a failure aborts the
/// caller's transaction, so a validation error never leaves partial state.
/// Deduplicated roots return the existing owner untouched, blockers
/// included.
pub(crate) fn start_chain_tree<'a>(
    tx: &'a mut dyn StoreTransaction,
    registry: &'a JobTypeRegistry,
    chain: StartJobChain,
    origin_id: Option<Uuid>,
    topics_out: &'a mut Vec<String>,
    events_out: &'a mut Vec<JobEvent>,
) -> BoxFuture<'a, Result<CreateJobResult>> {
    Box::pin(async move {
        registry.validate_entry(&chain.type_name)?;
        registry.validate_input(&chain.type_name, &chain.input)?;
        if chain.start_blockers.is_empty() {
            registry.validate_blockers(&chain.type_name, &[])?;
        }

        let created = tx
            .create_job(
                CreateJobRequest::builder()
                    .type_name(chain.type_name.clone())
                    .chain_type_name(chain.type_name.clone())
                    .input(chain.input.clone())
                    .schedule(chain.schedule)
                    .deduplication(chain.deduplication.clone())
                    .trace_context(chain.trace_context.clone())
                    .origin_id(origin_id)
                    .build(),
            )
            .await?;

        if created.deduplicated {
            events_out.push(JobEvent::ChainStarted {
                chain_id: created.job.chain_id,
                type_name: created.job.type_name.clone(),
                deduplicated: true,
            });
            return Ok(created);
        }

        let mut job = created.job;
        if !chain.start_blockers.is_empty() {
            let refs = resolve_blocker_specs(
                tx,
                registry,
                &chain.type_name,
                chain.start_blockers,
                Some(job.id),
                topics_out,
                events_out,
            )
            .await?;
            let attached = tx.add_job_blockers(job.id, refs).await?;
            job = attached.job;
        }

        if job.status == JobStatus::Pending {
            topics_out.push(topics::job_type(&job.type_name));
        }
        events_out.push(JobEvent::ChainStarted {
            chain_id: job.chain_id,
            type_name: job.type_name.clone(),
            deduplicated: false,
        });
        Ok(CreateJobResult {
            job,
            deduplicated: false,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_options_defaults() {
        let options = WaitOptions::default();
        assert_eq!(options.poll_interval_ms, 100);
        assert_eq!(options.timeout_ms, 30_000);
    }

    #[test]
    fn start_request_builder_defaults() {
        let request = StartJobChain::new("greet", serde_json::json!({"name": "ada"}));
        assert_eq!(request.schedule, Schedule::Immediate);
        assert!(request.start_blockers.is_empty());
        assert!(request.deduplication.is_none());
    }

    #[test]
    fn notify_queue_collects_topics() {
        let mut queue = NotifyQueue::default();
        queue.publish("type:a");
        queue.publish(topics::chain_completed("b"));
        assert_eq!(queue.topics, vec!["type:a", "chain-completed:b"]);
    }
}
