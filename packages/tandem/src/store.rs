//! Store-operation contract every persistence driver implements.
//!
//! The engine talks to its store through two traits:
//!
//! - [`JobStore`] opens transactions.
//! - [`StoreTransaction`] carries every state transition the engine
//!   performs. Each operation runs against the open transaction; nothing
//!   is visible to other workers until [`StoreTransaction::commit`].
//!
//! Drivers must provide `SELECT ... FOR UPDATE SKIP LOCKED`-equivalent
//! semantics for [`StoreTransaction::acquire_job`] and row-locking reads
//! for the `*_for_update` helpers, plus idempotent insert on the
//! `(chain_id, chain_index)` key and on deduplication keys. The
//! [`crate::conformance`] suite checks all of this against a live driver.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{BlockerLink, Deduplication, Job, JobChain, JobStatus, Schedule};

// ============================================================================
// Requests and results
// ============================================================================

/// Inputs for [`StoreTransaction::create_job`].
///
/// When `chain_id` is absent the job starts a fresh chain: the store
/// assigns `chain_id = id`, requires `chain_index = 0`, and roots the
/// chain at itself unless `root_chain_id` is supplied.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateJobRequest {
    pub type_name: String,
    #[builder(default)]
    pub chain_id: Option<Uuid>,
    #[builder(default = 0)]
    pub chain_index: i32,
    pub chain_type_name: String,
    pub input: Value,
    #[builder(default)]
    pub schedule: Schedule,
    #[builder(default)]
    pub deduplication: Option<Deduplication>,
    #[builder(default)]
    pub trace_context: Option<Value>,
    #[builder(default)]
    pub root_chain_id: Option<Uuid>,
    #[builder(default)]
    pub origin_id: Option<Uuid>,
}

/// Result of [`StoreTransaction::create_job`]. `deduplicated` is true when
/// an existing row was returned instead of inserting a new one, either via
/// a deduplication record or a `(chain_id, chain_index)` collision.
#[derive(Debug, Clone)]
pub struct CreateJobResult {
    pub job: Job,
    pub deduplicated: bool,
}

/// A blocker chain reference handed to [`StoreTransaction::add_job_blockers`].
#[derive(Debug, Clone)]
pub struct BlockerRef {
    pub chain_id: Uuid,
    pub trace_context: Option<Value>,
}

impl BlockerRef {
    pub fn new(chain_id: Uuid) -> Self {
        Self {
            chain_id,
            trace_context: None,
        }
    }
}

/// Result of [`StoreTransaction::add_job_blockers`].
#[derive(Debug, Clone)]
pub struct AddJobBlockersResult {
    /// The blocked job, re-read after the status transition.
    pub job: Job,
    /// Exactly the subset of the requested blockers whose chains are not
    /// yet completed. Empty means the job stayed pending.
    pub incomplete_blocker_chain_ids: Vec<Uuid>,
    /// Root trace contexts of the blocker chains, in request order.
    pub blocker_trace_contexts: Vec<Option<Value>>,
}

/// Result of [`StoreTransaction::schedule_blocked_jobs`].
#[derive(Debug, Clone)]
pub struct ScheduleBlockedJobsResult {
    /// Jobs that transitioned `blocked -> pending`.
    pub unblocked_jobs: Vec<Job>,
}

/// Inputs for [`StoreTransaction::acquire_job`].
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AcquireJobRequest {
    pub type_names: Vec<String>,
    pub worker_id: String,
    pub lease_ms: u64,
}

/// Result of [`StoreTransaction::acquire_job`]. `has_more` is true when at
/// least one additional eligible job was observed but left unclaimed.
#[derive(Debug, Clone)]
pub struct AcquireJobResult {
    pub job: Option<Job>,
    pub has_more: bool,
}

// ============================================================================
// Listing
// ============================================================================

/// Opaque pagination cursor: position of the last row of the previous
/// page under the `(created_at DESC, id DESC)` ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.timestamp_micros(), self.id);
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bad = || Error::InvalidRequest {
            message: format!("malformed cursor: {encoded}"),
        };
        let raw = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| bad())?;
        let raw = String::from_utf8(raw).map_err(|_| bad())?;
        let (micros, id) = raw.split_once('|').ok_or_else(bad)?;
        let micros: i64 = micros.parse().map_err(|_| bad())?;
        let created_at = DateTime::from_timestamp_micros(micros).ok_or_else(bad)?;
        let id: Uuid = id.parse().map_err(|_| bad())?;
        Ok(Self { created_at, id })
    }
}

/// Page request with an optional cursor from the previous page.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 50;

    pub fn first(limit: u32) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).max(1)
    }
}

/// One page of results plus the cursor for the next page, if any.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Filter for [`StoreTransaction::list_chains`].
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(setter(into), default))]
pub struct ChainFilter {
    pub chain_type_names: Option<Vec<String>>,
    /// `Some(true)` keeps only completed chains, `Some(false)` only
    /// incomplete ones.
    pub completed: Option<bool>,
}

/// Filter for [`StoreTransaction::list_jobs`].
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(setter(into), default))]
pub struct JobFilter {
    pub type_names: Option<Vec<String>>,
    pub statuses: Option<Vec<JobStatus>>,
    pub chain_id: Option<Uuid>,
    pub root_chain_id: Option<Uuid>,
}

// ============================================================================
// Traits
// ============================================================================

/// A persistence driver: a factory for store transactions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Open a transaction. Everything done through the returned handle is
    /// invisible to other transactions until `commit`.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// The transactional operation set.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Create a job, or return the existing owner of a deduplication key
    /// or `(chain_id, chain_index)` slot.
    async fn create_job(&mut self, req: CreateJobRequest) -> Result<CreateJobResult>;

    /// Link blocker chains to a job, adopting still-independent chains
    /// into the job's root workflow. The job transitions to blocked iff
    /// any linked chain is not yet completed.
    async fn add_job_blockers(
        &mut self,
        job_id: Uuid,
        blockers: Vec<BlockerRef>,
    ) -> Result<AddJobBlockersResult>;

    /// Flip to pending every job blocked on `blocked_by_chain_id` whose
    /// blocker chains have now all completed.
    async fn schedule_blocked_jobs(
        &mut self,
        blocked_by_chain_id: Uuid,
    ) -> Result<ScheduleBlockedJobsResult>;

    /// `Some(0)` when a pending job of the given types is already due,
    /// `Some(ms)` until the earliest future one, `None` when there are no
    /// pending jobs of those types at all.
    async fn next_job_available_in_ms(&mut self, type_names: &[String]) -> Result<Option<u64>>;

    /// Claim the oldest eligible pending job of the given types, skipping
    /// rows locked by concurrent acquirers. Ordering is
    /// `(scheduled_at, created_at, id)` ascending.
    async fn acquire_job(&mut self, req: AcquireJobRequest) -> Result<AcquireJobResult>;

    /// Extend the lease of a running job held by `worker_id`.
    async fn renew_job_lease(
        &mut self,
        job_id: Uuid,
        worker_id: &str,
        lease_ms: u64,
    ) -> Result<Job>;

    /// Transition `running -> pending` at the given schedule, recording
    /// the attempt error and clearing the lease.
    async fn reschedule_job(
        &mut self,
        job_id: Uuid,
        schedule: Schedule,
        error: &str,
    ) -> Result<Job>;

    /// Transition `running -> completed`, writing the output. When
    /// `worker_id` is supplied the lease must still be held by it.
    async fn complete_job(
        &mut self,
        job_id: Uuid,
        output: Value,
        worker_id: Option<&str>,
    ) -> Result<Job>;

    /// Reset one expired running job of the given types back to pending,
    /// skipping `ignored_job_ids` (the caller's own in-flight jobs).
    /// Returns the row as it was observed, stale lease fields included,
    /// so the caller can report who abandoned it.
    async fn remove_expired_job_lease(
        &mut self,
        type_names: &[String],
        ignored_job_ids: &[Uuid],
    ) -> Result<Option<Job>>;

    /// Delete every job whose `chain_id` is in the set. Fails with
    /// [`Error::BlockerReference`] when a chain in the set is still
    /// referenced as a blocker by a job outside it.
    async fn delete_jobs_by_chain_ids(&mut self, chain_ids: &[Uuid]) -> Result<u64>;

    // ---- reads -------------------------------------------------------------

    async fn get_job_by_id(&mut self, job_id: Uuid) -> Result<Option<Job>>;

    /// Row-locking read; the job stays locked until the transaction ends.
    async fn get_job_for_update(&mut self, job_id: Uuid) -> Result<Job>;

    /// Row-locking read of the chain's current job (highest index).
    async fn get_current_job_for_update(&mut self, chain_id: Uuid) -> Result<Job>;

    async fn get_job_chain_by_id(&mut self, chain_id: Uuid) -> Result<JobChain>;

    /// The blocker chains of a job, in link insertion order.
    async fn get_job_blockers(&mut self, job_id: Uuid) -> Result<Vec<JobChain>>;

    /// Blocker links that cross out of the given root workflows: the
    /// blocked job's root is in the set, the blocker chain's is not.
    async fn get_external_blockers(&mut self, root_chain_ids: &[Uuid]) -> Result<Vec<BlockerLink>>;

    async fn get_jobs_blocked_by_chain(&mut self, chain_id: Uuid) -> Result<Vec<Job>>;

    /// Distinct `chain_id`s of every job whose `root_chain_id` is in the
    /// set: the full extent of those workflows.
    async fn get_chain_ids_by_root(&mut self, root_chain_ids: &[Uuid]) -> Result<Vec<Uuid>>;

    async fn list_chains(
        &mut self,
        filter: ChainFilter,
        page: PageRequest,
    ) -> Result<Page<JobChain>>;

    async fn list_jobs(&mut self, filter: JobFilter, page: PageRequest) -> Result<Page<Job>>;

    // ---- lifecycle ---------------------------------------------------------

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `f` inside a fresh transaction, committing on success and rolling
/// back on error.
pub async fn in_transaction<S, T, F>(store: &S, f: F) -> Result<T>
where
    S: JobStore + ?Sized,
    F: for<'a> FnOnce(&'a mut dyn StoreTransaction) -> BoxFuture<'a, Result<T>>,
{
    let mut tx = store.begin().await?;
    match f(tx.as_mut()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // Rollback failures are secondary; the original error wins.
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed after aborted transaction");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            created_at: DateTime::from_timestamp_micros(1_700_000_123_456_789).unwrap(),
            id: Uuid::new_v4(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(Cursor::decode("not base64 !!!").is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("no-separator")).is_err());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("abc|not-a-uuid")).is_err());
    }

    #[test]
    fn page_request_limit_defaults_and_floors() {
        assert_eq!(PageRequest::default().effective_limit(), 50);
        assert_eq!(PageRequest::first(10).effective_limit(), 10);
        let zero = PageRequest {
            cursor: None,
            limit: Some(0),
        };
        assert_eq!(zero.effective_limit(), 1);
    }

    #[test]
    fn create_request_builder_fills_defaults() {
        let req = CreateJobRequest::builder()
            .type_name("greet")
            .chain_type_name("greet")
            .input(json!({"name": "ada"}))
            .build();
        assert!(req.chain_id.is_none());
        assert_eq!(req.chain_index, 0);
        assert_eq!(req.schedule, Schedule::Immediate);
        assert!(req.deduplication.is_none());
        assert!(req.origin_id.is_none());
    }
}
