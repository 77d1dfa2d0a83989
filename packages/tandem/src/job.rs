//! Job and chain model.
//!
//! A [`Job`] is the atomic unit of work. Jobs sharing a `chain_id` form a
//! *chain*: a totally-ordered sequence extended one link at a time by
//! continuations. The job at `chain_index` 0 is the chain root (its `id`
//! equals the `chain_id`); the job with the highest index is the chain's
//! current job. A chain is completed once its current job is completed.
//!
//! Chains can gate each other: a job may be *blocked* on one or more
//! blocker chains and only becomes pending once every one of them has
//! completed. When a still-independent chain is first attached as a
//! blocker it is *adopted* into the blocked job's workflow: every job of
//! the blocker chain has its `root_chain_id` rewritten and the blocker
//! root records the blocked job as its `origin_id`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Blocked,
    Running,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Blocked => "blocked",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "blocked" => Ok(JobStatus::Blocked),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Lifetime of a deduplication record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// The record holds only while the owning job is not yet completed.
    Incomplete,
    /// The record holds forever.
    Any,
}

impl DedupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupScope::Incomplete => "incomplete",
            DedupScope::Any => "any",
        }
    }
}

impl std::str::FromStr for DedupScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(DedupScope::Incomplete),
            "any" => Ok(DedupScope::Any),
            other => Err(format!("unknown dedup scope: {other}")),
        }
    }
}

/// Deduplication request attached to a job creation.
///
/// Two creations with the same `(type_name, key)` resolve to the same job
/// while the scope holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduplication {
    pub key: String,
    pub scope: DedupScope,
}

impl Deduplication {
    pub fn incomplete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: DedupScope::Incomplete,
        }
    }

    pub fn any(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: DedupScope::Any,
        }
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// When a job becomes eligible for acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Eligible as soon as it is committed.
    #[default]
    Immediate,
    /// Eligible after the given delay.
    AfterMs(u64),
    /// Eligible at the given instant.
    At(DateTime<Utc>),
}

impl Schedule {
    pub fn after_ms(ms: u64) -> Self {
        Schedule::AfterMs(ms)
    }

    /// Resolve to an absolute instant relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Immediate => now,
            Schedule::AfterMs(ms) => now + Duration::milliseconds(*ms as i64),
            Schedule::At(at) => *at,
        }
    }
}

/// Exponential retry policy for unexpected processor failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt, given the attempt that just failed
    /// (1-based). Capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: i32) -> u64 {
        let exponent = attempt.saturating_sub(1).max(0) as f64;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powf(exponent);
        if raw.is_finite() {
            (raw as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        }
    }
}

/// Lease policy for running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub lease_ms: u64,
    pub renew_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            renew_interval_ms: 10_000,
        }
    }
}

// ============================================================================
// Job
// ============================================================================

/// A persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub type_name: String,

    // Chain linkage
    pub chain_id: Uuid,
    pub chain_index: i32,
    pub chain_type_name: String,
    pub root_chain_id: Uuid,
    pub origin_id: Option<Uuid>,

    // State
    pub status: JobStatus,
    pub input: Value,
    pub output: Option<Value>,

    // Attempt tracking
    pub attempt: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_error: Option<String>,

    // Scheduling
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    // Lease
    pub leased_by: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,

    // Deduplication
    pub dedup_key: Option<String>,
    pub dedup_scope: Option<DedupScope>,

    // Tracing
    pub trace_context: Option<Value>,
}

impl Job {
    /// Whether this job is the root of its chain.
    pub fn is_chain_root(&self) -> bool {
        self.chain_index == 0
    }

    /// Whether this job's lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.leased_until.map(|until| until < now).unwrap_or(true)
    }

    /// Whether the job is eligible for acquisition at `now`.
    pub fn acquirable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }
}

// ============================================================================
// Chain view
// ============================================================================

/// A chain as read back from the store: its root job and, when the chain
/// has grown past the root, its latest job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChain {
    pub root: Job,
    pub last: Option<Job>,
}

impl JobChain {
    /// The chain's current job: the one with the highest `chain_index`.
    pub fn current(&self) -> &Job {
        self.last.as_ref().unwrap_or(&self.root)
    }

    pub fn chain_id(&self) -> Uuid {
        self.root.chain_id
    }

    pub fn chain_type_name(&self) -> &str {
        &self.root.chain_type_name
    }

    /// A chain is completed once its current job is completed. The current
    /// job and its continuation commit in one transaction, so a completed
    /// current job with no successor is terminal.
    pub fn is_completed(&self) -> bool {
        self.current().status == JobStatus::Completed
    }

    /// Output of the chain, once completed.
    pub fn output(&self) -> Option<&Value> {
        if self.is_completed() {
            self.current().output.as_ref()
        } else {
            None
        }
    }
}

/// A persisted blocker link: `blocked_job` waits for `blocker_chain` to
/// complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockerLink {
    pub blocked_job_id: Uuid,
    pub blocker_chain_id: Uuid,
    pub blocker_trace_context: Option<Value>,
}
