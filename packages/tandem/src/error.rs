//! Structured error types and the processor failure channel.
//!
//! `Error` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. The boundary rule: no `anyhow::Error` crosses a public
//! API; `anyhow` is internal transport for driver backends
//! ([`Error::Storage`]) and for user processor code
//! ([`JobFailure::Unexpected`]).

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::job::Schedule;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the engine and its store drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// Input/output/continuation/blocker shape or entry-type rule violated.
    #[error("job type validation failed for `{type_name}`: {message}")]
    JobTypeValidation { type_name: String, message: String },

    /// A lease-guarded write found the lease no longer held.
    #[error("lease on job {job_id} is not held by worker `{worker_id}`")]
    LeaseExpired { job_id: Uuid, worker_id: String },

    /// Deletion would orphan blocker links held by jobs outside the
    /// deletion set. The offending blocker chains are listed.
    #[error("chains still referenced as blockers from outside the deletion set: {chain_ids:?}")]
    BlockerReference { chain_ids: Vec<Uuid> },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    #[error("chain {chain_id} not found")]
    ChainNotFound { chain_id: Uuid },

    /// A once-only processing call was made twice, or out of order.
    #[error("`{call}` violated the processing protocol for job {job_id}: {message}")]
    ProtocolViolation {
        call: &'static str,
        job_id: Uuid,
        message: String,
    },

    #[error("chain {chain_id} did not complete within {waited_ms}ms")]
    WaitTimeout { chain_id: Uuid, waited_ms: u64 },

    #[error("malformed request: {message}")]
    InvalidRequest { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Transient transport error from the persistence backend.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl Error {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Error::Storage(err.into())
    }

    pub fn validation(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::JobTypeValidation {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the enclosing operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Why a processor's cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The worker lost the job's lease.
    LeaseExpired,
    /// The job was deleted underneath the processor.
    NotFound,
    /// The worker is shutting down.
    WorkerStopping,
    /// A configured processing deadline elapsed.
    Timeout,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::LeaseExpired => "lease_expired",
            CancelReason::NotFound => "not_found",
            CancelReason::WorkerStopping => "worker_stopping",
            CancelReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Processor failure channel
// ============================================================================

/// How a processor invocation ended short of completion.
///
/// `Reschedule` is a control value, not an error: user code requests a
/// retry at an exact schedule and the recorded message becomes the job's
/// `last_attempt_error`. Everything else is an unexpected failure handled
/// by the job type's retry policy.
#[derive(Debug)]
pub enum JobFailure {
    /// Retry at the given schedule; no exponential backoff applied.
    Reschedule { schedule: Schedule, message: String },
    /// The cancellation signal fired and the processor unwound.
    Cancelled(CancelReason),
    /// Anything else thrown by user code or the completion path.
    Unexpected(anyhow::Error),
}

impl JobFailure {
    /// Request a retry at an exact schedule.
    pub fn reschedule(schedule: Schedule, message: impl Into<String>) -> Self {
        JobFailure::Reschedule {
            schedule,
            message: message.into(),
        }
    }

    pub fn unexpected(err: impl Into<anyhow::Error>) -> Self {
        JobFailure::Unexpected(err.into())
    }

    /// The message recorded as `last_attempt_error`.
    pub fn attempt_error(&self) -> String {
        match self {
            JobFailure::Reschedule { message, .. } => message.clone(),
            JobFailure::Cancelled(reason) => format!("cancelled: {reason}"),
            JobFailure::Unexpected(err) => format!("{err:#}"),
        }
    }

    /// The typed engine error underneath, when there is one.
    pub fn as_engine_error(&self) -> Option<&Error> {
        match self {
            JobFailure::Unexpected(err) => err.downcast_ref::<Error>(),
            _ => None,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Reschedule { message, .. } => write!(f, "reschedule requested: {message}"),
            JobFailure::Cancelled(reason) => write!(f, "cancelled: {reason}"),
            JobFailure::Unexpected(err) => write!(f, "{err:#}"),
        }
    }
}

impl From<Error> for JobFailure {
    fn from(err: Error) -> Self {
        JobFailure::Unexpected(anyhow::Error::new(err))
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(err: anyhow::Error) -> Self {
        JobFailure::Unexpected(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_converts_anyhow_errors() {
        fn parse() -> Result<i32, JobFailure> {
            let n: i32 = "not a number"
                .parse()
                .map_err(anyhow::Error::new)?;
            Ok(n)
        }
        match parse() {
            Err(JobFailure::Unexpected(_)) => {}
            other => panic!("expected unexpected failure, got {other:?}"),
        }
    }

    #[test]
    fn engine_error_is_recoverable_from_failure() {
        let failure = JobFailure::from(Error::LeaseExpired {
            job_id: Uuid::new_v4(),
            worker_id: "w-1".to_string(),
        });
        assert!(matches!(
            failure.as_engine_error(),
            Some(Error::LeaseExpired { .. })
        ));
    }

    #[test]
    fn reschedule_keeps_its_message() {
        let failure = JobFailure::reschedule(Schedule::after_ms(300), "again");
        assert_eq!(failure.attempt_error(), "again");
    }

    #[test]
    fn cancel_reasons_render_stably() {
        assert_eq!(CancelReason::LeaseExpired.as_str(), "lease_expired");
        assert_eq!(CancelReason::NotFound.as_str(), "not_found");
        assert_eq!(CancelReason::WorkerStopping.as_str(), "worker_stopping");
        assert_eq!(CancelReason::Timeout.as_str(), "timeout");
    }

    #[test]
    fn only_storage_errors_are_transient() {
        assert!(Error::storage(anyhow::anyhow!("connection reset")).is_transient());
        assert!(!Error::JobNotFound {
            job_id: Uuid::new_v4()
        }
        .is_transient());
    }
}
