//! Job lifecycle events.
//!
//! These events are facts about the lifecycle, not commands. The
//! serialized form (the `type` tag plus snake_case fields) is a stable
//! wire contract; observability adapters dispatch on the tag string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fact about the job/chain lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new chain root was committed.
    ChainStarted {
        chain_id: Uuid,
        type_name: String,
        deduplicated: bool,
    },

    /// A worker leased a job.
    JobAcquired {
        job_id: Uuid,
        type_name: String,
        worker_id: String,
        attempt: i32,
    },

    /// A job completed with a final output.
    JobCompleted {
        job_id: Uuid,
        type_name: String,
        worker_id: String,
        chain_completed: bool,
    },

    /// A job completed by extending its chain.
    JobContinued {
        job_id: Uuid,
        type_name: String,
        next_job_id: Uuid,
        next_type_name: String,
    },

    /// A job went back to pending for a later attempt.
    JobRescheduled {
        job_id: Uuid,
        type_name: String,
        attempt: i32,
        error: String,
        requested: bool,
    },

    /// A blocked job's last blocker chain completed.
    JobUnblocked { job_id: Uuid, type_name: String },

    /// An abandoned lease was reclaimed.
    LeaseRecovered {
        job_id: Uuid,
        type_name: String,
        old_worker_id: Option<String>,
        new_worker_id: String,
    },

    /// A chain reached terminal completion.
    ChainCompleted {
        chain_id: Uuid,
        chain_type_name: String,
    },

    /// Chains were deleted.
    ChainsDeleted { chain_ids: Vec<Uuid>, jobs: u64 },

    WorkerStarted { worker_id: String },

    WorkerStopped { worker_id: String },
}

/// Consumer of lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &JobEvent);
}

/// Default sink: structured `tracing` records, one per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &JobEvent) {
        match event {
            JobEvent::ChainStarted {
                chain_id,
                type_name,
                deduplicated,
            } => tracing::info!(chain_id = %chain_id, type_name = %type_name, deduplicated, "chain started"),
            JobEvent::JobAcquired {
                job_id,
                type_name,
                worker_id,
                attempt,
            } => tracing::debug!(job_id = %job_id, type_name = %type_name, worker_id = %worker_id, attempt, "job acquired"),
            JobEvent::JobCompleted {
                job_id,
                type_name,
                worker_id,
                chain_completed,
            } => tracing::info!(job_id = %job_id, type_name = %type_name, worker_id = %worker_id, chain_completed, "job completed"),
            JobEvent::JobContinued {
                job_id,
                type_name,
                next_job_id,
                next_type_name,
            } => tracing::info!(job_id = %job_id, type_name = %type_name, next_job_id = %next_job_id, next_type_name = %next_type_name, "job continued"),
            JobEvent::JobRescheduled {
                job_id,
                type_name,
                attempt,
                error,
                requested,
            } => tracing::warn!(job_id = %job_id, type_name = %type_name, attempt, error = %error, requested, "job rescheduled"),
            JobEvent::JobUnblocked { job_id, type_name } => {
                tracing::debug!(job_id = %job_id, type_name = %type_name, "job unblocked")
            }
            JobEvent::LeaseRecovered {
                job_id,
                type_name,
                old_worker_id,
                new_worker_id,
            } => tracing::warn!(job_id = %job_id, type_name = %type_name, old_worker_id = ?old_worker_id, new_worker_id = %new_worker_id, "lease recovered"),
            JobEvent::ChainCompleted {
                chain_id,
                chain_type_name,
            } => tracing::info!(chain_id = %chain_id, chain_type_name = %chain_type_name, "chain completed"),
            JobEvent::ChainsDeleted { chain_ids, jobs } => {
                tracing::info!(chains = chain_ids.len(), jobs, "chains deleted")
            }
            JobEvent::WorkerStarted { worker_id } => {
                tracing::info!(worker_id = %worker_id, "worker started")
            }
            JobEvent::WorkerStopped { worker_id } => {
                tracing::info!(worker_id = %worker_id, "worker stopped")
            }
        }
    }
}

/// Sink that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &JobEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_is_snake_case_type_field() {
        let event = JobEvent::ChainStarted {
            chain_id: Uuid::nil(),
            type_name: "greet".to_string(),
            deduplicated: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chain_started");
        assert_eq!(json["type_name"], "greet");
    }

    #[test]
    fn events_round_trip_through_json() {
        let events = vec![
            JobEvent::JobAcquired {
                job_id: Uuid::new_v4(),
                type_name: "t".to_string(),
                worker_id: "w-1".to_string(),
                attempt: 1,
            },
            JobEvent::JobRescheduled {
                job_id: Uuid::new_v4(),
                type_name: "t".to_string(),
                attempt: 2,
                error: "again".to_string(),
                requested: true,
            },
            JobEvent::LeaseRecovered {
                job_id: Uuid::new_v4(),
                type_name: "t".to_string(),
                old_worker_id: Some("w-1".to_string()),
                new_worker_id: "w-2".to_string(),
            },
            JobEvent::ChainsDeleted {
                chain_ids: vec![Uuid::new_v4()],
                jobs: 3,
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _: JobEvent = serde_json::from_str(&json).unwrap();
        }
    }

    #[test]
    fn rescheduled_event_carries_requested_flag() {
        let event = JobEvent::JobRescheduled {
            job_id: Uuid::new_v4(),
            type_name: "t".to_string(),
            attempt: 1,
            error: "boom".to_string(),
            requested: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["requested"], false);
    }
}
