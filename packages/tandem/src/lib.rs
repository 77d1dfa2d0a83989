//! Durable job-chain engine.
//!
//! Jobs are atomic units of work persisted in a transactional store.
//! A completing job may extend its *chain* with a continuation; a job may
//! be gated behind *blocker* chains that must complete first. Workers
//! lease jobs, renew the lease while processing, and reclaim leases that
//! other workers abandoned, so crashes and restarts never lose or
//! duplicate work: every state transition commits inside a store
//! transaction, and the `(chain_id, chain_index)` unique key makes
//! continuations idempotent.
//!
//! # Architecture
//!
//! ```text
//! Client ──► store ops (one transaction) ──► publish type topic
//!                                                │
//! Worker ◄── notify bus / scheduled poll ◄───────┘
//!     │
//!     ├─► acquire_job (lock-skip, oldest eligible)
//!     ├─► JobContext ─► processor ─► complete / continue_with
//!     │        └─ lease renewal sidecar, cancellation signal
//!     └─► reschedule on failure (exact or exponential)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
//! let bus: Arc<dyn NotifyBus> = Arc::new(BroadcastBus::new());
//!
//! let mut registry = JobTypeRegistry::new();
//! registry.register("greet", JobTypeOptions::entry(), |ctx| async move {
//!     let name = ctx.input()["name"].as_str().unwrap_or("world").to_string();
//!     ctx.complete(serde_json::json!({ "greeting": format!("hello {name}") }))
//!         .await?;
//!     Ok(())
//! })?;
//! let registry = Arc::new(registry);
//!
//! let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
//! let client = Client::new(store, bus, registry);
//!
//! let job = client
//!     .start_job_chain(StartJobChain::new("greet", serde_json::json!({"name": "ada"})))
//!     .await?;
//! let chain = client
//!     .wait_for_job_chain_completion(job.chain_id, WaitOptions::default())
//!     .await?;
//! assert_eq!(chain.output().unwrap()["greeting"], "hello ada");
//! worker.stop().await;
//! ```

mod bus;
mod client;
pub mod conformance;
mod error;
mod events;
mod job;
mod memory;
mod registry;
mod runtime;
mod store;
mod worker;

pub use bus::{BroadcastBus, BusSubscription, NotifyBus, NullBus, topics};
pub use client::{Client, NotifyQueue, StartJobChain, WaitOptions};
pub use error::{CancelReason, Error, JobFailure, Result};
pub use events::{EventSink, JobEvent, NullSink, TracingSink};
pub use job::{
    BlockerLink, DedupScope, Deduplication, Job, JobChain, JobStatus, LeaseConfig, RetryConfig,
    Schedule,
};
pub use memory::MemoryStore;
pub use registry::{BoxedProcessor, JobTypeOptions, JobTypeRegistry, Validator};
pub use runtime::{BlockerSpec, Continuation, JobContext, JobSignal, PrepareMode};
pub use store::{
    AcquireJobRequest, AcquireJobResult, AddJobBlockersResult, BlockerRef, ChainFilter,
    CreateJobRequest, CreateJobResult, Cursor, JobFilter, JobStore, Page, PageRequest,
    ScheduleBlockedJobsResult, StoreTransaction, in_transaction,
};
pub use worker::{Worker, WorkerConfig, WorkerHandle};
