//! End-to-end engine tests on the in-process store and bus: real workers,
//! real leases, real completion transactions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

use tandem::{
    BlockerSpec, BroadcastBus, Client, Continuation, Error, JobFailure, JobStatus, JobStore,
    JobTypeOptions, JobTypeRegistry, LeaseConfig, MemoryStore, NotifyBus, PrepareMode, Schedule,
    StartJobChain, WaitOptions, Worker, WorkerConfig, in_transaction,
};

fn infra() -> (Arc<dyn JobStore>, Arc<dyn NotifyBus>) {
    (
        Arc::new(MemoryStore::new()),
        Arc::new(BroadcastBus::new()),
    )
}

fn quick_wait() -> WaitOptions {
    WaitOptions::builder()
        .poll_interval_ms(20)
        .timeout_ms(5_000)
        .build()
}

async fn poll_until_status(
    client: &Client,
    job_id: Uuid,
    status: JobStatus,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if let Some(job) = client.get_job(job_id).await.unwrap() {
            if job.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// S1: linear chain of three
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn linear_chain_of_three_completes_in_order() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry
        .register(
            "linear",
            JobTypeOptions::entry().with_continue_targets(["linear_next"]),
            |ctx| async move {
                let value = ctx.input()["value"].as_i64().unwrap_or_default();
                ctx.continue_with(Continuation::new(
                    "linear_next",
                    json!({"valueNext": value + 1}),
                ))
                .await?;
                Ok(())
            },
        )
        .unwrap();
    registry
        .register("linear_next", JobTypeOptions::new(), |ctx| async move {
            let value = ctx.input()["valueNext"].as_i64().unwrap_or_default();
            ctx.continue_with(Continuation::new(
                "linear_next_next",
                json!({"valueNextNext": value + 1}),
            ))
            .await?;
            Ok(())
        })
        .unwrap();
    registry
        .register("linear_next_next", JobTypeOptions::new(), |ctx| async move {
            let value = ctx.input()["valueNextNext"].as_i64().unwrap_or_default();
            ctx.complete(json!({"result": value})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("linear", json!({"value": 1})))
        .await
        .unwrap();
    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();

    assert_eq!(chain.output(), Some(&json!({"result": 3})));
    let last = chain.last.clone().expect("chain grew past the root");
    assert_eq!(last.chain_index, 2);
    assert_eq!(last.chain_id, root.id);

    // Step two descends from step one.
    let step_two = client
        .list_jobs(
            tandem::JobFilter::builder().chain_id(Some(root.chain_id)).build(),
            tandem::PageRequest::first(10),
        )
        .await
        .unwrap()
        .items
        .into_iter()
        .find(|job| job.chain_index == 1)
        .expect("step two exists");
    assert_eq!(step_two.origin_id, Some(root.id));
    assert_eq!(step_two.chain_id, root.id);
    assert_eq!(last.origin_id, Some(step_two.id));

    worker.stop().await;
}

// ============================================================================
// S2: deferred start
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn deferred_chain_starts_only_after_its_delay() {
    let (store, bus) = infra();
    let runs = Arc::new(AtomicU32::new(0));
    let runs_in_handler = runs.clone();

    let mut registry = JobTypeRegistry::new();
    registry
        .register("deferred", JobTypeOptions::entry(), move |ctx| {
            let runs = runs_in_handler.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.attempt(), 1);
                ctx.complete(json!({"done": true})).await?;
                Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(
            StartJobChain::builder()
                .type_name("deferred")
                .input(json!({"value": 1}))
                .schedule(Schedule::after_ms(300))
                .build(),
        )
        .await
        .unwrap();

    let early = client
        .wait_for_job_chain_completion(
            root.chain_id,
            WaitOptions::builder()
                .poll_interval_ms(20)
                .timeout_ms(200)
                .build(),
        )
        .await;
    assert!(matches!(early, Err(Error::WaitTimeout { .. })));

    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();
    assert!(chain.is_completed());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(chain.current().attempt, 1);

    worker.stop().await;
}

// ============================================================================
// S3: retry with an exact reschedule
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn requested_reschedule_retries_at_the_exact_schedule() {
    let (store, bus) = infra();
    let observed_error = Arc::new(Mutex::new(None::<String>));
    let observed_in_handler = observed_error.clone();

    let mut registry = JobTypeRegistry::new();
    registry
        .register("flaky", JobTypeOptions::entry(), move |ctx| {
            let observed = observed_in_handler.clone();
            async move {
                if ctx.attempt() == 1 {
                    return Err(ctx.reschedule(Schedule::after_ms(300), "again"));
                }
                *observed.lock().await = ctx.last_attempt_error().map(str::to_string);
                ctx.complete(json!({"done": true})).await?;
                Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("flaky", json!({})))
        .await
        .unwrap();
    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();

    assert_eq!(chain.current().attempt, 2);
    assert_eq!(observed_error.lock().await.as_deref(), Some("again"));

    worker.stop().await;
}

// ============================================================================
// S4: blockers
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn blocked_job_waits_for_its_blocker_chain() {
    let (store, bus) = infra();
    let seen_blocker_output = Arc::new(Mutex::new(None::<Value>));
    let seen_in_handler = seen_blocker_output.clone();

    let mut registry = JobTypeRegistry::new();
    registry
        .register("auth", JobTypeOptions::entry(), |ctx| async move {
            let token = ctx.input()["token"].as_str().unwrap_or_default().to_string();
            ctx.complete(json!({"userId": format!("user-{token}")})).await?;
            Ok(())
        })
        .unwrap();
    registry
        .register("main", JobTypeOptions::entry(), move |ctx| {
            let seen = seen_in_handler.clone();
            async move {
                let output = ctx
                    .blocker(0)
                    .and_then(|chain| chain.output().cloned());
                *seen.lock().await = output;
                ctx.complete(json!({"success": true})).await?;
                Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);
    let client = Client::new(store.clone(), bus.clone(), registry.clone());

    // No worker yet: observe the gating state at rest.
    let main = client
        .start_job_chain(
            StartJobChain::builder()
                .type_name("main")
                .input(json!({}))
                .start_blockers(vec![BlockerSpec::Start(StartJobChain::new(
                    "auth",
                    json!({"token": "t"}),
                ))])
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(main.status, JobStatus::Blocked);

    let blockers = client.get_job_blockers(main.id).await.unwrap();
    assert_eq!(blockers.len(), 1);
    let auth_chain_id = blockers[0].chain_id();
    assert!(!blockers[0].is_completed());
    // The blocker chain was adopted into main's workflow.
    assert_eq!(blockers[0].root.root_chain_id, main.root_chain_id);
    assert_eq!(blockers[0].root.origin_id, Some(main.id));

    let worker = Worker::new(store.clone(), bus, registry).start();
    let chain = client
        .wait_for_job_chain_completion(main.chain_id, quick_wait())
        .await
        .unwrap();
    assert_eq!(chain.output(), Some(&json!({"success": true})));
    assert_eq!(
        seen_blocker_output.lock().await.as_ref(),
        Some(&json!({"userId": "user-t"}))
    );
    let auth_chain = client.get_job_chain(auth_chain_id).await.unwrap();
    assert!(auth_chain.is_completed());

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_blocker_chain_alone_is_refused() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry.declare("auth", JobTypeOptions::entry()).unwrap();
    registry.declare("main", JobTypeOptions::entry()).unwrap();
    let registry = Arc::new(registry);
    let client = Client::new(store, bus, registry);

    let main = client
        .start_job_chain(
            StartJobChain::builder()
                .type_name("main")
                .input(json!({}))
                .start_blockers(vec![BlockerSpec::Start(StartJobChain::new(
                    "auth",
                    json!({"token": "t"}),
                ))])
                .build(),
        )
        .await
        .unwrap();
    let auth_chain_id = client.get_job_blockers(main.id).await.unwrap()[0].chain_id();

    let narrow = client.delete_job_chains(vec![auth_chain_id]).await;
    assert!(matches!(narrow, Err(Error::BlockerReference { .. })));

    let deleted = client
        .delete_job_chains(vec![auth_chain_id, main.chain_id])
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert!(matches!(
        client.get_job_chain(main.chain_id).await,
        Err(Error::ChainNotFound { .. })
    ));
}

// ============================================================================
// S5: distributed chain across workers with disjoint type sets
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn two_workers_with_disjoint_types_cooperate_on_one_chain() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry
        .register("stage_one", JobTypeOptions::entry(), |ctx| async move {
            let value = ctx.input()["value"].as_i64().unwrap_or_default();
            ctx.continue_with(Continuation::new("stage_two", json!({"value": value + 1})))
                .await?;
            Ok(())
        })
        .unwrap();
    registry
        .register("stage_two", JobTypeOptions::new(), |ctx| async move {
            let value = ctx.input()["value"].as_i64().unwrap_or_default();
            ctx.complete(json!({"result": value + 1})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    let mut config_a = WorkerConfig::with_worker_id("worker-a");
    config_a.type_names = Some(vec!["stage_one".to_string()]);
    let mut config_b = WorkerConfig::with_worker_id("worker-b");
    config_b.type_names = Some(vec!["stage_two".to_string()]);

    let worker_a =
        Worker::with_config(store.clone(), bus.clone(), registry.clone(), config_a).start();
    let worker_b =
        Worker::with_config(store.clone(), bus.clone(), registry.clone(), config_b).start();
    let client = Client::new(store, bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("stage_one", json!({"value": 1})))
        .await
        .unwrap();
    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();

    assert_eq!(chain.output(), Some(&json!({"result": 3})));
    assert_eq!(chain.root.completed_by.as_deref(), Some("worker-a"));
    assert_eq!(
        chain.last.as_ref().unwrap().completed_by.as_deref(),
        Some("worker-b")
    );

    worker_a.stop().await;
    worker_b.stop().await;
}

// ============================================================================
// S6: abandoned lease recovery
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn lost_lease_cancels_the_processor_and_the_chain_completes_once() {
    let (store, bus) = infra();
    let cancellations = Arc::new(AtomicU32::new(0));
    let completions = Arc::new(AtomicU32::new(0));
    let cancellations_in_handler = cancellations.clone();
    let completions_in_handler = completions.clone();

    let mut registry = JobTypeRegistry::new().with_default_lease(LeaseConfig {
        lease_ms: 400,
        renew_interval_ms: 50,
    })
    .unwrap();
    registry
        .register("recover", JobTypeOptions::entry(), move |ctx| {
            let cancellations = cancellations_in_handler.clone();
            let completions = completions_in_handler.clone();
            async move {
                if ctx.attempt() == 1 {
                    // Hang well past the lease; the signal must fire first.
                    match ctx.sleep(10_000).await {
                        Err(failure) => {
                            cancellations.fetch_add(1, Ordering::SeqCst);
                            return Err(failure);
                        }
                        Ok(()) => unreachable!("first attempt should be cancelled"),
                    }
                }
                completions.fetch_add(1, Ordering::SeqCst);
                ctx.complete(json!({"done": true})).await?;
                Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker_a = Worker::with_config(
        store.clone(),
        bus.clone(),
        registry.clone(),
        WorkerConfig::with_worker_id("worker-a"),
    )
    .start();
    let worker_b = Worker::with_config(
        store.clone(),
        bus.clone(),
        registry.clone(),
        WorkerConfig::with_worker_id("worker-b"),
    )
    .start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("recover", json!({})))
        .await
        .unwrap();
    assert!(poll_until_status(&client, root.id, JobStatus::Running, Duration::from_secs(2)).await);

    // Strip the lease out from under the first holder, as a reaper on a
    // crashed worker would.
    let job_id = root.id;
    in_transaction(store.as_ref(), move |tx| {
        Box::pin(async move {
            tx.reschedule_job(job_id, Schedule::Immediate, "lease expired")
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();
    assert_eq!(chain.output(), Some(&json!({"done": true})));
    assert_eq!(chain.current().attempt, 2);

    // Give the first processor time to observe the cancellation.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while cancellations.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(cancellations.load(Ordering::SeqCst), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    worker_a.stop().await;
    worker_b.stop().await;
}

// ============================================================================
// Deduplication through the client
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn incomplete_dedup_key_resolves_to_the_live_chain() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry
        .register("import", JobTypeOptions::entry(), |ctx| async move {
            ctx.complete(json!({"imported": true})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);
    let client = Client::new(store.clone(), bus.clone(), registry.clone());

    let request = || {
        StartJobChain::builder()
            .type_name("import")
            .input(json!({}))
            .deduplication(Some(tandem::Deduplication::incomplete("tenant-7")))
            .build()
    };

    let first = client.start_job_chain(request()).await.unwrap();
    let duplicate = client.start_job_chain(request()).await.unwrap();
    assert_eq!(first.id, duplicate.id);

    let worker = Worker::new(store, bus, registry).start();
    client
        .wait_for_job_chain_completion(first.chain_id, quick_wait())
        .await
        .unwrap();

    let fresh = client.start_job_chain(request()).await.unwrap();
    assert_ne!(fresh.id, first.id);

    worker.stop().await;
}

// ============================================================================
// Prepare modes
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn atomic_prepare_rolls_back_with_the_failed_attempt() {
    prepare_mode_case(PrepareMode::Atomic, 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn staged_prepare_commits_independently_of_the_attempt() {
    prepare_mode_case(PrepareMode::Staged, 1).await;
}

/// On attempt one the processor prepares a side chain and then fails. In
/// atomic mode the side chain must vanish with the attempt; in staged
/// mode it survives.
async fn prepare_mode_case(mode: PrepareMode, expected_side_chains: usize) {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry.declare("side_effect", JobTypeOptions::entry()).unwrap();
    registry
        .register("preparer", JobTypeOptions::entry(), move |ctx| async move {
            if ctx.attempt() == 1 {
                ctx.prepare(mode, |tx| {
                    Box::pin(async move {
                        tx.create_job(
                            tandem::CreateJobRequest::builder()
                                .type_name("side_effect")
                                .chain_type_name("side_effect")
                                .input(json!({}))
                                .build(),
                        )
                        .await?;
                        Ok(())
                    })
                })
                .await?;
                return Err(ctx.reschedule(Schedule::after_ms(50), "first attempt fails"));
            }
            ctx.complete(json!({"done": true})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("preparer", json!({})))
        .await
        .unwrap();
    client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();

    let side_chains = client
        .list_jobs(
            tandem::JobFilter::builder()
                .type_names(Some(vec!["side_effect".to_string()]))
                .build(),
            tandem::PageRequest::first(10),
        )
        .await
        .unwrap();
    assert_eq!(side_chains.items.len(), expected_side_chains);

    worker.stop().await;
}

// ============================================================================
// Processing protocol
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn repeated_completion_calls_are_protocol_violations() {
    let (store, bus) = infra();
    let second_complete = Arc::new(Mutex::new(None::<String>));
    let second_in_handler = second_complete.clone();

    let mut registry = JobTypeRegistry::new();
    registry
        .register("once", JobTypeOptions::entry(), move |ctx| {
            let second = second_in_handler.clone();
            async move {
                ctx.complete(json!({"n": 1})).await?;
                let violation = ctx.complete(json!({"n": 2})).await.unwrap_err();
                *second.lock().await = Some(violation.to_string());
                let continuation_violation = ctx
                    .continue_with(Continuation::new("once", json!({})))
                    .await
                    .unwrap_err();
                assert!(matches!(
                    continuation_violation,
                    JobFailure::Unexpected(_)
                ));
                Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("once", json!({})))
        .await
        .unwrap();
    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();

    // The first completion stands.
    assert_eq!(chain.output(), Some(&json!({"n": 1})));
    let recorded = second_complete.lock().await.clone().unwrap();
    assert!(recorded.contains("protocol"), "got: {recorded}");

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_failures_back_off_exponentially() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new().with_default_retry(tandem::RetryConfig {
        initial_delay_ms: 30,
        multiplier: 2.0,
        max_delay_ms: 200,
    });
    registry
        .register("brittle", JobTypeOptions::entry(), |ctx| async move {
            if ctx.attempt() < 3 {
                return Err(JobFailure::unexpected(anyhow::anyhow!("boom")));
            }
            assert_eq!(ctx.last_attempt_error(), Some("boom"));
            ctx.complete(json!({"recovered": true})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(store.clone(), bus.clone(), registry.clone()).start();
    let client = Client::new(store.clone(), bus, registry);

    let root = client
        .start_job_chain(StartJobChain::new("brittle", json!({})))
        .await
        .unwrap();
    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();
    assert_eq!(chain.output(), Some(&json!({"recovered": true})));
    assert_eq!(chain.current().attempt, 3);

    worker.stop().await;
}

// ============================================================================
// Worker behavior
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn notification_wakes_an_idle_worker_long_before_its_poll() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry
        .register("ping", JobTypeOptions::entry(), |ctx| async move {
            ctx.complete(json!({"pong": true})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    let mut config = WorkerConfig::with_worker_id("sleepy");
    config.poll_interval = Duration::from_secs(60);
    let worker = Worker::with_config(store.clone(), bus.clone(), registry.clone(), config).start();
    // Let the worker subscribe and go idle.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let client = Client::new(store, bus, registry);
    let root = client
        .start_job_chain(StartJobChain::new("ping", json!({})))
        .await
        .unwrap();
    let chain = client
        .wait_for_job_chain_completion(
            root.chain_id,
            WaitOptions::builder()
                .poll_interval_ms(20)
                .timeout_ms(3_000)
                .build(),
        )
        .await
        .unwrap();
    assert!(chain.is_completed());

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_slots_overlap_independent_jobs() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry
        .register("slow", JobTypeOptions::entry(), |ctx| async move {
            ctx.sleep(400).await?;
            ctx.complete(json!({})).await?;
            Ok(())
        })
        .unwrap();
    let registry = Arc::new(registry);

    let mut config = WorkerConfig::with_worker_id("wide");
    config.concurrency = 2;
    let worker = Worker::with_config(store.clone(), bus.clone(), registry.clone(), config).start();
    let client = Client::new(store, bus, registry);

    let started = tokio::time::Instant::now();
    let first = client
        .start_job_chain(StartJobChain::new("slow", json!({})))
        .await
        .unwrap();
    let second = client
        .start_job_chain(StartJobChain::new("slow", json!({})))
        .await
        .unwrap();
    client
        .wait_for_job_chain_completion(first.chain_id, quick_wait())
        .await
        .unwrap();
    client
        .wait_for_job_chain_completion(second.chain_id, quick_wait())
        .await
        .unwrap();

    // Serial execution would take at least 800ms.
    assert!(
        started.elapsed() < Duration::from_millis(750),
        "took {:?}",
        started.elapsed()
    );

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stopping_a_worker_cancels_and_requeues_in_flight_work() {
    let (store, bus) = infra();
    let cancelled = Arc::new(AtomicU32::new(0));
    let cancelled_in_handler = cancelled.clone();

    let mut registry = JobTypeRegistry::new();
    registry
        .register("drainable", JobTypeOptions::entry(), move |ctx| {
            let cancelled = cancelled_in_handler.clone();
            async move {
                if ctx.attempt() == 1 {
                    if let Err(failure) = ctx.sleep(30_000).await {
                        cancelled.fetch_add(1, Ordering::SeqCst);
                        return Err(failure);
                    }
                }
                ctx.complete(json!({"finished": true})).await?;
                Ok(())
            }
        })
        .unwrap();
    let registry = Arc::new(registry);

    let mut config = WorkerConfig::with_worker_id("stopping");
    config.drain_timeout = Duration::from_millis(100);
    let worker = Worker::with_config(store.clone(), bus.clone(), registry.clone(), config).start();
    let client = Client::new(store.clone(), bus.clone(), registry.clone());

    let root = client
        .start_job_chain(StartJobChain::new("drainable", json!({})))
        .await
        .unwrap();
    assert!(poll_until_status(&client, root.id, JobStatus::Running, Duration::from_secs(2)).await);

    worker.stop().await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    // The job went back to pending with the cancellation recorded; a new
    // worker picks it up and finishes the chain.
    let requeued = client.get_job(root.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(
        requeued.last_attempt_error.as_deref(),
        Some("cancelled: worker_stopping")
    );

    let second = Worker::new(store, bus, registry).start();
    let chain = client
        .wait_for_job_chain_completion(root.chain_id, quick_wait())
        .await
        .unwrap();
    assert_eq!(chain.output(), Some(&json!({"finished": true})));
    second.stop().await;
}

// ============================================================================
// with_notify
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn with_notify_publishes_only_after_commit() {
    let (store, bus) = infra();
    let mut registry = JobTypeRegistry::new();
    registry.declare("quiet", JobTypeOptions::entry()).unwrap();
    let registry = Arc::new(registry);
    let client = Client::new(store.clone(), bus.clone(), registry);

    let mut subscription = bus.subscribe(&[tandem::topics::job_type("quiet")]);

    let job = client
        .with_notify(|tx, queue| {
            Box::pin(async move {
                queue.publish(tandem::topics::job_type("quiet"));
                let created = tx
                    .create_job(
                        tandem::CreateJobRequest::builder()
                            .type_name("quiet")
                            .chain_type_name("quiet")
                            .input(json!({}))
                            .build(),
                    )
                    .await?;
                Ok(created.job)
            })
        })
        .await
        .unwrap();

    assert_eq!(
        subscription.recv().await.as_deref(),
        Some("type:quiet")
    );
    assert!(client.get_job(job.id).await.unwrap().is_some());

    // A failing closure publishes nothing and commits nothing.
    let failed: Result<(), _> = client
        .with_notify(|tx, queue| {
            Box::pin(async move {
                queue.publish(tandem::topics::job_type("quiet"));
                tx.create_job(
                    tandem::CreateJobRequest::builder()
                        .type_name("quiet")
                        .chain_type_name("quiet")
                        .input(json!({}))
                        .build(),
                )
                .await?;
                Err(Error::InvalidRequest {
                    message: "abort".to_string(),
                })
            })
        })
        .await;
    assert!(failed.is_err());

    let all_quiet = client
        .list_jobs(
            tandem::JobFilter::builder()
                .type_names(Some(vec!["quiet".to_string()]))
                .build(),
            tandem::PageRequest::first(10),
        )
        .await
        .unwrap();
    assert_eq!(all_quiet.items.len(), 1);
}
