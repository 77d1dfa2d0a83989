//! Store driver conformance suite.
//!
//! Every [`JobStore`] implementation must pass these checks; the
//! in-process reference store runs them in this crate's tests and the
//! postgres driver runs them against a live database. Each check creates
//! jobs under freshly generated type names, so the suite can run against
//! a shared, non-empty database.
//!
//! ```ignore
//! #[tokio::test]
//! async fn my_driver_conforms() {
//!     let store = MyStore::connect(...).await;
//!     tandem::conformance::run_all(&store).await;
//! }
//! ```

use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::Error;
use crate::job::{Deduplication, Job, JobStatus, Schedule};
use crate::store::{
    AcquireJobRequest, BlockerRef, CreateJobRequest, JobStore, in_transaction,
};

/// Run the whole suite.
pub async fn run_all(store: &dyn JobStore) {
    check_chain_index_contiguity(store).await;
    check_completion_invariants(store).await;
    check_blocker_gating(store).await;
    check_sequential_acquire_distinct(store).await;
    check_fifo_acquire_order(store).await;
    check_dedup_incomplete_releases_on_completion(store).await;
    check_dedup_any_is_permanent(store).await;
    check_continuation_idempotency(store).await;
    check_adoption_rewrite(store).await;
    check_shared_blocker_is_not_readopted(store).await;
    check_delete_safety(store).await;
    check_schedule_gating(store).await;
    check_lease_expiry_reap(store).await;
    check_renew_guards_ownership(store).await;
}

fn unique_type(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn create_root(store: &dyn JobStore, type_name: &str, input: Value) -> Job {
    create_root_with(store, type_name, input, Schedule::Immediate, None).await
}

async fn create_root_with(
    store: &dyn JobStore,
    type_name: &str,
    input: Value,
    schedule: Schedule,
    deduplication: Option<Deduplication>,
) -> Job {
    let type_name = type_name.to_string();
    in_transaction(store, move |tx| {
        Box::pin(async move {
            let created = tx
                .create_job(
                    CreateJobRequest::builder()
                        .type_name(type_name.clone())
                        .chain_type_name(type_name)
                        .input(input)
                        .schedule(schedule)
                        .deduplication(deduplication)
                        .build(),
                )
                .await?;
            Ok(created.job)
        })
    })
    .await
    .expect("create_root")
}

async fn acquire_one(store: &dyn JobStore, type_name: &str, worker_id: &str) -> Option<Job> {
    let type_names = vec![type_name.to_string()];
    let worker_id = worker_id.to_string();
    in_transaction(store, move |tx| {
        Box::pin(async move {
            let acquired = tx
                .acquire_job(
                    AcquireJobRequest::builder()
                        .type_names(type_names)
                        .worker_id(worker_id)
                        .lease_ms(30_000u64)
                        .build(),
                )
                .await?;
            Ok(acquired.job)
        })
    })
    .await
    .expect("acquire_job")
}

async fn complete(store: &dyn JobStore, job_id: Uuid, output: Value, worker_id: &str) -> Job {
    let worker_id = worker_id.to_string();
    in_transaction(store, move |tx| {
        Box::pin(async move { tx.complete_job(job_id, output, Some(&worker_id)).await })
    })
    .await
    .expect("complete_job")
}

/// Acquire and immediately complete the current pending job of a type.
async fn drive_to_completion(store: &dyn JobStore, type_name: &str, output: Value) -> Job {
    let job = acquire_one(store, type_name, "conformance-worker")
        .await
        .expect("a pending job to drive");
    complete(store, job.id, output, "conformance-worker").await
}

async fn append_continuation(store: &dyn JobStore, predecessor: &Job, type_name: &str) -> Job {
    let req = CreateJobRequest::builder()
        .type_name(type_name)
        .chain_id(Some(predecessor.chain_id))
        .chain_index(predecessor.chain_index + 1)
        .chain_type_name(predecessor.chain_type_name.clone())
        .input(json!({}))
        .root_chain_id(Some(predecessor.root_chain_id))
        .origin_id(Some(predecessor.id))
        .build();
    in_transaction(store, move |tx| {
        Box::pin(async move { Ok(tx.create_job(req).await?.job) })
    })
    .await
    .expect("append_continuation")
}

// ============================================================================
// Checks
// ============================================================================

/// Chain indexes form `{0, 1, ..., n-1}` with the root at 0.
pub async fn check_chain_index_contiguity(store: &dyn JobStore) {
    let type_name = unique_type("contiguity");
    let root = create_root(store, &type_name, json!({})).await;
    assert_eq!(root.chain_index, 0);
    assert_eq!(root.id, root.chain_id);

    let second = append_continuation(store, &root, &type_name).await;
    let third = append_continuation(store, &second, &type_name).await;

    let chain_id = root.chain_id;
    let mut indexes: Vec<i32> = in_transaction(store, move |tx| {
        Box::pin(async move {
            let page = tx
                .list_jobs(
                    crate::store::JobFilter::builder()
                        .chain_id(Some(chain_id))
                        .build(),
                    crate::store::PageRequest::first(10),
                )
                .await?;
            Ok(page.items.into_iter().map(|job| job.chain_index).collect())
        })
    })
    .await
    .expect("list chain jobs");
    indexes.sort();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(third.chain_index, 2);
}

/// Completion writes the output, stamps the completer, clears the lease.
pub async fn check_completion_invariants(store: &dyn JobStore) {
    let type_name = unique_type("completion");
    let root = create_root(store, &type_name, json!({"value": 1})).await;
    let acquired = acquire_one(store, &type_name, "w-1").await.expect("acquire");
    assert_eq!(acquired.id, root.id);
    assert_eq!(acquired.status, JobStatus::Running);
    assert_eq!(acquired.attempt, 1);

    let completed = complete(store, acquired.id, json!({"ok": true}), "w-1").await;
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.output, Some(json!({"ok": true})));
    assert_eq!(completed.completed_by.as_deref(), Some("w-1"));
    assert!(completed.leased_by.is_none());
    assert!(completed.leased_until.is_none());
    assert!(completed.completed_at.is_some());
}

/// A job with an incomplete blocker chain is blocked and stays blocked
/// until every blocker chain completes.
pub async fn check_blocker_gating(store: &dyn JobStore) {
    let blocker_type = unique_type("blocker");
    let main_type = unique_type("gated");
    let blocker_a = create_root(store, &blocker_type, json!({})).await;
    let blocker_b = create_root(store, &blocker_type, json!({})).await;
    let main = create_root(store, &main_type, json!({})).await;

    let main_id = main.id;
    let refs = vec![BlockerRef::new(blocker_a.chain_id), BlockerRef::new(blocker_b.chain_id)];
    let attached = in_transaction(store, move |tx| {
        Box::pin(async move { tx.add_job_blockers(main_id, refs).await })
    })
    .await
    .expect("add blockers");
    assert_eq!(attached.job.status, JobStatus::Blocked);
    assert_eq!(attached.incomplete_blocker_chain_ids.len(), 2);

    // First blocker completes; the job must stay blocked.
    drive_to_completion(store, &blocker_type, json!({})).await;
    let first_chain = blocker_a.chain_id;
    let result = in_transaction(store, move |tx| {
        Box::pin(async move { tx.schedule_blocked_jobs(first_chain).await })
    })
    .await
    .expect("schedule after first blocker");
    assert!(result.unblocked_jobs.is_empty());

    // Second completes; now it unblocks.
    drive_to_completion(store, &blocker_type, json!({})).await;
    let second_chain = blocker_b.chain_id;
    let result = in_transaction(store, move |tx| {
        Box::pin(async move { tx.schedule_blocked_jobs(second_chain).await })
    })
    .await
    .expect("schedule after second blocker");
    assert_eq!(result.unblocked_jobs.len(), 1);
    assert_eq!(result.unblocked_jobs[0].id, main_id);
    assert_eq!(result.unblocked_jobs[0].status, JobStatus::Pending);
}

/// Two acquires never hand out the same job.
pub async fn check_sequential_acquire_distinct(store: &dyn JobStore) {
    let type_name = unique_type("distinct");
    create_root(store, &type_name, json!({})).await;
    create_root(store, &type_name, json!({})).await;

    let first = acquire_one(store, &type_name, "w-1").await.expect("first");
    let second = acquire_one(store, &type_name, "w-2").await.expect("second");
    assert_ne!(first.id, second.id);
    let third = acquire_one(store, &type_name, "w-3").await;
    assert!(third.is_none());
}

/// Ready jobs come out oldest-first.
pub async fn check_fifo_acquire_order(store: &dyn JobStore) {
    let type_name = unique_type("fifo");
    let mut created = Vec::new();
    for _ in 0..3 {
        created.push(create_root(store, &type_name, json!({})).await.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for expected in created {
        let got = acquire_one(store, &type_name, "w-1").await.expect("acquire");
        assert_eq!(got.id, expected);
    }
}

/// `incomplete` dedup: same key resolves to the live owner, and a new
/// job becomes possible once the owner completes.
pub async fn check_dedup_incomplete_releases_on_completion(store: &dyn JobStore) {
    let type_name = unique_type("dedup-incomplete");
    let dedup = Some(Deduplication::incomplete("k"));
    let first = create_root_with(store, &type_name, json!({}), Schedule::Immediate, dedup.clone())
        .await;
    let duplicate =
        create_root_with(store, &type_name, json!({}), Schedule::Immediate, dedup.clone()).await;
    assert_eq!(first.id, duplicate.id);

    drive_to_completion(store, &type_name, json!({})).await;
    let fresh = create_root_with(store, &type_name, json!({}), Schedule::Immediate, dedup).await;
    assert_ne!(fresh.id, first.id);
}

/// `any` dedup: the key never frees up.
pub async fn check_dedup_any_is_permanent(store: &dyn JobStore) {
    let type_name = unique_type("dedup-any");
    let dedup = Some(Deduplication::any("k"));
    let first =
        create_root_with(store, &type_name, json!({}), Schedule::Immediate, dedup.clone()).await;
    drive_to_completion(store, &type_name, json!({})).await;
    let duplicate = create_root_with(store, &type_name, json!({}), Schedule::Immediate, dedup).await;
    assert_eq!(first.id, duplicate.id);
}

/// Inserting the same `(chain_id, chain_index)` twice yields one row.
pub async fn check_continuation_idempotency(store: &dyn JobStore) {
    let type_name = unique_type("idempotent");
    let root = create_root(store, &type_name, json!({})).await;
    let first = append_continuation(store, &root, &type_name).await;
    let second = append_continuation(store, &root, &type_name).await;
    assert_eq!(first.id, second.id);
    assert_eq!(first.chain_index, 1);
}

/// Attaching a still-independent chain rewrites its jobs to the main
/// job's root and records the adopter as the root's origin.
pub async fn check_adoption_rewrite(store: &dyn JobStore) {
    let blocker_type = unique_type("adoptee");
    let main_type = unique_type("adopter");
    let blocker_root = create_root(store, &blocker_type, json!({})).await;
    let blocker_tail = append_continuation(store, &blocker_root, &blocker_type).await;
    let main = create_root(store, &main_type, json!({})).await;

    let main_id = main.id;
    let refs = vec![BlockerRef::new(blocker_root.chain_id)];
    in_transaction(store, move |tx| {
        Box::pin(async move { tx.add_job_blockers(main_id, refs).await })
    })
    .await
    .expect("attach blocker");

    let root_after = get_job(store, blocker_root.id).await;
    let tail_after = get_job(store, blocker_tail.id).await;
    assert_eq!(root_after.root_chain_id, main.root_chain_id);
    assert_eq!(tail_after.root_chain_id, main.root_chain_id);
    assert_eq!(root_after.origin_id, Some(main.id));
}

/// A chain already adopted by one workflow keeps its root when another
/// workflow attaches it: it has become a shared, external blocker.
pub async fn check_shared_blocker_is_not_readopted(store: &dyn JobStore) {
    let blocker_type = unique_type("shared");
    let main_type = unique_type("owner");
    let blocker = create_root(store, &blocker_type, json!({})).await;
    let first_owner = create_root(store, &main_type, json!({})).await;
    let second_owner = create_root(store, &main_type, json!({})).await;

    for owner in [first_owner.id, second_owner.id] {
        let refs = vec![BlockerRef::new(blocker.chain_id)];
        in_transaction(store, move |tx| {
            Box::pin(async move { tx.add_job_blockers(owner, refs).await })
        })
        .await
        .expect("attach");
    }

    let blocker_after = get_job(store, blocker.id).await;
    assert_eq!(blocker_after.root_chain_id, first_owner.root_chain_id);
    assert_eq!(blocker_after.origin_id, Some(first_owner.id));

    // The second owner now sees the chain as an external blocker.
    let roots = vec![second_owner.root_chain_id];
    let externals = in_transaction(store, move |tx| {
        Box::pin(async move { tx.get_external_blockers(&roots).await })
    })
    .await
    .expect("external blockers");
    assert_eq!(externals.len(), 1);
    assert_eq!(externals[0].blocker_chain_id, blocker.chain_id);
}

/// Deletion refuses to orphan blocker links from outside the set, and
/// succeeds once the set covers the dependents.
pub async fn check_delete_safety(store: &dyn JobStore) {
    let blocker_type = unique_type("del-blocker");
    let main_type = unique_type("del-main");
    let blocker = create_root(store, &blocker_type, json!({})).await;
    let main = create_root(store, &main_type, json!({})).await;

    let main_id = main.id;
    let refs = vec![BlockerRef::new(blocker.chain_id)];
    in_transaction(store, move |tx| {
        Box::pin(async move { tx.add_job_blockers(main_id, refs).await })
    })
    .await
    .expect("attach");

    let narrow = vec![blocker.chain_id];
    let narrow_result = in_transaction(store, move |tx| {
        Box::pin(async move { tx.delete_jobs_by_chain_ids(&narrow).await })
    })
    .await;
    assert!(matches!(narrow_result, Err(Error::BlockerReference { .. })));

    let wide = vec![blocker.chain_id, main.chain_id];
    let deleted = in_transaction(store, move |tx| {
        Box::pin(async move { tx.delete_jobs_by_chain_ids(&wide).await })
    })
    .await
    .expect("widened delete");
    assert_eq!(deleted, 2);

    let gone = in_transaction(store, move |tx| {
        Box::pin(async move { tx.get_job_by_id(main_id).await })
    })
    .await
    .expect("read back");
    assert!(gone.is_none());
}

/// A delayed job is invisible to acquire until its schedule elapses, and
/// the next-available probe reports the delay.
pub async fn check_schedule_gating(store: &dyn JobStore) {
    let type_name = unique_type("scheduled");
    create_root_with(
        store,
        &type_name,
        json!({}),
        Schedule::after_ms(150),
        None,
    )
    .await;

    assert!(acquire_one(store, &type_name, "w-1").await.is_none());

    let probe_types = vec![type_name.clone()];
    let next_ms = in_transaction(store, move |tx| {
        Box::pin(async move { tx.next_job_available_in_ms(&probe_types).await })
    })
    .await
    .expect("probe");
    let next_ms = next_ms.expect("a scheduled job exists");
    assert!(next_ms > 0 && next_ms <= 150, "next_ms = {next_ms}");

    tokio::time::sleep(Duration::from_millis(170)).await;
    assert!(acquire_one(store, &type_name, "w-1").await.is_some());
}

/// An expired lease is reclaimed exactly once and the job re-acquired.
pub async fn check_lease_expiry_reap(store: &dyn JobStore) {
    let type_name = unique_type("expiry");
    create_root(store, &type_name, json!({})).await;

    let type_names = vec![type_name.clone()];
    let acquired = in_transaction(store, move |tx| {
        Box::pin(async move {
            let result = tx
                .acquire_job(
                    AcquireJobRequest::builder()
                        .type_names(type_names)
                        .worker_id("w-dead")
                        .lease_ms(40u64)
                        .build(),
                )
                .await?;
            Ok(result.job)
        })
    })
    .await
    .expect("acquire")
    .expect("job");

    tokio::time::sleep(Duration::from_millis(60)).await;

    let reap_types = vec![type_name.clone()];
    let reaped = in_transaction(store, move |tx| {
        Box::pin(async move { tx.remove_expired_job_lease(&reap_types, &[]).await })
    })
    .await
    .expect("reap")
    .expect("an expired row");
    assert_eq!(reaped.id, acquired.id);
    assert_eq!(reaped.leased_by.as_deref(), Some("w-dead"));

    let after = get_job(store, acquired.id).await;
    assert_eq!(after.status, JobStatus::Pending);
    assert!(after.leased_by.is_none());

    let reacquired = acquire_one(store, &type_name, "w-2").await.expect("reacquire");
    assert_eq!(reacquired.id, acquired.id);
    assert_eq!(reacquired.attempt, 2);
}

/// Renewal extends only the holder's lease.
pub async fn check_renew_guards_ownership(store: &dyn JobStore) {
    let type_name = unique_type("renew");
    create_root(store, &type_name, json!({})).await;
    let job = acquire_one(store, &type_name, "w-1").await.expect("acquire");

    let job_id = job.id;
    let renewed = in_transaction(store, move |tx| {
        Box::pin(async move { tx.renew_job_lease(job_id, "w-1", 60_000).await })
    })
    .await
    .expect("renew by holder");
    assert!(renewed.leased_until.unwrap() > job.leased_until.unwrap());

    let stolen = in_transaction(store, move |tx| {
        Box::pin(async move { tx.renew_job_lease(job_id, "w-2", 60_000).await })
    })
    .await;
    assert!(matches!(stolen, Err(Error::LeaseExpired { .. })));
}

async fn get_job(store: &dyn JobStore, job_id: Uuid) -> Job {
    in_transaction(store, move |tx| {
        Box::pin(async move { tx.get_job_by_id(job_id).await })
    })
    .await
    .expect("get_job_by_id")
    .expect("job exists")
}
