//! In-process reference store.
//!
//! Keeps the whole job table behind one async mutex. A transaction takes
//! the lock for its lifetime and snapshots the state on entry; dropping
//! the transaction without committing restores the snapshot. Writers are
//! therefore fully serialized, which makes every locking requirement of
//! the store contract trivially true. Good for tests and embedded use,
//! not for throughput.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{BlockerLink, Job, JobChain, JobStatus, Schedule};
use crate::store::{
    AcquireJobRequest, AcquireJobResult, AddJobBlockersResult, BlockerRef, ChainFilter,
    CreateJobRequest, CreateJobResult, Cursor, JobFilter, JobStore, Page, PageRequest,
    ScheduleBlockedJobsResult, StoreTransaction,
};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    links: Vec<BlockerLink>,
}

impl MemoryState {
    fn current_of_chain(&self, chain_id: Uuid) -> Option<&Job> {
        self.jobs
            .values()
            .filter(|job| job.chain_id == chain_id)
            .max_by_key(|job| job.chain_index)
    }

    fn chain_completed(&self, chain_id: Uuid) -> bool {
        self.current_of_chain(chain_id)
            .map(|job| job.status == JobStatus::Completed)
            .unwrap_or(false)
    }

    fn chain_view(&self, chain_id: Uuid) -> Result<JobChain> {
        let root = self
            .jobs
            .get(&chain_id)
            .filter(|job| job.is_chain_root())
            .cloned()
            .ok_or(Error::ChainNotFound { chain_id })?;
        let last = self
            .current_of_chain(chain_id)
            .filter(|job| job.chain_index > 0)
            .cloned();
        Ok(JobChain { root, last })
    }
}

/// Reference [`JobStore`] holding everything in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
            committed: false,
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
    committed: bool,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // Anything short of an explicit commit rolls back.
        if !self.committed {
            if let Some(snapshot) = self.snapshot.take() {
                *self.guard = snapshot;
            }
        }
    }
}

impl MemoryTransaction {
    fn job(&self, job_id: Uuid) -> Result<&Job> {
        self.guard
            .jobs
            .get(&job_id)
            .ok_or(Error::JobNotFound { job_id })
    }

    fn job_mut(guard: &mut MemoryState, job_id: Uuid) -> Result<&mut Job> {
        guard.jobs.get_mut(&job_id).ok_or(Error::JobNotFound { job_id })
    }

    fn paginate<T, K>(items: Vec<T>, page: &PageRequest, key: K) -> Result<Page<T>>
    where
        K: Fn(&T) -> Cursor,
    {
        let cursor = match &page.cursor {
            Some(encoded) => Some(Cursor::decode(encoded)?),
            None => None,
        };
        let limit = page.effective_limit() as usize;

        let mut filtered: Vec<T> = items
            .into_iter()
            .filter(|item| match &cursor {
                None => true,
                Some(cursor) => {
                    let k = key(item);
                    (k.created_at, k.id) < (cursor.created_at, cursor.id)
                }
            })
            .collect();
        filtered.sort_by_key(|item| {
            let k = key(item);
            std::cmp::Reverse((k.created_at, k.id))
        });

        let next_cursor = if filtered.len() > limit {
            filtered.truncate(limit);
            filtered.last().map(|item| key(item).encode())
        } else {
            None
        };
        Ok(Page {
            items: filtered,
            next_cursor,
        })
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn create_job(&mut self, req: CreateJobRequest) -> Result<CreateJobResult> {
        let now = Utc::now();

        if let Some(dedup) = &req.deduplication {
            let existing = self.guard.jobs.values().find(|job| {
                job.type_name == req.type_name
                    && job.dedup_key.as_deref() == Some(dedup.key.as_str())
                    && job.dedup_scope == Some(dedup.scope)
                    && match dedup.scope {
                        crate::job::DedupScope::Any => true,
                        crate::job::DedupScope::Incomplete => job.status != JobStatus::Completed,
                    }
            });
            if let Some(existing) = existing {
                return Ok(CreateJobResult {
                    job: existing.clone(),
                    deduplicated: true,
                });
            }
        }

        let id = Uuid::new_v4();
        let (chain_id, root_chain_id) = match req.chain_id {
            None => {
                if req.chain_index != 0 {
                    return Err(Error::InvalidRequest {
                        message: format!(
                            "chain root must have chain_index 0, got {}",
                            req.chain_index
                        ),
                    });
                }
                (id, req.root_chain_id.unwrap_or(id))
            }
            Some(chain_id) => {
                if let Some(existing) = self
                    .guard
                    .jobs
                    .values()
                    .find(|job| job.chain_id == chain_id && job.chain_index == req.chain_index)
                {
                    return Ok(CreateJobResult {
                        job: existing.clone(),
                        deduplicated: true,
                    });
                }
                let root_chain_id = match req.root_chain_id {
                    Some(root) => root,
                    None => {
                        self.guard
                            .jobs
                            .get(&chain_id)
                            .ok_or(Error::ChainNotFound { chain_id })?
                            .root_chain_id
                    }
                };
                (chain_id, root_chain_id)
            }
        };

        let job = Job {
            id,
            type_name: req.type_name,
            chain_id,
            chain_index: req.chain_index,
            chain_type_name: req.chain_type_name,
            root_chain_id,
            origin_id: req.origin_id,
            status: JobStatus::Pending,
            input: req.input,
            output: None,
            attempt: 0,
            last_attempt_at: None,
            last_attempt_error: None,
            scheduled_at: req.schedule.resolve(now),
            created_at: now,
            completed_at: None,
            leased_by: None,
            leased_until: None,
            completed_by: None,
            dedup_key: req.deduplication.as_ref().map(|d| d.key.clone()),
            dedup_scope: req.deduplication.as_ref().map(|d| d.scope),
            trace_context: req.trace_context,
        };
        self.guard.jobs.insert(id, job.clone());
        Ok(CreateJobResult {
            job,
            deduplicated: false,
        })
    }

    async fn add_job_blockers(
        &mut self,
        job_id: Uuid,
        blockers: Vec<BlockerRef>,
    ) -> Result<AddJobBlockersResult> {
        let main = self.job(job_id)?.clone();
        let mut incomplete = Vec::new();
        let mut traces = Vec::new();

        for blocker in &blockers {
            let root = self
                .guard
                .jobs
                .get(&blocker.chain_id)
                .filter(|job| job.is_chain_root())
                .cloned()
                .ok_or(Error::ChainNotFound {
                    chain_id: blocker.chain_id,
                })?;
            traces.push(root.trace_context.clone());

            // Adoption: a still-independent blocker chain joins the main
            // job's root workflow, transitively-adopted chains included.
            if root.root_chain_id == blocker.chain_id
                && blocker.chain_id != main.root_chain_id
            {
                let main_root = main.root_chain_id;
                let old_root = blocker.chain_id;
                for job in self.guard.jobs.values_mut() {
                    if job.root_chain_id == old_root {
                        job.root_chain_id = main_root;
                    }
                }
                Self::job_mut(&mut self.guard, blocker.chain_id)?.origin_id = Some(main.id);
            }

            let exists = self.guard.links.iter().any(|link| {
                link.blocked_job_id == job_id && link.blocker_chain_id == blocker.chain_id
            });
            if !exists {
                self.guard.links.push(BlockerLink {
                    blocked_job_id: job_id,
                    blocker_chain_id: blocker.chain_id,
                    blocker_trace_context: blocker.trace_context.clone(),
                });
            }

            if !self.guard.chain_completed(blocker.chain_id) {
                incomplete.push(blocker.chain_id);
            }
        }

        if !incomplete.is_empty() {
            let job = Self::job_mut(&mut self.guard, job_id)?;
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Blocked;
            }
        }

        Ok(AddJobBlockersResult {
            job: self.job(job_id)?.clone(),
            incomplete_blocker_chain_ids: incomplete,
            blocker_trace_contexts: traces,
        })
    }

    async fn schedule_blocked_jobs(
        &mut self,
        blocked_by_chain_id: Uuid,
    ) -> Result<ScheduleBlockedJobsResult> {
        let blocked_ids: Vec<Uuid> = self
            .guard
            .links
            .iter()
            .filter(|link| link.blocker_chain_id == blocked_by_chain_id)
            .map(|link| link.blocked_job_id)
            .collect();

        let mut unblocked = Vec::new();
        for job_id in blocked_ids {
            let Some(job) = self.guard.jobs.get(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Blocked {
                continue;
            }
            let all_completed = self
                .guard
                .links
                .iter()
                .filter(|link| link.blocked_job_id == job_id)
                .all(|link| self.guard.chain_completed(link.blocker_chain_id));
            if all_completed {
                let job = Self::job_mut(&mut self.guard, job_id)?;
                job.status = JobStatus::Pending;
                unblocked.push(job.clone());
            }
        }

        Ok(ScheduleBlockedJobsResult {
            unblocked_jobs: unblocked,
        })
    }

    async fn next_job_available_in_ms(&mut self, type_names: &[String]) -> Result<Option<u64>> {
        let now = Utc::now();
        let earliest = self
            .guard
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending && type_names.contains(&job.type_name)
            })
            .map(|job| job.scheduled_at)
            .min();
        Ok(earliest.map(|at| {
            if at <= now {
                0
            } else {
                (at - now).num_milliseconds().max(0) as u64
            }
        }))
    }

    async fn acquire_job(&mut self, req: AcquireJobRequest) -> Result<AcquireJobResult> {
        let now = Utc::now();
        let mut candidates: Vec<(chrono::DateTime<Utc>, chrono::DateTime<Utc>, Uuid)> = self
            .guard
            .jobs
            .values()
            .filter(|job| req.type_names.contains(&job.type_name) && job.acquirable(now))
            .map(|job| (job.scheduled_at, job.created_at, job.id))
            .collect();
        candidates.sort();

        let Some((_, _, job_id)) = candidates.first().copied() else {
            return Ok(AcquireJobResult {
                job: None,
                has_more: false,
            });
        };
        let has_more = candidates.len() > 1;

        let job = Self::job_mut(&mut self.guard, job_id)?;
        job.status = JobStatus::Running;
        job.attempt += 1;
        job.last_attempt_at = Some(now);
        job.leased_by = Some(req.worker_id.clone());
        job.leased_until = Some(now + chrono::Duration::milliseconds(req.lease_ms as i64));

        Ok(AcquireJobResult {
            job: Some(job.clone()),
            has_more,
        })
    }

    async fn renew_job_lease(
        &mut self,
        job_id: Uuid,
        worker_id: &str,
        lease_ms: u64,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Self::job_mut(&mut self.guard, job_id)?;
        if job.status != JobStatus::Running || job.leased_by.as_deref() != Some(worker_id) {
            return Err(Error::LeaseExpired {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        job.leased_until = Some(now + chrono::Duration::milliseconds(lease_ms as i64));
        Ok(job.clone())
    }

    async fn reschedule_job(
        &mut self,
        job_id: Uuid,
        schedule: Schedule,
        error: &str,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Self::job_mut(&mut self.guard, job_id)?;
        if job.status != JobStatus::Running {
            return Err(Error::LeaseExpired {
                job_id,
                worker_id: job.leased_by.clone().unwrap_or_default(),
            });
        }
        job.status = JobStatus::Pending;
        job.scheduled_at = schedule.resolve(now);
        job.last_attempt_error = Some(error.to_string());
        job.leased_by = None;
        job.leased_until = None;
        Ok(job.clone())
    }

    async fn complete_job(
        &mut self,
        job_id: Uuid,
        output: Value,
        worker_id: Option<&str>,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Self::job_mut(&mut self.guard, job_id)?;
        if job.status != JobStatus::Running {
            return Err(Error::LeaseExpired {
                job_id,
                worker_id: worker_id.unwrap_or_default().to_string(),
            });
        }
        if let Some(worker_id) = worker_id {
            if job.leased_by.as_deref() != Some(worker_id) {
                return Err(Error::LeaseExpired {
                    job_id,
                    worker_id: worker_id.to_string(),
                });
            }
        }
        job.status = JobStatus::Completed;
        job.output = Some(output);
        job.completed_at = Some(now);
        job.completed_by = worker_id.map(str::to_string);
        job.leased_by = None;
        job.leased_until = None;
        Ok(job.clone())
    }

    async fn remove_expired_job_lease(
        &mut self,
        type_names: &[String],
        ignored_job_ids: &[Uuid],
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let expired = self
            .guard
            .jobs
            .values()
            .filter(|job| {
                type_names.contains(&job.type_name)
                    && !ignored_job_ids.contains(&job.id)
                    && job.lease_expired(now)
            })
            .min_by_key(|job| job.leased_until)
            .cloned();

        let Some(observed) = expired else {
            return Ok(None);
        };
        let job = Self::job_mut(&mut self.guard, observed.id)?;
        job.status = JobStatus::Pending;
        job.leased_by = None;
        job.leased_until = None;
        job.last_attempt_error = Some("lease expired".to_string());
        Ok(Some(observed))
    }

    async fn delete_jobs_by_chain_ids(&mut self, chain_ids: &[Uuid]) -> Result<u64> {
        let mut external: Vec<Uuid> = self
            .guard
            .links
            .iter()
            .filter(|link| {
                chain_ids.contains(&link.blocker_chain_id)
                    && self
                        .guard
                        .jobs
                        .get(&link.blocked_job_id)
                        .map(|job| !chain_ids.contains(&job.chain_id))
                        .unwrap_or(false)
            })
            .map(|link| link.blocker_chain_id)
            .collect();
        if !external.is_empty() {
            external.sort();
            external.dedup();
            return Err(Error::BlockerReference {
                chain_ids: external,
            });
        }

        let before = self.guard.jobs.len();
        let doomed: Vec<Uuid> = self
            .guard
            .jobs
            .values()
            .filter(|job| chain_ids.contains(&job.chain_id))
            .map(|job| job.id)
            .collect();
        for job_id in &doomed {
            self.guard.jobs.remove(job_id);
        }
        self.guard.links.retain(|link| {
            !doomed.contains(&link.blocked_job_id)
                && !chain_ids.contains(&link.blocker_chain_id)
        });
        Ok((before - self.guard.jobs.len()) as u64)
    }

    async fn get_job_by_id(&mut self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.guard.jobs.get(&job_id).cloned())
    }

    async fn get_job_for_update(&mut self, job_id: Uuid) -> Result<Job> {
        // The transaction already owns the whole state; a read is a lock.
        self.job(job_id).cloned()
    }

    async fn get_current_job_for_update(&mut self, chain_id: Uuid) -> Result<Job> {
        self.guard
            .current_of_chain(chain_id)
            .cloned()
            .ok_or(Error::ChainNotFound { chain_id })
    }

    async fn get_job_chain_by_id(&mut self, chain_id: Uuid) -> Result<JobChain> {
        self.guard.chain_view(chain_id)
    }

    async fn get_job_blockers(&mut self, job_id: Uuid) -> Result<Vec<JobChain>> {
        let chain_ids: Vec<Uuid> = self
            .guard
            .links
            .iter()
            .filter(|link| link.blocked_job_id == job_id)
            .map(|link| link.blocker_chain_id)
            .collect();
        chain_ids
            .into_iter()
            .map(|chain_id| self.guard.chain_view(chain_id))
            .collect()
    }

    async fn get_external_blockers(
        &mut self,
        root_chain_ids: &[Uuid],
    ) -> Result<Vec<BlockerLink>> {
        let links = self
            .guard
            .links
            .iter()
            .filter(|link| {
                let blocked_inside = self
                    .guard
                    .jobs
                    .get(&link.blocked_job_id)
                    .map(|job| root_chain_ids.contains(&job.root_chain_id))
                    .unwrap_or(false);
                let blocker_inside = self
                    .guard
                    .jobs
                    .get(&link.blocker_chain_id)
                    .map(|root| root_chain_ids.contains(&root.root_chain_id))
                    .unwrap_or(false);
                blocked_inside && !blocker_inside
            })
            .cloned()
            .collect();
        Ok(links)
    }

    async fn get_jobs_blocked_by_chain(&mut self, chain_id: Uuid) -> Result<Vec<Job>> {
        let jobs = self
            .guard
            .links
            .iter()
            .filter(|link| link.blocker_chain_id == chain_id)
            .filter_map(|link| self.guard.jobs.get(&link.blocked_job_id))
            .cloned()
            .collect();
        Ok(jobs)
    }

    async fn get_chain_ids_by_root(&mut self, root_chain_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut chain_ids: Vec<Uuid> = self
            .guard
            .jobs
            .values()
            .filter(|job| root_chain_ids.contains(&job.root_chain_id))
            .map(|job| job.chain_id)
            .collect();
        chain_ids.sort();
        chain_ids.dedup();
        Ok(chain_ids)
    }

    async fn list_chains(
        &mut self,
        filter: ChainFilter,
        page: PageRequest,
    ) -> Result<Page<JobChain>> {
        let chains: Vec<JobChain> = self
            .guard
            .jobs
            .values()
            .filter(|job| job.is_chain_root())
            .filter(|root| match &filter.chain_type_names {
                None => true,
                Some(names) => names.contains(&root.chain_type_name),
            })
            .map(|root| self.guard.chain_view(root.chain_id))
            .collect::<Result<_>>()?;
        let chains: Vec<JobChain> = chains
            .into_iter()
            .filter(|chain| match filter.completed {
                None => true,
                Some(completed) => chain.is_completed() == completed,
            })
            .collect();
        Self::paginate(chains, &page, |chain| Cursor {
            created_at: chain.root.created_at,
            id: chain.root.id,
        })
    }

    async fn list_jobs(&mut self, filter: JobFilter, page: PageRequest) -> Result<Page<Job>> {
        let jobs: Vec<Job> = self
            .guard
            .jobs
            .values()
            .filter(|job| match &filter.type_names {
                None => true,
                Some(names) => names.contains(&job.type_name),
            })
            .filter(|job| match &filter.statuses {
                None => true,
                Some(statuses) => statuses.contains(&job.status),
            })
            .filter(|job| filter.chain_id.map(|id| job.chain_id == id).unwrap_or(true))
            .filter(|job| {
                filter
                    .root_chain_id
                    .map(|id| job.root_chain_id == id)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        Self::paginate(jobs, &page, |job| Cursor {
            created_at: job.created_at,
            id: job.id,
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Drop restores the snapshot.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn tx(store: &MemoryStore) -> Box<dyn StoreTransaction> {
        store.begin().await.unwrap()
    }

    fn root_request(type_name: &str) -> CreateJobRequest {
        CreateJobRequest::builder()
            .type_name(type_name)
            .chain_type_name(type_name)
            .input(json!({}))
            .build()
    }

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let store = MemoryStore::new();
        let mut tx = tx(&store).await;
        let created = tx.create_job(root_request("greet")).await.unwrap();
        assert!(!created.deduplicated);
        assert_eq!(created.job.chain_id, created.job.id);
        assert_eq!(created.job.root_chain_id, created.job.id);

        let fetched = tx.get_job_by_id(created.job.id).await.unwrap().unwrap();
        assert_eq!(fetched.type_name, "greet");
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn uncommitted_transaction_rolls_back_on_drop() {
        let store = MemoryStore::new();
        let job_id = {
            let mut tx = tx(&store).await;
            let created = tx.create_job(root_request("greet")).await.unwrap();
            created.job.id
            // dropped without commit
        };
        let mut tx = tx(&store).await;
        assert!(tx.get_job_by_id(job_id).await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn chain_index_collision_returns_existing_row() {
        let store = MemoryStore::new();
        let mut tx = tx(&store).await;
        let root = tx.create_job(root_request("greet")).await.unwrap().job;

        let continuation = CreateJobRequest::builder()
            .type_name("next")
            .chain_id(Some(root.chain_id))
            .chain_index(1)
            .chain_type_name(root.chain_type_name.clone())
            .input(json!({"n": 1}))
            .build();
        let first = tx.create_job(continuation.clone()).await.unwrap();
        let second = tx.create_job(continuation).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job.id, second.job.id);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn root_with_nonzero_index_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = tx(&store).await;
        let req = CreateJobRequest::builder()
            .type_name("greet")
            .chain_type_name("greet")
            .chain_index(3)
            .input(json!({}))
            .build();
        assert!(matches!(
            tx.create_job(req).await,
            Err(Error::InvalidRequest { .. })
        ));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_orders_by_schedule_then_age() {
        let store = MemoryStore::new();
        let mut tx = tx(&store).await;
        let first = tx.create_job(root_request("work")).await.unwrap().job;
        let _second = tx.create_job(root_request("work")).await.unwrap().job;
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let acquired = tx
            .acquire_job(
                AcquireJobRequest::builder()
                    .type_names(vec!["work".to_string()])
                    .worker_id("w-1")
                    .lease_ms(30_000u64)
                    .build(),
            )
            .await
            .unwrap();
        let job = acquired.job.unwrap();
        assert_eq!(job.id, first.id);
        assert!(acquired.has_more);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.leased_by.as_deref(), Some("w-1"));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn listing_paginates_with_cursor() {
        let store = MemoryStore::new();
        let mut tx = tx(&store).await;
        for _ in 0..5 {
            tx.create_job(root_request("work")).await.unwrap();
            // Distinct created_at values keep the ordering observable.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let first_page = tx
            .list_jobs(JobFilter::default(), PageRequest::first(2))
            .await
            .unwrap();
        assert_eq!(first_page.items.len(), 2);
        let cursor = first_page.next_cursor.expect("more pages");

        let second_page = tx
            .list_jobs(
                JobFilter::default(),
                PageRequest {
                    cursor: Some(cursor),
                    limit: Some(10),
                },
            )
            .await
            .unwrap();
        assert_eq!(second_page.items.len(), 3);
        assert!(second_page.next_cursor.is_none());

        // Newest first, no overlap between pages.
        let seen: Vec<Uuid> = first_page
            .items
            .iter()
            .chain(second_page.items.iter())
            .map(|job| job.id)
            .collect();
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen.len(), 5);
        assert_eq!(deduped.len(), 5);
        tx.commit().await.unwrap();
    }
}
