//! sqlx implementation of the store contract.
//!
//! Concurrency control leans on PostgreSQL row locks: acquisition and
//! lease reaping select candidates with `FOR UPDATE SKIP LOCKED` so
//! competing workers claim different rows, and the blocker/completion
//! paths lock the chain root row before touching anything else. The
//! `(chain_id, chain_index)` unique constraint and the partial
//! deduplication indexes are the idempotency boundary; a concurrent
//! insert that trips them is resolved by re-reading the surviving row.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, Transaction};
use uuid::Uuid;

use tandem::{
    AcquireJobRequest, AcquireJobResult, AddJobBlockersResult, BlockerLink, BlockerRef,
    ChainFilter, CreateJobRequest, CreateJobResult, Cursor, DedupScope, Error, Job, JobChain,
    JobFilter, JobStatus, JobStore, Page, PageRequest, Result, Schedule,
    ScheduleBlockedJobsResult, StoreTransaction,
};

const JOB_COLUMNS: &str = "id, type_name, chain_id, chain_index, chain_type_name, root_chain_id, \
     origin_id, status, input, output, attempt, last_attempt_at, last_attempt_error, \
     scheduled_at, created_at, completed_at, leased_by, leased_until, completed_by, \
     dedup_key, dedup_scope, trace_context";

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(Error::storage)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(Error::storage)?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    type_name: String,
    chain_id: Uuid,
    chain_index: i32,
    chain_type_name: String,
    root_chain_id: Uuid,
    origin_id: Option<Uuid>,
    status: String,
    input: Value,
    output: Option<Value>,
    attempt: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    last_attempt_error: Option<String>,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    leased_by: Option<String>,
    leased_until: Option<DateTime<Utc>>,
    completed_by: Option<String>,
    dedup_key: Option<String>,
    dedup_scope: Option<String>,
    trace_context: Option<Value>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = JobStatus::from_str(&row.status)
            .map_err(|message| Error::storage(anyhow::anyhow!(message)))?;
        let dedup_scope = row
            .dedup_scope
            .as_deref()
            .map(DedupScope::from_str)
            .transpose()
            .map_err(|message| Error::storage(anyhow::anyhow!(message)))?;
        Ok(Job {
            id: row.id,
            type_name: row.type_name,
            chain_id: row.chain_id,
            chain_index: row.chain_index,
            chain_type_name: row.chain_type_name,
            root_chain_id: row.root_chain_id,
            origin_id: row.origin_id,
            status,
            input: row.input,
            output: row.output,
            attempt: row.attempt,
            last_attempt_at: row.last_attempt_at,
            last_attempt_error: row.last_attempt_error,
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
            leased_by: row.leased_by,
            leased_until: row.leased_until,
            completed_by: row.completed_by,
            dedup_key: row.dedup_key,
            dedup_scope,
            trace_context: row.trace_context,
        })
    }
}

#[derive(Debug, FromRow)]
struct BlockerLinkRow {
    blocked_job_id: Uuid,
    blocker_chain_id: Uuid,
    blocker_trace_context: Option<Value>,
}

impl From<BlockerLinkRow> for BlockerLink {
    fn from(row: BlockerLinkRow) -> Self {
        BlockerLink {
            blocked_job_id: row.blocked_job_id,
            blocker_chain_id: row.blocker_chain_id,
            blocker_trace_context: row.blocker_trace_context,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

// ============================================================================
// Transaction
// ============================================================================

pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTransaction {
    async fn fetch_job(&mut self, job_id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        row.map(Job::try_from).transpose()
    }

    async fn fetch_dedup_owner(
        &mut self,
        type_name: &str,
        key: &str,
        scope: DedupScope,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs \
             WHERE type_name = $1 AND dedup_key = $2 AND dedup_scope = $3 \
               AND (dedup_scope = 'any' OR status <> 'completed') \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(type_name)
            .bind(key)
            .bind(scope.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        row.map(Job::try_from).transpose()
    }

    async fn fetch_chain_slot(&mut self, chain_id: Uuid, chain_index: i32) -> Result<Option<Job>> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE chain_id = $1 AND chain_index = $2");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(chain_id)
            .bind(chain_index)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        row.map(Job::try_from).transpose()
    }

    /// Current job of a chain (highest index), optionally row-locked.
    async fn fetch_chain_current(&mut self, chain_id: Uuid, lock: bool) -> Result<Option<Job>> {
        let suffix = if lock { " FOR UPDATE" } else { "" };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE chain_id = $1 \
             ORDER BY chain_index DESC LIMIT 1{suffix}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(chain_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        row.map(Job::try_from).transpose()
    }

    async fn chain_completed(&mut self, chain_id: Uuid) -> Result<bool> {
        Ok(self
            .fetch_chain_current(chain_id, false)
            .await?
            .map(|job| job.status == JobStatus::Completed)
            .unwrap_or(false))
    }

    /// Row-lock a chain root, failing when the chain does not exist.
    async fn lock_chain_root(&mut self, chain_id: Uuid) -> Result<Job> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs \
             WHERE id = $1 AND chain_index = 0 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(chain_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        row.map(Job::try_from)
            .transpose()?
            .ok_or(Error::ChainNotFound { chain_id })
    }

    async fn insert_job(
        &mut self,
        job: NewJob<'_>,
    ) -> std::result::Result<Option<JobRow>, sqlx::Error> {
        let sql = format!(
            "INSERT INTO tandem_jobs (id, type_name, chain_id, chain_index, chain_type_name, \
                 root_chain_id, origin_id, status, input, attempt, scheduled_at, created_at, \
                 dedup_key, dedup_scope, trace_context) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, 0, $9, NOW(), $10, $11, $12) \
             ON CONFLICT ON CONSTRAINT tandem_jobs_chain_position DO NOTHING \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id)
            .bind(job.type_name)
            .bind(job.chain_id)
            .bind(job.chain_index)
            .bind(job.chain_type_name)
            .bind(job.root_chain_id)
            .bind(job.origin_id)
            .bind(job.input)
            .bind(job.scheduled_at)
            .bind(job.dedup_key)
            .bind(job.dedup_scope)
            .bind(job.trace_context)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }
}

struct NewJob<'a> {
    id: Uuid,
    type_name: &'a str,
    chain_id: Uuid,
    chain_index: i32,
    chain_type_name: &'a str,
    root_chain_id: Uuid,
    origin_id: Option<Uuid>,
    input: &'a Value,
    scheduled_at: DateTime<Utc>,
    dedup_key: Option<&'a str>,
    dedup_scope: Option<&'a str>,
    trace_context: Option<&'a Value>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn create_job(&mut self, req: CreateJobRequest) -> Result<CreateJobResult> {
        if let Some(dedup) = &req.deduplication {
            if let Some(owner) = self
                .fetch_dedup_owner(&req.type_name, &dedup.key, dedup.scope)
                .await?
            {
                return Ok(CreateJobResult {
                    job: owner,
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
                let root_chain_id = match req.root_chain_id {
                    Some(root) => root,
                    None => {
                        self.fetch_job(chain_id)
                            .await?
                            .ok_or(Error::ChainNotFound { chain_id })?
                            .root_chain_id
                    }
                };
                (chain_id, root_chain_id)
            }
        };

        let scheduled_at = req.schedule.resolve(Utc::now());
        let inserted = self
            .insert_job(NewJob {
                id,
                type_name: &req.type_name,
                chain_id,
                chain_index: req.chain_index,
                chain_type_name: &req.chain_type_name,
                root_chain_id,
                origin_id: req.origin_id,
                input: &req.input,
                scheduled_at,
                dedup_key: req.deduplication.as_ref().map(|d| d.key.as_str()),
                dedup_scope: req.deduplication.as_ref().map(|d| d.scope.as_str()),
                trace_context: req.trace_context.as_ref(),
            })
            .await;

        match inserted {
            Ok(Some(row)) => Ok(CreateJobResult {
                job: Job::try_from(row)?,
                deduplicated: false,
            }),
            // The (chain_id, chain_index) slot is taken: hand back its owner.
            Ok(None) => {
                let existing = self
                    .fetch_chain_slot(chain_id, req.chain_index)
                    .await?
                    .ok_or_else(|| {
                        Error::storage(anyhow::anyhow!(
                            "chain slot ({chain_id}, {}) conflicted but has no row",
                            req.chain_index
                        ))
                    })?;
                Ok(CreateJobResult {
                    job: existing,
                    deduplicated: true,
                })
            }
            // A concurrent insert won a dedup key race; return the winner.
            Err(err) if is_unique_violation(&err) => {
                if let Some(dedup) = &req.deduplication {
                    if let Some(owner) = self
                        .fetch_dedup_owner(&req.type_name, &dedup.key, dedup.scope)
                        .await?
                    {
                        return Ok(CreateJobResult {
                            job: owner,
                            deduplicated: true,
                        });
                    }
                }
                Err(Error::storage(err))
            }
            Err(err) => Err(Error::storage(err)),
        }
    }

    async fn add_job_blockers(
        &mut self,
        job_id: Uuid,
        blockers: Vec<BlockerRef>,
    ) -> Result<AddJobBlockersResult> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE id = $1 FOR UPDATE");
        let main: Job = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?
            .map(Job::try_from)
            .transpose()?
            .ok_or(Error::JobNotFound { job_id })?;

        let mut incomplete = Vec::new();
        let mut traces = Vec::new();
        for blocker in &blockers {
            let root = self.lock_chain_root(blocker.chain_id).await?;
            traces.push(root.trace_context.clone());

            if root.root_chain_id == blocker.chain_id && blocker.chain_id != main.root_chain_id {
                sqlx::query("UPDATE tandem_jobs SET root_chain_id = $1 WHERE root_chain_id = $2")
                    .bind(main.root_chain_id)
                    .bind(blocker.chain_id)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(Error::storage)?;
                sqlx::query("UPDATE tandem_jobs SET origin_id = $1 WHERE id = $2")
                    .bind(main.id)
                    .bind(blocker.chain_id)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(Error::storage)?;
            }

            sqlx::query(
                "INSERT INTO tandem_job_blockers (blocked_job_id, blocker_chain_id, blocker_trace_context) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(job_id)
            .bind(blocker.chain_id)
            .bind(&blocker.trace_context)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

            if !self.chain_completed(blocker.chain_id).await? {
                incomplete.push(blocker.chain_id);
            }
        }

        if !incomplete.is_empty() {
            sqlx::query("UPDATE tandem_jobs SET status = 'blocked' WHERE id = $1 AND status = 'pending'")
                .bind(job_id)
                .execute(&mut *self.tx)
                .await
                .map_err(Error::storage)?;
        }

        let job = self
            .fetch_job(job_id)
            .await?
            .ok_or(Error::JobNotFound { job_id })?;
        Ok(AddJobBlockersResult {
            job,
            incomplete_blocker_chain_ids: incomplete,
            blocker_trace_contexts: traces,
        })
    }

    async fn schedule_blocked_jobs(
        &mut self,
        blocked_by_chain_id: Uuid,
    ) -> Result<ScheduleBlockedJobsResult> {
        let blocked_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT blocked_job_id FROM tandem_job_blockers WHERE blocker_chain_id = $1 \
             ORDER BY ordinal",
        )
        .bind(blocked_by_chain_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::storage)?;

        let mut unblocked = Vec::new();
        for job_id in blocked_ids {
            let sql = format!("SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE id = $1 FOR UPDATE");
            let Some(job) = sqlx::query_as::<_, JobRow>(&sql)
                .bind(job_id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(Error::storage)?
                .map(Job::try_from)
                .transpose()?
            else {
                continue;
            };
            if job.status != JobStatus::Blocked {
                continue;
            }

            let still_gated: bool = sqlx::query_scalar(
                "SELECT EXISTS ( \
                     SELECT 1 FROM tandem_job_blockers b \
                     JOIN LATERAL ( \
                         SELECT status FROM tandem_jobs c \
                         WHERE c.chain_id = b.blocker_chain_id \
                         ORDER BY c.chain_index DESC LIMIT 1 \
                     ) cur ON TRUE \
                     WHERE b.blocked_job_id = $1 AND cur.status <> 'completed' \
                 )",
            )
            .bind(job_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
            if still_gated {
                continue;
            }

            let sql = format!(
                "UPDATE tandem_jobs SET status = 'pending' WHERE id = $1 RETURNING {JOB_COLUMNS}"
            );
            let row = sqlx::query_as::<_, JobRow>(&sql)
                .bind(job_id)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(Error::storage)?;
            unblocked.push(Job::try_from(row)?);
        }

        Ok(ScheduleBlockedJobsResult {
            unblocked_jobs: unblocked,
        })
    }

    async fn next_job_available_in_ms(&mut self, type_names: &[String]) -> Result<Option<u64>> {
        let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(scheduled_at) FROM tandem_jobs \
             WHERE status = 'pending' AND type_name = ANY($1)",
        )
        .bind(type_names)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(Error::storage)?;

        let now = Utc::now();
        Ok(earliest.map(|at| {
            if at <= now {
                0
            } else {
                (at - now).num_milliseconds().max(0) as u64
            }
        }))
    }

    async fn acquire_job(&mut self, req: AcquireJobRequest) -> Result<AcquireJobResult> {
        let sql = format!(
            "WITH next_job AS ( \
                 SELECT id FROM tandem_jobs \
                 WHERE status = 'pending' AND type_name = ANY($1) AND scheduled_at <= NOW() \
                 ORDER BY scheduled_at, created_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE tandem_jobs \
             SET status = 'running', \
                 attempt = attempt + 1, \
                 last_attempt_at = NOW(), \
                 leased_by = $2, \
                 leased_until = NOW() + ($3 || ' milliseconds')::INTERVAL \
             WHERE id IN (SELECT id FROM next_job) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&req.type_names)
            .bind(&req.worker_id)
            .bind(req.lease_ms.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        let Some(row) = row else {
            return Ok(AcquireJobResult {
                job: None,
                has_more: false,
            });
        };
        let job = Job::try_from(row)?;

        let has_more: bool = sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM tandem_jobs \
                 WHERE status = 'pending' AND type_name = ANY($1) \
                   AND scheduled_at <= NOW() AND id <> $2 \
             )",
        )
        .bind(&req.type_names)
        .bind(job.id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(Error::storage)?;

        Ok(AcquireJobResult {
            job: Some(job),
            has_more,
        })
    }

    async fn renew_job_lease(
        &mut self,
        job_id: Uuid,
        worker_id: &str,
        lease_ms: u64,
    ) -> Result<Job> {
        let sql = format!(
            "UPDATE tandem_jobs \
             SET leased_until = NOW() + ($1 || ' milliseconds')::INTERVAL \
             WHERE id = $2 AND status = 'running' AND leased_by = $3 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(lease_ms.to_string())
            .bind(job_id)
            .bind(worker_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        match row {
            Some(row) => Job::try_from(row),
            None => match self.fetch_job(job_id).await? {
                Some(_) => Err(Error::LeaseExpired {
                    job_id,
                    worker_id: worker_id.to_string(),
                }),
                None => Err(Error::JobNotFound { job_id }),
            },
        }
    }

    async fn reschedule_job(
        &mut self,
        job_id: Uuid,
        schedule: Schedule,
        error: &str,
    ) -> Result<Job> {
        let scheduled_at = schedule.resolve(Utc::now());
        let sql = format!(
            "UPDATE tandem_jobs \
             SET status = 'pending', \
                 scheduled_at = $1, \
                 last_attempt_error = $2, \
                 leased_by = NULL, \
                 leased_until = NULL \
             WHERE id = $3 AND status = 'running' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(scheduled_at)
            .bind(error)
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        match row {
            Some(row) => Job::try_from(row),
            None => match self.fetch_job(job_id).await? {
                Some(job) => Err(Error::LeaseExpired {
                    job_id,
                    worker_id: job.leased_by.unwrap_or_default(),
                }),
                None => Err(Error::JobNotFound { job_id }),
            },
        }
    }

    async fn complete_job(
        &mut self,
        job_id: Uuid,
        output: Value,
        worker_id: Option<&str>,
    ) -> Result<Job> {
        let sql = format!(
            "UPDATE tandem_jobs \
             SET status = 'completed', \
                 output = $1, \
                 completed_at = NOW(), \
                 completed_by = $2, \
                 leased_by = NULL, \
                 leased_until = NULL \
             WHERE id = $3 AND status = 'running' \
               AND ($2::text IS NULL OR leased_by = $2) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&output)
            .bind(worker_id)
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        match row {
            Some(row) => Job::try_from(row),
            None => match self.fetch_job(job_id).await? {
                Some(_) => Err(Error::LeaseExpired {
                    job_id,
                    worker_id: worker_id.unwrap_or_default().to_string(),
                }),
                None => Err(Error::JobNotFound { job_id }),
            },
        }
    }

    async fn remove_expired_job_lease(
        &mut self,
        type_names: &[String],
        ignored_job_ids: &[Uuid],
    ) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs \
             WHERE status = 'running' AND leased_until < NOW() \
               AND type_name = ANY($1) AND NOT (id = ANY($2)) \
             ORDER BY leased_until \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(type_names)
            .bind(ignored_job_ids)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let observed = Job::try_from(row)?;

        sqlx::query(
            "UPDATE tandem_jobs \
             SET status = 'pending', leased_by = NULL, leased_until = NULL, \
                 last_attempt_error = 'lease expired' \
             WHERE id = $1",
        )
        .bind(observed.id)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::storage)?;

        Ok(Some(observed))
    }

    async fn delete_jobs_by_chain_ids(&mut self, chain_ids: &[Uuid]) -> Result<u64> {
        let mut external: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT b.blocker_chain_id \
             FROM tandem_job_blockers b \
             JOIN tandem_jobs j ON j.id = b.blocked_job_id \
             WHERE b.blocker_chain_id = ANY($1) AND NOT (j.chain_id = ANY($1))",
        )
        .bind(chain_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::storage)?;
        if !external.is_empty() {
            external.sort();
            return Err(Error::BlockerReference {
                chain_ids: external,
            });
        }

        sqlx::query("DELETE FROM tandem_job_blockers WHERE blocker_chain_id = ANY($1)")
            .bind(chain_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        let deleted = sqlx::query("DELETE FROM tandem_jobs WHERE chain_id = ANY($1)")
            .bind(chain_ids)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        Ok(deleted.rows_affected())
    }

    async fn get_job_by_id(&mut self, job_id: Uuid) -> Result<Option<Job>> {
        self.fetch_job(job_id).await
    }

    async fn get_job_for_update(&mut self, job_id: Uuid) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        row.map(Job::try_from)
            .transpose()?
            .ok_or(Error::JobNotFound { job_id })
    }

    async fn get_current_job_for_update(&mut self, chain_id: Uuid) -> Result<Job> {
        self.fetch_chain_current(chain_id, true)
            .await?
            .ok_or(Error::ChainNotFound { chain_id })
    }

    async fn get_job_chain_by_id(&mut self, chain_id: Uuid) -> Result<JobChain> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs WHERE id = $1 AND chain_index = 0"
        );
        let root = sqlx::query_as::<_, JobRow>(&sql)
            .bind(chain_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::storage)?
            .map(Job::try_from)
            .transpose()?
            .ok_or(Error::ChainNotFound { chain_id })?;
        let last = self
            .fetch_chain_current(chain_id, false)
            .await?
            .filter(|job| job.chain_index > 0);
        Ok(JobChain { root, last })
    }

    async fn get_job_blockers(&mut self, job_id: Uuid) -> Result<Vec<JobChain>> {
        let chain_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT blocker_chain_id FROM tandem_job_blockers \
             WHERE blocked_job_id = $1 ORDER BY ordinal",
        )
        .bind(job_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::storage)?;

        let mut chains = Vec::with_capacity(chain_ids.len());
        for chain_id in chain_ids {
            chains.push(self.get_job_chain_by_id(chain_id).await?);
        }
        Ok(chains)
    }

    async fn get_external_blockers(
        &mut self,
        root_chain_ids: &[Uuid],
    ) -> Result<Vec<BlockerLink>> {
        let rows = sqlx::query_as::<_, BlockerLinkRow>(
            "SELECT b.blocked_job_id, b.blocker_chain_id, b.blocker_trace_context \
             FROM tandem_job_blockers b \
             JOIN tandem_jobs blocked ON blocked.id = b.blocked_job_id \
             JOIN tandem_jobs blocker_root ON blocker_root.id = b.blocker_chain_id \
             WHERE blocked.root_chain_id = ANY($1) \
               AND NOT (blocker_root.root_chain_id = ANY($1)) \
             ORDER BY b.ordinal",
        )
        .bind(root_chain_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::storage)?;
        Ok(rows.into_iter().map(BlockerLink::from).collect())
    }

    async fn get_jobs_blocked_by_chain(&mut self, chain_id: Uuid) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs \
             WHERE id IN ( \
                 SELECT blocked_job_id FROM tandem_job_blockers WHERE blocker_chain_id = $1 \
             )"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(chain_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(Error::storage)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn get_chain_ids_by_root(&mut self, root_chain_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        sqlx::query_scalar(
            "SELECT DISTINCT chain_id FROM tandem_jobs WHERE root_chain_id = ANY($1)",
        )
        .bind(root_chain_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::storage)
    }

    async fn list_chains(
        &mut self,
        filter: ChainFilter,
        page: PageRequest,
    ) -> Result<Page<JobChain>> {
        let cursor = decode_cursor(&page)?;
        let limit = page.effective_limit() as i64;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs r \
             WHERE r.chain_index = 0 \
               AND ($1::text[] IS NULL OR r.chain_type_name = ANY($1)) \
               AND ($2::boolean IS NULL OR $2 = ( \
                       SELECT c.status = 'completed' FROM tandem_jobs c \
                       WHERE c.chain_id = r.chain_id \
                       ORDER BY c.chain_index DESC LIMIT 1 \
                   )) \
               AND ($3::timestamptz IS NULL OR (r.created_at, r.id) < ($3, $4)) \
             ORDER BY r.created_at DESC, r.id DESC \
             LIMIT $5"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&filter.chain_type_names)
            .bind(filter.completed)
            .bind(cursor.as_ref().map(|c| c.created_at))
            .bind(cursor.as_ref().map(|c| c.id))
            .bind(limit + 1)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        let mut roots: Vec<Job> = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<_>>()?;
        let next_cursor = if roots.len() as i64 > limit {
            roots.truncate(limit as usize);
            roots.last().map(|root| {
                Cursor {
                    created_at: root.created_at,
                    id: root.id,
                }
                .encode()
            })
        } else {
            None
        };

        let mut chains = Vec::with_capacity(roots.len());
        for root in roots {
            let last = self
                .fetch_chain_current(root.chain_id, false)
                .await?
                .filter(|job| job.chain_index > 0);
            chains.push(JobChain { root, last });
        }
        Ok(Page {
            items: chains,
            next_cursor,
        })
    }

    async fn list_jobs(&mut self, filter: JobFilter, page: PageRequest) -> Result<Page<Job>> {
        let cursor = decode_cursor(&page)?;
        let limit = page.effective_limit() as i64;
        let statuses: Option<Vec<String>> = filter
            .statuses
            .map(|statuses| statuses.iter().map(|s| s.as_str().to_string()).collect());
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM tandem_jobs \
             WHERE ($1::text[] IS NULL OR type_name = ANY($1)) \
               AND ($2::text[] IS NULL OR status = ANY($2)) \
               AND ($3::uuid IS NULL OR chain_id = $3) \
               AND ($4::uuid IS NULL OR root_chain_id = $4) \
               AND ($5::timestamptz IS NULL OR (created_at, id) < ($5, $6)) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $7"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&filter.type_names)
            .bind(&statuses)
            .bind(filter.chain_id)
            .bind(filter.root_chain_id)
            .bind(cursor.as_ref().map(|c| c.created_at))
            .bind(cursor.as_ref().map(|c| c.id))
            .bind(limit + 1)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(Error::storage)?;

        let mut jobs: Vec<Job> = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<_>>()?;
        let next_cursor = if jobs.len() as i64 > limit {
            jobs.truncate(limit as usize);
            jobs.last().map(|job| {
                Cursor {
                    created_at: job.created_at,
                    id: job.id,
                }
                .encode()
            })
        } else {
            None
        };
        Ok(Page {
            items: jobs,
            next_cursor,
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(Error::storage)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(Error::storage)
    }
}

fn decode_cursor(page: &PageRequest) -> Result<Option<Cursor>> {
    page.cursor.as_deref().map(Cursor::decode).transpose()
}
