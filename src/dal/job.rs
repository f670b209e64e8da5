/*
 *  Copyright 2025-2026 The Conveyor Authors
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Job claiming, status transitions, and crash-recovery operations.
//!
//! Every status mutation here is a compare-and-set filtered on the
//! expected prior status; a zero-row update means the caller lost a race
//! and gets `StatusConflict`. Batch operations (claiming, reclamation,
//! the orphan sweep) take `FOR UPDATE SKIP LOCKED` row locks so any number
//! of scheduler or monitor instances can run concurrently.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sql_types::{BigInt, Text};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::DAL;
use crate::database::schema::jobs;
use crate::error::OrchestratorError;
use crate::models::job::{Job, NewJob};
use crate::retry::{dispose, RetryDisposition};
use crate::state_machine::{validate_transition, JobStatus};

/// Sentinel `worker_id` for jobs that are SCHEDULED and staged in the
/// broker but not yet leased by a worker. The orphan sweep targets
/// exactly these rows.
pub const BROKER_WORKER_ID: &str = "broker";

/// A job claimed by the scheduler, ready for broker handoff.
#[derive(Debug, Clone, QueryableByName)]
pub struct ClaimedJob {
    #[diesel(sql_type = diesel::sql_types::Uuid)]
    pub id: Uuid,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    pub priority: i32,
}

/// Result of reclaiming a stale worker's jobs.
#[derive(Debug, Clone, Default)]
pub struct ReassignOutcome {
    /// Jobs returned to PENDING with a fresh retry delay.
    pub requeued: Vec<Uuid>,
    /// Jobs whose attempt budget ran out; the caller stages these to the
    /// dead-letter queue.
    pub buried: Vec<Uuid>,
}

pub struct JobDAL<'a> {
    pub(super) dal: &'a DAL,
}

impl<'a> JobDAL<'a> {
    /// Inserts a new job in PENDING.
    ///
    /// A collision on the idempotency key unique index is translated into
    /// `DuplicateIdempotencyKey`; exactly one create wins under any
    /// interleaving of concurrent submissions.
    pub async fn create(&self, new_job: NewJob) -> Result<Job, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let key = new_job.idempotency_key.clone();

        let job = conn
            .interact(move |conn| {
                match diesel::insert_into(jobs::table)
                    .values(&new_job)
                    .get_result::<Job>(conn)
                {
                    Err(diesel::result::Error::DatabaseError(
                        DatabaseErrorKind::UniqueViolation,
                        ref i,
                    )) if i.constraint_name() == Some("jobs_idempotency_key_key") => {
                        Err(OrchestratorError::DuplicateIdempotencyKey(key))
                    }
                    other => other.map_err(Into::into),
                }
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        info!(
            "Job created: {} (type: {}, priority: {})",
            job.id, job.job_type, job.priority
        );
        Ok(job)
    }

    /// Fetches a job by id, failing with `JobNotFound` when absent.
    pub async fn get_by_id(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            jobs::table
                .find(job_id)
                .first::<Job>(conn)
                .optional()?
                .ok_or(OrchestratorError::JobNotFound(job_id))
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Looks a job up by its idempotency key.
    pub async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Job>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let key = key.to_string();
        conn.interact(move |conn| {
            jobs::table
                .filter(jobs::idempotency_key.eq(key))
                .first::<Job>(conn)
                .optional()
                .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Compare-and-set status update.
    ///
    /// Validates the transition against the state machine, then updates
    /// the row only if its status still equals `expected`. Entry into a
    /// terminal status stamps `completed_at`; leaving the worker-held
    /// statuses clears `worker_id`. SCHEDULED and RUNNING are entered
    /// through `claim_ready_jobs` and `mark_running`, which also set the
    /// owning worker.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Job, OrchestratorError> {
        validate_transition(expected, next)?;

        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            let now = Utc::now();
            let target = jobs::table
                .filter(jobs::id.eq(job_id))
                .filter(jobs::status.eq(expected.as_str()));

            let updated: Option<Job> = if next.is_terminal() {
                diesel::update(target)
                    .set((
                        jobs::status.eq(next.as_str()),
                        jobs::worker_id.eq(None::<String>),
                        jobs::completed_at.eq(Some(now)),
                        jobs::updated_at.eq(now),
                    ))
                    .get_result(conn)
                    .optional()?
            } else {
                diesel::update(target)
                    .set((
                        jobs::status.eq(next.as_str()),
                        jobs::worker_id.eq(None::<String>),
                        jobs::updated_at.eq(now),
                    ))
                    .get_result(conn)
                    .optional()?
            };

            match updated {
                Some(job) => {
                    info!(
                        "Job state change: {} -> {} (job: {})",
                        expected, next, job.id
                    );
                    Ok(job)
                }
                None => Err(Self::conflict_for(conn, job_id, expected)?),
            }
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// CAS SCHEDULED -> RUNNING, recording the owning worker and start
    /// time. A `StatusConflict` here means the job was reclaimed or
    /// canceled between lease and start; the worker acks and abandons.
    pub async fn mark_running(
        &self,
        job_id: Uuid,
        worker: &str,
    ) -> Result<Job, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let worker = worker.to_string();
        conn.interact(move |conn| {
            let now = Utc::now();
            let updated: Option<Job> = diesel::update(
                jobs::table
                    .filter(jobs::id.eq(job_id))
                    .filter(jobs::status.eq(JobStatus::Scheduled.as_str())),
            )
            .set((
                jobs::status.eq(JobStatus::Running.as_str()),
                jobs::worker_id.eq(Some(worker.clone())),
                jobs::started_at.eq(Some(now)),
                jobs::updated_at.eq(now),
            ))
            .get_result(conn)
            .optional()?;

            match updated {
                Some(job) => {
                    info!(
                        "Job state change: SCHEDULED -> RUNNING (job: {}, worker: {})",
                        job.id, worker
                    );
                    Ok(job)
                }
                None => Err(Self::conflict_for(conn, job_id, JobStatus::Scheduled)?),
            }
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// CAS RUNNING -> SUCCESS with the handler's result blob.
    pub async fn complete(
        &self,
        job_id: Uuid,
        result: Value,
    ) -> Result<Job, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            let now = Utc::now();
            let updated: Option<Job> = diesel::update(
                jobs::table
                    .filter(jobs::id.eq(job_id))
                    .filter(jobs::status.eq(JobStatus::Running.as_str())),
            )
            .set((
                jobs::status.eq(JobStatus::Success.as_str()),
                jobs::result.eq(Some(result)),
                jobs::worker_id.eq(None::<String>),
                jobs::completed_at.eq(Some(now)),
                jobs::updated_at.eq(now),
            ))
            .get_result(conn)
            .optional()?;

            match updated {
                Some(job) => {
                    info!("Job state change: RUNNING -> SUCCESS (job: {})", job.id);
                    Ok(job)
                }
                None => Err(Self::conflict_for(conn, job_id, JobStatus::Running)?),
            }
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// CAS RUNNING -> FAILED, recording the error. FAILED is not
    /// terminal: the caller follows up with `schedule_retry_or_bury`.
    pub async fn fail(
        &self,
        job_id: Uuid,
        message: &str,
        details: Option<Value>,
    ) -> Result<Job, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let message = message.to_string();
        conn.interact(move |conn| {
            let now = Utc::now();
            let updated: Option<Job> = diesel::update(
                jobs::table
                    .filter(jobs::id.eq(job_id))
                    .filter(jobs::status.eq(JobStatus::Running.as_str())),
            )
            .set((
                jobs::status.eq(JobStatus::Failed.as_str()),
                jobs::error_message.eq(Some(message.clone())),
                jobs::error_details.eq(details),
                jobs::worker_id.eq(None::<String>),
                jobs::updated_at.eq(now),
            ))
            .get_result(conn)
            .optional()?;

            match updated {
                Some(job) => {
                    info!(
                        "Job state change: RUNNING -> FAILED (job: {}, error: {})",
                        job.id, message
                    );
                    Ok(job)
                }
                None => Err(Self::conflict_for(conn, job_id, JobStatus::Running)?),
            }
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Cancels a job from any non-terminal status.
    ///
    /// Retries the CAS a few times to ride out races with the scheduler
    /// and workers; a terminal status fails with `InvalidTransition`.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        const CAS_ATTEMPTS: usize = 3;

        let mut last_conflict = None;
        for _ in 0..CAS_ATTEMPTS {
            let current = self.get_by_id(job_id).await?;
            let status = current.job_status()?;
            validate_transition(status, JobStatus::Canceled)?;

            match self.update_status(job_id, status, JobStatus::Canceled).await {
                Ok(job) => return Ok(job),
                Err(err @ OrchestratorError::StatusConflict { .. }) => {
                    last_conflict = Some(err);
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_conflict.unwrap_or(OrchestratorError::JobNotFound(job_id)))
    }

    /// Applies the retry disposition after a FAILED outcome.
    ///
    /// In a single transaction the job walks FAILED -> RETRYING -> PENDING
    /// with an incremented attempt and a backed-off `scheduled_at`, or
    /// FAILED -> DEAD when the budget is exhausted. Only the final state
    /// is persisted; RETRYING is never a resting state. Returns the
    /// disposition so the caller can stage a DLQ entry for buried jobs.
    pub async fn schedule_retry_or_bury(
        &self,
        job_id: Uuid,
    ) -> Result<RetryDisposition, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let disposition = conn
            .interact(move |conn| {
                conn.transaction::<RetryDisposition, OrchestratorError, _>(|conn| {
                    let job: Job = jobs::table
                        .find(job_id)
                        .for_update()
                        .first(conn)
                        .optional()?
                        .ok_or(OrchestratorError::JobNotFound(job_id))?;

                    let status = job.job_status()?;
                    if status != JobStatus::Failed {
                        return Err(OrchestratorError::StatusConflict {
                            expected: JobStatus::Failed,
                            actual: job.status,
                        });
                    }
                    validate_transition(JobStatus::Failed, JobStatus::Retrying)?;
                    validate_transition(JobStatus::Retrying, JobStatus::Pending)?;

                    let schedule = job.retry_schedule()?;
                    let now = Utc::now();
                    let disposition = dispose(&schedule, job.attempt, job.max_attempts);

                    match disposition {
                        RetryDisposition::Retry { new_attempt, delay } => {
                            let run_at = now
                                + chrono::Duration::milliseconds(
                                    delay.as_millis().min(i64::MAX as u128) as i64,
                                );
                            diesel::update(jobs::table.find(job_id))
                                .set((
                                    jobs::status.eq(JobStatus::Pending.as_str()),
                                    jobs::attempt.eq(new_attempt),
                                    jobs::scheduled_at.eq(run_at),
                                    jobs::worker_id.eq(None::<String>),
                                    jobs::started_at.eq(None::<DateTime<Utc>>),
                                    jobs::updated_at.eq(now),
                                ))
                                .execute(conn)?;
                            info!(
                                "Job retry scheduled: {} (attempt {}/{}, next run: {})",
                                job_id, new_attempt, job.max_attempts, run_at
                            );
                        }
                        RetryDisposition::Bury { new_attempt } => {
                            validate_transition(JobStatus::Failed, JobStatus::Dead)?;
                            diesel::update(jobs::table.find(job_id))
                                .set((
                                    jobs::status.eq(JobStatus::Dead.as_str()),
                                    jobs::attempt.eq(new_attempt),
                                    jobs::worker_id.eq(None::<String>),
                                    jobs::completed_at.eq(Some(now)),
                                    jobs::updated_at.eq(now),
                                ))
                                .execute(conn)?;
                            info!(
                                "Job state change: FAILED -> DEAD (job: {}, attempts exhausted: {})",
                                job_id, new_attempt
                            );
                        }
                    }

                    Ok(disposition)
                })
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        Ok(disposition)
    }

    /// Atomically claims up to `limit` ready jobs for broker handoff.
    ///
    /// One statement selects PENDING jobs whose `scheduled_at` has passed
    /// and whose predecessors are all SUCCESS, in total scheduling order
    /// `(priority DESC, scheduled_at ASC, created_at ASC, id ASC)`, with
    /// `FOR UPDATE SKIP LOCKED` so concurrent schedulers claim disjoint
    /// rows, then flips them to SCHEDULED under the broker sentinel.
    pub async fn claim_ready_jobs(
        &self,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let limit = limit as i64;

        let claimed = conn
            .interact(move |conn| {
                conn.transaction::<Vec<ClaimedJob>, diesel::result::Error, _>(|conn| {
                    diesel::sql_query(
                        r#"
                        WITH ready AS (
                            SELECT j.id
                            FROM jobs j
                            WHERE j.status = 'PENDING'
                              AND j.scheduled_at <= NOW()
                              AND NOT EXISTS (
                                  SELECT 1
                                  FROM job_dependencies d
                                  JOIN jobs p ON p.id = d.depends_on_job_id
                                  WHERE d.job_id = j.id
                                    AND p.status <> 'SUCCESS'
                              )
                            ORDER BY j.priority DESC, j.scheduled_at ASC, j.created_at ASC, j.id ASC
                            LIMIT $1
                            FOR UPDATE OF j SKIP LOCKED
                        )
                        UPDATE jobs
                        SET status = 'SCHEDULED', worker_id = $2, updated_at = NOW()
                        FROM ready
                        WHERE jobs.id = ready.id
                        RETURNING jobs.id, jobs.priority
                        "#,
                    )
                    .bind::<BigInt, _>(limit)
                    .bind::<Text, _>(BROKER_WORKER_ID)
                    .load::<ClaimedJob>(conn)
                })
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        if !claimed.is_empty() {
            info!("Claimed {} ready job(s) for dispatch", claimed.len());
        }
        Ok(claimed)
    }

    /// Reclaims every job held by a stale worker.
    ///
    /// Within one transaction, locks (skip-locked) the worker's jobs in
    /// SCHEDULED or RUNNING and applies the retry disposition: back to
    /// PENDING with a backed-off `scheduled_at` and `attempt + 1`, or DEAD
    /// when the budget is exhausted. A lost lease counts as a failed
    /// attempt, so a poisoned job trapped on a crash-looping worker
    /// cannot livelock.
    pub async fn reassign_worker_jobs(
        &self,
        worker: &str,
    ) -> Result<ReassignOutcome, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let worker = worker.to_string();

        conn.interact(move |conn| {
            conn.transaction::<ReassignOutcome, OrchestratorError, _>(|conn| {
                let held: Vec<Job> = jobs::table
                    .filter(jobs::worker_id.eq(&worker))
                    .filter(jobs::status.eq_any([
                        JobStatus::Scheduled.as_str(),
                        JobStatus::Running.as_str(),
                    ]))
                    .for_update()
                    .skip_locked()
                    .load(conn)?;

                let now = Utc::now();
                let mut outcome = ReassignOutcome::default();

                for job in held {
                    let schedule = job.retry_schedule()?;
                    match dispose(&schedule, job.attempt, job.max_attempts) {
                        RetryDisposition::Retry { new_attempt, delay } => {
                            let run_at = now
                                + chrono::Duration::milliseconds(
                                    delay.as_millis().min(i64::MAX as u128) as i64,
                                );
                            diesel::update(jobs::table.find(job.id))
                                .set((
                                    jobs::status.eq(JobStatus::Pending.as_str()),
                                    jobs::worker_id.eq(None::<String>),
                                    jobs::started_at.eq(None::<DateTime<Utc>>),
                                    jobs::attempt.eq(new_attempt),
                                    jobs::scheduled_at.eq(run_at),
                                    jobs::updated_at.eq(now),
                                ))
                                .execute(conn)?;
                            outcome.requeued.push(job.id);
                        }
                        RetryDisposition::Bury { new_attempt } => {
                            diesel::update(jobs::table.find(job.id))
                                .set((
                                    jobs::status.eq(JobStatus::Dead.as_str()),
                                    jobs::worker_id.eq(None::<String>),
                                    jobs::started_at.eq(None::<DateTime<Utc>>),
                                    jobs::attempt.eq(new_attempt),
                                    jobs::error_message.eq(Some("worker lease expired".to_string())),
                                    jobs::completed_at.eq(Some(now)),
                                    jobs::updated_at.eq(now),
                                ))
                                .execute(conn)?;
                            outcome.buried.push(job.id);
                        }
                    }
                }

                Ok(outcome)
            })
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Returns orphaned SCHEDULED jobs to PENDING.
    ///
    /// An orphan is a row still carrying the broker sentinel whose
    /// `updated_at` is older than the grace period: the scheduler
    /// committed but the broker enqueue never landed (or the entry was
    /// lost). No attempt is charged; nothing executed.
    pub async fn sweep_orphaned(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, OrchestratorError> {
        let conn = self.dal.database.get().await?;

        let swept = conn
            .interact(move |conn| {
                conn.transaction::<Vec<Uuid>, diesel::result::Error, _>(|conn| {
                    let orphaned: Vec<Uuid> = jobs::table
                        .filter(jobs::status.eq(JobStatus::Scheduled.as_str()))
                        .filter(jobs::worker_id.eq(BROKER_WORKER_ID))
                        .filter(jobs::updated_at.lt(cutoff))
                        .select(jobs::id)
                        .for_update()
                        .skip_locked()
                        .load(conn)?;

                    if orphaned.is_empty() {
                        return Ok(orphaned);
                    }

                    diesel::update(jobs::table.filter(jobs::id.eq_any(&orphaned)))
                        .set((
                            jobs::status.eq(JobStatus::Pending.as_str()),
                            jobs::worker_id.eq(None::<String>),
                            jobs::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)?;

                    Ok(orphaned)
                })
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        if !swept.is_empty() {
            info!("Orphan sweep returned {} job(s) to PENDING", swept.len());
        }
        Ok(swept)
    }

    /// Lists a workflow's jobs in submission order.
    pub async fn list_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            jobs::table
                .filter(jobs::workflow_id.eq(workflow_id))
                .order(jobs::created_at.asc())
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Per-status job counts for a workflow, for status derivation.
    pub async fn status_counts_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(JobStatus, i64)>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let raw: Vec<(String, i64)> = conn
            .interact(move |conn| {
                jobs::table
                    .filter(jobs::workflow_id.eq(workflow_id))
                    .group_by(jobs::status)
                    .select((jobs::status, diesel::dsl::count_star()))
                    .load(conn)
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        raw.into_iter()
            .map(|(status, count)| status.parse().map(|s| (s, count)))
            .collect()
    }

    /// Builds the `StatusConflict` (or `JobNotFound`) for a missed CAS.
    fn conflict_for(
        conn: &mut PgConnection,
        job_id: Uuid,
        expected: JobStatus,
    ) -> Result<OrchestratorError, diesel::result::Error> {
        let actual: Option<String> = jobs::table
            .find(job_id)
            .select(jobs::status)
            .first(conn)
            .optional()?;
        Ok(match actual {
            Some(actual) => OrchestratorError::StatusConflict { expected, actual },
            None => OrchestratorError::JobNotFound(job_id),
        })
    }
}
