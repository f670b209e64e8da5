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

//! Dependency edges and the readiness resolver.
//!
//! Cycle prevention happens here, at edge insertion, so everything
//! downstream (the resolver, the scheduler's claim query) can assume a
//! DAG. A job is *ready* when it is PENDING, due, and every predecessor
//! is SUCCESS. Predecessors that are DEAD or CANCELED permanently block
//! their dependents; the dependent stays PENDING until an operator
//! cancels it.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz, Uuid as SqlUuid};
use tracing::info;
use uuid::Uuid;

use super::DAL;
use crate::database::schema::{job_dependencies, jobs};
use crate::error::OrchestratorError;
use crate::models::dependency::NewJobDependency;
use crate::models::job::Job;
use crate::state_machine::JobStatus;

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

pub struct DependencyDAL<'a> {
    pub(super) dal: &'a DAL,
}

impl<'a> DependencyDAL<'a> {
    /// Inserts the edge `job_id -> depends_on_job_id`.
    ///
    /// Rejects self-edges, unknown jobs, and edges that would make the
    /// graph cyclic (checked with a recursive reachability query inside
    /// the insert transaction). Re-inserting an existing edge is a no-op.
    pub async fn insert(
        &self,
        job_id: Uuid,
        depends_on_job_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        if job_id == depends_on_job_id {
            return Err(OrchestratorError::Validation(
                "a job cannot depend on itself".to_string(),
            ));
        }

        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            conn.transaction::<(), OrchestratorError, _>(|conn| {
                for id in [job_id, depends_on_job_id] {
                    let exists: Option<Uuid> = jobs::table
                        .find(id)
                        .select(jobs::id)
                        .first(conn)
                        .optional()?;
                    if exists.is_none() {
                        return Err(OrchestratorError::JobNotFound(id));
                    }
                }

                // The new edge closes a cycle iff job_id is already
                // reachable from depends_on_job_id along existing edges.
                let reachable: Vec<IdRow> = diesel::sql_query(
                    r#"
                    WITH RECURSIVE reachable(id) AS (
                        SELECT depends_on_job_id FROM job_dependencies WHERE job_id = $1
                        UNION
                        SELECT d.depends_on_job_id
                        FROM job_dependencies d
                        JOIN reachable r ON d.job_id = r.id
                    )
                    SELECT id FROM reachable WHERE id = $2
                    "#,
                )
                .bind::<SqlUuid, _>(depends_on_job_id)
                .bind::<SqlUuid, _>(job_id)
                .load(conn)?;

                if !reachable.is_empty() {
                    return Err(OrchestratorError::DependencyCycle {
                        job_id,
                        depends_on_job_id,
                    });
                }

                diesel::insert_into(job_dependencies::table)
                    .values(&NewJobDependency {
                        job_id,
                        depends_on_job_id,
                    })
                    .on_conflict_do_nothing()
                    .execute(conn)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        info!("Dependency added: {job_id} depends on {depends_on_job_id}");
        Ok(())
    }

    /// Predecessor job ids of `job_id`.
    pub async fn list_dependencies_of(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<Uuid>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            job_dependencies::table
                .filter(job_dependencies::job_id.eq(job_id))
                .select(job_dependencies::depends_on_job_id)
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Whether `job_id` is ready to claim right now: PENDING, due, and
    /// every predecessor SUCCESS.
    pub async fn is_ready(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            let job: Option<(String, DateTime<Utc>)> = jobs::table
                .find(job_id)
                .select((jobs::status, jobs::scheduled_at))
                .first(conn)
                .optional()?;

            let (status, scheduled_at) = match job {
                Some(row) => row,
                None => return Err(OrchestratorError::JobNotFound(job_id)),
            };
            if status != JobStatus::Pending.as_str() || scheduled_at > now {
                return Ok(false);
            }

            let unsatisfied: i64 = job_dependencies::table
                .inner_join(
                    jobs::table.on(jobs::id.eq(job_dependencies::depends_on_job_id)),
                )
                .filter(job_dependencies::job_id.eq(job_id))
                .filter(jobs::status.ne(JobStatus::Success.as_str()))
                .count()
                .get_result(conn)?;

            Ok(unsatisfied == 0)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Ready-candidate ids in scheduling order, without taking locks.
    /// Inspection only; the scheduler claims through the locking query.
    pub async fn ready_candidates(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let limit = limit as i64;
        let rows: Vec<IdRow> = conn
            .interact(move |conn| {
                diesel::sql_query(
                    r#"
                    SELECT j.id
                    FROM jobs j
                    WHERE j.status = 'PENDING'
                      AND j.scheduled_at <= $1
                      AND NOT EXISTS (
                          SELECT 1
                          FROM job_dependencies d
                          JOIN jobs p ON p.id = d.depends_on_job_id
                          WHERE d.job_id = j.id
                            AND p.status <> 'SUCCESS'
                      )
                    ORDER BY j.priority DESC, j.scheduled_at ASC, j.created_at ASC, j.id ASC
                    LIMIT $2
                    "#,
                )
                .bind::<Timestamptz, _>(now)
                .bind::<BigInt, _>(limit)
                .load(conn)
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// PENDING jobs that can never become ready because a predecessor is
    /// DEAD or CANCELED. Failure propagation is explicit: these wait for
    /// an operator to cancel them.
    pub async fn blocked_jobs(&self) -> Result<Vec<Job>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            diesel::sql_query(
                r#"
                SELECT j.*
                FROM jobs j
                WHERE j.status = 'PENDING'
                  AND EXISTS (
                      SELECT 1
                      FROM job_dependencies d
                      JOIN jobs p ON p.id = d.depends_on_job_id
                      WHERE d.job_id = j.id
                        AND p.status IN ('DEAD', 'CANCELED')
                  )
                ORDER BY j.created_at ASC
                "#,
            )
            .load::<Job>(conn)
            .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }
}
