/*
 *  Copyright 2025 The Conveyor Authors
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

//! Worker registry operations.
//!
//! Registration is an upsert keyed on the worker id, so a restarting
//! process keeps a single row. Staleness is judged against
//! `last_heartbeat_at`; marking stale and reclaiming jobs are separate
//! steps so reclamation can run per worker in its own transaction.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use tracing::info;

use super::DAL;
use crate::database::schema::workers;
use crate::error::OrchestratorError;
use crate::models::worker::{
    NewWorker, Worker, WorkerTelemetry, WORKER_ACTIVE, WORKER_STALE, WORKER_STOPPED,
};

pub struct WorkerDAL<'a> {
    pub(super) dal: &'a DAL,
}

impl<'a> WorkerDAL<'a> {
    /// Registers a worker process, reviving any existing row with the
    /// same id. The fresh heartbeat keeps a re-registering worker out of
    /// the monitor's next stale scan.
    pub async fn register(&self, new_worker: NewWorker) -> Result<Worker, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let worker = conn
            .interact(move |conn| {
                let now = Utc::now();
                diesel::insert_into(workers::table)
                    .values(&new_worker)
                    .on_conflict(workers::id)
                    .do_update()
                    .set((
                        workers::hostname.eq(excluded(workers::hostname)),
                        workers::pid.eq(excluded(workers::pid)),
                        workers::version.eq(excluded(workers::version)),
                        workers::max_concurrent_jobs.eq(excluded(workers::max_concurrent_jobs)),
                        workers::status.eq(WORKER_ACTIVE),
                        workers::last_heartbeat_at.eq(Some(now)),
                        workers::stopped_at.eq(None::<DateTime<Utc>>),
                        workers::updated_at.eq(now),
                    ))
                    .get_result::<Worker>(conn)
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        info!(
            "Worker registered: {} (host: {}, pid: {}, slots: {})",
            worker.id, worker.hostname, worker.pid, worker.max_concurrent_jobs
        );
        Ok(worker)
    }

    /// Records a heartbeat and optional telemetry.
    ///
    /// A heartbeat from a STALE worker revives it to ACTIVE; `STOPPED`
    /// stays stopped. Telemetry is stored but never drives control
    /// decisions.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        telemetry: WorkerTelemetry,
    ) -> Result<(), OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let worker_id = worker_id.to_string();
        conn.interact(move |conn| {
            let now = Utc::now();
            let updated = diesel::update(
                workers::table
                    .filter(workers::id.eq(&worker_id))
                    .filter(workers::status.ne(WORKER_STOPPED)),
            )
            .set((
                workers::last_heartbeat_at.eq(Some(now)),
                workers::status.eq(WORKER_ACTIVE),
                workers::cpu_percent.eq(telemetry.cpu_percent),
                workers::memory_percent.eq(telemetry.memory_percent),
                workers::updated_at.eq(now),
            ))
            .execute(conn)?;

            if updated == 0 {
                Err(OrchestratorError::WorkerNotFound(worker_id))
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Lists workers currently considered alive.
    pub async fn list_active(&self) -> Result<Vec<Worker>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            workers::table
                .filter(workers::status.eq(WORKER_ACTIVE))
                .order(workers::registered_at.asc())
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Marks ACTIVE workers whose heartbeat predates `cutoff` as STALE
    /// and returns them for job reclamation. Workers that never
    /// heartbeated are judged from their registration time.
    pub async fn mark_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Worker>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let stale = conn
            .interact(move |conn| {
                diesel::update(
                    workers::table.filter(workers::status.eq(WORKER_ACTIVE)).filter(
                        workers::last_heartbeat_at
                            .lt(cutoff)
                            .or(workers::last_heartbeat_at
                                .is_null()
                                .and(workers::registered_at.lt(cutoff))
                                .nullable()),
                    ),
                )
                .set((
                    workers::status.eq(WORKER_STALE),
                    workers::updated_at.eq(Utc::now()),
                ))
                .get_results::<Worker>(conn)
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        for worker in &stale {
            info!(
                "Worker marked STALE: {} (last heartbeat: {:?})",
                worker.id, worker.last_heartbeat_at
            );
        }
        Ok(stale)
    }

    /// Marks a worker STOPPED (clean shutdown).
    pub async fn deregister(&self, worker_id: &str) -> Result<(), OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let worker_id = worker_id.to_string();
        conn.interact(move |conn| {
            let now = Utc::now();
            let updated = diesel::update(workers::table.filter(workers::id.eq(&worker_id)))
                .set((
                    workers::status.eq(WORKER_STOPPED),
                    workers::stopped_at.eq(Some(now)),
                    workers::updated_at.eq(now),
                ))
                .execute(conn)?;

            if updated == 0 {
                Err(OrchestratorError::WorkerNotFound(worker_id))
            } else {
                info!("Worker deregistered: {worker_id}");
                Ok(())
            }
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Deletes worker rows that have been STOPPED since before `cutoff`.
    pub async fn purge_stopped(&self, cutoff: DateTime<Utc>) -> Result<usize, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let purged = conn
            .interact(move |conn| {
                diesel::delete(
                    workers::table
                        .filter(workers::status.eq(WORKER_STOPPED))
                        .filter(workers::stopped_at.lt(cutoff)),
                )
                .execute(conn)
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        if purged > 0 {
            info!("Purged {purged} stopped worker record(s)");
        }
        Ok(purged)
    }
}
