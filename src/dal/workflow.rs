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

//! Workflow operations.
//!
//! Workflows are containers: they are created explicitly, mutated only by
//! attaching pre-existing jobs, and their status is derived from their
//! jobs on read.

use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::DAL;
use crate::database::schema::{jobs, workflows};
use crate::error::OrchestratorError;
use crate::models::workflow::{NewWorkflow, Workflow};
use crate::state_machine::JobStatus;
use crate::workflow::{derive_status, WorkflowStatusSummary};

pub struct WorkflowDAL<'a> {
    pub(super) dal: &'a DAL,
}

impl<'a> WorkflowDAL<'a> {
    /// Creates a workflow. The name unique index resolves concurrent
    /// creates: the loser gets `DuplicateWorkflowName`.
    pub async fn create(
        &self,
        name: &str,
        description: Option<String>,
        config: Option<Value>,
    ) -> Result<Workflow, OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "workflow name must be non-empty".to_string(),
            ));
        }

        let conn = self.dal.database.get().await?;
        let new_workflow = NewWorkflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description,
            config,
        };
        let name = name.to_string();

        let workflow = conn
            .interact(move |conn| {
                match diesel::insert_into(workflows::table)
                    .values(&new_workflow)
                    .get_result::<Workflow>(conn)
                {
                    Err(diesel::result::Error::DatabaseError(
                        DatabaseErrorKind::UniqueViolation,
                        ref i,
                    )) if i.constraint_name() == Some("workflows_name_key") => {
                        Err(OrchestratorError::DuplicateWorkflowName(name))
                    }
                    other => other.map_err(Into::into),
                }
            })
            .await
            .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        info!("Workflow created: {} ({})", workflow.name, workflow.id);
        Ok(workflow)
    }

    /// Fetches a workflow by id.
    pub async fn get_by_id(&self, workflow_id: Uuid) -> Result<Workflow, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            workflows::table
                .find(workflow_id)
                .first::<Workflow>(conn)
                .optional()?
                .ok_or(OrchestratorError::WorkflowNotFound(workflow_id))
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Looks a workflow up by its unique name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Workflow>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let name = name.to_string();
        conn.interact(move |conn| {
            workflows::table
                .filter(workflows::name.eq(name))
                .first::<Workflow>(conn)
                .optional()
                .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Attaches a pre-existing job to a workflow.
    pub async fn attach_job(
        &self,
        workflow_id: Uuid,
        job_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            conn.transaction::<(), OrchestratorError, _>(|conn| {
                let workflow_exists: Option<Uuid> = workflows::table
                    .find(workflow_id)
                    .select(workflows::id)
                    .first(conn)
                    .optional()?;
                if workflow_exists.is_none() {
                    return Err(OrchestratorError::WorkflowNotFound(workflow_id));
                }

                let updated = diesel::update(jobs::table.find(job_id))
                    .set((
                        jobs::workflow_id.eq(Some(workflow_id)),
                        jobs::updated_at.eq(chrono::Utc::now()),
                    ))
                    .execute(conn)?;
                if updated == 0 {
                    return Err(OrchestratorError::JobNotFound(job_id));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        info!("Job {job_id} attached to workflow {workflow_id}");
        Ok(())
    }

    /// Derived status plus per-category counts for observability.
    pub async fn status(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowStatusSummary, OrchestratorError> {
        let workflow = self.get_by_id(workflow_id).await?;
        let counts = self.dal.job().status_counts_for_workflow(workflow_id).await?;

        let count = |s: JobStatus| -> i64 {
            counts
                .iter()
                .filter(|(status, _)| *status == s)
                .map(|(_, n)| n)
                .sum()
        };

        Ok(WorkflowStatusSummary {
            workflow_id: workflow.id,
            workflow_name: workflow.name,
            status: derive_status(&counts),
            total_jobs: counts.iter().map(|(_, n)| n).sum(),
            succeeded_jobs: count(JobStatus::Success),
            dead_jobs: count(JobStatus::Dead),
            canceled_jobs: count(JobStatus::Canceled),
            running_jobs: count(JobStatus::Scheduled)
                + count(JobStatus::Running)
                + count(JobStatus::Retrying),
            pending_jobs: count(JobStatus::Pending) + count(JobStatus::Failed),
        })
    }

    /// Lists workflows, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Workflow>, OrchestratorError> {
        let conn = self.dal.database.get().await?;
        let limit = limit as i64;
        conn.interact(move |conn| {
            workflows::table
                .order(workflows::created_at.desc())
                .limit(limit)
                .load(conn)
                .map_err(Into::into)
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))?
    }

    /// Deletes a workflow. Refused while the workflow still holds
    /// non-terminal jobs; terminal jobs are detached, not deleted.
    pub async fn delete(&self, workflow_id: Uuid) -> Result<(), OrchestratorError> {
        let conn = self.dal.database.get().await?;
        conn.interact(move |conn| {
            conn.transaction::<(), OrchestratorError, _>(|conn| {
                let live: i64 = jobs::table
                    .filter(jobs::workflow_id.eq(workflow_id))
                    .filter(jobs::status.ne_all([
                        JobStatus::Success.as_str(),
                        JobStatus::Dead.as_str(),
                        JobStatus::Canceled.as_str(),
                    ]))
                    .count()
                    .get_result(conn)?;
                if live > 0 {
                    return Err(OrchestratorError::Validation(format!(
                        "workflow {workflow_id} still holds {live} non-terminal job(s)"
                    )));
                }

                diesel::update(jobs::table.filter(jobs::workflow_id.eq(workflow_id)))
                    .set(jobs::workflow_id.eq(None::<Uuid>))
                    .execute(conn)?;

                let deleted = diesel::delete(workflows::table.find(workflow_id)).execute(conn)?;
                if deleted == 0 {
                    return Err(OrchestratorError::WorkflowNotFound(workflow_id));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| OrchestratorError::ConnectionPool(e.to_string()))??;

        info!("Workflow deleted: {workflow_id}");
        Ok(())
    }
}
