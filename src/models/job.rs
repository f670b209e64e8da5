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

//! Job Model
//!
//! Row structs for the `jobs` table. A job is the unit of work in the
//! orchestrator: a persistent state machine with retry configuration,
//! optional workflow membership, and an idempotency key enforced unique
//! across all jobs ever submitted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::retry::{BackoffPolicy, RetrySchedule};
use crate::state_machine::JobStatus;

/// Represents a job record in the database.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Job {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Handler key resolved against the worker's registry
    pub job_type: String,
    /// Opaque payload handed to the handler
    pub payload: Value,
    /// Scheduling priority, 0-10, higher first
    pub priority: i32,
    /// Caller-supplied token, unique across all jobs ever submitted
    pub idempotency_key: String,
    /// Current status, a legal walk of the state machine
    pub status: String,
    /// Number of failed executions observed so far
    pub attempt: i32,
    /// Attempt budget; reaching it on failure buries the job
    pub max_attempts: i32,
    /// Backoff policy tag (FIXED | EXPONENTIAL | JITTER)
    pub retry_policy: String,
    /// Base backoff delay in seconds
    pub base_delay_secs: i64,
    /// Wall-clock execution timeout in seconds
    pub timeout_secs: i64,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    /// Owning worker while SCHEDULED/RUNNING (broker sentinel while staged)
    pub worker_id: Option<String>,
    /// Set on entry to RUNNING, cleared by reclamation
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly when the job enters a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent error message
    pub error_message: Option<String>,
    /// Structured error detail (reason tag, handler context)
    pub error_details: Option<Value>,
    /// Result blob returned by a successful handler
    pub result: Option<Value>,
    /// Owning workflow, if attached
    pub workflow_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Parses the stored status column.
    pub fn job_status(&self) -> Result<JobStatus, OrchestratorError> {
        self.status.parse()
    }

    /// Parses the stored retry policy tag.
    pub fn backoff_policy(&self) -> Result<BackoffPolicy, OrchestratorError> {
        self.retry_policy.parse()
    }

    /// Assembles the job's retry schedule from its row.
    pub fn retry_schedule(&self) -> Result<RetrySchedule, OrchestratorError> {
        Ok(RetrySchedule::new(
            self.backoff_policy()?,
            Duration::from_secs(self.base_delay_secs.max(0) as u64),
        ))
    }

    /// Per-job execution timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(0) as u64)
    }
}

/// Represents a new job to be inserted into the database.
///
/// Timestamps and the initial PENDING status come from column defaults.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::database::schema::jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub idempotency_key: String,
    pub max_attempts: i32,
    pub retry_policy: String,
    pub base_delay_secs: i64,
    pub timeout_secs: i64,
    pub scheduled_at: DateTime<Utc>,
    pub workflow_id: Option<Uuid>,
}
