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

//! Error types surfaced by the orchestrator.
//!
//! Contract violations (bad input, illegal transitions, duplicate keys) are
//! distinct variants so the HTTP adapter can map them without string
//! matching. Database constraint violations are translated into domain
//! errors before they leave the DAL; callers never see raw constraint
//! names.

use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::JobStatus;

/// Errors produced by store-backed orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No job row exists for the given identifier.
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// No workflow row exists for the given identifier.
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// No worker row exists for the given identifier.
    #[error("worker '{0}' not found")]
    WorkerNotFound(String),

    /// A job with this idempotency key has already been submitted.
    #[error("job with idempotency key '{0}' already exists")]
    DuplicateIdempotencyKey(String),

    /// A workflow with this name already exists.
    #[error("workflow with name '{0}' already exists")]
    DuplicateWorkflowName(String),

    /// The requested status transition is not in the legal transition graph.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A compare-and-set update found the row in a different status than
    /// expected. The caller lost a race and must re-read or abandon.
    #[error("status conflict: expected {expected}, found {actual}")]
    StatusConflict {
        expected: JobStatus,
        actual: String,
    },

    /// Input failed validation before reaching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Inserting the edge would make the dependency graph cyclic.
    #[error("dependency edge {job_id} -> {depends_on_job_id} would introduce a cycle")]
    DependencyCycle {
        job_id: Uuid,
        depends_on_job_id: Uuid,
    },

    /// A stored status or policy tag could not be parsed. Indicates a row
    /// written outside the orchestrator.
    #[error("unrecognized {field} value '{value}'")]
    CorruptRow { field: &'static str, value: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("database connection pool error: {0}")]
    ConnectionPool(String),

    #[error("migration error: {0}")]
    Migration(String),

    /// The store or broker stayed unreachable past the retry deadline.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl OrchestratorError {
    /// True when the error indicates a transient infrastructure fault that
    /// a background loop should retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Database(_)
                | OrchestratorError::ConnectionPool(_)
                | OrchestratorError::Queue(_)
                | OrchestratorError::Unavailable(_)
        )
    }
}

/// Errors produced by the queue/lease broker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("broker serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Command(e.to_string())
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Errors raised while registering job handlers at startup.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("handler for job type '{0}' already registered")]
    DuplicateHandler(String),
}
