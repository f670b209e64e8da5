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

//! Derived workflow status.
//!
//! A workflow's status is never stored; it is computed from the multiset
//! of its jobs' statuses on read. This avoids write amplification on every
//! job transition.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::JobStatus;

/// Aggregate status of a workflow, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Every job is SUCCESS (CANCELED jobs are tolerated alongside).
    Completed,
    /// At least one job is DEAD.
    Failed,
    /// At least one job is SCHEDULED, RUNNING, or RETRYING.
    Running,
    /// Nothing is running yet and nothing has finished the workflow.
    Pending,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Pending => "PENDING",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category job counts plus the derived status, returned by
/// `get-workflow-status` for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatusSummary {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub total_jobs: i64,
    pub succeeded_jobs: i64,
    pub dead_jobs: i64,
    pub canceled_jobs: i64,
    pub running_jobs: i64,
    pub pending_jobs: i64,
}

/// Derives the workflow status from `(status, count)` pairs.
///
/// Precedence: FAILED (any DEAD) beats RUNNING beats COMPLETED beats
/// PENDING. CANCELED jobs are terminal non-success: they never mark the
/// workflow FAILED, and a non-empty workflow holding only SUCCESS and
/// CANCELED jobs is COMPLETED.
pub fn derive_status(counts: &[(JobStatus, i64)]) -> WorkflowStatus {
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let count = |s: JobStatus| -> i64 {
        counts
            .iter()
            .filter(|(status, _)| *status == s)
            .map(|(_, n)| n)
            .sum()
    };

    let dead = count(JobStatus::Dead);
    let in_flight = count(JobStatus::Scheduled) + count(JobStatus::Running) + count(JobStatus::Retrying);
    let succeeded = count(JobStatus::Success);
    let canceled = count(JobStatus::Canceled);

    if dead > 0 {
        WorkflowStatus::Failed
    } else if in_flight > 0 {
        WorkflowStatus::Running
    } else if total > 0 && succeeded + canceled == total && succeeded > 0 {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::Pending
    }
}
