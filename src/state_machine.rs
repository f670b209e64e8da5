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

//! Job status state machine.
//!
//! Single source of truth for transition legality. The check itself is
//! pure; enforcement happens at the store through compare-and-set updates
//! filtered on the expected prior status, so two racing writers cannot
//! both succeed.
//!
//! ```text
//! PENDING    -> SCHEDULED, CANCELED
//! SCHEDULED  -> RUNNING, CANCELED, PENDING (reclaim)
//! RUNNING    -> SUCCESS, FAILED, CANCELED, PENDING (reclaim)
//! FAILED     -> RETRYING, DEAD
//! RETRYING   -> PENDING
//! SUCCESS, DEAD, CANCELED: terminal
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Status of a job row. Stored as `TEXT` in the jobs table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Success,
    Failed,
    Retrying,
    Dead,
    Canceled,
}

impl JobStatus {
    /// Column representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Dead => "DEAD",
            JobStatus::Canceled => "CANCELED",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Dead | JobStatus::Canceled
        )
    }

    /// Statuses in which a job is held by a worker or staged in the broker.
    /// `worker_id` is non-null exactly in these statuses.
    pub fn holds_worker(&self) -> bool {
        matches!(self, JobStatus::Scheduled | JobStatus::Running)
    }

    /// All statuses, in state-diagram order.
    pub fn all() -> [JobStatus; 8] {
        [
            JobStatus::Pending,
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::Dead,
            JobStatus::Canceled,
        ]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "RETRYING" => Ok(JobStatus::Retrying),
            "DEAD" => Ok(JobStatus::Dead),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(OrchestratorError::CorruptRow {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Legal next states for a given current state.
pub fn valid_transitions_from(from: JobStatus) -> &'static [JobStatus] {
    match from {
        JobStatus::Pending => &[JobStatus::Scheduled, JobStatus::Canceled],
        JobStatus::Scheduled => &[JobStatus::Running, JobStatus::Canceled, JobStatus::Pending],
        JobStatus::Running => &[
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Pending,
        ],
        JobStatus::Failed => &[JobStatus::Retrying, JobStatus::Dead],
        JobStatus::Retrying => &[JobStatus::Pending],
        JobStatus::Success | JobStatus::Dead | JobStatus::Canceled => &[],
    }
}

/// Whether `from -> to` is a legal transition.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions_from(from).contains(&to)
}

/// Validates `from -> to`, failing with `InvalidTransition` otherwise.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), OrchestratorError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition { from, to })
    }
}
