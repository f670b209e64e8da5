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

//! Retry backoff policies.
//!
//! `next_delay(attempt)` takes the number of failures already observed and
//! returns how long to wait before the next execution. The disposition
//! between retrying and burying a job is decided by [`RetryDisposition`];
//! both the worker failure path and heartbeat reclamation use the same
//! rule, so `DEAD` always lands with `attempt == max_attempts`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Default cap on exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Backoff policy tag. Stored as `TEXT` on the job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffPolicy {
    /// Constant delay of `base_delay`.
    Fixed,
    /// `min(base_delay * 2^attempt, max_delay)`.
    Exponential,
    /// Capped exponential plus `uniform(0, 0.5 * capped)`.
    Jitter,
}

impl BackoffPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffPolicy::Fixed => "FIXED",
            BackoffPolicy::Exponential => "EXPONENTIAL",
            BackoffPolicy::Jitter => "JITTER",
        }
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffPolicy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIXED" => Ok(BackoffPolicy::Fixed),
            "EXPONENTIAL" => Ok(BackoffPolicy::Exponential),
            "JITTER" => Ok(BackoffPolicy::Jitter),
            other => Err(OrchestratorError::CorruptRow {
                field: "retry_policy",
                value: other.to_string(),
            }),
        }
    }
}

/// A job's retry configuration, assembled from its row.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub policy: BackoffPolicy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetrySchedule {
    pub fn new(policy: BackoffPolicy, base_delay: Duration) -> Self {
        Self {
            policy,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Delay before the attempt following `attempt` observed failures.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match self.policy {
            BackoffPolicy::Fixed => self.base_delay,
            BackoffPolicy::Exponential => self.capped_exponential(attempt),
            BackoffPolicy::Jitter => {
                let capped = self.capped_exponential(attempt);
                let jitter = rand::thread_rng().gen_range(0.0..=capped.as_secs_f64() * 0.5);
                capped + Duration::from_secs_f64(jitter)
            }
        }
    }

    fn capped_exponential(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Outcome of applying the retry rule after a failed execution or a
/// timeout-induced reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// The job goes back to PENDING with `attempt = new_attempt` and a
    /// `scheduled_at` this far in the future.
    Retry { new_attempt: i32, delay: Duration },
    /// Retries are exhausted: the job becomes DEAD with
    /// `attempt = new_attempt` and is staged to the dead-letter queue.
    Bury { new_attempt: i32 },
}

/// Applies the shared disposition rule: one increment per failed
/// execution, DEAD exactly when the incremented count reaches
/// `max_attempts`.
pub fn dispose(schedule: &RetrySchedule, attempt: i32, max_attempts: i32) -> RetryDisposition {
    let new_attempt = attempt.saturating_add(1);
    if new_attempt < max_attempts {
        RetryDisposition::Retry {
            new_attempt,
            delay: schedule.next_delay(attempt.max(0) as u32),
        }
    } else {
        RetryDisposition::Bury {
            new_attempt: new_attempt.min(max_attempts),
        }
    }
}
