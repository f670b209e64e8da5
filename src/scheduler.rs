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

//! Job Scheduler
//!
//! Periodically claims ready jobs and hands them to the broker. Any
//! number of identical instances may run: the claim statement takes
//! exclusive row locks with skip-locked semantics, so concurrent
//! schedulers partition the ready set instead of contending on it.
//!
//! Handoff ordering matters: the SCHEDULED flip commits *before* the
//! broker enqueue. If the enqueue then fails past its retry budget, the
//! job is left SCHEDULED under the broker sentinel and the heartbeat
//! monitor's orphan sweep returns it to PENDING after the grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::dal::DAL;
use crate::error::OrchestratorError;
use crate::queue::JobQueue;
use crate::util::with_backoff;

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to look for ready jobs.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per transaction.
    pub batch_size: usize,
    /// Retries for a failing broker enqueue before deferring to the
    /// orphan sweep.
    pub enqueue_retries: u32,
    /// Base delay between enqueue retries.
    pub enqueue_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            enqueue_retries: 3,
            enqueue_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Claims ready jobs in total scheduling order and emits them to the
/// broker.
pub struct JobScheduler {
    dal: DAL,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(dal: DAL, queue: Arc<dyn JobQueue>, config: SchedulerConfig) -> Self {
        Self { dal, queue, config }
    }

    /// Runs the scheduling loop until the shutdown watch flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started (poll: {:?}, batch: {})",
            self.config.poll_interval, self.config.batch_size
        );
        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        // Transient store/broker faults are retried on the
                        // next tick; anything else is a bug worth a loud log.
                        if e.is_transient() {
                            warn!("Scheduler pass failed: {e}");
                        } else {
                            error!("Scheduler pass failed: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One scheduling pass: claim up to `batch_size` ready jobs, then
    /// stage each claimed id onto the broker. Returns how many jobs were
    /// claimed.
    pub async fn run_once(&self) -> Result<usize, OrchestratorError> {
        let claimed = self.dal.job().claim_ready_jobs(self.config.batch_size).await?;
        if claimed.is_empty() {
            debug!("No ready jobs found");
            return Ok(0);
        }

        let count = claimed.len();
        for job in claimed {
            let enqueue = with_backoff(
                self.config.enqueue_retries,
                self.config.enqueue_retry_delay,
                "broker enqueue",
                || self.queue.enqueue(job.id, job.priority),
            )
            .await;

            match enqueue {
                Ok(()) => debug!("Job {} staged at priority {}", job.id, job.priority),
                Err(e) => {
                    // Job stays SCHEDULED; the orphan sweep will recover it.
                    warn!(
                        "Failed to stage job {} after {} attempts: {e}; leaving for orphan sweep",
                        job.id, self.config.enqueue_retries
                    );
                }
            }
        }

        Ok(count)
    }
}
