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

//! Heartbeat Monitor
//!
//! The crash-recovery loop. Each tick: mark workers with expired
//! heartbeats STALE, reclaim the jobs they held (a lost lease counts as a
//! failed attempt), sweep orphaned SCHEDULED jobs back to PENDING, and
//! purge long-stopped worker records. Safe to run in multiple instances:
//! reclamation and the sweep lock rows skip-locked, so concurrent
//! monitors divide the work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use crate::dal::DAL;
use crate::error::OrchestratorError;
use crate::queue::JobQueue;

/// Monitor loop configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick period T.
    pub tick: Duration,
    /// Heartbeats older than this mark a worker STALE (threshold H).
    pub stale_after: Duration,
    /// SCHEDULED jobs still carrying the broker sentinel after this long
    /// revert to PENDING. Defaults to 2 * tick.
    pub orphan_grace: Duration,
    /// STOPPED worker rows older than this are deleted.
    pub stopped_retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let tick = Duration::from_secs(30);
        Self {
            tick,
            stale_after: Duration::from_secs(90),
            orphan_grace: tick * 2,
            stopped_retention: Duration::from_secs(3600),
        }
    }
}

/// Summary of one monitor tick, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub stale_workers: usize,
    pub requeued_jobs: usize,
    pub buried_jobs: usize,
    pub orphans_swept: usize,
    pub workers_purged: usize,
}

/// Detects stale worker leases and reclaims their jobs.
pub struct HeartbeatMonitor {
    dal: DAL,
    queue: Arc<dyn JobQueue>,
    config: MonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(dal: DAL, queue: Arc<dyn JobQueue>, config: MonitorConfig) -> Self {
        Self { dal, queue, config }
    }

    /// Runs the monitor loop until the shutdown watch flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Heartbeat monitor started (tick: {:?}, stale after: {:?})",
            self.config.tick, self.config.stale_after
        );
        let mut interval = time::interval(self.config.tick);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) => {
                            if report != TickReport::default() {
                                info!(
                                    "Monitor tick: {} stale worker(s), {} requeued, {} buried, {} orphan(s), {} purged",
                                    report.stale_workers,
                                    report.requeued_jobs,
                                    report.buried_jobs,
                                    report.orphans_swept,
                                    report.workers_purged
                                );
                            }
                        }
                        Err(e) if e.is_transient() => warn!("Monitor tick failed: {e}"),
                        Err(e) => error!("Monitor tick failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat monitor stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One monitor pass.
    pub async fn run_once(&self) -> Result<TickReport, OrchestratorError> {
        let mut report = TickReport::default();
        let now = Utc::now();

        // (a) Stale detection.
        let stale_cutoff = now - chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let stale = self.dal.worker().mark_stale(stale_cutoff).await?;
        report.stale_workers = stale.len();

        // (b) Reclaim each stale worker's jobs in its own transaction.
        for worker in stale {
            let outcome = self.dal.job().reassign_worker_jobs(&worker.id).await?;
            report.requeued_jobs += outcome.requeued.len();
            report.buried_jobs += outcome.buried.len();

            if !outcome.requeued.is_empty() {
                warn!(
                    "Reclaimed {} job(s) from stale worker {}",
                    outcome.requeued.len(),
                    worker.id
                );
            }
            for job_id in outcome.buried {
                // DLQ staging is best-effort: the job row is already DEAD,
                // and the store stays authoritative if the broker is down.
                if let Err(e) = self
                    .queue
                    .send_to_dlq(job_id, "worker lease expired; retries exhausted")
                    .await
                {
                    warn!("Failed to stage dead-letter for job {job_id}: {e}");
                }
            }
        }

        // (c) Orphaned SCHEDULED jobs: committed but never staged, or the
        // broker lost the entry. No attempt is charged.
        let orphan_cutoff = now - chrono::Duration::from_std(self.config.orphan_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        report.orphans_swept = self.dal.job().sweep_orphaned(orphan_cutoff).await?.len();

        // (d) Drop long-stopped worker records.
        let purge_cutoff = now - chrono::Duration::from_std(self.config.stopped_retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        report.workers_purged = self.dal.worker().purge_stopped(purge_cutoff).await?;

        Ok(report)
    }
}
