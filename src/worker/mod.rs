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

//! Worker Runtime
//!
//! A worker registers itself, then runs three cooperating activities: a
//! heartbeat emitter, a lease loop bounded by a local concurrency
//! semaphore, and one execution task per leased job. The semaphore only
//! bounds resource use; correctness is enforced end to end by the
//! store's compare-and-set transitions; a worker that loses a CAS race
//! (reclaim, cancel) acks the lease and walks away.

pub mod handlers;
pub mod registry;

pub use handlers::{register_builtin_handlers, EchoHandler, FailHandler, SleepHandler};
pub use registry::{HandlerContext, HandlerError, HandlerRegistry, JobHandler};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dal::DAL;
use crate::error::OrchestratorError;
use crate::models::worker::{NewWorker, WorkerTelemetry, WORKER_ACTIVE};
use crate::queue::JobQueue;
use crate::retry::RetryDisposition;
use crate::util::with_backoff;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identifier for this process. Defaults to `worker-<uuid>`.
    pub worker_id: String,
    pub hostname: String,
    pub pid: i32,
    pub version: String,
    /// Local concurrency permit size.
    pub max_concurrent_jobs: usize,
    /// Heartbeat period T.
    pub heartbeat_interval: Duration,
    /// Broker poll timeout; bounds shutdown responsiveness.
    pub lease_poll_timeout: Duration,
    /// How long to wait for in-flight jobs on shutdown.
    pub shutdown_grace: Duration,
    /// Consecutive heartbeat failures before initiating shutdown.
    pub max_heartbeat_failures: u32,
    /// Base delay for heartbeat send retries.
    pub heartbeat_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id() as i32,
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_concurrent_jobs: 10,
            heartbeat_interval: Duration::from_secs(30),
            lease_poll_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            max_heartbeat_failures: 5,
            heartbeat_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Outcome of one handler invocation, before it is written back.
enum ExecOutcome {
    Success(Value),
    Failure { message: String, details: Value },
}

/// Pulls leases, executes handlers under timeout, and reports outcomes.
pub struct WorkerRuntime {
    dal: DAL,
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Clone for WorkerRuntime {
    fn clone(&self) -> Self {
        Self {
            dal: self.dal.clone(),
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl WorkerRuntime {
    pub fn new(
        dal: DAL,
        queue: Arc<dyn JobQueue>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            dal,
            queue,
            registry,
            config,
        }
    }

    /// Runs the worker until the shutdown watch flips (or repeated
    /// heartbeat failures force a stop).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        self.dal
            .worker()
            .register(NewWorker {
                id: self.config.worker_id.clone(),
                hostname: self.config.hostname.clone(),
                pid: self.config.pid,
                version: self.config.version.clone(),
                status: WORKER_ACTIVE.to_string(),
                max_concurrent_jobs: self.config.max_concurrent_jobs as i32,
                last_heartbeat_at: Some(Utc::now()),
            })
            .await?;

        info!(
            "Worker {} started (slots: {}, handlers: {:?})",
            self.config.worker_id,
            self.config.max_concurrent_jobs,
            self.registry.job_types()
        );

        // Internal halt flag: flipped by external shutdown or by the
        // heartbeat emitter giving up. Doubles as the handler cancel
        // signal.
        let (halt_tx, halt_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.dal.clone(),
            self.config.clone(),
            halt_tx.clone(),
            halt_rx.clone(),
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut halt_watch = halt_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = halt_tx.send(true);
                        break;
                    }
                }
                _ = halt_watch.changed() => {
                    if *halt_watch.borrow() {
                        break;
                    }
                }
                leased = self.queue.lease(self.config.lease_poll_timeout) => {
                    match leased {
                        Ok(Some(job_id)) => {
                            let permit = match semaphore.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let worker = self.clone();
                            let cancel = halt_rx.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = worker.execute(job_id, cancel).await {
                                    error!("Job {job_id} execution errored: {e}");
                                }
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Lease poll failed: {e}");
                            time::sleep(self.config.lease_poll_timeout).await;
                        }
                    }
                }
            }
        }

        self.drain(semaphore).await;
        heartbeat.abort();
        Ok(())
    }

    /// Waits for in-flight executions up to the shutdown grace. A clean
    /// drain deregisters; a dirty one leaves the row ACTIVE so the
    /// heartbeat monitor reclaims the stragglers once the heartbeat goes
    /// stale.
    async fn drain(&self, semaphore: Arc<Semaphore>) {
        info!(
            "Worker {} draining (grace: {:?})",
            self.config.worker_id, self.config.shutdown_grace
        );
        let all_permits = self.config.max_concurrent_jobs as u32;
        match time::timeout(
            self.config.shutdown_grace,
            semaphore.acquire_many_owned(all_permits),
        )
        .await
        {
            Ok(Ok(_permits)) => {
                if let Err(e) = self.dal.worker().deregister(&self.config.worker_id).await {
                    warn!("Failed to deregister worker {}: {e}", self.config.worker_id);
                } else {
                    info!("Worker {} stopped cleanly", self.config.worker_id);
                }
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    "Worker {} shutdown grace elapsed with jobs still running; \
                     leaving them to the heartbeat monitor",
                    self.config.worker_id
                );
            }
        }
    }

    /// Heartbeat emitter: sends `touch-worker-heartbeat` every interval,
    /// retrying with backoff; after enough consecutive failures the
    /// worker can no longer prove liveness and shuts down gracefully.
    async fn heartbeat_loop(
        dal: DAL,
        config: WorkerConfig,
        halt_tx: watch::Sender<bool>,
        mut halt_rx: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(config.heartbeat_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sent = with_backoff(3, config.heartbeat_retry_delay, "heartbeat", || {
                        let dal = dal.clone();
                        let worker_id = config.worker_id.clone();
                        async move {
                            dal.worker()
                                .heartbeat(&worker_id, WorkerTelemetry::default())
                                .await
                        }
                    })
                    .await;

                    match sent {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                "Heartbeat failed ({consecutive_failures}/{}): {e}",
                                config.max_heartbeat_failures
                            );
                            if consecutive_failures >= config.max_heartbeat_failures {
                                error!(
                                    "Worker {} lost contact with the store; initiating graceful shutdown",
                                    config.worker_id
                                );
                                let _ = halt_tx.send(true);
                                break;
                            }
                        }
                    }
                }
                _ = halt_rx.changed() => {
                    if *halt_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Executes one leased job end to end.
    async fn execute(
        &self,
        job_id: Uuid,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        // Re-read under the store, never trust broker-side state.
        let job = match self.dal.job().get_by_id(job_id).await {
            Ok(job) => job,
            Err(OrchestratorError::JobNotFound(_)) => {
                warn!("Leased job {job_id} no longer exists; acking");
                let _ = self.queue.ack(job_id).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // CAS SCHEDULED -> RUNNING. Losing this race (reclaim, cancel)
        // means another actor owns the job's fate now.
        let job = match self.dal.job().mark_running(job_id, &self.config.worker_id).await {
            Ok(job) => job,
            Err(OrchestratorError::StatusConflict { actual, .. }) => {
                debug!("Job {job_id} is {actual}, not SCHEDULED; abandoning lease");
                let _ = self.queue.ack(job_id).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let timeout = job.timeout();
        let outcome = match self.registry.get(&job.job_type) {
            None => ExecOutcome::Failure {
                message: format!("no handler registered for job type '{}'", job.job_type),
                details: json!({ "reason": "UNKNOWN_TYPE", "job_type": job.job_type }),
            },
            Some(handler) => {
                let deadline = Utc::now()
                    + chrono::Duration::milliseconds(
                        timeout.as_millis().min(i64::MAX as u128) as i64,
                    );
                let ctx = HandlerContext::new(deadline, cancel);
                info!(
                    "Executing job {} (type: {}, attempt: {})",
                    job.id, job.job_type, job.attempt
                );
                match time::timeout(timeout, handler.run(job.payload.clone(), ctx)).await {
                    Ok(Ok(result)) => ExecOutcome::Success(result),
                    Ok(Err(err)) => ExecOutcome::Failure {
                        details: json!({
                            "reason": "HANDLER_ERROR",
                            "detail": err.details,
                        }),
                        message: err.message,
                    },
                    Err(_) => ExecOutcome::Failure {
                        message: format!(
                            "job execution timed out after {}s",
                            job.timeout_secs
                        ),
                        details: json!({
                            "reason": "TIMEOUT",
                            "timeout_secs": job.timeout_secs,
                        }),
                    },
                }
            }
        };

        match outcome {
            ExecOutcome::Success(result) => {
                match self.dal.job().complete(job_id, result).await {
                    Ok(_) => info!("Job {job_id} succeeded"),
                    Err(OrchestratorError::StatusConflict { actual, .. }) => {
                        // A racing cancel or reclaim won; their state stands.
                        debug!("Job {job_id} became {actual} during execution; result dropped");
                    }
                    Err(e) => return Err(e),
                }
            }
            ExecOutcome::Failure { message, details } => {
                match self.dal.job().fail(job_id, &message, Some(details)).await {
                    Ok(_) => match self.dal.job().schedule_retry_or_bury(job_id).await {
                        Ok(RetryDisposition::Retry { .. }) => {}
                        Ok(RetryDisposition::Bury { .. }) => {
                            if let Err(e) = self.queue.send_to_dlq(job_id, &message).await {
                                warn!("Failed to stage dead-letter for job {job_id}: {e}");
                            }
                        }
                        Err(OrchestratorError::StatusConflict { actual, .. }) => {
                            debug!("Job {job_id} became {actual} before retry scheduling");
                        }
                        Err(e) => return Err(e),
                    },
                    Err(OrchestratorError::StatusConflict { actual, .. }) => {
                        debug!("Job {job_id} became {actual} during execution; failure dropped");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let _ = self.queue.ack(job_id).await;
        Ok(())
    }
}
