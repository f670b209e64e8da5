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

//! Orchestrator facade.
//!
//! Wires config into the store and broker, validates boundary input, and
//! owns the background control loops (scheduler + heartbeat monitor).
//! This is the API an HTTP adapter calls; mapping errors to status codes
//! is the adapter's job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dal::DAL;
use crate::database::Database;
use crate::error::OrchestratorError;
use crate::models::job::{Job, NewJob};
use crate::models::worker::{NewWorker, Worker, WorkerTelemetry, WORKER_ACTIVE};
use crate::models::workflow::Workflow;
use crate::monitor::HeartbeatMonitor;
use crate::queue::{DeadLetter, InMemoryJobQueue, JobQueue, QueueStats, RedisJobQueue};
use crate::retry::BackoffPolicy;
use crate::scheduler::JobScheduler;
use crate::workflow::WorkflowStatusSummary;

/// Maximum job priority (inclusive).
pub const MAX_PRIORITY: i32 = 10;

/// A job submission, as accepted by `create-job`.
///
/// ```rust,ignore
/// let job = orchestrator
///     .submit_job(JobSubmission::new("email.send", "order-1234-confirmation")
///         .payload(json!({ "to": "a@example.com" }))
///         .priority(8))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub job_type: String,
    pub idempotency_key: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub timeout: Duration,
    pub retry_policy: BackoffPolicy,
    pub base_delay: Duration,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub workflow_id: Option<Uuid>,
}

impl JobSubmission {
    /// Creates a submission with the documented defaults: priority 5,
    /// three attempts, one hour timeout, exponential backoff from 60 s,
    /// scheduled immediately.
    pub fn new(job_type: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            idempotency_key: idempotency_key.into(),
            payload: Value::Object(Default::default()),
            priority: 5,
            max_attempts: 3,
            timeout: Duration::from_secs(3600),
            retry_policy: BackoffPolicy::Exponential,
            base_delay: Duration::from_secs(60),
            scheduled_at: None,
            workflow_id: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: BackoffPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Validates the submission and converts it to an insertable row.
    /// A `scheduled_at` in the past clamps to `now`, preserving the
    /// invariant that jobs are never scheduled before submission.
    fn into_new_job(self, now: DateTime<Utc>) -> Result<NewJob, OrchestratorError> {
        if self.job_type.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "job type must be non-empty".to_string(),
            ));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "idempotency key must be non-empty".to_string(),
            ));
        }
        if !(0..=MAX_PRIORITY).contains(&self.priority) {
            return Err(OrchestratorError::Validation(format!(
                "priority must be between 0 and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.max_attempts < 1 {
            return Err(OrchestratorError::Validation(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        if self.timeout.is_zero() {
            return Err(OrchestratorError::Validation(
                "timeout must be positive".to_string(),
            ));
        }

        Ok(NewJob {
            id: Uuid::new_v4(),
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            max_attempts: self.max_attempts,
            retry_policy: self.retry_policy.as_str().to_string(),
            base_delay_secs: self.base_delay.as_secs() as i64,
            timeout_secs: self.timeout.as_secs() as i64,
            scheduled_at: self.scheduled_at.map_or(now, |at| at.max(now)),
            workflow_id: self.workflow_id,
        })
    }
}

/// Handles to the background control loops.
pub struct ControlHandles {
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl ControlHandles {
    /// Signals both loops to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.scheduler.await;
        let _ = self.monitor.await;
    }
}

/// The orchestrator control plane.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    dal: DAL,
    queue: Arc<dyn JobQueue>,
}

impl Orchestrator {
    /// Connects to the store (running migrations) and to the broker
    /// named by the config: Redis when a URL is configured, the
    /// in-process broker otherwise.
    pub async fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let queue: Arc<dyn JobQueue> = match config.redis_url() {
            Some(url) => Arc::new(RedisJobQueue::connect(url).await?),
            None => Arc::new(InMemoryJobQueue::new()),
        };
        Self::with_queue(config, queue).await
    }

    /// Connects to the store with a caller-supplied broker.
    pub async fn with_queue(
        config: OrchestratorConfig,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self, OrchestratorError> {
        let database = Database::new(
            config.database_url(),
            config.database_name(),
            config.db_pool_size(),
        )?;
        database.run_migrations().await?;

        Ok(Self {
            config,
            dal: DAL::new(database),
            queue,
        })
    }

    /// The data access layer, for embedding runtimes in the same process.
    pub fn dal(&self) -> &DAL {
        &self.dal
    }

    /// The broker shared by this orchestrator.
    pub fn queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue)
    }

    /// Spawns the scheduler and heartbeat monitor loops.
    pub fn start_control_loops(&self) -> ControlHandles {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = JobScheduler::new(
            self.dal.clone(),
            Arc::clone(&self.queue),
            self.config.scheduler_config(),
        );
        let scheduler_shutdown = shutdown_rx.clone();
        let scheduler = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let monitor = HeartbeatMonitor::new(
            self.dal.clone(),
            Arc::clone(&self.queue),
            self.config.monitor_config(),
        );
        let monitor = tokio::spawn(async move { monitor.run(shutdown_rx).await });

        info!("Control loops started");
        ControlHandles {
            shutdown: shutdown_tx,
            scheduler,
            monitor,
        }
    }

    // ---- Job submission interface ----

    /// Creates a job. Fails with `DuplicateIdempotencyKey` when the key
    /// collides and `Validation` on bad input.
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<Job, OrchestratorError> {
        let new_job = submission.into_new_job(Utc::now())?;
        self.dal.job().create(new_job).await
    }

    /// Fetches a job by id.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        self.dal.job().get_by_id(job_id).await
    }

    /// Cancels a job. Legal from any non-terminal status; terminal jobs
    /// fail with `InvalidTransition`. A worker racing this cancel will
    /// observe a CAS conflict on its terminal write and ack out.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        self.dal.job().cancel(job_id).await
    }

    /// Declares that `job_id` must not run before `depends_on_job_id`
    /// has succeeded.
    pub async fn add_dependency(
        &self,
        job_id: Uuid,
        depends_on_job_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        self.dal.dependency().insert(job_id, depends_on_job_id).await
    }

    // ---- Workflow interface ----

    /// Creates a workflow. Fails with `DuplicateWorkflowName` on a name
    /// collision.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<String>,
        config: Option<Value>,
    ) -> Result<Workflow, OrchestratorError> {
        self.dal.workflow().create(name, description, config).await
    }

    /// Attaches a pre-existing job to a workflow.
    pub async fn attach_job_to_workflow(
        &self,
        workflow_id: Uuid,
        job_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        self.dal.workflow().attach_job(workflow_id, job_id).await
    }

    /// Derived workflow status with per-category counts.
    pub async fn workflow_status(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowStatusSummary, OrchestratorError> {
        self.dal.workflow().status(workflow_id).await
    }

    // ---- Worker-facing interface ----

    /// Registers a worker process.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        pid: i32,
        version: &str,
        max_concurrent_jobs: i32,
    ) -> Result<Worker, OrchestratorError> {
        if max_concurrent_jobs < 1 {
            return Err(OrchestratorError::Validation(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        self.dal
            .worker()
            .register(NewWorker {
                id: worker_id.to_string(),
                hostname: hostname.to_string(),
                pid,
                version: version.to_string(),
                status: WORKER_ACTIVE.to_string(),
                max_concurrent_jobs,
                last_heartbeat_at: Some(Utc::now()),
            })
            .await
    }

    /// Records a worker heartbeat with optional telemetry.
    pub async fn send_heartbeat(
        &self,
        worker_id: &str,
        telemetry: WorkerTelemetry,
    ) -> Result<(), OrchestratorError> {
        self.dal.worker().heartbeat(worker_id, telemetry).await
    }

    /// Workers currently considered alive.
    pub async fn list_active_workers(&self) -> Result<Vec<Worker>, OrchestratorError> {
        self.dal.worker().list_active().await
    }

    // ---- Queue inspection ----

    /// Ready and dead-letter lengths.
    pub async fn queue_stats(&self) -> Result<QueueStats, OrchestratorError> {
        Ok(self.queue.stats().await?)
    }

    /// Dead-letter records, for operator inspection.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, OrchestratorError> {
        Ok(self.queue.dead_letters().await?)
    }

    /// Operator-only: clears the broker's ready collection. Never
    /// touches the store; swept jobs are recovered by the orphan sweep.
    pub async fn purge_queue(&self) -> Result<(), OrchestratorError> {
        Ok(self.queue.purge().await?)
    }
}
