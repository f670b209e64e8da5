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

//! End-to-end scenarios: submit through the orchestrator facade, schedule
//! through the real claim path, execute on a live worker runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use conveyor::{
    BackoffPolicy, HandlerRegistry, JobStatus, JobSubmission, Orchestrator, OrchestratorConfig,
    WorkerConfig, WorkerRuntime,
};
use conveyor::queue::InMemoryJobQueue;
use conveyor::worker::register_builtin_handlers;

use crate::fixtures::{test_context, wait_for_status};

struct Harness {
    orchestrator: Orchestrator,
    loops: conveyor::ControlHandles,
    worker_shutdown: watch::Sender<bool>,
    worker_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(database_url: &str) -> Harness {
        let config = OrchestratorConfig::builder()
            .database_url(database_url)
            .database_name("")
            .scheduler_poll_interval(Duration::from_millis(50))
            .build()
            .expect("config");

        let queue = Arc::new(InMemoryJobQueue::new());
        let orchestrator = Orchestrator::with_queue(config, queue)
            .await
            .expect("orchestrator");
        let loops = orchestrator.start_control_loops();

        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry).expect("handlers");

        let worker_config = WorkerConfig {
            worker_id: "e2e-worker".to_string(),
            max_concurrent_jobs: 4,
            heartbeat_interval: Duration::from_secs(1),
            lease_poll_timeout: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(2),
            ..WorkerConfig::default()
        };
        let runtime = WorkerRuntime::new(
            orchestrator.dal().clone(),
            orchestrator.queue(),
            Arc::new(registry),
            worker_config,
        );

        let (worker_shutdown, shutdown_rx) = watch::channel(false);
        let worker_task = tokio::spawn(async move {
            if let Err(e) = runtime.run(shutdown_rx).await {
                panic!("worker runtime failed: {e}");
            }
        });

        Harness {
            orchestrator,
            loops,
            worker_shutdown,
            worker_task,
        }
    }

    async fn stop(self) {
        let _ = self.worker_shutdown.send(true);
        let _ = self.worker_task.await;
        self.loops.shutdown().await;
    }
}

#[tokio::test]
async fn echo_job_succeeds_with_its_payload_as_result() {
    let Some(ctx) = test_context().await else { return };
    let harness = Harness::start(&ctx.database_url).await;

    let job = harness
        .orchestrator
        .submit_job(JobSubmission::new("echo", "e2e-echo").payload(json!({"m": "hi"})))
        .await
        .unwrap();

    assert!(
        wait_for_status(&ctx.dal, job.id, JobStatus::Success, Duration::from_secs(10)).await
    );
    let done = harness.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(done.result, Some(json!({"m": "hi"})));
    assert_eq!(done.attempt, 0);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn always_failing_job_dies_after_its_attempt_budget() {
    let Some(ctx) = test_context().await else { return };
    let harness = Harness::start(&ctx.database_url).await;

    let job = harness
        .orchestrator
        .submit_job(
            JobSubmission::new("fail", "e2e-fail")
                .payload(json!({"message": "always broken"}))
                .max_attempts(3)
                .retry_policy(BackoffPolicy::Fixed)
                .base_delay(Duration::ZERO),
        )
        .await
        .unwrap();

    assert!(wait_for_status(&ctx.dal, job.id, JobStatus::Dead, Duration::from_secs(15)).await);

    let dead = harness.orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(dead.attempt, 3);
    assert_eq!(dead.error_message.as_deref(), Some("always broken"));

    let stats = harness.orchestrator.queue_stats().await.unwrap();
    assert_eq!(stats.dead, 1);
    let letters = harness.orchestrator.dead_letters().await.unwrap();
    assert_eq!(letters[0].job_id, job.id);

    harness.stop().await;
}

#[tokio::test]
async fn dependent_job_waits_for_its_predecessor() {
    let Some(ctx) = test_context().await else { return };
    let harness = Harness::start(&ctx.database_url).await;

    // Submit the dependent first; the edge still gates it.
    let b = harness
        .orchestrator
        .submit_job(JobSubmission::new("echo", "e2e-dep-b").payload(json!({"job": "b"})))
        .await
        .unwrap();
    let a = harness
        .orchestrator
        .submit_job(
            JobSubmission::new("sleep", "e2e-dep-a").payload(json!({"duration_ms": 200})),
        )
        .await
        .unwrap();
    harness.orchestrator.add_dependency(b.id, a.id).await.unwrap();

    assert!(wait_for_status(&ctx.dal, b.id, JobStatus::Success, Duration::from_secs(10)).await);

    let a_done = harness.orchestrator.get_job(a.id).await.unwrap();
    let b_done = harness.orchestrator.get_job(b.id).await.unwrap();
    assert_eq!(a_done.status, "SUCCESS");
    assert!(
        b_done.started_at.unwrap() >= a_done.completed_at.unwrap(),
        "the dependent must not start before its predecessor finishes"
    );

    harness.stop().await;
}

#[tokio::test]
async fn slow_handler_times_out_and_is_buried() {
    let Some(ctx) = test_context().await else { return };
    let harness = Harness::start(&ctx.database_url).await;

    let job = harness
        .orchestrator
        .submit_job(
            JobSubmission::new("sleep", "e2e-timeout")
                .payload(json!({"duration_ms": 30_000}))
                .timeout(Duration::from_secs(1))
                .max_attempts(1),
        )
        .await
        .unwrap();

    assert!(wait_for_status(&ctx.dal, job.id, JobStatus::Dead, Duration::from_secs(15)).await);

    let dead = harness.orchestrator.get_job(job.id).await.unwrap();
    assert!(
        dead.error_message.unwrap().contains("timed out"),
        "timeout must be recorded as the failure reason"
    );
    assert_eq!(
        dead.error_details.unwrap()["reason"],
        json!("TIMEOUT")
    );

    harness.stop().await;
}

#[tokio::test]
async fn purge_queue_delays_but_does_not_lose_jobs() {
    let Some(ctx) = test_context().await else { return };

    // No worker: jobs pile up in the broker.
    let config = OrchestratorConfig::builder()
        .database_url(&ctx.database_url)
        .database_name("")
        .scheduler_poll_interval(Duration::from_millis(50))
        .orphan_grace(Duration::from_millis(100))
        .monitor_tick(Duration::from_millis(100))
        .stale_after(Duration::from_millis(100))
        .build()
        .unwrap();
    let orchestrator = Orchestrator::with_queue(config, Arc::new(InMemoryJobQueue::new()))
        .await
        .unwrap();
    let loops = orchestrator.start_control_loops();

    let job = orchestrator
        .submit_job(JobSubmission::new("echo", "e2e-purge"))
        .await
        .unwrap();

    // Wait until the scheduler stages it, then purge the broker.
    let staged = async {
        loop {
            if orchestrator.queue_stats().await.unwrap().ready > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    assert!(tokio::time::timeout(Duration::from_secs(5), staged).await.is_ok());
    orchestrator.purge_queue().await.unwrap();
    assert_eq!(orchestrator.queue_stats().await.unwrap().ready, 0);

    // The store still owns the job; the orphan sweep re-pends it and the
    // scheduler stages it again.
    let restaged = async {
        loop {
            if orchestrator.queue_stats().await.unwrap().ready > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    assert!(
        tokio::time::timeout(Duration::from_secs(5), restaged).await.is_ok(),
        "a purged entry must be recovered through the orphan sweep"
    );
    let row = orchestrator.get_job(job.id).await.unwrap();
    assert_eq!(row.status, "SCHEDULED");

    loops.shutdown().await;
}
