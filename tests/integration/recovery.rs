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

//! Crash recovery: stale-worker reclamation and the orphan sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use conveyor::models::job::NewJob;
use conveyor::models::worker::NewWorker;
use conveyor::queue::InMemoryJobQueue;
use conveyor::{HeartbeatMonitor, JobQueue, MonitorConfig};

use crate::fixtures::test_context;

fn job(key: &str, max_attempts: i32) -> NewJob {
    NewJob {
        id: Uuid::new_v4(),
        job_type: "echo".to_string(),
        payload: json!({}),
        priority: 5,
        idempotency_key: key.to_string(),
        max_attempts,
        retry_policy: "FIXED".to_string(),
        base_delay_secs: 0,
        timeout_secs: 60,
        scheduled_at: Utc::now(),
        workflow_id: None,
    }
}

fn registration(id: &str) -> NewWorker {
    NewWorker {
        id: id.to_string(),
        hostname: "test-host".to_string(),
        pid: 4242,
        version: "0.2.0".to_string(),
        status: "ACTIVE".to_string(),
        max_concurrent_jobs: 4,
        last_heartbeat_at: Some(Utc::now()),
    }
}

fn aggressive_monitor_config() -> MonitorConfig {
    MonitorConfig {
        tick: Duration::from_millis(10),
        stale_after: Duration::from_millis(1),
        orphan_grace: Duration::from_secs(3600),
        stopped_retention: Duration::from_secs(3600),
    }
}

#[tokio::test]
async fn stale_worker_jobs_return_to_pending_with_attempt_charged() {
    let Some(ctx) = test_context().await else { return };
    let queue: Arc<InMemoryJobQueue> = Arc::new(InMemoryJobQueue::new());

    ctx.dal.worker().register(registration("w1")).await.unwrap();
    let created = ctx.dal.job().create(job("reclaim-me", 3)).await.unwrap();

    // Walk the job into RUNNING under w1, then let the heartbeat expire.
    ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    ctx.dal.job().mark_running(created.id, "w1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let monitor = HeartbeatMonitor::new(ctx.dal.clone(), queue.clone(), aggressive_monitor_config());
    let report = monitor.run_once().await.unwrap();
    assert_eq!(report.stale_workers, 1);
    assert_eq!(report.requeued_jobs, 1);
    assert_eq!(report.buried_jobs, 0);

    let reclaimed = ctx.dal.job().get_by_id(created.id).await.unwrap();
    assert_eq!(reclaimed.status, "PENDING");
    assert_eq!(reclaimed.attempt, 1, "a lost lease counts as a failed attempt");
    assert!(reclaimed.worker_id.is_none());
    assert!(reclaimed.started_at.is_none());

    // Idempotent: a second tick finds nothing to do.
    let report = monitor.run_once().await.unwrap();
    assert_eq!(report.stale_workers, 0);
    assert_eq!(report.requeued_jobs, 0);
}

#[tokio::test]
async fn reclamation_buries_jobs_with_exhausted_budgets() {
    let Some(ctx) = test_context().await else { return };
    let queue: Arc<InMemoryJobQueue> = Arc::new(InMemoryJobQueue::new());

    ctx.dal.worker().register(registration("w1")).await.unwrap();
    let created = ctx.dal.job().create(job("bury-me", 1)).await.unwrap();

    ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    ctx.dal.job().mark_running(created.id, "w1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let monitor = HeartbeatMonitor::new(ctx.dal.clone(), queue.clone(), aggressive_monitor_config());
    let report = monitor.run_once().await.unwrap();
    assert_eq!(report.buried_jobs, 1);

    let dead = ctx.dal.job().get_by_id(created.id).await.unwrap();
    assert_eq!(dead.status, "DEAD");
    assert_eq!(dead.attempt, dead.max_attempts);
    assert!(dead.completed_at.is_some());

    // The burial is visible in the dead-letter queue.
    let letters = queue.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id, created.id);
}

#[tokio::test]
async fn orphaned_scheduled_jobs_revert_without_attempt_increment() {
    let Some(ctx) = test_context().await else { return };
    let queue: Arc<InMemoryJobQueue> = Arc::new(InMemoryJobQueue::new());

    let created = ctx.dal.job().create(job("orphan", 3)).await.unwrap();

    // Claimed (SCHEDULED under the broker sentinel) but never staged:
    // the scheduler crashed between commit and enqueue.
    ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let config = MonitorConfig {
        orphan_grace: Duration::from_millis(1),
        stale_after: Duration::from_secs(3600),
        ..MonitorConfig::default()
    };
    let monitor = HeartbeatMonitor::new(ctx.dal.clone(), queue, config);
    let report = monitor.run_once().await.unwrap();
    assert_eq!(report.orphans_swept, 1);

    let swept = ctx.dal.job().get_by_id(created.id).await.unwrap();
    assert_eq!(swept.status, "PENDING");
    assert_eq!(swept.attempt, 0, "orphan sweeps never charge an attempt");
    assert!(swept.worker_id.is_none());

    // The job is claimable again.
    let claimed = ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, created.id);
}

#[tokio::test]
async fn worker_held_scheduled_jobs_are_not_swept_as_orphans() {
    let Some(ctx) = test_context().await else { return };
    let queue: Arc<InMemoryJobQueue> = Arc::new(InMemoryJobQueue::new());

    ctx.dal.worker().register(registration("w1")).await.unwrap();
    let created = ctx.dal.job().create(job("held", 3)).await.unwrap();
    ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    ctx.dal.job().mark_running(created.id, "w1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Orphan-only config: the fresh-heartbeat worker is not stale, and a
    // RUNNING job must never be treated as an orphan.
    let config = MonitorConfig {
        orphan_grace: Duration::from_millis(1),
        stale_after: Duration::from_secs(3600),
        ..MonitorConfig::default()
    };
    let monitor = HeartbeatMonitor::new(ctx.dal.clone(), queue, config);
    let report = monitor.run_once().await.unwrap();
    assert_eq!(report.orphans_swept, 0);
    assert_eq!(report.stale_workers, 0);

    let untouched = ctx.dal.job().get_by_id(created.id).await.unwrap();
    assert_eq!(untouched.status, "RUNNING");
}
