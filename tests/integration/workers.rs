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

//! Worker registry: registration, heartbeats, staleness, cleanup.

use chrono::Utc;

use conveyor::models::worker::NewWorker;
use conveyor::{OrchestratorError, WorkerTelemetry};

use crate::fixtures::test_context;

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

#[tokio::test]
async fn registration_is_an_upsert_per_process() {
    let Some(ctx) = test_context().await else { return };

    ctx.dal.worker().register(registration("w1")).await.unwrap();

    // A restart re-registers under the same id with new details.
    let mut restarted = registration("w1");
    restarted.pid = 4343;
    let worker = ctx.dal.worker().register(restarted).await.unwrap();
    assert_eq!(worker.pid, 4343);
    assert_eq!(worker.status, "ACTIVE");

    let active = ctx.dal.worker().list_active().await.unwrap();
    assert_eq!(active.len(), 1, "one row per live process");
}

#[tokio::test]
async fn heartbeat_updates_timestamp_and_telemetry() {
    let Some(ctx) = test_context().await else { return };

    let worker = ctx.dal.worker().register(registration("w1")).await.unwrap();
    let first_beat = worker.last_heartbeat_at.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    ctx.dal
        .worker()
        .heartbeat(
            "w1",
            WorkerTelemetry {
                cpu_percent: Some(12.5),
                memory_percent: Some(40.0),
            },
        )
        .await
        .unwrap();

    let active = ctx.dal.worker().list_active().await.unwrap();
    let beat = active[0].last_heartbeat_at.unwrap();
    assert!(beat > first_beat, "heartbeat must monotonically increase");
    assert_eq!(active[0].cpu_percent, Some(12.5));

    let err = ctx
        .dal
        .worker()
        .heartbeat("ghost", WorkerTelemetry::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkerNotFound(_)));
}

#[tokio::test]
async fn stale_marking_targets_only_expired_heartbeats() {
    let Some(ctx) = test_context().await else { return };

    ctx.dal.worker().register(registration("fresh")).await.unwrap();
    ctx.dal.worker().register(registration("expired")).await.unwrap();

    // Only "expired" has a heartbeat older than the cutoff.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let cutoff = Utc::now();
    ctx.dal
        .worker()
        .heartbeat("fresh", WorkerTelemetry::default())
        .await
        .unwrap();

    let stale = ctx.dal.worker().mark_stale(cutoff).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, "expired");
    assert_eq!(stale[0].status, "STALE");

    // A returning heartbeat revives the stale worker.
    ctx.dal
        .worker()
        .heartbeat("expired", WorkerTelemetry::default())
        .await
        .unwrap();
    assert_eq!(ctx.dal.worker().list_active().await.unwrap().len(), 2);
}

#[tokio::test]
async fn stopped_workers_are_purged_after_retention() {
    let Some(ctx) = test_context().await else { return };

    ctx.dal.worker().register(registration("done")).await.unwrap();
    ctx.dal.worker().deregister("done").await.unwrap();

    // Not yet past retention.
    let purged = ctx
        .dal
        .worker()
        .purge_stopped(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(purged, 0);

    // Past retention: the row goes away.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let purged = ctx.dal.worker().purge_stopped(Utc::now()).await.unwrap();
    assert_eq!(purged, 1);

    let err = ctx
        .dal
        .worker()
        .heartbeat("done", WorkerTelemetry::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkerNotFound(_)));
}
