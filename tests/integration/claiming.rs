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

//! Concurrency and ordering tests for the skip-locked claim query.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Barrier;
use uuid::Uuid;

use conveyor::models::job::NewJob;
use conveyor::BROKER_WORKER_ID;

use crate::fixtures::test_context;

fn job_with(key: &str, priority: i32) -> NewJob {
    NewJob {
        id: Uuid::new_v4(),
        job_type: "echo".to_string(),
        payload: json!({}),
        priority,
        idempotency_key: key.to_string(),
        max_attempts: 3,
        retry_policy: "EXPONENTIAL".to_string(),
        base_delay_secs: 60,
        timeout_secs: 60,
        scheduled_at: Utc::now(),
        workflow_id: None,
    }
}

#[tokio::test]
async fn claim_follows_the_total_scheduling_order() {
    let Some(ctx) = test_context().await else { return };

    // Same priority resolves by submission order; higher priority wins
    // regardless of insertion order.
    let low_first = ctx.dal.job().create(job_with("low-1", 2)).await.unwrap();
    let high = ctx.dal.job().create(job_with("high", 9)).await.unwrap();
    let mid = ctx.dal.job().create(job_with("mid", 5)).await.unwrap();
    let low_second = ctx.dal.job().create(job_with("low-2", 2)).await.unwrap();

    let claimed = ctx.dal.job().claim_ready_jobs(10).await.unwrap();
    let order: Vec<Uuid> = claimed.iter().map(|c| c.id).collect();
    assert_eq!(order, vec![high.id, mid.id, low_first.id, low_second.id]);

    // Every claimed row is SCHEDULED under the broker sentinel.
    for id in order {
        let job = ctx.dal.job().get_by_id(id).await.unwrap();
        assert_eq!(job.status, "SCHEDULED");
        assert_eq!(job.worker_id.as_deref(), Some(BROKER_WORKER_ID));
    }
}

#[tokio::test]
async fn future_jobs_are_not_claimed() {
    let Some(ctx) = test_context().await else { return };

    let mut job = job_with("future", 5);
    job.scheduled_at = Utc::now() + chrono::Duration::hours(1);
    ctx.dal.job().create(job).await.unwrap();

    let claimed = ctx.dal.job().claim_ready_jobs(10).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn batch_limit_is_respected() {
    let Some(ctx) = test_context().await else { return };

    for i in 0..5 {
        ctx.dal
            .job()
            .create(job_with(&format!("batch-{i}"), 5))
            .await
            .unwrap();
    }

    let first = ctx.dal.job().claim_ready_jobs(2).await.unwrap();
    assert_eq!(first.len(), 2);
    let second = ctx.dal.job().claim_ready_jobs(10).await.unwrap();
    assert_eq!(second.len(), 3);
}

#[tokio::test]
async fn concurrent_claimers_never_claim_the_same_job() {
    let Some(ctx) = test_context().await else { return };

    const NUM_JOBS: usize = 20;
    const NUM_CLAIMERS: usize = 8;

    let mut created = HashSet::new();
    for i in 0..NUM_JOBS {
        let job = ctx
            .dal
            .job()
            .create(job_with(&format!("contended-{i}"), 5))
            .await
            .unwrap();
        created.insert(job.id);
    }

    let barrier = Arc::new(Barrier::new(NUM_CLAIMERS));
    let mut handles = Vec::new();
    for _ in 0..NUM_CLAIMERS {
        let dal = ctx.dal.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut claimed = Vec::new();
            for _ in 0..4 {
                let batch = dal.job().claim_ready_jobs(3).await.expect("claim failed");
                claimed.extend(batch.into_iter().map(|c| c.id));
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.expect("claimer panicked"));
    }

    let unique: HashSet<_> = all_claimed.iter().copied().collect();
    assert_eq!(
        all_claimed.len(),
        unique.len(),
        "a job was claimed by more than one scheduler instance"
    );
    assert_eq!(unique.len(), NUM_JOBS, "every ready job should be claimed");
    assert!(unique.is_subset(&created));
}
