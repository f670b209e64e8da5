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

//! Workflow lifecycle and derived status.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use conveyor::models::job::NewJob;
use conveyor::{OrchestratorError, WorkflowStatus};

use crate::fixtures::test_context;

fn job(key: &str) -> NewJob {
    NewJob {
        id: Uuid::new_v4(),
        job_type: "echo".to_string(),
        payload: json!({}),
        priority: 5,
        idempotency_key: key.to_string(),
        max_attempts: 1,
        retry_policy: "FIXED".to_string(),
        base_delay_secs: 0,
        timeout_secs: 60,
        scheduled_at: Utc::now(),
        workflow_id: None,
    }
}

#[tokio::test]
async fn workflow_names_are_unique() {
    let Some(ctx) = test_context().await else { return };

    ctx.dal
        .workflow()
        .create("nightly-etl", Some("nightly batch".to_string()), None)
        .await
        .unwrap();

    let err = ctx
        .dal
        .workflow()
        .create("nightly-etl", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::DuplicateWorkflowName(name) if name == "nightly-etl"
    ));

    let err = ctx.dal.workflow().create("  ", None, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn attach_requires_both_sides_to_exist() {
    let Some(ctx) = test_context().await else { return };

    let workflow = ctx.dal.workflow().create("wf", None, None).await.unwrap();
    let job_row = ctx.dal.job().create(job("wf-job")).await.unwrap();

    ctx.dal
        .workflow()
        .attach_job(workflow.id, job_row.id)
        .await
        .unwrap();
    let jobs = ctx.dal.job().list_for_workflow(workflow.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].workflow_id, Some(workflow.id));

    let ghost = Uuid::new_v4();
    let err = ctx
        .dal
        .workflow()
        .attach_job(workflow.id, ghost)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::JobNotFound(_)));

    let err = ctx
        .dal
        .workflow()
        .attach_job(ghost, job_row.id)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkflowNotFound(_)));
}

#[tokio::test]
async fn derived_status_tracks_job_progress() {
    let Some(ctx) = test_context().await else { return };

    let workflow = ctx.dal.workflow().create("pipeline", None, None).await.unwrap();
    let a = ctx.dal.job().create(job("pipe-a")).await.unwrap();
    let b = ctx.dal.job().create(job("pipe-b")).await.unwrap();
    ctx.dal.workflow().attach_job(workflow.id, a.id).await.unwrap();
    ctx.dal.workflow().attach_job(workflow.id, b.id).await.unwrap();

    let summary = ctx.dal.workflow().status(workflow.id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Pending);
    assert_eq!(summary.total_jobs, 2);
    assert_eq!(summary.pending_jobs, 2);

    // One job starts running: the workflow is RUNNING.
    let claimed = ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let summary = ctx.dal.workflow().status(workflow.id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Running);
    assert_eq!(summary.running_jobs, 1);

    // Finish the first; cancel the second: SUCCESS + CANCELED completes.
    let first = claimed[0].id;
    ctx.dal.job().mark_running(first, "w1").await.unwrap();
    ctx.dal.job().complete(first, json!({})).await.unwrap();
    let second = if first == a.id { b.id } else { a.id };
    ctx.dal.job().cancel(second).await.unwrap();

    let summary = ctx.dal.workflow().status(workflow.id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert_eq!(summary.succeeded_jobs, 1);
    assert_eq!(summary.canceled_jobs, 1);
    assert_eq!(summary.dead_jobs, 0);
}

#[tokio::test]
async fn a_dead_job_fails_the_workflow() {
    let Some(ctx) = test_context().await else { return };

    let workflow = ctx.dal.workflow().create("doomed", None, None).await.unwrap();
    let a = ctx.dal.job().create(job("doomed-a")).await.unwrap();
    ctx.dal.workflow().attach_job(workflow.id, a.id).await.unwrap();

    // max_attempts = 1: a single failure buries the job.
    ctx.dal.job().claim_ready_jobs(1).await.unwrap();
    ctx.dal.job().mark_running(a.id, "w1").await.unwrap();
    ctx.dal.job().fail(a.id, "boom", None).await.unwrap();
    ctx.dal.job().schedule_retry_or_bury(a.id).await.unwrap();

    let summary = ctx.dal.workflow().status(workflow.id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Failed);
    assert_eq!(summary.dead_jobs, 1);
}

#[tokio::test]
async fn delete_refuses_while_jobs_are_live() {
    let Some(ctx) = test_context().await else { return };

    let workflow = ctx.dal.workflow().create("short-lived", None, None).await.unwrap();
    let a = ctx.dal.job().create(job("short-a")).await.unwrap();
    ctx.dal.workflow().attach_job(workflow.id, a.id).await.unwrap();

    let err = ctx.dal.workflow().delete(workflow.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    ctx.dal.job().cancel(a.id).await.unwrap();
    ctx.dal.workflow().delete(workflow.id).await.unwrap();

    let err = ctx.dal.workflow().get_by_id(workflow.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::WorkflowNotFound(_)));

    // The terminal job survives, detached.
    let a_row = ctx.dal.job().get_by_id(a.id).await.unwrap();
    assert_eq!(a_row.workflow_id, None);
}
