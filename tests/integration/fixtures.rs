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

//! Shared test fixture: a pooled connection to the test database with
//! tables truncated per test, serialized behind a process-wide lock so
//! tests cannot see each other's rows.

use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use conveyor::dal::DAL;
use conveyor::{Database, JobStatus};

static DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

#[allow(dead_code)]
pub struct TestContext {
    pub dal: DAL,
    pub database: Database,
    pub database_url: String,
    _guard: MutexGuard<'static, ()>,
}

/// Connects to the test database, runs migrations, and truncates all
/// orchestrator tables. Returns `None` (after printing a notice) when
/// `CONVEYOR_TEST_DATABASE_URL` is unset.
pub async fn test_context() -> Option<TestContext> {
    let url = match std::env::var("CONVEYOR_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: CONVEYOR_TEST_DATABASE_URL not set");
            return None;
        }
    };

    let guard = DB_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    conveyor::init_logging(None);

    let database = Database::new(&url, "", 5).expect("failed to build test pool");
    database
        .run_migrations()
        .await
        .expect("failed to run migrations");

    let conn = database.get().await.expect("failed to get connection");
    conn.interact(|conn| {
        diesel::sql_query("TRUNCATE job_dependencies, jobs, workflows, workers CASCADE")
            .execute(conn)
    })
    .await
    .expect("interact failed")
    .expect("failed to truncate tables");

    Some(TestContext {
        dal: DAL::new(database.clone()),
        database,
        database_url: url,
        _guard: guard,
    })
}

/// Polls a job until it reaches `status` or the deadline passes.
pub async fn wait_for_status(
    dal: &DAL,
    job_id: Uuid,
    status: JobStatus,
    deadline: Duration,
) -> bool {
    let started = Utc::now();
    loop {
        let job = dal.job().get_by_id(job_id).await.expect("job vanished");
        if job.status == status.as_str() {
            return true;
        }
        if (Utc::now() - started).num_milliseconds() as u128 > deadline.as_millis() {
            eprintln!(
                "timed out waiting for job {job_id} to reach {status}; currently {}",
                job.status
            );
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
