/*
 *  Copyright 2025 The Conveyor Authors
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

//! Worker Model
//!
//! Row structs for the `workers` table. One row per live worker process;
//! liveness is judged from `last_heartbeat_at` against the stale
//! threshold. CPU/memory telemetry is stored but never drives control
//! decisions.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Worker lifecycle states, stored as `TEXT`.
pub const WORKER_ACTIVE: &str = "ACTIVE";
pub const WORKER_STALE: &str = "STALE";
pub const WORKER_STOPPED: &str = "STOPPED";

/// Represents a worker record in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::workers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Worker {
    /// Unique worker identifier (stable for a process lifetime)
    pub id: String,
    pub hostname: String,
    pub pid: i32,
    pub version: String,
    /// ACTIVE | STALE | STOPPED
    pub status: String,
    /// Size of the worker's local concurrency permit
    pub max_concurrent_jobs: i32,
    /// Monotonically increasing within a process lifetime
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub registered_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload for a worker process.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::database::schema::workers)]
pub struct NewWorker {
    pub id: String,
    pub hostname: String,
    pub pid: i32,
    pub version: String,
    pub status: String,
    pub max_concurrent_jobs: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Optional telemetry carried on a heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerTelemetry {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}
