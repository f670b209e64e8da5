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

//! Dependency Edge Model
//!
//! A directed edge `(job_id, depends_on_job_id)` in the job DAG. The graph
//! is kept acyclic by a reachability check inside the insert transaction.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a dependency edge in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::job_dependencies)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct JobDependency {
    pub job_id: Uuid,
    pub depends_on_job_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Represents a new dependency edge to be inserted.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::database::schema::job_dependencies)]
pub struct NewJobDependency {
    pub job_id: Uuid,
    pub depends_on_job_id: Uuid,
}
