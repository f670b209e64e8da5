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

//! Workflow Model
//!
//! Row structs for the `workflows` table. A workflow is a named container
//! for a DAG of jobs; its status is derived from its jobs, never stored.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Represents a workflow record in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::workflows)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Workflow {
    pub id: Uuid,
    /// Unique, non-empty workflow name
    pub name: String,
    pub description: Option<String>,
    /// Opaque configuration blob
    pub config: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Represents a new workflow to be inserted into the database.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::database::schema::workflows)]
pub struct NewWorkflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub config: Option<Value>,
}
