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

//! Data Access Layer for the durable store.
//!
//! The DAL is the single serialization point for every mutation: all
//! status changes are compare-and-set updates filtered on the expected
//! prior status, and every batch claim takes row-level exclusive locks
//! with skip-locked semantics so concurrent instances make progress on
//! disjoint rows.

pub mod dependency;
pub mod job;
pub mod worker;
pub mod workflow;

pub use dependency::DependencyDAL;
pub use job::{ClaimedJob, JobDAL, ReassignOutcome, BROKER_WORKER_ID};
pub use worker::WorkerDAL;
pub use workflow::WorkflowDAL;

use crate::database::Database;

/// Data Access Layer facade.
///
/// Cheap to clone; sub-DALs borrow it per call:
///
/// ```rust,ignore
/// let dal = DAL::new(database);
/// let job = dal.job().get_by_id(job_id).await?;
/// ```
#[derive(Debug, Clone)]
pub struct DAL {
    pub(crate) database: Database,
}

impl DAL {
    /// Creates a new DAL over a connection pool.
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Access to job operations.
    pub fn job(&self) -> JobDAL<'_> {
        JobDAL { dal: self }
    }

    /// Access to dependency-edge operations and the readiness resolver.
    pub fn dependency(&self) -> DependencyDAL<'_> {
        DependencyDAL { dal: self }
    }

    /// Access to workflow operations.
    pub fn workflow(&self) -> WorkflowDAL<'_> {
        WorkflowDAL { dal: self }
    }

    /// Access to worker-registry operations.
    pub fn worker(&self) -> WorkerDAL<'_> {
        WorkerDAL { dal: self }
    }
}
