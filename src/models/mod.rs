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

//! Database row models for jobs, dependencies, workflows, and workers.

pub mod dependency;
pub mod job;
pub mod worker;
pub mod workflow;

pub use dependency::{JobDependency, NewJobDependency};
pub use job::{Job, NewJob};
pub use worker::{NewWorker, Worker, WorkerTelemetry};
pub use workflow::{NewWorkflow, Workflow};
