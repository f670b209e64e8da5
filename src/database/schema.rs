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

//! Diesel schema definitions for the orchestrator tables.
//!
//! Column order must match the migrations in `migrations/`; the model
//! structs derive `Queryable` positionally.

diesel::table! {
    workflows (id) {
        id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        config -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    jobs (id) {
        id -> Uuid,
        job_type -> Text,
        payload -> Jsonb,
        priority -> Int4,
        idempotency_key -> Text,
        status -> Text,
        attempt -> Int4,
        max_attempts -> Int4,
        retry_policy -> Text,
        base_delay_secs -> Int8,
        timeout_secs -> Int8,
        scheduled_at -> Timestamptz,
        worker_id -> Nullable<Text>,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
        error_details -> Nullable<Jsonb>,
        result -> Nullable<Jsonb>,
        workflow_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    job_dependencies (job_id, depends_on_job_id) {
        job_id -> Uuid,
        depends_on_job_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    workers (id) {
        id -> Text,
        hostname -> Text,
        pid -> Int4,
        version -> Text,
        status -> Text,
        max_concurrent_jobs -> Int4,
        last_heartbeat_at -> Nullable<Timestamptz>,
        cpu_percent -> Nullable<Float8>,
        memory_percent -> Nullable<Float8>,
        registered_at -> Timestamptz,
        stopped_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(jobs -> workflows (workflow_id));

diesel::allow_tables_to_appear_in_same_query!(workflows, jobs, job_dependencies, workers);
