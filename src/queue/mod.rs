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

//! Queue/lease broker.
//!
//! The broker holds transient references only: a priority-ordered ready
//! collection and an append-only dead-letter collection, both carrying
//! bare job identifiers. It is advisory: losing an entry never corrupts
//! the store, only delays scheduling until the monitor's orphan sweep
//! reclaims the job. Authoritative state lives in the durable store, and
//! discrepancies always resolve in the store's favor.

pub mod memory;
pub mod redis;

pub use memory::InMemoryJobQueue;
pub use redis::RedisJobQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Ready/dead-letter lengths, surfaced by `get-queue-stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: u64,
    pub dead: u64,
}

/// A dead-letter record: the job id plus why and when it was buried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub reason: String,
    pub buried_at: DateTime<Utc>,
}

/// Contract between the scheduler (producer) and workers (consumers).
///
/// Ordering: higher priority first, FIFO within equal priority.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stages a job id at the given priority. Idempotent on the job id:
    /// re-enqueueing an id already staged neither duplicates it nor moves
    /// its position.
    async fn enqueue(&self, job_id: Uuid, priority: i32) -> Result<(), QueueError>;

    /// Removes and returns the next job id under priority order, waiting
    /// up to `timeout` for one to appear.
    async fn lease(&self, timeout: Duration) -> Result<Option<Uuid>, QueueError>;

    /// Returns a leased entry to the ready collection.
    async fn requeue(&self, job_id: Uuid, priority: i32) -> Result<(), QueueError>;

    /// Confirms a lease. A no-op: the store is authoritative and the
    /// lease already removed the entry.
    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Records a buried job in the dead-letter collection.
    async fn send_to_dlq(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError>;

    /// Dead-letter records, for operator inspection.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Ready and dead-letter lengths.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Clears the ready collection. Never touches the DLQ or the store.
    async fn purge(&self) -> Result<(), QueueError>;
}

/// Builds a broker-order score: priority dominates, earlier enqueue wins
/// inside a band. `PRIORITY_SCALE` (2^40 ms ≈ 35 years) bounds how far
/// apart two enqueue times may be before they could bleed across bands.
pub(crate) const PRIORITY_SCALE: f64 = (1u64 << 40) as f64;

pub(crate) fn priority_score(priority: i32, enqueued_at: DateTime<Utc>) -> f64 {
    priority as f64 * PRIORITY_SCALE - enqueued_at.timestamp_millis() as f64
}
