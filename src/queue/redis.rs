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

//! Redis-backed broker.
//!
//! The ready collection is a sorted set scored by
//! `priority * 2^40 - enqueue_millis`, so `BZPOPMAX` yields priority-DESC,
//! FIFO-within-band order. `ZADD NX` makes enqueue idempotent on the job
//! id. The dead-letter collection is a hash of JSON records keyed by job
//! id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{priority_score, DeadLetter, JobQueue, QueueStats};
use crate::error::QueueError;

/// Default key prefix for broker structures.
const DEFAULT_KEY_PREFIX: &str = "conveyor:queue";

#[derive(Clone)]
pub struct RedisJobQueue {
    manager: ConnectionManager,
    ready_key: String,
    dlq_key: String,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisJobQueue(ready: {})", self.ready_key)
    }
}

impl RedisJobQueue {
    /// Connects to Redis with the default key prefix.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(url, DEFAULT_KEY_PREFIX).await
    }

    /// Connects with a custom key prefix (one broker per deployment).
    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            manager,
            ready_key: format!("{prefix}:ready"),
            dlq_key: format!("{prefix}:dlq"),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job_id: Uuid, priority: i32) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let score = priority_score(priority, Utc::now());
        // NX keeps the original score if the id is already staged.
        let added: i64 = redis::cmd("ZADD")
            .arg(&self.ready_key)
            .arg("NX")
            .arg(score)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;

        if added == 0 {
            debug!("Job {job_id} already staged; enqueue ignored");
        }
        Ok(())
    }

    async fn lease(&self, timeout: Duration) -> Result<Option<Uuid>, QueueError> {
        let mut conn = self.manager.clone();
        let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMAX")
            .arg(&self.ready_key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;

        match popped {
            Some((_key, member, _score)) => {
                let job_id = member.parse::<Uuid>().map_err(|e| {
                    QueueError::Serialization(format!("invalid job id '{member}': {e}"))
                })?;
                Ok(Some(job_id))
            }
            None => Ok(None),
        }
    }

    async fn requeue(&self, job_id: Uuid, priority: i32) -> Result<(), QueueError> {
        self.enqueue(job_id, priority).await
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        // The lease already removed the entry; the store is authoritative.
        debug!("Job {job_id} acked");
        Ok(())
    }

    async fn send_to_dlq(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let record = DeadLetter {
            job_id,
            reason: reason.to_string(),
            buried_at: Utc::now(),
        };
        let payload = serde_json::to_string(&record)?;

        let mut conn = self.manager.clone();
        let _: () = redis::cmd("HSET")
            .arg(&self.dlq_key)
            .arg(job_id.to_string())
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;
        // Drop any stale ready entry for the buried job.
        let _: i64 = redis::cmd("ZREM")
            .arg(&self.ready_key)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;

        warn!("Job {job_id} sent to dead-letter queue: {reason}");
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(&self.dlq_key)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;

        let mut letters = Vec::with_capacity(raw.len());
        for entry in raw {
            letters.push(serde_json::from_str(&entry)?);
        }
        Ok(letters)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.manager.clone();
        let ready: u64 = redis::cmd("ZCARD")
            .arg(&self.ready_key)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;
        let dead: u64 = redis::cmd("HLEN")
            .arg(&self.dlq_key)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;
        Ok(QueueStats { ready, dead })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(&self.ready_key)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;
        warn!("Broker ready collection purged");
        Ok(())
    }
}
