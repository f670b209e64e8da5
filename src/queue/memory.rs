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

//! In-process broker.
//!
//! Same contract as the Redis broker, backed by an ordered set under a
//! mutex with `Notify` wakeups. Used by the test suite and by single-node
//! deployments that have no shared broker.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DeadLetter, JobQueue, QueueStats};
use crate::error::QueueError;

/// Ready-set key: priority DESC, then enqueue sequence ASC.
type OrderKey = (Reverse<i32>, u64);

#[derive(Default)]
struct QueueState {
    ready: BTreeMap<OrderKey, Uuid>,
    /// Reverse index for idempotent enqueue and targeted removal.
    staged: HashMap<Uuid, OrderKey>,
    dead: HashMap<Uuid, DeadLetter>,
    next_seq: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InMemoryJobQueue")
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job_id: Uuid, priority: i32) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if state.staged.contains_key(&job_id) {
                debug!("Job {job_id} already staged; enqueue ignored");
                return Ok(());
            }
            let key = (Reverse(priority), state.next_seq);
            state.next_seq += 1;
            state.ready.insert(key, job_id);
            state.staged.insert(job_id, key);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self, timeout: Duration) -> Result<Option<Uuid>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = {
                let mut state = self.state.lock().await;
                if let Some((&key, &job_id)) = state.ready.iter().next() {
                    state.ready.remove(&key);
                    state.staged.remove(&job_id);
                    return Ok(Some(job_id));
                }
                // Register for a wakeup while still holding the lock so an
                // enqueue between unlock and await cannot be missed.
                self.notify.notified()
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn requeue(&self, job_id: Uuid, priority: i32) -> Result<(), QueueError> {
        self.enqueue(job_id, priority).await
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        debug!("Job {job_id} acked");
        Ok(())
    }

    async fn send_to_dlq(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(key) = state.staged.remove(&job_id) {
            state.ready.remove(&key);
        }
        state.dead.insert(
            job_id,
            DeadLetter {
                job_id,
                reason: reason.to_string(),
                buried_at: Utc::now(),
            },
        );
        warn!("Job {job_id} sent to dead-letter queue: {reason}");
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead.values().cloned().collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            ready: state.ready.len() as u64,
            dead: state.dead.len() as u64,
        })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ready.clear();
        state.staged.clear();
        warn!("Broker ready collection purged");
        Ok(())
    }
}
