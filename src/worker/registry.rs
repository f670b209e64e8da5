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

//! Handler Registry
//!
//! Process-wide mapping from job type to handler implementation,
//! populated at startup and read-only afterwards. Unknown types become a
//! FAILED job outcome, never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::RegistrationError;

/// A failure produced by handler code. Recorded on the job row and fed
/// to the retry policy; never surfaced to the submitter directly.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: Value) -> Self {
        Self {
            message: message.into(),
            details: Some(details),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::new(format!("payload error: {e}"))
    }
}

/// Execution context handed to a handler.
///
/// Carries the wall-clock deadline (the job's timeout applied at start)
/// and a cancellation watch that flips when the worker begins shutting
/// down. Handlers are cooperative: in-flight code is never forcibly
/// aborted, the per-job timeout bounds the wasted work.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    deadline: DateTime<Utc>,
    cancel: watch::Receiver<bool>,
}

impl HandlerContext {
    pub fn new(deadline: DateTime<Utc>, cancel: watch::Receiver<bool>) -> Self {
        Self { deadline, cancel }
    }

    /// Wall-clock time after which the worker abandons the execution.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is requested. Long-running handlers
    /// select on this to yield early.
    pub async fn canceled(&self) {
        let mut cancel = self.cancel.clone();
        while !*cancel.borrow() {
            if cancel.changed().await.is_err() {
                // Worker dropped the sender: treat as canceled.
                return;
            }
        }
    }
}

/// A job handler: business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the handler against a payload. The returned blob is stored as
    /// the job's result. Handlers may be invoked more than once per job
    /// (at-least-once delivery); business effects must be idempotent.
    async fn run(&self, payload: Value, ctx: HandlerContext) -> Result<Value, HandlerError>;
}

/// Registry mapping job type names to handlers.
///
/// Build it mutably at startup, then share it behind `Arc`; the worker
/// runtime only reads.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a job type. Duplicate registration is a
    /// startup error, not a silent overwrite.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistrationError> {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            return Err(RegistrationError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Looks up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, for startup logging.
    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
