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

//! Built-in handlers: echo, sleep, fail.
//!
//! Small reference implementations used by the integration suite and as
//! handler-authoring examples. Real deployments register their own.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::registry::{HandlerContext, HandlerError, HandlerRegistry, JobHandler};

/// Returns its payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        debug!("echo: {payload}");
        Ok(payload)
    }
}

/// Sleeps for `{"duration_ms": n}`, yielding early on cancellation.
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, payload: Value, ctx: HandlerContext) -> Result<Value, HandlerError> {
        let duration_ms = payload
            .get("duration_ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| HandlerError::new("sleep payload requires a numeric 'duration_ms'"))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                Ok(json!({ "slept_ms": duration_ms }))
            }
            _ = ctx.canceled() => {
                Err(HandlerError::new("sleep canceled by worker shutdown"))
            }
        }
    }
}

/// Always fails, with an optional `{"message": "..."}` override.
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn run(&self, payload: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("fail handler invoked");
        Err(HandlerError::with_details(
            message,
            json!({ "handler": "fail" }),
        ))
    }
}

/// Registers the built-in handlers under their conventional names.
pub fn register_builtin_handlers(
    registry: &mut HandlerRegistry,
) -> Result<(), crate::error::RegistrationError> {
    registry.register("echo", std::sync::Arc::new(EchoHandler))?;
    registry.register("sleep", std::sync::Arc::new(SleepHandler))?;
    registry.register("fail", std::sync::Arc::new(FailHandler))?;
    Ok(())
}
