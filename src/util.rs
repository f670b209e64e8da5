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

//! Small shared helpers.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retries a transient-infrastructure operation with exponential backoff.
///
/// Runs `op` up to `attempts` times, sleeping `base * 2^n` between tries.
/// Returns the first success or the last error. Callers in background
/// loops treat the final error as "log and pick it up next tick".
pub(crate) async fn with_backoff<T, E, F, Fut>(
    attempts: u32,
    base: Duration,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = base;
    let mut last_err = None;

    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < attempts.max(1) {
                    warn!("{what} failed (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                last_err = Some(e);
            }
        }
    }

    // attempts >= 1, so last_err is always populated here.
    Err(last_err.expect("with_backoff ran at least once"))
}
