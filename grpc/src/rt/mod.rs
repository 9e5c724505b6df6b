/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

pub mod tokio;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type BoxedTaskHandle = Box<dyn TaskHandle>;

/// An abstraction over an asynchronous runtime.
///
/// LB policies use it for work that outlives a single call into the policy,
/// such as the delayed removal of deactivated children.  Keeping it behind a
/// trait lets tests drive time deterministically.
pub trait Runtime: Send + Sync {
    /// Spawns the given asynchronous task to run in the background.
    fn spawn(&self, task: BoxFuture<()>) -> BoxedTaskHandle;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Sync + Future<Output = ()> {}

pub trait TaskHandle: Send + Sync {
    /// Abort the associated task.
    fn abort(&self);
}

/// Returns the runtime used when none is configured.
pub fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(tokio::TokioRuntime::default())
}
