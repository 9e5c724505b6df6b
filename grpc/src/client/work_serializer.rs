/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Serialized execution for LB policies.
//!
//! A [`WorkSerializer`] owns a value on a single task and applies closures to
//! it one at a time, in the order they were submitted.  Every mutation of an
//! LB policy tree goes through one, which is what lets the policies use plain
//! fields for their state.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbPolicyRegistry, Subchannel,
    SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbConfig;
use crate::rt::Runtime;

type Work<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Returned when work is submitted to a serializer whose task has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("work serializer is shut down")]
pub struct SerializerClosed;

/// A handle to a task that owns a `T` and runs submitted closures against it
/// in submission order.  Clones share the task.  The task exits, dropping the
/// value, once every handle is gone and the queued work has run.
pub struct WorkSerializer<T> {
    tx: mpsc::UnboundedSender<Work<T>>,
}

impl<T> Clone for WorkSerializer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> WorkSerializer<T> {
    pub fn new(value: T, runtime: &dyn Runtime) -> Self {
        Self::new_cyclic(|_| value, runtime)
    }

    /// Creates the value with a weak handle to its own serializer, which the
    /// value may keep without keeping the task alive.
    pub fn new_cyclic(
        init: impl FnOnce(WeakWorkSerializer<T>) -> T,
        runtime: &dyn Runtime,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Work<T>>();
        let mut value = init(WeakWorkSerializer { tx: tx.downgrade() });
        // Dropping the handle detaches the task.  It ends when the mailbox
        // closes.
        let _ = runtime.spawn(Box::pin(async move {
            while let Some(work) = rx.recv().await {
                work(&mut value);
            }
            tracing::trace!("work serializer exiting");
        }));
        Self { tx }
    }

    /// Queues `work` behind everything submitted so far.
    pub fn schedule(
        &self,
        work: impl FnOnce(&mut T) + Send + 'static,
    ) -> Result<(), SerializerClosed> {
        self.tx.send(Box::new(work)).map_err(|_| SerializerClosed)
    }

    /// Queues `work` and waits for its result.
    pub async fn run<R: Send + 'static>(
        &self,
        work: impl FnOnce(&mut T) -> R + Send + 'static,
    ) -> Result<R, SerializerClosed> {
        let (tx, rx) = oneshot::channel();
        self.schedule(move |value| {
            let _ = tx.send(work(value));
        })?;
        rx.await.map_err(|_| SerializerClosed)
    }

    pub fn downgrade(&self) -> WeakWorkSerializer<T> {
        WeakWorkSerializer {
            tx: self.tx.downgrade(),
        }
    }
}

/// A handle that does not keep the serializer's task alive.
pub struct WeakWorkSerializer<T> {
    tx: mpsc::WeakUnboundedSender<Work<T>>,
}

impl<T> Clone for WeakWorkSerializer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> WeakWorkSerializer<T> {
    pub fn schedule(
        &self,
        work: impl FnOnce(&mut T) + Send + 'static,
    ) -> Result<(), SerializerClosed> {
        let tx = self.tx.upgrade().ok_or(SerializerClosed)?;
        tx.send(Box::new(work)).map_err(|_| SerializerClosed)
    }
}

/// The root LB policy of a channel together with the controller it reports
/// to.  It lives inside a [`WorkSerializer`], and the policy's work requests
/// are delivered back through the same serializer.
pub struct LbPolicyHost {
    policy: Box<dyn LbPolicy>,
    channel_controller: Box<dyn ChannelController>,
}

impl LbPolicyHost {
    /// Builds the root policy and starts the serializer that owns it.  The
    /// policy's work requests are delivered through the same serializer.
    pub fn spawn(
        builder: &dyn LbPolicyBuilder,
        runtime: Arc<dyn Runtime>,
        registry: Arc<LbPolicyRegistry>,
        channel_controller: Box<dyn ChannelController>,
    ) -> WorkSerializer<LbPolicyHost> {
        WorkSerializer::new_cyclic(
            |serializer| {
                let work_scheduler = Arc::new(SerializedWorkScheduler {
                    serializer,
                    pending: Arc::new(AtomicBool::new(false)),
                });
                tracing::debug!(policy = builder.name(), "starting LB policy");
                let options = LbPolicyOptions::new(work_scheduler, runtime.clone(), registry);
                LbPolicyHost {
                    policy: builder.build(options),
                    channel_controller,
                }
            },
            runtime.as_ref(),
        )
    }

    pub fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.policy
            .resolver_update(update, config, self.channel_controller.as_mut())
    }

    pub fn subchannel_update(&mut self, subchannel: Arc<dyn Subchannel>, state: &SubchannelState) {
        self.policy
            .subchannel_update(subchannel, state, self.channel_controller.as_mut());
    }

    pub fn exit_idle(&mut self) {
        self.policy.exit_idle(self.channel_controller.as_mut());
    }

    pub fn reset_backoff(&mut self) {
        self.policy.reset_backoff();
    }

    fn work(&mut self) {
        self.policy.work(self.channel_controller.as_mut());
    }
}

// Turns schedule_work calls into a queued call to the policy's work method.
// Requests made while one is already queued are folded into it.
struct SerializedWorkScheduler {
    serializer: WeakWorkSerializer<LbPolicyHost>,
    pending: Arc<AtomicBool>,
}

impl WorkScheduler for SerializedWorkScheduler {
    fn schedule_work(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.clone();
        let queued = self.serializer.schedule(move |host| {
            pending.store(false, Ordering::Release);
            host.work();
        });
        if queued.is_err() {
            tracing::trace!("dropping work request for shut down policy");
        }
    }
}
