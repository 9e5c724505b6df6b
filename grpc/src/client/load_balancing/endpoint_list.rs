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

//! A utility which helps parent LB policies run one child policy per
//! endpoint, typically pick_first, and attribute the children's reports back
//! to their endpoints.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ConnectivityState;
use crate::client::load_balancing::pick_first::PickFirstArgs;
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, ReconnectPicker,
    Subchannel, SubchannelState, WeakSubchannel, WorkScheduler, transient_failure_status,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbConfig;


/// An ordered list of endpoints, each served by its own child policy.
///
/// The owner forwards every channel call to the list and then inspects the
/// cached child states (see [`EndpointList::has_updated`]) to decide whether
/// to publish a new aggregate picker.
pub struct EndpointList {
    children: Vec<EndpointChild>,
    subchannel_child_map: HashMap<WeakSubchannel, usize>,
    pending_work: Arc<Mutex<HashSet<usize>>>,
    child_builder: Arc<dyn LbPolicyBuilder>,
    options: LbPolicyOptions,
    updated: bool,
}

struct EndpointChild {
    endpoint: Endpoint,
    policy: Box<dyn LbPolicy>,
    // None until the child reports for the first time.
    state: Option<LbState>,
    // Replayed into a replacement child if this one fails permanently.
    last_update: ResolverUpdate,
    last_config: Option<LbConfig>,
    work_scheduler: Arc<ChildWorkScheduler>,
}

impl EndpointList {
    /// Creates an empty list whose children are built with `child_builder`.
    /// `options` are the owner's options; each child gets its own work
    /// scheduler.
    pub fn new(child_builder: Arc<dyn LbPolicyBuilder>, options: LbPolicyOptions) -> Self {
        Self {
            children: Vec::new(),
            subchannel_child_map: HashMap::new(),
            pending_work: Arc::default(),
            child_builder,
            options,
            updated: false,
        }
    }

    /// Replaces the endpoint list.  Children of endpoints present before and
    /// after the update are kept, new endpoints get new children, and the
    /// children of removed endpoints are dropped.  Children end up in the
    /// order of the update.
    ///
    /// If the resolver reported an error instead of endpoints, the existing
    /// children are kept and the error is returned as a status decorated with
    /// the resolution note.
    pub fn update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let endpoints = match &update.endpoints {
            Ok(endpoints) => endpoints.clone(),
            Err(error) => {
                let status = transient_failure_status(error, update.resolution_note.as_deref());
                return Err(status.into());
            }
        };

        // Hold the lock to prevent new work requests during this operation and
        // rewrite the indices.
        let mut pending_work = self.pending_work.lock();
        let old_pending_work = mem::take(&mut *pending_work);
        let old_children = mem::take(&mut self.children);
        let old_subchannel_child_map = mem::take(&mut self.subchannel_child_map);

        // Reverse the old subchannel map.
        let mut old_child_subchannels_map: HashMap<usize, Vec<WeakSubchannel>> = HashMap::new();
        for (subchannel, child_idx) in old_subchannel_child_map {
            old_child_subchannels_map
                .entry(child_idx)
                .or_default()
                .push(subchannel);
        }

        let mut old_children: HashMap<Endpoint, (usize, EndpointChild)> = old_children
            .into_iter()
            .enumerate()
            .map(|(old_idx, child)| (child.endpoint.clone(), (old_idx, child)))
            .collect();

        let attributes = update.attributes.add(PickFirstArgs {
            enable_health_checking: true,
            omit_status_message_prefix: true,
        });

        for (new_idx, endpoint) in endpoints.into_iter().enumerate() {
            let child_update = ResolverUpdate {
                attributes: attributes.clone(),
                endpoints: Ok(vec![endpoint.clone()]),
                resolution_note: update.resolution_note.clone(),
            };
            if let Some((old_idx, mut child)) = old_children.remove(&endpoint) {
                for subchannel in old_child_subchannels_map
                    .remove(&old_idx)
                    .into_iter()
                    .flatten()
                {
                    self.subchannel_child_map.insert(subchannel, new_idx);
                }
                if old_pending_work.contains(&old_idx) {
                    pending_work.insert(new_idx);
                }
                *child.work_scheduler.idx.lock() = Some(new_idx);
                child.endpoint = endpoint;
                child.last_update = child_update;
                child.last_config = config.cloned();
                self.children.push(child);
            } else {
                let work_scheduler = Arc::new(ChildWorkScheduler {
                    pending_work: self.pending_work.clone(),
                    idx: Mutex::new(Some(new_idx)),
                    parent: self.options.work_scheduler.clone(),
                });
                let policy = self
                    .child_builder
                    .build(self.options.for_child(work_scheduler.clone()));
                self.children.push(EndpointChild {
                    endpoint,
                    policy,
                    state: None,
                    last_update: child_update,
                    last_config: config.cloned(),
                    work_scheduler,
                });
            }
        }

        // Invalidate the work schedulers of removed children.  The children
        // themselves are dropped here.
        for (_, (_, child)) in old_children {
            *child.work_scheduler.idx.lock() = None;
            tracing::trace!(endpoint = ?child.endpoint.addresses, "removing endpoint");
        }

        // Release the lock before calling into the children to allow their
        // work scheduler calls to unblock.
        drop(pending_work);

        self.updated = true;
        for child_idx in 0..self.children.len() {
            let child_update = self.children[child_idx].last_update.clone();
            self.call_child(child_idx, channel_controller, |policy, controller| {
                if let Err(err) = policy.resolver_update(child_update, config, controller) {
                    tracing::debug!(%err, "endpoint child rejected update");
                }
            });
        }
        Ok(())
    }

    /// Routes a subchannel update to the child that created the subchannel.
    /// Updates for subchannels of removed children are dropped.
    pub fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(&child_idx) = self
            .subchannel_child_map
            .get(&WeakSubchannel::new(&subchannel))
        else {
            tracing::trace!(%subchannel, "dropping update for subchannel of removed endpoint");
            return;
        };
        self.call_child(child_idx, channel_controller, |policy, controller| {
            policy.subchannel_update(subchannel, state, controller);
        });
    }

    /// Calls work on every child that scheduled work since the last call.
    pub fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let child_idxes = mem::take(&mut *self.pending_work.lock());
        for child_idx in child_idxes {
            if child_idx >= self.children.len() {
                continue;
            }
            self.call_child(child_idx, channel_controller, |policy, controller| {
                policy.work(controller);
            });
        }
    }

    /// Asks every child to leave idle.
    pub fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        for child_idx in 0..self.children.len() {
            self.exit_idle_child(child_idx, channel_controller);
        }
    }

    /// Asks one child to leave idle.
    pub fn exit_idle_child(
        &mut self,
        child_idx: usize,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.call_child(child_idx, channel_controller, |policy, controller| {
            policy.exit_idle(controller);
        });
    }

    pub fn reset_backoff(&mut self) {
        for child in &mut self.children {
            child.policy.reset_backoff();
        }
    }

    /// Returns true if any child reported a new state since the last call.
    pub fn has_updated(&mut self) -> bool {
        mem::take(&mut self.updated)
    }

    /// Returns true once every child has reported at least once.
    pub fn all_reported(&self) -> bool {
        self.children.iter().all(|child| child.state.is_some())
    }

    /// Returns the endpoints in order, with the last state reported by their
    /// child, if any.
    pub fn endpoint_states(&self) -> impl Iterator<Item = (&Endpoint, Option<&LbState>)> {
        self.children
            .iter()
            .map(|child| (&child.endpoint, child.state.as_ref()))
    }

    /// Returns the position of `endpoint` in the list.
    pub fn index(&self, endpoint: &Endpoint) -> Option<usize> {
        self.children
            .iter()
            .position(|child| &child.endpoint == endpoint)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    // Calls into one child through a controller that records what the child
    // did, then updates the list's accounting.
    fn call_child(
        &mut self,
        child_idx: usize,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController),
    ) {
        let mut wrapped = WrappedController::new(channel_controller);
        f(self.children[child_idx].policy.as_mut(), &mut wrapped);
        let WrappedController {
            channel_controller,
            created_subchannels,
            picker_update,
        } = wrapped;

        for subchannel in created_subchannels {
            self.subchannel_child_map.insert(subchannel.into(), child_idx);
        }
        let Some(state) = picker_update else {
            return;
        };
        if state.connectivity_state == ConnectivityState::Shutdown {
            self.replace_child(child_idx, state, channel_controller);
            return;
        }
        self.children[child_idx].state = Some(state);
        self.updated = true;
    }

    // Replaces a child that gave up on its addresses with a fresh one and asks
    // it to connect.  Until the new child reports a subchannel state, the
    // endpoint keeps failing picks the way the old child did.
    fn replace_child(
        &mut self,
        child_idx: usize,
        failed: LbState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.subchannel_child_map
            .retain(|_, idx| *idx != child_idx);
        let child = &mut self.children[child_idx];
        tracing::debug!(
            endpoint = ?child.endpoint.addresses,
            "endpoint child failed permanently, replacing it"
        );
        child.policy = self
            .child_builder
            .build(self.options.for_child(child.work_scheduler.clone()));
        child.state = Some(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(ReconnectPicker {
                picker: failed.picker,
                work_scheduler: child.work_scheduler.clone(),
            }),
        });
        self.updated = true;

        // The reports the new child makes while starting up are dropped.
        let child_update = child.last_update.clone();
        let config = child.last_config.clone();
        let mut wrapped = WrappedController::new(channel_controller);
        if let Err(err) = child
            .policy
            .resolver_update(child_update, config.as_ref(), &mut wrapped)
        {
            tracing::debug!(%err, "replacement endpoint child rejected update");
        }
        child.policy.exit_idle(&mut wrapped);
        for subchannel in wrapped.created_subchannels {
            self.subchannel_child_map.insert(subchannel.into(), child_idx);
        }
    }
}

/// Intercepts the picker updates of one child and records the subchannels it
/// creates.  Everything else is forwarded to the real controller.
pub(crate) struct WrappedController<'a> {
    pub channel_controller: &'a mut dyn ChannelController,
    pub created_subchannels: Vec<Arc<dyn Subchannel>>,
    pub picker_update: Option<LbState>,
}

impl<'a> WrappedController<'a> {
    pub fn new(channel_controller: &'a mut dyn ChannelController) -> Self {
        Self {
            channel_controller,
            created_subchannels: vec![],
            picker_update: None,
        }
    }
}

impl ChannelController for WrappedController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.channel_controller.new_subchannel(address);
        self.created_subchannels.push(subchannel.clone());
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.channel_controller.request_resolution();
    }
}

struct ChildWorkScheduler {
    pending_work: Arc<Mutex<HashSet<usize>>>, // Must be taken first for correctness
    idx: Mutex<Option<usize>>,                // None if the child is deleted.
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for ChildWorkScheduler {
    fn schedule_work(&self) {
        let mut pending_work = self.pending_work.lock();
        if let Some(idx) = *self.idx.lock() {
            pending_work.insert(idx);
            drop(pending_work);
            self.parent.schedule_work();
        }
    }
}
