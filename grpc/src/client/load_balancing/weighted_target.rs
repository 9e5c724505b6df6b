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

//! The weighted_target LB policy.
//!
//! Splits RPCs between named targets in proportion to their weights.  Each
//! target runs its own child policy over the endpoints routed to it, and a
//! target that disappears from the config keeps its child for a while in case
//! it comes back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tonic::Status;

use crate::client::ConnectivityState;
use crate::client::load_balancing::endpoint_list::WrappedController;
use crate::client::load_balancing::registry::ParsedLbPolicy;
use crate::client::load_balancing::{
    ChannelController, ConfigError, Failing, FieldError, LbInstrumentation, LbPolicy,
    LbPolicyBuilder, LbPolicyOptions, LbPolicyRegistry, LbState, PickResult, Picker,
    QueuingPicker, ReconnectPicker, Subchannel, SubchannelState, WeakSubchannel, WorkScheduler,
    aggregate_states, join_errors, transient_failure_status,
};
use crate::client::name_resolution::{Endpoint, HierarchicalPath, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::rt::BoxedTaskHandle;
use crate::service::Request;


pub static POLICY_NAME: &str = "weighted_target";

/// How long the child of a target removed from the config is retained.
pub const DEFAULT_CHILD_RETENTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

const NO_CHILDREN: &str = "weighted_target: no children";
const ALL_CHILDREN_FAILED: &str = "weighted_target: all children report state TRANSIENT_FAILURE";

/// The parsed configuration of a weighted_target policy.
#[derive(Clone)]
pub struct WeightedTargetConfig {
    pub targets: BTreeMap<String, TargetConfig>,
    /// Validation errors of the targets that were left out of `targets`.
    pub rejected_targets: Vec<FieldError>,
}

#[derive(Clone)]
pub struct TargetConfig {
    /// None if the target has not been given a weight.
    pub weight: Option<u32>,
    pub child_policy: ParsedLbPolicy,
}

/// One child policy that failed to accept its update.
#[derive(Debug, Clone, thiserror::Error)]
#[error("target {target}: {message}")]
pub struct ChildUpdateError {
    pub target: String,
    pub message: String,
}

/// Returned by a resolver update that some children rejected.  The other
/// children are updated regardless.
#[derive(Debug, Clone, thiserror::Error)]
#[error("weighted_target: children rejected update: [{}]", join_errors(.0))]
pub struct ChildUpdateErrors(pub Vec<ChildUpdateError>);

#[derive(Debug, Clone)]
pub struct Builder {
    retention_interval: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            retention_interval: DEFAULT_CHILD_RETENTION_INTERVAL,
        }
    }
}

impl Builder {
    /// Sets how long the child of a removed target is kept.  Zero removes
    /// children as soon as their target leaves the config.
    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }
}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(WeightedTargetPolicy::new(options, self.retention_interval))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
        registry: &LbPolicyRegistry,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let config = parse_weighted_target_config(config.value(), registry)?;
        Ok(Some(LbConfig::new(config)))
    }
}

// Invalid targets are dropped from the config.  Parsing only fails if
// `targets` itself is unusable or no target is valid.
fn parse_weighted_target_config(
    value: &Value,
    registry: &LbPolicyRegistry,
) -> Result<WeightedTargetConfig, ConfigError> {
    let validation = |errors: Vec<FieldError>| ConfigError::Validation {
        policy: POLICY_NAME,
        errors,
    };
    let targets = match value.get("targets") {
        Some(Value::Object(targets)) => targets,
        Some(_) => {
            return Err(validation(vec![FieldError::new(
                "targets",
                "type should be object",
            )]));
        }
        None => {
            return Err(validation(vec![FieldError::new(
                "targets",
                "required field not present",
            )]));
        }
    };

    let mut config = WeightedTargetConfig {
        targets: BTreeMap::new(),
        rejected_targets: Vec::new(),
    };
    for (name, target) in targets {
        match parse_target(name, target, registry) {
            Ok(target) => {
                config.targets.insert(name.clone(), target);
            }
            Err(errors) => {
                tracing::warn!(
                    policy = POLICY_NAME,
                    child = %name,
                    errors = %join_errors(&errors),
                    "dropping invalid target from config"
                );
                config.rejected_targets.extend(errors);
            }
        }
    }
    if config.targets.is_empty() && !config.rejected_targets.is_empty() {
        return Err(validation(config.rejected_targets));
    }
    Ok(config)
}

fn parse_target(
    name: &str,
    value: &Value,
    registry: &LbPolicyRegistry,
) -> Result<TargetConfig, Vec<FieldError>> {
    let field = |suffix: &str| format!("targets[{name}]{suffix}");
    let Value::Object(target) = value else {
        return Err(vec![FieldError::new(field(""), "type should be object")]);
    };

    let mut errors = Vec::new();
    let weight = match target.get("weight") {
        None => None,
        Some(Value::Number(n)) => match n.as_u64().map(u32::try_from) {
            Some(Ok(0)) => {
                errors.push(FieldError::new(
                    field(".weight"),
                    "value must be greater than zero",
                ));
                None
            }
            Some(Ok(weight)) => Some(weight),
            Some(Err(_)) | None => {
                errors.push(FieldError::new(
                    field(".weight"),
                    "value must be an integer between 1 and 4294967295",
                ));
                None
            }
        },
        Some(_) => {
            errors.push(FieldError::new(field(".weight"), "must be of type number"));
            None
        }
    };
    let child_policy = match target.get("childPolicy") {
        None => {
            errors.push(FieldError::new(
                field(".childPolicy"),
                "required field not present",
            ));
            None
        }
        Some(list) => match registry.parse_lb_policy_list(list) {
            Ok(child_policy) => Some(child_policy),
            Err(err) => {
                errors.push(FieldError::new(field(".childPolicy"), err.to_string()));
                None
            }
        },
    };

    match child_policy {
        Some(child_policy) if errors.is_empty() => Ok(TargetConfig {
            weight,
            child_policy,
        }),
        _ => Err(errors),
    }
}

struct WeightedTargetPolicy {
    options: LbPolicyOptions,
    retention_interval: Duration,
    targets: BTreeMap<String, WeightedChild>,
    // Maps every subchannel to the target and child policy that created it.
    subchannel_child_map: HashMap<WeakSubchannel, (String, u64)>,
    pending_work: Arc<Mutex<HashSet<String>>>,
    // Removal timers that fired since the last call to work.
    expired_timers: Arc<Mutex<Vec<(String, u64)>>>,
    resolution_note: Option<String>,
    next_id: u64,
    // Set while a resolver update is propagated to the children.  Children
    // reports are cached but not published until the update completes.
    update_in_progress: bool,
    exiting_idle: bool,
}

// A target and the child policy serving it.
struct WeightedChild {
    // Some(0) while the target is deactivated and waiting to be removed.
    weight: Option<u32>,
    state: LbState,
    policy: ChildPolicy,
    // Set while the target switches to a different policy.  Receives every
    // update and takes over once it is usable.
    pending_policy: Option<ChildPolicy>,
    // Replayed into a replacement policy if the current one fails for good.
    last_update: ResolverUpdate,
    last_config: Option<LbConfig>,
    work_scheduler: Arc<TargetWorkScheduler>,
    removal_timer: Option<RemovalTimer>,
}

impl WeightedChild {
    fn is_deactivated(&self) -> bool {
        self.weight == Some(0)
    }

    fn policy_mut(&mut self, id: u64) -> Option<&mut ChildPolicy> {
        if self.policy.id == id {
            return Some(&mut self.policy);
        }
        self.pending_policy.as_mut().filter(|policy| policy.id == id)
    }

    fn is_pending(&self, id: u64) -> bool {
        self.pending_policy
            .as_ref()
            .is_some_and(|policy| policy.id == id)
    }

    fn newest_policy(&self) -> &ChildPolicy {
        self.pending_policy.as_ref().unwrap_or(&self.policy)
    }
}

struct ChildPolicy {
    id: u64,
    builder: Arc<dyn LbPolicyBuilder>,
    policy: Box<dyn LbPolicy>,
    // Last report of a pending policy.  Reports of the current policy are
    // cached on the target.
    state: Option<LbState>,
}

struct RemovalTimer {
    generation: u64,
    handle: BoxedTaskHandle,
}

impl Drop for RemovalTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct TargetWorkScheduler {
    name: String,
    pending_work: Arc<Mutex<HashSet<String>>>,
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for TargetWorkScheduler {
    fn schedule_work(&self) {
        self.pending_work.lock().insert(self.name.clone());
        self.parent.schedule_work();
    }
}

impl WeightedTargetPolicy {
    fn new(options: LbPolicyOptions, retention_interval: Duration) -> Self {
        Self {
            options,
            retention_interval,
            targets: BTreeMap::new(),
            subchannel_child_map: HashMap::new(),
            pending_work: Arc::default(),
            expired_timers: Arc::default(),
            resolution_note: None,
            next_id: 0,
            update_in_progress: false,
            exiting_idle: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn build_child_policy(
        &mut self,
        builder: &Arc<dyn LbPolicyBuilder>,
        work_scheduler: Arc<TargetWorkScheduler>,
    ) -> ChildPolicy {
        ChildPolicy {
            id: self.next_id(),
            builder: builder.clone(),
            policy: builder.build(self.options.for_child(work_scheduler)),
            state: None,
        }
    }

    // Creates the target if needed, reactivates it if it was deactivated and
    // hands the update to its newest child policy.
    fn update_target(
        &mut self,
        name: &str,
        target: &TargetConfig,
        update: ResolverUpdate,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let builder = &target.child_policy.builder;
        if !self.targets.contains_key(name) {
            let work_scheduler = Arc::new(TargetWorkScheduler {
                name: name.to_string(),
                pending_work: self.pending_work.clone(),
                parent: self.options.work_scheduler.clone(),
            });
            let policy = self.build_child_policy(builder, work_scheduler.clone());
            tracing::debug!(
                policy = POLICY_NAME,
                child = %name,
                child_policy = builder.name(),
                "creating child"
            );
            self.targets.insert(
                name.to_string(),
                WeightedChild {
                    weight: target.weight,
                    state: LbState::initial(),
                    policy,
                    pending_policy: None,
                    last_update: update.clone(),
                    last_config: None,
                    work_scheduler,
                    removal_timer: None,
                },
            );
        }

        let Some(child) = self.targets.get(name) else {
            return Ok(());
        };
        if child.newest_policy().builder.name() != builder.name() {
            let work_scheduler = child.work_scheduler.clone();
            let pending = self.build_child_policy(builder, work_scheduler);
            tracing::debug!(
                policy = POLICY_NAME,
                child = %name,
                child_policy = builder.name(),
                "creating pending child policy"
            );
            let replaced = self
                .targets
                .get_mut(name)
                .and_then(|child| child.pending_policy.replace(pending));
            if let Some(replaced) = replaced {
                self.forget_subchannels(name, replaced.id);
            }
        }

        let Some(child) = self.targets.get_mut(name) else {
            return Ok(());
        };
        if child.is_deactivated() {
            tracing::debug!(policy = POLICY_NAME, child = %name, "reactivating child");
        }
        child.removal_timer = None;
        child.weight = target.weight;
        child.last_update = update.clone();
        child.last_config = target.child_policy.config.clone();
        let id = child.newest_policy().id;
        let config = target.child_policy.config.clone();
        self.call_child(name, id, channel_controller, |policy, controller| {
            policy.resolver_update(update, config.as_ref(), controller)
        })
        .unwrap_or(Ok(()))
    }

    // Sets the weight of a target that left the config to zero and schedules
    // its removal.
    fn deactivate(&mut self, name: &str) {
        if self.retention_interval.is_zero() {
            self.remove_target(name);
            return;
        }
        let generation = self.next_id();
        let Some(child) = self.targets.get_mut(name) else {
            return;
        };
        if child.is_deactivated() {
            return;
        }
        tracing::debug!(
            policy = POLICY_NAME,
            child = %name,
            retention_interval = ?self.retention_interval,
            "deactivating child"
        );
        child.weight = Some(0);

        let expired_timers = self.expired_timers.clone();
        let work_scheduler = self.options.work_scheduler.clone();
        let sleep = self.options.runtime.sleep(self.retention_interval);
        let timer_name = name.to_string();
        let handle = self.options.runtime.spawn(Box::pin(async move {
            sleep.await;
            expired_timers.lock().push((timer_name, generation));
            work_scheduler.schedule_work();
        }));
        child.removal_timer = Some(RemovalTimer { generation, handle });
    }

    fn remove_target(&mut self, name: &str) {
        if self.targets.remove(name).is_some() {
            tracing::debug!(policy = POLICY_NAME, child = %name, "removing child");
            self.subchannel_child_map
                .retain(|_, (child, _)| child.as_str() != name);
        }
    }

    fn forget_subchannels(&mut self, name: &str, id: u64) {
        self.subchannel_child_map
            .retain(|_, (child, child_id)| child.as_str() != name || *child_id != id);
    }

    // Calls into one of a target's child policies and processes what it
    // reported.  Returns None if that policy no longer exists.
    fn call_child<R>(
        &mut self,
        name: &str,
        id: u64,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController) -> R,
    ) -> Option<R> {
        let policy = self.targets.get_mut(name)?.policy_mut(id)?;
        let mut wrapped = WrappedController::new(channel_controller);
        let result = f(policy.policy.as_mut(), &mut wrapped);
        let WrappedController {
            channel_controller,
            created_subchannels,
            picker_update,
        } = wrapped;

        for subchannel in created_subchannels {
            self.subchannel_child_map
                .insert(subchannel.into(), (name.to_string(), id));
        }
        if let Some(state) = picker_update {
            self.on_child_state(name, id, state, channel_controller);
        }
        Some(result)
    }

    fn on_child_state(
        &mut self,
        name: &str,
        id: u64,
        mut state: LbState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(child) = self.targets.get_mut(name) else {
            return;
        };
        if child.is_pending(id) {
            // The current policy keeps serving while it is READY and the new
            // one is not.
            if child.state.connectivity_state == ConnectivityState::Ready
                && state.connectivity_state != ConnectivityState::Ready
            {
                if let Some(pending) = child.pending_policy.as_mut() {
                    pending.state = Some(state);
                }
                return;
            }
            self.promote_pending_policy(name);
        } else if child.policy.id == id {
            let pending_state = child
                .pending_policy
                .as_ref()
                .and_then(|pending| pending.state.clone());
            match pending_state {
                Some(pending_state) if state.connectivity_state != ConnectivityState::Ready => {
                    self.promote_pending_policy(name);
                    state = pending_state;
                }
                _ => {}
            }
        } else {
            tracing::warn!(
                policy = POLICY_NAME,
                child = %name,
                "ignoring update from replaced child policy"
            );
            return;
        }

        if state.connectivity_state == ConnectivityState::Shutdown {
            self.replace_child_policy(name, state, channel_controller);
        } else if let Some(child) = self.targets.get_mut(name) {
            tracing::trace!(
                policy = POLICY_NAME,
                child = %name,
                state = %state.connectivity_state,
                "child reported new state"
            );
            child.state = state;
        }

        let Some(child) = self.targets.get(name) else {
            return;
        };
        let deactivated = child.is_deactivated();
        if child.state.connectivity_state == ConnectivityState::Idle && !self.exiting_idle {
            let id = child.policy.id;
            self.exiting_idle = true;
            self.call_child(name, id, channel_controller, |policy, controller| {
                policy.exit_idle(controller)
            });
            self.exiting_idle = false;
        }
        if !deactivated && !self.update_in_progress && !self.exiting_idle {
            self.update_state(channel_controller);
        }
    }

    fn promote_pending_policy(&mut self, name: &str) {
        let Some(child) = self.targets.get_mut(name) else {
            return;
        };
        let Some(pending) = child.pending_policy.take() else {
            return;
        };
        let old = mem::replace(&mut child.policy, pending);
        tracing::debug!(
            policy = POLICY_NAME,
            child = %name,
            child_policy = child.policy.builder.name(),
            "switched to new child policy"
        );
        self.forget_subchannels(name, old.id);
    }

    // Replaces a child policy that gave up on its addresses with a fresh one
    // and asks it to connect.  The target keeps failing picks the way the old
    // policy did until the new one reports a subchannel state.
    fn replace_child_policy(
        &mut self,
        name: &str,
        failed: LbState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(child) = self.targets.get(name) else {
            return;
        };
        let builder = child.policy.builder.clone();
        let work_scheduler = child.work_scheduler.clone();
        let old_id = child.policy.id;
        let fresh = self.build_child_policy(&builder, work_scheduler.clone());
        let new_id = fresh.id;
        self.forget_subchannels(name, old_id);

        let Some(child) = self.targets.get_mut(name) else {
            return;
        };
        tracing::debug!(
            policy = POLICY_NAME,
            child = %name,
            "child policy failed permanently, replacing it"
        );
        child.policy = fresh;
        child.state = LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(ReconnectPicker {
                picker: failed.picker,
                work_scheduler,
            }),
        };

        // The reports the new policy makes while starting up are dropped.
        let update = child.last_update.clone();
        let config = child.last_config.clone();
        let mut wrapped = WrappedController::new(channel_controller);
        if let Err(err) = child
            .policy
            .policy
            .resolver_update(update, config.as_ref(), &mut wrapped)
        {
            tracing::debug!(policy = POLICY_NAME, child = %name, %err, "replacement child rejected update");
        }
        child.policy.policy.exit_idle(&mut wrapped);
        for subchannel in wrapped.created_subchannels {
            self.subchannel_child_map
                .insert(subchannel.into(), (name.to_string(), new_id));
        }
    }

    // Builds and publishes the aggregate picker from the cached states of the
    // active children.
    fn update_state(&mut self, channel_controller: &mut dyn ChannelController) {
        let active: Vec<&WeightedChild> = self
            .targets
            .values()
            .filter(|child| !child.is_deactivated())
            .collect();
        if active.is_empty() {
            let status = transient_failure_status(NO_CHILDREN, self.resolution_note.as_deref());
            tracing::debug!(policy = POLICY_NAME, "no active children");
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::TransientFailure,
                picker: Arc::new(Failing {
                    error: status.message().to_string(),
                }),
            });
            return;
        }

        let instrumentation = self.options.instrumentation.as_ref();
        let stale = self.targets.len() - active.len();
        if stale > 0 {
            instrumentation.child_weight_stale(stale);
        }
        let children_in = |state: ConnectivityState| -> Vec<(Option<u32>, Arc<dyn Picker>)> {
            active
                .iter()
                .filter(|child| child.state.connectivity_state == state)
                .map(|child| (child.weight, child.state.picker.clone()))
                .collect()
        };

        let connectivity_state =
            aggregate_states(active.iter().map(|child| child.state.connectivity_state));
        let picker: Arc<dyn Picker> = match connectivity_state {
            ConnectivityState::Ready => Arc::new(WeightedPicker::new(
                children_in(ConnectivityState::Ready),
                instrumentation,
            )),
            ConnectivityState::Connecting | ConnectivityState::Idle => Arc::new(QueuingPicker {}),
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {
                let failing = children_in(ConnectivityState::TransientFailure);
                if failing.is_empty() {
                    Arc::new(Failing {
                        error: ALL_CHILDREN_FAILED.to_string(),
                    })
                } else {
                    Arc::new(WeightedPicker::new(failing, instrumentation))
                }
            }
        };
        tracing::debug!(
            policy = POLICY_NAME,
            state = %connectivity_state,
            children = active.len(),
            "publishing aggregate picker"
        );
        channel_controller.update_picker(LbState {
            connectivity_state,
            picker,
        });
    }
}

impl LbPolicy for WeightedTargetPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let config = config
            .and_then(|config| config.convert_to::<WeightedTargetConfig>())
            .ok_or("weighted_target: missing or invalid LB policy config")?;
        tracing::debug!(
            policy = POLICY_NAME,
            targets = config.targets.len(),
            "received resolver update"
        );
        self.resolution_note = update.resolution_note.clone();

        let removed: Vec<String> = self
            .targets
            .keys()
            .filter(|name| !config.targets.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            self.deactivate(&name);
        }

        let routed = update
            .endpoints
            .as_ref()
            .map(|endpoints| route_endpoints(endpoints, &config.targets));
        let mut errors = Vec::new();
        self.update_in_progress = true;
        for (name, target) in &config.targets {
            let endpoints = match &routed {
                Ok(routed) => Ok(routed.get(name).cloned().unwrap_or_default()),
                Err(err) => Err((*err).clone()),
            };
            let child_update = ResolverUpdate {
                attributes: update.attributes.clone(),
                endpoints,
                resolution_note: update.resolution_note.clone(),
            };
            if let Err(err) = self.update_target(name, target, child_update, channel_controller) {
                errors.push(ChildUpdateError {
                    target: name.clone(),
                    message: err.to_string(),
                });
            }
        }
        self.update_in_progress = false;
        self.update_state(channel_controller);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChildUpdateErrors(errors).into())
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some((name, id)) = self
            .subchannel_child_map
            .get(&WeakSubchannel::new(&subchannel))
            .cloned()
        else {
            tracing::trace!(%subchannel, "dropping update for subchannel of removed child");
            return;
        };
        self.call_child(&name, id, channel_controller, |policy, controller| {
            policy.subchannel_update(subchannel, state, controller)
        });
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let expired = mem::take(&mut *self.expired_timers.lock());
        for (name, generation) in expired {
            let current = self
                .targets
                .get(&name)
                .and_then(|child| child.removal_timer.as_ref())
                .is_some_and(|timer| timer.generation == generation);
            if current {
                self.remove_target(&name);
            }
        }

        let names = mem::take(&mut *self.pending_work.lock());
        for name in names {
            let Some(child) = self.targets.get(&name) else {
                continue;
            };
            let mut ids = vec![child.policy.id];
            ids.extend(child.pending_policy.as_ref().map(|pending| pending.id));
            for id in ids {
                self.call_child(&name, id, channel_controller, |policy, controller| {
                    policy.work(controller)
                });
            }
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let targets: Vec<(String, u64)> = self
            .targets
            .iter()
            .map(|(name, child)| (name.clone(), child.policy.id))
            .collect();
        self.update_in_progress = true;
        for (name, id) in targets {
            self.call_child(&name, id, channel_controller, |policy, controller| {
                policy.exit_idle(controller)
            });
        }
        self.update_in_progress = false;
        self.update_state(channel_controller);
    }

    fn reset_backoff(&mut self) {
        for child in self.targets.values_mut() {
            child.policy.policy.reset_backoff();
            if let Some(pending) = child.pending_policy.as_mut() {
                pending.policy.reset_backoff();
            }
        }
    }
}

// Splits the resolver's endpoints between the targets.  An endpoint whose
// hierarchical path starts with a target's name goes to that target, with the
// name popped off the path.  An endpoint without a path goes to every target.
fn route_endpoints(
    endpoints: &[Endpoint],
    targets: &BTreeMap<String, TargetConfig>,
) -> HashMap<String, Vec<Endpoint>> {
    let mut routed: HashMap<String, Vec<Endpoint>> = targets
        .keys()
        .map(|name| (name.clone(), Vec::new()))
        .collect();
    for endpoint in endpoints {
        let path = endpoint.attributes.get::<HierarchicalPath>();
        match path.and_then(|path| path.head().map(|head| (head, path))) {
            Some((head, path)) => match routed.get_mut(head) {
                Some(target_endpoints) => {
                    let mut endpoint = endpoint.clone();
                    endpoint.attributes = endpoint.attributes.add(path.tail());
                    target_endpoints.push(endpoint);
                }
                None => {
                    tracing::trace!(policy = POLICY_NAME, child = %head, "dropping endpoint of unknown target");
                }
            },
            None => {
                for target_endpoints in routed.values_mut() {
                    target_endpoints.push(endpoint.clone());
                }
            }
        }
    }
    routed
}

/// Picks a child at random, in proportion to its weight, and delegates the
/// pick to that child's picker.
pub struct WeightedPicker {
    // Cumulative weights in ascending order, each paired with the picker that
    // owns the range ending there.
    entries: Vec<(u64, Arc<dyn Picker>)>,
}

impl WeightedPicker {
    /// Builds a picker over `children`.  A child without a weight gets the
    /// average weight of the others, or 1 if no child has a weight.
    pub fn new(
        children: Vec<(Option<u32>, Arc<dyn Picker>)>,
        instrumentation: &dyn LbInstrumentation,
    ) -> Self {
        let known: Vec<u64> = children
            .iter()
            .filter_map(|(weight, _)| weight.map(u64::from))
            .collect();
        let unknown = children.len() - known.len();
        let default_weight = if known.is_empty() {
            if !children.is_empty() {
                instrumentation.rr_fallback();
            }
            1
        } else {
            if unknown > 0 {
                instrumentation.child_weight_not_yet_usable(unknown);
            }
            let average = known.iter().sum::<u64>() / known.len() as u64;
            u32::try_from(average).unwrap_or(u32::MAX).max(1)
        };

        let mut end = 0;
        let entries = children
            .into_iter()
            .map(|(weight, picker)| {
                let weight = weight.unwrap_or(default_weight);
                instrumentation.child_weight(weight);
                end += u64::from(weight);
                (end, picker)
            })
            .collect();
        Self { entries }
    }

    pub fn total_weight(&self) -> u64 {
        self.entries.last().map_or(0, |(end, _)| *end)
    }

    /// Returns the index of the child owning `key`, a point in
    /// `[0, total_weight)`.
    pub fn child_index(&self, key: u64) -> Option<usize> {
        let idx = self.entries.partition_point(|(end, _)| *end <= key);
        (idx < self.entries.len()).then_some(idx)
    }
}

impl Picker for WeightedPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let total = self.total_weight();
        if total == 0 {
            return PickResult::Fail(Status::unavailable(NO_CHILDREN));
        }
        match self.child_index(rand::random_range(0..total)) {
            Some(idx) => self.entries[idx].1.pick(request),
            None => PickResult::Fail(Status::unavailable(NO_CHILDREN)),
        }
    }
}
