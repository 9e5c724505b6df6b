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

//! The interfaces between a channel and its LB policies, plus the policies
//! themselves.
//!
//! All methods of [`LbPolicy`] are called from a single serialized context
//! (see [`crate::client::work_serializer`]), never concurrently.  Pickers are
//! the exception: they are called from RPC threads and must not block.

use std::error::Error;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::rt::Runtime;
use crate::service::Request;

pub mod endpoint_list;
pub mod instrumentation;
pub mod pick_first;
pub mod registry;
pub mod round_robin;
pub mod weighted_target;

#[cfg(test)]
pub(crate) mod test_utils;

pub use instrumentation::{LbInstrumentation, NoopInstrumentation};
pub use registry::LbPolicyRegistry;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
#[derive(Clone)]
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    /// The runtime used for timers and background tasks.
    pub runtime: Arc<dyn Runtime>,
    /// The registry used to look up child policies by name.
    pub registry: Arc<LbPolicyRegistry>,
    /// Receives LB metrics.
    pub instrumentation: Arc<dyn LbInstrumentation>,
}

impl LbPolicyOptions {
    pub fn new(
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
        registry: Arc<LbPolicyRegistry>,
    ) -> Self {
        Self {
            work_scheduler,
            runtime,
            registry,
            instrumentation: Arc::new(NoopInstrumentation),
        }
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn LbInstrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Returns options for a child policy, which share everything except the
    /// work scheduler.
    pub(crate) fn for_child(&self, work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            work_scheduler,
            ..self.clone()
        }
    }
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    /// Policies with nested children resolve them through `registry`.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
        _registry: &LbPolicyRegistry,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.
///
/// Dropping a policy shuts it down: it releases its subchannels and fails any
/// RPCs it still holds.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel when an LbPolicy goes idle and the channel
    /// wants it to start connecting to subchannels again.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Asks the policy to reset the connection backoff of every subchannel it
    /// holds.
    fn reset_backoff(&mut self) {}
}

/// Controls channel behaviors.
pub trait ChannelController: Send + Sync {
    /// Creates a new subchannel in IDLE state.  Per-address arguments for the
    /// subchannel are carried in the address's attributes.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See SubChannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl Default for SubchannelState {
    fn default() -> Self {
        Self {
            connectivity_state: ConnectivityState::Idle,
            last_connection_error: None,
        }
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connectivity_state: {}", self.connectivity_state)?;
        if let Some(err) = &self.last_connection_error {
            write!(f, ", last_connection_error: {err}")?;
        }
        Ok(())
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return an
/// Err with an error that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.  The channel will
    /// convert the status code to INTERNAL if it is not a valid code for the
    /// gRPC library to produce, per [gRFC A54].
    ///
    /// [gRFC A54]:
    ///     https://github.com/grpc/proposal/blob/master/A54-restrict-control-plane-status-codes.md
    Drop(Status),
}

impl Display for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(st) => write!(f, "Fail({st})"),
            Self::Drop(st) => write!(f, "Drop({st})"),
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self {
            subchannel,
            metadata: MetadataMap::new(),
        }
    }
}

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to CONNECTING when the reconnect backoff
///   timer has expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// - Any state may transition to SHUTDOWN if the channel tears the subchannel
///   down.  SHUTDOWN is final.
///
/// When the last reference to a Subchannel is dropped, it is disconnected, and
/// no subsequent state updates will be provided for it to the LB policy.
///
/// Subchannels are compared and hashed by identity.
pub trait Subchannel: Send + Sync + Display {
    /// Returns the address of the Subchannel.
    fn address(&self) -> Address;

    /// Notifies the Subchannel to connect.
    fn connect(&self);

    /// Resets the reconnect backoff so that the next attempt happens
    /// immediately.
    fn reset_backoff(&self) {}
}

impl PartialEq for dyn Subchannel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(self, other)
    }
}

impl Eq for dyn Subchannel {}

impl Hash for dyn Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as *const dyn Subchannel as *const ()).hash(state);
    }
}

impl fmt::Debug for dyn Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({self})")
    }
}

/// A non-owning handle to a subchannel, used as a map key by parents that
/// route subchannel updates to the child that created the subchannel.
#[derive(Clone, Debug)]
pub(crate) struct WeakSubchannel(Weak<dyn Subchannel>);

impl WeakSubchannel {
    pub fn new(subchannel: &Arc<dyn Subchannel>) -> Self {
        WeakSubchannel(Arc::downgrade(subchannel))
    }
}

impl From<Arc<dyn Subchannel>> for WeakSubchannel {
    fn from(subchannel: Arc<dyn Subchannel>) -> Self {
        WeakSubchannel::new(&subchannel)
    }
}

impl Hash for WeakSubchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0.as_ptr() as *const ()).hash(state);
    }
}

impl PartialEq for WeakSubchannel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(self.0.as_ptr(), other.0.as_ptr())
    }
}

impl Eq for WeakSubchannel {}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with an UNAVAILABLE status carrying `error`.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}

/// Delegates to `picker` after asking the owning policy to start
/// reconnecting.  Used in place of a child that gave up on its addresses and
/// was replaced by a fresh, idle instance.
pub struct ReconnectPicker {
    pub picker: Arc<dyn Picker>,
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for ReconnectPicker {
    fn pick(&self, request: &Request) -> PickResult {
        self.work_scheduler.schedule_work();
        self.picker.pick(request)
    }
}

/// Builds the status used when a policy has no usable addresses, appending
/// the resolver's note when there is one.
pub fn transient_failure_status(error: &str, resolution_note: Option<&str>) -> Status {
    match resolution_note {
        Some(note) if !note.is_empty() => Status::unavailable(format!("{error} ({note})")),
        _ => Status::unavailable(error),
    }
}

/// A single invalid field in an LB policy config.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field:{field} error:{message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors produced while parsing LB policy configs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("errors validating {policy} LB policy config: [{}]", join_errors(.errors))]
    Validation {
        policy: &'static str,
        errors: Vec<FieldError>,
    },
    #[error("no supported LB policy found in {0}")]
    NoSupportedPolicy(String),
}

pub(crate) fn join_errors<E: Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Aggregates the connectivity state of a set of children.
///
/// If any child is READY then the aggregate state is READY.  Otherwise, if
/// any child is CONNECTING, then CONNECTING.  Otherwise, if any child is IDLE,
/// then IDLE.  TRANSIENT_FAILURE if no conditions above apply, which includes
/// the case of no children at all.
pub fn aggregate_states(states: impl IntoIterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut is_connecting = false;
    let mut is_idle = false;

    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => is_connecting = true,
            ConnectivityState::Idle => is_idle = true,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {}
        }
    }

    if is_connecting {
        ConnectivityState::Connecting
    } else if is_idle {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}
