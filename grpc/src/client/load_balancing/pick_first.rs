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

//! The pick_first LB policy.
//!
//! pick_first tries the addresses it is given strictly in order, one at a
//! time, and sticks to the first one that becomes READY.  Each address list
//! (a "generation") is tried exactly once.  If every address fails, or if the
//! selected connection is later lost, the policy reports SHUTDOWN and expects
//! its owner to replace it.
//!
//! RPCs that arrive before a connection is selected may be queued on the
//! policy itself through [`PickFirstPicker::pick_or_queue`].  Queued picks
//! are completed when a connection is selected, and failed when the
//! generation is exhausted or the policy shuts down.

use std::collections::{HashSet, VecDeque};
use std::error::Error;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::sync::oneshot;
use tonic::Status;

use crate::client::ConnectivityState;
use crate::client::connectivity_state::ConnectivityStateTracker;
use crate::client::load_balancing::{
    ChannelController, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbPolicyRegistry,
    LbState, Pick, PickResult, Picker, Subchannel, SubchannelState, WorkScheduler,
    transient_failure_status,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::service::Request;

#[cfg(test)]
mod test;

pub static POLICY_NAME: &str = "pick_first";

const CONNECTION_FAILURE_PREFIX: &str = "failed to connect to all addresses; last error: ";

#[derive(Debug, Default)]
pub struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy::new(options))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
        _registry: &LbPolicyRegistry,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| format!("failed to parse JSON config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PickFirstConfig {
    #[serde(default)]
    pub shuffle_address_list: bool,
}

/// Arguments a parent policy passes to its pick_first children through the
/// attributes of their resolver updates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PickFirstArgs {
    /// Ask the subchannel layer to health check the connections it creates.
    pub enable_health_checking: bool,
    /// Report the last connection error as is, without the "failed to connect
    /// to all addresses" prefix.  Set by parents that decorate errors
    /// themselves.
    pub omit_status_message_prefix: bool,
}

/// Address attribute marking subchannels that should be health checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EnableHealthCheck;

#[derive(Debug, thiserror::Error)]
pub enum PickFirstError {
    #[error("received empty address list from the name resolver")]
    EmptyAddressList,
    #[error("pick_first received a config of the wrong type")]
    WrongConfigType,
}

/// Identifies a queued pick so that it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PickId(u64);

/// The result of [`PickFirstPicker::pick_or_queue`].
pub enum PickOutcome {
    /// A connection was already selected.
    Complete(Pick),
    /// No connection is selected yet.  The pick completes when one is.
    Queued(QueuedPick),
    /// The policy has given up on its addresses or has shut down.
    Failed(Status),
}

/// A pick waiting for pick_first to select a connection.  Resolves with the
/// selected connection, or with an error status if the pick was cancelled or
/// the policy failed.
pub struct QueuedPick {
    id: PickId,
    rx: oneshot::Receiver<Result<Pick, Status>>,
}

impl QueuedPick {
    pub fn id(&self) -> PickId {
        self.id
    }
}

impl Future for QueuedPick {
    type Output = Result<Pick, Status>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(Status::cancelled("Pick Cancelled"))))
    }
}

struct PendingPick {
    id: PickId,
    initial_metadata_flags: u32,
    tx: oneshot::Sender<Result<Pick, Status>>,
}

struct Selected {
    subchannel: Arc<dyn Subchannel>,
}

#[derive(Default)]
struct PickQueue {
    picks: VecDeque<PendingPick>,
    next_id: u64,
    // Mirrors of policy state that pickers need.  Only the policy writes them.
    started_picking: bool,
    terminal: Option<Status>,
    exit_idle_requested: bool,
}

// State shared between the policy and its picker.  `selected` is stored while
// `queue` is locked so that a picker which finds no selection under the lock
// is guaranteed to have its pick drained when one is made.
#[derive(Default)]
struct Shared {
    selected: ArcSwapOption<Selected>,
    queue: Mutex<PickQueue>,
}

impl Shared {
    fn load_selected(&self) -> Option<Arc<dyn Subchannel>> {
        self.selected
            .load()
            .as_ref()
            .map(|selected| selected.subchannel.clone())
    }

    // Removes every queued pick and resolves it with `result`.  If `terminal`
    // is set, later picks fail with it until a new address list arrives.
    fn drain_picks(&self, result: impl Fn() -> Result<Pick, Status>, terminal: Option<Status>) {
        let picks = {
            let mut queue = self.queue.lock();
            if terminal.is_some() {
                queue.terminal = terminal;
            }
            mem::take(&mut queue.picks)
        };
        for pick in picks {
            // The caller may have stopped waiting.
            let _ = pick.tx.send(result());
        }
    }
}

/// The picker published by pick_first in the IDLE, CONNECTING and READY
/// states.  It reads the selected connection without locking.
pub struct PickFirstPicker {
    shared: Arc<Shared>,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl PickFirstPicker {
    /// Returns the selected connection if there is one.  Otherwise queues the
    /// pick on the policy, starting connection attempts if they have not been
    /// started yet.
    pub fn pick_or_queue(&self, request: &Request) -> PickOutcome {
        if let Some(subchannel) = self.shared.load_selected() {
            return PickOutcome::Complete(Pick::new(subchannel));
        }
        let mut queue = self.shared.queue.lock();
        // A selection may have been published since the check above.
        if let Some(subchannel) = self.shared.load_selected() {
            return PickOutcome::Complete(Pick::new(subchannel));
        }
        if let Some(status) = &queue.terminal {
            return PickOutcome::Failed(status.clone());
        }
        let schedule = request_exit_idle(&mut queue);
        let id = PickId(queue.next_id);
        queue.next_id += 1;
        let (tx, rx) = oneshot::channel();
        queue.picks.push_back(PendingPick {
            id,
            initial_metadata_flags: request.initial_metadata_flags,
            tx,
        });
        drop(queue);
        if schedule {
            self.work_scheduler.schedule_work();
        }
        PickOutcome::Queued(QueuedPick { id, rx })
    }

    /// Cancels the queued pick with the given id.  Returns false if it was
    /// already completed or cancelled.
    pub fn cancel_pick(&self, id: PickId) -> bool {
        let pick = {
            let mut queue = self.shared.queue.lock();
            queue
                .picks
                .iter()
                .position(|pick| pick.id == id)
                .and_then(|pos| queue.picks.remove(pos))
        };
        match pick {
            Some(pick) => {
                let _ = pick.tx.send(Err(Status::cancelled("Pick Cancelled")));
                true
            }
            None => false,
        }
    }

    /// Cancels every queued pick whose initial metadata flags, masked with
    /// `mask`, equal `eq`.  Returns the number of picks cancelled.
    pub fn cancel_picks(&self, mask: u32, eq: u32) -> usize {
        let cancelled: VecDeque<PendingPick> = {
            let mut queue = self.shared.queue.lock();
            let (cancelled, kept) = mem::take(&mut queue.picks)
                .into_iter()
                .partition(|pick| pick.initial_metadata_flags & mask == eq);
            queue.picks = kept;
            cancelled
        };
        let count = cancelled.len();
        for pick in cancelled {
            let _ = pick.tx.send(Err(Status::cancelled("Pick Cancelled")));
        }
        count
    }

    /// The number of picks currently queued.
    pub fn pending_picks(&self) -> usize {
        self.shared.queue.lock().picks.len()
    }
}

// Returns true if the caller should schedule work to leave IDLE.
fn request_exit_idle(queue: &mut PickQueue) -> bool {
    if queue.started_picking || queue.exit_idle_requested {
        return false;
    }
    queue.exit_idle_requested = true;
    true
}

impl Picker for PickFirstPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        if let Some(subchannel) = self.shared.load_selected() {
            return PickResult::Pick(Pick::new(subchannel));
        }
        let schedule = {
            let mut queue = self.shared.queue.lock();
            if let Some(status) = &queue.terminal {
                return PickResult::Fail(status.clone());
            }
            request_exit_idle(&mut queue)
        };
        if schedule {
            self.work_scheduler.schedule_work();
        }
        PickResult::Queue
    }
}

struct Candidate {
    subchannel: Arc<dyn Subchannel>,
    // Last state reported by the subchannel, None until its first report.
    state: Option<ConnectivityState>,
}

pub struct PickFirstPolicy {
    shared: Arc<Shared>,
    picker: Arc<PickFirstPicker>,
    candidates: Vec<Candidate>, // Subchannels of the current generation, in order.
    checking_subchannel: usize, // Index into candidates of the one being tried.
    checking_connectivity: ConnectivityState,
    failures_this_pass: usize,
    selected: Option<Arc<dyn Subchannel>>,
    addresses: Vec<Address>, // Most recent addresses from the name resolver.
    started_picking: bool,
    shutdown: bool,
    args: PickFirstArgs,
    last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
    resolution_note: Option<String>,
    state_tracker: ConnectivityStateTracker,
}

impl PickFirstPolicy {
    pub fn new(options: LbPolicyOptions) -> Self {
        let shared = Arc::new(Shared::default());
        let picker = Arc::new(PickFirstPicker {
            shared: shared.clone(),
            work_scheduler: options.work_scheduler,
        });
        Self {
            shared,
            picker,
            candidates: Vec::new(),
            checking_subchannel: 0,
            checking_connectivity: ConnectivityState::Idle,
            failures_this_pass: 0,
            selected: None,
            addresses: Vec::new(),
            started_picking: false,
            shutdown: false,
            args: PickFirstArgs::default(),
            last_connection_error: None,
            resolution_note: None,
            state_tracker: ConnectivityStateTracker::new(POLICY_NAME, ConnectivityState::Idle),
        }
    }

    /// Returns the picker through which picks can be queued on this policy.
    pub fn picker(&self) -> Arc<PickFirstPicker> {
        self.picker.clone()
    }

    /// Returns the selected subchannel, if any.
    pub fn selected(&self) -> Option<Arc<dyn Subchannel>> {
        self.selected.clone()
    }

    pub fn check_connectivity(&self) -> ConnectivityState {
        self.state_tracker.state()
    }

    /// Returns a receiver that resolves the next time the policy's state
    /// differs from `current`.
    pub fn notify_on_state_change(
        &mut self,
        current: ConnectivityState,
    ) -> oneshot::Receiver<ConnectivityState> {
        self.state_tracker.notify_on_state_change(current)
    }

    /// Shuts the policy down, failing all queued picks and releasing every
    /// subchannel.  Calling it more than once has no further effect.
    pub fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        tracing::debug!(policy = POLICY_NAME, "shutting down");
        let status = Status::unavailable("Channel shutdown");
        self.state_tracker
            .set(ConnectivityState::Shutdown, Some(status.clone()), "shutdown");
        self.shared.selected.store(None);
        self.shared
            .drain_picks(|| Err(status.clone()), Some(status.clone()));
        self.selected = None;
        self.candidates.clear();
    }

    fn shuffle_requested(
        &self,
        config: Option<&LbConfig>,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let Some(config) = config else {
            return Ok(false);
        };
        let cfg = config
            .convert_to::<PickFirstConfig>()
            .ok_or(PickFirstError::WrongConfigType)?;
        Ok(cfg.shuffle_address_list)
    }

    fn address_list_from_endpoints(&self, endpoints: &[Endpoint]) -> Vec<Address> {
        // Flatten the endpoints list by concatenating the ordered list of
        // addresses for each of the endpoints.
        let mut addresses: Vec<Address> = endpoints
            .iter()
            .flat_map(|ep| ep.addresses.clone())
            .collect();

        // Remove duplicates.
        let mut uniques = HashSet::new();
        addresses.retain(|e| uniques.insert(e.clone()));
        addresses
    }

    fn subchannel_address(&self, address: &Address) -> Address {
        let mut address = address.clone();
        if self.args.enable_health_checking {
            address.attributes = address.attributes.add(EnableHealthCheck);
        }
        address
    }

    // Replaces the candidate list, dropping any selection.
    fn start_new_generation(
        &mut self,
        addresses: Vec<Address>,
        channel_controller: &mut dyn ChannelController,
    ) {
        tracing::debug!(
            policy = POLICY_NAME,
            addresses = addresses.len(),
            "starting new address list"
        );
        self.selected = None;
        self.shared.selected.store(None);
        self.shared.queue.lock().terminal = None;
        self.candidates = addresses
            .iter()
            .map(|address| Candidate {
                subchannel: channel_controller.new_subchannel(&self.subchannel_address(address)),
                state: None,
            })
            .collect();
        self.addresses = addresses;
        if self.started_picking {
            self.start_probing(channel_controller);
        } else {
            self.update_state(
                ConnectivityState::Idle,
                None,
                "new address list",
                channel_controller,
            );
        }
    }

    fn start_probing(&mut self, channel_controller: &mut dyn ChannelController) {
        self.checking_subchannel = 0;
        self.failures_this_pass = 0;
        let state = self.candidates[0]
            .state
            .unwrap_or(ConnectivityState::Idle);
        self.process_checking_state(state, channel_controller);
    }

    // Drives the candidate currently being tried.  Candidates already known to
    // be failing are skipped without waiting for another notification.
    fn process_checking_state(
        &mut self,
        mut state: ConnectivityState,
        channel_controller: &mut dyn ChannelController,
    ) {
        loop {
            self.checking_connectivity = state;
            let idx = self.checking_subchannel;
            match state {
                ConnectivityState::Ready => {
                    self.select(idx, channel_controller);
                    return;
                }
                ConnectivityState::Idle | ConnectivityState::Connecting => {
                    if state == ConnectivityState::Idle {
                        self.candidates[idx].subchannel.connect();
                    }
                    self.update_state(
                        ConnectivityState::Connecting,
                        None,
                        "connecting",
                        channel_controller,
                    );
                    return;
                }
                ConnectivityState::TransientFailure => {
                    self.failures_this_pass += 1;
                    if self.failures_this_pass >= self.candidates.len() {
                        let status = self.connection_failure_status();
                        self.fail_generation(status, channel_controller);
                        return;
                    }
                    self.checking_subchannel = (idx + 1) % self.candidates.len();
                    tracing::debug!(
                        policy = POLICY_NAME,
                        failed = %self.candidates[idx].subchannel,
                        next = %self.candidates[self.checking_subchannel].subchannel,
                        "connection attempt failed, trying next address"
                    );
                    let status = self.connection_failure_status();
                    self.update_state(
                        ConnectivityState::TransientFailure,
                        Some(status),
                        "connection attempt failed",
                        channel_controller,
                    );
                    let next = &self.candidates[self.checking_subchannel];
                    match next.state {
                        None | Some(ConnectivityState::Idle) => {
                            next.subchannel.connect();
                            self.checking_connectivity = ConnectivityState::Idle;
                            return;
                        }
                        Some(ConnectivityState::Connecting) => {
                            self.checking_connectivity = ConnectivityState::Connecting;
                            return;
                        }
                        Some(known) => state = known,
                    }
                }
                ConnectivityState::Shutdown => {
                    let removed = self.candidates.remove(idx);
                    tracing::debug!(
                        policy = POLICY_NAME,
                        subchannel = %removed.subchannel,
                        "removing shut down subchannel"
                    );
                    if self.candidates.is_empty() {
                        self.fail_generation(
                            Status::unavailable("Pick first exhausted channels"),
                            channel_controller,
                        );
                        return;
                    }
                    if self.failures_this_pass >= self.candidates.len() {
                        let status = self.connection_failure_status();
                        self.fail_generation(status, channel_controller);
                        return;
                    }
                    self.checking_subchannel = idx % self.candidates.len();
                    state = self.candidates[self.checking_subchannel]
                        .state
                        .unwrap_or(ConnectivityState::Idle);
                }
            }
        }
    }

    fn select(&mut self, idx: usize, channel_controller: &mut dyn ChannelController) {
        let subchannel = self.candidates[idx].subchannel.clone();
        tracing::debug!(policy = POLICY_NAME, %subchannel, "selected subchannel");
        {
            let _queue = self.shared.queue.lock();
            self.shared.selected.store(Some(Arc::new(Selected {
                subchannel: subchannel.clone(),
            })));
        }
        let picked = subchannel.clone();
        self.shared.drain_picks(|| Ok(Pick::new(picked.clone())), None);
        self.selected = Some(subchannel);
        // The other candidates are no longer needed.
        self.candidates.clear();
        self.update_state(
            ConnectivityState::Ready,
            None,
            "subchannel selected",
            channel_controller,
        );
    }

    // Gives up on the current generation.  Queued and future picks fail with
    // `status` until a new address list arrives.
    fn fail_generation(&mut self, status: Status, channel_controller: &mut dyn ChannelController) {
        tracing::debug!(policy = POLICY_NAME, %status, "address list exhausted");
        self.candidates.clear();
        self.selected = None;
        self.shared.selected.store(None);
        self.shared
            .drain_picks(|| Err(status.clone()), Some(status.clone()));
        self.update_state(
            ConnectivityState::Shutdown,
            Some(status),
            "address list exhausted",
            channel_controller,
        );
        channel_controller.request_resolution();
    }

    fn handle_selected_update(
        &mut self,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        match state.connectivity_state {
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {
                if state.last_connection_error.is_some() {
                    self.last_connection_error = state.last_connection_error.clone();
                }
                let status = self.connection_failure_status();
                tracing::debug!(
                    policy = POLICY_NAME,
                    state = %state.connectivity_state,
                    "selected subchannel lost"
                );
                self.fail_generation(status, channel_controller);
            }
            other => {
                self.update_state(
                    other,
                    None,
                    "selected subchannel state change",
                    channel_controller,
                );
            }
        }
    }

    fn connection_failure_status(&self) -> Status {
        let err = self
            .last_connection_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        if self.args.omit_status_message_prefix {
            Status::unavailable(err)
        } else {
            Status::unavailable(format!("{CONNECTION_FAILURE_PREFIX}{err}"))
        }
    }

    fn handle_empty_address_list(&mut self, channel_controller: &mut dyn ChannelController) {
        let status = transient_failure_status(
            &PickFirstError::EmptyAddressList.to_string(),
            self.resolution_note.as_deref(),
        );
        self.candidates.clear();
        self.selected = None;
        self.addresses.clear();
        self.shared.selected.store(None);
        self.shared
            .drain_picks(|| Err(status.clone()), Some(status.clone()));
        self.update_state(
            ConnectivityState::TransientFailure,
            Some(status),
            "empty address list",
            channel_controller,
        );
        channel_controller.request_resolution();
    }

    fn update_state(
        &mut self,
        state: ConnectivityState,
        status: Option<Status>,
        reason: &str,
        channel_controller: &mut dyn ChannelController,
    ) {
        let picker: Arc<dyn Picker> = if state.is_failure() {
            Arc::new(Failing {
                error: status
                    .as_ref()
                    .map(|st| st.message().to_string())
                    .unwrap_or_default(),
            })
        } else {
            self.picker.clone()
        };
        self.state_tracker.set(state, status, reason);
        channel_controller.update_picker(LbState {
            connectivity_state: state,
            picker,
        });
    }
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.shutdown {
            return Ok(());
        }
        self.args = update
            .attributes
            .get::<PickFirstArgs>()
            .copied()
            .unwrap_or_default();
        self.resolution_note = update.resolution_note.clone();

        match update.endpoints {
            Ok(mut endpoints) => {
                if self.shuffle_requested(config)? {
                    endpoints.shuffle(&mut rand::rng());
                }
                let addresses = self.address_list_from_endpoints(&endpoints);
                if addresses.is_empty() {
                    self.handle_empty_address_list(channel_controller);
                    return Err(PickFirstError::EmptyAddressList.into());
                }

                // Keep the current connection if its address is still wanted.
                if let Some(selected) = &self.selected {
                    if addresses.contains(&selected.address()) {
                        tracing::debug!(
                            policy = POLICY_NAME,
                            subchannel = %selected,
                            "selected address still present, keeping it"
                        );
                        self.addresses = addresses;
                        return Ok(());
                    }
                }
                self.start_new_generation(addresses, channel_controller);
            }
            Err(error) => {
                tracing::warn!(policy = POLICY_NAME, %error, "received error from resolver");
                // Continue using the previous good update, if one exists.
                if self.addresses.is_empty() {
                    let status = transient_failure_status(&error, self.resolution_note.as_deref());
                    self.shared
                        .drain_picks(|| Err(status.clone()), Some(status.clone()));
                    self.update_state(
                        ConnectivityState::TransientFailure,
                        Some(status),
                        "resolver error",
                        channel_controller,
                    );
                }
            }
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if self.shutdown {
            return;
        }
        tracing::trace!(policy = POLICY_NAME, %subchannel, %state, "subchannel update");

        if self
            .selected
            .as_ref()
            .is_some_and(|selected| Arc::ptr_eq(selected, &subchannel))
        {
            self.handle_selected_update(state, channel_controller);
            return;
        }

        let Some(idx) = self
            .candidates
            .iter()
            .position(|c| Arc::ptr_eq(&c.subchannel, &subchannel))
        else {
            // Updates may still arrive for subchannels of an earlier
            // generation.
            tracing::debug!(policy = POLICY_NAME, %subchannel, "ignoring update for released subchannel");
            return;
        };

        if state.connectivity_state == ConnectivityState::TransientFailure {
            self.last_connection_error = state.last_connection_error.clone();
        }
        self.candidates[idx].state = Some(state.connectivity_state);

        if self.selected.is_none() && self.started_picking && idx == self.checking_subchannel {
            self.process_checking_state(state.connectivity_state, channel_controller);
        }
    }

    // Work is only scheduled by the picker, to leave IDLE.
    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.exit_idle(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.shutdown {
            return;
        }
        self.shared.queue.lock().exit_idle_requested = false;
        if let Some(selected) = &self.selected {
            if self.state_tracker.state() == ConnectivityState::Idle {
                selected.connect();
            }
            return;
        }
        if self.started_picking {
            return;
        }
        self.started_picking = true;
        self.shared.queue.lock().started_picking = true;
        if !self.candidates.is_empty() {
            self.start_probing(channel_controller);
        }
    }

    fn reset_backoff(&mut self) {
        for candidate in &self.candidates {
            candidate.subchannel.reset_backoff();
        }
        if let Some(selected) = &self.selected {
            selected.reset_backoff();
        }
    }
}

impl Drop for PickFirstPolicy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
