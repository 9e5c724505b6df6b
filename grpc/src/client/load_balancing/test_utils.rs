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

use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbPolicyRegistry, LbState,
    PickResult, Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::rt::default_runtime;
use crate::service::Request;

pub(crate) fn new_request() -> Request {
    Request::new("/grpc.testing.TestService/UnaryCall")
}

// A test subchannel that forwards connect calls to a channel.
// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self { address, tx_events }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        self.tx_events
            .send(TestEvent::Connect(self.address.clone()))
            .unwrap();
    }

    fn reset_backoff(&self) {
        self.tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()))
            .unwrap();
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestSubchannel({})", self.address)
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ResetBackoff(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({})", addr.address),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({})", addr.address),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        // Timers may fire after a test has stopped listening.
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// Returns options wired to the test work scheduler and a registry holding
/// the default policies.
pub(crate) fn test_options(tx_events: &mpsc::UnboundedSender<TestEvent>) -> LbPolicyOptions {
    LbPolicyOptions::new(
        Arc::new(TestWorkScheduler {
            tx_events: tx_events.clone(),
        }),
        default_runtime(),
        LbPolicyRegistry::with_default_policies(),
    )
}

type ResolverUpdateFn = dyn Fn(
        &mut StubPolicyData,
        ResolverUpdate,
        Option<&LbConfig>,
        &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    + Send
    + Sync;

type SubchannelUpdateFn = dyn Fn(&mut StubPolicyData, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
    + Send
    + Sync;

type ControllerFn = dyn Fn(&mut StubPolicyData, &mut dyn ChannelController) + Send + Sync;

/// This struct holds `LbPolicy` trait stub functions that tests are expected to implement.
#[derive(Clone, Default)]
pub(crate) struct StubPolicyFuncs {
    pub resolver_update: Option<Arc<ResolverUpdateFn>>,
    pub subchannel_update: Option<Arc<SubchannelUpdateFn>>,
    pub exit_idle: Option<Arc<ControllerFn>>,
    pub work: Option<Arc<ControllerFn>>,
}

/// Holds test data passed to every function in StubPolicyFuncs.
#[derive(Default)]
pub(crate) struct StubPolicyData {
    pub test_data: Option<Box<dyn Any + Send + Sync>>,
}

/// The stub `LbPolicy` that calls the provided functions.
pub(crate) struct StubPolicy {
    funcs: StubPolicyFuncs,
    data: StubPolicyData,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(f) = &self.funcs.resolver_update {
            return f(&mut self.data, update, config, channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.exit_idle {
            f(&mut self.data, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.work {
            f(&mut self.data, channel_controller);
        }
    }
}

/// This StubPolicyBuilder builds a StubPolicy and counts how many it built.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: StubPolicyFuncs,
    builds: Arc<AtomicUsize>,
}

impl StubPolicyBuilder {
    pub fn new(name: &'static str, funcs: StubPolicyFuncs) -> Self {
        Self {
            name,
            funcs,
            builds: Arc::default(),
        }
    }

    /// Returns a counter of the policies built so far, shared with the
    /// builder.
    pub fn build_counter(&self) -> Arc<AtomicUsize> {
        self.builds.clone()
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: StubPolicyData::default(),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
        _registry: &LbPolicyRegistry,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(Some(LbConfig::new(config.value().to_string())))
    }
}

/// Creates `n` endpoints with `k` addresses each.  Endpoint `i` uses the
/// addresses `i.i.i.i:j`, starting at 1.
pub(crate) fn create_n_endpoints_with_k_addresses(n: usize, k: usize) -> Vec<Endpoint> {
    (1..=n)
        .map(|i| {
            Endpoint::new(
                (0..k)
                    .map(|j| Address::tcp(format!("{i}.{i}.{i}.{i}:{j}")))
                    .collect(),
            )
        })
        .collect()
}

pub(crate) fn subchannel_state(state: ConnectivityState) -> SubchannelState {
    SubchannelState {
        connectivity_state: state,
        last_connection_error: None,
    }
}

pub(crate) fn failed_subchannel_state(err: &str) -> SubchannelState {
    SubchannelState {
        connectivity_state: ConnectivityState::TransientFailure,
        last_connection_error: Some(Arc::from(Box::<dyn Error + Send + Sync>::from(
            err.to_string(),
        ))),
    }
}

// Verifies that the expected number of subchannels is created. Returns the
// subchannels created.
pub(crate) async fn verify_subchannel_creation_from_policy(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    number_of_subchannels: usize,
) -> Vec<Arc<dyn Subchannel>> {
    let mut subchannels = Vec::new();
    for _ in 0..number_of_subchannels {
        match rx_events.recv().await.unwrap() {
            TestEvent::NewSubchannel(sc) => subchannels.push(sc),
            other => panic!("unexpected event {other:?}"),
        };
    }
    subchannels
}

// Verifies that the policy asks the subchannel with the given address to
// connect.
pub(crate) async fn verify_connection_attempt_from_policy(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    want: &Address,
) {
    match rx_events.recv().await.unwrap() {
        TestEvent::Connect(addr) => assert_eq!(&addr, want),
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the policy publishes a picker with the given state.  Returns
// the update for further checks.
pub(crate) async fn verify_picker_update_from_policy(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    want: ConnectivityState,
) -> LbState {
    match rx_events.recv().await.unwrap() {
        TestEvent::UpdatePicker(update) => {
            assert_eq!(update.connectivity_state, want);
            update
        }
        other => panic!("unexpected event {other:?}, want picker update with state {want}"),
    }
}

pub(crate) async fn verify_resolution_request_from_policy(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
) {
    match rx_events.recv().await.unwrap() {
        TestEvent::RequestResolution => {}
        other => panic!("unexpected event {other:?}"),
    }
}

// Verifies that the policy does nothing observable for a short while.
pub(crate) async fn verify_no_activity_from_policy(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
) {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        event = rx_events.recv() => {
            panic!("unexpected event {:?}", event.unwrap());
        }
    }
}

// Returns the subchannel a pick resolves to, panicking otherwise.
pub(crate) fn picked_subchannel(result: PickResult) -> Arc<dyn Subchannel> {
    match result {
        PickResult::Pick(pick) => pick.subchannel,
        other => panic!("unexpected pick result {other}"),
    }
}
