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

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::client::ConnectivityState;
use crate::client::load_balancing::endpoint_list::EndpointList;
use crate::client::load_balancing::pick_first;
use crate::client::load_balancing::{
    ChannelController, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, PickResult,
    Picker, QueuingPicker, Subchannel, SubchannelState, aggregate_states,
    transient_failure_status,
};
use crate::client::name_resolution::ResolverUpdate;
use crate::client::service_config::LbConfig;
use crate::service::Request;

pub static POLICY_NAME: &str = "round_robin";

const EMPTY_ADDRESS_LIST: &str = "received empty address list from the name resolver";

#[derive(Debug, Default)]
pub struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        let child_builder = options
            .registry
            .get_policy(pick_first::POLICY_NAME)
            .unwrap_or_else(|| Arc::new(pick_first::Builder::default()));
        Box::new(RoundRobinPolicy {
            endpoint_list: EndpointList::new(child_builder, options),
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct RoundRobinPolicy {
    endpoint_list: EndpointList,
}

impl RoundRobinPolicy {
    // Sends an aggregate picker based on the states of the children.
    //
    // Nothing is sent until every child has reported once, unless one of them
    // is already READY.
    //
    // If the aggregate state is Ready, round robin across the Ready children.
    // If the aggregate state is Idle or Connecting, queue.
    // If the aggregate state is Transient Failure, round robin across the
    // failing children so that every error is surfaced.
    fn send_aggregate_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        let states: Vec<&LbState> = self
            .endpoint_list
            .endpoint_states()
            .filter_map(|(_, state)| state)
            .collect();
        let any_ready = states
            .iter()
            .any(|state| state.connectivity_state == ConnectivityState::Ready);
        if !any_ready && !self.endpoint_list.all_reported() {
            return;
        }

        let aggregate_state = aggregate_states(states.iter().map(|state| state.connectivity_state));
        let picker: Arc<dyn Picker> = match aggregate_state {
            ConnectivityState::Idle | ConnectivityState::Connecting => Arc::new(QueuingPicker {}),
            state => {
                let pickers: Vec<Arc<dyn Picker>> = states
                    .iter()
                    .filter(|child| child.connectivity_state == state)
                    .map(|child| child.picker.clone())
                    .collect();
                if pickers.is_empty() {
                    Arc::new(Failing {
                        error: "round_robin: no children".to_string(),
                    })
                } else {
                    Arc::new(RoundRobinPicker::new(pickers))
                }
            }
        };
        tracing::trace!(policy = POLICY_NAME, state = %aggregate_state, "sending aggregate picker");
        channel_controller.update_picker(LbState {
            connectivity_state: aggregate_state,
            picker,
        });
    }

    // Children are never left idle.
    fn move_children_from_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        let idle: Vec<usize> = self
            .endpoint_list
            .endpoint_states()
            .enumerate()
            .filter(|(_, (_, state))| {
                state.is_some_and(|s| s.connectivity_state == ConnectivityState::Idle)
            })
            .map(|(idx, _)| idx)
            .collect();
        for idx in idle {
            self.endpoint_list.exit_idle_child(idx, channel_controller);
        }
    }

    fn update_children_done(&mut self, channel_controller: &mut dyn ChannelController) {
        self.move_children_from_idle(channel_controller);
        if self.endpoint_list.has_updated() {
            self.send_aggregate_picker(channel_controller);
        }
    }

    fn move_to_transient_failure(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        error: String,
    ) {
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let note = update.resolution_note.clone();
        if let Ok(endpoints) = &update.endpoints {
            let addresses_available = endpoints.iter().any(|ep| !ep.addresses.is_empty());
            if !addresses_available {
                self.endpoint_list
                    .update(update.with_endpoints(Ok(vec![])), config, channel_controller)?;
                let status = transient_failure_status(EMPTY_ADDRESS_LIST, note.as_deref());
                self.move_to_transient_failure(channel_controller, status.message().to_string());
                return Err(EMPTY_ADDRESS_LIST.into());
            }
        }

        if let Err(err) = self
            .endpoint_list
            .update(update, config, channel_controller)
        {
            tracing::warn!(policy = POLICY_NAME, %err, "received error from resolver");
            // Keep using the previous endpoints, if there are any.
            if self.endpoint_list.is_empty() {
                let error = match err.downcast_ref::<tonic::Status>() {
                    Some(status) => status.message().to_string(),
                    None => err.to_string(),
                };
                self.move_to_transient_failure(channel_controller, error);
                return Err(err);
            }
            return Ok(());
        }
        self.update_children_done(channel_controller);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.endpoint_list
            .subchannel_update(subchannel, state, channel_controller);
        self.update_children_done(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        self.endpoint_list.work(channel_controller);
        self.update_children_done(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.endpoint_list.exit_idle(channel_controller);
        self.update_children_done(channel_controller);
    }

    fn reset_backoff(&mut self) {
        self.endpoint_list.reset_backoff();
    }
}

struct RoundRobinPicker {
    pickers: Vec<Arc<dyn Picker>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    // pickers must not be empty.
    fn new(pickers: Vec<Arc<dyn Picker>>) -> Self {
        let random_index: usize = rand::random_range(..pickers.len());
        Self {
            pickers,
            next: AtomicUsize::new(random_index),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let len = self.pickers.len();
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % len;
        self.pickers[idx].pick(request)
    }
}
