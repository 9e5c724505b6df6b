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

use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::Code;

use super::*;
use crate::attributes::Attributes;
use crate::client::load_balancing::test_utils::{
    self, TestChannelController, TestEvent, failed_subchannel_state, new_request,
    picked_subchannel, subchannel_state, verify_connection_attempt_from_policy,
    verify_no_activity_from_policy, verify_picker_update_from_policy,
    verify_resolution_request_from_policy, verify_subchannel_creation_from_policy,
};
use crate::service::WAIT_FOR_READY;

fn setup() -> (
    mpsc::UnboundedReceiver<TestEvent>,
    PickFirstPolicy,
    TestChannelController,
) {
    let (tx_events, rx_events) = mpsc::unbounded_channel();
    let policy = PickFirstPolicy::new(test_utils::test_options(&tx_events));
    let controller = TestChannelController { tx_events };
    (rx_events, policy, controller)
}

fn addresses(addrs: &[&str]) -> Vec<Address> {
    addrs.iter().map(|addr| Address::tcp(*addr)).collect()
}

// One endpoint per address.
fn update_with_addresses(addrs: &[&str]) -> ResolverUpdate {
    ResolverUpdate {
        endpoints: Ok(addrs
            .iter()
            .map(|addr| Endpoint::new(vec![Address::tcp(*addr)]))
            .collect()),
        ..Default::default()
    }
}

// Sends an update with the given addresses and consumes the resulting
// subchannel creations and IDLE picker.
async fn send_initial_update(
    policy: &mut PickFirstPolicy,
    controller: &mut TestChannelController,
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    addrs: &[&str],
) -> Vec<Arc<dyn Subchannel>> {
    policy
        .resolver_update(update_with_addresses(addrs), None, controller)
        .unwrap();
    let subchannels = verify_subchannel_creation_from_policy(rx_events, addrs.len()).await;
    verify_picker_update_from_policy(rx_events, ConnectivityState::Idle).await;
    subchannels
}

// Starts connecting and selects the first address.
async fn select_first(
    policy: &mut PickFirstPolicy,
    controller: &mut TestChannelController,
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    subchannels: &[Arc<dyn Subchannel>],
) -> LbState {
    policy.exit_idle(controller);
    verify_connection_attempt_from_policy(rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(rx_events, ConnectivityState::Connecting).await;
    policy.subchannel_update(
        subchannels[0].clone(),
        &subchannel_state(ConnectivityState::Ready),
        controller,
    );
    verify_picker_update_from_policy(rx_events, ConnectivityState::Ready).await
}

fn expect_failed_pick(picker: &dyn Picker) -> Status {
    match picker.pick(&new_request()) {
        PickResult::Fail(status) => status,
        other => panic!("unexpected pick result {other}"),
    }
}

#[tokio::test]
async fn pickfirst_is_idle_until_asked_to_connect() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1", "2.2.2.2:2"])
            .await;
    assert_eq!(subchannels.len(), 2);
    assert_eq!(policy.check_connectivity(), ConnectivityState::Idle);
    verify_no_activity_from_policy(&mut rx_events).await;
}

#[tokio::test]
async fn pickfirst_tries_addresses_in_order_until_one_is_ready() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels = send_initial_update(
        &mut policy,
        &mut controller,
        &mut rx_events,
        &["1.1.1.1:1", "2.2.2.2:2", "3.3.3.3:3"],
    )
    .await;

    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;

    policy.subchannel_update(
        subchannels[0].clone(),
        &failed_subchannel_state("connection refused"),
        &mut controller,
    );
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[1].address()).await;

    policy.subchannel_update(
        subchannels[1].clone(),
        &failed_subchannel_state("connection refused"),
        &mut controller,
    );
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[2].address()).await;

    policy.subchannel_update(
        subchannels[2].clone(),
        &subchannel_state(ConnectivityState::Ready),
        &mut controller,
    );
    let update = verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Ready).await;
    for _ in 0..3 {
        let picked = picked_subchannel(update.picker.pick(&new_request()));
        assert!(Arc::ptr_eq(&picked, &subchannels[2]));
    }
    assert!(
        policy
            .selected()
            .is_some_and(|selected| Arc::ptr_eq(&selected, &subchannels[2]))
    );
}

#[tokio::test]
async fn pickfirst_reports_shutdown_after_every_address_fails_once() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1", "2.2.2.2:2"])
            .await;
    let queuing_picker = policy.picker();

    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;

    policy.subchannel_update(
        subchannels[0].clone(),
        &failed_subchannel_state("first failure"),
        &mut controller,
    );
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[1].address()).await;

    policy.subchannel_update(
        subchannels[1].clone(),
        &failed_subchannel_state("second failure"),
        &mut controller,
    );
    let update = verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Shutdown).await;
    verify_resolution_request_from_policy(&mut rx_events).await;
    assert_eq!(policy.check_connectivity(), ConnectivityState::Shutdown);

    let want = "failed to connect to all addresses; last error: second failure";
    let status = expect_failed_pick(update.picker.as_ref());
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), want);
    // Pickers published earlier fail the same way.
    assert_eq!(expect_failed_pick(queuing_picker.as_ref()).message(), want);

    // Nothing is retried within the same address list.
    policy.subchannel_update(
        subchannels[0].clone(),
        &subchannel_state(ConnectivityState::Idle),
        &mut controller,
    );
    verify_no_activity_from_policy(&mut rx_events).await;
}

#[tokio::test]
async fn pickfirst_skips_addresses_already_known_to_fail() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels = send_initial_update(
        &mut policy,
        &mut controller,
        &mut rx_events,
        &["1.1.1.1:1", "2.2.2.2:2", "3.3.3.3:3"],
    )
    .await;
    // The second subchannel is shared with another channel and already
    // failing.
    policy.subchannel_update(
        subchannels[1].clone(),
        &failed_subchannel_state("already failing"),
        &mut controller,
    );
    verify_no_activity_from_policy(&mut rx_events).await;

    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;

    policy.subchannel_update(
        subchannels[0].clone(),
        &failed_subchannel_state("connection refused"),
        &mut controller,
    );
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[2].address()).await;
}

#[tokio::test]
async fn pickfirst_ignores_updates_from_subchannels_not_being_tried() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1", "2.2.2.2:2"])
            .await;
    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;

    // The second address is not being tried yet.
    policy.subchannel_update(
        subchannels[1].clone(),
        &subchannel_state(ConnectivityState::Ready),
        &mut controller,
    );
    verify_no_activity_from_policy(&mut rx_events).await;

    // A subchannel this policy never created.
    let (tx_other, _rx_other) = mpsc::unbounded_channel();
    let stranger: Arc<dyn Subchannel> = Arc::new(test_utils::TestSubchannel::new(
        Address::tcp("9.9.9.9:9"),
        tx_other,
    ));
    policy.subchannel_update(
        stranger,
        &subchannel_state(ConnectivityState::Ready),
        &mut controller,
    );
    verify_no_activity_from_policy(&mut rx_events).await;
    assert!(policy.selected().is_none());
}

#[tokio::test]
async fn pickfirst_removes_shut_down_subchannels_in_order() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels = send_initial_update(
        &mut policy,
        &mut controller,
        &mut rx_events,
        &["1.1.1.1:1", "2.2.2.2:2", "3.3.3.3:3"],
    )
    .await;
    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;

    for i in 0..2 {
        policy.subchannel_update(
            subchannels[i].clone(),
            &subchannel_state(ConnectivityState::Shutdown),
            &mut controller,
        );
        verify_connection_attempt_from_policy(&mut rx_events, &subchannels[i + 1].address()).await;
        verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;
    }

    policy.subchannel_update(
        subchannels[2].clone(),
        &subchannel_state(ConnectivityState::Shutdown),
        &mut controller,
    );
    let update = verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Shutdown).await;
    verify_resolution_request_from_policy(&mut rx_events).await;
    assert_eq!(
        expect_failed_pick(update.picker.as_ref()).message(),
        "Pick first exhausted channels"
    );
}

#[tokio::test]
async fn pickfirst_queued_picks_complete_on_selection() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    let picker = policy.picker();

    let PickOutcome::Queued(first) = picker.pick_or_queue(&new_request()) else {
        panic!("pick was not queued");
    };
    match rx_events.recv().await.unwrap() {
        TestEvent::ScheduleWork => {}
        other => panic!("unexpected event {other:?}"),
    }
    // Only the first pick asks to leave idle.
    let PickOutcome::Queued(second) = picker.pick_or_queue(&new_request()) else {
        panic!("pick was not queued");
    };
    verify_no_activity_from_policy(&mut rx_events).await;
    assert_eq!(picker.pending_picks(), 2);

    policy.work(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;
    policy.subchannel_update(
        subchannels[0].clone(),
        &subchannel_state(ConnectivityState::Ready),
        &mut controller,
    );
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Ready).await;

    assert!(Arc::ptr_eq(&first.await.unwrap().subchannel, &subchannels[0]));
    assert!(Arc::ptr_eq(&second.await.unwrap().subchannel, &subchannels[0]));
    assert_eq!(picker.pending_picks(), 0);
    match picker.pick_or_queue(&new_request()) {
        PickOutcome::Complete(pick) => assert!(Arc::ptr_eq(&pick.subchannel, &subchannels[0])),
        _ => panic!("pick did not complete immediately"),
    }
}

#[tokio::test]
async fn pickfirst_cancels_queued_picks() {
    let (mut rx_events, mut policy, mut controller) = setup();
    send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    let picker = policy.picker();

    let queue = |request: Request| match picker.pick_or_queue(&request) {
        PickOutcome::Queued(pick) => pick,
        _ => panic!("pick was not queued"),
    };
    let plain = queue(new_request());
    let wait_for_ready = queue(new_request().with_flags(WAIT_FOR_READY));
    let other = queue(new_request());

    assert_eq!(picker.cancel_picks(WAIT_FOR_READY, WAIT_FOR_READY), 1);
    let status = wait_for_ready.await.err().unwrap();
    assert_eq!(status.code(), Code::Cancelled);
    assert_eq!(status.message(), "Pick Cancelled");

    let id = plain.id();
    assert!(picker.cancel_pick(id));
    assert!(!picker.cancel_pick(id));
    assert_eq!(plain.await.err().unwrap().code(), Code::Cancelled);

    assert_eq!(picker.pending_picks(), 1);
    policy.shutdown();
    assert_eq!(other.await.err().unwrap().code(), Code::Unavailable);
}

#[tokio::test]
async fn pickfirst_shutdown_fails_pending_picks() {
    let (mut rx_events, mut policy, mut controller) = setup();
    send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    let picker = policy.picker();
    let mut state_change = policy.notify_on_state_change(ConnectivityState::Idle);

    let PickOutcome::Queued(pick) = picker.pick_or_queue(&new_request()) else {
        panic!("pick was not queued");
    };
    policy.shutdown();
    policy.shutdown();
    let status = pick.await.err().unwrap();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), "Channel shutdown");
    assert_eq!(policy.check_connectivity(), ConnectivityState::Shutdown);
    assert_eq!(state_change.try_recv().unwrap(), ConnectivityState::Shutdown);

    match picker.pick_or_queue(&new_request()) {
        PickOutcome::Failed(status) => assert_eq!(status.message(), "Channel shutdown"),
        _ => panic!("pick after shutdown did not fail"),
    }
}

#[tokio::test]
async fn pickfirst_drop_fails_pending_picks() {
    let (mut rx_events, mut policy, mut controller) = setup();
    send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    let PickOutcome::Queued(pick) = policy.picker().pick_or_queue(&new_request()) else {
        panic!("pick was not queued");
    };
    drop(policy);
    assert_eq!(pick.await.err().unwrap().code(), Code::Unavailable);
}

#[tokio::test]
async fn pickfirst_keeps_selection_while_address_is_present() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    select_first(&mut policy, &mut controller, &mut rx_events, &subchannels).await;

    policy
        .resolver_update(
            update_with_addresses(&["2.2.2.2:2", "1.1.1.1:1"]),
            None,
            &mut controller,
        )
        .unwrap();
    verify_no_activity_from_policy(&mut rx_events).await;
    assert!(
        policy
            .selected()
            .is_some_and(|selected| Arc::ptr_eq(&selected, &subchannels[0]))
    );

    // The selected address is gone, so a new list is tried right away.
    policy
        .resolver_update(update_with_addresses(&["2.2.2.2:2"]), None, &mut controller)
        .unwrap();
    let new_subchannels = verify_subchannel_creation_from_policy(&mut rx_events, 1).await;
    verify_connection_attempt_from_policy(&mut rx_events, &new_subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;
    assert!(policy.selected().is_none());
}

#[tokio::test]
async fn pickfirst_reports_shutdown_when_selected_subchannel_fails() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    select_first(&mut policy, &mut controller, &mut rx_events, &subchannels).await;

    // Losing the connection gracefully is mirrored.
    policy.subchannel_update(
        subchannels[0].clone(),
        &subchannel_state(ConnectivityState::Idle),
        &mut controller,
    );
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Idle).await;
    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;

    policy.subchannel_update(
        subchannels[0].clone(),
        &failed_subchannel_state("connection reset"),
        &mut controller,
    );
    let update = verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Shutdown).await;
    verify_resolution_request_from_policy(&mut rx_events).await;
    assert!(
        expect_failed_pick(update.picker.as_ref())
            .message()
            .contains("connection reset")
    );
}

#[tokio::test]
async fn pickfirst_empty_address_list() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let update = ResolverUpdate {
        resolution_note: Some("no DNS entries".to_string()),
        ..Default::default()
    };
    let err = policy
        .resolver_update(update, None, &mut controller)
        .err()
        .unwrap();
    assert!(err.to_string().contains("empty address list"));
    let update =
        verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    verify_resolution_request_from_policy(&mut rx_events).await;
    assert_eq!(
        expect_failed_pick(update.picker.as_ref()).message(),
        "received empty address list from the name resolver (no DNS entries)"
    );
}

#[tokio::test]
async fn pickfirst_resolver_error_without_addresses() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let update = ResolverUpdate {
        endpoints: Err("dns lookup failed".to_string()),
        ..Default::default()
    };
    policy.resolver_update(update, None, &mut controller).unwrap();
    let update =
        verify_picker_update_from_policy(&mut rx_events, ConnectivityState::TransientFailure).await;
    assert_eq!(
        expect_failed_pick(update.picker.as_ref()).message(),
        "dns lookup failed"
    );
}

#[tokio::test]
async fn pickfirst_resolver_error_keeps_previous_addresses() {
    let (mut rx_events, mut policy, mut controller) = setup();
    send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1"]).await;
    let update = ResolverUpdate {
        endpoints: Err("dns lookup failed".to_string()),
        ..Default::default()
    };
    policy.resolver_update(update, None, &mut controller).unwrap();
    verify_no_activity_from_policy(&mut rx_events).await;
}

#[tokio::test]
async fn pickfirst_args_from_parent() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let args = PickFirstArgs {
        enable_health_checking: true,
        omit_status_message_prefix: true,
    };
    let update = ResolverUpdate {
        attributes: Attributes::new().add(args),
        ..update_with_addresses(&["1.1.1.1:1"])
    };
    policy.resolver_update(update, None, &mut controller).unwrap();
    let subchannels = verify_subchannel_creation_from_policy(&mut rx_events, 1).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Idle).await;
    assert!(
        subchannels[0]
            .address()
            .attributes
            .get::<EnableHealthCheck>()
            .is_some()
    );

    policy.exit_idle(&mut controller);
    verify_connection_attempt_from_policy(&mut rx_events, &subchannels[0].address()).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Connecting).await;
    policy.subchannel_update(
        subchannels[0].clone(),
        &failed_subchannel_state("connection refused"),
        &mut controller,
    );
    let update = verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Shutdown).await;
    assert_eq!(
        expect_failed_pick(update.picker.as_ref()).message(),
        "connection refused"
    );
}

#[tokio::test]
async fn pickfirst_removes_duplicate_addresses() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels = send_initial_update(
        &mut policy,
        &mut controller,
        &mut rx_events,
        &["1.1.1.1:1", "2.2.2.2:2"],
    )
    .await;
    assert_eq!(subchannels.len(), 2);

    let update = ResolverUpdate {
        endpoints: Ok(vec![
            Endpoint::new(addresses(&["3.3.3.3:3", "4.4.4.4:4"])),
            Endpoint::new(addresses(&["4.4.4.4:4", "3.3.3.3:3"])),
        ]),
        ..Default::default()
    };
    policy.resolver_update(update, None, &mut controller).unwrap();
    let subchannels = verify_subchannel_creation_from_policy(&mut rx_events, 2).await;
    verify_picker_update_from_policy(&mut rx_events, ConnectivityState::Idle).await;
    assert_eq!(subchannels[0].address(), Address::tcp("3.3.3.3:3"));
    assert_eq!(subchannels[1].address(), Address::tcp("4.4.4.4:4"));
}

#[tokio::test]
async fn pickfirst_reset_backoff_reaches_subchannels() {
    let (mut rx_events, mut policy, mut controller) = setup();
    let subchannels =
        send_initial_update(&mut policy, &mut controller, &mut rx_events, &["1.1.1.1:1", "2.2.2.2:2"])
            .await;
    policy.reset_backoff();
    for sc in &subchannels {
        match rx_events.recv().await.unwrap() {
            TestEvent::ResetBackoff(addr) => assert_eq!(addr, sc.address()),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[test]
fn pickfirst_parse_config() {
    let registry = LbPolicyRegistry::new();
    let builder = Builder::default();

    let config = ParsedJsonLbConfig::new(r#"{"shuffleAddressList": true}"#).unwrap();
    let parsed = builder.parse_config(&config, &registry).unwrap().unwrap();
    assert!(parsed.convert_to::<PickFirstConfig>().unwrap().shuffle_address_list);

    let config = ParsedJsonLbConfig::new("{}").unwrap();
    let parsed = builder.parse_config(&config, &registry).unwrap().unwrap();
    assert!(!parsed.convert_to::<PickFirstConfig>().unwrap().shuffle_address_list);

    let config = ParsedJsonLbConfig::new(r#"{"shuffleAddressList": 3}"#).unwrap();
    let err = builder.parse_config(&config, &registry).err().unwrap();
    assert!(err.to_string().contains("failed to parse JSON config"));
}
