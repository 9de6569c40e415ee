/// End to end tests for disconnects, timeouts, back-off and state change
/// blocking

use std::time::Duration;

use skein_shared::{
    BytesSendable, DisconnectReason, EndpointConfig, EndpointError, EndpointEvent, Reliability,
};
use skein_test::{numbered, LinkConditions, TestLink, DATA, SPAWN};

#[test]
fn local_disconnect_closes_both_sides() {
    let mut link = TestLink::new();
    link.connect();
    link.client.take_events();
    link.server.take_events();

    let now = link.now;
    link.client.endpoint.disconnect(now);
    let closed = link.run_until(40, |link| {
        link.client.endpoint.is_closed() && link.server.endpoint.is_closed()
    });
    assert!(closed);

    assert!(link
        .client
        .take_events()
        .contains(&EndpointEvent::Disconnected(DisconnectReason::LocalDisconnect)));
    let code = DisconnectReason::LocalDisconnect.code();
    assert!(link
        .server
        .take_events()
        .contains(&EndpointEvent::Disconnected(DisconnectReason::RemoteDisconnect { code })));
}

#[test]
fn disconnect_rejects_queued_messages() {
    let mut link = TestLink::new();
    link.connect();
    let now = link.now;
    let handle = link
        .client
        .send(now, DATA, Reliability::ReliableOrdered, &numbered(1));

    link.client.endpoint.disconnect(now);
    assert!(link.client.endpoint.sendable_state(handle).is_none());
    assert!(link.client.endpoint.queue().is_empty());
    let late = BytesSendable::new(DATA, Reliability::Unreliable, numbered(2));
    assert!(link
        .client
        .endpoint
        .add_sendable(now, Box::new(late), &[])
        .is_err());
}

#[test]
fn silent_peer_times_out() {
    let config = EndpointConfig {
        inactivity_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let mut link = TestLink::with_config(config, LinkConditions::perfect(), 1);
    link.connect();
    link.client.take_events();

    // the server can still hear the client but can no longer answer
    link.server.socket.close();
    let closed = link.run_until(200, |link| link.client.endpoint.is_closed());
    assert!(closed);
    assert!(link
        .client
        .take_events()
        .contains(&EndpointEvent::Disconnected(DisconnectReason::Timeout { seconds: 2 })));
}

#[test]
fn peer_can_be_asked_to_back_off() {
    let mut link = TestLink::new();

    // not before the handshake
    let result = link
        .server
        .endpoint
        .request_peer_back_off(&mut link.server.socket);
    assert!(matches!(result, Err(EndpointError::InvalidState { .. })));

    link.connect();
    link.server
        .endpoint
        .request_peer_back_off(&mut link.server.socket)
        .unwrap();
    link.tick();
    assert!(link.client.endpoint.is_backing_off());

    // packets keep arriving, so the back-off ends quickly
    let recovered = link.run_until(20, |link| !link.client.endpoint.is_backing_off());
    assert!(recovered);

    let now = link.now;
    link.client
        .send(now, DATA, Reliability::ReliableOrdered, &numbered(9));
    link.ticks(6);
    assert_eq!(link.server.take_received().len(), 1);
}

#[test]
fn state_changes_unblock_once_delivered() {
    let mut link = TestLink::with_conditions(LinkConditions::lossy(0.2), 31);
    link.connect();
    link.client.take_events();

    let now = link.now;
    for number in 0..3u32 {
        link.client
            .send(now, SPAWN, Reliability::ReliableOrdered, &numbered(number));
    }
    assert!(link.client.endpoint.is_blocking_state_change());

    let unblocked = link.run_until(400, |link| !link.client.endpoint.is_blocking_state_change());
    assert!(unblocked);
    assert!(link
        .client
        .take_events()
        .contains(&EndpointEvent::NoBlockingMessages));
    assert_eq!(link.server.take_received().len(), 3);
}

#[test]
fn heavy_loss_backs_off_then_exhausts_retries() {
    let config = EndpointConfig {
        nack_back_off_threshold: 2,
        reliable_retry_budget: Some(1),
        ..Default::default()
    };
    let mut link = TestLink::with_config(config, LinkConditions::perfect(), 3);
    link.connect();
    link.client.take_events();
    link.client
        .socket
        .set_outbound_conditions(LinkConditions::lossy(0.7));

    let mut backed_off = false;
    let mut number = 0u32;
    link.run_until(200, |link| {
        if link.client.endpoint.is_connected() {
            let now = link.now;
            link.client
                .send(now, DATA, Reliability::ReliableUnordered, &numbered(number));
            number += 1;
        }
        backed_off |= link.client.endpoint.is_backing_off();
        link.client.endpoint.is_closed()
    });

    assert!(backed_off);
    let exhausted = link.client.take_events().into_iter().any(|event| {
        matches!(
            event,
            EndpointEvent::Disconnected(DisconnectReason::RetriesExhausted { .. })
        )
    });
    assert!(exhausted);
    assert!(link.client.endpoint.is_closed());
}
