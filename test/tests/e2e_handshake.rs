/// End to end tests for connection setup over an in-memory link

use skein_shared::{ConnectionState, EndpointEvent};
use skein_test::{LinkConditions, TestLink};

#[test]
fn both_sides_connect_over_a_perfect_link() {
    let mut link = TestLink::new();
    assert_eq!(link.client.endpoint.state(), ConnectionState::Handshaking);

    link.connect();

    assert!(link.client.take_events().contains(&EndpointEvent::Connected));
    assert!(link.server.take_events().contains(&EndpointEvent::Connected));
}

#[test]
fn connected_is_raised_once() {
    let mut link = TestLink::new();
    link.connect();
    link.ticks(20);

    let connected = link
        .client
        .take_events()
        .into_iter()
        .filter(|event| *event == EndpointEvent::Connected)
        .count();
    assert_eq!(connected, 1);
}

#[test]
fn setup_is_repeated_until_it_gets_through() {
    let mut link = TestLink::with_conditions(LinkConditions::lossy(0.3), 17);
    link.connect();
    assert!(link.client.endpoint.is_connected());
    assert!(link.server.endpoint.is_connected());
}

#[test]
fn idle_connection_stays_up_on_heartbeats() {
    let _ = env_logger::try_init();
    let mut link = TestLink::new();
    link.connect();

    // well past the inactivity timeout of 30 seconds
    link.ticks(800);

    assert!(link.client.endpoint.is_connected());
    assert!(link.server.endpoint.is_connected());
    assert!(link.client.take_received().is_empty());
    assert!(link.server.endpoint.stats().packets_received > 0);
}
