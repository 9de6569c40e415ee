/// End to end tests for reliable delivery: every message arrives exactly
/// once and ordered messages arrive in the order they were queued

use proptest::prelude::*;
use skein_shared::{Reliability, SendableHandle};
use skein_test::{
    assert_in_order, assert_no_duplicates, numbered, numbers_of, LinkConditions, TestLink, DATA,
};

/// Queues `count` numbered messages on the client
fn queue_numbered(
    link: &mut TestLink,
    reliability: Reliability,
    count: u32,
) -> Vec<SendableHandle> {
    let now = link.now;
    (0..count)
        .map(|number| link.client.send(now, DATA, reliability, &numbered(number)))
        .collect()
}

/// Ticks until the server holds `count` messages or `max_ticks` pass
fn collect_numbers(link: &mut TestLink, count: usize, max_ticks: usize) -> Vec<u32> {
    let mut received = Vec::new();
    link.run_until(max_ticks, |link| {
        received.extend(link.server.take_received());
        received.len() >= count
    });
    // a little longer, so late duplicates would show up
    link.ticks(10);
    received.extend(link.server.take_received());
    numbers_of(&received, DATA)
}

#[test]
fn ordered_messages_arrive_in_order() {
    let mut link = TestLink::new();
    link.connect();
    queue_numbered(&mut link, Reliability::ReliableOrdered, 50);

    let numbers = collect_numbers(&mut link, 50, 100);
    assert_in_order(&numbers, 50);
}

#[test]
fn ordered_messages_spanning_many_packets() {
    let mut link = TestLink::new();
    link.connect();
    let now = link.now;
    // roughly 300 bytes each, a few per packet
    for number in 0..40u32 {
        let mut payload = numbered(number);
        payload.resize(300, 0xaa);
        link.client
            .send(now, DATA, Reliability::ReliableOrdered, &payload);
    }

    let mut received = Vec::new();
    let done = link.run_until(200, |link| {
        received.extend(link.server.take_received());
        received.len() >= 40
    });
    assert!(done, "only {} of 40 messages arrived", received.len());
    let numbers: Vec<u32> = received
        .iter()
        .map(|message| u32::from_le_bytes(message.payload[..4].try_into().unwrap()))
        .collect();
    assert_in_order(&numbers, 40);
    assert!(link.client.endpoint.stats().packets_sent > 4);
}

#[test]
fn ordered_messages_survive_loss_and_reordering() {
    let _ = env_logger::try_init();
    let conditions = LinkConditions {
        loss: 0.15,
        duplicate: 0.05,
        reorder: 0.1,
    };
    let mut link = TestLink::with_conditions(conditions, 42);
    link.connect();
    let handles = queue_numbered(&mut link, Reliability::ReliableOrdered, 30);

    let numbers = collect_numbers(&mut link, 30, 600);
    assert_in_order(&numbers, 30);

    // every message is acked and its slot reclaimed
    let settled = link.run_until(200, |link| {
        handles
            .iter()
            .all(|handle| link.client.endpoint.sendable_state(*handle).is_none())
    });
    assert!(settled);
}

#[test]
fn unordered_reliable_messages_all_arrive_once() {
    let conditions = LinkConditions {
        loss: 0.2,
        duplicate: 0.1,
        reorder: 0.2,
    };
    let mut link = TestLink::with_conditions(conditions, 7);
    link.connect();
    queue_numbered(&mut link, Reliability::ReliableUnordered, 25);

    let mut numbers = collect_numbers(&mut link, 25, 600);
    assert_no_duplicates(&numbers, 25);
    numbers.sort_unstable();
    assert_in_order(&numbers, 25);
}

#[test]
fn both_directions_at_once() {
    let mut link = TestLink::with_conditions(LinkConditions::lossy(0.1), 5);
    link.connect();
    let now = link.now;
    for number in 0..20u32 {
        link.client
            .send(now, DATA, Reliability::ReliableOrdered, &numbered(number));
        link.server
            .send(now, DATA, Reliability::ReliableOrdered, &numbered(number));
    }

    let mut at_server = Vec::new();
    let mut at_client = Vec::new();
    let done = link.run_until(600, |link| {
        at_server.extend(link.server.take_received());
        at_client.extend(link.client.take_received());
        at_server.len() >= 20 && at_client.len() >= 20
    });
    assert!(done);
    assert_in_order(&numbers_of(&at_server, DATA), 20);
    assert_in_order(&numbers_of(&at_client, DATA), 20);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn ordering_holds_for_any_link_seed(seed in any::<u64>()) {
        let conditions = LinkConditions {
            loss: 0.1,
            duplicate: 0.05,
            reorder: 0.1,
        };
        let mut link = TestLink::with_conditions(conditions, seed);
        link.connect();
        queue_numbered(&mut link, Reliability::ReliableOrdered, 15);

        let numbers = collect_numbers(&mut link, 15, 600);
        prop_assert_eq!(numbers, (0..15).collect::<Vec<u32>>());
    }
}
