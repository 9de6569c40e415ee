/// End to end tests for unreliable and in-sync messages

use skein_shared::Reliability;
use skein_test::{
    assert_no_duplicates, numbered, numbers_of, LinkConditions, TestLink, DATA, SNAPSHOT,
};

#[test]
fn unreliable_messages_are_lost_but_never_repeated() {
    let mut link = TestLink::with_conditions(LinkConditions::lossy(0.25), 11);
    link.connect();

    let mut received = Vec::new();
    for number in 0..60u32 {
        let now = link.now;
        link.client
            .send(now, DATA, Reliability::Unreliable, &numbered(number));
        link.tick();
        received.extend(link.server.take_received());
    }
    link.ticks(10);
    received.extend(link.server.take_received());

    let numbers = numbers_of(&received, DATA);
    assert_no_duplicates(&numbers, 60);
    assert!(numbers.len() < 60, "nothing was lost on a lossy link");
    assert!(numbers.len() > 20, "too much was lost: {}", numbers.len());
}

#[test]
fn unreliable_messages_on_a_perfect_link_all_arrive() {
    let mut link = TestLink::new();
    link.connect();
    let now = link.now;
    for number in 0..10u32 {
        link.client
            .send(now, DATA, Reliability::Unreliable, &numbered(number));
    }
    link.ticks(5);

    let mut numbers = numbers_of(&link.server.take_received(), DATA);
    numbers.sort_unstable();
    assert_eq!(numbers, (0..10).collect::<Vec<u32>>());
}

#[test]
fn in_sync_messages_never_go_backwards() {
    let conditions = LinkConditions {
        reorder: 0.5,
        ..Default::default()
    };
    let mut link = TestLink::with_conditions(conditions, 23);
    link.connect();

    let mut received = Vec::new();
    for number in 0..40u32 {
        let now = link.now;
        link.client
            .send(now, SNAPSHOT, Reliability::UnreliableOrdered, &numbered(number));
        link.tick();
        received.extend(link.server.take_received());
    }
    link.ticks(10);
    received.extend(link.server.take_received());

    let numbers = numbers_of(&received, SNAPSHOT);
    assert!(!numbers.is_empty());
    assert!(
        numbers.windows(2).all(|pair| pair[0] < pair[1]),
        "snapshots went backwards: {:?}",
        numbers
    );
    assert!(link.server.endpoint.stats().packets_reordered > 0);
}
