use skein_shared::{MessageKind, ReceivedMessage};

/// Numbered payload used to check ordering: a little endian u32
pub fn numbered(number: u32) -> Vec<u8> {
    number.to_le_bytes().to_vec()
}

/// Reads back the numbers of `numbered` payloads of one kind, in arrival order
pub fn numbers_of(received: &[ReceivedMessage], kind: MessageKind) -> Vec<u32> {
    received
        .iter()
        .filter(|message| message.kind == kind)
        .filter_map(|message| {
            let bytes: [u8; 4] = message.payload.as_slice().try_into().ok()?;
            Some(u32::from_le_bytes(bytes))
        })
        .collect()
}

/// Asserts `numbers` is exactly `0..count` in order
pub fn assert_in_order(numbers: &[u32], count: u32) {
    let expected: Vec<u32> = (0..count).collect();
    assert_eq!(
        numbers,
        expected.as_slice(),
        "messages arrived out of order, duplicated or not at all"
    );
}

/// Asserts every number appears at most once and none lies outside `0..count`
pub fn assert_no_duplicates(numbers: &[u32], count: u32) {
    let mut seen = vec![false; count as usize];
    for number in numbers {
        assert!(*number < count, "unexpected message {}", number);
        assert!(!seen[*number as usize], "message {} arrived twice", number);
        seen[*number as usize] = true;
    }
}
