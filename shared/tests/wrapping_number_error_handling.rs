/// Tests for widening wire sequence numbers back to full sequence numbers

use skein_shared::{narrow_sequence, try_widen_sequence, widen_sequence, WrappingNumberError};

#[test]
fn try_widen_sequence_near_reference() {
    assert_eq!(try_widen_sequence(5, 3).unwrap(), 5);
    assert_eq!(try_widen_sequence(3, 5).unwrap(), 3);
    assert_eq!(try_widen_sequence(10, 10).unwrap(), 10);
}

#[test]
fn try_widen_sequence_across_the_wrap() {
    // forward over the 8 bit boundary
    assert_eq!(try_widen_sequence(2, 254).unwrap(), 258);
    assert_eq!(try_widen_sequence(0, 255).unwrap(), 256);

    // backward over the boundary
    assert_eq!(try_widen_sequence(250, 260).unwrap(), 250);
    assert_eq!(try_widen_sequence(255, 513).unwrap(), 511);
}

#[test]
fn try_widen_sequence_before_start() {
    let result = try_widen_sequence(200, 10);
    match result {
        Err(WrappingNumberError::BeforeStart { low, reference }) => {
            assert_eq!(low, 200);
            assert_eq!(reference, 10);
        }
        other => panic!("Expected BeforeStart, got {:?}", other),
    }
}

#[test]
fn before_start_message() {
    let error = try_widen_sequence(200, 10).unwrap_err();
    assert_eq!(
        error.to_string(),
        "Wire sequence 200 relative to 10 would precede sequence zero"
    );
}

#[test]
fn narrow_then_widen_is_identity_inside_the_radius() {
    for reference in [1u32, 100, 255, 256, 1000, 65_535, 1 << 20] {
        for offset in 0..100u32 {
            let seq = reference + offset;
            assert_eq!(
                try_widen_sequence(narrow_sequence(seq), reference).unwrap(),
                seq,
                "seq {} against reference {}",
                seq,
                reference
            );
        }
    }
}

#[test]
fn widen_sequence_matches_try_version() {
    for reference in [128u32, 300, 4096] {
        for low in 0..=255u8 {
            assert_eq!(
                widen_sequence(low, reference),
                try_widen_sequence(low, reference).unwrap()
            );
        }
    }
}

#[test]
#[should_panic(expected = "wire sequence precedes sequence zero")]
fn widen_sequence_panics_before_start() {
    widen_sequence(200, 10);
}
