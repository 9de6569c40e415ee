use thiserror::Error;

use crate::constants::{SEQUENCE_NUMBER_DIAMETER, SEQUENCE_NUMBER_MASK, SEQUENCE_NUMBER_RADIUS};

/// Errors that can occur while widening a wire sequence number
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WrappingNumberError {
    /// The nearest candidate lies before sequence number zero
    #[error("Wire sequence {low} relative to {reference} would precede sequence zero")]
    BeforeStart { low: u8, reference: u32 },
}

/// Reconstructs a full sequence number from its low 8 bits, choosing the
/// candidate closest to `reference` (normally the next expected sequence).
///
/// # Examples
/// ```
/// # use skein_shared::try_widen_sequence;
/// assert_eq!(try_widen_sequence(5, 3).unwrap(), 5);
/// assert_eq!(try_widen_sequence(2, 254).unwrap(), 258);
/// assert_eq!(try_widen_sequence(250, 260).unwrap(), 250);
/// assert!(try_widen_sequence(200, 10).is_err());
/// ```
pub fn try_widen_sequence(low: u8, reference: u32) -> Result<u32, WrappingNumberError> {
    let low_u32 = u32::from(low);
    let base = reference & !SEQUENCE_NUMBER_MASK;
    let candidate = base | low_u32;

    if candidate > reference && candidate - reference > SEQUENCE_NUMBER_RADIUS {
        return candidate
            .checked_sub(SEQUENCE_NUMBER_DIAMETER)
            .ok_or(WrappingNumberError::BeforeStart { low, reference });
    }
    if candidate < reference && reference - candidate >= SEQUENCE_NUMBER_RADIUS {
        return Ok(candidate.wrapping_add(SEQUENCE_NUMBER_DIAMETER));
    }
    Ok(candidate)
}

/// Reconstructs a full sequence number from its low 8 bits.
///
/// # Panics
///
/// Panics if the closest candidate would precede sequence zero.
///
/// # Examples
/// ```
/// # use skein_shared::widen_sequence;
/// assert_eq!(widen_sequence(0, 255), 256);
/// ```
pub fn widen_sequence(low: u8, reference: u32) -> u32 {
    try_widen_sequence(low, reference).expect("wire sequence precedes sequence zero")
}

/// Low 8 bits of a sequence number as carried on the wire
pub fn narrow_sequence(seq: u32) -> u8 {
    (seq & SEQUENCE_NUMBER_MASK) as u8
}

#[cfg(test)]
mod widen_tests {
    use super::{narrow_sequence, try_widen_sequence, widen_sequence, WrappingNumberError};

    #[test]
    fn same_block() {
        assert_eq!(widen_sequence(10, 12), 10);
        assert_eq!(widen_sequence(12, 10), 12);
    }

    #[test]
    fn forward_across_block() {
        assert_eq!(widen_sequence(1, 255), 257);
        assert_eq!(widen_sequence(1, 511), 513);
    }

    #[test]
    fn backward_across_block() {
        assert_eq!(widen_sequence(255, 257), 255);
    }

    #[test]
    fn half_way_points_forward() {
        // exactly half the diameter ahead stays ahead
        assert_eq!(widen_sequence(128, 0), 128);
        // and half the diameter behind wraps forward
        assert_eq!(widen_sequence(0, 128), 256);
    }

    #[test]
    fn before_start_is_error() {
        let result = try_widen_sequence(250, 3);
        assert!(matches!(
            result,
            Err(WrappingNumberError::BeforeStart { low: 250, reference: 3 })
        ));
    }

    #[test]
    fn narrow_then_widen() {
        for seq in [0u32, 1, 200, 255, 256, 1000, 70_000] {
            assert_eq!(widen_sequence(narrow_sequence(seq), seq), seq);
            assert_eq!(widen_sequence(narrow_sequence(seq), seq.saturating_sub(20)), seq);
        }
    }
}
