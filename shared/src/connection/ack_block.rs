use skein_serde::{BitReader, BitWrite, SerdeErr};

use crate::{
    constants::{ACK_SYMBOL_BITS, WINDOW_SIZE},
    types::SequenceNumber,
};

const NACK: u64 = 0;
const ACK: u64 = 1;
const END_RETURN_NEEDED: u64 = 2;
const END_RETURN_NOT_NEEDED: u64 = 3;

/// SECURITY: the peer can never owe us more verdicts than this
pub const MAX_ACKS_PER_PACKET: usize = 2 * WINDOW_SIZE as usize;

/// One received (or skipped) input sequence the peer has not yet seen our
/// verdict for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingAck {
    pub received: bool,
    /// The packet carried messages, so the peer expects a reply
    pub had_data: bool,
    pub urgent: bool,
}

impl PendingAck {
    pub fn received(had_data: bool, urgent: bool) -> Self {
        Self {
            received: true,
            had_data,
            urgent,
        }
    }

    /// A sequence that never arrived
    pub fn skipped() -> Self {
        Self {
            received: false,
            had_data: false,
            urgent: true,
        }
    }
}

/// Verdicts for consecutive output sequences, oldest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AckBlock {
    pub verdicts: Vec<bool>,
    /// The sender wants a packet back even if we have nothing to say
    pub return_needed: bool,
}

impl AckBlock {
    pub fn write(
        writer: &mut dyn BitWrite,
        verdicts: impl Iterator<Item = bool>,
        return_needed: bool,
    ) {
        for verdict in verdicts {
            writer.write_bits(if verdict { ACK } else { NACK }, ACK_SYMBOL_BITS);
        }
        let end = if return_needed {
            END_RETURN_NEEDED
        } else {
            END_RETURN_NOT_NEEDED
        };
        writer.write_bits(end, ACK_SYMBOL_BITS);
    }

    pub fn read(reader: &mut BitReader) -> Result<Self, SerdeErr> {
        let mut verdicts = Vec::new();
        loop {
            match reader.read_bits(ACK_SYMBOL_BITS)? {
                NACK => verdicts.push(false),
                ACK => verdicts.push(true),
                END_RETURN_NEEDED => {
                    return Ok(Self {
                        verdicts,
                        return_needed: true,
                    })
                }
                _ => {
                    return Ok(Self {
                        verdicts,
                        return_needed: false,
                    })
                }
            }
            if verdicts.len() > MAX_ACKS_PER_PACKET {
                return Err(SerdeErr::InvalidValue {
                    value: verdicts.len() as u64,
                    type_name: "ack block length",
                });
            }
        }
    }

    /// Pairs each verdict with the output sequence it resolves. Verdicts are
    /// numbered consecutively after the `resolved` sequences the basis
    /// already accounts for.
    pub fn sequences(
        &self,
        resolved: SequenceNumber,
    ) -> impl Iterator<Item = (SequenceNumber, bool)> + '_ {
        self.verdicts
            .iter()
            .enumerate()
            .map(move |(offset, verdict)| (resolved + 1 + offset as SequenceNumber, *verdict))
    }
}

#[cfg(test)]
mod ack_block_tests {
    use skein_serde::BitWriter;

    use super::*;

    #[test]
    fn empty_block_is_one_symbol() {
        let mut writer = BitWriter::new();
        AckBlock::write(&mut writer, std::iter::empty(), false);
        assert_eq!(writer.bits_written(), u32::from(ACK_SYMBOL_BITS));

        let bytes = writer.to_bytes();
        let block = AckBlock::read(&mut BitReader::new(&bytes)).unwrap();
        assert!(block.verdicts.is_empty());
        assert!(!block.return_needed);
    }

    #[test]
    fn verdicts_number_after_the_basis() {
        let block = AckBlock {
            verdicts: vec![true, false, true],
            return_needed: true,
        };
        let numbered: Vec<_> = block.sequences(9).collect();
        assert_eq!(numbered, vec![(10, true), (11, false), (12, true)]);
    }

    #[test]
    fn runaway_block_is_rejected() {
        let mut writer = BitWriter::new();
        for _ in 0..=MAX_ACKS_PER_PACKET {
            writer.write_bits(ACK, ACK_SYMBOL_BITS);
        }
        let bytes = writer.to_bytes();
        assert!(AckBlock::read(&mut BitReader::new(&bytes)).is_err());
    }

    #[test]
    fn truncated_block_underflows() {
        let bytes = [0u8];
        assert!(matches!(
            AckBlock::read(&mut BitReader::new(&bytes)),
            Err(SerdeErr::Underflow { .. })
        ));
    }
}
