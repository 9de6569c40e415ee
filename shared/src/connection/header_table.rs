use std::sync::Arc;

use crate::{
    connection::packet_type::{PacketKind, PACKET_KIND_COUNT},
    constants::{HEADER_TABLE_SEED, PROTOCOL_VERSION},
};

/// Process-wide tables that hide the packet kind and the low sequence byte
/// behind seeded permutations. Both peers derive identical tables from the
/// same seed and protocol version, so nothing is exchanged.
///
/// Built once and shared by every endpoint through an `Arc`.
pub struct HeaderTable {
    kind_to_byte: [u8; PACKET_KIND_COUNT as usize],
    byte_to_kind: [Option<PacketKind>; 256],
    seq_to_byte: [u8; 256],
    byte_to_seq: [u8; 256],
}

impl HeaderTable {
    pub fn new(protocol_version: u32) -> Self {
        let rng = fastrand::Rng::with_seed(HEADER_TABLE_SEED ^ u64::from(protocol_version));

        let mut headers: Vec<u8> = (0..=255).collect();
        rng.shuffle(&mut headers);

        let mut kind_to_byte = [0u8; PACKET_KIND_COUNT as usize];
        let mut byte_to_kind = [None; 256];
        for index in 0..PACKET_KIND_COUNT {
            let byte = headers[usize::from(index)];
            kind_to_byte[usize::from(index)] = byte;
            byte_to_kind[usize::from(byte)] = PacketKind::from_index(index);
        }

        let mut sequence: Vec<u8> = (0..=255).collect();
        rng.shuffle(&mut sequence);

        let mut seq_to_byte = [0u8; 256];
        let mut byte_to_seq = [0u8; 256];
        for (plain, obfuscated) in sequence.iter().enumerate() {
            seq_to_byte[plain] = *obfuscated;
            byte_to_seq[usize::from(*obfuscated)] = plain as u8;
        }

        Self {
            kind_to_byte,
            byte_to_kind,
            seq_to_byte,
            byte_to_seq,
        }
    }

    /// Tables for the current protocol version, ready to share
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new(PROTOCOL_VERSION))
    }

    /// Header byte for a packet kind. Returns `None` for a sequenced kind
    /// whose tag lies outside the window.
    pub fn try_header_for(&self, kind: PacketKind) -> Option<u8> {
        kind.index()
            .map(|index| self.kind_to_byte[usize::from(index)])
    }

    /// Header byte for a packet kind
    ///
    /// # Panics
    ///
    /// Panics if a sequenced kind carries a tag outside the window
    pub fn header_for(&self, kind: PacketKind) -> u8 {
        self.try_header_for(kind)
            .expect("sequenced packet tag must lie inside the window")
    }

    /// SECURITY: header bytes come straight off the wire; unknown bytes yield `None`
    pub fn try_kind_for(&self, byte: u8) -> Option<PacketKind> {
        self.byte_to_kind[usize::from(byte)]
    }

    pub fn obfuscate_sequence(&self, low: u8) -> u8 {
        self.seq_to_byte[usize::from(low)]
    }

    pub fn clarify_sequence(&self, byte: u8) -> u8 {
        self.byte_to_seq[usize::from(byte)]
    }
}

#[cfg(test)]
mod header_table_tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn same_seed_same_tables() {
        let a = HeaderTable::new(PROTOCOL_VERSION);
        let b = HeaderTable::new(PROTOCOL_VERSION);
        for index in 0..PACKET_KIND_COUNT {
            let kind = PacketKind::from_index(index).unwrap();
            assert_eq!(a.header_for(kind), b.header_for(kind));
        }
        for low in 0..=255u8 {
            assert_eq!(a.obfuscate_sequence(low), b.obfuscate_sequence(low));
        }
    }

    #[test]
    fn headers_are_distinct_and_invertible() {
        let table = HeaderTable::new(PROTOCOL_VERSION);
        let mut seen = HashSet::new();
        for index in 0..PACKET_KIND_COUNT {
            let kind = PacketKind::from_index(index).unwrap();
            let byte = table.header_for(kind);
            assert!(seen.insert(byte));
            assert_eq!(table.try_kind_for(byte), Some(kind));
        }
        let unknown = (0..=255u8).filter(|b| table.try_kind_for(*b).is_none()).count();
        assert_eq!(unknown, 256 - PACKET_KIND_COUNT as usize);
    }

    #[test]
    fn sequence_substitution_round_trips() {
        let table = HeaderTable::new(PROTOCOL_VERSION);
        for low in 0..=255u8 {
            assert_eq!(table.clarify_sequence(table.obfuscate_sequence(low)), low);
        }
    }

    #[test]
    fn version_changes_tables() {
        let a = HeaderTable::new(1);
        let b = HeaderTable::new(2);
        let differs = (0..PACKET_KIND_COUNT).any(|index| {
            let kind = PacketKind::from_index(index).unwrap();
            a.header_for(kind) != b.header_for(kind)
        });
        assert!(differs);
    }
}
