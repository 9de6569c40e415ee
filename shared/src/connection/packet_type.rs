use crate::constants::WINDOW_SIZE;

/// Semantic kind of a datagram, carried in the obfuscated first byte
#[derive(Copy, Debug, Clone, Eq, PartialEq, Hash)]
pub enum PacketKind {
    /// Sent periodically until the peer answers, carries the protocol version
    ConnectionSetup,
    /// Answers a ConnectionSetup with a matching version
    SetupAck,
    /// Carries a disconnect reason code, repeated until acknowledged
    Disconnect,
    DisconnectAck,
    /// Asks the receiver to stop sending sequenced packets for a while
    BackOff,
    /// Sequenced data, `tag = out_seq - basis - 1`
    TransportSeq(u8),
    /// Sequenced data that must be processed in arrival order, bypassing
    /// the reorder queue
    SyncTransportSeq(u8),
}

const SIMPLE_KINDS: u8 = 5;
const SEQUENCED_BASE: u8 = SIMPLE_KINDS;
const SYNC_SEQUENCED_BASE: u8 = SEQUENCED_BASE + WINDOW_SIZE as u8;

/// Number of distinct packet kinds, each mapped to its own header byte
pub const PACKET_KIND_COUNT: u8 = SYNC_SEQUENCED_BASE + WINDOW_SIZE as u8;

impl PacketKind {
    /// Dense index of this kind, in `0..PACKET_KIND_COUNT`.
    /// Returns `None` for a sequenced kind with an out of window tag.
    pub fn index(&self) -> Option<u8> {
        match self {
            PacketKind::ConnectionSetup => Some(0),
            PacketKind::SetupAck => Some(1),
            PacketKind::Disconnect => Some(2),
            PacketKind::DisconnectAck => Some(3),
            PacketKind::BackOff => Some(4),
            PacketKind::TransportSeq(tag) => {
                (u32::from(*tag) < WINDOW_SIZE).then_some(SEQUENCED_BASE + tag)
            }
            PacketKind::SyncTransportSeq(tag) => {
                (u32::from(*tag) < WINDOW_SIZE).then_some(SYNC_SEQUENCED_BASE + tag)
            }
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(PacketKind::ConnectionSetup),
            1 => Some(PacketKind::SetupAck),
            2 => Some(PacketKind::Disconnect),
            3 => Some(PacketKind::DisconnectAck),
            4 => Some(PacketKind::BackOff),
            i if i < SYNC_SEQUENCED_BASE => Some(PacketKind::TransportSeq(i - SEQUENCED_BASE)),
            i if i < PACKET_KIND_COUNT => {
                Some(PacketKind::SyncTransportSeq(i - SYNC_SEQUENCED_BASE))
            }
            _ => None,
        }
    }

    /// The basis offset of a sequenced kind
    pub fn sequence_tag(&self) -> Option<u8> {
        match self {
            PacketKind::TransportSeq(tag) | PacketKind::SyncTransportSeq(tag) => Some(*tag),
            _ => None,
        }
    }

    pub fn is_sequenced(&self) -> bool {
        self.sequence_tag().is_some()
    }
}

#[cfg(test)]
mod packet_kind_tests {
    use super::*;

    #[test]
    fn every_index_maps_back() {
        for index in 0..PACKET_KIND_COUNT {
            let kind = PacketKind::from_index(index).unwrap();
            assert_eq!(kind.index(), Some(index));
        }
        assert!(PacketKind::from_index(PACKET_KIND_COUNT).is_none());
    }

    #[test]
    fn out_of_window_tag_has_no_index() {
        assert!(PacketKind::TransportSeq(64).index().is_none());
        assert_eq!(PacketKind::SyncTransportSeq(3).sequence_tag(), Some(3));
        assert!(!PacketKind::BackOff.is_sequenced());
    }
}
