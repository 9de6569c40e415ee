/// Number of sequence slots in flight at once. Sequence numbers index the
/// window modulo this size.
pub const WINDOW_SIZE: u32 = 64;

/// Bits of the sequence number carried on the wire
pub const SEQUENCE_NUMBER_BITS: u32 = 8;
pub const SEQUENCE_NUMBER_MASK: u32 = (1 << SEQUENCE_NUMBER_BITS) - 1;
pub const SEQUENCE_NUMBER_DIAMETER: u32 = 1 << SEQUENCE_NUMBER_BITS;
pub const SEQUENCE_NUMBER_RADIUS: u32 = 1 << (SEQUENCE_NUMBER_BITS - 1);

/// Upper bound on messages decoded out of a single packet
pub const MAX_MESSAGES_PER_PACKET: u32 = 1 << 16;

/// Largest datagram the endpoint will assemble
pub const MTU_SIZE_BYTES: usize = 1200;

/// Bumped whenever the wire format changes
pub const PROTOCOL_VERSION: u32 = 3;

/// Seed shared by every process for the header obfuscation tables
pub const HEADER_TABLE_SEED: u64 = 0x5ce1_9a7b_03d4_e2f1;

/// Bits used by each ack symbol
pub const ACK_SYMBOL_BITS: u8 = 2;

/// Trailing bytes after the bit stream: the signing key and the quick hash
pub const TRAILER_BYTES: usize = 2;

/// Header byte plus obfuscated sequence byte
pub const SEQUENCE_HEADER_BYTES: usize = 2;

/// Smallest sequenced packet that can hold an empty ack block and message stream
pub const MIN_SEQUENCED_PACKET_BYTES: usize = 7;
