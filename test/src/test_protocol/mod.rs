use std::sync::Arc;

use skein_shared::{MessageDef, MessageFlags, MessageKind, MessageKinds};

/// Plain application data
pub const DATA: MessageKind = MessageKind {
    protocol: 1,
    index: 0,
};

/// Holds back connection state changes until delivered
pub const SPAWN: MessageKind = MessageKind {
    protocol: 1,
    index: 1,
};

/// Decoded in arrival order, bypassing the reorder queue
pub const SNAPSHOT: MessageKind = MessageKind {
    protocol: 1,
    index: 2,
};

/// The message table both test peers share
pub fn protocol() -> Arc<MessageKinds> {
    let mut kinds = MessageKinds::new();
    let protocol = kinds.add_protocol(
        "Test",
        vec![
            MessageDef::new("Data", MessageFlags::empty()),
            MessageDef::new("Spawn", MessageFlags::BLOCKS_STATE_CHANGE),
            MessageDef::new("Snapshot", MessageFlags::DECODE_IN_SYNC),
        ],
    );
    debug_assert_eq!(protocol, DATA.protocol);
    kinds.lock();
    Arc::new(kinds)
}
