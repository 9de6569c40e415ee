use std::collections::HashMap;

use bitflags::bitflags;
use log::info;

use crate::{messages::error::MessageKindsError, types::MessageId};

bitflags! {
    /// Static properties of a message definition
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        /// The receiver must process the packet in arrival order, bypassing the reorder queue
        const DECODE_IN_SYNC = 1 << 0;
        /// Switches the id coder to the object update table
        const BEGIN_OBJECT_UPDATE = 1 << 1;
        /// Switches the id coder back to the normal table
        const END_OBJECT_UPDATE = 1 << 2;
        /// Messages of this kind hold back connection state changes
        const BLOCKS_STATE_CHANGE = 1 << 3;
    }
}

/// Identifies a message by the sub-protocol that registered it and its
/// position inside that protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind {
    pub protocol: u16,
    pub index: u16,
}

impl MessageKind {
    pub const END_OF_STREAM: MessageKind = MessageKind {
        protocol: 0,
        index: 0,
    };
    pub const HEARTBEAT: MessageKind = MessageKind {
        protocol: 0,
        index: 1,
    };
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDef {
    pub name: String,
    pub flags: MessageFlags,
}

impl MessageDef {
    pub fn new(name: &str, flags: MessageFlags) -> Self {
        Self {
            name: name.to_string(),
            flags,
        }
    }
}

struct RegisteredMessage {
    kind: MessageKind,
    qualified_name: String,
    def: MessageDef,
}

struct RegisteredProtocol {
    name: String,
    first_id: MessageId,
}

/// Largest number of message ids a table may hold
pub const MAX_MESSAGE_IDS: usize = 1 << 16;

const TRANSPORT_PROTOCOL: &str = "Transport";

/// Maps message kinds to dense ids. The transport's own control messages
/// occupy the lowest ids, application protocols follow in registration order.
pub struct MessageKinds {
    protocols: Vec<RegisteredProtocol>,
    messages: Vec<RegisteredMessage>,
    by_name: HashMap<String, MessageId>,
    locked: bool,
}

impl Default for MessageKinds {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageKinds {
    pub fn new() -> Self {
        let mut kinds = Self {
            protocols: Vec::new(),
            messages: Vec::new(),
            by_name: HashMap::new(),
            locked: false,
        };
        kinds.add_protocol(
            TRANSPORT_PROTOCOL,
            vec![
                MessageDef::new("EndOfStream", MessageFlags::empty()),
                MessageDef::new("Heartbeat", MessageFlags::empty()),
            ],
        );
        kinds
    }

    /// Appends a sub-protocol, returning its protocol index
    pub fn try_add_protocol(
        &mut self,
        name: &str,
        defs: Vec<MessageDef>,
    ) -> Result<u16, MessageKindsError> {
        if self.locked {
            return Err(MessageKindsError::Locked);
        }
        if self.messages.len() + defs.len() > MAX_MESSAGE_IDS
            || self.protocols.len() >= usize::from(u16::MAX)
        {
            return Err(MessageKindsError::TooManyIds {
                requested: defs.len(),
                limit: MAX_MESSAGE_IDS,
            });
        }

        let mut qualified_names = Vec::with_capacity(defs.len());
        for def in &defs {
            let qualified_name = format!("{}:{}", name, def.name);
            if self.by_name.contains_key(&qualified_name)
                || qualified_names.contains(&qualified_name)
            {
                return Err(MessageKindsError::DuplicateName {
                    name: qualified_name,
                });
            }
            qualified_names.push(qualified_name);
        }

        let protocol = self.protocols.len() as u16;
        let first_id = self.messages.len() as MessageId;
        self.protocols.push(RegisteredProtocol {
            name: name.to_string(),
            first_id,
        });

        for (index, (def, qualified_name)) in defs.into_iter().zip(qualified_names).enumerate() {
            let id = self.messages.len() as MessageId;
            self.by_name.insert(qualified_name.clone(), id);
            self.messages.push(RegisteredMessage {
                kind: MessageKind {
                    protocol,
                    index: index as u16,
                },
                qualified_name,
                def,
            });
        }

        info!(
            "registered protocol {} with {} messages starting at id {}",
            name,
            self.messages.len() as MessageId - first_id,
            first_id
        );

        Ok(protocol)
    }

    /// Appends a sub-protocol, returning its protocol index
    ///
    /// # Panics
    ///
    /// Panics if the table is locked, a name is duplicated, or the id space is exhausted
    pub fn add_protocol(&mut self, name: &str, defs: Vec<MessageDef>) -> u16 {
        match self.try_add_protocol(name, defs) {
            Ok(protocol) => protocol,
            Err(error) => panic!("failed to add protocol {}: {}", name, error),
        }
    }

    /// Freezes the table. Both peers must register identical protocols in the same order.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of bits needed to write any id in this table
    pub fn id_bits(&self) -> u8 {
        let max_id = self.messages.len().saturating_sub(1) as u32;
        (32 - max_id.leading_zeros()).max(1) as u8
    }

    pub fn id_for(&self, kind: &MessageKind) -> Result<MessageId, MessageKindsError> {
        let unknown = MessageKindsError::UnknownKind {
            protocol: kind.protocol,
            index: kind.index,
        };
        let protocol = self
            .protocols
            .get(usize::from(kind.protocol))
            .ok_or_else(|| unknown.clone())?;
        let id = protocol.first_id + MessageId::from(kind.index);
        match self.messages.get(id as usize) {
            Some(message) if message.kind == *kind => Ok(id),
            _ => Err(unknown),
        }
    }

    /// SECURITY: ids come from the wire, unknown ids yield an error
    pub fn kind_for(&self, id: MessageId) -> Result<MessageKind, MessageKindsError> {
        self.messages
            .get(id as usize)
            .map(|message| message.kind)
            .ok_or(MessageKindsError::UnknownId { id })
    }

    /// Looks up a message by its fully qualified "Protocol:Message" name
    pub fn lookup_by_name(&self, name: &str) -> Option<MessageId> {
        self.by_name.get(name).copied()
    }

    pub fn def(&self, id: MessageId) -> Option<&MessageDef> {
        self.messages.get(id as usize).map(|message| &message.def)
    }

    pub fn flags(&self, id: MessageId) -> MessageFlags {
        self.def(id).map(|def| def.flags).unwrap_or_default()
    }

    pub fn qualified_name(&self, id: MessageId) -> Option<&str> {
        self.messages
            .get(id as usize)
            .map(|message| message.qualified_name.as_str())
    }

    pub fn protocol_name(&self, protocol: u16) -> Option<&str> {
        self.protocols
            .get(usize::from(protocol))
            .map(|protocol| protocol.name.as_str())
    }
}

#[cfg(test)]
mod message_kinds_tests {
    use super::*;

    fn game_protocol() -> Vec<MessageDef> {
        vec![
            MessageDef::new("Spawn", MessageFlags::BLOCKS_STATE_CHANGE),
            MessageDef::new("Move", MessageFlags::BEGIN_OBJECT_UPDATE),
            MessageDef::new("Chat", MessageFlags::empty()),
        ]
    }

    #[test]
    fn transport_messages_come_first() {
        let kinds = MessageKinds::new();
        assert_eq!(kinds.id_for(&MessageKind::END_OF_STREAM), Ok(0));
        assert_eq!(kinds.id_for(&MessageKind::HEARTBEAT), Ok(1));
        assert_eq!(kinds.lookup_by_name("Transport:Heartbeat"), Some(1));
    }

    #[test]
    fn protocols_append_in_order() {
        let mut kinds = MessageKinds::new();
        let game = kinds.add_protocol("Game", game_protocol());
        assert_eq!(game, 1);

        let chat = MessageKind {
            protocol: game,
            index: 2,
        };
        assert_eq!(kinds.id_for(&chat), Ok(4));
        assert_eq!(kinds.kind_for(4), Ok(chat));
        assert_eq!(kinds.lookup_by_name("Game:Move"), Some(3));
        assert_eq!(kinds.flags(3), MessageFlags::BEGIN_OBJECT_UPDATE);
        assert_eq!(kinds.qualified_name(2), Some("Game:Spawn"));
        assert_eq!(kinds.protocol_name(game), Some("Game"));
    }

    #[test]
    fn id_bits_covers_table() {
        let mut kinds = MessageKinds::new();
        assert_eq!(kinds.id_bits(), 1);
        kinds.add_protocol("Game", game_protocol());
        // five ids, largest is 4
        assert_eq!(kinds.id_bits(), 3);
    }

    #[test]
    fn unknown_lookups_fail() {
        let kinds = MessageKinds::new();
        assert_eq!(
            kinds.kind_for(77),
            Err(MessageKindsError::UnknownId { id: 77 })
        );
        assert!(kinds
            .id_for(&MessageKind {
                protocol: 0,
                index: 9
            })
            .is_err());
        assert!(kinds.lookup_by_name("Game:Nope").is_none());
    }

    #[test]
    fn duplicates_and_lock_are_rejected() {
        let mut kinds = MessageKinds::new();
        let result = kinds.try_add_protocol(
            "Game",
            vec![
                MessageDef::new("A", MessageFlags::empty()),
                MessageDef::new("A", MessageFlags::empty()),
            ],
        );
        assert!(matches!(
            result,
            Err(MessageKindsError::DuplicateName { .. })
        ));
        // nothing was half registered
        assert_eq!(kinds.len(), 2);

        kinds.lock();
        assert_eq!(
            kinds.try_add_protocol("Late", Vec::new()),
            Err(MessageKindsError::Locked)
        );
    }
}
