use thiserror::Error;

use crate::types::MessageId;

/// Errors that can occur during message kind registration and lookup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageKindsError {
    /// A message with the same fully qualified name is already registered
    #[error("Message {name:?} is already registered. Fully qualified message names (\"Protocol:Message\") must be unique")]
    DuplicateName { name: String },

    /// Registration attempted after the table was locked
    #[error("Message table is locked and cannot be modified. Register every protocol before sharing the table with endpoints")]
    Locked,

    /// Message id not present in the table
    #[error("Message id {id} not found in message table. The remote peer may be running a different protocol")]
    UnknownId { id: MessageId },

    /// Message kind not present in the table
    #[error("Message kind {protocol}:{index} not found in message table. Message must be registered with add_protocol()")]
    UnknownKind { protocol: u16, index: u16 },

    /// The table would exceed the largest encodable id
    #[error("Registering {requested} more messages would exceed the limit of {limit} message ids")]
    TooManyIds { requested: usize, limit: usize },
}
