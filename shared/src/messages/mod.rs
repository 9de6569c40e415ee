pub mod bytes_sendable;
pub mod error;
pub mod handle;
pub mod message_kinds;
pub mod sendable;
