use thiserror::Error;

/// Errors produced while reading bits back out of a packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerdeErr {
    /// The reader ran past the end of its buffer (SECURITY: truncated or malicious payload)
    #[error("Attempted to read {requested} bits with only {remaining} remaining")]
    Underflow { requested: u32, remaining: u32 },

    /// A value was read that cannot be represented by the target type
    #[error("Invalid value {value} read for {type_name}")]
    InvalidValue { value: u64, type_name: &'static str },
}
