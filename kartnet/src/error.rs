use thiserror::Error;

/// A packet that cannot be decoded is dropped by the caller; repeated
/// failures from the same peer escalate to a disconnect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of buffer: needed {needed} more byte(s) at offset {at}")]
    UnexpectedEnd { at: usize, needed: usize },

    #[error("wrong message type discriminator: expected {expected}, got {got}")]
    WrongDiscriminator { expected: u8, got: u8 },

    #[error("string is not valid UTF-8")]
    BadUtf8,

    #[error("chat string exceeds {max} code units")]
    ChatTooLong { max: usize },

    #[error("unrecognised enum value {0}")]
    UnknownEnumValue(u8),
}
