use thiserror::Error;

use crate::grammar::GrammarState;

/// Errors raised while producing a PDU. Each variant carries the id of the
/// message being encoded so callers can correlate failures with requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("buffer too small while encoding message {message_id}")]
    Overflow { message_id: i32 },

    #[error("message {message_id} cannot be encoded: {reason}")]
    InvalidState { message_id: i32, reason: &'static str },

    #[error("message {message_id} carries an operation with no known encoding")]
    UnknownOp { message_id: i32 },
}

/// Errors raised while decoding a byte stream.
///
/// `TruncatedInput` means the stream simply ended mid-message and more bytes
/// may follow; it never poisons a decoder. Every other variant is fatal for
/// the stream: the decoder keeps returning it and the caller's only recovery
/// is to drop the decoder (and close the transport, if any).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecoderError {
    #[error("need more bytes to complete the current message")]
    TruncatedInput,

    #[error("TLV content overruns the enclosing container")]
    TruncatedContainer,

    #[error("unexpected tag 0x{tag:02X} in state {state:?}")]
    UnexpectedTag { state: GrammarState, tag: u8 },

    #[error("unsupported length encoding")]
    LengthOutOfRange,

    #[error("INTEGER of {len} content octets is outside the signed 32-bit range")]
    IntegerOutOfRange { len: usize },

    #[error("invalid UTF-8 in a string-typed field")]
    InvalidUtf8,

    #[error("duplicate control OID {oid}")]
    DuplicateControlOid { oid: String },

    #[error("PDU of {size} bytes exceeds the configured maximum of {max}")]
    MaxPduExceeded { size: usize, max: u32 },

    #[error("no grammar transition from state {state:?} on tag 0x{tag:02X}")]
    GrammarError { state: GrammarState, tag: u8 },

    #[error("unsupported CHOICE alternative 0x{tag:02X}")]
    UnsupportedChoice { tag: u8 },
}

impl DecoderError {
    /// True for the one non-fatal variant: the caller may feed more bytes.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecoderError::TruncatedInput)
    }
}
