//! BER codec for the LDAPv3 protocol (RFC 4511).
//!
//! Outbound, [`encode`] measures a message in one pass and writes the PDU in
//! a second, so every definite length is exact. Inbound, [`Decoder`] is a
//! grammar-driven streaming state machine: feed it byte chunks cut at any
//! boundary and collect complete messages as they finish. The codec never
//! touches a socket; transports live elsewhere.

pub mod ber;
pub mod config;
pub mod controls;
pub mod decode;
pub mod encode;
pub mod error;
pub mod filter;
pub mod grammar;
pub mod length;
pub mod message;
mod tlv;

pub use config::CodecConfig;
pub use controls::register_control;
pub use decode::Decoder;
pub use encode::{encode, encode_with_config};
pub use error::{DecoderError, EncoderError};
pub use filter::Filter;
pub use grammar::GrammarState;
pub use length::compute_message_length;
pub use message::{Control, Controls, LdapMessage, LdapResult, ProtocolOp, ResultCode};
