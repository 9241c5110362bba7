// The decode container: one per stream. Owns the tokenizer, the frame stack
// of expected-end offsets, the grammar state and the partially built
// message. Strictly pull-driven; nothing here blocks or touches I/O.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::config::CodecConfig;
use crate::error::DecoderError;
use crate::grammar::{self, GrammarState};
use crate::message::{Attribute, Control, Controls, LdapMessage, ModifyOperation, ProtocolOp};
use crate::tlv::{Step, TlvTokenizer};

/// A pending constructed value: where it must end and what closing it means.
#[derive(Debug)]
pub(crate) struct Frame {
    pub end: u64,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// The outer LDAPMessage SEQUENCE.
    Message,
    /// A constructed protocolOp.
    Op,
    /// sasl [3] inside a BindRequest.
    Sasl,
    /// referral [3] inside an LDAPResult.
    Referral,
    /// The attribute selection SEQUENCE of a SearchRequest.
    AttrSelList,
    /// Any constructed filter node; its payload lives on the filter stack.
    Filter,
    /// The substrings SEQUENCE inside a substrings filter.
    SubstringSeq,
    /// The PartialAttributeList of an entry or AddRequest.
    AttrList,
    /// One PartialAttribute SEQUENCE.
    AttrSeq,
    /// The SET OF values inside a PartialAttribute.
    AttrValSet,
    /// The changes SEQUENCE of a ModifyRequest.
    ChangeList,
    /// One change SEQUENCE inside a ModifyRequest.
    ChangeSeq,
    /// The AttributeValueAssertion SEQUENCE of a CompareRequest.
    CompareAva,
    /// controls [0].
    Controls,
    /// One Control SEQUENCE.
    ControlSeq,
}

/// A filter node under construction. Branch children accumulate as the
/// sub-grammar completes them; leaves fill field by field.
#[derive(Debug)]
pub(crate) enum FilterNode {
    And(Vec<crate::filter::Filter>),
    Or(Vec<crate::filter::Filter>),
    Not(Vec<crate::filter::Filter>),
    Ava {
        tag: u8,
        attribute: Option<String>,
        value: Option<Vec<u8>>,
    },
    Substrings {
        attribute: Option<String>,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
        saw_final: bool,
    },
    Extensible {
        matching_rule: Option<String>,
        match_type: Option<String>,
        match_value: Option<Vec<u8>>,
        dn_attributes: bool,
    },
}

/// The message under construction plus the scratch the grammar needs.
#[derive(Debug, Default)]
pub(crate) struct Build {
    pub message_id: Option<i32>,
    pub op: Option<ProtocolOp>,
    pub controls: Controls,
    pub filter_stack: Vec<FilterNode>,
    pub attr: Option<Attribute>,
    pub change_op: Option<ModifyOperation>,
    pub control: Option<Control>,
}

/// Streaming LDAP message decoder for one logical connection.
///
/// Feed byte chunks with [`feed`](Decoder::feed) and drain completed
/// messages with [`next_message`](Decoder::next_message). Chunk boundaries
/// are arbitrary; a PDU split across any number of chunks decodes exactly
/// as if fed whole. A fatal error poisons the decoder: every later call
/// reports the same error and the only recovery is to drop the decoder.
#[derive(Debug)]
pub struct Decoder {
    pub(crate) config: CodecConfig,
    tokenizer: TlvTokenizer,
    /// Bytes consumed from the stream since construction.
    offset: u64,
    pub(crate) frames: Vec<Frame>,
    pub(crate) state: GrammarState,
    grammar_end_allowed: bool,
    pub(crate) build: Build,
    ready: VecDeque<LdapMessage>,
    poison: Option<DecoderError>,
    last_message_id: Option<i32>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            config,
            tokenizer: TlvTokenizer::new(),
            offset: 0,
            frames: Vec::new(),
            state: GrammarState::Start,
            grammar_end_allowed: true,
            build: Build::default(),
            ready: VecDeque::new(),
            poison: None,
            last_message_id: None,
        }
    }

    /// Feed a chunk of bytes. Returns the number of messages completed by
    /// this chunk; they are retrieved with `next_message`. Incomplete
    /// trailing data is held until the next feed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<usize, DecoderError> {
        if let Some(err) = &self.poison {
            return Err(err.clone());
        }
        let before = self.ready.len();
        let mut pos = 0;
        loop {
            let step = match self.tokenizer.step(chunk, &mut pos) {
                Ok(step) => step,
                Err(err) => return Err(self.poison_with(err)),
            };
            match step {
                Step::NeedMore => break,
                Step::Header {
                    tag,
                    length,
                    constructed,
                    header_len,
                } => {
                    if let Err(err) = self.on_header(tag, length, constructed, header_len) {
                        return Err(self.poison_with(err));
                    }
                }
                Step::Primitive(tlv) => {
                    self.offset += tlv.value.len() as u64;
                    if let Err(err) =
                        grammar::on_primitive(self, tlv).and_then(|()| self.pop_frames())
                    {
                        return Err(self.poison_with(err));
                    }
                }
            }
        }
        Ok(self.ready.len() - before)
    }

    /// Take the next completed message, oldest first.
    pub fn next_message(&mut self) -> Option<LdapMessage> {
        self.ready.pop_front()
    }

    /// The fatal error this decoder stopped on, if any.
    pub fn error(&self) -> Option<&DecoderError> {
        self.poison.as_ref()
    }

    /// The id of the message being decoded when the stream stopped, when it
    /// had been parsed already. Lets a caller synthesize a protocol-level
    /// error reply after a fatal decode error.
    pub fn last_message_id(&self) -> Option<i32> {
        self.last_message_id
    }

    /// True when the stream sits exactly on a message boundary: no partial
    /// TLV and no partial message.
    pub fn is_idle(&self) -> bool {
        self.grammar_end_allowed && self.tokenizer.is_idle()
    }

    /// Decode one message from a self-contained buffer. Returns
    /// `TruncatedInput` when the buffer ends mid-message; bytes past the
    /// first message are ignored.
    pub fn decode_exact(buf: &[u8]) -> Result<LdapMessage, DecoderError> {
        Self::decode_exact_with_config(buf, CodecConfig::default())
    }

    pub fn decode_exact_with_config(
        buf: &[u8],
        config: CodecConfig,
    ) -> Result<LdapMessage, DecoderError> {
        let mut decoder = Decoder::with_config(config);
        decoder.feed(buf)?;
        decoder.next_message().ok_or(DecoderError::TruncatedInput)
    }

    fn poison_with(&mut self, err: DecoderError) -> DecoderError {
        warn!(
            "decoder poisoned at offset {}: {} (message id {:?})",
            self.offset, err, self.last_message_id
        );
        // fatal for the stream: earlier results are dropped with it
        self.ready.clear();
        self.poison = Some(err.clone());
        err
    }

    fn on_header(
        &mut self,
        tag: u8,
        length: usize,
        constructed: bool,
        header_len: usize,
    ) -> Result<(), DecoderError> {
        self.grammar_end_allowed = false;
        if self.state == GrammarState::Start {
            let total = header_len + length;
            if total > self.config.max_pdu_size as usize {
                return Err(DecoderError::MaxPduExceeded {
                    size: total,
                    max: self.config.max_pdu_size,
                });
            }
        }
        self.offset += header_len as u64;
        if let Some(frame) = self.frames.last() {
            if self.offset + length as u64 > frame.end {
                return Err(DecoderError::TruncatedContainer);
            }
        }
        if constructed {
            trace!("constructed tag 0x{:02x} len {} in {:?}", tag, length, self.state);
            let end = self.offset + length as u64;
            grammar::on_constructed(self, tag, end)?;
            self.pop_frames()?;
        }
        Ok(())
    }

    pub(crate) fn push_frame(&mut self, kind: FrameKind, end: u64) {
        self.frames.push(Frame { end, kind });
    }

    fn pop_frames(&mut self) -> Result<(), DecoderError> {
        loop {
            match self.frames.last() {
                Some(frame) if frame.end == self.offset => {}
                Some(frame) if frame.end < self.offset => {
                    return Err(DecoderError::TruncatedContainer);
                }
                _ => return Ok(()),
            }
            let Some(frame) = self.frames.pop() else {
                return Ok(());
            };
            grammar::on_frame_end(self, frame.kind)?;
        }
    }

    /// Called by the grammar when the outer message frame closes.
    pub(crate) fn deliver(&mut self) -> Result<(), DecoderError> {
        let build = std::mem::take(&mut self.build);
        let (Some(message_id), Some(protocol_op)) = (build.message_id, build.op) else {
            return Err(DecoderError::GrammarError {
                state: self.state,
                tag: 0x30,
            });
        };
        debug!(
            "decoded message id={} op_tag=0x{:02x}",
            message_id,
            protocol_op.tag()
        );
        self.ready.push_back(LdapMessage {
            message_id,
            protocol_op,
            controls: build.controls,
        });
        self.state = GrammarState::Start;
        self.grammar_end_allowed = true;
        Ok(())
    }

    pub(crate) fn note_message_id(&mut self, id: i32) {
        self.build.message_id = Some(id);
        self.last_message_id = Some(id);
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIND_V3: &[u8] = &[
        0x30, 0x0C, 0x02, 0x01, 0x01, 0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00,
    ];

    #[test]
    fn test_feed_counts_completed_messages() {
        let mut decoder = Decoder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(BIND_V3);
        stream.extend_from_slice(&[0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]);
        assert_eq!(decoder.feed(&stream).unwrap(), 2);
        assert!(decoder.next_message().is_some());
        assert!(decoder.next_message().is_some());
        assert!(decoder.next_message().is_none());
    }

    #[test]
    fn test_partial_feed_then_completion() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.feed(&BIND_V3[..6]).unwrap(), 0);
        assert!(decoder.next_message().is_none());
        assert!(!decoder.is_idle());
        assert_eq!(decoder.feed(&BIND_V3[6..]).unwrap(), 1);
        let msg = decoder.next_message().unwrap();
        assert_eq!(msg.message_id, 1);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_poisoned_decoder_repeats_error() {
        let mut decoder = Decoder::new();
        // inner INTEGER claims to extend past the outer SEQUENCE
        let err = decoder
            .feed(&[0x30, 0x04, 0x02, 0x08, 0x01, 0x01])
            .unwrap_err();
        assert_eq!(err, DecoderError::TruncatedContainer);
        assert_eq!(decoder.feed(&[0x30]).unwrap_err(), DecoderError::TruncatedContainer);
        assert_eq!(decoder.error(), Some(&DecoderError::TruncatedContainer));
    }

    #[test]
    fn test_max_pdu_exceeded() {
        let config = CodecConfig {
            max_pdu_size: 8,
            ..CodecConfig::default()
        };
        let mut decoder = Decoder::with_config(config);
        let err = decoder.feed(BIND_V3).unwrap_err();
        assert_eq!(err, DecoderError::MaxPduExceeded { size: 14, max: 8 });
    }

    #[test]
    fn test_decode_exact_truncated() {
        assert_eq!(
            Decoder::decode_exact(&BIND_V3[..10]),
            Err(DecoderError::TruncatedInput)
        );
    }

    #[test]
    fn test_last_message_id_survives_poisoning() {
        let mut decoder = Decoder::new();
        // valid header and id, then a stray tag inside the bind request
        let bad = [
            0x30, 0x0C, 0x02, 0x01, 0x07, 0x60, 0x07, 0x05, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00,
        ];
        assert!(decoder.feed(&bad).is_err());
        assert_eq!(decoder.last_message_id(), Some(7));
    }
}
