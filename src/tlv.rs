// Streaming TLV tokenizer: turns an arbitrarily fragmented byte stream into
// tag-length-value events. Headers of constructed TLVs are reported as soon
// as they are complete; primitive values are accumulated first so a grammar
// action always sees a whole value. The tokenizer never looks across a TLV
// boundary and keeps no protocol knowledge.

use bytes::{Bytes, BytesMut};

use crate::error::DecoderError;

/// A completed primitive TLV.
#[derive(Debug, Clone)]
pub(crate) struct Tlv {
    pub tag: u8,
    pub value: Bytes,
}

/// One tokenizer step. `Header` fires once per TLV as soon as the tag and
/// length octets are in; for a constructed TLV it is the only event, for a
/// primitive one a `Primitive` event follows once the value is complete.
#[derive(Debug)]
pub(crate) enum Step {
    NeedMore,
    Header {
        tag: u8,
        length: usize,
        constructed: bool,
        header_len: usize,
    },
    Primitive(Tlv),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokState {
    Tag,
    LengthFirst,
    LengthMore { remaining: usize },
    Value { remaining: usize },
}

#[derive(Debug)]
pub(crate) struct TlvTokenizer {
    state: TokState,
    tag: u8,
    length: usize,
    header_len: usize,
    value: BytesMut,
}

impl TlvTokenizer {
    pub fn new() -> Self {
        Self {
            state: TokState::Tag,
            tag: 0,
            length: 0,
            header_len: 0,
            value: BytesMut::new(),
        }
    }

    /// True between TLVs: no partially read header or value is pending.
    pub fn is_idle(&self) -> bool {
        self.state == TokState::Tag
    }

    /// Consume bytes from `input` starting at `*pos`, advancing `*pos`.
    /// Returns at most one event per call; call again until `NeedMore`.
    pub fn step(&mut self, input: &[u8], pos: &mut usize) -> Result<Step, DecoderError> {
        loop {
            match self.state {
                TokState::Tag => {
                    let Some(&tag) = input.get(*pos) else {
                        return Ok(Step::NeedMore);
                    };
                    *pos += 1;
                    if tag & 0x1F == 0x1F {
                        // multi-octet tag numbers never occur in LDAP
                        return Err(DecoderError::UnsupportedChoice { tag });
                    }
                    self.tag = tag;
                    self.header_len = 1;
                    self.state = TokState::LengthFirst;
                }
                TokState::LengthFirst => {
                    let Some(&first) = input.get(*pos) else {
                        return Ok(Step::NeedMore);
                    };
                    *pos += 1;
                    self.header_len += 1;
                    if first & 0x80 == 0 {
                        self.length = first as usize;
                        return Ok(self.header_done());
                    }
                    let n = (first & 0x7F) as usize;
                    if n == 0 || n > 4 {
                        // 0x80 is the indefinite form, > 4 exceeds this codec
                        return Err(DecoderError::LengthOutOfRange);
                    }
                    self.length = 0;
                    self.state = TokState::LengthMore { remaining: n };
                }
                TokState::LengthMore { remaining } => {
                    let Some(&b) = input.get(*pos) else {
                        return Ok(Step::NeedMore);
                    };
                    *pos += 1;
                    self.header_len += 1;
                    self.length = (self.length << 8) | b as usize;
                    if remaining > 1 {
                        self.state = TokState::LengthMore {
                            remaining: remaining - 1,
                        };
                    } else {
                        return Ok(self.header_done());
                    }
                }
                TokState::Value { remaining } => {
                    if remaining == 0 {
                        self.state = TokState::Tag;
                        return Ok(Step::Primitive(Tlv {
                            tag: self.tag,
                            value: self.value.split().freeze(),
                        }));
                    }
                    let available = input.len().saturating_sub(*pos);
                    if available == 0 {
                        return Ok(Step::NeedMore);
                    }
                    let take = remaining.min(available);
                    self.value.extend_from_slice(&input[*pos..*pos + take]);
                    *pos += take;
                    self.state = TokState::Value {
                        remaining: remaining - take,
                    };
                }
            }
        }
    }

    fn header_done(&mut self) -> Step {
        let constructed = self.tag & 0x20 != 0;
        if constructed {
            self.state = TokState::Tag;
        } else {
            // no reservation here: the container may still reject this
            // header before any value byte is accepted
            self.state = TokState::Value {
                remaining: self.length,
            };
        }
        Step::Header {
            tag: self.tag,
            length: self.length,
            constructed,
            header_len: self.header_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&[u8]]) -> Result<Vec<String>, DecoderError> {
        let mut tok = TlvTokenizer::new();
        let mut events = Vec::new();
        for chunk in chunks {
            let mut pos = 0;
            loop {
                match tok.step(chunk, &mut pos)? {
                    Step::NeedMore => break,
                    Step::Header {
                        tag,
                        length,
                        constructed,
                        ..
                    } => events.push(format!(
                        "hdr {tag:02x} len {length}{}",
                        if constructed { " c" } else { "" }
                    )),
                    Step::Primitive(tlv) => {
                        events.push(format!("val {:02x} {:02x?}", tlv.tag, tlv.value.as_ref()))
                    }
                }
            }
        }
        Ok(events)
    }

    #[test]
    fn test_tokenize_simple_sequence() {
        let events = collect(&[&[0x30, 0x03, 0x02, 0x01, 0x05]]).unwrap();
        assert_eq!(
            events,
            ["hdr 30 len 3 c", "hdr 02 len 1", "val 02 [05]"]
        );
    }

    #[test]
    fn test_tokenize_byte_at_a_time() {
        let data = [0x30u8, 0x03, 0x02, 0x01, 0x05];
        let chunks: Vec<&[u8]> = data.chunks(1).collect();
        let whole = collect(&[&data]).unwrap();
        let split = collect(&chunks).unwrap();
        assert_eq!(whole, split);
    }

    #[test]
    fn test_tokenize_long_form_length_split_across_chunks() {
        let mut data = vec![0x04, 0x82, 0x01, 0x00];
        data.extend(std::iter::repeat(0xAB).take(256));
        let (a, b) = data.split_at(3);
        let events = collect(&[a, b]).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("hdr 04 len 256"));
    }

    #[test]
    fn test_tokenize_zero_length_primitive() {
        let events = collect(&[&[0x04, 0x00]]).unwrap();
        assert_eq!(events, ["hdr 04 len 0", "val 04 []"]);
    }

    #[test]
    fn test_indefinite_length_rejected() {
        assert_eq!(
            collect(&[&[0x30, 0x80]]),
            Err(DecoderError::LengthOutOfRange)
        );
    }

    #[test]
    fn test_five_length_octets_rejected() {
        assert_eq!(
            collect(&[&[0x04, 0x85]]),
            Err(DecoderError::LengthOutOfRange)
        );
    }

    #[test]
    fn test_high_tag_number_rejected() {
        assert_eq!(
            collect(&[&[0x1F, 0x81, 0x00]]),
            Err(DecoderError::UnsupportedChoice { tag: 0x1F })
        );
    }

    #[test]
    fn test_idle_tracking() {
        let mut tok = TlvTokenizer::new();
        assert!(tok.is_idle());
        let mut pos = 0;
        let _ = tok.step(&[0x04], &mut pos).unwrap();
        assert!(!tok.is_idle());
    }
}
