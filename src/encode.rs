// Second pass of the encoder: one forward write over the buffer sized by the
// length pass. Every header length comes out of the `PduLengths` arena in
// the exact order `length::compute_message_length` reserved it.

use tracing::trace;

use crate::ber::{self, BerWriter, Overflow};
use crate::config::CodecConfig;
use crate::error::EncoderError;
use crate::filter::{self, Filter};
use crate::length::{compute_message_length, effective_matched_dn, PduLengths};
use crate::message::{
    AddRequest, Attribute, BindAuthentication, BindRequest, Control, Controls, ExtendedRequest,
    ExtendedResponse, IntermediateResponse, LdapMessage, LdapResult, ModifyDnRequest,
    ModifyRequest, ProtocolOp, SearchRequest, SearchResultEntry, TAG_CONTROLS,
};

// Context tags outside the filter sublanguage.
const TAG_AUTH_SIMPLE: u8 = 0x80;
const TAG_AUTH_SASL: u8 = 0xA3;
const TAG_REFERRAL: u8 = 0xA3;
const TAG_SERVER_SASL_CREDS: u8 = 0x87;
const TAG_NEW_SUPERIOR: u8 = 0x80;
const TAG_EXT_REQ_NAME: u8 = 0x80;
const TAG_EXT_REQ_VALUE: u8 = 0x81;
const TAG_EXT_RESP_NAME: u8 = 0x8A;
const TAG_EXT_RESP_VALUE: u8 = 0x8B;
const TAG_INTERMEDIATE_NAME: u8 = 0x80;
const TAG_INTERMEDIATE_VALUE: u8 = 0x81;

enum Fail {
    Overflow,
    BadLengths,
}

impl From<Overflow> for Fail {
    fn from(_: Overflow) -> Self {
        Fail::Overflow
    }
}

struct LenCursor<'a> {
    slots: &'a [usize],
    next: usize,
}

impl<'a> LenCursor<'a> {
    fn new(slots: &'a [usize]) -> Self {
        Self { slots, next: 0 }
    }

    fn take(&mut self) -> Result<usize, Fail> {
        let len = *self.slots.get(self.next).ok_or(Fail::BadLengths)?;
        self.next += 1;
        Ok(len)
    }

    fn exhausted(&self) -> bool {
        self.next == self.slots.len()
    }
}

/// Encode a message into a freshly allocated PDU, running the length pass
/// and the write pass back to back.
pub fn encode(message: &LdapMessage) -> Result<Vec<u8>, EncoderError> {
    encode_with_config(message, &CodecConfig::default())
}

pub fn encode_with_config(
    message: &LdapMessage,
    config: &CodecConfig,
) -> Result<Vec<u8>, EncoderError> {
    validate(message)?;
    let lengths = compute_message_length(message, config);
    let mut buf = vec![0u8; lengths.pdu_len()];
    let written = encode_into(message, &lengths, &mut buf, config)?;
    trace!("encoded message {}: {} bytes", message.message_id, written);
    Ok(buf)
}

/// Encode a message into a caller-sized buffer using lengths computed
/// earlier. Returns the number of bytes written. A buffer shorter than the
/// PDU yields `Overflow`; lengths that do not match the message (stale after
/// a mutation, or from a different message) yield `InvalidState`.
pub fn encode_into(
    message: &LdapMessage,
    lengths: &PduLengths,
    buf: &mut [u8],
    config: &CodecConfig,
) -> Result<usize, EncoderError> {
    let mut cur = LenCursor::new(lengths.slots());
    let mut w = BerWriter::new(buf);
    match encode_message(&mut w, &mut cur, message, config) {
        Ok(()) if cur.exhausted() => Ok(w.position()),
        Ok(()) => Err(EncoderError::InvalidState {
            message_id: message.message_id,
            reason: "length arena does not match the message",
        }),
        Err(Fail::Overflow) => Err(EncoderError::Overflow {
            message_id: message.message_id,
        }),
        Err(Fail::BadLengths) => Err(EncoderError::InvalidState {
            message_id: message.message_id,
            reason: "length arena exhausted before the message",
        }),
    }
}

fn validate(message: &LdapMessage) -> Result<(), EncoderError> {
    let invalid = |reason| EncoderError::InvalidState {
        message_id: message.message_id,
        reason,
    };
    if message.message_id < 0 {
        return Err(invalid("negative message id"));
    }
    if message.message_id == 0
        && !matches!(message.protocol_op, ProtocolOp::ExtendedResponse(_))
    {
        return Err(invalid(
            "message id 0 is reserved for unsolicited notifications",
        ));
    }
    if let ProtocolOp::BindRequest(req) = &message.protocol_op {
        if !(1..=127).contains(&req.version) {
            return Err(invalid("bind version outside 1..=127"));
        }
    }
    Ok(())
}

fn encode_message(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    message: &LdapMessage,
    config: &CodecConfig,
) -> Result<(), Fail> {
    let content = cur.take()?;
    w.write_header(ber::TAG_SEQUENCE, content)?;
    w.write_integer(message.message_id)?;
    encode_op(w, cur, &message.protocol_op, config)?;
    if !message.controls.is_empty() {
        encode_controls(w, cur, &message.controls)?;
    }
    Ok(())
}

fn encode_op(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    op: &ProtocolOp,
    config: &CodecConfig,
) -> Result<(), Fail> {
    let tag = op.tag();
    match op {
        ProtocolOp::BindRequest(req) => encode_bind_request(w, cur, req),
        ProtocolOp::BindResponse(resp) => {
            w.write_header(tag, cur.take()?)?;
            encode_result_content(w, cur, &resp.result, config)?;
            if let Some(creds) = &resp.server_sasl_creds {
                w.write_tagged_bytes(TAG_SERVER_SASL_CREDS, creds)?;
            }
            Ok(())
        }
        ProtocolOp::UnbindRequest => {
            w.write_header(tag, 0)?;
            Ok(())
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(w, cur, req),
        ProtocolOp::SearchResultEntry(entry) => encode_entry(w, cur, entry),
        ProtocolOp::SearchResultReference(uris) => {
            w.write_header(tag, cur.take()?)?;
            for uri in uris {
                w.write_string(uri)?;
            }
            Ok(())
        }
        ProtocolOp::SearchResultDone(result)
        | ProtocolOp::ModifyResponse(result)
        | ProtocolOp::AddResponse(result)
        | ProtocolOp::DelResponse(result)
        | ProtocolOp::ModifyDnResponse(result)
        | ProtocolOp::CompareResponse(result) => {
            w.write_header(tag, cur.take()?)?;
            encode_result_content(w, cur, result, config)
        }
        ProtocolOp::ModifyRequest(req) => encode_modify_request(w, cur, req),
        ProtocolOp::AddRequest(req) => encode_add_request(w, cur, req),
        ProtocolOp::DelRequest(dn) => {
            w.write_tagged_bytes(tag, dn.as_bytes())?;
            Ok(())
        }
        ProtocolOp::ModifyDnRequest(req) => encode_modify_dn_request(w, cur, req),
        ProtocolOp::CompareRequest(req) => {
            w.write_header(tag, cur.take()?)?;
            w.write_string(&req.entry)?;
            w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
            w.write_string(&req.attribute)?;
            w.write_octet_string(&req.assertion_value)?;
            Ok(())
        }
        ProtocolOp::AbandonRequest(id) => {
            w.write_tagged_integer(tag, *id)?;
            Ok(())
        }
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(w, cur, req),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(w, cur, resp, config),
        ProtocolOp::IntermediateResponse(resp) => encode_intermediate_response(w, cur, resp),
    }
}

fn encode_bind_request(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    req: &BindRequest,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_BIND_REQUEST, cur.take()?)?;
    w.write_integer(req.version)?;
    w.write_string(&req.name)?;
    match &req.authentication {
        BindAuthentication::Simple(creds) => {
            w.write_tagged_bytes(TAG_AUTH_SIMPLE, creds)?;
        }
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            w.write_header(TAG_AUTH_SASL, cur.take()?)?;
            w.write_string(mechanism)?;
            if let Some(creds) = credentials {
                w.write_octet_string(creds)?;
            }
        }
    }
    Ok(())
}

fn encode_result_content(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    result: &LdapResult,
    config: &CodecConfig,
) -> Result<(), Fail> {
    w.write_enumerated(result.result_code.code())?;
    w.write_string(effective_matched_dn(result, config))?;
    w.write_string(&result.diagnostic_message)?;
    if let Some(referral) = &result.referral {
        w.write_header(TAG_REFERRAL, cur.take()?)?;
        for uri in referral {
            w.write_string(uri)?;
        }
    }
    Ok(())
}

fn encode_search_request(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    req: &SearchRequest,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_SEARCH_REQUEST, cur.take()?)?;
    w.write_string(&req.base_object)?;
    w.write_enumerated(req.scope as i32)?;
    w.write_enumerated(req.deref_aliases as i32)?;
    w.write_uinteger(req.size_limit)?;
    w.write_uinteger(req.time_limit)?;
    w.write_boolean(req.types_only)?;
    encode_filter(w, cur, &req.filter)?;
    w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
    for attribute in &req.attributes {
        w.write_string(attribute)?;
    }
    Ok(())
}

fn encode_filter(w: &mut BerWriter, cur: &mut LenCursor, f: &Filter) -> Result<(), Fail> {
    let tag = f.tag();
    match f {
        Filter::Present(attribute) => {
            w.write_tagged_bytes(tag, attribute.as_bytes())?;
        }
        Filter::And(children) | Filter::Or(children) => {
            w.write_header(tag, cur.take()?)?;
            for child in children {
                encode_filter(w, cur, child)?;
            }
        }
        Filter::Not(child) => {
            w.write_header(tag, cur.take()?)?;
            encode_filter(w, cur, child)?;
        }
        Filter::EqualityMatch { attribute, value }
        | Filter::GreaterOrEqual { attribute, value }
        | Filter::LessOrEqual { attribute, value }
        | Filter::ApproxMatch { attribute, value } => {
            w.write_header(tag, cur.take()?)?;
            w.write_string(attribute)?;
            w.write_octet_string(value)?;
        }
        Filter::Substrings {
            attribute,
            initial,
            any,
            last,
        } => {
            w.write_header(tag, cur.take()?)?;
            w.write_string(attribute)?;
            w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
            if let Some(piece) = initial {
                w.write_tagged_bytes(filter::TAG_SUBSTRING_INITIAL, piece)?;
            }
            for piece in any {
                w.write_tagged_bytes(filter::TAG_SUBSTRING_ANY, piece)?;
            }
            if let Some(piece) = last {
                w.write_tagged_bytes(filter::TAG_SUBSTRING_FINAL, piece)?;
            }
        }
        Filter::ExtensibleMatch {
            matching_rule,
            match_type,
            match_value,
            dn_attributes,
        } => {
            w.write_header(tag, cur.take()?)?;
            if let Some(rule) = matching_rule {
                w.write_tagged_bytes(filter::TAG_MATCHING_RULE, rule.as_bytes())?;
            }
            if let Some(t) = match_type {
                w.write_tagged_bytes(filter::TAG_MATCHING_TYPE, t.as_bytes())?;
            }
            w.write_tagged_bytes(filter::TAG_MATCHING_VALUE, match_value)?;
            if *dn_attributes {
                w.write_tagged_bytes(filter::TAG_MATCHING_DN_ATTRS, &[0xFF])?;
            }
        }
    }
    Ok(())
}

fn encode_entry(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    entry: &SearchResultEntry,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_SEARCH_RESULT_ENTRY, cur.take()?)?;
    w.write_string(&entry.object_name)?;
    encode_attribute_list(w, cur, &entry.attributes)
}

fn encode_add_request(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    req: &AddRequest,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_ADD_REQUEST, cur.take()?)?;
    w.write_string(&req.entry)?;
    encode_attribute_list(w, cur, &req.attributes)
}

fn encode_attribute_list(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    attributes: &[Attribute],
) -> Result<(), Fail> {
    w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
    for attribute in attributes {
        encode_attribute(w, cur, attribute)?;
    }
    Ok(())
}

fn encode_attribute(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    attribute: &Attribute,
) -> Result<(), Fail> {
    w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
    w.write_string(&attribute.attr_type)?;
    w.write_header(ber::TAG_SET, cur.take()?)?;
    for value in &attribute.attr_values {
        w.write_octet_string(value)?;
    }
    Ok(())
}

fn encode_modify_request(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    req: &ModifyRequest,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_MODIFY_REQUEST, cur.take()?)?;
    w.write_string(&req.object)?;
    w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
    for change in &req.changes {
        w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
        w.write_enumerated(change.operation as i32)?;
        encode_attribute(w, cur, &change.modification)?;
    }
    Ok(())
}

fn encode_modify_dn_request(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    req: &ModifyDnRequest,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_MODIFY_DN_REQUEST, cur.take()?)?;
    w.write_string(&req.entry)?;
    w.write_string(&req.new_rdn)?;
    w.write_boolean(req.delete_old_rdn)?;
    if let Some(new_superior) = &req.new_superior {
        w.write_tagged_bytes(TAG_NEW_SUPERIOR, new_superior.as_bytes())?;
    }
    Ok(())
}

fn encode_extended_request(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    req: &ExtendedRequest,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_EXTENDED_REQUEST, cur.take()?)?;
    w.write_tagged_bytes(TAG_EXT_REQ_NAME, req.name.as_bytes())?;
    if let Some(value) = &req.value {
        w.write_tagged_bytes(TAG_EXT_REQ_VALUE, value)?;
    }
    Ok(())
}

fn encode_extended_response(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    resp: &ExtendedResponse,
    config: &CodecConfig,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_EXTENDED_RESPONSE, cur.take()?)?;
    encode_result_content(w, cur, &resp.result, config)?;
    if let Some(name) = &resp.name {
        w.write_tagged_bytes(TAG_EXT_RESP_NAME, name.as_bytes())?;
    }
    if let Some(value) = &resp.value {
        w.write_tagged_bytes(TAG_EXT_RESP_VALUE, value)?;
    }
    Ok(())
}

fn encode_intermediate_response(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    resp: &IntermediateResponse,
) -> Result<(), Fail> {
    w.write_header(crate::message::TAG_INTERMEDIATE_RESPONSE, cur.take()?)?;
    if let Some(name) = &resp.name {
        w.write_tagged_bytes(TAG_INTERMEDIATE_NAME, name.as_bytes())?;
    }
    if let Some(value) = &resp.value {
        w.write_tagged_bytes(TAG_INTERMEDIATE_VALUE, value)?;
    }
    Ok(())
}

fn encode_controls(
    w: &mut BerWriter,
    cur: &mut LenCursor,
    controls: &Controls,
) -> Result<(), Fail> {
    w.write_header(TAG_CONTROLS, cur.take()?)?;
    for control in controls {
        encode_control(w, cur, control)?;
    }
    Ok(())
}

fn encode_control(w: &mut BerWriter, cur: &mut LenCursor, control: &Control) -> Result<(), Fail> {
    w.write_header(ber::TAG_SEQUENCE, cur.take()?)?;
    w.write_string(&control.oid)?;
    if control.critical {
        w.write_boolean(true)?;
    }
    if let Some(value) = &control.value {
        w.write_octet_string(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{LdapResult, ModifyChange, ModifyOperation, ResultCode};

    #[test]
    fn test_encode_anonymous_bind_request() {
        let msg = LdapMessage::new(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Simple(Vec::new()),
            }),
        );
        let pdu = encode(&msg).unwrap();
        assert_eq!(
            pdu,
            [0x30, 0x0C, 0x02, 0x01, 0x01, 0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00]
        );
    }

    #[test]
    fn test_encode_bind_response_success() {
        let msg = LdapMessage::new(
            1,
            ProtocolOp::BindResponse(crate::message::BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None,
            }),
        );
        let pdu = encode(&msg).unwrap();
        assert_eq!(
            pdu,
            [0x30, 0x0C, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]
        );
    }

    #[test]
    fn test_encode_unbind() {
        let pdu = encode(&LdapMessage::new(3, ProtocolOp::UnbindRequest)).unwrap();
        assert_eq!(pdu, [0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]);
    }

    #[test]
    fn test_encode_abandon() {
        let pdu = encode(&LdapMessage::new(4, ProtocolOp::AbandonRequest(2))).unwrap();
        assert_eq!(pdu, [0x30, 0x06, 0x02, 0x01, 0x04, 0x50, 0x01, 0x02]);
    }

    #[test]
    fn test_encode_del_request() {
        let pdu = encode(&LdapMessage::new(5, ProtocolOp::DelRequest("dc=x".into()))).unwrap();
        assert_eq!(
            pdu,
            [0x30, 0x09, 0x02, 0x01, 0x05, 0x4A, 0x04, b'd', b'c', b'=', b'x']
        );
    }

    #[test]
    fn test_encode_search_request_and_equality_filter() {
        // base="", scope=base, deref=never, limits 0, typesOnly false,
        // filter (&(objectClass=top)), no attribute selection
        let msg = LdapMessage::new(
            2,
            ProtocolOp::SearchRequest(SearchRequest {
                base_object: String::new(),
                scope: crate::message::SearchScope::BaseObject,
                deref_aliases: crate::message::DerefAliases::NeverDerefAliases,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                filter: Filter::And(vec![Filter::equality("objectClass", b"top".to_vec())]),
                attributes: vec![],
            }),
        );
        let pdu = encode(&msg).unwrap();
        let expected: Vec<u8> = vec![
            0x30, 0x2E, 0x02, 0x01, 0x02, 0x63, 0x29, 0x04, 0x00, 0x0A, 0x01, 0x00, 0x0A, 0x01,
            0x00, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x14, 0xA3, 0x12,
            0x04, 0x0B, b'o', b'b', b'j', b'e', b'c', b't', b'C', b'l', b'a', b's', b's', 0x04,
            0x03, b't', b'o', b'p', 0x30, 0x00,
        ];
        assert_eq!(pdu, expected);
    }

    #[test]
    fn test_encode_search_result_entry_shape() {
        let msg = LdapMessage::new(
            2,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "dc=example,dc=com".into(),
                attributes: vec![Attribute::with_values("cn", vec![b"example".to_vec()])],
            }),
        );
        let pdu = encode(&msg).unwrap();
        assert_eq!(pdu[0], 0x30);
        // op tag and object name
        assert_eq!(pdu[5], 0x64);
        assert_eq!(&pdu[7..9], &[0x04, 0x11]);
        assert_eq!(&pdu[9..26], b"dc=example,dc=com");
        // partial attribute list: SEQUENCE of SEQUENCE { type, SET { value } }
        assert_eq!(pdu[26], 0x30);
        assert_eq!(pdu[28], 0x30);
        assert_eq!(&pdu[30..34], &[0x04, 0x02, b'c', b'n']);
        assert_eq!(pdu[34], 0x31);
        assert_eq!(&pdu[36..38], &[0x04, 0x07]);
        assert_eq!(&pdu[38..45], b"example");
        assert_eq!(pdu.len(), 45);
    }

    #[test]
    fn test_encode_modify_request_with_increment() {
        let msg = LdapMessage::new(
            6,
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: "uid=jdoe".into(),
                changes: vec![ModifyChange {
                    operation: ModifyOperation::Increment,
                    modification: Attribute::with_values("uidNumber", vec![b"1".to_vec()]),
                }],
            }),
        );
        let pdu = encode(&msg).unwrap();
        assert_eq!(pdu[5], 0x66);
        // change operation is ENUMERATED 3
        let pos = pdu.windows(3).position(|w| w == [0x0A, 0x01, 0x03]);
        assert!(pos.is_some());
    }

    #[test]
    fn test_encode_result_with_referral() {
        let mut result = LdapResult::new(ResultCode::Referral, "");
        result.referral = Some(vec!["ldap://other.example.com/".into()]);
        let msg = LdapMessage::new(7, ProtocolOp::SearchResultDone(result));
        let pdu = encode(&msg).unwrap();
        // referral [3] header follows the empty diagnostic message
        let pos = pdu.iter().position(|&b| b == 0xA3).unwrap();
        assert_eq!(pdu[pos + 1], 27);
        assert_eq!(&pdu[pos + 2..pos + 4], &[0x04, 25]);
    }

    #[test]
    fn test_encode_extended_response_tags() {
        let msg = LdapMessage::new(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::new(ResultCode::UnwillingToPerform, "shutting down"),
                name: Some("1.3.6.1.4.1.1466.20036".into()),
                value: None,
            }),
        );
        let pdu = encode(&msg).unwrap();
        assert!(pdu.contains(&0x8A));
        assert!(!pdu.contains(&0x8B));
    }

    #[test]
    fn test_encode_rejects_bad_message_ids() {
        let err = encode(&LdapMessage::new(-1, ProtocolOp::UnbindRequest)).unwrap_err();
        assert!(matches!(err, EncoderError::InvalidState { message_id: -1, .. }));

        let err = encode(&LdapMessage::new(0, ProtocolOp::UnbindRequest)).unwrap_err();
        assert!(matches!(err, EncoderError::InvalidState { message_id: 0, .. }));
    }

    #[test]
    fn test_encode_rejects_bad_bind_version() {
        let msg = LdapMessage::new(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 300,
                name: String::new(),
                authentication: BindAuthentication::Simple(Vec::new()),
            }),
        );
        assert!(matches!(
            encode(&msg),
            Err(EncoderError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_encode_into_overflow() {
        let msg = LdapMessage::new(3, ProtocolOp::UnbindRequest);
        let lengths = compute_message_length(&msg, &CodecConfig::default());
        let mut small = [0u8; 4];
        let err = encode_into(&msg, &lengths, &mut small, &CodecConfig::default()).unwrap_err();
        assert_eq!(err, EncoderError::Overflow { message_id: 3 });
    }

    #[test]
    fn test_encode_into_stale_lengths() {
        let unbind = LdapMessage::new(3, ProtocolOp::UnbindRequest);
        let other = LdapMessage::new(
            3,
            ProtocolOp::CompareRequest(crate::message::CompareRequest {
                entry: "cn=x".into(),
                attribute: "cn".into(),
                assertion_value: b"x".to_vec(),
            }),
        );
        let lengths = compute_message_length(&other, &CodecConfig::default());
        let mut buf = [0u8; 64];
        let err = encode_into(&unbind, &lengths, &mut buf, &CodecConfig::default()).unwrap_err();
        assert!(matches!(err, EncoderError::InvalidState { .. }));
    }

    #[test]
    fn test_encode_control_with_criticality() {
        let mut msg = LdapMessage::new(8, ProtocolOp::UnbindRequest);
        msg.controls.insert(Control {
            oid: "2.16.840.1.113730.3.4.2".into(),
            critical: true,
            value: None,
        });
        let pdu = encode(&msg).unwrap();
        let pos = pdu.iter().position(|&b| b == 0xA0).unwrap();
        // controls SEQUENCE wraps one control with an explicit TRUE
        assert_eq!(pdu[pos + 2], 0x30);
        assert!(pdu.ends_with(&[0x01, 0x01, 0xFF]));
    }

    #[test]
    fn test_written_len_matches_lengths() {
        let msg = LdapMessage::new(
            11,
            ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                entry: "cn=a,dc=b".into(),
                new_rdn: "cn=c".into(),
                delete_old_rdn: true,
                new_superior: Some("dc=d".into()),
            }),
        );
        let config = CodecConfig::default();
        let lengths = compute_message_length(&msg, &config);
        let mut buf = vec![0u8; lengths.pdu_len()];
        let written = encode_into(&msg, &lengths, &mut buf, &config).unwrap();
        assert_eq!(written, lengths.pdu_len());
    }
}
