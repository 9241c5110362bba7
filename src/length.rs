// First pass of the two-pass encoder: a post-order walk that measures every
// nested structure before any header is written. BER definite lengths appear
// before their content, so the encoder cannot produce a PDU in one pass
// without this step.
//
// Lengths are recorded in a pre-order slot arena rather than as mutable
// fields on the message objects: a slot is reserved when the walk enters a
// constructed value and filled once its content has been measured. The
// encoder replays the identical traversal and consumes the slots with a
// cursor, never re-measuring a non-leaf. Leaf lengths (strings, integers,
// booleans) are a byte count away in both passes and carry no slot.

use crate::ber;
use crate::config::CodecConfig;
use crate::filter::Filter;
use crate::message::{
    AddRequest, Attribute, BindAuthentication, BindRequest, Control, Controls, ExtendedRequest,
    ExtendedResponse, IntermediateResponse, LdapMessage, LdapResult, ModifyDnRequest,
    ModifyRequest, ProtocolOp, SearchRequest, SearchResultEntry,
};

/// The measured lengths of one message, in the order the encoder writes
/// headers. Produced by `compute_message_length`, consumed by
/// `encode::encode_into`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduLengths {
    slots: Vec<usize>,
}

impl PduLengths {
    /// Content length of the outermost LDAPMessage SEQUENCE.
    pub fn message_length(&self) -> usize {
        self.slots.first().copied().unwrap_or(0)
    }

    /// Total size of the PDU including the outer tag and length octets.
    pub fn pdu_len(&self) -> usize {
        ber::tlv_len(self.message_length())
    }

    pub(crate) fn slots(&self) -> &[usize] {
        &self.slots
    }
}

struct Walk {
    slots: Vec<usize>,
}

impl Walk {
    fn reserve(&mut self) -> usize {
        self.slots.push(0);
        self.slots.len() - 1
    }

    fn set(&mut self, slot: usize, len: usize) {
        self.slots[slot] = len;
    }
}

/// matchedDN as it will appear on the wire, honoring the trim option.
pub(crate) fn effective_matched_dn<'a>(result: &'a LdapResult, config: &CodecConfig) -> &'a str {
    if config.trim_matched_dn {
        result.matched_dn.trim_start()
    } else {
        &result.matched_dn
    }
}

/// Measure a message. Running this twice yields identical arenas; the walk
/// has no side effects on the message.
pub fn compute_message_length(message: &LdapMessage, config: &CodecConfig) -> PduLengths {
    let mut w = Walk { slots: Vec::new() };
    let slot = w.reserve();
    let mut content = ber::int_tlv_len(message.message_id);
    content += op_len(&mut w, &message.protocol_op, config);
    if !message.controls.is_empty() {
        content += controls_len(&mut w, &message.controls);
    }
    w.set(slot, content);
    PduLengths { slots: w.slots }
}

fn op_len(w: &mut Walk, op: &ProtocolOp, config: &CodecConfig) -> usize {
    match op {
        ProtocolOp::BindRequest(req) => bind_request_len(w, req),
        ProtocolOp::BindResponse(resp) => {
            let slot = w.reserve();
            let mut content = result_content_len(w, &resp.result, config);
            if let Some(creds) = &resp.server_sasl_creds {
                content += ber::tlv_len(creds.len());
            }
            w.set(slot, content);
            ber::tlv_len(content)
        }
        ProtocolOp::UnbindRequest => 2,
        ProtocolOp::SearchRequest(req) => search_request_len(w, req),
        ProtocolOp::SearchResultEntry(entry) => entry_len(w, entry),
        ProtocolOp::SearchResultReference(uris) => {
            let slot = w.reserve();
            let content = uris.iter().map(|u| ber::tlv_len(u.len())).sum();
            w.set(slot, content);
            ber::tlv_len(content)
        }
        ProtocolOp::SearchResultDone(result)
        | ProtocolOp::ModifyResponse(result)
        | ProtocolOp::AddResponse(result)
        | ProtocolOp::DelResponse(result)
        | ProtocolOp::ModifyDnResponse(result)
        | ProtocolOp::CompareResponse(result) => {
            let slot = w.reserve();
            let content = result_content_len(w, result, config);
            w.set(slot, content);
            ber::tlv_len(content)
        }
        ProtocolOp::ModifyRequest(req) => modify_request_len(w, req),
        ProtocolOp::AddRequest(req) => add_request_len(w, req),
        ProtocolOp::DelRequest(dn) => ber::tlv_len(dn.len()),
        ProtocolOp::ModifyDnRequest(req) => modify_dn_request_len(w, req),
        ProtocolOp::CompareRequest(req) => {
            let slot = w.reserve();
            let ava_slot = w.reserve();
            let ava = ber::tlv_len(req.attribute.len()) + ber::tlv_len(req.assertion_value.len());
            w.set(ava_slot, ava);
            let content = ber::tlv_len(req.entry.len()) + ber::tlv_len(ava);
            w.set(slot, content);
            ber::tlv_len(content)
        }
        ProtocolOp::AbandonRequest(id) => ber::int_tlv_len(*id),
        ProtocolOp::ExtendedRequest(req) => extended_request_len(w, req),
        ProtocolOp::ExtendedResponse(resp) => extended_response_len(w, resp, config),
        ProtocolOp::IntermediateResponse(resp) => intermediate_response_len(w, resp),
    }
}

fn bind_request_len(w: &mut Walk, req: &BindRequest) -> usize {
    let slot = w.reserve();
    let mut content = ber::int_tlv_len(req.version) + ber::tlv_len(req.name.len());
    content += match &req.authentication {
        BindAuthentication::Simple(creds) => ber::tlv_len(creds.len()),
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            let sasl_slot = w.reserve();
            let sasl = ber::tlv_len(mechanism.len())
                + credentials.as_ref().map_or(0, |c| ber::tlv_len(c.len()));
            w.set(sasl_slot, sasl);
            ber::tlv_len(sasl)
        }
    };
    w.set(slot, content);
    ber::tlv_len(content)
}

/// LDAPResult members shared by every terminating response: resultCode,
/// matchedDN, diagnosticMessage, optional referral [3].
fn result_content_len(w: &mut Walk, result: &LdapResult, config: &CodecConfig) -> usize {
    let mut content = ber::int_tlv_len(result.result_code.code());
    content += ber::tlv_len(effective_matched_dn(result, config).len());
    content += ber::tlv_len(result.diagnostic_message.len());
    if let Some(referral) = &result.referral {
        let slot = w.reserve();
        let uris = referral.iter().map(|u| ber::tlv_len(u.len())).sum();
        w.set(slot, uris);
        content += ber::tlv_len(uris);
    }
    content
}

fn search_request_len(w: &mut Walk, req: &SearchRequest) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(req.base_object.len());
    content += ber::int_tlv_len(req.scope as i32);
    content += ber::int_tlv_len(req.deref_aliases as i32);
    content += ber::uint_tlv_len(req.size_limit);
    content += ber::uint_tlv_len(req.time_limit);
    content += 3; // typesOnly BOOLEAN
    content += filter_len(w, &req.filter);
    let attrs_slot = w.reserve();
    let attrs: usize = req.attributes.iter().map(|a| ber::tlv_len(a.len())).sum();
    w.set(attrs_slot, attrs);
    content += ber::tlv_len(attrs);
    w.set(slot, content);
    ber::tlv_len(content)
}

fn filter_len(w: &mut Walk, filter: &Filter) -> usize {
    match filter {
        Filter::Present(attribute) => ber::tlv_len(attribute.len()),
        Filter::And(children) | Filter::Or(children) => {
            let slot = w.reserve();
            let content = children.iter().map(|f| filter_len(w, f)).sum();
            w.set(slot, content);
            ber::tlv_len(content)
        }
        Filter::Not(child) => {
            let slot = w.reserve();
            let content = filter_len(w, child);
            w.set(slot, content);
            ber::tlv_len(content)
        }
        Filter::EqualityMatch { attribute, value }
        | Filter::GreaterOrEqual { attribute, value }
        | Filter::LessOrEqual { attribute, value }
        | Filter::ApproxMatch { attribute, value } => {
            let slot = w.reserve();
            let content = ber::tlv_len(attribute.len()) + ber::tlv_len(value.len());
            w.set(slot, content);
            ber::tlv_len(content)
        }
        Filter::Substrings {
            attribute,
            initial,
            any,
            last,
        } => {
            let slot = w.reserve();
            let pieces_slot = w.reserve();
            let mut pieces = initial.as_ref().map_or(0, |p| ber::tlv_len(p.len()));
            pieces += any.iter().map(|p| ber::tlv_len(p.len())).sum::<usize>();
            pieces += last.as_ref().map_or(0, |p| ber::tlv_len(p.len()));
            w.set(pieces_slot, pieces);
            let content = ber::tlv_len(attribute.len()) + ber::tlv_len(pieces);
            w.set(slot, content);
            ber::tlv_len(content)
        }
        Filter::ExtensibleMatch {
            matching_rule,
            match_type,
            match_value,
            dn_attributes,
        } => {
            let slot = w.reserve();
            let mut content = matching_rule.as_ref().map_or(0, |r| ber::tlv_len(r.len()));
            content += match_type.as_ref().map_or(0, |t| ber::tlv_len(t.len()));
            content += ber::tlv_len(match_value.len());
            if *dn_attributes {
                content += 3; // dnAttributes BOOLEAN, omitted when DEFAULT FALSE
            }
            w.set(slot, content);
            ber::tlv_len(content)
        }
    }
}

fn entry_len(w: &mut Walk, entry: &SearchResultEntry) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(entry.object_name.len());
    content += attribute_list_len(w, &entry.attributes);
    w.set(slot, content);
    ber::tlv_len(content)
}

fn add_request_len(w: &mut Walk, req: &AddRequest) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(req.entry.len());
    content += attribute_list_len(w, &req.attributes);
    w.set(slot, content);
    ber::tlv_len(content)
}

fn attribute_list_len(w: &mut Walk, attributes: &[Attribute]) -> usize {
    let slot = w.reserve();
    let content = attributes.iter().map(|a| attribute_len(w, a)).sum();
    w.set(slot, content);
    ber::tlv_len(content)
}

fn attribute_len(w: &mut Walk, attribute: &Attribute) -> usize {
    let slot = w.reserve();
    let set_slot = w.reserve();
    let values: usize = attribute
        .attr_values
        .iter()
        .map(|v| ber::tlv_len(v.len()))
        .sum();
    w.set(set_slot, values);
    let content = ber::tlv_len(attribute.attr_type.len()) + ber::tlv_len(values);
    w.set(slot, content);
    ber::tlv_len(content)
}

fn modify_request_len(w: &mut Walk, req: &ModifyRequest) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(req.object.len());
    let changes_slot = w.reserve();
    let mut changes = 0;
    for change in &req.changes {
        let change_slot = w.reserve();
        let change_content =
            ber::int_tlv_len(change.operation as i32) + attribute_len(w, &change.modification);
        w.set(change_slot, change_content);
        changes += ber::tlv_len(change_content);
    }
    w.set(changes_slot, changes);
    content += ber::tlv_len(changes);
    w.set(slot, content);
    ber::tlv_len(content)
}

fn modify_dn_request_len(w: &mut Walk, req: &ModifyDnRequest) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(req.entry.len()) + ber::tlv_len(req.new_rdn.len()) + 3;
    if let Some(new_superior) = &req.new_superior {
        content += ber::tlv_len(new_superior.len());
    }
    w.set(slot, content);
    ber::tlv_len(content)
}

fn extended_request_len(w: &mut Walk, req: &ExtendedRequest) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(req.name.len());
    if let Some(value) = &req.value {
        content += ber::tlv_len(value.len());
    }
    w.set(slot, content);
    ber::tlv_len(content)
}

fn extended_response_len(w: &mut Walk, resp: &ExtendedResponse, config: &CodecConfig) -> usize {
    let slot = w.reserve();
    let mut content = result_content_len(w, &resp.result, config);
    if let Some(name) = &resp.name {
        content += ber::tlv_len(name.len());
    }
    if let Some(value) = &resp.value {
        content += ber::tlv_len(value.len());
    }
    w.set(slot, content);
    ber::tlv_len(content)
}

fn intermediate_response_len(w: &mut Walk, resp: &IntermediateResponse) -> usize {
    let slot = w.reserve();
    let mut content = 0;
    if let Some(name) = &resp.name {
        content += ber::tlv_len(name.len());
    }
    if let Some(value) = &resp.value {
        content += ber::tlv_len(value.len());
    }
    w.set(slot, content);
    ber::tlv_len(content)
}

fn controls_len(w: &mut Walk, controls: &Controls) -> usize {
    let slot = w.reserve();
    let content = controls.iter().map(|c| control_len(w, c)).sum();
    w.set(slot, content);
    ber::tlv_len(content)
}

fn control_len(w: &mut Walk, control: &Control) -> usize {
    let slot = w.reserve();
    let mut content = ber::tlv_len(control.oid.len());
    if control.critical {
        content += 3; // criticality BOOLEAN, omitted when DEFAULT FALSE
    }
    if let Some(value) = &control.value {
        content += ber::tlv_len(value.len());
    }
    w.set(slot, content);
    ber::tlv_len(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BindAuthentication, LdapResult, ResultCode};

    fn bind_request_v3() -> LdapMessage {
        LdapMessage::new(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Simple(Vec::new()),
            }),
        )
    }

    #[test]
    fn test_anonymous_bind_lengths() {
        let config = CodecConfig::default();
        let lengths = compute_message_length(&bind_request_v3(), &config);
        // 30 0c 02 01 01 60 07 02 01 03 04 00 80 00
        assert_eq!(lengths.message_length(), 12);
        assert_eq!(lengths.pdu_len(), 14);
        assert_eq!(lengths.slots(), &[12, 7]);
    }

    #[test]
    fn test_length_pass_is_idempotent() {
        let config = CodecConfig::default();
        let msg = LdapMessage::new(
            2,
            ProtocolOp::SearchRequest(SearchRequest {
                base_object: "dc=example,dc=com".into(),
                scope: crate::message::SearchScope::WholeSubtree,
                deref_aliases: crate::message::DerefAliases::NeverDerefAliases,
                size_limit: 100,
                time_limit: 30,
                types_only: false,
                filter: Filter::And(vec![
                    Filter::equality("objectClass", b"person".to_vec()),
                    Filter::present("cn"),
                ]),
                attributes: vec!["cn".into(), "sn".into()],
            }),
        );
        let first = compute_message_length(&msg, &config);
        let second = compute_message_length(&msg, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_matched_dn_trim_affects_length() {
        let mut result = LdapResult::new(ResultCode::NoSuchObject, "");
        result.matched_dn = "  dc=example".into();
        let msg = LdapMessage::new(9, ProtocolOp::SearchResultDone(result));

        let trimming = CodecConfig::default();
        let verbatim = CodecConfig {
            trim_matched_dn: false,
            ..CodecConfig::default()
        };
        let trimmed = compute_message_length(&msg, &trimming);
        let kept = compute_message_length(&msg, &verbatim);
        assert_eq!(kept.message_length(), trimmed.message_length() + 2);
    }

    #[test]
    fn test_unbind_length() {
        let config = CodecConfig::default();
        let lengths = compute_message_length(
            &LdapMessage::new(3, ProtocolOp::UnbindRequest),
            &config,
        );
        // 30 05 02 01 03 42 00
        assert_eq!(lengths.pdu_len(), 7);
    }
}
