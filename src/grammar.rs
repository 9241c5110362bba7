// The LDAP decode grammar: a state × tag transition machine. Each TLV event
// from the tokenizer lands here; the match arms are the transition table and
// every arm's body is the action that populates the message being built.
// Sub-structures (filters, attributes, changes, controls) are entered by
// pushing a frame with the expected end offset and left in `on_frame_end`
// when the container reaches that offset. Unknown tags are always an error,
// never skipped.

use crate::ber;
use crate::config::CodecConfig;
use crate::decode::{Build, Decoder, FilterNode, FrameKind};
use crate::error::DecoderError;
use crate::filter::{self, Filter};
use crate::message::{
    self, attr_description_is_binary, AddRequest, Attribute, BindAuthentication, BindRequest,
    BindResponse, CompareRequest, Control, ExtendedRequest, ExtendedResponse,
    IntermediateResponse, LdapResult, ModifyChange, ModifyDnRequest, ModifyOperation,
    ModifyRequest, ProtocolOp, ResultCode, SearchRequest, SearchResultEntry,
};
use crate::tlv::Tlv;

// Context tags outside the filter sublanguage (decode side).
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

/// Decoder grammar states. Exposed because decode errors carry the state
/// they were raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrammarState {
    Start,
    MessageId,
    ProtocolOp,
    /// The protocolOp is done; controls may follow, or the message ends.
    AfterOp,
    /// Nothing more is expected before the innermost frame closes.
    End,

    BindVersion,
    BindName,
    BindAuth,
    SaslMechanism,
    SaslCredentials,

    ResultCode,
    ResultMatchedDn,
    ResultDiagnostic,
    /// Optional LDAPResult tail: referral, then op-specific fields.
    ResultTail,
    /// Same, once the referral has been consumed.
    ResultTailNoReferral,
    ReferralUri,
    ExtRespValue,

    SearchBase,
    SearchScope,
    SearchDeref,
    SearchSizeLimit,
    SearchTimeLimit,
    SearchTypesOnly,
    FilterStart,
    FilterAvaAttr,
    FilterAvaValue,
    SubstringsType,
    SubstringsSeq,
    SubstringsItem,
    ExtensibleItem,
    SearchAttrList,
    SearchAttr,

    EntryDn,
    AddEntry,
    AttrListStart,
    AttrSeqStart,
    AttrType,
    AttrValSet,
    AttrValue,

    ModifyObject,
    ModifyChangeList,
    ModifyChangeSeq,
    ModifyChangeOp,

    ModDnEntry,
    ModDnNewRdn,
    ModDnDeleteOld,
    ModDnTail,

    CompareEntry,
    CompareAvaSeq,
    CompareAttr,
    CompareValue,

    ExtReqName,
    ExtReqTail,
    IntermediateTail,
    ReferenceUri,

    ControlSeqStart,
    ControlOid,
    ControlCritical,
    ControlValue,
}

fn unexpected(state: GrammarState, tag: u8) -> DecoderError {
    DecoderError::UnexpectedTag { state, tag }
}

fn grammar_err(state: GrammarState, tag: u8) -> DecoderError {
    DecoderError::GrammarError { state, tag }
}

/// String-typed field per the configured UTF-8 policy.
fn utf8(config: &CodecConfig, bytes: &[u8]) -> Result<String, DecoderError> {
    if config.strict_string_validation {
        String::from_utf8(bytes.to_vec()).map_err(|_| DecoderError::InvalidUtf8)
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Attribute descriptions additionally honor the binary-option setting.
fn attr_description(
    config: &CodecConfig,
    state: GrammarState,
    tag: u8,
    bytes: &[u8],
) -> Result<String, DecoderError> {
    let description = utf8(config, bytes)?;
    if !config.allow_binary_attribute_option && attr_description_is_binary(&description) {
        return Err(grammar_err(state, tag));
    }
    Ok(description)
}

// Accessors into the op under construction. A mismatch between the grammar
// state and the op variant cannot be produced by any input; they fail closed
// instead of panicking.

fn bind_request_mut(
    build: &mut Build,
    state: GrammarState,
) -> Result<&mut BindRequest, DecoderError> {
    match build.op.as_mut() {
        Some(ProtocolOp::BindRequest(req)) => Ok(req),
        _ => Err(grammar_err(state, message::TAG_BIND_REQUEST)),
    }
}

fn search_request_mut(
    build: &mut Build,
    state: GrammarState,
) -> Result<&mut SearchRequest, DecoderError> {
    match build.op.as_mut() {
        Some(ProtocolOp::SearchRequest(req)) => Ok(req),
        _ => Err(grammar_err(state, message::TAG_SEARCH_REQUEST)),
    }
}

fn result_mut(build: &mut Build, state: GrammarState) -> Result<&mut LdapResult, DecoderError> {
    match build.op.as_mut() {
        Some(ProtocolOp::BindResponse(resp)) => Ok(&mut resp.result),
        Some(ProtocolOp::SearchResultDone(result))
        | Some(ProtocolOp::ModifyResponse(result))
        | Some(ProtocolOp::AddResponse(result))
        | Some(ProtocolOp::DelResponse(result))
        | Some(ProtocolOp::ModifyDnResponse(result))
        | Some(ProtocolOp::CompareResponse(result)) => Ok(result),
        Some(ProtocolOp::ExtendedResponse(resp)) => Ok(&mut resp.result),
        _ => Err(grammar_err(state, 0x30)),
    }
}

/// Transition on the header of a constructed TLV. Pushes the frame that
/// `on_frame_end` later closes.
pub(crate) fn on_constructed(d: &mut Decoder, tag: u8, end: u64) -> Result<(), DecoderError> {
    let state = d.state;
    match state {
        GrammarState::Start => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::Message, end);
            d.state = GrammarState::MessageId;
        }
        GrammarState::ProtocolOp => {
            let (op, next) = start_op(tag).ok_or(DecoderError::UnsupportedChoice { tag })?;
            d.build.op = Some(op);
            d.push_frame(FrameKind::Op, end);
            d.state = next;
        }
        GrammarState::BindAuth => {
            if tag != TAG_AUTH_SASL {
                return Err(DecoderError::UnsupportedChoice { tag });
            }
            let req = bind_request_mut(&mut d.build, state)?;
            req.authentication = BindAuthentication::Sasl {
                mechanism: String::new(),
                credentials: None,
            };
            d.push_frame(FrameKind::Sasl, end);
            d.state = GrammarState::SaslMechanism;
        }
        GrammarState::ResultTail => {
            if tag != TAG_REFERRAL {
                return Err(unexpected(state, tag));
            }
            result_mut(&mut d.build, state)?.referral = Some(Vec::new());
            d.push_frame(FrameKind::Referral, end);
            d.state = GrammarState::ReferralUri;
        }
        GrammarState::FilterStart => start_filter_node(d, tag, end)?,
        GrammarState::SubstringsSeq => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::SubstringSeq, end);
            d.state = GrammarState::SubstringsItem;
        }
        GrammarState::SearchAttrList => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::AttrSelList, end);
            d.state = GrammarState::SearchAttr;
        }
        GrammarState::AttrListStart => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::AttrList, end);
            d.state = GrammarState::AttrSeqStart;
        }
        GrammarState::AttrSeqStart => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::AttrSeq, end);
            d.state = GrammarState::AttrType;
        }
        GrammarState::AttrValSet => {
            if tag != ber::TAG_SET {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::AttrValSet, end);
            d.state = GrammarState::AttrValue;
        }
        GrammarState::ModifyChangeList => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::ChangeList, end);
            d.state = GrammarState::ModifyChangeSeq;
        }
        GrammarState::ModifyChangeSeq => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::ChangeSeq, end);
            d.state = GrammarState::ModifyChangeOp;
        }
        GrammarState::CompareAvaSeq => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::CompareAva, end);
            d.state = GrammarState::CompareAttr;
        }
        GrammarState::AfterOp => {
            if tag != message::TAG_CONTROLS {
                return Err(unexpected(state, tag));
            }
            d.push_frame(FrameKind::Controls, end);
            d.state = GrammarState::ControlSeqStart;
        }
        GrammarState::ControlSeqStart => {
            if tag != ber::TAG_SEQUENCE {
                return Err(unexpected(state, tag));
            }
            d.build.control = Some(Control::new(String::new()));
            d.push_frame(FrameKind::ControlSeq, end);
            d.state = GrammarState::ControlOid;
        }
        _ => return Err(unexpected(state, tag)),
    }
    Ok(())
}

/// ProtocolOp CHOICE alternatives with constructed encodings, keyed by tag.
fn start_op(tag: u8) -> Option<(ProtocolOp, GrammarState)> {
    let entry = match tag {
        message::TAG_BIND_REQUEST => (
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Simple(Vec::new()),
            }),
            GrammarState::BindVersion,
        ),
        message::TAG_BIND_RESPONSE => (
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::default(),
                server_sasl_creds: None,
            }),
            GrammarState::ResultCode,
        ),
        message::TAG_SEARCH_REQUEST => (
            ProtocolOp::SearchRequest(SearchRequest {
                base_object: String::new(),
                scope: message::SearchScope::BaseObject,
                deref_aliases: message::DerefAliases::NeverDerefAliases,
                size_limit: 0,
                time_limit: 0,
                types_only: false,
                // replaced before the op can complete
                filter: Filter::And(Vec::new()),
                attributes: Vec::new(),
            }),
            GrammarState::SearchBase,
        ),
        message::TAG_SEARCH_RESULT_ENTRY => (
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: String::new(),
                attributes: Vec::new(),
            }),
            GrammarState::EntryDn,
        ),
        message::TAG_SEARCH_RESULT_REFERENCE => (
            ProtocolOp::SearchResultReference(Vec::new()),
            GrammarState::ReferenceUri,
        ),
        message::TAG_SEARCH_RESULT_DONE => (
            ProtocolOp::SearchResultDone(LdapResult::default()),
            GrammarState::ResultCode,
        ),
        message::TAG_MODIFY_REQUEST => (
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: String::new(),
                changes: Vec::new(),
            }),
            GrammarState::ModifyObject,
        ),
        message::TAG_MODIFY_RESPONSE => (
            ProtocolOp::ModifyResponse(LdapResult::default()),
            GrammarState::ResultCode,
        ),
        message::TAG_ADD_REQUEST => (
            ProtocolOp::AddRequest(AddRequest {
                entry: String::new(),
                attributes: Vec::new(),
            }),
            GrammarState::AddEntry,
        ),
        message::TAG_ADD_RESPONSE => (
            ProtocolOp::AddResponse(LdapResult::default()),
            GrammarState::ResultCode,
        ),
        message::TAG_DEL_RESPONSE => (
            ProtocolOp::DelResponse(LdapResult::default()),
            GrammarState::ResultCode,
        ),
        message::TAG_MODIFY_DN_REQUEST => (
            ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                entry: String::new(),
                new_rdn: String::new(),
                delete_old_rdn: false,
                new_superior: None,
            }),
            GrammarState::ModDnEntry,
        ),
        message::TAG_MODIFY_DN_RESPONSE => (
            ProtocolOp::ModifyDnResponse(LdapResult::default()),
            GrammarState::ResultCode,
        ),
        message::TAG_COMPARE_REQUEST => (
            ProtocolOp::CompareRequest(CompareRequest {
                entry: String::new(),
                attribute: String::new(),
                assertion_value: Vec::new(),
            }),
            GrammarState::CompareEntry,
        ),
        message::TAG_COMPARE_RESPONSE => (
            ProtocolOp::CompareResponse(LdapResult::default()),
            GrammarState::ResultCode,
        ),
        message::TAG_EXTENDED_REQUEST => (
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                name: String::new(),
                value: None,
            }),
            GrammarState::ExtReqName,
        ),
        message::TAG_EXTENDED_RESPONSE => (
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::default(),
                name: None,
                value: None,
            }),
            GrammarState::ResultCode,
        ),
        message::TAG_INTERMEDIATE_RESPONSE => (
            ProtocolOp::IntermediateResponse(IntermediateResponse::default()),
            GrammarState::IntermediateTail,
        ),
        _ => return None,
    };
    Some(entry)
}

/// NOT takes exactly one child; reject a second node before it starts.
fn ensure_parent_accepts(build: &Build, tag: u8) -> Result<(), DecoderError> {
    if let Some(FilterNode::Not(children)) = build.filter_stack.last() {
        if !children.is_empty() {
            return Err(unexpected(GrammarState::FilterStart, tag));
        }
    }
    Ok(())
}

fn start_filter_node(d: &mut Decoder, tag: u8, end: u64) -> Result<(), DecoderError> {
    ensure_parent_accepts(&d.build, tag)?;
    let (node, next) = match tag {
        filter::TAG_FILTER_AND => (FilterNode::And(Vec::new()), GrammarState::FilterStart),
        filter::TAG_FILTER_OR => (FilterNode::Or(Vec::new()), GrammarState::FilterStart),
        filter::TAG_FILTER_NOT => (FilterNode::Not(Vec::new()), GrammarState::FilterStart),
        filter::TAG_FILTER_EQUALITY
        | filter::TAG_FILTER_GREATER_OR_EQUAL
        | filter::TAG_FILTER_LESS_OR_EQUAL
        | filter::TAG_FILTER_APPROX => (
            FilterNode::Ava {
                tag,
                attribute: None,
                value: None,
            },
            GrammarState::FilterAvaAttr,
        ),
        filter::TAG_FILTER_SUBSTRINGS => (
            FilterNode::Substrings {
                attribute: None,
                initial: None,
                any: Vec::new(),
                last: None,
                saw_final: false,
            },
            GrammarState::SubstringsType,
        ),
        filter::TAG_FILTER_EXTENSIBLE => (
            FilterNode::Extensible {
                matching_rule: None,
                match_type: None,
                match_value: None,
                dn_attributes: false,
            },
            GrammarState::ExtensibleItem,
        ),
        _ => return Err(DecoderError::UnsupportedChoice { tag }),
    };
    d.build.filter_stack.push(node);
    d.push_frame(FrameKind::Filter, end);
    d.state = next;
    Ok(())
}

/// Transition on a completed primitive TLV.
pub(crate) fn on_primitive(d: &mut Decoder, tlv: Tlv) -> Result<(), DecoderError> {
    let state = d.state;
    let tag = tlv.tag;
    let value = tlv.value.as_ref();
    match state {
        GrammarState::MessageId => {
            if tag != ber::TAG_INTEGER {
                return Err(unexpected(state, tag));
            }
            let id = ber::decode_integer(value)?;
            if id < 0 {
                return Err(grammar_err(state, tag));
            }
            d.note_message_id(id);
            d.state = GrammarState::ProtocolOp;
        }
        GrammarState::ProtocolOp => match tag {
            message::TAG_UNBIND_REQUEST => {
                if !value.is_empty() {
                    return Err(grammar_err(state, tag));
                }
                d.build.op = Some(ProtocolOp::UnbindRequest);
                d.state = GrammarState::AfterOp;
            }
            message::TAG_DEL_REQUEST => {
                let dn = utf8(&d.config, value)?;
                d.build.op = Some(ProtocolOp::DelRequest(dn));
                d.state = GrammarState::AfterOp;
            }
            message::TAG_ABANDON_REQUEST => {
                let id = ber::decode_integer(value)?;
                d.build.op = Some(ProtocolOp::AbandonRequest(id));
                d.state = GrammarState::AfterOp;
            }
            _ => return Err(DecoderError::UnsupportedChoice { tag }),
        },

        GrammarState::BindVersion => {
            if tag != ber::TAG_INTEGER {
                return Err(unexpected(state, tag));
            }
            let version = ber::decode_integer(value)?;
            if !(1..=127).contains(&version) {
                return Err(grammar_err(state, tag));
            }
            bind_request_mut(&mut d.build, state)?.version = version;
            d.state = GrammarState::BindName;
        }
        GrammarState::BindName => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let name = utf8(&d.config, value)?;
            bind_request_mut(&mut d.build, state)?.name = name;
            d.state = GrammarState::BindAuth;
        }
        GrammarState::BindAuth => {
            if tag != TAG_AUTH_SIMPLE {
                return Err(DecoderError::UnsupportedChoice { tag });
            }
            bind_request_mut(&mut d.build, state)?.authentication =
                BindAuthentication::Simple(value.to_vec());
            d.state = GrammarState::End;
        }
        GrammarState::SaslMechanism => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let mech = utf8(&d.config, value)?;
            match &mut bind_request_mut(&mut d.build, state)?.authentication {
                BindAuthentication::Sasl { mechanism, .. } => *mechanism = mech,
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::SaslCredentials;
        }
        GrammarState::SaslCredentials => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            match &mut bind_request_mut(&mut d.build, state)?.authentication {
                BindAuthentication::Sasl { credentials, .. } => {
                    *credentials = Some(value.to_vec())
                }
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::End;
        }

        GrammarState::ResultCode => {
            if tag != ber::TAG_ENUMERATED {
                return Err(unexpected(state, tag));
            }
            let code = ber::decode_integer(value)?;
            result_mut(&mut d.build, state)?.result_code = ResultCode::from_code(code);
            d.state = GrammarState::ResultMatchedDn;
        }
        GrammarState::ResultMatchedDn => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            result_mut(&mut d.build, state)?.matched_dn = dn;
            d.state = GrammarState::ResultDiagnostic;
        }
        GrammarState::ResultDiagnostic => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let message = utf8(&d.config, value)?;
            result_mut(&mut d.build, state)?.diagnostic_message = message;
            d.state = GrammarState::ResultTail;
        }
        GrammarState::ResultTail | GrammarState::ResultTailNoReferral => {
            match (tag, d.build.op.as_mut()) {
                (TAG_SERVER_SASL_CREDS, Some(ProtocolOp::BindResponse(resp))) => {
                    resp.server_sasl_creds = Some(value.to_vec());
                    d.state = GrammarState::End;
                }
                (TAG_EXT_RESP_NAME, Some(ProtocolOp::ExtendedResponse(resp))) => {
                    resp.name = Some(utf8(&d.config, value)?);
                    d.state = GrammarState::ExtRespValue;
                }
                (TAG_EXT_RESP_VALUE, Some(ProtocolOp::ExtendedResponse(resp))) => {
                    resp.value = Some(value.to_vec());
                    d.state = GrammarState::End;
                }
                _ => return Err(unexpected(state, tag)),
            }
        }
        GrammarState::ExtRespValue => {
            match (tag, d.build.op.as_mut()) {
                (TAG_EXT_RESP_VALUE, Some(ProtocolOp::ExtendedResponse(resp))) => {
                    resp.value = Some(value.to_vec());
                    d.state = GrammarState::End;
                }
                _ => return Err(unexpected(state, tag)),
            }
        }
        GrammarState::ReferralUri => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let uri = utf8(&d.config, value)?;
            match &mut result_mut(&mut d.build, state)?.referral {
                Some(referral) => referral.push(uri),
                None => return Err(grammar_err(state, tag)),
            }
        }

        GrammarState::SearchBase => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let base = utf8(&d.config, value)?;
            search_request_mut(&mut d.build, state)?.base_object = base;
            d.state = GrammarState::SearchScope;
        }
        GrammarState::SearchScope => {
            if tag != ber::TAG_ENUMERATED {
                return Err(unexpected(state, tag));
            }
            let code = ber::decode_integer(value)?;
            let scope = message::SearchScope::from_code(code).ok_or(grammar_err(state, tag))?;
            search_request_mut(&mut d.build, state)?.scope = scope;
            d.state = GrammarState::SearchDeref;
        }
        GrammarState::SearchDeref => {
            if tag != ber::TAG_ENUMERATED {
                return Err(unexpected(state, tag));
            }
            let code = ber::decode_integer(value)?;
            let deref = message::DerefAliases::from_code(code).ok_or(grammar_err(state, tag))?;
            search_request_mut(&mut d.build, state)?.deref_aliases = deref;
            d.state = GrammarState::SearchSizeLimit;
        }
        GrammarState::SearchSizeLimit => {
            search_request_mut(&mut d.build, state)?.size_limit =
                decode_limit(state, tag, value)?;
            d.state = GrammarState::SearchTimeLimit;
        }
        GrammarState::SearchTimeLimit => {
            search_request_mut(&mut d.build, state)?.time_limit =
                decode_limit(state, tag, value)?;
            d.state = GrammarState::SearchTypesOnly;
        }
        GrammarState::SearchTypesOnly => {
            if tag != ber::TAG_BOOLEAN {
                return Err(unexpected(state, tag));
            }
            search_request_mut(&mut d.build, state)?.types_only = ber::decode_boolean(value)?;
            d.state = GrammarState::FilterStart;
        }

        GrammarState::FilterStart => {
            if tag != filter::TAG_FILTER_PRESENT {
                return Err(DecoderError::UnsupportedChoice { tag });
            }
            ensure_parent_accepts(&d.build, tag)?;
            let attribute = attr_description(&d.config, state, tag, value)?;
            attach_filter(d, Filter::Present(attribute))?;
        }
        GrammarState::FilterAvaAttr => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let attribute = attr_description(&d.config, state, tag, value)?;
            match d.build.filter_stack.last_mut() {
                Some(FilterNode::Ava {
                    attribute: slot, ..
                }) => *slot = Some(attribute),
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::FilterAvaValue;
        }
        GrammarState::FilterAvaValue => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            match d.build.filter_stack.last_mut() {
                Some(FilterNode::Ava { value: slot, .. }) => *slot = Some(value.to_vec()),
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::End;
        }
        GrammarState::SubstringsType => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let attribute = attr_description(&d.config, state, tag, value)?;
            match d.build.filter_stack.last_mut() {
                Some(FilterNode::Substrings {
                    attribute: slot, ..
                }) => *slot = Some(attribute),
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::SubstringsSeq;
        }
        GrammarState::SubstringsItem => {
            let Some(FilterNode::Substrings {
                initial,
                any,
                last,
                saw_final,
                ..
            }) = d.build.filter_stack.last_mut()
            else {
                return Err(grammar_err(state, tag));
            };
            match tag {
                filter::TAG_SUBSTRING_INITIAL => {
                    // initial must be the first piece, once
                    if initial.is_some() || !any.is_empty() || *saw_final {
                        return Err(grammar_err(state, tag));
                    }
                    *initial = Some(value.to_vec());
                }
                filter::TAG_SUBSTRING_ANY => {
                    if *saw_final {
                        return Err(grammar_err(state, tag));
                    }
                    any.push(value.to_vec());
                }
                filter::TAG_SUBSTRING_FINAL => {
                    if *saw_final {
                        return Err(grammar_err(state, tag));
                    }
                    *last = Some(value.to_vec());
                    *saw_final = true;
                }
                _ => return Err(unexpected(state, tag)),
            }
        }
        GrammarState::ExtensibleItem => {
            let config_strict = d.config.strict_string_validation;
            let Some(FilterNode::Extensible {
                matching_rule,
                match_type,
                match_value,
                dn_attributes,
            }) = d.build.filter_stack.last_mut()
            else {
                return Err(grammar_err(state, tag));
            };
            let text = |bytes: &[u8]| -> Result<String, DecoderError> {
                if config_strict {
                    String::from_utf8(bytes.to_vec()).map_err(|_| DecoderError::InvalidUtf8)
                } else {
                    Ok(String::from_utf8_lossy(bytes).into_owned())
                }
            };
            match tag {
                filter::TAG_MATCHING_RULE => {
                    if matching_rule.is_some() || match_type.is_some() || match_value.is_some() {
                        return Err(grammar_err(state, tag));
                    }
                    *matching_rule = Some(text(value)?);
                }
                filter::TAG_MATCHING_TYPE => {
                    if match_type.is_some() || match_value.is_some() {
                        return Err(grammar_err(state, tag));
                    }
                    *match_type = Some(text(value)?);
                }
                filter::TAG_MATCHING_VALUE => {
                    if match_value.is_some() {
                        return Err(grammar_err(state, tag));
                    }
                    *match_value = Some(value.to_vec());
                }
                filter::TAG_MATCHING_DN_ATTRS => {
                    if match_value.is_none() {
                        return Err(grammar_err(state, tag));
                    }
                    *dn_attributes = ber::decode_boolean(value)?;
                }
                _ => return Err(unexpected(state, tag)),
            }
        }
        GrammarState::SearchAttr => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let attribute = attr_description(&d.config, state, tag, value)?;
            search_request_mut(&mut d.build, state)?.attributes.push(attribute);
        }

        GrammarState::EntryDn => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            match d.build.op.as_mut() {
                Some(ProtocolOp::SearchResultEntry(entry)) => entry.object_name = dn,
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::AttrListStart;
        }
        GrammarState::AddEntry => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            match d.build.op.as_mut() {
                Some(ProtocolOp::AddRequest(req)) => req.entry = dn,
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::AttrListStart;
        }
        GrammarState::AttrType => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let description = attr_description(&d.config, state, tag, value)?;
            d.build.attr = Some(Attribute::new(description));
            d.state = GrammarState::AttrValSet;
        }
        GrammarState::AttrValue => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            match &mut d.build.attr {
                Some(attr) => attr.attr_values.push(value.to_vec()),
                None => return Err(grammar_err(state, tag)),
            }
        }

        GrammarState::ModifyObject => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            match d.build.op.as_mut() {
                Some(ProtocolOp::ModifyRequest(req)) => req.object = dn,
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::ModifyChangeList;
        }
        GrammarState::ModifyChangeOp => {
            if tag != ber::TAG_ENUMERATED {
                return Err(unexpected(state, tag));
            }
            let code = ber::decode_integer(value)?;
            let operation =
                ModifyOperation::from_code(code).ok_or(grammar_err(state, tag))?;
            d.build.change_op = Some(operation);
            d.state = GrammarState::AttrSeqStart;
        }

        GrammarState::ModDnEntry => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            mod_dn_mut(&mut d.build, state)?.entry = dn;
            d.state = GrammarState::ModDnNewRdn;
        }
        GrammarState::ModDnNewRdn => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let rdn = utf8(&d.config, value)?;
            mod_dn_mut(&mut d.build, state)?.new_rdn = rdn;
            d.state = GrammarState::ModDnDeleteOld;
        }
        GrammarState::ModDnDeleteOld => {
            if tag != ber::TAG_BOOLEAN {
                return Err(unexpected(state, tag));
            }
            mod_dn_mut(&mut d.build, state)?.delete_old_rdn = ber::decode_boolean(value)?;
            d.state = GrammarState::ModDnTail;
        }
        GrammarState::ModDnTail => {
            if tag != TAG_NEW_SUPERIOR {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            mod_dn_mut(&mut d.build, state)?.new_superior = Some(dn);
            d.state = GrammarState::End;
        }

        GrammarState::CompareEntry => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let dn = utf8(&d.config, value)?;
            compare_mut(&mut d.build, state)?.entry = dn;
            d.state = GrammarState::CompareAvaSeq;
        }
        GrammarState::CompareAttr => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let attribute = attr_description(&d.config, state, tag, value)?;
            compare_mut(&mut d.build, state)?.attribute = attribute;
            d.state = GrammarState::CompareValue;
        }
        GrammarState::CompareValue => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            compare_mut(&mut d.build, state)?.assertion_value = value.to_vec();
            d.state = GrammarState::End;
        }

        GrammarState::ExtReqName => {
            if tag != TAG_EXT_REQ_NAME {
                return Err(unexpected(state, tag));
            }
            let name = utf8(&d.config, value)?;
            match d.build.op.as_mut() {
                Some(ProtocolOp::ExtendedRequest(req)) => req.name = name,
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::ExtReqTail;
        }
        GrammarState::ExtReqTail => {
            if tag != TAG_EXT_REQ_VALUE {
                return Err(unexpected(state, tag));
            }
            match d.build.op.as_mut() {
                Some(ProtocolOp::ExtendedRequest(req)) => req.value = Some(value.to_vec()),
                _ => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::End;
        }
        GrammarState::IntermediateTail => {
            let Some(ProtocolOp::IntermediateResponse(resp)) = d.build.op.as_mut() else {
                return Err(grammar_err(state, tag));
            };
            match tag {
                TAG_INTERMEDIATE_NAME => {
                    // responseName precedes responseValue and appears once
                    if resp.name.is_some() || resp.value.is_some() {
                        return Err(grammar_err(state, tag));
                    }
                    let name = if d.config.strict_string_validation {
                        String::from_utf8(value.to_vec())
                            .map_err(|_| DecoderError::InvalidUtf8)?
                    } else {
                        String::from_utf8_lossy(value).into_owned()
                    };
                    resp.name = Some(name);
                }
                TAG_INTERMEDIATE_VALUE => {
                    if resp.value.is_some() {
                        return Err(grammar_err(state, tag));
                    }
                    resp.value = Some(value.to_vec());
                }
                _ => return Err(unexpected(state, tag)),
            }
        }
        GrammarState::ReferenceUri => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let uri = utf8(&d.config, value)?;
            match d.build.op.as_mut() {
                Some(ProtocolOp::SearchResultReference(uris)) => uris.push(uri),
                _ => return Err(grammar_err(state, tag)),
            }
        }

        GrammarState::ControlOid => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            let oid = utf8(&d.config, value)?;
            match &mut d.build.control {
                Some(control) => control.oid = oid,
                None => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::ControlCritical;
        }
        GrammarState::ControlCritical => match tag {
            ber::TAG_BOOLEAN => {
                let critical = ber::decode_boolean(value)?;
                match &mut d.build.control {
                    Some(control) => control.critical = critical,
                    None => return Err(grammar_err(state, tag)),
                }
                d.state = GrammarState::ControlValue;
            }
            ber::TAG_OCTET_STRING => {
                match &mut d.build.control {
                    Some(control) => control.value = Some(value.to_vec()),
                    None => return Err(grammar_err(state, tag)),
                }
                d.state = GrammarState::End;
            }
            _ => return Err(unexpected(state, tag)),
        },
        GrammarState::ControlValue => {
            if tag != ber::TAG_OCTET_STRING {
                return Err(unexpected(state, tag));
            }
            match &mut d.build.control {
                Some(control) => control.value = Some(value.to_vec()),
                None => return Err(grammar_err(state, tag)),
            }
            d.state = GrammarState::End;
        }

        GrammarState::Start
        | GrammarState::AfterOp
        | GrammarState::End
        | GrammarState::SearchAttrList
        | GrammarState::AttrListStart
        | GrammarState::AttrSeqStart
        | GrammarState::AttrValSet
        | GrammarState::ModifyChangeList
        | GrammarState::ModifyChangeSeq
        | GrammarState::CompareAvaSeq
        | GrammarState::SubstringsSeq
        | GrammarState::ControlSeqStart => return Err(unexpected(state, tag)),
    }
    Ok(())
}

fn decode_limit(state: GrammarState, tag: u8, value: &[u8]) -> Result<u32, DecoderError> {
    if tag != ber::TAG_INTEGER {
        return Err(unexpected(state, tag));
    }
    let limit = ber::decode_integer(value)?;
    if limit < 0 {
        return Err(grammar_err(state, tag));
    }
    Ok(limit as u32)
}

fn mod_dn_mut(
    build: &mut Build,
    state: GrammarState,
) -> Result<&mut ModifyDnRequest, DecoderError> {
    match build.op.as_mut() {
        Some(ProtocolOp::ModifyDnRequest(req)) => Ok(req),
        _ => Err(grammar_err(state, message::TAG_MODIFY_DN_REQUEST)),
    }
}

fn compare_mut(
    build: &mut Build,
    state: GrammarState,
) -> Result<&mut CompareRequest, DecoderError> {
    match build.op.as_mut() {
        Some(ProtocolOp::CompareRequest(req)) => Ok(req),
        _ => Err(grammar_err(state, message::TAG_COMPARE_REQUEST)),
    }
}

/// A constructed value reached its declared end. Validates that the state
/// is a legal stopping point for the frame and transitions out of it.
pub(crate) fn on_frame_end(d: &mut Decoder, kind: FrameKind) -> Result<(), DecoderError> {
    let state = d.state;
    match kind {
        FrameKind::Message => {
            if !matches!(state, GrammarState::AfterOp | GrammarState::End) {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            d.deliver()?;
        }
        FrameKind::Op => {
            let terminal = matches!(
                state,
                GrammarState::End
                    | GrammarState::ResultTail
                    | GrammarState::ResultTailNoReferral
                    | GrammarState::ExtRespValue
                    | GrammarState::ModDnTail
                    | GrammarState::ExtReqTail
                    | GrammarState::IntermediateTail
                    | GrammarState::ReferenceUri
            );
            if !terminal {
                return Err(grammar_err(state, 0x00));
            }
            d.state = GrammarState::AfterOp;
        }
        FrameKind::Sasl => {
            if !matches!(state, GrammarState::SaslCredentials | GrammarState::End) {
                return Err(grammar_err(state, TAG_AUTH_SASL));
            }
            d.state = GrammarState::End;
        }
        FrameKind::Referral => {
            if state != GrammarState::ReferralUri {
                return Err(grammar_err(state, TAG_REFERRAL));
            }
            d.state = GrammarState::ResultTailNoReferral;
        }
        FrameKind::AttrSelList => {
            if state != GrammarState::SearchAttr {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            d.state = GrammarState::End;
        }
        FrameKind::Filter => complete_filter_node(d)?,
        FrameKind::SubstringSeq => {
            if state != GrammarState::SubstringsItem {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            d.state = GrammarState::End;
        }
        FrameKind::AttrList => {
            if state != GrammarState::AttrSeqStart {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            d.state = GrammarState::End;
        }
        FrameKind::AttrSeq => {
            if state != GrammarState::End {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            let Some(attr) = d.build.attr.take() else {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            };
            match d.build.op.as_mut() {
                Some(ProtocolOp::SearchResultEntry(entry)) => {
                    entry.attributes.push(attr);
                    d.state = GrammarState::AttrSeqStart;
                }
                Some(ProtocolOp::AddRequest(req)) => {
                    req.attributes.push(attr);
                    d.state = GrammarState::AttrSeqStart;
                }
                Some(ProtocolOp::ModifyRequest(_)) => {
                    // held until the enclosing change closes
                    d.build.attr = Some(attr);
                    d.state = GrammarState::End;
                }
                _ => return Err(grammar_err(state, ber::TAG_SEQUENCE)),
            }
        }
        FrameKind::AttrValSet => {
            if state != GrammarState::AttrValue {
                return Err(grammar_err(state, ber::TAG_SET));
            }
            d.state = GrammarState::End;
        }
        FrameKind::ChangeSeq => {
            if state != GrammarState::End {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            let (Some(operation), Some(modification)) =
                (d.build.change_op.take(), d.build.attr.take())
            else {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            };
            match d.build.op.as_mut() {
                Some(ProtocolOp::ModifyRequest(req)) => req.changes.push(ModifyChange {
                    operation,
                    modification,
                }),
                _ => return Err(grammar_err(state, ber::TAG_SEQUENCE)),
            }
            d.state = GrammarState::ModifyChangeSeq;
        }
        FrameKind::ChangeList => {
            if state != GrammarState::ModifyChangeSeq {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            d.state = GrammarState::End;
        }
        FrameKind::CompareAva => {
            if state != GrammarState::End {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
        }
        FrameKind::Controls => {
            if state != GrammarState::ControlSeqStart {
                return Err(grammar_err(state, message::TAG_CONTROLS));
            }
            d.state = GrammarState::End;
        }
        FrameKind::ControlSeq => {
            let done = matches!(
                state,
                GrammarState::ControlCritical | GrammarState::ControlValue | GrammarState::End
            );
            if !done {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            }
            let Some(control) = d.build.control.take() else {
                return Err(grammar_err(state, ber::TAG_SEQUENCE));
            };
            let oid = control.oid.clone();
            if !d.build.controls.insert(control) {
                return Err(DecoderError::DuplicateControlOid { oid });
            }
            d.state = GrammarState::ControlSeqStart;
        }
    }
    Ok(())
}

/// A constructed filter node closed: turn the pending node into a `Filter`
/// and hand it to its parent (or to the SearchRequest when it is the root).
fn complete_filter_node(d: &mut Decoder) -> Result<(), DecoderError> {
    let state = d.state;
    let Some(node) = d.build.filter_stack.pop() else {
        return Err(grammar_err(state, 0x00));
    };
    let completed = match node {
        FilterNode::And(children) => {
            if state != GrammarState::FilterStart {
                return Err(grammar_err(state, filter::TAG_FILTER_AND));
            }
            Filter::And(children)
        }
        FilterNode::Or(children) => {
            if state != GrammarState::FilterStart {
                return Err(grammar_err(state, filter::TAG_FILTER_OR));
            }
            Filter::Or(children)
        }
        FilterNode::Not(mut children) => {
            if state != GrammarState::FilterStart {
                return Err(grammar_err(state, filter::TAG_FILTER_NOT));
            }
            match (children.pop(), children.is_empty()) {
                (Some(child), true) => Filter::Not(Box::new(child)),
                _ => return Err(grammar_err(state, filter::TAG_FILTER_NOT)),
            }
        }
        FilterNode::Ava {
            tag,
            attribute,
            value,
        } => {
            if state != GrammarState::End {
                return Err(grammar_err(state, tag));
            }
            let (Some(attribute), Some(value)) = (attribute, value) else {
                return Err(grammar_err(state, tag));
            };
            match tag {
                filter::TAG_FILTER_EQUALITY => Filter::EqualityMatch { attribute, value },
                filter::TAG_FILTER_GREATER_OR_EQUAL => {
                    Filter::GreaterOrEqual { attribute, value }
                }
                filter::TAG_FILTER_LESS_OR_EQUAL => Filter::LessOrEqual { attribute, value },
                filter::TAG_FILTER_APPROX => Filter::ApproxMatch { attribute, value },
                other => return Err(grammar_err(state, other)),
            }
        }
        FilterNode::Substrings {
            attribute,
            initial,
            any,
            last,
            ..
        } => {
            if state != GrammarState::End {
                return Err(grammar_err(state, filter::TAG_FILTER_SUBSTRINGS));
            }
            let Some(attribute) = attribute else {
                return Err(grammar_err(state, filter::TAG_FILTER_SUBSTRINGS));
            };
            Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            }
        }
        FilterNode::Extensible {
            matching_rule,
            match_type,
            match_value,
            dn_attributes,
        } => {
            if state != GrammarState::ExtensibleItem {
                return Err(grammar_err(state, filter::TAG_FILTER_EXTENSIBLE));
            }
            let Some(match_value) = match_value else {
                return Err(grammar_err(state, filter::TAG_FILTER_EXTENSIBLE));
            };
            Filter::ExtensibleMatch {
                matching_rule,
                match_type,
                match_value,
                dn_attributes,
            }
        }
    };
    attach_filter(d, completed)
}

/// Hand a completed filter to the enclosing branch node, or install it as
/// the SearchRequest filter when the tree is complete.
fn attach_filter(d: &mut Decoder, completed: Filter) -> Result<(), DecoderError> {
    let state = d.state;
    match d.build.filter_stack.last_mut() {
        Some(FilterNode::And(children))
        | Some(FilterNode::Or(children))
        | Some(FilterNode::Not(children)) => {
            children.push(completed);
            d.state = GrammarState::FilterStart;
        }
        Some(_) => return Err(grammar_err(state, 0x00)),
        None => {
            search_request_mut(&mut d.build, state)?.filter = completed;
            d.state = GrammarState::SearchAttrList;
        }
    }
    Ok(())
}

// The grammar is exercised end to end through `Decoder`; see the decode
// module tests and tests/ for coverage.
