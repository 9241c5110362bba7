// LDAP message model (RFC 4511 §4.1). These are plain data objects: the
// encoder and decoder own all wire knowledge, the model owns none.

use crate::filter::Filter;

// ProtocolOp application tags.
pub const TAG_BIND_REQUEST: u8 = 0x60;
pub const TAG_BIND_RESPONSE: u8 = 0x61;
pub const TAG_UNBIND_REQUEST: u8 = 0x42;
pub const TAG_SEARCH_REQUEST: u8 = 0x63;
pub const TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const TAG_MODIFY_REQUEST: u8 = 0x66;
pub const TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const TAG_ADD_REQUEST: u8 = 0x68;
pub const TAG_ADD_RESPONSE: u8 = 0x69;
pub const TAG_DEL_REQUEST: u8 = 0x4A;
pub const TAG_DEL_RESPONSE: u8 = 0x6B;
pub const TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const TAG_ABANDON_REQUEST: u8 = 0x50;
pub const TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Controls envelope tag: [0] IMPLICIT SEQUENCE OF Control.
pub const TAG_CONTROLS: u8 = 0xA0;

/// One LDAP message: the envelope of RFC 4511 §4.1.1.
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    /// Positive for requests and their responses; 0 only for unsolicited
    /// notifications.
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Controls,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Controls::new(),
        }
    }

    pub fn with_controls(message_id: i32, protocol_op: ProtocolOp, controls: Controls) -> Self {
        Self {
            message_id,
            protocol_op,
            controls,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    /// The DN of the entry to delete; [APPLICATION 10] is a primitive TLV.
    DelRequest(String),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    /// The id of the operation to abandon. The receiver must ignore an
    /// unknown id silently.
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// BER application tag of this operation.
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::BindRequest(_) => TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => TAG_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => TAG_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => TAG_SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => TAG_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => TAG_MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => TAG_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => TAG_ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => TAG_DEL_REQUEST,
            ProtocolOp::DelResponse(_) => TAG_DEL_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => TAG_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => TAG_MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => TAG_COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => TAG_COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => TAG_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => TAG_EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => TAG_INTERMEDIATE_RESPONSE,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            ProtocolOp::BindResponse(_)
                | ProtocolOp::SearchResultEntry(_)
                | ProtocolOp::SearchResultReference(_)
                | ProtocolOp::SearchResultDone(_)
                | ProtocolOp::ModifyResponse(_)
                | ProtocolOp::AddResponse(_)
                | ProtocolOp::DelResponse(_)
                | ProtocolOp::ModifyDnResponse(_)
                | ProtocolOp::CompareResponse(_)
                | ProtocolOp::ExtendedResponse(_)
                | ProtocolOp::IntermediateResponse(_)
        )
    }

    /// The LdapResult embedded in a response, if this operation carries one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindAuthentication {
    /// simple [0] OCTET STRING; empty credentials mean an anonymous bind.
    Simple(Vec<u8>),
    /// sasl [3] SaslCredentials.
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindResponse {
    pub result: LdapResult,
    /// serverSaslCreds [7] OCTET STRING OPTIONAL.
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl SearchScope {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SearchScope::BaseObject),
            1 => Some(SearchScope::SingleLevel),
            2 => Some(SearchScope::WholeSubtree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    NeverDerefAliases = 0,
    DerefInSearching = 1,
    DerefFindingBaseObject = 2,
    DerefAlways = 3,
}

impl DerefAliases {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DerefAliases::NeverDerefAliases),
            1 => Some(DerefAliases::DerefInSearching),
            2 => Some(DerefAliases::DerefFindingBaseObject),
            3 => Some(DerefAliases::DerefAlways),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

/// PartialAttribute: a description plus an ordered set of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: Vec::new(),
        }
    }

    pub fn with_values(attr_type: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: values,
        }
    }

    /// True when the description carries the `;binary` transfer option.
    pub fn has_binary_option(&self) -> bool {
        attr_description_is_binary(&self.attr_type)
    }
}

pub(crate) fn attr_description_is_binary(description: &str) -> bool {
    description
        .split(';')
        .skip(1)
        .any(|opt| opt.eq_ignore_ascii_case("binary"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    /// RFC 4525.
    Increment = 3,
}

impl ModifyOperation {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ModifyOperation::Add),
            1 => Some(ModifyOperation::Delete),
            2 => Some(ModifyOperation::Replace),
            3 => Some(ModifyOperation::Increment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    /// newSuperior [0] LDAPDN OPTIONAL.
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareRequest {
    pub entry: String,
    pub attribute: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedRequest {
    /// requestName [0] LDAPOID.
    pub name: String,
    /// requestValue [1] OCTET STRING OPTIONAL.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    /// responseName [10] LDAPOID OPTIONAL.
    pub name: Option<String>,
    /// responseValue [11] OCTET STRING OPTIONAL.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntermediateResponse {
    /// responseName [0] LDAPOID OPTIONAL.
    pub name: Option<String>,
    /// responseValue [1] OCTET STRING OPTIONAL.
    pub value: Option<Vec<u8>>,
}

/// The result component embedded in every terminating response.
#[derive(Debug, Clone, PartialEq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    /// referral [3] SEQUENCE OF URI OPTIONAL.
    pub referral: Option<Vec<String>>,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }

    pub fn new(result_code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referral: None,
        }
    }
}

impl Default for LdapResult {
    fn default() -> Self {
        Self::success()
    }
}

/// RFC 4511 appendix A result codes, with the RFC 3909 cancel extension
/// codes. Codes outside the known set survive decode in `Undefined` so any
/// legal PDU re-encodes byte-identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other,
    Canceled,
    NoSuchOperation,
    TooLate,
    CannotCancel,
    AssertionFailed,
    AuthorizationDenied,
    Undefined(i32),
}

impl ResultCode {
    pub fn code(&self) -> i32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::AliasDereferencingProblem => 36,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other => 80,
            ResultCode::Canceled => 118,
            ResultCode::NoSuchOperation => 119,
            ResultCode::TooLate => 120,
            ResultCode::CannotCancel => 121,
            ResultCode::AssertionFailed => 122,
            ResultCode::AuthorizationDenied => 123,
            ResultCode::Undefined(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            14 => ResultCode::SaslBindInProgress,
            16 => ResultCode::NoSuchAttribute,
            17 => ResultCode::UndefinedAttributeType,
            18 => ResultCode::InappropriateMatching,
            19 => ResultCode::ConstraintViolation,
            20 => ResultCode::AttributeOrValueExists,
            21 => ResultCode::InvalidAttributeSyntax,
            32 => ResultCode::NoSuchObject,
            33 => ResultCode::AliasProblem,
            34 => ResultCode::InvalidDnSyntax,
            36 => ResultCode::AliasDereferencingProblem,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            64 => ResultCode::NamingViolation,
            65 => ResultCode::ObjectClassViolation,
            66 => ResultCode::NotAllowedOnNonLeaf,
            67 => ResultCode::NotAllowedOnRdn,
            68 => ResultCode::EntryAlreadyExists,
            69 => ResultCode::ObjectClassModsProhibited,
            71 => ResultCode::AffectsMultipleDsas,
            80 => ResultCode::Other,
            118 => ResultCode::Canceled,
            119 => ResultCode::NoSuchOperation,
            120 => ResultCode::TooLate,
            121 => ResultCode::CannotCancel,
            122 => ResultCode::AssertionFailed,
            123 => ResultCode::AuthorizationDenied,
            other => ResultCode::Undefined(other),
        }
    }
}

/// One control: OID, criticality, raw value. Structured payloads live
/// behind the registry in `controls`.
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            critical: false,
            value: None,
        }
    }

    pub fn with_value(oid: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            oid: oid.into(),
            critical: false,
            value: Some(value),
        }
    }
}

/// The controls attached to a message, keyed by OID with insertion order
/// preserved. Insertion order fixes the encoding order, so a decoded
/// message re-encodes its controls byte-identically.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Controls(Vec<Control>);

impl Controls {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, oid: &str) -> Option<&Control> {
        self.0.iter().find(|c| c.oid == oid)
    }

    /// Appends a control. Returns false (and leaves the set unchanged) when
    /// a control with the same OID is already present.
    pub fn insert(&mut self, control: Control) -> bool {
        if self.get(&control.oid).is_some() {
            return false;
        }
        self.0.push(control);
        true
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Control> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Controls {
    type Item = &'a Control;
    type IntoIter = std::slice::Iter<'a, Control>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_tags() {
        assert_eq!(ProtocolOp::UnbindRequest.tag(), 0x42);
        assert_eq!(ProtocolOp::DelRequest("dc=x".into()).tag(), 0x4A);
        assert_eq!(ProtocolOp::AbandonRequest(5).tag(), 0x50);
        assert_eq!(
            ProtocolOp::SearchResultDone(LdapResult::success()).tag(),
            0x65
        );
        assert_eq!(
            ProtocolOp::IntermediateResponse(IntermediateResponse::default()).tag(),
            0x79
        );
    }

    #[test]
    fn test_is_response() {
        assert!(ProtocolOp::ModifyResponse(LdapResult::success()).is_response());
        assert!(ProtocolOp::SearchResultReference(vec![]).is_response());
        assert!(!ProtocolOp::UnbindRequest.is_response());
        assert!(!ProtocolOp::AbandonRequest(1).is_response());
    }

    #[test]
    fn test_result_code_mapping_roundtrip() {
        for code in [0, 1, 10, 14, 16, 21, 32, 36, 48, 54, 64, 71, 80, 118, 123] {
            assert_eq!(ResultCode::from_code(code).code(), code);
        }
        // unknown codes are preserved verbatim
        assert_eq!(ResultCode::from_code(99), ResultCode::Undefined(99));
        assert_eq!(ResultCode::Undefined(99).code(), 99);
    }

    #[test]
    fn test_scope_and_deref_codes() {
        assert_eq!(SearchScope::from_code(0), Some(SearchScope::BaseObject));
        assert_eq!(SearchScope::from_code(2), Some(SearchScope::WholeSubtree));
        assert_eq!(SearchScope::from_code(3), None);
        assert_eq!(DerefAliases::from_code(3), Some(DerefAliases::DerefAlways));
        assert_eq!(DerefAliases::from_code(4), None);
    }

    #[test]
    fn test_controls_reject_duplicate_oid() {
        let mut controls = Controls::new();
        assert!(controls.insert(Control::new("1.2.3.4")));
        assert!(!controls.insert(Control::new("1.2.3.4")));
        assert_eq!(controls.len(), 1);
    }

    #[test]
    fn test_controls_preserve_insertion_order() {
        let mut controls = Controls::new();
        controls.insert(Control::new("2.16.840.1.113730.3.4.2"));
        controls.insert(Control::new("1.2.840.113556.1.4.319"));
        let oids: Vec<&str> = controls.iter().map(|c| c.oid.as_str()).collect();
        assert_eq!(oids, ["2.16.840.1.113730.3.4.2", "1.2.840.113556.1.4.319"]);
    }

    #[test]
    fn test_binary_attribute_option() {
        assert!(Attribute::new("userCertificate;binary").has_binary_option());
        assert!(Attribute::new("cn;lang-en;Binary").has_binary_option());
        assert!(!Attribute::new("cn").has_binary_option());
        assert!(!Attribute::new("binary").has_binary_option());
    }
}
