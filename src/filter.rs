// Search filter tree (RFC 4511 §4.5.1). The CHOICE is encoded with the
// IMPLICIT context tags [0]..[9]; `present` is the only primitive one.

pub const TAG_FILTER_AND: u8 = 0xA0;
pub const TAG_FILTER_OR: u8 = 0xA1;
pub const TAG_FILTER_NOT: u8 = 0xA2;
pub const TAG_FILTER_EQUALITY: u8 = 0xA3;
pub const TAG_FILTER_SUBSTRINGS: u8 = 0xA4;
pub const TAG_FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
pub const TAG_FILTER_LESS_OR_EQUAL: u8 = 0xA6;
pub const TAG_FILTER_PRESENT: u8 = 0x87;
pub const TAG_FILTER_APPROX: u8 = 0xA8;
pub const TAG_FILTER_EXTENSIBLE: u8 = 0xA9;

// Substring piece tags inside the substrings SEQUENCE.
pub const TAG_SUBSTRING_INITIAL: u8 = 0x80;
pub const TAG_SUBSTRING_ANY: u8 = 0x81;
pub const TAG_SUBSTRING_FINAL: u8 = 0x82;

// MatchingRuleAssertion member tags.
pub const TAG_MATCHING_RULE: u8 = 0x81;
pub const TAG_MATCHING_TYPE: u8 = 0x82;
pub const TAG_MATCHING_VALUE: u8 = 0x83;
pub const TAG_MATCHING_DN_ATTRS: u8 = 0x84;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// An empty AND is the absolute-true filter of RFC 4526.
    And(Vec<Filter>),
    /// An empty OR is the absolute-false filter of RFC 4526.
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch {
        attribute: String,
        value: Vec<u8>,
    },
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    Present(String),
    ApproxMatch {
        attribute: String,
        value: Vec<u8>,
    },
    ExtensibleMatch {
        matching_rule: Option<String>,
        match_type: Option<String>,
        match_value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// BER context tag of this node.
    pub fn tag(&self) -> u8 {
        match self {
            Filter::And(_) => TAG_FILTER_AND,
            Filter::Or(_) => TAG_FILTER_OR,
            Filter::Not(_) => TAG_FILTER_NOT,
            Filter::EqualityMatch { .. } => TAG_FILTER_EQUALITY,
            Filter::Substrings { .. } => TAG_FILTER_SUBSTRINGS,
            Filter::GreaterOrEqual { .. } => TAG_FILTER_GREATER_OR_EQUAL,
            Filter::LessOrEqual { .. } => TAG_FILTER_LESS_OR_EQUAL,
            Filter::Present(_) => TAG_FILTER_PRESENT,
            Filter::ApproxMatch { .. } => TAG_FILTER_APPROX,
            Filter::ExtensibleMatch { .. } => TAG_FILTER_EXTENSIBLE,
        }
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::EqualityMatch {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    /// RFC 4515 string form, e.g. `(&(objectClass=person)(cn=ad*min))`.
    pub fn to_ldap_string(&self) -> String {
        match self {
            Filter::And(fs) => format!(
                "(&{})",
                fs.iter().map(Filter::to_ldap_string).collect::<String>()
            ),
            Filter::Or(fs) => format!(
                "(|{})",
                fs.iter().map(Filter::to_ldap_string).collect::<String>()
            ),
            Filter::Not(f) => format!("(!{})", f.to_ldap_string()),
            Filter::EqualityMatch { attribute, value } => {
                format!("({}={})", attribute, escape_value(value))
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            } => {
                let mut s = format!("({}=", attribute);
                if let Some(initial) = initial {
                    s.push_str(&escape_value(initial));
                }
                for piece in any {
                    s.push('*');
                    s.push_str(&escape_value(piece));
                }
                s.push('*');
                if let Some(last) = last {
                    s.push_str(&escape_value(last));
                }
                s.push(')');
                s
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, escape_value(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, escape_value(value))
            }
            Filter::Present(attribute) => format!("({}=*)", attribute),
            Filter::ApproxMatch { attribute, value } => {
                format!("({}~={})", attribute, escape_value(value))
            }
            Filter::ExtensibleMatch {
                matching_rule,
                match_type,
                match_value,
                dn_attributes,
            } => {
                let mut s = String::from("(");
                if let Some(t) = match_type {
                    s.push_str(t);
                }
                if *dn_attributes {
                    s.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    s.push(':');
                    s.push_str(rule);
                }
                s.push_str(":=");
                s.push_str(&escape_value(match_value));
                s.push(')');
                s
            }
        }
    }
}

/// RFC 4515 §3 escaping for assertion values inside a filter string.
fn escape_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value {
        match b {
            b'*' => out.push_str("\\2a"),
            b'(' => out.push_str("\\28"),
            b')' => out.push_str("\\29"),
            b'\\' => out.push_str("\\5c"),
            0x00 => out.push_str("\\00"),
            b if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
            b => out.push_str(&format!("\\{:02x}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_to_ldap_string() {
        assert_eq!(Filter::present("objectClass").to_ldap_string(), "(objectClass=*)");
    }

    #[test]
    fn test_equality_to_ldap_string() {
        assert_eq!(
            Filter::equality("cn", b"admin".to_vec()).to_ldap_string(),
            "(cn=admin)"
        );
    }

    #[test]
    fn test_and_or_not_to_ldap_string() {
        let f = Filter::And(vec![
            Filter::equality("objectClass", b"person".to_vec()),
            Filter::Not(Box::new(Filter::present("memberOf"))),
        ]);
        assert_eq!(f.to_ldap_string(), "(&(objectClass=person)(!(memberOf=*)))");

        // RFC 4526 absolute filters
        assert_eq!(Filter::And(vec![]).to_ldap_string(), "(&)");
        assert_eq!(Filter::Or(vec![]).to_ldap_string(), "(|)");
    }

    #[test]
    fn test_substrings_to_ldap_string() {
        let f = Filter::Substrings {
            attribute: "cn".into(),
            initial: Some(b"ad".to_vec()),
            any: vec![b"mi".to_vec()],
            last: Some(b"n".to_vec()),
        };
        assert_eq!(f.to_ldap_string(), "(cn=ad*mi*n)");

        let f = Filter::Substrings {
            attribute: "cn".into(),
            initial: None,
            any: vec![],
            last: Some(b"smith".to_vec()),
        };
        assert_eq!(f.to_ldap_string(), "(cn=*smith)");
    }

    #[test]
    fn test_extensible_to_ldap_string() {
        let f = Filter::ExtensibleMatch {
            matching_rule: Some("caseExactMatch".into()),
            match_type: Some("cn".into()),
            match_value: b"Fred".to_vec(),
            dn_attributes: true,
        };
        assert_eq!(f.to_ldap_string(), "(cn:dn:caseExactMatch:=Fred)");

        let f = Filter::ExtensibleMatch {
            matching_rule: None,
            match_type: Some("sn".into()),
            match_value: b"x".to_vec(),
            dn_attributes: false,
        };
        assert_eq!(f.to_ldap_string(), "(sn:=x)");
    }

    #[test]
    fn test_escaping_special_bytes() {
        let f = Filter::equality("cn", b"a*b(c)d\\e".to_vec());
        assert_eq!(f.to_ldap_string(), "(cn=a\\2ab\\28c\\29d\\5ce)");
    }

    #[test]
    fn test_filter_tags() {
        assert_eq!(Filter::And(vec![]).tag(), 0xA0);
        assert_eq!(Filter::present("a").tag(), 0x87);
        assert_eq!(
            Filter::Not(Box::new(Filter::present("a"))).tag(),
            0xA2
        );
    }
}
