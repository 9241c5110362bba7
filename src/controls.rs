// Control payload plumbing. A control travels as (oid, criticality, opaque
// value); OIDs with a registered codec can be lifted into a structured
// payload and serialized back. Unknown OIDs round-trip untouched.
//
// The registry is process-wide and read-mostly: register everything during
// startup, then share it freely across threads. Reads take an arc-swap
// snapshot and never lock.
//
// Criticality is not enforced here: rejecting an unsupported critical
// control with unavailableCriticalExtension is the application's job, the
// codec only transports the flag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::ber::{self, BerWriter, Overflow};
use crate::error::DecoderError;
use crate::message::Control;

/// RFC 4533 content synchronization request control.
pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";

/// RFC 2696 simple paged results control.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// A decoded control value that knows how to serialize itself back.
pub trait ControlPayload: fmt::Debug + Send + Sync {
    fn oid(&self) -> &str;

    /// Exact length of the value bytes `encode` will produce.
    fn compute_length(&self) -> usize;

    /// Write the value bytes into a buffer sized by `compute_length`.
    fn encode(&self, w: &mut BerWriter) -> Result<(), Overflow>;
}

/// Parses the value bytes of one control OID.
pub trait ControlCodec: Send + Sync {
    fn decode(&self, value: &[u8]) -> Result<Box<dyn ControlPayload>, DecoderError>;
}

type Registry = HashMap<String, Arc<dyn ControlCodec>>;

static REGISTRY: Lazy<ArcSwap<Registry>> = Lazy::new(|| {
    let mut map: Registry = HashMap::new();
    map.insert(SYNC_REQUEST_OID.to_string(), Arc::new(SyncRequestCodec));
    map.insert(PAGED_RESULTS_OID.to_string(), Arc::new(PagedResultsCodec));
    ArcSwap::from_pointee(map)
});

/// Register a codec for a control OID, replacing any previous entry.
/// Intended for one-time initialization before traffic flows.
pub fn register_control(oid: &str, codec: Arc<dyn ControlCodec>) {
    let mut map = Registry::clone(&REGISTRY.load());
    map.insert(oid.to_string(), codec);
    REGISTRY.store(Arc::new(map));
    debug!("registered control codec for {}", oid);
}

pub fn lookup_control(oid: &str) -> Option<Arc<dyn ControlCodec>> {
    REGISTRY.load().get(oid).cloned()
}

/// Decode the structured payload of a control. `None` when no codec is
/// registered for its OID or the control has no value; the control itself
/// stays valid and re-encodes from its raw bytes either way.
pub fn decode_control(control: &Control) -> Option<Result<Box<dyn ControlPayload>, DecoderError>> {
    let codec = lookup_control(&control.oid)?;
    let value = control.value.as_deref()?;
    Some(codec.decode(value))
}

/// Serialize a payload into a wire-ready `Control`.
pub fn control_from_payload(
    payload: &dyn ControlPayload,
    critical: bool,
) -> Result<Control, Overflow> {
    let mut value = vec![0u8; payload.compute_length()];
    let mut w = BerWriter::new(&mut value);
    payload.encode(&mut w)?;
    if w.position() != value.len() {
        return Err(Overflow);
    }
    Ok(Control {
        oid: payload.oid().to_string(),
        critical,
        value: Some(value),
    })
}

/// Sync request control value (RFC 4533 §2.2):
/// `SEQUENCE { mode ENUMERATED, cookie OCTET STRING OPTIONAL,
/// reloadHint BOOLEAN DEFAULT FALSE }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestControl {
    /// 1 = refreshOnly, 3 = refreshAndPersist.
    pub mode: i32,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequestControl {
    pub fn is_refresh_and_persist(&self) -> bool {
        self.mode == 3
    }

    fn content_len(&self) -> usize {
        let mut content = ber::int_tlv_len(self.mode);
        if let Some(cookie) = &self.cookie {
            content += ber::tlv_len(cookie.len());
        }
        if self.reload_hint {
            content += 3;
        }
        content
    }
}

impl ControlPayload for SyncRequestControl {
    fn oid(&self) -> &str {
        SYNC_REQUEST_OID
    }

    fn compute_length(&self) -> usize {
        ber::tlv_len(self.content_len())
    }

    fn encode(&self, w: &mut BerWriter) -> Result<(), Overflow> {
        w.write_header(ber::TAG_SEQUENCE, self.content_len())?;
        w.write_enumerated(self.mode)?;
        if let Some(cookie) = &self.cookie {
            w.write_octet_string(cookie)?;
        }
        if self.reload_hint {
            w.write_boolean(true)?;
        }
        Ok(())
    }
}

struct SyncRequestCodec;

impl ControlCodec for SyncRequestCodec {
    fn decode(&self, value: &[u8]) -> Result<Box<dyn ControlPayload>, DecoderError> {
        let (tag, content, _) = ber::read_tlv(value, 0)?;
        if tag != ber::TAG_SEQUENCE {
            return Err(DecoderError::UnsupportedChoice { tag });
        }
        let (tag, mode_bytes, mut at) = ber::read_tlv(content, 0)?;
        if tag != ber::TAG_ENUMERATED {
            return Err(DecoderError::UnsupportedChoice { tag });
        }
        let mode = ber::decode_integer(mode_bytes)?;
        let mut cookie = None;
        let mut reload_hint = false;
        while at < content.len() {
            let (tag, bytes, next) = ber::read_tlv(content, at)?;
            match tag {
                ber::TAG_OCTET_STRING => cookie = Some(bytes.to_vec()),
                ber::TAG_BOOLEAN => reload_hint = ber::decode_boolean(bytes)?,
                other => return Err(DecoderError::UnsupportedChoice { tag: other }),
            }
            at = next;
        }
        Ok(Box::new(SyncRequestControl {
            mode,
            cookie,
            reload_hint,
        }))
    }
}

/// Paged results control value (RFC 2696):
/// `SEQUENCE { size INTEGER, cookie OCTET STRING }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResultsControl {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl PagedResultsControl {
    fn content_len(&self) -> usize {
        ber::int_tlv_len(self.size) + ber::tlv_len(self.cookie.len())
    }
}

impl ControlPayload for PagedResultsControl {
    fn oid(&self) -> &str {
        PAGED_RESULTS_OID
    }

    fn compute_length(&self) -> usize {
        ber::tlv_len(self.content_len())
    }

    fn encode(&self, w: &mut BerWriter) -> Result<(), Overflow> {
        w.write_header(ber::TAG_SEQUENCE, self.content_len())?;
        w.write_integer(self.size)?;
        w.write_octet_string(&self.cookie)?;
        Ok(())
    }
}

struct PagedResultsCodec;

impl ControlCodec for PagedResultsCodec {
    fn decode(&self, value: &[u8]) -> Result<Box<dyn ControlPayload>, DecoderError> {
        let (tag, content, _) = ber::read_tlv(value, 0)?;
        if tag != ber::TAG_SEQUENCE {
            return Err(DecoderError::UnsupportedChoice { tag });
        }
        let (tag, size_bytes, at) = ber::read_tlv(content, 0)?;
        if tag != ber::TAG_INTEGER {
            return Err(DecoderError::UnsupportedChoice { tag });
        }
        let size = ber::decode_integer(size_bytes)?;
        let (tag, cookie, _) = ber::read_tlv(content, at)?;
        if tag != ber::TAG_OCTET_STRING {
            return Err(DecoderError::UnsupportedChoice { tag });
        }
        Ok(Box::new(PagedResultsControl {
            size,
            cookie: cookie.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_roundtrip() {
        let payload = SyncRequestControl {
            mode: 3,
            cookie: Some(b"rid=000".to_vec()),
            reload_hint: true,
        };
        let control = control_from_payload(&payload, false).unwrap();
        assert_eq!(control.oid, SYNC_REQUEST_OID);

        let decoded = decode_control(&control).unwrap().unwrap();
        let value = decoded.compute_length();
        assert_eq!(value, control.value.as_ref().unwrap().len());
        assert!(format!("{decoded:?}").contains("reload_hint: true"));
    }

    #[test]
    fn test_sync_request_minimal_value() {
        // SEQUENCE { ENUMERATED 1 } : refreshOnly, no cookie, no hint
        let control = Control::with_value(SYNC_REQUEST_OID, vec![0x30, 0x03, 0x0A, 0x01, 0x01]);
        let decoded = decode_control(&control).unwrap().unwrap();
        assert_eq!(decoded.compute_length(), 5);
    }

    #[test]
    fn test_paged_results_roundtrip() {
        let payload = PagedResultsControl {
            size: 500,
            cookie: Vec::new(),
        };
        let control = control_from_payload(&payload, true).unwrap();
        assert!(control.critical);
        assert_eq!(
            control.value.as_deref(),
            Some(&[0x30, 0x06, 0x02, 0x02, 0x01, 0xF4, 0x04, 0x00][..])
        );

        let decoded = decode_control(&control).unwrap().unwrap();
        assert_eq!(decoded.oid(), PAGED_RESULTS_OID);
    }

    #[test]
    fn test_unknown_oid_has_no_payload() {
        let control = Control::with_value("1.2.3.4.5", vec![0x30, 0x00]);
        assert!(decode_control(&control).is_none());
    }

    #[test]
    fn test_register_custom_codec() {
        struct EchoCodec;
        #[derive(Debug)]
        struct EchoPayload(Vec<u8>);
        impl ControlPayload for EchoPayload {
            fn oid(&self) -> &str {
                "1.2.3.4.5.6"
            }
            fn compute_length(&self) -> usize {
                self.0.len()
            }
            fn encode(&self, w: &mut BerWriter) -> Result<(), Overflow> {
                w.write_tagged_bytes(ber::TAG_OCTET_STRING, &self.0[2..])
            }
        }
        impl ControlCodec for EchoCodec {
            fn decode(&self, value: &[u8]) -> Result<Box<dyn ControlPayload>, DecoderError> {
                Ok(Box::new(EchoPayload(value.to_vec())))
            }
        }

        register_control("1.2.3.4.5.6", Arc::new(EchoCodec));
        let control = Control::with_value("1.2.3.4.5.6", vec![0x04, 0x01, 0xAA]);
        let decoded = decode_control(&control).unwrap().unwrap();
        assert_eq!(decoded.compute_length(), 3);
    }

    #[test]
    fn test_malformed_sync_value_is_an_error() {
        let control = Control::with_value(SYNC_REQUEST_OID, vec![0x04, 0x00]);
        assert!(decode_control(&control).unwrap().is_err());
    }
}
