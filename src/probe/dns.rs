//! DNS wire codec for probe queries and replies.
//!
//! Only single-question A/IN queries are built, and only the 12-byte
//! header of a reply is parsed.

use std::sync::OnceLock;

use regex::Regex;

use super::ProbeError;

/// Size of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

/// Parsed DNS message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub answer_count: u16,
}

impl DnsHeader {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    /// Response code (lower 4 bits of the flags word).
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }
}

/// Build a recursion-desired A/IN query for `name` with transaction ID `id`.
///
/// `name` must be fully qualified, i.e. end in a `.`.
pub fn encode_query(name: &str, id: u16) -> Result<Vec<u8>, ProbeError> {
    let qname = encode_name(name)?;

    let mut packet = Vec::with_capacity(HEADER_LEN + qname.len() + 4);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    packet.extend_from_slice(&qname);
    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Parse the header of a received datagram.
///
/// Anything after the header is ignored.
pub fn decode_reply(buf: &[u8]) -> Result<DnsHeader, ProbeError> {
    if buf.len() < HEADER_LEN {
        return Err(ProbeError::Decode(format!(
            "message too short: {} bytes",
            buf.len()
        )));
    }

    let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
    Ok(DnsHeader {
        id: word(0),
        flags: word(2),
        answer_count: word(6),
    })
}

/// Encode a fully-qualified name as length-prefixed labels.
fn encode_name(name: &str) -> Result<Vec<u8>, ProbeError> {
    let Some(stripped) = name.strip_suffix('.') else {
        return Err(ProbeError::Encode(format!(
            "name {:?} is not fully qualified (missing trailing '.')",
            name
        )));
    };

    let mut wire = Vec::with_capacity(name.len() + 1);
    if !stripped.is_empty() {
        for label in stripped.split('.') {
            validate_label(name, label)?;
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
    }
    wire.push(0);

    if wire.len() > MAX_NAME_LEN {
        return Err(ProbeError::Encode(format!(
            "name {:?} exceeds {} bytes on the wire",
            name, MAX_NAME_LEN
        )));
    }

    Ok(wire)
}

fn validate_label(name: &str, label: &str) -> Result<(), ProbeError> {
    static LABEL_RE: OnceLock<Regex> = OnceLock::new();
    let re = LABEL_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

    if label.is_empty() {
        return Err(ProbeError::Encode(format!("name {:?} has an empty label", name)));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(ProbeError::Encode(format!(
            "label {:?} exceeds {} bytes",
            label, MAX_LABEL_LEN
        )));
    }
    if !re.is_match(label) {
        return Err(ProbeError::Encode(format!(
            "label {:?} contains disallowed characters",
            label
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_example_com() {
        let packet = encode_query("example.com.", 0x1234).unwrap();

        let mut expected = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        expected.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
        expected.extend_from_slice(&[3, b'c', b'o', b'm', 0]);
        expected.extend_from_slice(&[0, 1, 0, 1]);
        assert_eq!(packet, expected);
    }

    #[test]
    fn test_id_survives_decode() {
        for name in ["example.com.", "a.b.c.d.", "_dns.svc.cluster.local.", "."] {
            for id in [0u16, 1, 0x00FF, 0xFF00, 0x7FFF, u16::MAX] {
                let packet = encode_query(name, id).unwrap();
                let header = decode_reply(&packet).unwrap();
                assert_eq!(header.id, id, "name {}", name);
                assert_eq!(header.flags, FLAG_RD);
                assert!(!header.is_response());
                assert_eq!(header.answer_count, 0);
            }
        }
    }

    #[test]
    fn test_root_name() {
        let packet = encode_query(".", 7).unwrap();
        assert_eq!(packet.len(), HEADER_LEN + 1 + 4);
        assert_eq!(packet[HEADER_LEN], 0);
    }

    #[test]
    fn test_rejects_missing_trailing_dot() {
        let err = encode_query("example.com", 1).unwrap_err();
        assert!(matches!(err, ProbeError::Encode(_)));
    }

    #[test]
    fn test_rejects_bad_labels() {
        let long_label = format!("{}.com.", "a".repeat(64));
        for name in ["exa mple.com.", "a..b.", "ex@mple.com.", ".com.", long_label.as_str()] {
            assert!(
                matches!(encode_query(name, 1), Err(ProbeError::Encode(_))),
                "expected {:?} to be rejected",
                name
            );
        }
    }

    #[test]
    fn test_label_at_limit() {
        let name = format!("{}.com.", "a".repeat(63));
        assert!(encode_query(&name, 1).is_ok());
    }

    #[test]
    fn test_rejects_oversized_name() {
        let label = "a".repeat(63);
        let name = format!("{0}.{0}.{0}.{0}.", label);
        assert!(matches!(encode_query(&name, 1), Err(ProbeError::Encode(_))));
    }

    #[test]
    fn test_name_length_boundary() {
        let label = "a".repeat(63);
        // 3 * (1 + 63) + (1 + 61) + 1 root byte = 255
        let at_limit = format!("{0}.{0}.{0}.{1}.", label, "b".repeat(61));
        let packet = encode_query(&at_limit, 1).unwrap();
        assert_eq!(packet.len(), HEADER_LEN + 255 + 4);

        let over_limit = format!("{0}.{0}.{0}.{1}.", label, "b".repeat(62));
        assert!(matches!(encode_query(&over_limit, 1), Err(ProbeError::Encode(_))));
    }

    #[test]
    fn test_decode_truncated() {
        let err = decode_reply(&[0x12, 0x34, 0x81]).unwrap_err();
        assert!(matches!(err, ProbeError::Decode(_)));
        assert!(decode_reply(&[]).is_err());
    }

    #[test]
    fn test_decode_response_ignores_trailing_bytes() {
        // Response header with RCODE 3 (NXDOMAIN) and junk where records would be.
        let mut buf = vec![0xAB, 0xCD, 0x81, 0x83, 0, 1, 0, 2, 0, 0, 0, 0];
        buf.extend_from_slice(&[0xFF, 0xFF, 0x00]);

        let header = decode_reply(&buf).unwrap();
        assert_eq!(header.id, 0xABCD);
        assert!(header.is_response());
        assert_eq!(header.rcode(), 3);
        assert_eq!(header.answer_count, 2);
    }
}
