//! BER tagged-value packets.
//!
//! Every LDAP message is a tree of BER values. A packet is either primitive
//! (raw content octets) or constructed (an ordered list of child packets):
//!
//! ```text
//! +------------+-----------+---------------------------------+
//! | identifier | length    | contents                        |
//! | cc p ttttt | 1-9 bytes | octets, or nested packets       |
//! +------------+-----------+---------------------------------+
//!   cc = class, p = constructed flag, ttttt = tag (31 = long form)
//! ```
//!
//! Only definite lengths are produced or accepted (RFC 4511 §5.1).

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

/// Deepest packet nesting accepted by the decoder.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Universal tag numbers used by LDAP.
pub mod tag {
    pub const BOOLEAN: u32 = 1;
    pub const INTEGER: u32 = 2;
    pub const OCTET_STRING: u32 = 4;
    pub const NULL: u32 = 5;
    pub const ENUMERATED: u32 = 10;
    pub const SEQUENCE: u32 = 16;
    pub const SET: u32 = 17;
}

/// Tag class (the two high bits of the identifier octet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Universal,
    Application,
    Context,
    Private,
}

impl Class {
    fn bits(self) -> u8 {
        match self {
            Class::Universal => 0x00,
            Class::Application => 0x40,
            Class::Context => 0x80,
            Class::Private => 0xC0,
        }
    }

    fn from_identifier(octet: u8) -> Self {
        match octet & 0xC0 {
            0x00 => Class::Universal,
            0x40 => Class::Application,
            0x80 => Class::Context,
            _ => Class::Private,
        }
    }
}

const CONSTRUCTED_BIT: u8 = 0x20;
const LONG_TAG: u8 = 0x1F;

/// A single BER value and, when constructed, its children.
#[derive(Debug, Clone)]
pub struct Packet {
    pub class: Class,
    pub constructed: bool,
    pub tag: u32,
    /// Content octets of a primitive packet. Empty when constructed.
    pub data: Bytes,
    pub children: Vec<Packet>,
    /// Label shown in dumps; decoded packets have none.
    pub description: &'static str,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
            && self.constructed == other.constructed
            && self.tag == other.tag
            && self.data == other.data
            && self.children == other.children
    }
}

impl Eq for Packet {}

/// Identifier and length octets of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub class: Class,
    pub constructed: bool,
    pub tag: u32,
    pub header_len: usize,
    pub content_len: usize,
}

impl Header {
    /// Total encoded size of the packet this header starts.
    pub fn total_len(&self) -> Option<usize> {
        self.header_len.checked_add(self.content_len)
    }
}

impl Packet {
    pub fn primitive(
        class: Class,
        tag: u32,
        data: impl Into<Bytes>,
        description: &'static str,
    ) -> Self {
        Self {
            class,
            constructed: false,
            tag,
            data: data.into(),
            children: Vec::new(),
            description,
        }
    }

    pub fn constructed(class: Class, tag: u32, description: &'static str) -> Self {
        Self {
            class,
            constructed: true,
            tag,
            data: Bytes::new(),
            children: Vec::new(),
            description,
        }
    }

    pub fn sequence(description: &'static str) -> Self {
        Self::constructed(Class::Universal, tag::SEQUENCE, description)
    }

    pub fn set(description: &'static str) -> Self {
        Self::constructed(Class::Universal, tag::SET, description)
    }

    pub fn application(tag: u32, description: &'static str) -> Self {
        Self::constructed(Class::Application, tag, description)
    }

    pub fn context(tag: u32, description: &'static str) -> Self {
        Self::constructed(Class::Context, tag, description)
    }

    pub fn context_primitive(tag: u32, data: impl Into<Bytes>, description: &'static str) -> Self {
        Self::primitive(Class::Context, tag, data, description)
    }

    /// Context-tagged INTEGER (implicit tagging).
    pub fn context_integer(tag: u32, value: i64, description: &'static str) -> Self {
        Self::primitive(Class::Context, tag, encode_integer(value), description)
    }

    /// Universal OCTET STRING holding UTF-8 text.
    pub fn string(value: &str, description: &'static str) -> Self {
        Self::octets(Bytes::copy_from_slice(value.as_bytes()), description)
    }

    /// Universal OCTET STRING holding raw octets.
    pub fn octets(value: impl Into<Bytes>, description: &'static str) -> Self {
        Self::primitive(Class::Universal, tag::OCTET_STRING, value, description)
    }

    pub fn integer(value: i64, description: &'static str) -> Self {
        Self::primitive(Class::Universal, tag::INTEGER, encode_integer(value), description)
    }

    pub fn enumerated(value: i64, description: &'static str) -> Self {
        Self::primitive(Class::Universal, tag::ENUMERATED, encode_integer(value), description)
    }

    pub fn boolean(value: bool, description: &'static str) -> Self {
        let octet: &'static [u8] = if value { &[0xFF] } else { &[0x00] };
        Self::primitive(Class::Universal, tag::BOOLEAN, octet, description)
    }

    pub fn null(description: &'static str) -> Self {
        Self::primitive(Class::Universal, tag::NULL, Bytes::new(), description)
    }

    pub fn with_child(mut self, child: Packet) -> Self {
        self.children.push(child);
        self
    }

    pub fn append_child(&mut self, child: Packet) {
        self.children.push(child);
    }

    /// Returns whether the packet carries the given class and tag.
    pub fn is(&self, class: Class, tag: u32) -> bool {
        self.class == class && self.tag == tag
    }

    pub fn child(&self, index: usize) -> Result<&Packet, ProtocolError> {
        self.children.get(index).ok_or(ProtocolError::InvalidPacket)
    }

    /// Reads the content as a two's-complement integer (INTEGER, ENUMERATED
    /// or an implicitly tagged integer).
    pub fn as_int(&self) -> Result<i64, ProtocolError> {
        if self.constructed {
            return Err(ProtocolError::InvalidPacket);
        }
        decode_integer(&self.data)
    }

    pub fn as_bool(&self) -> Result<bool, ProtocolError> {
        match (self.constructed, self.data.as_ref()) {
            (false, [octet]) => Ok(*octet != 0),
            _ => Err(ProtocolError::InvalidBoolean),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_str(&self) -> Result<&str, ProtocolError> {
        if self.constructed {
            return Err(ProtocolError::InvalidPacket);
        }
        std::str::from_utf8(&self.data).map_err(|_| ProtocolError::InvalidUtf8("string value"))
    }

    pub fn as_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Size of the encoded packet in bytes.
    pub fn encoded_len(&self) -> usize {
        let content_len = self.content_len();
        identifier_len(self.tag) + length_len(content_len) + content_len
    }

    fn content_len(&self) -> usize {
        if self.constructed {
            self.children.iter().map(Packet::encoded_len).sum()
        } else {
            self.data.len()
        }
    }

    /// Encodes the packet with definite lengths.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        write_identifier(buf, self.class, self.constructed, self.tag);
        write_length(buf, self.content_len());
        if self.constructed {
            for child in &self.children {
                child.encode_into(buf);
            }
        } else {
            buf.put_slice(&self.data);
        }
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied. Trailing bytes
    /// are left untouched.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize), ProtocolError> {
        Self::decode_bytes(&Bytes::copy_from_slice(buf))
    }

    /// Like [`Packet::decode`], sharing primitive content with `buf`.
    pub fn decode_bytes(buf: &Bytes) -> Result<(Packet, usize), ProtocolError> {
        decode_at(buf, 0)
    }

    /// Renders the tree one packet per line, for debug logging.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, indent: usize) {
        let form = if self.constructed {
            "Constructed"
        } else {
            "Primitive"
        };
        let _ = write!(
            out,
            "{:indent$}{} ({:?}, {}, {}) Len={}",
            "",
            if self.description.is_empty() {
                "-"
            } else {
                self.description
            },
            self.class,
            form,
            self.tag,
            self.content_len(),
            indent = indent
        );
        if !self.constructed {
            let _ = write!(out, " Value={}", self.render_value());
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(out, indent + 2);
        }
    }

    fn render_value(&self) -> String {
        if self.class == Class::Universal {
            match self.tag {
                tag::INTEGER | tag::ENUMERATED => {
                    if let Ok(value) = self.as_int() {
                        return value.to_string();
                    }
                }
                tag::BOOLEAN => {
                    if let Ok(value) = self.as_bool() {
                        return value.to_string();
                    }
                }
                tag::OCTET_STRING => {
                    if let Ok(value) = self.as_str() {
                        return format!("{:?}", value);
                    }
                }
                _ => {}
            }
        }
        format!("0x{}", hex::encode(&self.data))
    }
}

/// Parses the identifier and length octets at the front of `buf`.
///
/// Returns `Ok(None)` if `buf` ends before the header does.
pub fn read_header(buf: &[u8]) -> Result<Option<Header>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let class = Class::from_identifier(first);
    let constructed = first & CONSTRUCTED_BIT != 0;
    let mut pos = 1;

    let tag = if first & LONG_TAG == LONG_TAG {
        let mut tag: u32 = 0;
        loop {
            let Some(&octet) = buf.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            if tag > (u32::MAX >> 7) {
                return Err(ProtocolError::TagTooLarge);
            }
            tag = (tag << 7) | u32::from(octet & 0x7F);
            if octet & 0x80 == 0 {
                break;
            }
        }
        tag
    } else {
        u32::from(first & LONG_TAG)
    };

    let Some(&length_octet) = buf.get(pos) else {
        return Ok(None);
    };
    pos += 1;

    let content_len = match length_octet {
        0x80 => return Err(ProtocolError::IndefiniteLength),
        0xFF => return Err(ProtocolError::InvalidLength),
        short if short & 0x80 == 0 => usize::from(short),
        long => {
            let count = usize::from(long & 0x7F);
            if count > std::mem::size_of::<usize>() {
                return Err(ProtocolError::InvalidLength);
            }
            let Some(octets) = buf.get(pos..pos + count) else {
                return Ok(None);
            };
            pos += count;
            octets
                .iter()
                .fold(0usize, |len, &octet| (len << 8) | usize::from(octet))
        }
    };

    Ok(Some(Header {
        class,
        constructed,
        tag,
        header_len: pos,
        content_len,
    }))
}

fn decode_at(buf: &Bytes, depth: usize) -> Result<(Packet, usize), ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
        });
    }

    let header = read_header(buf)?.ok_or(ProtocolError::Truncated { needed: 1 })?;
    let total = header.total_len().ok_or(ProtocolError::InvalidLength)?;
    if buf.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total - buf.len(),
        });
    }

    let content = buf.slice(header.header_len..total);
    let mut packet = if header.constructed {
        Packet::constructed(header.class, header.tag, "")
    } else {
        Packet::primitive(header.class, header.tag, content.clone(), "")
    };

    if header.constructed {
        let mut offset = 0;
        while offset < content.len() {
            let (child, used) = decode_at(&content.slice(offset..), depth + 1)?;
            packet.children.push(child);
            offset += used;
        }
    }

    Ok((packet, total))
}

/// Minimal two's-complement big-endian encoding.
pub fn encode_integer(value: i64) -> Bytes {
    let octets = value.to_be_bytes();
    let mut start = 0;
    while start < octets.len() - 1 {
        let redundant = (octets[start] == 0x00 && octets[start + 1] & 0x80 == 0)
            || (octets[start] == 0xFF && octets[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    Bytes::copy_from_slice(&octets[start..])
}

pub fn decode_integer(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.is_empty() || data.len() > 8 {
        return Err(ProtocolError::InvalidInteger { len: data.len() });
    }
    let initial: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(data
        .iter()
        .fold(initial, |value, &octet| (value << 8) | i64::from(octet)))
}

fn identifier_len(tag: u32) -> usize {
    if tag < u32::from(LONG_TAG) {
        1
    } else {
        1 + base128_len(tag)
    }
}

fn base128_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn length_len(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        1 + (usize::BITS - len.leading_zeros()).div_ceil(8) as usize
    }
}

fn write_identifier(buf: &mut BytesMut, class: Class, constructed: bool, tag: u32) {
    let form = if constructed { CONSTRUCTED_BIT } else { 0 };
    if tag < u32::from(LONG_TAG) {
        buf.put_u8(class.bits() | form | tag as u8);
        return;
    }
    buf.put_u8(class.bits() | form | LONG_TAG);
    let count = base128_len(tag);
    for i in (0..count).rev() {
        let septet = ((tag >> (7 * i)) & 0x7F) as u8;
        let more = if i == 0 { 0 } else { 0x80 };
        buf.put_u8(septet | more);
    }
}

fn write_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
        return;
    }
    let count = length_len(len) - 1;
    buf.put_u8(0x80 | count as u8);
    let octets = len.to_be_bytes();
    buf.put_slice(&octets[octets.len() - count..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_integer_encoding() {
        assert_eq!(encode_integer(0).as_ref(), &[0x00]);
        assert_eq!(encode_integer(127).as_ref(), &[0x7F]);
        assert_eq!(encode_integer(128).as_ref(), &[0x00, 0x80]);
        assert_eq!(encode_integer(256).as_ref(), &[0x01, 0x00]);
        assert_eq!(encode_integer(-1).as_ref(), &[0xFF]);
        assert_eq!(encode_integer(-128).as_ref(), &[0x80]);
        assert_eq!(encode_integer(-129).as_ref(), &[0xFF, 0x7F]);
    }

    #[test]
    fn test_integer_decoding() {
        assert_eq!(decode_integer(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(decode_integer(&[0xFF]).unwrap(), -1);
        assert_eq!(decode_integer(&[0x80]).unwrap(), -128);
        assert_eq!(decode_integer(&[0x7F, 0xFF, 0xFF, 0xFF]).unwrap(), i32::MAX as i64);
        assert!(matches!(
            decode_integer(&[]),
            Err(ProtocolError::InvalidInteger { len: 0 })
        ));
        assert!(decode_integer(&[1; 9]).is_err());
    }

    #[test]
    fn test_known_encoding() {
        // SEQUENCE { INTEGER 1, [APPLICATION 2] NULL } is the unbind message.
        let packet = Packet::sequence("LDAP Request")
            .with_child(Packet::integer(1, "Message ID"))
            .with_child(Packet::primitive(Class::Application, 2, Bytes::new(), "Unbind"));
        assert_eq!(
            packet.encode().as_ref(),
            &[0x30, 0x05, 0x02, 0x01, 0x01, 0x42, 0x00]
        );
    }

    #[test]
    fn test_long_form_length() {
        let value = "x".repeat(300);
        let packet = Packet::string(&value, "Long");
        let encoded = packet.encode();
        assert_eq!(&encoded[..4], &[0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(encoded.len(), packet.encoded_len());

        let (decoded, used) = Packet::decode(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded.as_str().unwrap(), value);
    }

    #[test]
    fn test_high_tag_number() {
        let packet = Packet::context_primitive(200, Bytes::from_static(b"v"), "High");
        let encoded = packet.encode();
        assert_eq!(&encoded[..3], &[0x9F, 0x81, 0x48]);

        let (decoded, _) = Packet::decode(&encoded).unwrap();
        assert!(decoded.is(Class::Context, 200));
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_nested_decode() {
        let packet = Packet::application(4, "Entry")
            .with_child(Packet::string("cn=a", "DN"))
            .with_child(
                Packet::sequence("Attributes").with_child(
                    Packet::sequence("Attribute")
                        .with_child(Packet::string("cn", "Type"))
                        .with_child(Packet::set("Values").with_child(Packet::string("a", "Value"))),
                ),
            );
        let (decoded, _) = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.children[1].children[0].children[0].as_str().unwrap(), "cn");
    }

    #[test]
    fn test_truncated() {
        let encoded = Packet::string("hello", "S").encode();
        let result = Packet::decode(&encoded[..4]);
        assert!(matches!(result, Err(ProtocolError::Truncated { needed: 3 })));

        assert!(matches!(
            Packet::decode(&[]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_indefinite_length_rejected() {
        let result = Packet::decode(&[0x30, 0x80, 0x00, 0x00]);
        assert!(matches!(result, Err(ProtocolError::IndefiniteLength)));
    }

    #[test]
    fn test_nesting_limit() {
        let mut packet = Packet::string("leaf", "Leaf");
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            packet = Packet::sequence("Level").with_child(packet);
        }
        let result = Packet::decode(&packet.encode());
        assert!(matches!(result, Err(ProtocolError::NestingTooDeep { .. })));
    }

    #[test]
    fn test_read_header_incomplete() {
        assert_eq!(read_header(&[]).unwrap(), None);
        assert_eq!(read_header(&[0x30]).unwrap(), None);
        assert_eq!(read_header(&[0x30, 0x82, 0x01]).unwrap(), None);

        let header = read_header(&[0x30, 0x82, 0x01, 0x00]).unwrap().unwrap();
        assert_eq!(header.header_len, 4);
        assert_eq!(header.content_len, 256);
        assert_eq!(header.total_len(), Some(260));
    }

    #[test]
    fn test_boolean() {
        assert!(Packet::boolean(true, "B").as_bool().unwrap());
        assert!(!Packet::boolean(false, "B").as_bool().unwrap());
        let bad = Packet::primitive(Class::Universal, tag::BOOLEAN, Bytes::new(), "B");
        assert!(matches!(bad.as_bool(), Err(ProtocolError::InvalidBoolean)));
    }

    #[test]
    fn test_dump() {
        let packet = Packet::sequence("LDAP Request")
            .with_child(Packet::integer(7, "Message ID"))
            .with_child(Packet::string("cn=admin", "Bind DN"));
        let dump = packet.dump();
        assert!(dump.contains("LDAP Request (Universal, Constructed, 16)"));
        assert!(dump.contains("  Message ID (Universal, Primitive, 2) Len=1 Value=7"));
        assert!(dump.contains("Value=\"cn=admin\""));
    }

    #[test]
    fn test_description_ignored_by_equality() {
        let a = Packet::string("x", "First");
        let b = Packet::string("x", "Second");
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Packet::decode(&data);
            let _ = read_header(&data);
        }

        #[test]
        fn integer_roundtrip(value in any::<i64>()) {
            prop_assert_eq!(decode_integer(&encode_integer(value)).unwrap(), value);
        }
    }
}
