//! Directory entries and attributes.

use crate::ber::{tag, Class, Packet};
use crate::error::ProtocolError;
use crate::message::application;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An attribute as sent in add and modify requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Encodes `SEQUENCE { type, SET OF value }`.
    pub fn encode(&self) -> Packet {
        let mut values = Packet::set("AttributeValue");
        for value in &self.values {
            values.append_child(Packet::string(value, "Vals"));
        }
        Packet::sequence("Attribute")
            .with_child(Packet::string(&self.name, "Type"))
            .with_child(values)
    }

    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        let (name, values) = decode_attribute(packet)?;
        Ok(Self {
            name,
            values: values.iter().map(|v| v.as_string_lossy()).collect(),
        })
    }
}

fn decode_attribute(packet: &Packet) -> Result<(String, &[Packet]), ProtocolError> {
    let [name, values] = packet.children.as_slice() else {
        return Err(ProtocolError::InvalidPacket);
    };
    if !values.is(Class::Universal, tag::SET) || !values.constructed {
        return Err(ProtocolError::InvalidPacket);
    }
    let name = name
        .as_str()
        .map_err(|_| ProtocolError::InvalidUtf8("attribute description"))?
        .to_string();
    Ok((name, &values.children))
}

/// An attribute of a returned entry.
///
/// `values` holds each value as text (invalid UTF-8 replaced);
/// `byte_values` keeps the exact octets for binary attributes.
/// Only the text form is serialized; deserializing rebuilds the octets from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SerializedAttribute")]
pub struct EntryAttribute {
    pub name: String,
    pub values: Vec<String>,
    #[serde(skip)]
    pub byte_values: Vec<Bytes>,
}

impl EntryAttribute {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        let byte_values = values
            .iter()
            .map(|v| Bytes::copy_from_slice(v.as_bytes()))
            .collect();
        Self {
            name: name.into(),
            values,
            byte_values,
        }
    }

    fn pretty(&self, indent: usize) -> String {
        format!("{:indent$}{}: [{}]", "", self.name, self.values.join(" "), indent = indent)
    }
}

#[derive(Deserialize)]
struct SerializedAttribute {
    name: String,
    #[serde(default)]
    values: Vec<String>,
}

impl From<SerializedAttribute> for EntryAttribute {
    fn from(attr: SerializedAttribute) -> Self {
        Self::new(attr.name, attr.values)
    }
}

impl fmt::Display for EntryAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty(0))
    }
}

/// A search result entry. Attribute order and duplicates are kept as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<EntryAttribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>, attributes: Vec<EntryAttribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// Values of the first attribute named `name`, or an empty slice.
    pub fn attribute_values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.values.as_slice())
            .unwrap_or(&[])
    }

    /// First value of `name`, or `""`.
    pub fn attribute_value(&self, name: &str) -> &str {
        self.attribute_values(name)
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn attribute_byte_values(&self, name: &str) -> &[Bytes] {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.byte_values.as_slice())
            .unwrap_or(&[])
    }

    /// Encodes `[APPLICATION 4] SearchResultEntry`.
    pub fn encode(&self) -> Packet {
        let mut attributes = Packet::sequence("Attributes");
        for attr in &self.attributes {
            let mut values = Packet::set("AttributeValue");
            for value in &attr.byte_values {
                values.append_child(Packet::octets(value.clone(), "Vals"));
            }
            attributes.append_child(
                Packet::sequence("Attribute")
                    .with_child(Packet::string(&attr.name, "Type"))
                    .with_child(values),
            );
        }
        Packet::application(application::SEARCH_RESULT_ENTRY, "Search Result Entry")
            .with_child(Packet::string(&self.dn, "Object Name"))
            .with_child(attributes)
    }

    /// Decodes `[APPLICATION 4] SearchResultEntry`.
    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        if !packet.is(Class::Application, application::SEARCH_RESULT_ENTRY) {
            return Err(ProtocolError::UnexpectedOperation(packet.tag));
        }
        let [dn, attributes] = packet.children.as_slice() else {
            return Err(ProtocolError::InvalidPacket);
        };
        let dn = dn
            .as_str()
            .map_err(|_| ProtocolError::InvalidUtf8("entry DN"))?
            .to_string();

        let attributes = attributes
            .children
            .iter()
            .map(|attr| {
                let (name, values) = decode_attribute(attr)?;
                Ok(EntryAttribute {
                    name,
                    values: values.iter().map(Packet::as_string_lossy).collect(),
                    byte_values: values.iter().map(|v| v.data.clone()).collect(),
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        Ok(Self { dn, attributes })
    }

    /// Renders the entry with every line shifted by `indent` spaces.
    pub fn pretty(&self, indent: usize) -> String {
        let mut out = format!("{:indent$}DN: {}\n", "", self.dn, indent = indent);
        for attr in &self.attributes {
            out.push_str(&attr.pretty(indent + 2));
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DN: {}", self.dn)?;
        for attr in &self.attributes {
            writeln!(f, "{}", attr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry::new(
            "uid=bob,ou=people,dc=example,dc=com",
            vec![
                EntryAttribute::new("cn", vec!["Bob".into(), "Robert".into()]),
                EntryAttribute::new("mail", vec!["bob@example.com".into()]),
                EntryAttribute::new("cn", vec!["Bobby".into()]),
            ],
        )
    }

    #[test]
    fn test_decode_preserves_order_and_duplicates() {
        let entry = sample();
        let (packet, _) = Packet::decode(&entry.encode().encode()).unwrap();
        let decoded = Entry::decode(&packet).unwrap();

        assert_eq!(decoded, entry);
        let names: Vec<&str> = decoded.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["cn", "mail", "cn"]);
        assert_eq!(decoded.attributes[0].values, vec!["Bob", "Robert"]);
    }

    #[test]
    fn test_accessors() {
        let entry = sample();
        assert_eq!(entry.attribute_values("cn"), ["Bob", "Robert"]);
        assert_eq!(entry.attribute_value("mail"), "bob@example.com");
        assert_eq!(entry.attribute_value("missing"), "");
        assert!(entry.attribute_values("missing").is_empty());
        assert_eq!(entry.attribute_byte_values("mail")[0].as_ref(), b"bob@example.com");
    }

    #[test]
    fn test_binary_values() {
        let packet = Packet::application(application::SEARCH_RESULT_ENTRY, "Entry")
            .with_child(Packet::string("cn=photo", "DN"))
            .with_child(
                Packet::sequence("Attributes").with_child(
                    Packet::sequence("Attribute")
                        .with_child(Packet::string("jpegPhoto", "Type"))
                        .with_child(Packet::set("Values").with_child(Packet::octets(
                            Bytes::from_static(&[0xFF, 0xD8, 0xFF]),
                            "Vals",
                        ))),
                ),
            );
        let entry = Entry::decode(&packet).unwrap();
        assert_eq!(
            entry.attribute_byte_values("jpegPhoto")[0].as_ref(),
            &[0xFF, 0xD8, 0xFF]
        );
        assert_eq!(entry.attribute_value("jpegPhoto"), "\u{FFFD}\u{FFFD}\u{FFFD}");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let wrong_tag = Packet::application(5, "Done");
        assert!(matches!(
            Entry::decode(&wrong_tag),
            Err(ProtocolError::UnexpectedOperation(5))
        ));

        let missing = Packet::application(application::SEARCH_RESULT_ENTRY, "Entry")
            .with_child(Packet::string("cn=a", "DN"));
        assert!(matches!(
            Entry::decode(&missing),
            Err(ProtocolError::InvalidPacket)
        ));

        let bad_values = Packet::application(application::SEARCH_RESULT_ENTRY, "Entry")
            .with_child(Packet::string("cn=a", "DN"))
            .with_child(
                Packet::sequence("Attributes").with_child(
                    Packet::sequence("Attribute")
                        .with_child(Packet::string("cn", "Type"))
                        .with_child(Packet::string("not a set", "Values")),
                ),
            );
        assert!(Entry::decode(&bad_values).is_err());
    }

    #[test]
    fn test_display() {
        let entry = sample();
        assert_eq!(
            entry.to_string(),
            "DN: uid=bob,ou=people,dc=example,dc=com\ncn: [Bob Robert]\nmail: [bob@example.com]\ncn: [Bobby]\n"
        );
        assert!(entry.pretty(2).starts_with("  DN: uid=bob"));
        assert!(entry.pretty(2).contains("\n    mail: [bob@example.com]\n"));
    }

    #[test]
    fn test_attribute_roundtrip() {
        let attr = Attribute::new("objectClass", vec!["top".into(), "person".into()]);
        let decoded = Attribute::decode(&attr.encode()).unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["dn"], "uid=bob,ou=people,dc=example,dc=com");
        assert_eq!(json["attributes"][0]["values"][1], "Robert");
        assert!(json["attributes"][0].get("byte_values").is_none());
    }

    #[test]
    fn test_deserialized_entry_encodes_values() {
        let entry = Entry::new("cn=a", vec![EntryAttribute::new("cn", vec!["a".into(), "b".into()])]);
        let json = serde_json::to_string(&entry).unwrap();
        let restored: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, entry);
        assert_eq!(restored.attribute_byte_values("cn").len(), 2);

        let (packet, _) = Packet::decode(&restored.encode().encode()).unwrap();
        let decoded = Entry::decode(&packet).unwrap();
        assert_eq!(decoded.attribute_values("cn"), ["a", "b"]);
    }
}
