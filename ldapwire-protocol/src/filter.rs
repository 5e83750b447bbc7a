//! Search filter compiler.
//!
//! Converts between the RFC 4515 text form and the RFC 4511 `Filter` CHOICE:
//!
//! - `(&(a=1)(b=2))` - AND, one or more operands
//! - `(|(a=1)(b=2))` - OR, one or more operands
//! - `(!(a=1))` - NOT
//! - `(cn=bob)` - equality
//! - `(cn=a*b*c)` - substrings (`initial`, `any`..., `final`)
//! - `(cn=*)` - presence
//! - `(age>=21)`, `(age<=65)` - ordering
//! - `(cn~=bob)` - approximate match
//! - `(cn:dn:caseExactMatch:=Bob)` - extensible match
//!
//! Assertion values may contain `\xx` hex escapes; they are decoded to raw
//! octets before they go on the wire.

use crate::ber::{Class, Packet};
use crate::error::ProtocolError;
use bytes::Bytes;
use std::fmt;

/// Nesting depth accepted when no other limit is configured.
pub const DEFAULT_MAX_FILTER_DEPTH: usize = 100;

/// Context tags of the filter CHOICE.
pub mod filter_tag {
    pub const AND: u32 = 0;
    pub const OR: u32 = 1;
    pub const NOT: u32 = 2;
    pub const EQUALITY_MATCH: u32 = 3;
    pub const SUBSTRINGS: u32 = 4;
    pub const GREATER_OR_EQUAL: u32 = 5;
    pub const LESS_OR_EQUAL: u32 = 6;
    pub const PRESENT: u32 = 7;
    pub const APPROX_MATCH: u32 = 8;
    pub const EXTENSIBLE_MATCH: u32 = 9;

    pub const SUBSTRING_INITIAL: u32 = 0;
    pub const SUBSTRING_ANY: u32 = 1;
    pub const SUBSTRING_FINAL: u32 = 2;

    pub const MATCHING_RULE: u32 = 1;
    pub const MATCHING_TYPE: u32 = 2;
    pub const MATCH_VALUE: u32 = 3;
    pub const DN_ATTRIBUTES: u32 = 4;
}

/// A parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: Vec<u8>,
    },
    Substring {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    Present(String),
    ApproxMatch {
        attr: String,
        value: Vec<u8>,
    },
    ExtensibleMatch {
        rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

fn compile_error(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::FilterCompile(reason.into())
}

fn decompile_error(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::FilterDecompile(reason.into())
}

impl Filter {
    /// Parses filter text with the default nesting limit.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Self::parse_with_depth(text, DEFAULT_MAX_FILTER_DEPTH)
    }

    /// Parses filter text, failing once nesting exceeds `max_depth` levels.
    pub fn parse_with_depth(text: &str, max_depth: usize) -> Result<Self, ProtocolError> {
        if text.is_empty() {
            return Err(compile_error("empty filter"));
        }
        if !text.starts_with('(') {
            return Err(compile_error("filter does not start with '('"));
        }

        let mut parser = Parser::new(text, max_depth);
        let filter = parser.parse_filter(1)?;
        if parser.pos != text.len() {
            return Err(compile_error(format!(
                "unexpected trailing input at position {}",
                parser.pos
            )));
        }
        Ok(filter)
    }

    /// Builds the wire form. Fails on trees the grammar cannot express.
    pub fn to_packet(&self) -> Result<Packet, ProtocolError> {
        use filter_tag::*;

        let packet = match self {
            Filter::And(children) | Filter::Or(children) => {
                let (tag, name) = match self {
                    Filter::And(_) => (AND, "And"),
                    _ => (OR, "Or"),
                };
                if children.is_empty() {
                    return Err(compile_error(format!("{} filter with no operands", name)));
                }
                let mut packet = Packet::context(tag, name);
                for child in children {
                    packet.append_child(child.to_packet()?);
                }
                packet
            }
            Filter::Not(inner) => Packet::context(NOT, "Not").with_child(inner.to_packet()?),
            Filter::Equality { attr, value } => {
                assertion(EQUALITY_MATCH, "Equality Match", attr, value)?
            }
            Filter::GreaterOrEqual { attr, value } => {
                assertion(GREATER_OR_EQUAL, "Greater Or Equal", attr, value)?
            }
            Filter::LessOrEqual { attr, value } => {
                assertion(LESS_OR_EQUAL, "Less Or Equal", attr, value)?
            }
            Filter::ApproxMatch { attr, value } => {
                assertion(APPROX_MATCH, "Approx Match", attr, value)?
            }
            Filter::Present(attr) => {
                check_attr(attr)?;
                Packet::context_primitive(PRESENT, attr.clone().into_bytes(), "Present")
            }
            Filter::Substring {
                attr,
                initial,
                any,
                final_,
            } => {
                check_attr(attr)?;
                if initial.is_none() && any.is_empty() && final_.is_none() {
                    return Err(compile_error("substring filter with no variable parts"));
                }
                let mut parts = Packet::sequence("Substrings");
                if let Some(initial) = initial {
                    parts.append_child(Packet::context_primitive(
                        SUBSTRING_INITIAL,
                        initial.clone(),
                        "Initial",
                    ));
                }
                for value in any {
                    parts.append_child(Packet::context_primitive(
                        SUBSTRING_ANY,
                        value.clone(),
                        "Any",
                    ));
                }
                if let Some(final_) = final_ {
                    parts.append_child(Packet::context_primitive(
                        SUBSTRING_FINAL,
                        final_.clone(),
                        "Final",
                    ));
                }
                Packet::context(SUBSTRINGS, "Substrings")
                    .with_child(Packet::string(attr, "Attribute"))
                    .with_child(parts)
            }
            Filter::ExtensibleMatch {
                rule,
                attr,
                value,
                dn_attributes,
            } => {
                if rule.is_none() && attr.is_none() {
                    return Err(compile_error(
                        "extensible match needs an attribute or a matching rule",
                    ));
                }
                let mut packet = Packet::context(EXTENSIBLE_MATCH, "Extensible Match");
                if let Some(rule) = rule {
                    packet.append_child(Packet::context_primitive(
                        MATCHING_RULE,
                        rule.clone().into_bytes(),
                        "Matching Rule",
                    ));
                }
                if let Some(attr) = attr {
                    packet.append_child(Packet::context_primitive(
                        MATCHING_TYPE,
                        attr.clone().into_bytes(),
                        "Matching Type",
                    ));
                }
                packet.append_child(Packet::context_primitive(
                    MATCH_VALUE,
                    value.clone(),
                    "Match Value",
                ));
                if *dn_attributes {
                    packet.append_child(Packet::context_primitive(
                        DN_ATTRIBUTES,
                        Bytes::from_static(&[0xFF]),
                        "DN Attributes",
                    ));
                }
                packet
            }
        };
        Ok(packet)
    }

    /// Reads a filter sent by a peer.
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        decode_filter(packet, 1)
    }
}

fn check_attr(attr: &str) -> Result<(), ProtocolError> {
    if attr.is_empty() {
        return Err(compile_error("empty attribute description"));
    }
    Ok(())
}

fn assertion(
    tag: u32,
    description: &'static str,
    attr: &str,
    value: &[u8],
) -> Result<Packet, ProtocolError> {
    check_attr(attr)?;
    Ok(Packet::context(tag, description)
        .with_child(Packet::string(attr, "Attribute"))
        .with_child(Packet::octets(value.to_vec(), "Condition")))
}

fn decode_filter(packet: &Packet, depth: usize) -> Result<Filter, ProtocolError> {
    use filter_tag::*;

    if depth > DEFAULT_MAX_FILTER_DEPTH {
        return Err(decompile_error(format!(
            "filter nesting exceeds {} levels",
            DEFAULT_MAX_FILTER_DEPTH
        )));
    }
    if packet.class != Class::Context {
        return Err(decompile_error(format!(
            "unexpected {:?} tag {} in filter",
            packet.class, packet.tag
        )));
    }

    let filter = match packet.tag {
        AND | OR => {
            if packet.children.is_empty() {
                return Err(decompile_error("AND/OR filter with no operands"));
            }
            let children = packet
                .children
                .iter()
                .map(|child| decode_filter(child, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            if packet.tag == AND {
                Filter::And(children)
            } else {
                Filter::Or(children)
            }
        }
        NOT => match packet.children.as_slice() {
            [inner] => Filter::Not(Box::new(decode_filter(inner, depth + 1)?)),
            _ => return Err(decompile_error("NOT filter must have exactly one operand")),
        },
        EQUALITY_MATCH | GREATER_OR_EQUAL | LESS_OR_EQUAL | APPROX_MATCH => {
            let (attr, value) = decode_assertion(packet)?;
            match packet.tag {
                EQUALITY_MATCH => Filter::Equality { attr, value },
                GREATER_OR_EQUAL => Filter::GreaterOrEqual { attr, value },
                LESS_OR_EQUAL => Filter::LessOrEqual { attr, value },
                _ => Filter::ApproxMatch { attr, value },
            }
        }
        PRESENT => {
            if packet.constructed {
                return Err(decompile_error("present filter must be primitive"));
            }
            Filter::Present(decode_text(packet, "attribute description")?)
        }
        SUBSTRINGS => decode_substrings(packet)?,
        EXTENSIBLE_MATCH => decode_extensible(packet)?,
        other => return Err(decompile_error(format!("unknown filter tag {}", other))),
    };
    Ok(filter)
}

fn decode_text(packet: &Packet, what: &str) -> Result<String, ProtocolError> {
    let text = packet
        .as_str()
        .map_err(|_| decompile_error(format!("{} is not valid UTF-8", what)))?;
    if text.is_empty() {
        return Err(decompile_error(format!("empty {}", what)));
    }
    Ok(text.to_string())
}

fn decode_assertion(packet: &Packet) -> Result<(String, Vec<u8>), ProtocolError> {
    match packet.children.as_slice() {
        [attr, value] if !value.constructed => Ok((
            decode_text(attr, "attribute description")?,
            value.as_bytes().to_vec(),
        )),
        _ => Err(decompile_error("malformed attribute value assertion")),
    }
}

fn decode_substrings(packet: &Packet) -> Result<Filter, ProtocolError> {
    use filter_tag::*;

    let [attr, parts] = packet.children.as_slice() else {
        return Err(decompile_error("malformed substring filter"));
    };
    let attr = decode_text(attr, "attribute description")?;

    let mut initial = None;
    let mut any = Vec::new();
    let mut final_ = None;
    let count = parts.children.len();
    for (index, part) in parts.children.iter().enumerate() {
        if part.class != Class::Context || part.constructed {
            return Err(decompile_error("malformed substring component"));
        }
        let value = part.as_bytes().to_vec();
        match part.tag {
            SUBSTRING_INITIAL if index == 0 => initial = Some(value),
            SUBSTRING_ANY => any.push(value),
            SUBSTRING_FINAL if index + 1 == count => final_ = Some(value),
            SUBSTRING_INITIAL | SUBSTRING_FINAL => {
                return Err(decompile_error("substring initial/final out of order"))
            }
            other => {
                return Err(decompile_error(format!(
                    "unknown substring component tag {}",
                    other
                )))
            }
        }
    }
    if count == 0 {
        return Err(decompile_error("substring filter with no variable parts"));
    }

    Ok(Filter::Substring {
        attr,
        initial,
        any,
        final_,
    })
}

fn decode_extensible(packet: &Packet) -> Result<Filter, ProtocolError> {
    use filter_tag::*;

    let mut rule = None;
    let mut attr = None;
    let mut value = None;
    let mut dn_attributes = false;
    for child in &packet.children {
        if child.class != Class::Context || child.constructed {
            return Err(decompile_error("malformed extensible match component"));
        }
        match child.tag {
            MATCHING_RULE => rule = Some(decode_text(child, "matching rule")?),
            MATCHING_TYPE => attr = Some(decode_text(child, "attribute description")?),
            MATCH_VALUE => value = Some(child.as_bytes().to_vec()),
            DN_ATTRIBUTES => {
                dn_attributes = child
                    .as_bool()
                    .map_err(|_| decompile_error("invalid dnAttributes flag"))?
            }
            other => {
                return Err(decompile_error(format!(
                    "unknown extensible match component tag {}",
                    other
                )))
            }
        }
    }

    let value = value.ok_or_else(|| decompile_error("extensible match without a value"))?;
    if rule.is_none() && attr.is_none() {
        return Err(decompile_error(
            "extensible match needs an attribute or a matching rule",
        ));
    }
    Ok(Filter::ExtensibleMatch {
        rule,
        attr,
        value,
        dn_attributes,
    })
}

/// Escapes an assertion value for filter text.
///
/// NUL, `(`, `)`, `*`, `\` and every byte outside printable ASCII become
/// `\xx`.
pub fn escape_filter_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value {
        match byte {
            b'(' | b')' | b'*' | b'\\' | 0x00..=0x1F | 0x7F..=0xFF => {
                out.push('\\');
                out.push_str(&hex::encode([byte]));
            }
            _ => out.push(byte as char),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attr, value } => {
                write!(f, "({}={})", attr, escape_filter_value(value))
            }
            Filter::GreaterOrEqual { attr, value } => {
                write!(f, "({}>={})", attr, escape_filter_value(value))
            }
            Filter::LessOrEqual { attr, value } => {
                write!(f, "({}<={})", attr, escape_filter_value(value))
            }
            Filter::ApproxMatch { attr, value } => {
                write!(f, "({}~={})", attr, escape_filter_value(value))
            }
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substring {
                attr,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    f.write_str(&escape_filter_value(initial))?;
                }
                f.write_str("*")?;
                for value in any {
                    write!(f, "{}*", escape_filter_value(value))?;
                }
                if let Some(final_) = final_ {
                    f.write_str(&escape_filter_value(final_))?;
                }
                f.write_str(")")
            }
            Filter::ExtensibleMatch {
                rule,
                attr,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(attr) = attr {
                    f.write_str(attr)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_filter_value(value))
            }
        }
    }
}

/// Compiles filter text into its wire form.
pub fn compile_filter(text: &str) -> Result<Packet, ProtocolError> {
    Filter::parse(text)?.to_packet()
}

/// Renders a wire filter back to escape-normalised text.
pub fn decompile_filter(packet: &Packet) -> Result<String, ProtocolError> {
    Ok(Filter::from_packet(packet)?.to_string())
}

/// Recursive-descent parser over filter text.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, max_depth: usize) -> Self {
        Self {
            input,
            pos: 0,
            max_depth,
        }
    }

    fn parse_filter(&mut self, depth: usize) -> Result<Filter, ProtocolError> {
        if depth > self.max_depth {
            return Err(compile_error(format!(
                "filter nesting exceeds {} levels",
                self.max_depth
            )));
        }

        self.expect(b'(')?;
        let filter = match self.peek_byte() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_set(depth, "AND")?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_set(depth, "OR")?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter(depth + 1)?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(compile_error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_set(&mut self, depth: usize, name: &str) -> Result<Vec<Filter>, ProtocolError> {
        let mut children = Vec::new();
        while self.peek_byte() == Some(b'(') {
            children.push(self.parse_filter(depth + 1)?);
        }
        if children.is_empty() {
            return Err(compile_error(format!("{} filter with no operands", name)));
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> Result<Filter, ProtocolError> {
        let start = self.pos;
        while let Some(b) = self.peek_byte() {
            match b {
                b'=' | b'~' | b'<' | b'>' | b':' | b'(' | b')' | b'*' | b'\\' => break,
                _ => self.pos += 1,
            }
        }
        let attr = &self.input[start..self.pos];

        if self.peek_byte() == Some(b':') {
            return self.parse_extensible(attr);
        }
        if attr.is_empty() {
            return Err(compile_error(format!(
                "empty attribute description at position {}",
                start
            )));
        }
        let attr = attr.to_string();

        if self.peek_str("~=") {
            self.pos += 2;
            let value = self.parse_plain_value()?;
            return Ok(Filter::ApproxMatch { attr, value });
        }
        if self.peek_str(">=") {
            self.pos += 2;
            let value = self.parse_plain_value()?;
            return Ok(Filter::GreaterOrEqual { attr, value });
        }
        if self.peek_str("<=") {
            self.pos += 2;
            let value = self.parse_plain_value()?;
            return Ok(Filter::LessOrEqual { attr, value });
        }
        if self.peek_byte() != Some(b'=') {
            return Err(compile_error(format!(
                "unknown filter operator at position {}",
                self.pos
            )));
        }
        self.pos += 1;

        let mut parts = self.parse_value_parts()?;
        // A lone `*` is a presence test, not a substring.
        if parts.len() == 2 && parts.iter().all(Vec::is_empty) {
            return Ok(Filter::Present(attr));
        }
        if parts.len() == 1 {
            let value = parts.pop().unwrap_or_default();
            return Ok(Filter::Equality { attr, value });
        }

        let last = parts.len() - 1;
        let mut initial = None;
        let mut any = Vec::new();
        let mut final_ = None;
        for (index, part) in parts.into_iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if index == 0 {
                initial = Some(part);
            } else if index == last {
                final_ = Some(part);
            } else {
                any.push(part);
            }
        }
        if initial.is_none() && any.is_empty() && final_.is_none() {
            return Err(compile_error("substring filter with no variable parts"));
        }
        Ok(Filter::Substring {
            attr,
            initial,
            any,
            final_,
        })
    }

    /// Parses `attr[:dn][:rule]:=value`; the cursor sits on the first `:`.
    fn parse_extensible(&mut self, attr: &str) -> Result<Filter, ProtocolError> {
        let mut dn_attributes = false;
        let mut rule: Option<String> = None;

        loop {
            self.pos += 1;
            if self.peek_byte() == Some(b'=') {
                self.pos += 1;
                break;
            }

            let start = self.pos;
            while let Some(b) = self.peek_byte() {
                match b {
                    b':' | b'=' | b'(' | b')' | b'*' | b'\\' => break,
                    _ => self.pos += 1,
                }
            }
            let token = &self.input[start..self.pos];
            if self.peek_byte() != Some(b':') {
                return Err(compile_error("expected ':=' in extensible match"));
            }

            match token {
                "" => return Err(compile_error("empty matching rule in extensible match")),
                t if t.eq_ignore_ascii_case("dn") && !dn_attributes && rule.is_none() => {
                    dn_attributes = true
                }
                t if rule.is_none() => rule = Some(t.to_string()),
                t => {
                    return Err(compile_error(format!(
                        "unexpected '{}' in extensible match",
                        t
                    )))
                }
            }
        }

        if attr.is_empty() && rule.is_none() {
            return Err(compile_error(
                "extensible match needs an attribute or a matching rule",
            ));
        }
        let value = self.parse_plain_value()?;
        Ok(Filter::ExtensibleMatch {
            rule,
            attr: (!attr.is_empty()).then(|| attr.to_string()),
            value,
            dn_attributes,
        })
    }

    /// Value of a non-substring assertion; `*` is taken literally.
    fn parse_plain_value(&mut self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.parse_value_parts()?.join(&b'*'))
    }

    /// Reads an assertion value up to the closing `)`, split on bare `*`.
    fn parse_value_parts(&mut self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut parts = Vec::new();
        let mut current = Vec::new();
        loop {
            match self.peek_byte() {
                None => return Err(compile_error("unexpected end of filter")),
                Some(b')') => break,
                Some(b'(') => {
                    return Err(compile_error(format!(
                        "unescaped '(' in assertion value at position {}",
                        self.pos
                    )))
                }
                Some(b'*') => {
                    parts.push(std::mem::take(&mut current));
                    self.pos += 1;
                }
                Some(b'\\') => {
                    let digits = self
                        .input
                        .get(self.pos + 1..self.pos + 3)
                        .ok_or_else(|| compile_error("truncated escape sequence"))?;
                    let decoded = hex::decode(digits).map_err(|_| {
                        compile_error(format!("invalid escape sequence '\\{}'", digits))
                    })?;
                    current.extend_from_slice(&decoded);
                    self.pos += 3;
                }
                Some(b) => {
                    current.push(b);
                    self.pos += 1;
                }
            }
        }
        parts.push(current);
        Ok(parts)
    }

    fn expect(&mut self, expected: u8) -> Result<(), ProtocolError> {
        match self.peek_byte() {
            Some(b) if b == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(compile_error(format!(
                "expected '{}' at position {}",
                expected as char, self.pos
            ))),
            None => Err(compile_error("unexpected end of filter")),
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input.as_bytes()[self.pos..].starts_with(s.as_bytes())
    }
}
