//! LDAP message envelope and response types.
//!
//! ```text
//! LDAPMessage ::= SEQUENCE {
//!      messageID       MessageID,
//!      protocolOp      CHOICE { ... [APPLICATION n] ... },
//!      controls        [0] Controls OPTIONAL }
//! ```

use crate::ber::{tag, Class, Packet};
use crate::control::{encode_controls, Control, ControlRegistry};
use crate::entry::Entry;
use crate::error::{LdapError, ProtocolError};
use crate::result::ResultCode;
use bytes::Bytes;

/// Application tags of the `protocolOp` CHOICE.
pub mod application {
    pub const BIND_REQUEST: u32 = 0;
    pub const BIND_RESPONSE: u32 = 1;
    pub const UNBIND_REQUEST: u32 = 2;
    pub const SEARCH_REQUEST: u32 = 3;
    pub const SEARCH_RESULT_ENTRY: u32 = 4;
    pub const SEARCH_RESULT_DONE: u32 = 5;
    pub const MODIFY_REQUEST: u32 = 6;
    pub const MODIFY_RESPONSE: u32 = 7;
    pub const ADD_REQUEST: u32 = 8;
    pub const ADD_RESPONSE: u32 = 9;
    pub const DEL_REQUEST: u32 = 10;
    pub const DEL_RESPONSE: u32 = 11;
    pub const MODIFY_DN_REQUEST: u32 = 12;
    pub const MODIFY_DN_RESPONSE: u32 = 13;
    pub const COMPARE_REQUEST: u32 = 14;
    pub const COMPARE_RESPONSE: u32 = 15;
    pub const ABANDON_REQUEST: u32 = 16;
    pub const SEARCH_RESULT_REFERENCE: u32 = 19;
    pub const EXTENDED_REQUEST: u32 = 23;
    pub const EXTENDED_RESPONSE: u32 = 24;
    pub const INTERMEDIATE_RESPONSE: u32 = 25;
}

/// Display name of an application tag, for logs and dumps.
pub fn application_name(tag: u32) -> &'static str {
    use application::*;
    match tag {
        BIND_REQUEST => "Bind Request",
        BIND_RESPONSE => "Bind Response",
        UNBIND_REQUEST => "Unbind Request",
        SEARCH_REQUEST => "Search Request",
        SEARCH_RESULT_ENTRY => "Search Result Entry",
        SEARCH_RESULT_DONE => "Search Result Done",
        MODIFY_REQUEST => "Modify Request",
        MODIFY_RESPONSE => "Modify Response",
        ADD_REQUEST => "Add Request",
        ADD_RESPONSE => "Add Response",
        DEL_REQUEST => "Del Request",
        DEL_RESPONSE => "Del Response",
        MODIFY_DN_REQUEST => "Modify DN Request",
        MODIFY_DN_RESPONSE => "Modify DN Response",
        COMPARE_REQUEST => "Compare Request",
        COMPARE_RESPONSE => "Compare Response",
        ABANDON_REQUEST => "Abandon Request",
        SEARCH_RESULT_REFERENCE => "Search Result Reference",
        EXTENDED_REQUEST => "Extended Request",
        EXTENDED_RESPONSE => "Extended Response",
        INTERMEDIATE_RESPONSE => "Intermediate Response",
        _ => "Unknown Operation",
    }
}

/// A request operation that can be placed in an envelope.
pub trait Request: Send + Sync {
    /// Builds the `protocolOp` element. Nothing is sent if this fails.
    fn encode(&self) -> Result<Packet, ProtocolError>;

    fn controls(&self) -> &[Control] {
        &[]
    }

    /// Unbind and abandon get no reply from the server.
    fn expects_response(&self) -> bool {
        true
    }
}

/// Wraps an operation in `LDAPMessage`; controls go after the operation.
pub fn envelope(message_id: i32, op: Packet, controls: &[Control]) -> Packet {
    let mut packet = Packet::sequence("LDAP Request")
        .with_child(Packet::integer(i64::from(message_id), "MessageID"))
        .with_child(op);
    if !controls.is_empty() {
        packet.append_child(encode_controls(controls));
    }
    packet
}

pub fn encode_message(message_id: i32, request: &dyn Request) -> Result<Packet, ProtocolError> {
    Ok(envelope(message_id, request.encode()?, request.controls()))
}

/// `LDAPResult` carried by every final response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
    pub referrals: Vec<String>,
}

const REFERRAL_TAG: u32 = 3;

impl LdapResult {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            message: message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Turns a non-success code into an [`LdapError`].
    pub fn into_result(self) -> Result<Self, LdapError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LdapError::new(self.code, self.message))
        }
    }

    /// Reads the `LDAPResult` components from a response operation.
    ///
    /// Returns the result and the operation-specific elements after it.
    pub fn decode(op: &Packet) -> Result<(Self, &[Packet]), ProtocolError> {
        if op.class != Class::Application || !op.constructed || op.children.len() < 3 {
            return Err(ProtocolError::InvalidPacket);
        }
        let code = op.children[0]
            .as_int()
            .ok()
            .and_then(|code| u16::try_from(code).ok())
            .ok_or(ProtocolError::InvalidPacket)?;

        let mut result = Self {
            code: ResultCode::from_code(code),
            matched_dn: op.children[1].as_string_lossy(),
            message: op.children[2].as_string_lossy(),
            referrals: Vec::new(),
        };

        let mut rest = &op.children[3..];
        if let Some(first) = rest.first() {
            if first.is(Class::Context, REFERRAL_TAG) && first.constructed {
                result.referrals = first.children.iter().map(Packet::as_string_lossy).collect();
                rest = &rest[1..];
            }
        }
        Ok((result, rest))
    }

    /// Encodes the result as `[APPLICATION tag]`.
    pub fn to_packet(&self, tag: u32) -> Packet {
        let mut packet = Packet::application(tag, application_name(tag))
            .with_child(Packet::enumerated(i64::from(self.code.code()), "resultCode"))
            .with_child(Packet::string(&self.matched_dn, "matchedDN"))
            .with_child(Packet::string(&self.message, "diagnosticMessage"));
        if !self.referrals.is_empty() {
            let mut referral = Packet::context(REFERRAL_TAG, "Referral");
            for uri in &self.referrals {
                referral.append_child(Packet::string(uri, "URI"));
            }
            packet.append_child(referral);
        }
        packet
    }
}

/// The decoded `protocolOp` of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOp {
    Bind {
        result: LdapResult,
        server_sasl_creds: Option<Bytes>,
    },
    SearchEntry(Entry),
    SearchReference(Vec<String>),
    SearchDone(LdapResult),
    Modify(LdapResult),
    Add(LdapResult),
    Delete(LdapResult),
    ModifyDn(LdapResult),
    Compare(LdapResult),
    Extended {
        result: LdapResult,
        name: Option<String>,
        value: Option<Bytes>,
    },
    Intermediate {
        name: Option<String>,
        value: Option<Bytes>,
    },
}

impl ResponseOp {
    pub fn tag(&self) -> u32 {
        use application::*;
        match self {
            ResponseOp::Bind { .. } => BIND_RESPONSE,
            ResponseOp::SearchEntry(_) => SEARCH_RESULT_ENTRY,
            ResponseOp::SearchReference(_) => SEARCH_RESULT_REFERENCE,
            ResponseOp::SearchDone(_) => SEARCH_RESULT_DONE,
            ResponseOp::Modify(_) => MODIFY_RESPONSE,
            ResponseOp::Add(_) => ADD_RESPONSE,
            ResponseOp::Delete(_) => DEL_RESPONSE,
            ResponseOp::ModifyDn(_) => MODIFY_DN_RESPONSE,
            ResponseOp::Compare(_) => COMPARE_RESPONSE,
            ResponseOp::Extended { .. } => EXTENDED_RESPONSE,
            ResponseOp::Intermediate { .. } => INTERMEDIATE_RESPONSE,
        }
    }

    pub fn decode(op: &Packet) -> Result<Self, ProtocolError> {
        use application::*;

        if op.class != Class::Application {
            return Err(ProtocolError::InvalidPacket);
        }
        let decoded = match op.tag {
            BIND_RESPONSE => {
                let (result, rest) = LdapResult::decode(op)?;
                let server_sasl_creds = rest
                    .iter()
                    .find(|p| p.is(Class::Context, 7))
                    .map(|p| p.data.clone());
                ResponseOp::Bind {
                    result,
                    server_sasl_creds,
                }
            }
            SEARCH_RESULT_ENTRY => ResponseOp::SearchEntry(Entry::decode(op)?),
            SEARCH_RESULT_REFERENCE => ResponseOp::SearchReference(
                op.children.iter().map(Packet::as_string_lossy).collect(),
            ),
            SEARCH_RESULT_DONE => ResponseOp::SearchDone(LdapResult::decode(op)?.0),
            MODIFY_RESPONSE => ResponseOp::Modify(LdapResult::decode(op)?.0),
            ADD_RESPONSE => ResponseOp::Add(LdapResult::decode(op)?.0),
            DEL_RESPONSE => ResponseOp::Delete(LdapResult::decode(op)?.0),
            MODIFY_DN_RESPONSE => ResponseOp::ModifyDn(LdapResult::decode(op)?.0),
            COMPARE_RESPONSE => ResponseOp::Compare(LdapResult::decode(op)?.0),
            EXTENDED_RESPONSE => {
                let (result, rest) = LdapResult::decode(op)?;
                let (name, value) = decode_name_value(rest, 10, 11);
                ResponseOp::Extended {
                    result,
                    name,
                    value,
                }
            }
            INTERMEDIATE_RESPONSE => {
                let (name, value) = decode_name_value(&op.children, 0, 1);
                ResponseOp::Intermediate { name, value }
            }
            other => return Err(ProtocolError::UnexpectedOperation(other)),
        };
        Ok(decoded)
    }

    /// Encodes the operation; used by servers and test peers.
    pub fn to_packet(&self) -> Packet {
        let tag = self.tag();
        match self {
            ResponseOp::Bind {
                result,
                server_sasl_creds,
            } => {
                let mut packet = result.to_packet(tag);
                if let Some(creds) = server_sasl_creds {
                    packet.append_child(Packet::context_primitive(
                        7,
                        creds.clone(),
                        "serverSaslCreds",
                    ));
                }
                packet
            }
            ResponseOp::SearchEntry(entry) => entry.encode(),
            ResponseOp::SearchReference(uris) => {
                let mut packet = Packet::application(tag, application_name(tag));
                for uri in uris {
                    packet.append_child(Packet::string(uri, "URI"));
                }
                packet
            }
            ResponseOp::SearchDone(result)
            | ResponseOp::Modify(result)
            | ResponseOp::Add(result)
            | ResponseOp::Delete(result)
            | ResponseOp::ModifyDn(result)
            | ResponseOp::Compare(result) => result.to_packet(tag),
            ResponseOp::Extended {
                result,
                name,
                value,
            } => {
                let mut packet = result.to_packet(tag);
                append_name_value(&mut packet, name, value, 10, 11);
                packet
            }
            ResponseOp::Intermediate { name, value } => {
                let mut packet = Packet::application(tag, application_name(tag));
                append_name_value(&mut packet, name, value, 0, 1);
                packet
            }
        }
    }
}

fn decode_name_value(
    elements: &[Packet],
    name_tag: u32,
    value_tag: u32,
) -> (Option<String>, Option<Bytes>) {
    let mut name = None;
    let mut value = None;
    for element in elements {
        if element.is(Class::Context, name_tag) {
            name = Some(element.as_string_lossy());
        } else if element.is(Class::Context, value_tag) {
            value = Some(element.data.clone());
        }
    }
    (name, value)
}

fn append_name_value(
    packet: &mut Packet,
    name: &Option<String>,
    value: &Option<Bytes>,
    name_tag: u32,
    value_tag: u32,
) {
    if let Some(name) = name {
        packet.append_child(Packet::context_primitive(
            name_tag,
            name.clone().into_bytes(),
            "responseName",
        ));
    }
    if let Some(value) = value {
        packet.append_child(Packet::context_primitive(
            value_tag,
            value.clone(),
            "responseValue",
        ));
    }
}

/// A decoded response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message_id: i32,
    pub op: ResponseOp,
    pub controls: Vec<Control>,
}

impl Response {
    pub fn new(message_id: i32, op: ResponseOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn decode(packet: &Packet, registry: &ControlRegistry) -> Result<Self, ProtocolError> {
        let message_id = message_id(packet)?;
        let op = ResponseOp::decode(packet.child(1)?)?;
        let controls = match packet.children.get(2) {
            Some(controls) => registry.decode_controls(controls)?,
            None => Vec::new(),
        };
        Ok(Self {
            message_id,
            op,
            controls,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut packet = envelope(self.message_id, self.op.to_packet(), &self.controls);
        packet.description = "LDAP Response";
        packet
    }

    /// The `LDAPResult` of a final response.
    pub fn result(&self) -> Option<&LdapResult> {
        match &self.op {
            ResponseOp::Bind { result, .. } | ResponseOp::Extended { result, .. } => Some(result),
            ResponseOp::SearchDone(result)
            | ResponseOp::Modify(result)
            | ResponseOp::Add(result)
            | ResponseOp::Delete(result)
            | ResponseOp::ModifyDn(result)
            | ResponseOp::Compare(result) => Some(result),
            ResponseOp::SearchEntry(_)
            | ResponseOp::SearchReference(_)
            | ResponseOp::Intermediate { .. } => None,
        }
    }

    /// Whether this is the last message for its message id.
    pub fn is_final(&self) -> bool {
        self.result().is_some()
    }
}

/// Reads the message id of an envelope.
pub fn message_id(packet: &Packet) -> Result<i32, ProtocolError> {
    if !packet.is(Class::Universal, tag::SEQUENCE)
        || !packet.constructed
        || packet.children.len() < 2
    {
        return Err(ProtocolError::InvalidPacket);
    }
    let id = packet.children[0].as_int()?;
    i32::try_from(id).map_err(|_| ProtocolError::InvalidPacket)
}

/// Extracts the result code and diagnostic message of a response envelope.
///
/// The operation must be a bare `LDAPResult` of exactly three elements.
pub fn decode_result_code(packet: &Packet) -> Result<(ResultCode, String), ProtocolError> {
    match packet.children.get(1) {
        Some(op) if op.children.len() == 3 => {
            let (result, _) = LdapResult::decode(op)?;
            Ok((result.code, result.message))
        }
        _ => Err(ProtocolError::InvalidPacket),
    }
}

/// Like [`decode_result_code`], failing on any non-success code.
pub fn check_result(packet: &Packet) -> Result<(), LdapError> {
    let (code, message) = decode_result_code(packet)?;
    if code.is_success() {
        Ok(())
    } else {
        Err(LdapError::new(code, message))
    }
}
