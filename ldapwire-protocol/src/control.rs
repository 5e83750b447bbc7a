//! Request and response controls (RFC 4511 §4.1.11).
//!
//! Built-in kinds are variants of [`Control`]; anything else travels as
//! [`Control::Opaque`]. The [`ControlRegistry`] maps a control OID to the
//! function that decodes its value and is built once, before any connection
//! is opened, then shared read-only.

use crate::ber::{tag, Class, Packet};
use crate::error::ProtocolError;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Simple paged results (RFC 2696).
pub const CONTROL_TYPE_PAGING: &str = "1.2.840.113556.1.4.319";
/// Password policy (draft-behera-ldap-password-policy).
pub const CONTROL_TYPE_BEHERA_PASSWORD_POLICY: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
/// Netscape password-expired response control.
pub const CONTROL_TYPE_VCHU_PASSWORD_MUST_CHANGE: &str = "2.16.840.1.113730.3.4.4";
/// Netscape password-expiring response control.
pub const CONTROL_TYPE_VCHU_PASSWORD_WARNING: &str = "2.16.840.1.113730.3.4.5";
/// ManageDsaIT (RFC 3296).
pub const CONTROL_TYPE_MANAGE_DSA_IT: &str = "2.16.840.1.113730.3.4.2";

/// Human-readable name of a known control OID.
pub fn control_name(oid: &str) -> Option<&'static str> {
    match oid {
        CONTROL_TYPE_PAGING => Some("Paging"),
        CONTROL_TYPE_BEHERA_PASSWORD_POLICY => Some("Password Policy - Behera Draft"),
        CONTROL_TYPE_VCHU_PASSWORD_MUST_CHANGE => {
            Some("VChu Password Policy - Password Must Change")
        }
        CONTROL_TYPE_VCHU_PASSWORD_WARNING => Some("VChu Password Policy - Password Warning"),
        CONTROL_TYPE_MANAGE_DSA_IT => Some("Manage DSA IT"),
        _ => None,
    }
}

/// Error strings for the Behera `error` field, indexed by value.
const BEHERA_ERRORS: [&str; 9] = [
    "Password expired",
    "Account locked",
    "Password must be changed",
    "Policy prevents password modification",
    "Policy requires old password in order to change password",
    "Password fails quality checks",
    "Password is too short for policy",
    "Password has been changed too recently",
    "New password is in list of old passwords",
];

/// Common surface of every control kind.
pub trait ControlKind {
    fn control_type(&self) -> &str;

    fn criticality(&self) -> bool;

    /// Encoded `controlValue`, if the kind carries one.
    fn value(&self) -> Option<Bytes>;

    /// Builds `Control ::= SEQUENCE { controlType, criticality, controlValue }`.
    fn encode(&self) -> Packet {
        let mut packet = Packet::sequence("Control")
            .with_child(Packet::string(self.control_type(), "Control Type"));
        if self.criticality() {
            packet.append_child(Packet::boolean(true, "Criticality"));
        }
        if let Some(value) = self.value() {
            packet.append_child(Packet::octets(value, "Control Value"));
        }
        packet
    }
}

fn invalid(oid: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidControl {
        oid: oid.to_string(),
        reason: reason.into(),
    }
}

fn decode_value(oid: &str, value: Option<&[u8]>) -> Result<Packet, ProtocolError> {
    let value = value.ok_or_else(|| invalid(oid, "missing control value"))?;
    let (packet, _) = Packet::decode(value).map_err(|e| invalid(oid, e.to_string()))?;
    Ok(packet)
}

/// Simple paged results control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPaging {
    pub page_size: u32,
    /// Opaque server cursor; empty on the first request and after the last page.
    pub cookie: Bytes,
    pub criticality: bool,
}

impl ControlPaging {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            cookie: Bytes::new(),
            criticality: false,
        }
    }

    /// Copies the cookie returned by the server into this control.
    pub fn set_cookie(&mut self, cookie: impl Into<Bytes>) {
        self.cookie = cookie.into();
    }

    fn decode(criticality: bool, value: Option<&[u8]>) -> Result<Control, ProtocolError> {
        let oid = CONTROL_TYPE_PAGING;
        let packet = decode_value(oid, value)?;
        let [size, cookie] = packet.children.as_slice() else {
            return Err(invalid(oid, "expected SEQUENCE { size, cookie }"));
        };
        let size = size.as_int().map_err(|e| invalid(oid, e.to_string()))?;
        let page_size =
            u32::try_from(size).map_err(|_| invalid(oid, format!("page size {} out of range", size)))?;
        Ok(Control::Paging(ControlPaging {
            page_size,
            cookie: cookie.data.clone(),
            criticality,
        }))
    }
}

impl ControlKind for ControlPaging {
    fn control_type(&self) -> &str {
        CONTROL_TYPE_PAGING
    }

    fn criticality(&self) -> bool {
        self.criticality
    }

    fn value(&self) -> Option<Bytes> {
        let value = Packet::sequence("Search Control Value")
            .with_child(Packet::integer(i64::from(self.page_size), "Paging Size"))
            .with_child(Packet::octets(self.cookie.clone(), "Cookie"));
        Some(value.encode().freeze())
    }
}

/// Behera password policy control. Absent numeric fields are `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlBeheraPasswordPolicy {
    /// Seconds before the password expires.
    pub expire: i64,
    /// Remaining grace logins.
    pub grace: i64,
    pub error: i8,
    pub error_string: String,
    pub criticality: bool,
}

impl Default for ControlBeheraPasswordPolicy {
    fn default() -> Self {
        Self {
            expire: -1,
            grace: -1,
            error: -1,
            error_string: String::new(),
            criticality: false,
        }
    }
}

impl ControlBeheraPasswordPolicy {
    /// Request form: no value, asks the server to attach policy state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `error` and its description. Values outside 0..=8 are rejected.
    pub fn set_error(&mut self, error: i8) -> Result<(), ProtocolError> {
        let text = usize::try_from(error)
            .ok()
            .and_then(|index| BEHERA_ERRORS.get(index))
            .ok_or_else(|| {
                invalid(
                    CONTROL_TYPE_BEHERA_PASSWORD_POLICY,
                    format!("unknown error value {}", error),
                )
            })?;
        self.error = error;
        self.error_string = (*text).to_string();
        Ok(())
    }

    /// Values this crate has no description for are kept with a generic one,
    /// so a newer server cannot make the whole response undecodable.
    fn set_decoded_error(&mut self, error: i64) {
        let known = i8::try_from(error)
            .ok()
            .filter(|&error| self.set_error(error).is_ok());
        if known.is_none() {
            self.error = i8::try_from(error).unwrap_or(i8::MAX);
            self.error_string = format!("unknown password policy error {}", error);
        }
    }

    fn decode(criticality: bool, value: Option<&[u8]>) -> Result<Control, ProtocolError> {
        let oid = CONTROL_TYPE_BEHERA_PASSWORD_POLICY;
        let mut control = ControlBeheraPasswordPolicy {
            criticality,
            ..Default::default()
        };
        let Some(value) = value else {
            return Ok(Control::BeheraPasswordPolicy(control));
        };

        let (packet, _) = Packet::decode(value).map_err(|e| invalid(oid, e.to_string()))?;
        for child in &packet.children {
            match (child.class, child.tag) {
                (Class::Context, 0) => {
                    let warning = child
                        .child(0)
                        .map_err(|_| invalid(oid, "empty warning"))?;
                    let amount = warning.as_int().map_err(|e| invalid(oid, e.to_string()))?;
                    match warning.tag {
                        0 => control.expire = amount,
                        1 => control.grace = amount,
                        other => return Err(invalid(oid, format!("unknown warning tag {}", other))),
                    }
                }
                (Class::Context, 1) => {
                    let error = child.as_int().map_err(|e| invalid(oid, e.to_string()))?;
                    control.set_decoded_error(error);
                }
                (class, tag) => {
                    return Err(invalid(oid, format!("unexpected {:?} tag {}", class, tag)))
                }
            }
        }
        Ok(Control::BeheraPasswordPolicy(control))
    }
}

impl ControlKind for ControlBeheraPasswordPolicy {
    fn control_type(&self) -> &str {
        CONTROL_TYPE_BEHERA_PASSWORD_POLICY
    }

    fn criticality(&self) -> bool {
        self.criticality
    }

    fn value(&self) -> Option<Bytes> {
        if self.expire < 0 && self.grace < 0 && self.error < 0 {
            return None;
        }

        let mut value = Packet::sequence("Password Policy Response");
        let warning = if self.expire >= 0 {
            Some(Packet::context_integer(0, self.expire, "Time Before Expiration"))
        } else if self.grace >= 0 {
            Some(Packet::context_integer(1, self.grace, "Grace Logins Remaining"))
        } else {
            None
        };
        if let Some(warning) = warning {
            value.append_child(Packet::context(0, "Warning").with_child(warning));
        }
        if self.error >= 0 {
            value.append_child(Packet::context_integer(1, i64::from(self.error), "Error"));
        }
        Some(value.encode().freeze())
    }
}

/// Server signals that the password has expired and must be changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlVChuPasswordMustChange {
    pub must_change: bool,
    pub criticality: bool,
}

impl ControlKind for ControlVChuPasswordMustChange {
    fn control_type(&self) -> &str {
        CONTROL_TYPE_VCHU_PASSWORD_MUST_CHANGE
    }

    fn criticality(&self) -> bool {
        self.criticality
    }

    fn value(&self) -> Option<Bytes> {
        Some(Bytes::from_static(b"0"))
    }
}

/// Server signals seconds left before the password expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlVChuPasswordWarning {
    pub expire: i64,
    pub criticality: bool,
}

impl ControlVChuPasswordWarning {
    fn decode(criticality: bool, value: Option<&[u8]>) -> Result<Control, ProtocolError> {
        let oid = CONTROL_TYPE_VCHU_PASSWORD_WARNING;
        let expire = match value {
            None => -1,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|text| text.trim().parse::<i64>().ok())
                .ok_or_else(|| invalid(oid, "value is not a decimal number"))?,
        };
        Ok(Control::VChuPasswordWarning(ControlVChuPasswordWarning {
            expire,
            criticality,
        }))
    }
}

impl ControlKind for ControlVChuPasswordWarning {
    fn control_type(&self) -> &str {
        CONTROL_TYPE_VCHU_PASSWORD_WARNING
    }

    fn criticality(&self) -> bool {
        self.criticality
    }

    fn value(&self) -> Option<Bytes> {
        (self.expire >= 0).then(|| Bytes::from(self.expire.to_string()))
    }
}

/// ManageDsaIT: treat referral objects as ordinary entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlManageDsaIt {
    pub criticality: bool,
}

impl ControlKind for ControlManageDsaIt {
    fn control_type(&self) -> &str {
        CONTROL_TYPE_MANAGE_DSA_IT
    }

    fn criticality(&self) -> bool {
        self.criticality
    }

    fn value(&self) -> Option<Bytes> {
        None
    }
}

/// A control this library has no decoder for, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlString {
    pub control_type: String,
    pub criticality: bool,
    pub value: Option<Bytes>,
}

impl ControlString {
    pub fn new(control_type: impl Into<String>, criticality: bool, value: Option<Bytes>) -> Self {
        Self {
            control_type: control_type.into(),
            criticality,
            value,
        }
    }
}

impl ControlKind for ControlString {
    fn control_type(&self) -> &str {
        &self.control_type
    }

    fn criticality(&self) -> bool {
        self.criticality
    }

    fn value(&self) -> Option<Bytes> {
        self.value.clone()
    }
}

/// Any control attached to a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Paging(ControlPaging),
    BeheraPasswordPolicy(ControlBeheraPasswordPolicy),
    VChuPasswordMustChange(ControlVChuPasswordMustChange),
    VChuPasswordWarning(ControlVChuPasswordWarning),
    ManageDsaIt(ControlManageDsaIt),
    Opaque(ControlString),
}

impl Control {
    fn kind(&self) -> &dyn ControlKind {
        match self {
            Control::Paging(c) => c,
            Control::BeheraPasswordPolicy(c) => c,
            Control::VChuPasswordMustChange(c) => c,
            Control::VChuPasswordWarning(c) => c,
            Control::ManageDsaIt(c) => c,
            Control::Opaque(c) => c,
        }
    }

    pub fn control_type(&self) -> &str {
        self.kind().control_type()
    }

    pub fn criticality(&self) -> bool {
        self.kind().criticality()
    }

    pub fn value(&self) -> Option<Bytes> {
        self.kind().value()
    }

    pub fn encode(&self) -> Packet {
        self.kind().encode()
    }

    pub fn paging(page_size: u32) -> Self {
        Control::Paging(ControlPaging::new(page_size))
    }

    pub fn behera_password_policy() -> Self {
        Control::BeheraPasswordPolicy(ControlBeheraPasswordPolicy::new())
    }

    pub fn manage_dsa_it(criticality: bool) -> Self {
        Control::ManageDsaIt(ControlManageDsaIt { criticality })
    }

    pub fn as_paging(&self) -> Option<&ControlPaging> {
        match self {
            Control::Paging(paging) => Some(paging),
            _ => None,
        }
    }

    pub fn as_paging_mut(&mut self) -> Option<&mut ControlPaging> {
        match self {
            Control::Paging(paging) => Some(paging),
            _ => None,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let oid = self.control_type();
        write!(
            f,
            "Control Type: {} ({})  Criticality: {}",
            control_name(oid).unwrap_or("Unknown"),
            oid,
            self.criticality()
        )?;
        match self {
            Control::Paging(c) => write!(
                f,
                "  PagingSize: {}  Cookie: {:?}",
                c.page_size,
                hex::encode(&c.cookie)
            ),
            Control::BeheraPasswordPolicy(c) => write!(
                f,
                "  Expire: {}  Grace: {}  Error: {}, ErrorString: {}",
                c.expire, c.grace, c.error, c.error_string
            ),
            Control::VChuPasswordMustChange(c) => write!(f, "  MustChange: {}", c.must_change),
            Control::VChuPasswordWarning(c) => write!(f, "  Expire: {}", c.expire),
            Control::ManageDsaIt(_) => Ok(()),
            Control::Opaque(c) => match &c.value {
                Some(value) => write!(f, "  Control Value: {:?}", String::from_utf8_lossy(value)),
                None => Ok(()),
            },
        }
    }
}

/// Decodes the value of one control kind.
pub type ControlDecoder = fn(bool, Option<&[u8]>) -> Result<Control, ProtocolError>;

/// OID to decoder table.
#[derive(Debug, Clone)]
pub struct ControlRegistry {
    decoders: HashMap<String, ControlDecoder>,
}

impl ControlRegistry {
    /// Creates a registry with no decoders; every control decodes as opaque.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in kinds registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(CONTROL_TYPE_PAGING, ControlPaging::decode);
        registry.register(
            CONTROL_TYPE_BEHERA_PASSWORD_POLICY,
            ControlBeheraPasswordPolicy::decode,
        );
        registry.register(CONTROL_TYPE_VCHU_PASSWORD_MUST_CHANGE, |criticality, _| {
            Ok(Control::VChuPasswordMustChange(ControlVChuPasswordMustChange {
                must_change: true,
                criticality,
            }))
        });
        registry.register(
            CONTROL_TYPE_VCHU_PASSWORD_WARNING,
            ControlVChuPasswordWarning::decode,
        );
        registry.register(CONTROL_TYPE_MANAGE_DSA_IT, |criticality, _| {
            Ok(Control::ManageDsaIt(ControlManageDsaIt { criticality }))
        });
        registry
    }

    /// Inserts or replaces the decoder for `oid`.
    pub fn register(&mut self, oid: impl Into<String>, decoder: ControlDecoder) {
        self.decoders.insert(oid.into(), decoder);
    }

    pub fn is_registered(&self, oid: &str) -> bool {
        self.decoders.contains_key(oid)
    }

    /// Decodes a control value. Unknown OIDs become [`Control::Opaque`].
    pub fn decode(
        &self,
        oid: &str,
        criticality: bool,
        value: Option<&[u8]>,
    ) -> Result<Control, ProtocolError> {
        match self.decoders.get(oid) {
            Some(decoder) => decoder(criticality, value),
            None => Ok(Control::Opaque(ControlString::new(
                oid,
                criticality,
                value.map(Bytes::copy_from_slice),
            ))),
        }
    }

    /// Decodes one `Control` SEQUENCE from the wire.
    pub fn decode_packet(&self, packet: &Packet) -> Result<Control, ProtocolError> {
        let oid = packet
            .child(0)?
            .as_str()
            .map_err(|_| ProtocolError::InvalidUtf8("control type"))?;

        let mut criticality = false;
        let mut value = None;
        for child in &packet.children[1..] {
            if child.is(Class::Universal, tag::BOOLEAN) && value.is_none() {
                criticality = child.as_bool()?;
            } else if child.is(Class::Universal, tag::OCTET_STRING) && value.is_none() {
                value = Some(child.as_bytes());
            } else {
                return Err(invalid(oid, format!("unexpected tag {}", child.tag)));
            }
        }
        self.decode(oid, criticality, value)
    }

    /// Decodes the `[0] Controls` element of a message envelope.
    pub fn decode_controls(&self, packet: &Packet) -> Result<Vec<Control>, ProtocolError> {
        if !packet.is(Class::Context, 0) || !packet.constructed {
            return Err(ProtocolError::InvalidPacket);
        }
        packet
            .children
            .iter()
            .map(|child| self.decode_packet(child))
            .collect()
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Builds the `[0] Controls` element appended to a message envelope.
pub fn encode_controls(controls: &[Control]) -> Packet {
    let mut packet = Packet::context(0, "Controls");
    for control in controls {
        packet.append_child(control.encode());
    }
    packet
}

/// Returns the first control with the given type, if any.
pub fn find_control<'a>(controls: &'a [Control], oid: &str) -> Option<&'a Control> {
    controls.iter().find(|control| control.control_type() == oid)
}
