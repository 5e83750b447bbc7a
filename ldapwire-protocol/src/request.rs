//! Request operations other than search and modify.

use crate::ber::{Class, Packet};
use crate::control::Control;
use crate::entry::Attribute;
use crate::error::ProtocolError;
use crate::message::{application, Request};
use crate::LDAP_VERSION;
use bytes::Bytes;

/// OID of the password modify extended operation (RFC 3062).
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";

/// OID of the StartTLS extended operation (RFC 4511 §4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// OID of the "Who am I?" extended operation (RFC 4532).
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// `[APPLICATION 0] BindRequest` with simple authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleBindRequest {
    pub username: String,
    pub password: String,
    pub controls: Vec<Control>,
    /// An empty password turns a bind into an unauthenticated one, which
    /// most servers accept without checking anything. Refused unless set.
    pub allow_empty_password: bool,
}

impl SimpleBindRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            controls: Vec::new(),
            allow_empty_password: false,
        }
    }

    /// Bind with a name and no password (RFC 4513 §5.1.2).
    pub fn unauthenticated(username: impl Into<String>) -> Self {
        Self {
            allow_empty_password: true,
            ..Self::new(username, "")
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }
}

impl Request for SimpleBindRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        if self.password.is_empty() && !self.allow_empty_password {
            return Err(ProtocolError::MissingField("password"));
        }
        Ok(
            Packet::application(application::BIND_REQUEST, "Bind Request")
                .with_child(Packet::integer(LDAP_VERSION, "Version"))
                .with_child(Packet::string(&self.username, "User Name"))
                .with_child(Packet::context_primitive(
                    0,
                    self.password.clone().into_bytes(),
                    "Password",
                )),
        )
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// SASL `EXTERNAL` bind: identity comes from the TLS client certificate or
/// the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslExternalBindRequest {
    pub controls: Vec<Control>,
}

impl Request for SaslExternalBindRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let sasl = Packet::context(3, "authentication")
            .with_child(Packet::string("EXTERNAL", "SASL Mech"))
            .with_child(Packet::string("", "SASL Cred"));
        Ok(
            Packet::application(application::BIND_REQUEST, "Bind Request")
                .with_child(Packet::integer(LDAP_VERSION, "Version"))
                .with_child(Packet::string("", "User Name"))
                .with_child(sasl),
        )
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnbindRequest;

impl Request for UnbindRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::primitive(
            Class::Application,
            application::UNBIND_REQUEST,
            Bytes::new(),
            "Unbind Request",
        ))
    }

    fn expects_response(&self) -> bool {
        false
    }
}

/// `[APPLICATION 8] AddRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
    pub controls: Vec<Control>,
}

impl AddRequest {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn attribute(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.attributes.push(Attribute::new(name, values));
        self
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }
}

impl Request for AddRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let mut attributes = Packet::sequence("Attributes");
        for attribute in &self.attributes {
            attributes.append_child(attribute.encode());
        }
        Ok(
            Packet::application(application::ADD_REQUEST, "Add Request")
                .with_child(Packet::string(&self.dn, "DN"))
                .with_child(attributes),
        )
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// `[APPLICATION 10] DelRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub dn: String,
    pub controls: Vec<Control>,
}

impl DelRequest {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }
}

impl Request for DelRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::primitive(
            Class::Application,
            application::DEL_REQUEST,
            self.dn.clone().into_bytes(),
            "Del Request",
        ))
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// `[APPLICATION 12] ModifyDNRequest`: rename and/or move an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    /// Moves the entry under this parent when set.
    pub new_superior: Option<String>,
    pub controls: Vec<Control>,
}

impl ModifyDnRequest {
    pub fn new(
        dn: impl Into<String>,
        new_rdn: impl Into<String>,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    ) -> Self {
        Self {
            dn: dn.into(),
            new_rdn: new_rdn.into(),
            delete_old_rdn,
            new_superior,
            controls: Vec::new(),
        }
    }
}

impl Request for ModifyDnRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let mut packet = Packet::application(application::MODIFY_DN_REQUEST, "Modify DN Request")
            .with_child(Packet::string(&self.dn, "DN"))
            .with_child(Packet::string(&self.new_rdn, "New RDN"))
            .with_child(Packet::boolean(self.delete_old_rdn, "Delete old RDN"));
        if let Some(superior) = &self.new_superior {
            packet.append_child(Packet::context_primitive(
                0,
                superior.clone().into_bytes(),
                "New Superior",
            ));
        }
        Ok(packet)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// `[APPLICATION 14] CompareRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: String,
    pub controls: Vec<Control>,
}

impl CompareRequest {
    pub fn new(
        dn: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            dn: dn.into(),
            attribute: attribute.into(),
            value: value.into(),
            controls: Vec::new(),
        }
    }
}

impl Request for CompareRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let assertion = Packet::sequence("AttributeValueAssertion")
            .with_child(Packet::string(&self.attribute, "AttributeDesc"))
            .with_child(Packet::string(&self.value, "AssertionValue"));
        Ok(
            Packet::application(application::COMPARE_REQUEST, "Compare Request")
                .with_child(Packet::string(&self.dn, "DN"))
                .with_child(assertion),
        )
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// `[APPLICATION 16] AbandonRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbandonRequest {
    pub message_id: i32,
}

impl Request for AbandonRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::primitive(
            Class::Application,
            application::ABANDON_REQUEST,
            crate::ber::encode_integer(i64::from(self.message_id)),
            "Abandon Request",
        ))
    }

    fn expects_response(&self) -> bool {
        false
    }
}

/// `[APPLICATION 23] ExtendedRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Bytes>,
    pub controls: Vec<Control>,
}

impl ExtendedRequest {
    pub fn new(name: impl Into<String>, value: Option<Bytes>) -> Self {
        Self {
            name: name.into(),
            value,
            controls: Vec::new(),
        }
    }
}

impl Request for ExtendedRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let mut packet = Packet::application(application::EXTENDED_REQUEST, "Extended Request")
            .with_child(Packet::context_primitive(
                0,
                self.name.clone().into_bytes(),
                "Request Name",
            ));
        if let Some(value) = &self.value {
            packet.append_child(Packet::context_primitive(1, value.clone(), "Request Value"));
        }
        Ok(packet)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// Password modify extended operation.
///
/// Every field is optional: an empty identity means the bound user, an
/// empty new password asks the server to generate one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordModifyRequest {
    pub user_identity: String,
    pub old_password: String,
    pub new_password: String,
    pub controls: Vec<Control>,
}

impl PasswordModifyRequest {
    pub fn new(
        user_identity: impl Into<String>,
        old_password: impl Into<String>,
        new_password: impl Into<String>,
    ) -> Self {
        Self {
            user_identity: user_identity.into(),
            old_password: old_password.into(),
            new_password: new_password.into(),
            controls: Vec::new(),
        }
    }

    fn value(&self) -> Packet {
        let mut value = Packet::sequence("Password Modify Request");
        let fields = [
            (0, &self.user_identity, "User Identity"),
            (1, &self.old_password, "Old Password"),
            (2, &self.new_password, "New Password"),
        ];
        for (tag, field, description) in fields {
            if !field.is_empty() {
                value.append_child(Packet::context_primitive(
                    tag,
                    field.clone().into_bytes(),
                    description,
                ));
            }
        }
        value
    }
}

impl Request for PasswordModifyRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        ExtendedRequest::new(PASSWORD_MODIFY_OID, Some(self.value().encode().freeze())).encode()
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// Reply to a password modify request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordModifyResult {
    /// Set when the server generated the new password.
    pub generated_password: Option<String>,
}

impl PasswordModifyResult {
    /// Decodes the `responseValue` of the extended response.
    pub fn decode(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let Some(value) = value else {
            return Ok(Self::default());
        };
        let (packet, _) = Packet::decode(value)?;
        let generated_password = packet
            .children
            .iter()
            .find(|child| child.is(Class::Context, 0))
            .map(|child| {
                child
                    .as_str()
                    .map(str::to_string)
                    .map_err(|_| ProtocolError::InvalidUtf8("generated password"))
            })
            .transpose()?;
        Ok(Self { generated_password })
    }
}

/// Asks the server to begin a TLS handshake on the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartTlsRequest {
    pub controls: Vec<Control>,
}

impl Request for StartTlsRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        ExtendedRequest::new(START_TLS_OID, None).encode()
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoAmIRequest {
    pub controls: Vec<Control>,
}

impl WhoAmIRequest {
    pub fn new(controls: Vec<Control>) -> Self {
        Self { controls }
    }
}

impl Request for WhoAmIRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        ExtendedRequest::new(WHO_AM_I_OID, None).encode()
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// Reply to a "Who am I?" request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoAmIResult {
    /// `dn:<DN>` or `u:<user>`; empty for an anonymous session.
    pub authz_id: String,
}

impl WhoAmIResult {
    /// The `responseValue` is the authzId itself, not a BER value.
    pub fn decode(value: Option<&[u8]>) -> Self {
        Self {
            authz_id: value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default(),
        }
    }
}
