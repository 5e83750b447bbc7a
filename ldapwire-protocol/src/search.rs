//! Search request and the aggregated search result.

use crate::ber::{tag, Class, Packet};
use crate::control::Control;
use crate::entry::Entry;
use crate::error::ProtocolError;
use crate::filter::{decompile_filter, Filter, DEFAULT_MAX_FILTER_DEPTH};
use crate::message::{application, LdapResult, Request, Response, ResponseOp};
use std::fmt;

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    BaseObject = 0,
    SingleLevel = 1,
    #[default]
    WholeSubtree = 2,
}

impl Scope {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Scope::BaseObject),
            1 => Some(Scope::SingleLevel),
            2 => Some(Scope::WholeSubtree),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::BaseObject => "Base Object",
            Scope::SingleLevel => "Single Level",
            Scope::WholeSubtree => "Whole Subtree",
        })
    }
}

/// Alias dereferencing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl DerefAliases {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(DerefAliases::Never),
            1 => Some(DerefAliases::InSearching),
            2 => Some(DerefAliases::FindingBaseObj),
            3 => Some(DerefAliases::Always),
            _ => None,
        }
    }
}

impl fmt::Display for DerefAliases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DerefAliases::Never => "NeverDerefAliases",
            DerefAliases::InSearching => "DerefInSearching",
            DerefAliases::FindingBaseObj => "DerefFindingBaseObj",
            DerefAliases::Always => "DerefAlways",
        })
    }
}

/// `[APPLICATION 3] SearchRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: Scope,
    pub deref_aliases: DerefAliases,
    /// Maximum entries to return; 0 means no client-side limit.
    /// Encoded values are capped at [`MAX_INT`].
    pub size_limit: u32,
    /// Seconds the server may spend; 0 means no client-side limit.
    /// Encoded values are capped at [`MAX_INT`].
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: String,
    /// Attributes to return; empty means all user attributes.
    pub attributes: Vec<String>,
    pub controls: Vec<Control>,
    /// Nesting limit for the filter compiler. `None` uses the connection's
    /// limit when sent through a client, otherwise [`DEFAULT_MAX_FILTER_DEPTH`].
    pub filter_depth_limit: Option<usize>,
}

/// Largest value of the protocol's `INTEGER (0 .. maxInt)`.
pub const MAX_INT: u32 = i32::MAX as u32;

fn decode_limit(packet: &Packet) -> Result<u32, ProtocolError> {
    u32::try_from(packet.as_int()?)
        .ok()
        .filter(|&limit| limit <= MAX_INT)
        .ok_or(ProtocolError::InvalidPacket)
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: Scope::default(),
            deref_aliases: DerefAliases::default(),
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes: Vec::new(),
            controls: Vec::new(),
            filter_depth_limit: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_deref_aliases(mut self, deref_aliases: DerefAliases) -> Self {
        self.deref_aliases = deref_aliases;
        self
    }

    pub fn with_size_limit(mut self, size_limit: u32) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn with_time_limit(mut self, time_limit: u32) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn with_types_only(mut self, types_only: bool) -> Self {
        self.types_only = types_only;
        self
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.controls.push(control);
        self
    }

    pub fn with_filter_depth_limit(mut self, limit: usize) -> Self {
        self.filter_depth_limit = Some(limit);
        self
    }

    /// Reads a search request sent by a client.
    ///
    /// The filter is rendered back to text, so a filter the grammar cannot
    /// express fails with [`ProtocolError::FilterDecompile`].
    pub fn decode(op: &Packet) -> Result<Self, ProtocolError> {
        if !op.is(Class::Application, application::SEARCH_REQUEST) {
            return Err(ProtocolError::UnexpectedOperation(op.tag));
        }
        let [base_dn, scope, deref, size, time, types_only, filter, attributes] =
            op.children.as_slice()
        else {
            return Err(ProtocolError::InvalidPacket);
        };

        let scope = Scope::from_i64(scope.as_int()?).ok_or(ProtocolError::InvalidPacket)?;
        let deref_aliases =
            DerefAliases::from_i64(deref.as_int()?).ok_or(ProtocolError::InvalidPacket)?;
        let size_limit = decode_limit(size)?;
        let time_limit = decode_limit(time)?;
        if !attributes.is(Class::Universal, tag::SEQUENCE) {
            return Err(ProtocolError::InvalidPacket);
        }

        Ok(Self {
            base_dn: base_dn
                .as_str()
                .map_err(|_| ProtocolError::InvalidUtf8("base DN"))?
                .to_string(),
            scope,
            deref_aliases,
            size_limit,
            time_limit,
            types_only: types_only.as_bool()?,
            filter: decompile_filter(filter)?,
            attributes: attributes
                .children
                .iter()
                .map(Packet::as_string_lossy)
                .collect(),
            controls: Vec::new(),
            filter_depth_limit: None,
        })
    }
}

impl Request for SearchRequest {
    fn encode(&self) -> Result<Packet, ProtocolError> {
        let depth = self.filter_depth_limit.unwrap_or(DEFAULT_MAX_FILTER_DEPTH);
        let filter = Filter::parse_with_depth(&self.filter, depth)?.to_packet()?;

        let mut attributes = Packet::sequence("Attributes");
        for attribute in &self.attributes {
            attributes.append_child(Packet::string(attribute, "Attribute"));
        }

        Ok(
            Packet::application(application::SEARCH_REQUEST, "Search Request")
                .with_child(Packet::string(&self.base_dn, "Base DN"))
                .with_child(Packet::enumerated(self.scope as i64, "Scope"))
                .with_child(Packet::enumerated(self.deref_aliases as i64, "Deref Aliases"))
                .with_child(Packet::integer(i64::from(self.size_limit.min(MAX_INT)), "Size Limit"))
                .with_child(Packet::integer(i64::from(self.time_limit.min(MAX_INT)), "Time Limit"))
                .with_child(Packet::boolean(self.types_only, "Types Only"))
                .with_child(filter)
                .with_child(attributes),
        )
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }
}

/// Everything returned for one search operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    pub entries: Vec<Entry>,
    pub referrals: Vec<String>,
    /// Controls attached to the search-done message.
    pub controls: Vec<Control>,
}

impl SearchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one response into the result.
    ///
    /// Returns the final `LDAPResult` once the search-done message arrives.
    pub fn accumulate(&mut self, response: Response) -> Result<Option<LdapResult>, ProtocolError> {
        match response.op {
            ResponseOp::SearchEntry(entry) => {
                self.entries.push(entry);
                Ok(None)
            }
            ResponseOp::SearchReference(uris) => {
                self.referrals.extend(uris);
                Ok(None)
            }
            ResponseOp::Intermediate { .. } => Ok(None),
            ResponseOp::SearchDone(result) => {
                self.controls = response.controls;
                Ok(Some(result))
            }
            other => Err(ProtocolError::UnexpectedOperation(other.tag())),
        }
    }

    /// Appends the entries and referrals of a later page.
    pub fn append(&mut self, page: SearchResult) {
        self.entries.extend(page.entries);
        self.referrals.extend(page.referrals);
        self.controls = page.controls;
    }

    pub fn pretty(&self, indent: usize) -> String {
        self.entries.iter().map(|entry| entry.pretty(indent)).collect()
    }
}

impl fmt::Display for SearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{find_control, CONTROL_TYPE_PAGING};
    use crate::entry::EntryAttribute;
    use crate::message::encode_message;
    use crate::result::ResultCode;

    #[test]
    fn test_encoding_order() {
        let request = SearchRequest::new("dc=example,dc=com", "(&(objectClass=person)(uid=bob))")
            .with_scope(Scope::SingleLevel)
            .with_deref_aliases(DerefAliases::Always)
            .with_size_limit(10)
            .with_time_limit(30)
            .with_types_only(true)
            .with_attributes(["cn", "mail"]);

        let packet = request.encode().unwrap();
        assert!(packet.is(Class::Application, application::SEARCH_REQUEST));
        let c = &packet.children;
        assert_eq!(c.len(), 8);
        assert_eq!(c[0].as_str().unwrap(), "dc=example,dc=com");
        assert!(c[1].is(Class::Universal, tag::ENUMERATED));
        assert_eq!(c[1].as_int().unwrap(), 1);
        assert_eq!(c[2].as_int().unwrap(), 3);
        assert!(c[3].is(Class::Universal, tag::INTEGER));
        assert_eq!(c[3].as_int().unwrap(), 10);
        assert_eq!(c[4].as_int().unwrap(), 30);
        assert!(c[5].as_bool().unwrap());
        assert!(c[6].is(Class::Context, 0));
        assert_eq!(c[7].children.len(), 2);
        assert_eq!(c[7].children[1].as_str().unwrap(), "mail");
    }

    #[test]
    fn test_empty_attribute_selection() {
        let packet = SearchRequest::new("", "(objectClass=*)").encode().unwrap();
        assert!(packet.children[7].is(Class::Universal, tag::SEQUENCE));
        assert!(packet.children[7].children.is_empty());
    }

    #[test]
    fn test_bad_filter_fails_whole_request() {
        let request = SearchRequest::new("dc=example", "(&(cn=a)");
        let err = encode_message(1, &request).unwrap_err();
        assert!(matches!(err, ProtocolError::FilterCompile(_)));
        assert_eq!(err.result_code(), ResultCode::ErrorFilterCompile);
    }

    #[test]
    fn test_filter_depth_limit() {
        let request = SearchRequest::new("", "(!(!(cn=a)))").with_filter_depth_limit(2);
        assert!(request.encode().is_err());
        assert!(request.with_filter_depth_limit(3).encode().is_ok());

        let request = SearchRequest::new("", "(cn=a)");
        assert_eq!(request.filter_depth_limit, None);
        assert_eq!(
            request.with_filter_depth_limit(DEFAULT_MAX_FILTER_DEPTH).filter_depth_limit,
            Some(100)
        );
    }

    #[test]
    fn test_limits_capped_at_max_int() {
        let request = SearchRequest::new("", "(cn=a)")
            .with_size_limit(u32::MAX)
            .with_time_limit(MAX_INT + 1);
        let packet = request.encode().unwrap();
        assert_eq!(packet.children[3].as_int().unwrap(), i64::from(i32::MAX));
        assert_eq!(packet.children[4].as_int().unwrap(), i64::from(i32::MAX));

        let decoded = SearchRequest::decode(&packet).unwrap();
        assert_eq!(decoded.size_limit, MAX_INT);

        let mut oversized = packet.clone();
        oversized.children[3] = Packet::integer(i64::from(u32::MAX), "Size Limit");
        assert!(matches!(
            SearchRequest::decode(&oversized),
            Err(ProtocolError::InvalidPacket)
        ));
    }

    #[test]
    fn test_controls_are_envelope_sibling() {
        let request = SearchRequest::new("", "(cn=a)").with_control(Control::paging(5));
        let packet = encode_message(2, &request).unwrap();
        assert_eq!(packet.children.len(), 3);
        assert_eq!(packet.children[1].children.len(), 8);
        assert!(packet.children[2].is(Class::Context, 0));
    }

    #[test]
    fn test_server_side_decode() {
        let request = SearchRequest::new("ou=people,dc=example", "(|(cn=a*)(sn=\\2a))")
            .with_scope(Scope::BaseObject)
            .with_attributes(["cn"]);
        let (packet, _) = Packet::decode(&request.encode().unwrap().encode()).unwrap();

        let decoded = SearchRequest::decode(&packet).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_server_side_decode_bad_filter() {
        let mut packet = SearchRequest::new("", "(cn=a)").encode().unwrap();
        packet.children[6] = Packet::context(15, "Bogus");
        assert!(matches!(
            SearchRequest::decode(&packet),
            Err(ProtocolError::FilterDecompile(_))
        ));

        let mut packet = SearchRequest::new("", "(cn=a)").encode().unwrap();
        packet.children[1] = Packet::enumerated(7, "Scope");
        assert_eq!(
            SearchRequest::decode(&packet).unwrap_err(),
            ProtocolError::InvalidPacket
        );
    }

    #[test]
    fn test_accumulate() {
        let mut result = SearchResult::new();
        let entry = Entry::new("cn=a", vec![EntryAttribute::new("cn", vec!["a".into()])]);

        let step = result
            .accumulate(Response::new(1, ResponseOp::SearchEntry(entry.clone())))
            .unwrap();
        assert!(step.is_none());
        result
            .accumulate(Response::new(
                1,
                ResponseOp::SearchReference(vec!["ldap://b/".into()]),
            ))
            .unwrap();

        let done = Response::new(1, ResponseOp::SearchDone(LdapResult::success()))
            .with_controls(vec![Control::paging(0)]);
        let last = result.accumulate(done).unwrap().unwrap();
        assert!(last.is_success());

        assert_eq!(result.entries, vec![entry]);
        assert_eq!(result.referrals, vec!["ldap://b/"]);
        assert!(find_control(&result.controls, CONTROL_TYPE_PAGING).is_some());

        let wrong = Response::new(1, ResponseOp::Add(LdapResult::success()));
        assert_eq!(
            result.accumulate(wrong).unwrap_err(),
            ProtocolError::UnexpectedOperation(application::ADD_RESPONSE)
        );
    }

    #[test]
    fn test_append_pages() {
        let mut all = SearchResult::new();
        for dn in ["cn=a", "cn=b"] {
            all.append(SearchResult {
                entries: vec![Entry::new(dn, vec![])],
                referrals: vec![],
                controls: vec![],
            });
        }
        assert_eq!(all.entries.len(), 2);
        assert_eq!(all.to_string(), "DN: cn=a\nDN: cn=b\n");
    }

    #[test]
    fn test_enum_names() {
        assert_eq!(Scope::default(), Scope::WholeSubtree);
        assert_eq!(Scope::from_i64(1), Some(Scope::SingleLevel));
        assert_eq!(Scope::from_i64(3), None);
        assert_eq!(DerefAliases::FindingBaseObj.to_string(), "DerefFindingBaseObj");
        assert_eq!(DerefAliases::from_i64(3), Some(DerefAliases::Always));
    }
}
