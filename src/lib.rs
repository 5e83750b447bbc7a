//! # ldapwire
//!
//! LDAPv3 client engine.
//!
//! - [`protocol`]: filter compiler, result codes, controls, typed requests
//!   and responses, entries, paging and message framing. No I/O.
//! - [`client`]: async client over TCP or LDAPS.
//!
//! ```no_run
//! use ldapwire::client::{Client, ConnectionConfig};
//! use ldapwire::protocol::SearchRequest;
//!
//! # async fn run() -> Result<(), ldapwire::client::ClientError> {
//! let client = Client::new(ConnectionConfig::new("ldap.example.com:389"));
//! client.connect().await?;
//! client.bind("cn=admin,dc=example,dc=com", "secret").await?;
//!
//! let request = SearchRequest::new("dc=example,dc=com", "(&(objectClass=person)(cn=a*))")
//!     .with_attributes(["cn", "mail"]);
//! let result = client.search_with_paging(request, 500).await?;
//! for entry in &result.entries {
//!     println!("{}", entry);
//! }
//! client.unbind().await?;
//! # Ok(())
//! # }
//! ```

pub use ldapwire_client as client;
pub use ldapwire_protocol as protocol;

pub use ldapwire_client::{Client, ClientConfig, ClientError, ConnectionConfig};
pub use ldapwire_protocol::{
    compile_filter, decompile_filter, escape_filter_value, Control, ControlRegistry, Entry,
    LdapError, ProtocolError, ResultCode, SearchRequest, SearchResult,
};
