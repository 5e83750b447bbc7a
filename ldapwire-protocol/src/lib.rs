//! # ldapwire-protocol
//!
//! LDAPv3 protocol engine (RFC 4511).
//!
//! This crate provides:
//! - BER packet encoding and decoding
//! - The search filter compiler (RFC 4515 text to wire form and back)
//! - Result codes and the uniform error model
//! - The control registry with the built-in control kinds
//! - Typed requests and responses, search entries and paged search state
//! - Stream framing for messages
//!
//! Nothing here performs I/O.

pub mod ber;
pub mod codec;
pub mod control;
pub mod entry;
pub mod error;
pub mod filter;
pub mod message;
pub mod modify;
pub mod paging;
pub mod request;
pub mod result;
pub mod search;

pub use ber::{Class, Packet};
pub use codec::{Decoder, Encoder};
pub use control::{
    encode_controls, find_control, Control, ControlBeheraPasswordPolicy, ControlDecoder,
    ControlKind, ControlManageDsaIt, ControlPaging, ControlRegistry, ControlString,
    ControlVChuPasswordMustChange, ControlVChuPasswordWarning, CONTROL_TYPE_BEHERA_PASSWORD_POLICY,
    CONTROL_TYPE_MANAGE_DSA_IT, CONTROL_TYPE_PAGING, CONTROL_TYPE_VCHU_PASSWORD_MUST_CHANGE,
    CONTROL_TYPE_VCHU_PASSWORD_WARNING,
};
pub use entry::{Attribute, Entry, EntryAttribute};
pub use error::{describe_error, LdapError, ProtocolError};
pub use filter::{compile_filter, decompile_filter, escape_filter_value, Filter};
pub use message::{
    check_result, decode_result_code, encode_message, LdapResult, Request, Response, ResponseOp,
};
pub use modify::{classify, Change, ChangeOperation, ModifyRequest};
pub use paging::{PagedSearch, PagingState};
pub use request::{
    AbandonRequest, AddRequest, CompareRequest, DelRequest, ExtendedRequest, ModifyDnRequest,
    PasswordModifyRequest, PasswordModifyResult, SaslExternalBindRequest, SimpleBindRequest,
    StartTlsRequest, UnbindRequest, WhoAmIRequest, WhoAmIResult, PASSWORD_MODIFY_OID,
    START_TLS_OID, WHO_AM_I_OID,
};
pub use result::{describe, ResultCode};
pub use search::{DerefAliases, Scope, SearchRequest, SearchResult, MAX_INT};

/// Protocol version sent in bind requests.
pub const LDAP_VERSION: i64 = 3;

/// Default port for plain LDAP.
pub const DEFAULT_PORT: u16 = 389;

/// Default port for LDAP over TLS.
pub const DEFAULT_TLS_PORT: u16 = 636;

/// Maximum accepted message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
