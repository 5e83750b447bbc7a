//! Protocol error types.

use crate::result::ResultCode;
use std::fmt;
use thiserror::Error;

/// Errors raised while encoding requests or decoding peer messages.
///
/// None of these involve I/O: encode-time variants fail before any byte is
/// written, decode-time variants abort the single message being decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid packet format")]
    InvalidPacket,

    #[error("truncated BER data: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("invalid BER length encoding")]
    InvalidLength,

    #[error("indefinite BER length is not allowed in LDAP")]
    IndefiniteLength,

    #[error("BER tag number too large")]
    TagTooLarge,

    #[error("BER nesting deeper than {max} levels")]
    NestingTooDeep { max: usize },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid BER integer of {len} bytes")]
    InvalidInteger { len: usize },

    #[error("invalid BER boolean")]
    InvalidBoolean,

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unexpected protocol operation: application tag {0}")]
    UnexpectedOperation(u32),

    #[error("unsupported modify operation: {0}")]
    UnsupportedChangeOperation(i64),

    #[error("invalid {oid} control: {reason}")]
    InvalidControl { oid: String, reason: String },

    #[error("filter compile error: {0}")]
    FilterCompile(String),

    #[error("filter decompile error: {0}")]
    FilterDecompile(String),

    #[error("paging out of order: {0}")]
    InvalidPagingState(&'static str),
}

impl ProtocolError {
    /// Maps the error onto the shared result code enumeration.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ProtocolError::FilterCompile(_) => ResultCode::ErrorFilterCompile,
            ProtocolError::FilterDecompile(_) => ResultCode::ErrorFilterDecompile,
            _ => ResultCode::ErrorNetwork,
        }
    }
}

/// A result code paired with the diagnostic text that explains it.
///
/// This is what a well-formed response carrying a non-success code turns
/// into, and what every other failure can be rendered as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapError {
    pub code: ResultCode,
    pub message: String,
}

impl LdapError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ProtocolError> for LdapError {
    fn from(err: ProtocolError) -> Self {
        Self::new(err.result_code(), err.to_string())
    }
}

impl fmt::Display for LdapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe_error(self.code, &self.message))
    }
}

impl std::error::Error for LdapError {}

/// Renders `LDAP Result Code <n> "<label>": <detail>`.
pub fn describe_error(code: ResultCode, detail: impl fmt::Display) -> String {
    format!(
        "LDAP Result Code {} {:?}: {}",
        code.code(),
        code.description(),
        detail
    )
}
