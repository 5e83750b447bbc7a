//! Client error types.
//!
//! Every variant renders as `LDAP Result Code <n> "<label>": <detail>`, so a
//! transport failure reads the same way as a directory refusal.

use crate::config::ConfigError;
use ldapwire_protocol::{describe_error, LdapError, ProtocolError, ResultCode, SearchResult};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{}", describe_error(ResultCode::ErrorNetwork, .0))]
    Io(#[from] std::io::Error),

    #[error("{}", describe_error(.0.result_code(), .0))]
    Protocol(#[from] ProtocolError),

    /// The server answered with a non-success result code.
    #[error("{0}")]
    Directory(#[from] LdapError),

    #[error("{}", describe_error(ResultCode::ErrorNetwork, "not connected"))]
    NotConnected,

    #[error("{}", describe_error(ResultCode::ErrorNetwork, "connection closed"))]
    ConnectionClosed,

    #[error("{}", describe_error(ResultCode::ErrorNetwork, "request timeout"))]
    Timeout,

    #[error("{}", describe_error(ResultCode::ErrorNetwork, format_args!("TLS configuration error: {}", .0)))]
    TlsConfig(String),

    #[error("{}", describe_error(ResultCode::ErrorNetwork, format_args!("TLS handshake failed: {}", .0)))]
    TlsHandshake(String),

    #[error("{}", describe_error(ResultCode::ErrorNetwork, .0))]
    Config(#[from] ConfigError),

    /// A paged search failed after some pages had arrived.
    #[error("{source}")]
    PartialSearch {
        /// Entries and referrals of the pages received before the failure.
        partial: Box<SearchResult>,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// The result code this error is reported under.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ClientError::Protocol(err) => err.result_code(),
            ClientError::Directory(err) => err.code,
            ClientError::PartialSearch { source, .. } => source.result_code(),
            _ => ResultCode::ErrorNetwork,
        }
    }

    /// The pages collected before a paged search failed, if any.
    pub fn partial_result(&self) -> Option<&SearchResult> {
        match self {
            ClientError::PartialSearch { partial, .. } => Some(&**partial),
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Directory(err) => {
                matches!(err.code, ResultCode::Busy | ResultCode::Unavailable)
            }
            ClientError::PartialSearch { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
