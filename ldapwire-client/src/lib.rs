//! # ldapwire-client
//!
//! Async LDAP client built on `ldapwire-protocol`.
//!
//! This crate provides:
//! - TCP and LDAPS transport with connect and request timeouts
//! - Many outstanding operations over one connection, routed by message id
//! - High-level bind, search, paged search, update and extended operations
//! - File and environment configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod stream;
pub mod tls;

pub use client::{Client, ModifyResult, SimpleBindResult};
pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionConfig, MessageStream};
pub use error::ClientError;
pub use stream::LdapStream;
pub use tls::TlsClientConfig;
