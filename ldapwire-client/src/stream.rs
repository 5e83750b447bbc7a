//! Transport stream: plain TCP or LDAPS.

use crate::error::ClientError;
use crate::tls::{build_connector, TlsClientConfig};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// A connection to a directory server, with or without TLS.
    #[project = LdapStreamProj]
    pub enum LdapStream {
        Plain { #[pin] stream: TcpStream },
        Ldaps { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl LdapStream {
    /// Opens a TCP connection to `addr` (`host:port`) and performs the TLS
    /// handshake when `tls` is enabled. Both steps share `timeout`.
    pub async fn connect(
        addr: &str,
        tls: Option<&TlsClientConfig>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        tokio::time::timeout(timeout, Self::connect_inner(addr, tls))
            .await
            .map_err(|_| {
                tracing::debug!(addr, "connect timed out");
                ClientError::Timeout
            })?
    }

    async fn connect_inner(addr: &str, tls: Option<&TlsClientConfig>) -> Result<Self, ClientError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true).ok();
        tracing::debug!(addr, "TCP connected");

        match tls.filter(|tls| tls.enabled) {
            Some(tls) => handshake(tcp, addr, tls).await,
            None => Ok(LdapStream::Plain { stream: tcp }),
        }
    }

    /// Runs a TLS handshake over an established plain connection, as done
    /// after a successful StartTLS request.
    pub async fn start_tls(
        self,
        addr: &str,
        tls: &TlsClientConfig,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let tcp = match self {
            LdapStream::Plain { stream } => stream,
            LdapStream::Ldaps { .. } => {
                return Err(ClientError::TlsConfig("connection is already encrypted".into()))
            }
        };
        tokio::time::timeout(timeout, handshake(tcp, addr, tls))
            .await
            .map_err(|_| {
                tracing::debug!(addr, "TLS handshake timed out");
                ClientError::Timeout
            })?
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, LdapStream::Ldaps { .. })
    }
}

async fn handshake(
    tcp: TcpStream,
    addr: &str,
    tls: &TlsClientConfig,
) -> Result<LdapStream, ClientError> {
    let (connector, server_name) = build_connector(tls, host_of(addr))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
    tracing::debug!(addr, "TLS handshake complete");
    Ok(LdapStream::Ldaps { stream })
}

/// Host part of `host:port`, with IPv6 brackets removed.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

impl AsyncRead for LdapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            LdapStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            LdapStreamProj::Ldaps { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            LdapStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            LdapStreamProj::Ldaps { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            LdapStreamProj::Plain { stream } => stream.poll_flush(cx),
            LdapStreamProj::Ldaps { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            LdapStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            LdapStreamProj::Ldaps { stream } => stream.poll_shutdown(cx),
        }
    }
}
