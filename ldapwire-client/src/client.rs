//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::tls::TlsClientConfig;
use ldapwire_protocol::{
    AbandonRequest, AddRequest, CompareRequest, Control, ControlRegistry, DelRequest,
    ExtendedRequest, LdapError, ModifyDnRequest, ModifyRequest, PagedSearch,
    PasswordModifyRequest, PasswordModifyResult, ProtocolError, Request, Response, ResponseOp,
    ResultCode, SaslExternalBindRequest, SearchRequest, SearchResult, SimpleBindRequest,
    StartTlsRequest, UnbindRequest, WhoAmIRequest, WhoAmIResult,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Controls returned with a successful bind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleBindResult {
    pub controls: Vec<Control>,
}

/// Controls returned with a successful modify.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyResult {
    pub controls: Vec<Control>,
}

/// High-level client for an LDAP directory.
pub struct Client {
    conn: Arc<Connection>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::from_connection(Connection::new(config))
    }

    /// Creates a client whose response controls are decoded by `registry`.
    pub fn with_registry(config: ConnectionConfig, registry: Arc<ControlRegistry>) -> Self {
        Self::from_connection(Connection::with_registry(config, registry))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
            read_task: Mutex::new(None),
        }
    }

    /// Connects to the server and starts the background read loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;
        self.spawn_read_loop();
        Ok(())
    }

    fn spawn_read_loop(&self) {
        let conn = self.conn.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                tracing::debug!("read loop ended: {}", e);
            }
        });
        if let Some(previous) = self.replace_read_task(Some(handle)) {
            previous.abort();
        }
    }

    /// Upgrades a plain connection to TLS with the StartTLS extended
    /// operation. No other operation may be outstanding.
    ///
    /// If the server refuses, the connection stays usable in the clear. If
    /// the handshake fails, the connection is closed.
    pub async fn start_tls(&self, tls: &TlsClientConfig) -> Result<(), ClientError> {
        if self.conn.is_tls() {
            return Err(ClientError::TlsConfig("connection is already encrypted".into()));
        }
        let outstanding = self.conn.outstanding().await;
        if outstanding > 0 {
            return Err(ClientError::TlsConfig(format!(
                "{} operations outstanding",
                outstanding
            )));
        }

        self.request(&StartTlsRequest::default()).await?;

        self.conn.pause_reading().await;
        if let Some(handle) = self.replace_read_task(None) {
            if let Err(e) = handle.await {
                tracing::debug!("read loop task failed: {}", e);
            }
        }
        self.conn.upgrade_tls(tls).await?;
        self.spawn_read_loop();
        Ok(())
    }

    fn replace_read_task(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        match self.read_task.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, handle),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), handle),
        }
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Closes the connection without unbinding.
    pub async fn close(&self) -> Result<(), ClientError> {
        let result = self.conn.close().await;
        if let Some(handle) = self.replace_read_task(None) {
            handle.abort();
        }
        result
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    /// Sends `request` and turns a non-success result into an error.
    async fn request(&self, request: &dyn Request) -> Result<Response, ClientError> {
        let response = self.conn.request(request).await?;
        if let Some(result) = response.result() {
            if !result.is_success() {
                return Err(LdapError::new(result.code, result.message.clone()).into());
            }
        }
        Ok(response)
    }

    // =========================================================================
    // Bind operations
    // =========================================================================

    /// Performs a simple bind. An empty password is refused locally; use
    /// [`unauthenticated_bind`](Self::unauthenticated_bind) for that.
    pub async fn bind(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.simple_bind(&SimpleBindRequest::new(username, password))
            .await
            .map(|_| ())
    }

    /// Performs an unauthenticated bind (RFC 4513 §5.1.2).
    pub async fn unauthenticated_bind(&self, username: &str) -> Result<(), ClientError> {
        self.simple_bind(&SimpleBindRequest::unauthenticated(username))
            .await
            .map(|_| ())
    }

    /// Performs a simple bind and returns the response controls, such as a
    /// password policy warning.
    pub async fn simple_bind(
        &self,
        request: &SimpleBindRequest,
    ) -> Result<SimpleBindResult, ClientError> {
        let response = self.request(request).await?;
        Ok(SimpleBindResult {
            controls: response.controls,
        })
    }

    /// Binds with SASL EXTERNAL, using the identity established by the
    /// transport (usually the TLS client certificate).
    pub async fn external_bind(&self) -> Result<(), ClientError> {
        self.request(&SaslExternalBindRequest::default()).await?;
        Ok(())
    }

    /// Sends an unbind request and closes the connection.
    pub async fn unbind(&self) -> Result<(), ClientError> {
        let sent = self.conn.send_only(&UnbindRequest).await;
        self.close().await?;
        sent.map(|_| ())
    }

    // =========================================================================
    // Search operations
    // =========================================================================

    /// Runs a search and collects every entry and referral.
    pub async fn search(&self, mut request: SearchRequest) -> Result<SearchResult, ClientError> {
        if request.filter_depth_limit.is_none() {
            request.filter_depth_limit = Some(self.conn.config().filter_depth_limit);
        }

        let mut stream = self.conn.request_stream(&request).await?;
        let mut result = SearchResult::new();
        while let Some(response) = stream.next().await {
            if let Some(done) = result.accumulate(response?)? {
                done.into_result()?;
                return Ok(result);
            }
        }
        Err(ClientError::ConnectionClosed)
    }

    /// Runs a search one page at a time using the simple paged results
    /// control and concatenates the pages.
    ///
    /// When a page fails after the server handed out a cookie, a
    /// page-size-zero request is sent to release the server-side cursor.
    /// A failure after the first page is returned as
    /// [`ClientError::PartialSearch`] carrying the pages received so far.
    pub async fn search_with_paging(
        &self,
        request: SearchRequest,
        page_size: u32,
    ) -> Result<SearchResult, ClientError> {
        let mut paging = PagedSearch::new(request, page_size);
        let mut result = SearchResult::new();

        while !paging.is_done() {
            let page_request = paging.next_request()?;
            let page = match self.search(page_request).await {
                Ok(page) => page,
                Err(err) => {
                    if !paging.cookie().is_empty() {
                        tracing::debug!("abandoning paged search after error: {}", err);
                        if let Err(abandon_err) = self.search(paging.abandon_request()).await {
                            tracing::debug!("abandon request failed: {}", abandon_err);
                        }
                    }
                    if paging.pages() == 0 {
                        return Err(err);
                    }
                    return Err(ClientError::PartialSearch {
                        partial: Box::new(result),
                        source: Box::new(err),
                    });
                }
            };
            paging.mark_sent()?;
            paging.handle_page(&page.controls)?;
            tracing::debug!(
                page = paging.pages(),
                entries = page.entries.len(),
                "received search page"
            );
            result.append(page);
        }
        Ok(result)
    }

    // =========================================================================
    // Update operations
    // =========================================================================

    pub async fn add(&self, request: &AddRequest) -> Result<(), ClientError> {
        self.request(request).await?;
        Ok(())
    }

    pub async fn del(&self, request: &DelRequest) -> Result<(), ClientError> {
        self.request(request).await?;
        Ok(())
    }

    pub async fn modify(&self, request: &ModifyRequest) -> Result<(), ClientError> {
        self.request(request).await?;
        Ok(())
    }

    /// Like [`modify`](Self::modify), also returning the response controls.
    pub async fn modify_with_result(
        &self,
        request: &ModifyRequest,
    ) -> Result<ModifyResult, ClientError> {
        let response = self.request(request).await?;
        Ok(ModifyResult {
            controls: response.controls,
        })
    }

    /// Renames or moves an entry.
    pub async fn modify_dn(&self, request: &ModifyDnRequest) -> Result<(), ClientError> {
        self.request(request).await?;
        Ok(())
    }

    /// Checks whether the entry at `dn` holds `value` for `attribute`.
    pub async fn compare(
        &self,
        dn: &str,
        attribute: &str,
        value: &str,
    ) -> Result<bool, ClientError> {
        let response = self
            .conn
            .request(&CompareRequest::new(dn, attribute, value))
            .await?;
        let result = response
            .result()
            .ok_or(ProtocolError::UnexpectedOperation(response.op.tag()))?;
        match result.code {
            ResultCode::CompareTrue => Ok(true),
            ResultCode::CompareFalse => Ok(false),
            code => Err(LdapError::new(code, result.message.clone()).into()),
        }
    }

    // =========================================================================
    // Extended operations
    // =========================================================================

    /// Sends an extended request and returns the raw response.
    pub async fn extended(&self, request: &ExtendedRequest) -> Result<Response, ClientError> {
        self.request(request).await
    }

    /// Changes a password. When the request leaves the new password empty
    /// the server generates one and it is returned in the result.
    pub async fn password_modify(
        &self,
        request: &PasswordModifyRequest,
    ) -> Result<PasswordModifyResult, ClientError> {
        let response = self.request(request).await?;
        match response.op {
            ResponseOp::Extended { value, .. } => Ok(PasswordModifyResult::decode(value.as_deref())?),
            other => Err(ProtocolError::UnexpectedOperation(other.tag()).into()),
        }
    }

    /// Returns the authorization identity of the session (RFC 4532).
    pub async fn who_am_i(&self, controls: Vec<Control>) -> Result<WhoAmIResult, ClientError> {
        let response = self.request(&WhoAmIRequest::new(controls)).await?;
        match response.op {
            ResponseOp::Extended { value, .. } => Ok(WhoAmIResult::decode(value.as_deref())),
            other => Err(ProtocolError::UnexpectedOperation(other.tag()).into()),
        }
    }

    /// Asks the server to abandon an outstanding operation. No reply is
    /// expected.
    pub async fn abandon(&self, message_id: i32) -> Result<(), ClientError> {
        self.conn.send_only(&AbandonRequest { message_id }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ldapwire_protocol::message::{application, message_id};
    use ldapwire_protocol::{
        classify, ControlBeheraPasswordPolicy, Decoder, Entry, EntryAttribute, LdapResult, Packet,
        CONTROL_TYPE_PAGING, START_TLS_OID, WHO_AM_I_OID,
    };
    use tokio::io::AsyncRead;
    use tokio_rustls::TlsAcceptor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// Accepts one connection and answers every request with `handler`.
    async fn mock_server<F>(handler: F) -> String
    where
        F: Fn(&Packet) -> Vec<ResponseOp> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let registry = ControlRegistry::default();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = Decoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Some(packet) = decoder.decode_packet().unwrap() {
                    let id = message_id(&packet).unwrap();
                    for op in handler(&packet) {
                        let mut response = Response::new(id, op);
                        match &response.op {
                            ResponseOp::SearchDone(_) => {
                                response.controls = page_reply(&packet, &registry);
                            }
                            ResponseOp::Modify(result) if result.is_success() => {
                                response.controls = vec![expiry_warning(3600)];
                            }
                            _ => {}
                        }
                        let bytes = response.to_packet().encode();
                        if socket.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        addr
    }

    /// For a paged request, returns the next cookie: "" -> "1" -> "2" -> done.
    fn page_reply(packet: &Packet, registry: &ControlRegistry) -> Vec<Control> {
        let Some(controls) = packet.children.get(2) else {
            return Vec::new();
        };
        let controls = registry.decode_controls(controls).unwrap();
        let Some(paging) = controls
            .iter()
            .find(|c| c.control_type() == CONTROL_TYPE_PAGING)
            .and_then(Control::as_paging)
        else {
            return Vec::new();
        };
        let next = match paging.cookie.as_ref() {
            b"" => "1",
            b"1" => "2",
            _ => "",
        };
        let mut reply = Control::paging(0);
        if let Some(p) = reply.as_paging_mut() {
            p.set_cookie(Bytes::from(next));
        }
        vec![reply]
    }

    fn expiry_warning(seconds: i64) -> Control {
        let mut policy = ControlBeheraPasswordPolicy::new();
        policy.expire = seconds;
        Control::BeheraPasswordPolicy(policy)
    }

    async fn connect(addr: String) -> Client {
        init_tracing();
        let config = ConnectionConfig::new(addr)
            .with_request_timeout(Duration::from_millis(500))
            .with_debug(true);
        let client = Client::new(config);
        client.connect().await.unwrap();
        client
    }

    fn op_tag(packet: &Packet) -> u32 {
        packet.children[1].tag
    }

    fn bind_handler(packet: &Packet) -> Vec<ResponseOp> {
        let op = &packet.children[1];
        let name = op.children[1].as_str().unwrap();
        let password = op.children[2].as_str().unwrap();
        let code = if name == "cn=admin" && password == "secret" {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        };
        vec![ResponseOp::Bind {
            result: LdapResult::new(code, "bind checked"),
            server_sasl_creds: None,
        }]
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(ConnectionConfig::new("127.0.0.1:389"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_bind_success() {
        let client = connect(mock_server(bind_handler).await).await;
        client.bind("cn=admin", "secret").await.unwrap();
        assert!(client.is_connected());
        client.unbind().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_bind_invalid_credentials() {
        let client = connect(mock_server(bind_handler).await).await;
        let err = client.bind("cn=admin", "wrong").await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidCredentials);
        assert_eq!(
            err.to_string(),
            "LDAP Result Code 49 \"Invalid Credentials\": bind checked"
        );
    }

    #[tokio::test]
    async fn test_empty_password_is_refused_locally() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let addr = mock_server(move |packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            bind_handler(packet)
        })
        .await;
        let client = connect(addr).await;

        assert!(matches!(
            client.bind("cn=admin", "").await,
            Err(ClientError::Protocol(ProtocolError::MissingField(_)))
        ));
        client.unauthenticated_bind("cn=anyone").await.unwrap_err();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_search_collects_entries() {
        let addr = mock_server(|packet| {
            let request = SearchRequest::decode(&packet.children[1]).unwrap();
            assert_eq!(request.filter, "(objectClass=person)");
            vec![
                ResponseOp::SearchEntry(Entry::new(
                    "cn=a,dc=example",
                    vec![EntryAttribute::new("cn", vec!["a".into()])],
                )),
                ResponseOp::SearchReference(vec!["ldap://other/dc=example".into()]),
                ResponseOp::SearchEntry(Entry::new("cn=b,dc=example", Vec::new())),
                ResponseOp::SearchDone(LdapResult::success()),
            ]
        })
        .await;
        let client = connect(addr).await;

        let result = client
            .search(SearchRequest::new("dc=example", "(objectClass=person)"))
            .await
            .unwrap();
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].attribute_value("cn"), "a");
        assert_eq!(result.referrals, vec!["ldap://other/dc=example".to_string()]);
    }

    #[tokio::test]
    async fn test_search_failure() {
        let addr = mock_server(|_| {
            vec![ResponseOp::SearchDone(LdapResult::new(
                ResultCode::NoSuchObject,
                "no such base",
            ))]
        })
        .await;
        let client = connect(addr).await;
        let err = client
            .search(SearchRequest::new("dc=missing", "(cn=*)"))
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::NoSuchObject);
    }

    #[tokio::test]
    async fn test_bad_filter_sends_nothing() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let addr = mock_server(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![ResponseOp::Delete(LdapResult::success())]
        })
        .await;
        let client = connect(addr).await;

        let err = client
            .search(SearchRequest::new("dc=example", "(cn=a"))
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::ErrorFilterCompile);

        client.del(&DelRequest::new("cn=a,dc=example")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_search_with_paging() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = rounds.clone();
        let addr = mock_server(move |packet| {
            assert_eq!(op_tag(packet), application::SEARCH_REQUEST);
            let round = counter.fetch_add(1, Ordering::SeqCst);
            vec![
                ResponseOp::SearchEntry(Entry::new(format!("cn=page{}", round), Vec::new())),
                ResponseOp::SearchDone(LdapResult::success()),
            ]
        })
        .await;
        let client = connect(addr).await;

        let result = client
            .search_with_paging(SearchRequest::new("dc=example", "(cn=*)"), 1)
            .await
            .unwrap();
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
        let dns: Vec<_> = result.entries.iter().map(|e| e.dn.as_str()).collect();
        assert_eq!(dns, vec!["cn=page0", "cn=page1", "cn=page2"]);
    }

    #[tokio::test]
    async fn test_compare() {
        let addr = mock_server(|packet| {
            let assertion = &packet.children[1].children[1];
            let code = match assertion.children[1].as_str().unwrap() {
                "yes" => ResultCode::CompareTrue,
                "no" => ResultCode::CompareFalse,
                _ => ResultCode::NoSuchAttribute,
            };
            vec![ResponseOp::Compare(LdapResult::new(code, ""))]
        })
        .await;
        let client = connect(addr).await;

        assert!(client.compare("cn=a", "flag", "yes").await.unwrap());
        assert!(!client.compare("cn=a", "flag", "no").await.unwrap());
        let err = client.compare("cn=a", "flag", "maybe").await.unwrap_err();
        assert_eq!(err.result_code(), ResultCode::NoSuchAttribute);
    }

    #[tokio::test]
    async fn test_modify_changes_reach_server() {
        let addr = mock_server(|packet| {
            let request = ModifyRequest::decode(&packet.children[1]).unwrap();
            let (add, replace, delete) = classify(&request.changes);
            let code = if add.len() == 1 && replace.len() == 1 && delete.len() == 1 {
                ResultCode::Success
            } else {
                ResultCode::Other
            };
            vec![ResponseOp::Modify(LdapResult::new(code, ""))]
        })
        .await;
        let client = connect(addr).await;

        let mut request = ModifyRequest::new("cn=a,dc=example");
        request
            .add("mail", vec!["a@example.com".into()])
            .replace("sn", vec!["Smith".into()])
            .delete("description", Vec::new());
        client.modify(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_password_modify_generated() {
        let addr = mock_server(|_| {
            let value = Packet::sequence("Password Modify Response").with_child(
                Packet::context_primitive(0, Bytes::from_static(b"s3cret!"), "Generated Password"),
            );
            vec![ResponseOp::Extended {
                result: LdapResult::success(),
                name: None,
                value: Some(value.encode().freeze()),
            }]
        })
        .await;
        let client = connect(addr).await;

        let result = client
            .password_modify(&PasswordModifyRequest::new("uid=a", "old", ""))
            .await
            .unwrap();
        assert_eq!(result.generated_password.as_deref(), Some("s3cret!"));
    }

    #[tokio::test]
    async fn test_paging_failure_keeps_received_pages() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = rounds.clone();
        let addr = mock_server(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
            1 => vec![ResponseOp::SearchDone(LdapResult::new(
                ResultCode::Unavailable,
                "shutting down",
            ))],
            round => vec![
                ResponseOp::SearchEntry(Entry::new(format!("cn=page{}", round), Vec::new())),
                ResponseOp::SearchDone(LdapResult::success()),
            ],
        })
        .await;
        let client = connect(addr).await;

        let err = client
            .search_with_paging(SearchRequest::new("dc=example", "(cn=*)"), 1)
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::Unavailable);
        let partial = err.partial_result().unwrap();
        assert_eq!(partial.entries.len(), 1);
        assert_eq!(partial.entries[0].dn, "cn=page0");
        // The failed page is followed by a release of the server cursor.
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_search_keeps_explicit_depth_limit() {
        let addr = mock_server(|_| vec![ResponseOp::SearchDone(LdapResult::success())]).await;
        init_tracing();
        let client = Client::new(
            ConnectionConfig::new(addr)
                .with_request_timeout(Duration::from_millis(500))
                .with_filter_depth_limit(1),
        );
        client.connect().await.unwrap();

        let nested = "(!(!(cn=a)))";
        assert!(matches!(
            client.search(SearchRequest::new("", nested)).await,
            Err(ClientError::Protocol(ProtocolError::FilterCompile(_)))
        ));
        let request = SearchRequest::new("", nested).with_filter_depth_limit(100);
        assert!(client.search(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_modify_with_result_returns_controls() {
        let addr = mock_server(|_| vec![ResponseOp::Modify(LdapResult::success())]).await;
        let client = connect(addr).await;

        let mut request = ModifyRequest::new("uid=a,dc=example");
        request.replace("userPassword", vec!["n3w".into()]);
        let result = client.modify_with_result(&request).await.unwrap();
        assert_eq!(result.controls, vec![expiry_warning(3600)]);
    }

    #[tokio::test]
    async fn test_who_am_i() {
        let addr = mock_server(|packet| {
            let op = &packet.children[1];
            assert_eq!(op_tag(packet), application::EXTENDED_REQUEST);
            assert_eq!(op.children[0].as_bytes(), WHO_AM_I_OID.as_bytes());
            vec![ResponseOp::Extended {
                result: LdapResult::success(),
                name: None,
                value: Some(Bytes::from_static(b"dn:cn=admin,dc=example")),
            }]
        })
        .await;
        let client = connect(addr).await;

        let result = client.who_am_i(Vec::new()).await.unwrap();
        assert_eq!(result.authz_id, "dn:cn=admin,dc=example");
    }

    fn test_acceptor() -> TlsAcceptor {
        let certs = rustls_pemfile::certs(&mut &include_bytes!("../testdata/server.pem")[..])
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut &include_bytes!("../testdata/server.key")[..])
            .unwrap()
            .unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    async fn read_packet<S: AsyncRead + Unpin>(
        stream: &mut S,
        decoder: &mut Decoder,
    ) -> Option<Packet> {
        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(packet) = decoder.decode_packet().unwrap() {
                return Some(packet);
            }
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            decoder.extend(&buf[..n]);
        }
    }

    /// Answers StartTLS with `code`; on success switches to TLS and serves
    /// binds over it.
    async fn start_tls_server(code: ResultCode) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = Decoder::new();

            let packet = read_packet(&mut socket, &mut decoder).await.unwrap();
            assert_eq!(packet.children[1].children[0].as_bytes(), START_TLS_OID.as_bytes());
            let reply = Response::new(
                message_id(&packet).unwrap(),
                ResponseOp::Extended {
                    result: LdapResult::new(code, ""),
                    name: None,
                    value: None,
                },
            );
            socket.write_all(&reply.to_packet().encode()).await.unwrap();

            if code.is_success() {
                let mut tls = test_acceptor().accept(socket).await.unwrap();
                while let Some(packet) = read_packet(&mut tls, &mut decoder).await {
                    for op in bind_handler(&packet) {
                        let response = Response::new(message_id(&packet).unwrap(), op);
                        tls.write_all(&response.to_packet().encode()).await.unwrap();
                    }
                }
            } else {
                while let Some(packet) = read_packet(&mut socket, &mut decoder).await {
                    for op in bind_handler(&packet) {
                        let response = Response::new(message_id(&packet).unwrap(), op);
                        socket.write_all(&response.to_packet().encode()).await.unwrap();
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_start_tls_upgrades_connection() {
        let client = connect(start_tls_server(ResultCode::Success).await).await;
        assert!(!client.connection().is_tls());

        client
            .start_tls(&TlsClientConfig::new().with_insecure())
            .await
            .unwrap();
        assert!(client.connection().is_tls());
        assert!(client.is_connected());

        client.bind("cn=admin", "secret").await.unwrap();
        assert!(matches!(
            client.start_tls(&TlsClientConfig::new().with_insecure()).await,
            Err(ClientError::TlsConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_tls_refused_stays_plain() {
        let client = connect(start_tls_server(ResultCode::Unavailable).await).await;

        let err = client
            .start_tls(&TlsClientConfig::new().with_insecure())
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::Unavailable);
        assert!(!client.connection().is_tls());

        client.bind("cn=admin", "secret").await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let addr = mock_server(|_| Vec::new()).await;
        let client = connect(addr).await;

        let err = client.del(&DelRequest::new("cn=a")).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(err.is_retryable());
        assert_eq!(client.connection().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_gets_no_reply() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let addr = mock_server(move |packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            match op_tag(packet) {
                application::ABANDON_REQUEST => Vec::new(),
                _ => vec![ResponseOp::Delete(LdapResult::success())],
            }
        })
        .await;
        let client = connect(addr).await;

        client.abandon(42).await.unwrap();
        client.del(&DelRequest::new("cn=a")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_closes_connection() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let config = ConnectionConfig::new(addr).with_request_timeout(Duration::from_secs(2));
        let client = Client::new(config);
        client.connect().await.unwrap();
        assert!(client.del(&DelRequest::new("cn=a")).await.is_err());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let client = Client::new(ConnectionConfig::new("127.0.0.1:389"));
        assert!(matches!(
            client.del(&DelRequest::new("cn=a")).await,
            Err(ClientError::NotConnected)
        ));
    }
}
