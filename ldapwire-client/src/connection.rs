//! Connection management.
//!
//! One [`Connection`] carries any number of outstanding operations. Each
//! request gets a fresh message id and a channel; [`Connection::read_loop`]
//! routes every decoded response to the channel of its id and drops the
//! channel once the final response for that id has arrived.

use crate::error::ClientError;
use crate::stream::LdapStream;
use crate::tls::TlsClientConfig;
use ldapwire_protocol::filter::DEFAULT_MAX_FILTER_DEPTH;
use ldapwire_protocol::message::message_id;
use ldapwire_protocol::{
    encode_message, ControlRegistry, Decoder, Encoder, Packet, ProtocolError, Request, Response,
    MAX_MESSAGE_SIZE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address as `host:port`.
    pub addr: String,
    /// Limit for the TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Limit for each response to arrive.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Largest message accepted from the server.
    pub max_message_size: usize,
    /// Maximum nesting depth accepted by the filter compiler.
    pub filter_depth_limit: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
    /// Dump every packet sent and received at debug level.
    pub debug: bool,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            filter_depth_limit: DEFAULT_MAX_FILTER_DEPTH,
            tls: None,
            debug: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_filter_depth_limit(mut self, limit: usize) -> Self {
        self.filter_depth_limit = limit;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

pub type ResponseSender = mpsc::UnboundedSender<Result<Response, ProtocolError>>;
pub type ResponseReceiver = mpsc::UnboundedReceiver<Result<Response, ProtocolError>>;

/// A connection to a directory server.
pub struct Connection {
    config: ConnectionConfig,
    registry: Arc<ControlRegistry>,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<WriteHalf<LdapStream>>>,
    /// Read half of the stream, taken by the read loop.
    reader: Mutex<Option<ReadHalf<LdapStream>>>,
    /// Hands the read half back from a running read loop.
    pause: Mutex<Option<oneshot::Sender<()>>>,
    /// Operations waiting for responses, by message id.
    pending: Mutex<HashMap<i32, ResponseSender>>,
    next_id: AtomicI32,
    connected: AtomicBool,
    tls: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected) with the built-in
    /// control decoders.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_registry(config, Arc::new(ControlRegistry::with_builtins()))
    }

    /// Creates a new connection that decodes response controls with
    /// `registry`.
    pub fn with_registry(config: ConnectionConfig, registry: Arc<ControlRegistry>) -> Self {
        Self {
            config,
            registry,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pause: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            connected: AtomicBool::new(false),
            tls: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ControlRegistry> {
        &self.registry
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);
        let stream = LdapStream::connect(
            &self.config.addr,
            self.config.tls.as_ref(),
            self.config.connect_timeout,
        )
        .await?;

        self.tls.store(stream.is_tls(), Ordering::SeqCst);
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!("Connected to {}", self.config.addr);
        Ok(())
    }

    /// Message ids run from 1 to `i32::MAX` and then wrap.
    fn next_message_id(&self) -> i32 {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id == i32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    async fn write(&self, message_id: i32, packet: Packet) -> Result<(), ClientError> {
        if self.config.debug {
            tracing::debug!("sending message {}\n{}", message_id, packet.dump());
        }
        let encoded = Encoder::encode_packet(&packet);

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await?;
        tracing::trace!(message_id, bytes = encoded.len(), "request written");
        Ok(())
    }

    /// Sends a request and returns its message id together with the
    /// channel its responses will arrive on.
    ///
    /// A request that fails to encode is rejected before anything is
    /// written or registered.
    pub async fn send(
        &self,
        request: &dyn Request,
    ) -> Result<(i32, ResponseReceiver), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let id = self.next_message_id();
        let packet = encode_message(id, request)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(id, tx);
        // The read loop may have shut down between the check above and the insert.
        if !self.is_connected() {
            self.forget(id).await;
            return Err(ClientError::ConnectionClosed);
        }
        if let Err(err) = self.write(id, packet).await {
            self.forget(id).await;
            return Err(err);
        }
        Ok((id, rx))
    }

    /// Sends a request that gets no reply (unbind, abandon).
    pub async fn send_only(&self, request: &dyn Request) -> Result<i32, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let id = self.next_message_id();
        self.write(id, encode_message(id, request)?).await?;
        Ok(id)
    }

    /// Sends a request and waits for its final response.
    pub async fn request(&self, request: &dyn Request) -> Result<Response, ClientError> {
        let mut stream = self.request_stream(request).await?;
        loop {
            match stream.next().await {
                Some(Ok(response)) if response.is_final() => return Ok(response),
                Some(Ok(response)) => {
                    tracing::debug!(
                        message_id = response.message_id,
                        "skipping intermediate response"
                    );
                }
                Some(Err(err)) => return Err(err),
                None => return Err(ClientError::ConnectionClosed),
            }
        }
    }

    /// Sends a request whose reply may span several messages (search).
    pub async fn request_stream(
        &self,
        request: &dyn Request,
    ) -> Result<MessageStream<'_>, ClientError> {
        let (message_id, rx) = self.send(request).await?;
        Ok(MessageStream {
            conn: self,
            message_id,
            rx,
            finished: false,
        })
    }

    /// Reads and dispatches responses (call this in a background task).
    ///
    /// Returns an error when the server closes the connection or the byte
    /// stream can no longer be framed, and `Ok(())` after
    /// [`pause_reading`](Self::pause_reading) has handed the read half back.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;
        let (pause_tx, mut pause_rx) = oneshot::channel();
        *self.pause.lock().await = Some(pause_tx);
        let mut pausable = true;
        let mut decoder = Decoder::new().with_max_message_size(self.config.max_message_size);
        let mut buf = vec![0u8; self.config.read_buffer_size];
        tracing::debug!("read_loop started");

        loop {
            let read = tokio::select! {
                read = reader.read(&mut buf) => read,
                paused = &mut pause_rx, if pausable => {
                    if paused.is_err() {
                        pausable = false;
                        continue;
                    }
                    if decoder.buffered() > 0 {
                        tracing::warn!(
                            bytes = decoder.buffered(),
                            "read_loop: discarding unread bytes on pause"
                        );
                    }
                    *self.reader.lock().await = Some(reader);
                    tracing::debug!("read_loop paused");
                    return Ok(());
                }
            };
            let n = match read {
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!("read_loop: read failed: {}", err);
                    self.shutdown_pending().await;
                    return Err(err.into());
                }
            };
            if n == 0 {
                tracing::debug!("read_loop: connection closed by server");
                self.shutdown_pending().await;
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);

            loop {
                let packet = match decoder.decode_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!("read_loop: unrecoverable framing error: {}", err);
                        self.fail_pending(err.clone()).await;
                        return Err(err.into());
                    }
                };
                if self.config.debug {
                    tracing::debug!("received\n{}", packet.dump());
                }

                match Response::decode(&packet, &self.registry) {
                    Ok(response) => self.dispatch(response.message_id, Ok(response)).await,
                    Err(err) => match message_id(&packet) {
                        Ok(id) => self.dispatch(id, Err(err)).await,
                        Err(_) => tracing::warn!("read_loop: dropping undecodable message: {}", err),
                    },
                }
            }
        }
    }

    /// Asks the running read loop to stop and return the read half.
    ///
    /// Returns `false` when no read loop is running.
    pub async fn pause_reading(&self) -> bool {
        match self.pause.lock().await.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Switches the paused connection to TLS in place.
    ///
    /// The read loop must have been stopped with
    /// [`pause_reading`](Self::pause_reading). A failed handshake leaves the
    /// connection closed.
    pub async fn upgrade_tls(&self, tls: &TlsClientConfig) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let mut reader_guard = self.reader.lock().await;
        let (Some(writer), Some(reader)) = (writer_guard.take(), reader_guard.take()) else {
            return Err(ClientError::NotConnected);
        };

        let stream = reader.unsplit(writer);
        match stream
            .start_tls(&self.config.addr, tls, self.config.connect_timeout)
            .await
        {
            Ok(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                *writer_guard = Some(write_half);
                *reader_guard = Some(read_half);
                self.tls.store(true, Ordering::SeqCst);
                tracing::debug!("connection upgraded to TLS");
                Ok(())
            }
            Err(err) => {
                drop(reader_guard);
                drop(writer_guard);
                self.shutdown_pending().await;
                Err(err)
            }
        }
    }

    async fn dispatch(&self, id: i32, response: Result<Response, ProtocolError>) {
        if id == 0 {
            // Unsolicited notification, e.g. notice of disconnection.
            tracing::warn!("read_loop: unsolicited notification: {:?}", response);
            return;
        }
        // A decode error ends the operation just like a final response.
        let last = response.as_ref().map_or(true, Response::is_final);

        let mut pending = self.pending.lock().await;
        let delivered = match pending.get(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::warn!("read_loop: no pending request for message id {}", id);
                return;
            }
        };
        if last || !delivered {
            pending.remove(&id);
        }
    }

    async fn fail_pending(&self, err: ProtocolError) {
        self.connected.store(false, Ordering::SeqCst);
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }

    async fn shutdown_pending(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }

    async fn forget(&self, message_id: i32) {
        self.pending.lock().await.remove(&message_id);
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns whether traffic is encrypted, from the start or after StartTLS.
    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::SeqCst)
    }

    /// Closes the connection. Outstanding operations see
    /// [`ClientError::ConnectionClosed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();

        let mut pending = self.pending.lock().await;
        tracing::debug!("Clearing {} pending requests", pending.len());
        pending.clear();
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Like [`pending_count`](Self::pending_count), waiting for the lock.
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Responses of one operation, in arrival order.
pub struct MessageStream<'a> {
    conn: &'a Connection,
    message_id: i32,
    rx: ResponseReceiver,
    finished: bool,
}

impl MessageStream<'_> {
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Waits for the next response. Yields `None` after the final one.
    ///
    /// Each wait is bounded by the request timeout; on timeout the
    /// operation is forgotten and later responses for it are dropped.
    pub async fn next(&mut self) -> Option<Result<Response, ClientError>> {
        if self.finished {
            return None;
        }
        let timeout = self.conn.config.request_timeout;
        let item = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => {
                tracing::debug!("Request id={} timed out", self.message_id);
                self.conn.forget(self.message_id).await;
                Err(ClientError::Timeout)
            }
            Ok(None) => Err(ClientError::ConnectionClosed),
            Ok(Some(Err(err))) => Err(ClientError::Protocol(err)),
            Ok(Some(Ok(response))) => {
                if !response.is_final() {
                    return Some(Ok(response));
                }
                Ok(response)
            }
        };
        self.finished = true;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:389");
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.filter_depth_limit, 100);
        assert!(!config.debug);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new("127.0.0.1:389").with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new("127.0.0.1:389").with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_message_ids_wrap() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:389"));
        assert_eq!(conn.next_message_id(), 1);
        assert_eq!(conn.next_message_id(), 2);

        conn.next_id.store(i32::MAX, Ordering::SeqCst);
        assert_eq!(conn.next_message_id(), i32::MAX);
        assert_eq!(conn.next_message_id(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:389"));
        let result = conn.send(&ldapwire_protocol::DelRequest::new("cn=a")).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_hands_back_reader() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));
        assert!(!conn.pause_reading().await);
        conn.connect().await.unwrap();
        let _socket = server.await.unwrap();

        let reader = conn.clone();
        let task = tokio::spawn(async move { reader.read_loop().await });
        while conn.pause.lock().await.is_none() {
            tokio::task::yield_now().await;
        }
        assert!(conn.pause_reading().await);
        assert!(task.await.unwrap().is_ok());
        assert!(conn.reader.lock().await.is_some());
        assert!(conn.is_connected());
        assert!(!conn.is_tls());
    }
}
