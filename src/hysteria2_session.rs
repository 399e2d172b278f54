//! Per-connection Hysteria2 state machine.
//!
//! A session starts unauthenticated. HTTP/3 requests are routed through
//! [`Hysteria2Session::handle_request`]: the first successful authentication binds
//! the connection to a user, installs the congestion controller and starts the
//! connection's background tasks. Anything else is answered by the masquerade
//! handler. Once authenticated, bidirectional streams that start with the TCP
//! request frame type are taken over as proxied TCP streams; every other stream
//! goes back to the HTTP/3 server through [`TransportConnection::forward_stream`].
//!
//! The session only talks to the transport through [`TransportConnection`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::config::ServiceConfig;
use crate::congestion::{
    CongestionChoice, CongestionDecision, CongestionParams, select_congestion_control,
};
use crate::error_util::{canceled_error, closed_error, is_closed_or_canceled};
use crate::hysteria2_protocol::{
    AUTH_HOST, AUTH_PATH, AuthRequest, AuthResponse, FRAME_TYPE_TCP_REQUEST, read_frame_type,
    read_tcp_request,
};
use crate::hysteria2_stream::Hysteria2Stream;
use crate::masquerade::HttpExchange;
use crate::server_handler::{AuthContext, Metadata, ServerHandler};
use crate::udp_session::{
    DatagramSender, Delivery, UdpPacketSession, UdpSessionTable, split_datagram,
};
use crate::user_registry::{Identity, UserRegistry};

/// The parts of a transport connection a session needs.
#[async_trait]
pub trait TransportConnection: DatagramSender + 'static {
    type Stream: AsyncStream + 'static;

    /// Accepts the next bidirectional stream opened by the peer.
    async fn accept_stream(&self) -> std::io::Result<Self::Stream>;

    /// Hands a stream that is not a proxied TCP stream to the HTTP/3 server.
    /// `prefix` holds the bytes already read from it.
    fn forward_stream(&self, stream: Self::Stream, prefix: Bytes) -> std::io::Result<()>;

    async fn read_datagram(&self) -> std::io::Result<Bytes>;

    fn remote_address(&self) -> SocketAddr;

    fn set_congestion_control(&self, choice: CongestionChoice);

    /// Closes the connection with no error code.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

struct Authenticated<U> {
    user: U,
    response: AuthResponse,
}

pub struct Hysteria2Session<U: Identity, T: TransportConnection> {
    transport: Arc<T>,
    config: Arc<ServiceConfig>,
    users: Arc<UserRegistry<U>>,
    handler: Arc<dyn ServerHandler<U>>,
    auth: RwLock<Option<Authenticated<U>>>,
    close_lock: Mutex<()>,
    conn_done: CancellationToken,
    udp_sessions: UdpSessionTable,
}

impl<U: Identity, T: TransportConnection> std::fmt::Debug for Hysteria2Session<U, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hysteria2Session")
            .field("remote_address", &self.transport.remote_address())
            .field("state", &self.state())
            .finish()
    }
}

fn is_auth_request(request: &Request<()>) -> bool {
    request.method() == Method::POST
        && request.uri().host() == Some(AUTH_HOST)
        && request.uri().path() == AUTH_PATH
}

impl<U: Identity, T: TransportConnection> Hysteria2Session<U, T> {
    pub fn new(
        transport: Arc<T>,
        config: Arc<ServiceConfig>,
        users: Arc<UserRegistry<U>>,
        handler: Arc<dyn ServerHandler<U>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            users,
            handler,
            auth: RwLock::new(None),
            close_lock: Mutex::new(()),
            conn_done: CancellationToken::new(),
            udp_sessions: UdpSessionTable::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        if self.conn_done.is_cancelled() {
            SessionState::Closed
        } else if self.auth.read().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.read().is_some()
    }

    pub fn user(&self) -> Option<U> {
        self.auth.read().as_ref().map(|auth| auth.user.clone())
    }

    /// Cancelled once the connection is torn down.
    pub fn connection_done(&self) -> CancellationToken {
        self.conn_done.clone()
    }

    pub fn udp_sessions(&self) -> &UdpSessionTable {
        &self.udp_sessions
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.transport.remote_address()
    }

    /// Answers one HTTP/3 request: a successful authentication gets the auth
    /// response, everything else goes to the masquerade handler.
    pub async fn handle_request(
        self: &Arc<Self>,
        request: &Request<()>,
        exchange: &mut dyn HttpExchange,
    ) -> std::io::Result<()> {
        match self.authenticate(request) {
            Some(response) => exchange.send_response(response.to_response()?).await,
            None => self.config.masquerade.serve(request, exchange).await,
        }
    }

    fn authenticate(self: &Arc<Self>, request: &Request<()>) -> Option<AuthResponse> {
        if !is_auth_request(request) {
            return None;
        }

        if let Some(response) = self.auth.read().as_ref().map(|auth| auth.response) {
            return Some(response);
        }

        let auth_request = AuthRequest::from_headers(request.headers());
        let user = self.users.lookup(&auth_request.auth)?;

        let decision = select_congestion_control(&CongestionParams {
            server_receive_bps: self.config.receive_bps,
            server_send_bps: self.config.send_bps,
            ignore_client_bandwidth: self.config.ignore_client_bandwidth,
            client_rx: auth_request.rx,
            initial_window: self.config.initial_congestion_window,
        });
        let choice = match decision {
            CongestionDecision::Use(choice) => choice,
            CongestionDecision::Reject => {
                debug!(
                    "{}: client declared no receive rate and adaptive congestion control is disabled",
                    self.remote_address()
                );
                return None;
            }
        };

        let response = AuthResponse {
            udp_enabled: self.config.udp_enabled(),
            rx: self.config.receive_bps,
            rx_auto: choice.is_auto_rate(),
        };

        {
            let mut auth = self.auth.write();
            if let Some(existing) = auth.as_ref() {
                return Some(existing.response);
            }
            self.transport.set_congestion_control(choice);
            *auth = Some(Authenticated { user, response });
        }

        debug!(
            "{}: authenticated, congestion control {:?}",
            self.remote_address(),
            choice
        );
        self.start_background_tasks();

        Some(response)
    }

    fn start_background_tasks(self: &Arc<Self>) {
        if let Some(shutdown) = self.config.shutdown.clone() {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        session.close_with_error(canceled_error());
                    }
                    _ = session.conn_done.cancelled() => {}
                }
            });
        }

        if self.config.udp_enabled() {
            let session = self.clone();
            tokio::spawn(async move {
                session.run_datagram_loop().await;
            });
        }
    }

    /// Whether a stream opened with `frame_type` is a proxied TCP stream.
    pub fn should_hijack(&self, frame_type: u64, stream_error: Option<&std::io::Error>) -> bool {
        self.is_authenticated() && stream_error.is_none() && frame_type == FRAME_TYPE_TCP_REQUEST
    }

    /// Accepts streams until the connection ends, handing each one to its own task.
    pub async fn serve_streams(self: &Arc<Self>) -> std::io::Result<()> {
        loop {
            let stream = tokio::select! {
                result = self.transport.accept_stream() => result,
                _ = self.conn_done.cancelled() => return Ok(()),
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    self.close_with_error(std::io::Error::new(
                        err.kind(),
                        format!("failed to accept stream: {err}"),
                    ));
                    return Err(err);
                }
            };
            let session = self.clone();
            tokio::spawn(async move {
                session.handle_stream(stream).await;
            });
        }
    }

    /// Reads the frame type of a new stream, then either proxies it or hands it to
    /// the HTTP/3 server.
    pub async fn handle_stream(self: Arc<Self>, mut stream: T::Stream) {
        let (frame_type, prefix, stream_error) = match read_frame_type(&mut stream).await {
            Ok((frame_type, prefix)) => (frame_type, prefix, None),
            Err(err) => (0, Bytes::new(), Some(err)),
        };

        if self.should_hijack(frame_type, stream_error.as_ref()) {
            if let Err(e) = self.handle_tcp_stream(stream).await {
                error!("{}: handle stream request: {}", self.remote_address(), e);
            }
            return;
        }

        if let Some(err) = stream_error {
            debug!(
                "{}: declining stream without a frame type: {}",
                self.remote_address(),
                err
            );
            stream.cancel_read();
            let _ = stream.shutdown().await;
            return;
        }

        if let Err(e) = self.transport.forward_stream(stream, prefix) {
            debug!(
                "{}: dropping stream with frame type {:#x}: {}",
                self.remote_address(),
                frame_type,
                e
            );
        }
    }

    async fn handle_tcp_stream(&self, mut stream: T::Stream) -> std::io::Result<()> {
        let destination = match read_tcp_request(&mut stream).await {
            Ok(destination) => destination,
            Err(err) => {
                stream.cancel_read();
                let _ = stream.shutdown().await;
                return Err(std::io::Error::new(
                    err.kind(),
                    format!("read TCP request: {err}"),
                ));
            }
        };

        let mut tcp_stream = Hysteria2Stream::new(Box::new(stream));

        let Some(user) = self.user() else {
            let _ = tcp_stream.close().await;
            return Err(closed_error("session is not authenticated"));
        };

        let destination = match NetLocation::from_str(&destination, None) {
            Ok(location) => location,
            Err(err) => {
                let _ = tcp_stream.handshake_failure(&err).await;
                let _ = tcp_stream.close().await;
                return Err(std::io::Error::new(
                    err.kind(),
                    format!("invalid destination {destination}: {err}"),
                ));
            }
        };

        let context = AuthContext {
            user,
            connection_done: self.conn_done.clone(),
        };
        let metadata = Metadata {
            source: self.remote_address(),
            destination,
        };

        let result = self
            .handler
            .new_connection(context, &mut tcp_stream, metadata)
            .await;
        let _ = tcp_stream.close().await;
        result
    }

    async fn run_datagram_loop(self: Arc<Self>) {
        loop {
            let datagram = tokio::select! {
                result = self.transport.read_datagram() => result,
                _ = self.conn_done.cancelled() => break,
            };
            let datagram = match datagram {
                Ok(datagram) => datagram,
                Err(err) => {
                    self.close_with_error(err);
                    break;
                }
            };
            let Some((session_id, payload)) = split_datagram(datagram) else {
                debug!("{}: dropping short datagram", self.remote_address());
                continue;
            };
            if let Delivery::UnknownSession(payload) =
                self.udp_sessions.deliver(session_id, payload)
            {
                self.open_udp_session(session_id, payload);
            }
        }
        self.udp_sessions.clear();
    }

    fn open_udp_session(self: &Arc<Self>, session_id: u32, first_payload: Bytes) {
        let Some(user) = self.user() else {
            return;
        };
        let Some(receiver) = self.udp_sessions.insert(session_id) else {
            return;
        };
        self.udp_sessions.deliver(session_id, first_payload);

        let sender: Arc<dyn DatagramSender> = self.transport.clone();
        let packet_session =
            UdpPacketSession::new(session_id, receiver, sender, self.config.udp_timeout);
        let context = AuthContext {
            user,
            connection_done: self.conn_done.clone(),
        };
        let metadata = Metadata {
            source: self.remote_address(),
            destination: NetLocation::UNSPECIFIED,
        };

        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session
                .handler
                .new_packet_connection(context, packet_session, metadata)
                .await
            {
                error!(
                    "{}: udp session {} ended with error: {}",
                    session.remote_address(),
                    session_id,
                    e
                );
            }
            session.udp_sessions.remove(session_id);
        });
    }

    /// Tears the connection down. Only the first call has any effect; it returns
    /// whether this call was the one that closed the connection.
    pub fn close_with_error(&self, err: std::io::Error) -> bool {
        let _guard = self.close_lock.lock();
        if self.conn_done.is_cancelled() {
            return false;
        }
        self.conn_done.cancel();

        if is_closed_or_canceled(&err) {
            debug!("{}: connection closed: {}", self.remote_address(), err);
        } else {
            error!("{}: connection failed: {}", self.remote_address(), err);
        }
        self.transport.close();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use http::{Response, StatusCode};
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio::sync::mpsc;

    use super::*;
    use crate::hysteria2_protocol::{
        STATUS_AUTH_OK, encode_tcp_request, header, read_tcp_response,
    };
    use crate::masquerade::{BufferedExchange, MasqueradeHandler, NotFoundHandler};

    const REMOTE: &str = "198.51.100.7:40000";

    struct MockTransport {
        streams: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
        datagrams: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        sent: mpsc::UnboundedSender<Bytes>,
        forwarded: mpsc::UnboundedSender<(DuplexStream, Bytes)>,
        congestion: Mutex<Vec<CongestionChoice>>,
        close_count: AtomicUsize,
        closed: CancellationToken,
    }

    struct MockPeer {
        streams: mpsc::UnboundedSender<DuplexStream>,
        datagrams: mpsc::UnboundedSender<Bytes>,
        sent: mpsc::UnboundedReceiver<Bytes>,
        forwarded: mpsc::UnboundedReceiver<(DuplexStream, Bytes)>,
    }

    impl MockPeer {
        fn open_stream(&self) -> DuplexStream {
            let (server, client) = duplex(64 * 1024);
            self.streams.send(server).unwrap();
            client
        }
    }

    fn mock_transport() -> (Arc<MockTransport>, MockPeer) {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            streams: tokio::sync::Mutex::new(stream_rx),
            datagrams: tokio::sync::Mutex::new(datagram_rx),
            sent: sent_tx,
            forwarded: forwarded_tx,
            congestion: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        });
        let peer = MockPeer {
            streams: stream_tx,
            datagrams: datagram_tx,
            sent: sent_rx,
            forwarded: forwarded_rx,
        };
        (transport, peer)
    }

    impl DatagramSender for MockTransport {
        fn send_datagram(&self, data: Bytes) -> std::io::Result<()> {
            self.sent
                .send(data)
                .map_err(|_| closed_error("peer gone"))
        }
    }

    #[async_trait]
    impl TransportConnection for MockTransport {
        type Stream = DuplexStream;

        async fn accept_stream(&self) -> std::io::Result<DuplexStream> {
            let mut streams = self.streams.lock().await;
            tokio::select! {
                stream = streams.recv() => stream.ok_or_else(|| closed_error("no more streams")),
                _ = self.closed.cancelled() => Err(closed_error("connection closed")),
            }
        }

        fn forward_stream(&self, stream: DuplexStream, prefix: Bytes) -> std::io::Result<()> {
            self.forwarded
                .send((stream, prefix))
                .map_err(|_| closed_error("http server gone"))
        }

        async fn read_datagram(&self) -> std::io::Result<Bytes> {
            let mut datagrams = self.datagrams.lock().await;
            tokio::select! {
                datagram = datagrams.recv() => datagram.ok_or_else(|| closed_error("no more datagrams")),
                _ = self.closed.cancelled() => Err(closed_error("connection closed")),
            }
        }

        fn remote_address(&self) -> SocketAddr {
            REMOTE.parse().unwrap()
        }

        fn set_congestion_control(&self, choice: CongestionChoice) {
            self.congestion.lock().push(choice);
        }

        fn close(&self) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            self.closed.cancel();
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        connections: Mutex<Vec<(&'static str, Metadata)>>,
        packet_sessions: Mutex<Vec<(&'static str, u32)>>,
    }

    #[async_trait]
    impl ServerHandler<&'static str> for RecordingHandler {
        async fn new_connection(
            &self,
            context: AuthContext<&'static str>,
            stream: &mut Hysteria2Stream,
            metadata: Metadata,
        ) -> std::io::Result<()> {
            let greeting = format!("hello from {}", metadata.destination);
            self.connections.lock().push((context.user, metadata));
            stream.write_all(greeting.as_bytes()).await
        }

        async fn new_packet_connection(
            &self,
            context: AuthContext<&'static str>,
            mut session: UdpPacketSession,
            _metadata: Metadata,
        ) -> std::io::Result<()> {
            self.packet_sessions
                .lock()
                .push((context.user, session.session_id()));
            loop {
                let message = session.read_message().await?;
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&message);
                session.write_message(&reply)?;
            }
        }
    }

    struct Fixture {
        session: Arc<Hysteria2Session<&'static str, MockTransport>>,
        transport: Arc<MockTransport>,
        peer: MockPeer,
        handler: Arc<RecordingHandler>,
    }

    fn fixture(config: ServiceConfig) -> Fixture {
        let users = Arc::new(UserRegistry::new());
        users
            .update_users(vec!["U1"], vec!["s1".to_string()])
            .unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (transport, peer) = mock_transport();
        let session = Hysteria2Session::new(
            transport.clone(),
            Arc::new(config.with_defaults()),
            users,
            handler.clone(),
        );
        Fixture {
            session,
            transport,
            peer,
            handler,
        }
    }

    fn auth_request(secret: &str, rx: Option<u64>) -> Request<()> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("https://hysteria/auth")
            .header(header::AUTH, secret);
        if let Some(rx) = rx {
            builder = builder.header(header::CC_RX, rx.to_string());
        }
        builder.body(()).unwrap()
    }

    async fn send(
        session: &Arc<Hysteria2Session<&'static str, MockTransport>>,
        request: &Request<()>,
    ) -> Response<Bytes> {
        let mut exchange = BufferedExchange::default();
        session.handle_request(request, &mut exchange).await.unwrap();
        exchange.into_response().unwrap()
    }

    async fn assert_masquerade(response: Response<Bytes>, request: &Request<()>) {
        let mut exchange = BufferedExchange::default();
        NotFoundHandler.serve(request, &mut exchange).await.unwrap();
        let expected = exchange.into_response().unwrap();
        assert_eq!(response.status(), expected.status());
        assert_eq!(response.headers(), expected.headers());
        assert_eq!(response.body(), expected.body());
    }

    #[tokio::test]
    async fn test_adaptive_when_client_declares_no_rate() {
        let f = fixture(ServiceConfig {
            ignore_client_bandwidth: true,
            ..Default::default()
        });

        let response = send(&f.session, &auth_request("s1", None)).await;
        assert_eq!(response.status().as_u16(), STATUS_AUTH_OK);
        assert_eq!(response.headers()[header::CC_RX], "auto");
        assert_eq!(response.headers()[header::UDP], "true");

        assert_eq!(f.session.state(), SessionState::Authenticated);
        assert_eq!(f.session.user(), Some("U1"));
        assert_eq!(
            *f.transport.congestion.lock(),
            vec![CongestionChoice::Bbr { initial_window: 32 }]
        );
    }

    #[tokio::test]
    async fn test_fixed_rate_capped_by_send_limit() {
        let f = fixture(ServiceConfig {
            send_bps: 500_000,
            udp_disabled: true,
            ..Default::default()
        });

        let response = send(&f.session, &auth_request("s1", Some(1_000_000))).await;
        assert_eq!(response.status().as_u16(), STATUS_AUTH_OK);
        let auth = AuthResponse::from_headers(response.headers());
        assert_eq!(
            auth,
            AuthResponse {
                udp_enabled: false,
                rx: 0,
                rx_auto: false,
            }
        );
        assert_eq!(
            *f.transport.congestion.lock(),
            vec![CongestionChoice::Brutal { rate: 500_000 }]
        );
    }

    #[tokio::test]
    async fn test_rejected_without_declared_rate() {
        let f = fixture(ServiceConfig {
            receive_bps: 200_000,
            ignore_client_bandwidth: true,
            ..Default::default()
        });

        let request = auth_request("s1", Some(0));
        let response = send(&f.session, &request).await;
        assert_masquerade(response, &request).await;
        assert_eq!(f.session.state(), SessionState::Unauthenticated);
        assert!(f.transport.congestion.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_secret_looks_like_unknown_path() {
        let f = fixture(ServiceConfig::default());

        let response = send(&f.session, &auth_request("bad", None)).await;
        let unrelated_request = Request::builder()
            .uri("https://example.com/some/unrelated/path")
            .body(())
            .unwrap();
        let unrelated = send(&f.session, &unrelated_request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.status(), unrelated.status());
        assert_eq!(response.headers(), unrelated.headers());
        assert_eq!(response.body(), unrelated.body());
        assert_eq!(f.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_non_auth_requests_are_masqueraded() {
        let f = fixture(ServiceConfig::default());

        let wrong_method = Request::builder()
            .method(Method::GET)
            .uri("https://hysteria/auth")
            .header(header::AUTH, "s1")
            .body(())
            .unwrap();
        let response = send(&f.session, &wrong_method).await;
        assert_masquerade(response, &wrong_method).await;

        let wrong_host = Request::builder()
            .method(Method::POST)
            .uri("https://example.com/auth")
            .header(header::AUTH, "s1")
            .body(())
            .unwrap();
        let response = send(&f.session, &wrong_host).await;
        assert_masquerade(response, &wrong_host).await;

        assert_eq!(f.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_reauthentication_returns_cached_response() {
        let f = fixture(ServiceConfig::default());

        let first = send(&f.session, &auth_request("s1", Some(100))).await;
        // a second auth request, even with another secret, reuses the first result
        let second = send(&f.session, &auth_request("bad", None)).await;
        assert_eq!(second.status().as_u16(), STATUS_AUTH_OK);
        assert_eq!(
            AuthResponse::from_headers(first.headers()),
            AuthResponse::from_headers(second.headers())
        );
        assert_eq!(f.transport.congestion.lock().len(), 1);
        assert_eq!(f.session.user(), Some("U1"));
    }

    #[tokio::test]
    async fn test_hijack_predicate() {
        let f = fixture(ServiceConfig::default());
        assert!(!f.session.should_hijack(FRAME_TYPE_TCP_REQUEST, None));

        send(&f.session, &auth_request("s1", None)).await;
        assert!(f.session.should_hijack(FRAME_TYPE_TCP_REQUEST, None));
        assert!(!f.session.should_hijack(0x01, None));
        let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(!f.session.should_hijack(FRAME_TYPE_TCP_REQUEST, Some(&err)));
    }

    #[tokio::test]
    async fn test_stream_before_authentication_goes_to_http() {
        let mut f = fixture(ServiceConfig::default());
        let session = f.session.clone();
        tokio::spawn(async move { session.serve_streams().await });

        let request = encode_tcp_request("example.com:443").unwrap();
        let mut client = f.peer.open_stream();
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        let (mut forwarded, prefix) = f.peer.forwarded.recv().await.unwrap();
        assert_eq!(prefix.as_ref(), [0x44, 0x01]);
        let mut rest = Vec::new();
        forwarded.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, request[2..]);
        assert!(f.handler.connections.lock().is_empty());
    }

    #[tokio::test]
    async fn test_http_stream_after_authentication_is_forwarded() {
        let mut f = fixture(ServiceConfig::default());
        send(&f.session, &auth_request("s1", None)).await;
        let session = f.session.clone();
        tokio::spawn(async move { session.serve_streams().await });

        // HEADERS frame of a request on the same connection
        let mut client = f.peer.open_stream();
        client.write_all(&[0x01, 0x02, 0xab, 0xcd]).await.unwrap();

        let (mut forwarded, prefix) = f.peer.forwarded.recv().await.unwrap();
        assert_eq!(prefix.as_ref(), [0x01]);
        let mut rest = [0u8; 3];
        forwarded.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0x02, 0xab, 0xcd]);
        assert!(f.handler.connections.lock().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_type_is_declined() {
        let mut f = fixture(ServiceConfig::default());
        send(&f.session, &auth_request("s1", None)).await;
        let session = f.session.clone();
        tokio::spawn(async move { session.serve_streams().await });

        let mut client = f.peer.open_stream();
        client.write_all(&[0x80]).await.unwrap();
        client.shutdown().await.unwrap();
        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        assert!(data.is_empty());
        assert!(f.peer.forwarded.try_recv().is_err());
        assert!(f.handler.connections.lock().is_empty());
    }

    #[tokio::test]
    async fn test_proxied_stream() {
        let f = fixture(ServiceConfig::default());
        send(&f.session, &auth_request("s1", None)).await;
        let session = f.session.clone();
        tokio::spawn(async move { session.serve_streams().await });

        let mut client = f.peer.open_stream();
        client
            .write_all(&encode_tcp_request("example.com:443").unwrap())
            .await
            .unwrap();
        let (ok, message) = read_tcp_response(&mut client).await.unwrap();
        assert!(ok);
        assert!(message.is_empty());
        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello from example.com:443");

        let connections = f.handler.connections.lock();
        assert_eq!(connections.len(), 1);
        let (user, metadata) = &connections[0];
        assert_eq!(*user, "U1");
        assert_eq!(metadata.source, REMOTE.parse::<SocketAddr>().unwrap());
        assert_eq!(
            metadata.destination,
            NetLocation::from_str("example.com:443", None).unwrap()
        );
    }

    #[tokio::test]
    async fn test_invalid_destination_gets_failure_response() {
        let f = fixture(ServiceConfig::default());
        send(&f.session, &auth_request("s1", None)).await;
        let session = f.session.clone();
        tokio::spawn(async move { session.serve_streams().await });

        let mut client = f.peer.open_stream();
        client
            .write_all(&encode_tcp_request("no-port").unwrap())
            .await
            .unwrap();
        let (ok, message) = read_tcp_response(&mut client).await.unwrap();
        assert!(!ok);
        assert!(!message.is_empty());
        assert!(f.handler.connections.lock().is_empty());
        // the connection survives a bad stream
        assert_eq!(f.session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_closes_once() {
        let f = fixture(ServiceConfig::default());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let session = f.session.clone();
            tasks.push(tokio::spawn(async move {
                let err = if i % 2 == 0 {
                    canceled_error()
                } else {
                    closed_error("stream exhausted")
                };
                session.close_with_error(err)
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(f.transport.close_count.load(Ordering::SeqCst), 1);
        assert_eq!(f.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_closes_authenticated_connection() {
        let shutdown = CancellationToken::new();
        let f = fixture(ServiceConfig {
            shutdown: Some(shutdown.clone()),
            udp_disabled: true,
            ..Default::default()
        });
        send(&f.session, &auth_request("s1", None)).await;

        shutdown.cancel();
        tokio::time::timeout(
            Duration::from_secs(5),
            f.session.connection_done().cancelled(),
        )
        .await
        .unwrap();

        // natural completion racing the shutdown is a no-op
        assert!(!f.session.close_with_error(closed_error("streams done")));
        assert_eq!(f.transport.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_udp_sessions_keyed_by_id() {
        let mut f = fixture(ServiceConfig::default());
        send(&f.session, &auth_request("s1", None)).await;

        f.peer
            .datagrams
            .send(Bytes::from_static(&[0, 0, 0, 9, b'p', b'i', b'n', b'g']))
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), f.peer.sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.as_ref(), b"\x00\x00\x00\x09echo:ping");
        assert!(f.session.udp_sessions().contains(9));

        f.peer
            .datagrams
            .send(Bytes::from_static(&[0, 0, 0, 9, b'a', b'g', b'a', b'i', b'n']))
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), f.peer.sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.as_ref(), b"\x00\x00\x00\x09echo:again");

        assert_eq!(*f.handler.packet_sessions.lock(), vec![("U1", 9)]);
    }

    #[tokio::test]
    async fn test_datagram_error_closes_connection() {
        let f = fixture(ServiceConfig::default());
        send(&f.session, &auth_request("s1", None)).await;

        drop(f.peer.datagrams);
        tokio::time::timeout(
            Duration::from_secs(5),
            f.session.connection_done().cancelled(),
        )
        .await
        .unwrap();
        assert_eq!(f.transport.close_count.load(Ordering::SeqCst), 1);
    }
}
