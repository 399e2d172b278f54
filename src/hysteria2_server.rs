//! Hysteria2 service: QUIC listener, accept loop and per-connection driver.
//!
//! Every connection is served as HTTP/3 for as long as it lives. The session
//! accepts all bidirectional streams itself: proxied TCP streams stay with it, and
//! everything else is handed to the h3 server through [`H3Connection`]. Each
//! HTTP/3 request runs on its own task. Datagrams carry UDP sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h3::error::ErrorLevel;
use h3::server::RequestStream;
use log::{debug, error};
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{AsyncUdpSocket, EndpointConfig, IdleTimeout, MtuDiscoveryConfig, VarInt};
use tokio::sync::mpsc;

use crate::config::ServiceConfig;
use crate::congestion::{CongestionChoice, CongestionHandle, SwitchableControllerFactory};
use crate::error_util::{closed_error, from_connection_error, is_closed_or_canceled};
use crate::h3_transport::{H3BidiStream, H3Connection};
use crate::hysteria2_session::{Hysteria2Session, TransportConnection};
use crate::masquerade::HttpExchange;
use crate::quic_stream::QuicStream;
use crate::salamander::{SALT_LENGTH, Salamander, SalamanderSocket};
use crate::server_handler::ServerHandler;
use crate::udp_session::DatagramSender;
use crate::user_registry::{Identity, UserRegistry};

const DEFAULT_ALPN: &[u8] = b"h3";

/// quinn's defaults: Ethernet MTU less IP and UDP headers, and its MTU discovery
/// ceiling.
const DEFAULT_MAX_UDP_PAYLOAD: u16 = 1472;
const DEFAULT_MTU_UPPER_BOUND: u16 = 1452;

/// UDP payload sizes quinn may use. Obfuscation prepends a salt to every packet,
/// so both limits shrink by its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PacketLimits {
    max_udp_payload: u16,
    mtu_upper_bound: u16,
}

impl PacketLimits {
    fn new(obfuscated: bool) -> Self {
        let overhead = if obfuscated { SALT_LENGTH as u16 } else { 0 };
        Self {
            max_udp_payload: DEFAULT_MAX_UDP_PAYLOAD - overhead,
            mtu_upper_bound: DEFAULT_MTU_UPPER_BOUND - overhead,
        }
    }
}

/// [`TransportConnection`] over a quinn connection.
pub struct QuinnConnection {
    connection: quinn::Connection,
    congestion: CongestionHandle,
    h3_streams: mpsc::UnboundedSender<H3BidiStream>,
}

impl QuinnConnection {
    pub fn new(
        connection: quinn::Connection,
        congestion: CongestionHandle,
        h3_streams: mpsc::UnboundedSender<H3BidiStream>,
    ) -> Self {
        Self {
            connection,
            congestion,
            h3_streams,
        }
    }
}

impl DatagramSender for QuinnConnection {
    fn send_datagram(&self, data: Bytes) -> std::io::Result<()> {
        self.connection.send_datagram(data).map_err(|err| match err {
            quinn::SendDatagramError::ConnectionLost(err) => from_connection_error(err),
            err => std::io::Error::other(err),
        })
    }
}

#[async_trait]
impl TransportConnection for QuinnConnection {
    type Stream = QuicStream;

    async fn accept_stream(&self) -> std::io::Result<QuicStream> {
        let (send_stream, recv_stream) = self
            .connection
            .accept_bi()
            .await
            .map_err(from_connection_error)?;
        Ok(QuicStream::new(send_stream, recv_stream))
    }

    fn forward_stream(&self, stream: QuicStream, prefix: Bytes) -> std::io::Result<()> {
        let (send_stream, recv_stream) = stream.into_parts();
        let stream =
            H3BidiStream::new(send_stream, recv_stream, prefix).map_err(std::io::Error::other)?;
        self.h3_streams
            .send(stream)
            .map_err(|_| closed_error("HTTP/3 server stopped"))
    }

    async fn read_datagram(&self) -> std::io::Result<Bytes> {
        self.connection
            .read_datagram()
            .await
            .map_err(from_connection_error)
    }

    fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    fn set_congestion_control(&self, choice: CongestionChoice) {
        self.congestion.install(choice);
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"");
    }
}

struct ServerContext<U: Identity> {
    config: Arc<ServiceConfig>,
    users: Arc<UserRegistry<U>>,
    handler: Arc<dyn ServerHandler<U>>,
    crypto: Arc<QuicServerConfig>,
}

impl<U: Identity> ServerContext<U> {
    fn packet_limits(&self) -> PacketLimits {
        PacketLimits::new(self.config.salamander_password.is_some())
    }

    fn endpoint_config(&self) -> std::io::Result<EndpointConfig> {
        let mut endpoint_config = EndpointConfig::default();
        endpoint_config
            .max_udp_payload_size(self.packet_limits().max_udp_payload)
            .map_err(std::io::Error::other)?;
        Ok(endpoint_config)
    }

    /// Every connection gets its own transport config so its congestion controller
    /// can be chosen after authentication.
    fn connection_server_config(
        &self,
        congestion_factory: Arc<SwitchableControllerFactory>,
    ) -> std::io::Result<quinn::ServerConfig> {
        let quic = &self.config.quic;
        let mut transport = quinn::TransportConfig::default();
        transport
            .stream_receive_window(
                VarInt::from_u64(quic.stream_receive_window).map_err(std::io::Error::other)?,
            )
            .receive_window(
                VarInt::from_u64(quic.connection_receive_window).map_err(std::io::Error::other)?,
            )
            .max_concurrent_bidi_streams(
                VarInt::from_u64(quic.max_incoming_streams).map_err(std::io::Error::other)?,
            )
            .max_idle_timeout(Some(
                IdleTimeout::try_from(quic.max_idle_timeout).map_err(std::io::Error::other)?,
            ))
            .keep_alive_interval(Some(quic.keep_alive_period))
            .congestion_controller_factory(congestion_factory);
        if quic.disable_path_mtu_discovery {
            transport.mtu_discovery_config(None);
        } else {
            let mut mtu_discovery = MtuDiscoveryConfig::default();
            mtu_discovery.upper_bound(self.packet_limits().mtu_upper_bound);
            transport.mtu_discovery_config(Some(mtu_discovery));
        }
        if !self.config.udp_enabled() {
            transport.datagram_receive_buffer_size(None);
        }

        let mut server_config = quinn::ServerConfig::with_crypto(self.crypto.clone());
        server_config.transport_config(Arc::new(transport));
        Ok(server_config)
    }

    /// Errors are only returned for connections that never got a session; once a
    /// session exists it reports its own teardown.
    async fn process_connection(&self, incoming: quinn::Incoming) -> std::io::Result<()> {
        let (congestion_factory, congestion) =
            SwitchableControllerFactory::new(self.config.brutal_debug);
        let server_config = self.connection_server_config(congestion_factory)?;
        let connection = incoming
            .accept_with(Arc::new(server_config))
            .map_err(from_connection_error)?
            .await
            .map_err(from_connection_error)?;

        let (h3_connection, h3_streams) = H3Connection::new(connection.clone());
        let transport = Arc::new(QuinnConnection::new(
            connection.clone(),
            congestion,
            h3_streams,
        ));
        let session = Hysteria2Session::new(
            transport,
            self.config.clone(),
            self.users.clone(),
            self.handler.clone(),
        );

        let reason = match serve_session(&session, &connection, h3_connection).await {
            Ok(()) => closed_error("connection finished"),
            Err(err) => err,
        };
        session.close_with_error(reason);
        Ok(())
    }
}

async fn serve_session<U: Identity>(
    session: &Arc<Hysteria2Session<U, QuinnConnection>>,
    connection: &quinn::Connection,
    h3_connection: H3Connection,
) -> std::io::Result<()> {
    let mut h3_conn: h3::server::Connection<H3Connection, Bytes> =
        h3::server::Connection::new(h3_connection)
            .await
            .map_err(std::io::Error::other)?;

    tokio::select! {
        result = session.serve_streams() => result,
        result = serve_requests(session, connection, &mut h3_conn) => result,
    }
}

async fn serve_requests<U: Identity>(
    session: &Arc<Hysteria2Session<U, QuinnConnection>>,
    connection: &quinn::Connection,
    h3_conn: &mut h3::server::Connection<H3Connection, Bytes>,
) -> std::io::Result<()> {
    loop {
        match h3_conn.accept().await {
            Ok(Some((request, stream))) => {
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_request(&session, request, stream).await {
                        debug!("{}: failed to serve request: {}", session.remote_address(), e);
                    }
                });
            }
            Ok(None) => return Err(closed_error("HTTP/3 connection closed")),
            Err(err) if err.get_error_level() == ErrorLevel::StreamError => {
                debug!("{}: bad request stream: {}", session.remote_address(), err);
            }
            Err(err) => {
                return Err(match connection.close_reason() {
                    Some(reason) => from_connection_error(reason),
                    None => std::io::Error::other(err),
                });
            }
        }
    }
}

/// One HTTP/3 request stream.
struct H3Exchange {
    stream: RequestStream<H3BidiStream, Bytes>,
    response_sent: bool,
}

#[async_trait]
impl HttpExchange for H3Exchange {
    async fn recv_data(&mut self) -> std::io::Result<Option<Bytes>> {
        let chunk = self
            .stream
            .recv_data()
            .await
            .map_err(std::io::Error::other)?;
        Ok(chunk.map(|mut chunk| chunk.copy_to_bytes(chunk.remaining())))
    }

    async fn send_response(&mut self, response: http::Response<()>) -> std::io::Result<()> {
        self.stream
            .send_response(response)
            .await
            .map_err(std::io::Error::other)?;
        self.response_sent = true;
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
        self.stream
            .send_data(data)
            .await
            .map_err(std::io::Error::other)
    }
}

async fn serve_request<U: Identity>(
    session: &Arc<Hysteria2Session<U, QuinnConnection>>,
    request: http::Request<()>,
    stream: RequestStream<H3BidiStream, Bytes>,
) -> std::io::Result<()> {
    let mut exchange = H3Exchange {
        stream,
        response_sent: false,
    };
    session.handle_request(&request, &mut exchange).await?;
    // a handler that sent nothing answers 200 with an empty body
    if !exchange.response_sent {
        exchange.send_response(http::Response::new(())).await?;
    }
    exchange
        .stream
        .finish()
        .await
        .map_err(std::io::Error::other)
}

async fn run_accept_loop<U: Identity>(endpoint: quinn::Endpoint, context: Arc<ServerContext<U>>) {
    while let Some(incoming) = endpoint.accept().await {
        let context = context.clone();
        tokio::spawn(async move {
            let remote_address = incoming.remote_address();
            if let Err(e) = context.process_connection(incoming).await {
                if is_closed_or_canceled(&e) {
                    debug!("{remote_address}: connection not established: {e}");
                } else {
                    error!("{remote_address}: failed to establish connection: {e}");
                }
            }
        });
    }
    debug!("listener closed");
}

/// Hysteria2 server. Create with [`Hysteria2Server::new`], then [`start`] it on a
/// bound UDP socket.
///
/// [`start`]: Hysteria2Server::start
pub struct Hysteria2Server<U: Identity> {
    context: Arc<ServerContext<U>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl<U: Identity> Hysteria2Server<U> {
    pub fn new(
        config: ServiceConfig,
        mut tls_config: rustls::ServerConfig,
        handler: Arc<dyn ServerHandler<U>>,
    ) -> std::io::Result<Self> {
        let config = config.with_defaults();
        if let Some(password) = config.salamander_password.as_ref() {
            Salamander::new(password.as_bytes())?;
        }

        if tls_config.alpn_protocols.is_empty() {
            tls_config.alpn_protocols = vec![DEFAULT_ALPN.to_vec()];
        }
        let crypto = QuicServerConfig::try_from(tls_config).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unusable TLS config: {err}"),
            )
        })?;

        Ok(Self {
            context: Arc::new(ServerContext {
                config: Arc::new(config),
                users: Arc::new(UserRegistry::new()),
                handler,
                crypto: Arc::new(crypto),
            }),
            endpoint: Mutex::new(None),
        })
    }

    pub fn update_users(&self, users: Vec<U>, passwords: Vec<String>) -> std::io::Result<()> {
        self.context.users.update_users(users, passwords)
    }

    pub fn users(&self) -> &Arc<UserRegistry<U>> {
        &self.context.users
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.context.config
    }

    /// Starts serving on `socket` and returns its local address. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, socket: std::net::UdpSocket) -> std::io::Result<SocketAddr> {
        let mut endpoint_slot = self.endpoint.lock();
        if endpoint_slot.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "server already started",
            ));
        }

        socket.set_nonblocking(true)?;
        let runtime: Arc<dyn quinn::Runtime> = Arc::new(quinn::TokioRuntime);
        let mut udp_socket: Arc<dyn AsyncUdpSocket> = runtime.wrap_udp_socket(socket)?;
        if let Some(password) = self.context.config.salamander_password.as_ref() {
            udp_socket = Arc::new(SalamanderSocket::new(
                udp_socket,
                Salamander::new(password.as_bytes())?,
            ));
        }

        // incoming connections are accepted with their own config, this one is only
        // needed so the endpoint accepts handshakes at all
        let (default_factory, _) = SwitchableControllerFactory::new(false);
        let default_config = self.context.connection_server_config(default_factory)?;

        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            self.context.endpoint_config()?,
            Some(default_config),
            udp_socket,
            runtime,
        )?;
        let local_addr = endpoint.local_addr()?;

        tokio::spawn(run_accept_loop(endpoint.clone(), self.context.clone()));
        *endpoint_slot = Some(endpoint);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
    }

    /// Closes the listener and every connection on it. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(VarInt::from_u32(0), b"");
        }
    }
}

impl<U: Identity> Drop for Hysteria2Server<U> {
    fn drop(&mut self) {
        self.close();
    }
}
