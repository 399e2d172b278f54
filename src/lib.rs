//! Server side of the Hysteria2 protocol.
//!
//! A [`Hysteria2Server`] accepts QUIC connections, authenticates each one over
//! HTTP/3 against a [`UserRegistry`], installs the negotiated congestion controller
//! and then hands proxied TCP streams and UDP sessions to a [`ServerHandler`].
//! Every other HTTP/3 request, before or after authentication, is answered by a
//! [`MasqueradeHandler`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ::hysteria2_server::*;
//! # async fn run(handler: Arc<dyn ServerHandler<String>>, cert: &[u8], key: &[u8]) -> std::io::Result<()> {
//! let settings = ServiceSettings::from_yaml("up: 100 mbps\ndown: 100 mbps\n")?;
//! let tls = create_server_config(cert, key, &[])?;
//! let server = Hysteria2Server::new(settings.into_config()?, tls, handler)?;
//! server.update_users(vec!["alice".to_string()], vec!["secret".to_string()])?;
//! server.start(std::net::UdpSocket::bind("0.0.0.0:443")?)?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod async_stream;
pub mod config;
pub mod congestion;
pub mod error_util;
pub mod h3_transport;
pub mod hysteria2_protocol;
pub mod hysteria2_server;
pub mod hysteria2_session;
pub mod hysteria2_stream;
pub mod masquerade;
pub mod quic_stream;
pub mod rustls_util;
pub mod salamander;
pub mod server_handler;
pub mod udp_session;
pub mod user_registry;

pub use address::{Address, NetLocation};
pub use async_stream::AsyncStream;
pub use config::{Bandwidth, QuicTuning, ServiceConfig, ServiceSettings};
pub use congestion::{CongestionChoice, CongestionDecision, select_congestion_control};
pub use hysteria2_server::Hysteria2Server;
pub use hysteria2_session::{Hysteria2Session, SessionState, TransportConnection};
pub use hysteria2_stream::Hysteria2Stream;
pub use masquerade::{
    BufferedExchange, HttpExchange, MasqueradeHandler, NotFoundHandler, StringHandler,
};
pub use rustls_util::create_server_config;
pub use server_handler::{AuthContext, Metadata, ServerHandler};
pub use udp_session::UdpPacketSession;
pub use user_registry::{Identity, UserRegistry};
