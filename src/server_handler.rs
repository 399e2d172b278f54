use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::hysteria2_stream::Hysteria2Stream;
use crate::udp_session::UdpPacketSession;
use crate::user_registry::Identity;

/// Passed to the handler with every proxied stream or packet flow.
#[derive(Debug, Clone)]
pub struct AuthContext<U> {
    pub user: U,
    /// Cancelled when the transport connection carrying the flow is torn down.
    pub connection_done: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Transport peer address.
    pub source: SocketAddr,
    /// Requested target. Unspecified for packet flows, whose packets carry their own
    /// destinations.
    pub destination: NetLocation,
}

/// Receives the proxied flows of authenticated connections.
#[async_trait]
pub trait ServerHandler<U: Identity>: Send + Sync {
    /// Handles one proxied TCP stream. The stream has not been answered yet: the
    /// handler signals success or failure on it, or simply writes, which implies
    /// success. The stream is closed once this returns.
    async fn new_connection(
        &self,
        context: AuthContext<U>,
        stream: &mut Hysteria2Stream,
        metadata: Metadata,
    ) -> std::io::Result<()>;

    async fn new_packet_connection(
        &self,
        context: AuthContext<U>,
        session: UdpPacketSession,
        metadata: Metadata,
    ) -> std::io::Result<()>;
}
