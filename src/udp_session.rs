//! UDP session table of one connection.
//!
//! Every datagram starts with a big-endian u32 session id. The remaining bytes are
//! opaque here: they are queued to the [`UdpPacketSession`] owning that id, and the
//! handler interprets them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;

use crate::error_util::closed_error;

pub const SESSION_ID_LENGTH: usize = 4;

const SESSION_QUEUE_SIZE: usize = 128;

/// Sends a raw datagram on the connection.
pub trait DatagramSender: Send + Sync {
    fn send_datagram(&self, data: Bytes) -> std::io::Result<()>;
}

/// Splits a datagram into its session id and payload.
pub fn split_datagram(datagram: Bytes) -> Option<(u32, Bytes)> {
    if datagram.len() < SESSION_ID_LENGTH {
        return None;
    }
    let mut id = [0u8; SESSION_ID_LENGTH];
    id.copy_from_slice(&datagram[..SESSION_ID_LENGTH]);
    Some((u32::from_be_bytes(id), datagram.slice(SESSION_ID_LENGTH..)))
}

pub enum Delivery {
    Delivered,
    /// Queue full or session ending; the payload was dropped.
    Dropped,
    /// No session with this id, payload handed back.
    UnknownSession(Bytes),
}

#[derive(Default)]
pub struct UdpSessionTable {
    sessions: RwLock<HashMap<u32, mpsc::Sender<Bytes>>>,
}

impl UdpSessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, session_id: u32, payload: Bytes) -> Delivery {
        let sessions = self.sessions.read();
        let Some(sender) = sessions.get(&session_id) else {
            return Delivery::UnknownSession(payload);
        };
        match sender.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                debug!("udp session {session_id} queue full, dropping packet");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// Registers `session_id` and returns the receiving end of its queue, or `None`
    /// when the id is already taken.
    pub fn insert(&self, session_id: u32) -> Option<mpsc::Receiver<Bytes>> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session_id) {
            return None;
        }
        let (sender, receiver) = mpsc::channel(SESSION_QUEUE_SIZE);
        sessions.insert(session_id, sender);
        Some(receiver)
    }

    pub fn remove(&self, session_id: u32) {
        self.sessions.write().remove(&session_id);
    }

    pub fn clear(&self) {
        self.sessions.write().clear();
    }

    pub fn contains(&self, session_id: u32) -> bool {
        self.sessions.read().contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One UDP flow of a connection, as seen by the handler.
pub struct UdpPacketSession {
    session_id: u32,
    receiver: mpsc::Receiver<Bytes>,
    sender: Arc<dyn DatagramSender>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for UdpPacketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPacketSession")
            .field("session_id", &self.session_id)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl UdpPacketSession {
    pub fn new(
        session_id: u32,
        receiver: mpsc::Receiver<Bytes>,
        sender: Arc<dyn DatagramSender>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            receiver,
            sender,
            idle_timeout,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Waits for the next payload from the client. Fails with `TimedOut` once the
    /// session has been idle for the configured UDP timeout.
    pub async fn read_message(&mut self) -> std::io::Result<Bytes> {
        match timeout(self.idle_timeout, self.receiver.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(closed_error("udp session closed")),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("udp session {} idle timeout", self.session_id),
            )),
        }
    }

    /// Sends `payload` to the client, prefixed with this session's id.
    pub fn write_message(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut datagram = BytesMut::with_capacity(SESSION_ID_LENGTH + payload.len());
        datagram.put_u32(self.session_id);
        datagram.extend_from_slice(payload);
        self.sender.send_datagram(datagram.freeze())
    }
}
