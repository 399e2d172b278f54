//! Salamander packet obfuscation.
//!
//! Every UDP datagram on the wire is `salt (8 bytes) || payload XOR key`, where the
//! key is `BLAKE2b-256(password || salt)` repeated over the payload. The QUIC
//! endpoint sees plain QUIC datagrams through [`SalamanderSocket`].

use std::fmt::Debug;
use std::io::IoSliceMut;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use rand::RngCore;

pub const SALT_LENGTH: usize = 8;
pub const MIN_PASSWORD_LENGTH: usize = 4;

const KEY_LENGTH: usize = 32;

type Blake2b256 = Blake2b<U32>;

pub struct Salamander {
    password: Vec<u8>,
}

impl Debug for Salamander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Salamander").finish_non_exhaustive()
    }
}

impl Salamander {
    pub fn new(password: &[u8]) -> std::io::Result<Self> {
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("salamander password must be at least {MIN_PASSWORD_LENGTH} bytes"),
            ));
        }
        Ok(Self {
            password: password.to_vec(),
        })
    }

    fn key(&self, salt: &[u8]) -> [u8; KEY_LENGTH] {
        let mut hasher = Blake2b256::new();
        hasher.update(&self.password);
        hasher.update(salt);
        hasher.finalize().into()
    }

    /// Appends the obfuscated form of `payload` to `out`.
    pub fn obfuscate(&self, payload: &[u8], out: &mut Vec<u8>) {
        let mut salt = [0u8; SALT_LENGTH];
        rand::rng().fill_bytes(&mut salt);
        let key = self.key(&salt);
        out.reserve(SALT_LENGTH + payload.len());
        out.extend_from_slice(&salt);
        out.extend(
            payload
                .iter()
                .zip(key.iter().cycle())
                .map(|(byte, key_byte)| byte ^ key_byte),
        );
    }

    /// Decodes `datagram` in place, returning the payload length, or `None` when the
    /// datagram is too short to carry a salt.
    pub fn deobfuscate_in_place(&self, datagram: &mut [u8]) -> Option<usize> {
        if datagram.len() <= SALT_LENGTH {
            return None;
        }
        let key = self.key(&datagram[..SALT_LENGTH]);
        let payload_len = datagram.len() - SALT_LENGTH;
        for i in 0..payload_len {
            datagram[i] = datagram[SALT_LENGTH + i] ^ key[i % KEY_LENGTH];
        }
        Some(payload_len)
    }
}

/// UDP socket wrapper applying [`Salamander`] to every datagram.
///
/// Segmented sends and coalesced receives are handled per segment, each segment
/// carrying its own salt.
#[derive(Debug)]
pub struct SalamanderSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    salamander: Salamander,
}

impl SalamanderSocket {
    pub fn new(inner: Arc<dyn AsyncUdpSocket>, salamander: Salamander) -> Self {
        Self { inner, salamander }
    }

    /// Decodes the segments of one received buffer, compacting them so they stay
    /// `stride - SALT_LENGTH` apart.
    fn decode_received(&self, buf: &mut [u8], meta: &mut RecvMeta) {
        let stride = meta.stride.max(1);
        let mut read = 0;
        let mut write = 0;
        while read < meta.len {
            let end = (read + stride).min(meta.len);
            if let Some(payload_len) = self.salamander.deobfuscate_in_place(&mut buf[read..end]) {
                buf.copy_within(read..read + payload_len, write);
                write += payload_len;
            }
            read = end;
        }
        meta.len = write;
        meta.stride = stride.saturating_sub(SALT_LENGTH).max(1);
    }
}

impl AsyncUdpSocket for SalamanderSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> std::io::Result<()> {
        let segment_size = transmit
            .segment_size
            .filter(|size| *size > 0)
            .unwrap_or(transmit.contents.len());
        let mut contents = Vec::with_capacity(
            transmit.contents.len()
                + SALT_LENGTH * transmit.contents.len().div_ceil(segment_size.max(1)),
        );
        for segment in transmit.contents.chunks(segment_size.max(1)) {
            self.salamander.obfuscate(segment, &mut contents);
        }
        self.inner.try_send(&Transmit {
            destination: transmit.destination,
            ecn: transmit.ecn,
            contents: &contents,
            segment_size: transmit.segment_size.map(|size| size + SALT_LENGTH),
            src_ip: transmit.src_ip,
        })
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<std::io::Result<usize>> {
        let count = match self.inner.poll_recv(cx, bufs, meta) {
            Poll::Ready(Ok(count)) => count,
            other => return other,
        };
        for (buf, meta) in bufs.iter_mut().zip(meta.iter_mut()).take(count) {
            // undecodable datagrams are left empty, which quinn ignores
            self.decode_received(buf, meta);
        }
        Poll::Ready(Ok(count))
    }

    fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}
