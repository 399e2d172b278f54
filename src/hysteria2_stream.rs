//! Proxied TCP stream handed to the [`ServerHandler`](crate::server_handler::ServerHandler).
//!
//! Every proxied stream starts with exactly one TCP response frame. The frame is
//! written lazily: an explicit success or failure signal sends it on its own, while
//! a first write before any signal sends a success frame with the written bytes
//! appended, saving a round trip. Those bytes count as written as soon as they are
//! in the frame; a flush, a shutdown or the next write drives out whatever is left.

use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::async_stream::AsyncStream;
use crate::error_util::{closed_error, wrap_quic_error};
use crate::hysteria2_protocol::encode_tcp_response;

const RESPONSE_ALREADY_WRITTEN: &str = "response already written";

enum ResponseState {
    NoResponseYet,
    Writing {
        frame: BytesMut,
        written: usize,
        success: bool,
    },
    Sent {
        success: bool,
    },
}

pub struct Hysteria2Stream {
    stream: Box<dyn AsyncStream>,
    state: ResponseState,
}

impl std::fmt::Debug for Hysteria2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hysteria2Stream")
            .field("response_written", &self.is_response_written())
            .finish()
    }
}

impl Hysteria2Stream {
    pub fn new(stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream,
            state: ResponseState::NoResponseYet,
        }
    }

    pub fn is_response_written(&self) -> bool {
        !matches!(self.state, ResponseState::NoResponseYet)
    }

    /// Sends a success frame. Does nothing when a success response was already sent,
    /// explicitly or by a write.
    pub async fn handshake_success(&mut self) -> std::io::Result<()> {
        match self.state {
            ResponseState::NoResponseYet => {
                self.state = ResponseState::Writing {
                    frame: encode_tcp_response(true, "", &[])?,
                    written: 0,
                    success: true,
                };
            }
            ResponseState::Writing { success: true, .. }
            | ResponseState::Sent { success: true } => {}
            ResponseState::Writing { success: false, .. }
            | ResponseState::Sent { success: false } => {
                return Err(closed_error(RESPONSE_ALREADY_WRITTEN));
            }
        }
        self.send_response().await
    }

    /// Sends a failure frame carrying the text of `err`.
    pub async fn handshake_failure(&mut self, err: &std::io::Error) -> std::io::Result<()> {
        if self.is_response_written() {
            return Err(closed_error(RESPONSE_ALREADY_WRITTEN));
        }
        self.state = ResponseState::Writing {
            frame: encode_tcp_response(false, &err.to_string(), &[])?,
            written: 0,
            success: false,
        };
        self.send_response().await
    }

    /// Stops reading and finishes the write half.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.stream.cancel_read();
        self.shutdown().await
    }

    /// Streams have no addresses of their own; the connection holds the peer address.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }

    async fn send_response(&mut self) -> std::io::Result<()> {
        std::future::poll_fn(|cx| self.poll_send_response(cx)).await?;
        self.stream.flush().await.map_err(wrap_quic_error)
    }

    /// Drives a pending response frame to completion.
    fn poll_send_response(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let ResponseState::Writing {
            frame,
            written,
            success,
        } = &mut self.state
        else {
            return Poll::Ready(Ok(()));
        };

        while *written < frame.len() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &frame[*written..]))
                .map_err(wrap_quic_error)?;
            if n == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write response frame",
                )));
            }
            *written += n;
        }

        self.state = ResponseState::Sent { success: *success };
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for Hysteria2Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream)
            .poll_read(cx, buf)
            .map_err(wrap_quic_error)
    }
}

impl AsyncWrite for Hysteria2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match this.state {
                ResponseState::NoResponseYet => {
                    // the first write doubles as the success response
                    this.state = ResponseState::Writing {
                        frame: encode_tcp_response(true, "", buf)?,
                        written: 0,
                        success: true,
                    };
                    if let Poll::Ready(Err(e)) = this.poll_send_response(cx) {
                        return Poll::Ready(Err(e));
                    }
                    return Poll::Ready(Ok(buf.len()));
                }
                ResponseState::Writing { .. } => {
                    ready!(this.poll_send_response(cx))?;
                }
                ResponseState::Sent { .. } => {
                    return Pin::new(&mut this.stream)
                        .poll_write(cx, buf)
                        .map_err(wrap_quic_error);
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_response(cx))?;
        Pin::new(&mut this.stream)
            .poll_flush(cx)
            .map_err(wrap_quic_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_response(cx))?;
        Pin::new(&mut this.stream)
            .poll_shutdown(cx)
            .map_err(wrap_quic_error)
    }
}

impl AsyncStream for Hysteria2Stream {
    fn cancel_read(&mut self) {
        self.stream.cancel_read();
    }
}
