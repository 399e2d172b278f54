use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{RecvStream, SendStream, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::async_stream::AsyncStream;

/// Error code sent with STOP_SENDING when a stream is declined.
const STREAM_DECLINED: VarInt = VarInt::from_u32(0);

/// Both halves of an accepted bidirectional QUIC stream.
pub struct QuicStream {
    send_stream: SendStream,
    recv_stream: RecvStream,
    read_cancelled: bool,
}

impl QuicStream {
    pub fn new(send_stream: SendStream, recv_stream: RecvStream) -> Self {
        Self {
            send_stream,
            recv_stream,
            read_cancelled: false,
        }
    }

    pub fn id(&self) -> quinn::StreamId {
        self.send_stream.id()
    }

    pub fn into_parts(self) -> (SendStream, RecvStream) {
        (self.send_stream, self.recv_stream)
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recv_stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().send_stream)
            .poll_write(cx, buf)
            .map_err(std::io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // quinn sends buffered data on its own
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().send_stream).poll_shutdown(cx)
    }
}

impl AsyncStream for QuicStream {
    fn cancel_read(&mut self) {
        if self.read_cancelled {
            return;
        }
        self.read_cancelled = true;
        // fails only when the peer already finished or reset the stream
        let _ = self.recv_stream.stop(STREAM_DECLINED);
    }
}
