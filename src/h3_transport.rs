//! HTTP/3 transport over a quinn connection whose bidirectional streams are
//! accepted by the session.
//!
//! The session reads the frame type of every incoming bidirectional stream.
//! Proxied TCP streams stay with the session. Every other stream is sent, along
//! with the bytes already read from it, to [`H3Connection`], which hands it to the
//! h3 server as if it had been accepted directly. Unidirectional streams and
//! stream opening go straight to quinn.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use h3::quic::{self, OpenStreams as _, RecvStream as _, SendStream as _, StreamId, WriteBuf};
use quinn::VarInt;
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 16 * 1024;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + Sync>>;
type OpenBi = BoxFuture<Result<(quinn::SendStream, quinn::RecvStream), quinn::ConnectionError>>;
type OpenUni = BoxFuture<Result<quinn::SendStream, quinn::ConnectionError>>;
type AcceptUni = BoxFuture<Result<quinn::RecvStream, quinn::ConnectionError>>;

#[derive(Debug)]
pub enum TransportError {
    Connection(quinn::ConnectionError),
    Read(quinn::ReadError),
    Write(quinn::WriteError),
    Closed(quinn::ClosedStream),
    /// `send_data` was called before the previous write drained.
    NotReady,
    InvalidStreamId(u64),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "connection lost: {err}"),
            Self::Read(err) => write!(f, "read failed: {err}"),
            Self::Write(err) => write!(f, "write failed: {err}"),
            Self::Closed(err) => write!(f, "{err}"),
            Self::NotReady => write!(f, "previous write still pending"),
            Self::InvalidStreamId(id) => write!(f, "invalid stream id {id}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    fn connection_error(&self) -> Option<&quinn::ConnectionError> {
        match self {
            Self::Connection(err)
            | Self::Read(quinn::ReadError::ConnectionLost(err))
            | Self::Write(quinn::WriteError::ConnectionLost(err)) => Some(err),
            _ => None,
        }
    }
}

impl quic::Error for TransportError {
    fn is_timeout(&self) -> bool {
        matches!(
            self.connection_error(),
            Some(quinn::ConnectionError::TimedOut)
        )
    }

    fn err_code(&self) -> Option<u64> {
        match self {
            Self::Read(quinn::ReadError::Reset(code))
            | Self::Write(quinn::WriteError::Stopped(code)) => Some(code.into_inner()),
            _ => match self.connection_error() {
                Some(quinn::ConnectionError::ApplicationClosed(close)) => {
                    Some(close.error_code.into_inner())
                }
                _ => None,
            },
        }
    }
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(err: quinn::ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<quinn::ReadError> for TransportError {
    fn from(err: quinn::ReadError) -> Self {
        Self::Read(err)
    }
}

impl From<quinn::WriteError> for TransportError {
    fn from(err: quinn::WriteError) -> Self {
        Self::Write(err)
    }
}

impl From<quinn::ClosedStream> for TransportError {
    fn from(err: quinn::ClosedStream) -> Self {
        Self::Closed(err)
    }
}

fn to_stream_id(id: quinn::StreamId) -> Result<StreamId, TransportError> {
    let id = quinn::VarInt::from(id).into_inner();
    StreamId::try_from(id).map_err(|_| TransportError::InvalidStreamId(id))
}

fn to_var_int(code: u64) -> VarInt {
    VarInt::from_u64(code).unwrap_or(VarInt::MAX)
}

/// Receive half. Bytes the session already consumed are replayed first.
pub struct H3RecvStream {
    stream: quinn::RecvStream,
    prefix: Bytes,
    id: StreamId,
    read_buf: Box<[u8]>,
}

impl H3RecvStream {
    pub fn new(stream: quinn::RecvStream, prefix: Bytes) -> Result<Self, TransportError> {
        let id = to_stream_id(stream.id())?;
        Ok(Self {
            stream,
            prefix,
            id,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
        })
    }
}

impl quic::RecvStream for H3RecvStream {
    type Buf = Bytes;
    type Error = TransportError;

    fn poll_data(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<Bytes>, TransportError>> {
        if !self.prefix.is_empty() {
            return Poll::Ready(Ok(Some(std::mem::take(&mut self.prefix))));
        }
        let read = ready!(self.stream.poll_read(cx, &mut self.read_buf))?;
        if read == 0 {
            return Poll::Ready(Ok(None));
        }
        Poll::Ready(Ok(Some(Bytes::copy_from_slice(&self.read_buf[..read]))))
    }

    fn stop_sending(&mut self, error_code: u64) {
        let _ = self.stream.stop(to_var_int(error_code));
    }

    fn recv_id(&self) -> StreamId {
        self.id
    }
}

pub struct H3SendStream {
    stream: quinn::SendStream,
    writing: Option<WriteBuf<Bytes>>,
    id: StreamId,
}

impl H3SendStream {
    pub fn new(stream: quinn::SendStream) -> Result<Self, TransportError> {
        let id = to_stream_id(stream.id())?;
        Ok(Self {
            stream,
            writing: None,
            id,
        })
    }
}

impl quic::SendStream<Bytes> for H3SendStream {
    type Error = TransportError;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TransportError>> {
        while let Some(data) = self.writing.as_mut() {
            if !data.has_remaining() {
                self.writing = None;
                break;
            }
            let written = ready!(Pin::new(&mut self.stream).poll_write(cx, data.chunk()))?;
            data.advance(written);
        }
        Poll::Ready(Ok(()))
    }

    fn send_data<T: Into<WriteBuf<Bytes>>>(&mut self, data: T) -> Result<(), TransportError> {
        if self.writing.is_some() {
            return Err(TransportError::NotReady);
        }
        self.writing = Some(data.into());
        Ok(())
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TransportError>> {
        ready!(self.poll_ready(cx))?;
        Poll::Ready(self.stream.finish().map_err(TransportError::from))
    }

    fn reset(&mut self, reset_code: u64) {
        let _ = self.stream.reset(to_var_int(reset_code));
    }

    fn send_id(&self) -> StreamId {
        self.id
    }
}

pub struct H3BidiStream {
    send: H3SendStream,
    recv: H3RecvStream,
}

impl H3BidiStream {
    /// `prefix` is replayed before anything read from `recv`.
    pub fn new(
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        prefix: Bytes,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            send: H3SendStream::new(send)?,
            recv: H3RecvStream::new(recv, prefix)?,
        })
    }
}

impl quic::RecvStream for H3BidiStream {
    type Buf = Bytes;
    type Error = TransportError;

    fn poll_data(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<Bytes>, TransportError>> {
        self.recv.poll_data(cx)
    }

    fn stop_sending(&mut self, error_code: u64) {
        self.recv.stop_sending(error_code)
    }

    fn recv_id(&self) -> StreamId {
        self.recv.recv_id()
    }
}

impl quic::SendStream<Bytes> for H3BidiStream {
    type Error = TransportError;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TransportError>> {
        self.send.poll_ready(cx)
    }

    fn send_data<T: Into<WriteBuf<Bytes>>>(&mut self, data: T) -> Result<(), TransportError> {
        self.send.send_data(data)
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TransportError>> {
        self.send.poll_finish(cx)
    }

    fn reset(&mut self, reset_code: u64) {
        self.send.reset(reset_code)
    }

    fn send_id(&self) -> StreamId {
        self.send.send_id()
    }
}

impl quic::BidiStream<Bytes> for H3BidiStream {
    type SendStream = H3SendStream;
    type RecvStream = H3RecvStream;

    fn split(self) -> (H3SendStream, H3RecvStream) {
        (self.send, self.recv)
    }
}

pub struct H3Opener {
    conn: quinn::Connection,
    opening_bi: Option<OpenBi>,
    opening_uni: Option<OpenUni>,
}

impl H3Opener {
    fn new(conn: quinn::Connection) -> Self {
        Self {
            conn,
            opening_bi: None,
            opening_uni: None,
        }
    }
}

impl Clone for H3Opener {
    fn clone(&self) -> Self {
        Self::new(self.conn.clone())
    }
}

impl quic::OpenStreams<Bytes> for H3Opener {
    type BidiStream = H3BidiStream;
    type SendStream = H3SendStream;
    type OpenError = TransportError;

    fn poll_open_bidi(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<H3BidiStream, TransportError>> {
        let conn = &self.conn;
        let opening = self.opening_bi.get_or_insert_with(|| {
            let conn = conn.clone();
            let future: OpenBi = Box::pin(async move { conn.open_bi().await });
            future
        });
        let result = ready!(opening.as_mut().poll(cx));
        self.opening_bi = None;
        let (send, recv) = result?;
        Poll::Ready(H3BidiStream::new(send, recv, Bytes::new()))
    }

    fn poll_open_send(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<H3SendStream, TransportError>> {
        let conn = &self.conn;
        let opening = self.opening_uni.get_or_insert_with(|| {
            let conn = conn.clone();
            let future: OpenUni = Box::pin(async move { conn.open_uni().await });
            future
        });
        let result = ready!(opening.as_mut().poll(cx));
        self.opening_uni = None;
        Poll::Ready(H3SendStream::new(result?))
    }

    fn close(&mut self, code: h3::error::Code, reason: &[u8]) {
        self.conn.close(to_var_int(code.value()), reason);
    }
}

/// h3 connection whose request streams come from the session instead of
/// `accept_bi`.
pub struct H3Connection {
    opener: H3Opener,
    bidi_streams: mpsc::UnboundedReceiver<H3BidiStream>,
    accepting_uni: Option<AcceptUni>,
}

impl H3Connection {
    /// Returns the connection and the sender that feeds it request streams. Once
    /// every sender is dropped the h3 server sees no further requests.
    pub fn new(conn: quinn::Connection) -> (Self, mpsc::UnboundedSender<H3BidiStream>) {
        let (sender, bidi_streams) = mpsc::unbounded_channel();
        let connection = Self {
            opener: H3Opener::new(conn),
            bidi_streams,
            accepting_uni: None,
        };
        (connection, sender)
    }
}

impl quic::Connection<Bytes> for H3Connection {
    type RecvStream = H3RecvStream;
    type OpenStreams = H3Opener;
    type AcceptError = TransportError;

    fn poll_accept_recv(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<H3RecvStream>, TransportError>> {
        let conn = &self.opener.conn;
        let accepting = self.accepting_uni.get_or_insert_with(|| {
            let conn = conn.clone();
            let future: AcceptUni = Box::pin(async move { conn.accept_uni().await });
            future
        });
        let result = ready!(accepting.as_mut().poll(cx));
        self.accepting_uni = None;
        let stream = H3RecvStream::new(result?, Bytes::new())?;
        Poll::Ready(Ok(Some(stream)))
    }

    fn poll_accept_bidi(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<H3BidiStream>, TransportError>> {
        Poll::Ready(Ok(ready!(self.bidi_streams.poll_recv(cx))))
    }

    fn opener(&self) -> H3Opener {
        self.opener.clone()
    }
}

impl quic::OpenStreams<Bytes> for H3Connection {
    type BidiStream = H3BidiStream;
    type SendStream = H3SendStream;
    type OpenError = TransportError;

    fn poll_open_bidi(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<H3BidiStream, TransportError>> {
        self.opener.poll_open_bidi(cx)
    }

    fn poll_open_send(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<H3SendStream, TransportError>> {
        self.opener.poll_open_send(cx)
    }

    fn close(&mut self, code: h3::error::Code, reason: &[u8]) {
        quic::OpenStreams::<Bytes>::close(&mut self.opener, code, reason)
    }
}
