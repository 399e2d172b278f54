use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Stop accepting inbound data without touching the write half.
    ///
    /// Streams that cannot cancel reads independently ignore this.
    fn cancel_read(&mut self) {}
}

impl AsyncStream for DuplexStream {}

impl<T: ?Sized + AsyncStream + Unpin> AsyncStream for Box<T> {
    fn cancel_read(&mut self) {
        (**self).cancel_read()
    }
}

impl<T: ?Sized + AsyncStream + Unpin> AsyncStream for &mut T {
    fn cancel_read(&mut self) {
        (**self).cancel_read()
    }
}
