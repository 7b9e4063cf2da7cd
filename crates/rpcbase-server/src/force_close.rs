//! Connections that can be torn down from outside.
//!
//! Graceful shutdown stops accepting and lets in-flight RPCs finish. When a
//! handler never finishes, the server still has to stop, so every accepted
//! socket is wrapped in [`ForceClosable`]: once the force token is cancelled
//! the next read or write fails with `ConnectionAborted`, the HTTP/2
//! connection task exits, and the socket is dropped. The client sees a
//! connection error on whatever call was in flight.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::serve::Listener;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;

/// An I/O stream that fails once its force token is cancelled.
pub struct ForceClosable<IO> {
    inner: IO,
    forced: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<IO> ForceClosable<IO> {
    pub fn new(inner: IO, force: CancellationToken) -> Self {
        Self {
            inner,
            forced: Box::pin(force.cancelled_owned()),
        }
    }

    /// Polls the force token, registering the waker so a cancellation wakes
    /// the connection task even while it is parked on the socket.
    fn poll_forced(&mut self, cx: &mut Context<'_>) -> bool {
        self.forced.as_mut().poll(cx).is_ready()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "server forcibly stopped")
}

impl<IO: AsyncRead + Unpin> AsyncRead for ForceClosable<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_forced(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for ForceClosable<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_forced(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_forced(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_forced(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<IO: Connected> Connected for ForceClosable<IO> {
    type ConnectInfo = IO::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// A TCP listener for `axum::serve` whose accepted connections are
/// [`ForceClosable`].
pub struct ForceClosableListener {
    inner: TcpListener,
    force: CancellationToken,
}

impl ForceClosableListener {
    pub fn new(inner: TcpListener, force: CancellationToken) -> Self {
        Self { inner, force }
    }
}

impl Listener for ForceClosableListener {
    type Io = ForceClosable<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (io, addr) = Listener::accept(&mut self.inner).await;
        (ForceClosable::new(io, self.force.clone()), addr)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Listener::local_addr(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn passes_data_through_until_forced() {
        let (a, mut b) = tokio::io::duplex(64);
        let force = CancellationToken::new();
        let mut wrapped = ForceClosable::new(a, force.clone());

        b.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        force.cancel();
        let err = wrapped.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        let err = wrapped.write_all(b"pong").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn parked_reader_wakes_on_force() {
        let (a, _b) = tokio::io::duplex(64);
        let force = CancellationToken::new();
        let mut wrapped = ForceClosable::new(a, force.clone());

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            wrapped.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        force.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should wake")
            .unwrap();
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn listener_wraps_accepted_connections() {
        let force = CancellationToken::new();
        let mut listener = ForceClosableListener::new(
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            force.clone(),
        );
        let addr = Listener::local_addr(&listener).unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"x").await.unwrap();
            stream
        });
        let (mut accepted, _) = listener.accept().await;
        let _client = client.await.unwrap();

        let mut buf = [0u8; 1];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");

        force.cancel();
        let err = accepted.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
