//! Stream wrapper that reports how a channel stream terminated.
//!
//! The SFTP engine owns its stream and swallows I/O errors internally, so the
//! subsystem server learns the outcome from the stream itself: the first
//! end-of-stream or I/O error seen is recorded and delivered once the engine
//! drops the stream.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Terminal condition observed on a tracked stream.
#[derive(Debug)]
pub enum StreamEnd {
    /// The peer closed its side of the stream.
    Eof,
    /// A read or write failed.
    Error(io::Error),
    /// The stream was dropped with neither EOF nor error seen.
    Released,
}

pin_project! {
    /// A stream that records its first terminal condition.
    pub struct TrackedStream<S> {
        #[pin]
        inner: S,
        end: Option<StreamEnd>,
        report: Option<oneshot::Sender<StreamEnd>>,
    }

    impl<S> PinnedDrop for TrackedStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(report) = this.report.take() {
                let _ = report.send(this.end.take().unwrap_or(StreamEnd::Released));
            }
        }
    }
}

impl<S> TrackedStream<S> {
    /// Wraps a stream; the receiver resolves when the wrapper is dropped.
    pub fn new(inner: S) -> (Self, oneshot::Receiver<StreamEnd>) {
        let (tx, rx) = oneshot::channel();
        let stream = Self {
            inner,
            end: None,
            report: Some(tx),
        };
        (stream, rx)
    }
}

fn record(end: &mut Option<StreamEnd>, err: &io::Error) {
    if end.is_none() {
        *end = Some(StreamEnd::Error(io::Error::new(err.kind(), err.to_string())));
    }
}

impl<S: AsyncRead> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                if this.end.is_none() {
                    *this.end = Some(StreamEnd::Eof);
                }
            }
            Poll::Ready(Err(e)) => record(this.end, e),
            _ => {}
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Err(e)) = &result {
            record(this.end, e);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let result = this.inner.poll_flush(cx);
        if let Poll::Ready(Err(e)) = &result {
            record(this.end, e);
        }
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let result = this.inner.poll_shutdown(cx);
        if let Poll::Ready(Err(e)) = &result {
            record(this.end, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reports_eof_when_peer_closes() {
        let (local, mut peer) = tokio::io::duplex(64);
        let (mut stream, rx) = TrackedStream::new(local);

        peer.write_all(b"hi").await.unwrap();
        drop(peer);

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");
        drop(stream);

        assert!(matches!(rx.await.unwrap(), StreamEnd::Eof));
    }

    #[tokio::test]
    async fn test_reports_write_error() {
        let (local, peer) = tokio::io::duplex(64);
        let (mut stream, rx) = TrackedStream::new(local);
        drop(peer);

        assert!(stream.write_all(b"lost").await.is_err());
        drop(stream);

        match rx.await.unwrap() {
            StreamEnd::Error(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reports_read_error() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (mut stream, rx) = TrackedStream::new(mock);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert!(stream.read(&mut buf).await.is_err());
        drop(stream);

        match rx.await.unwrap() {
            StreamEnd::Error(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_condition_wins() {
        let (local, mut peer) = tokio::io::duplex(64);
        let (mut stream, rx) = TrackedStream::new(local);

        peer.shutdown().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        drop(peer);
        assert!(stream.write_all(b"late").await.is_err());
        drop(stream);

        assert!(matches!(rx.await.unwrap(), StreamEnd::Eof));
    }

    #[tokio::test]
    async fn test_released_without_io() {
        let (local, _peer) = tokio::io::duplex(64);
        let (stream, rx) = TrackedStream::new(local);
        drop(stream);
        assert!(matches!(rx.await.unwrap(), StreamEnd::Released));
    }
}
