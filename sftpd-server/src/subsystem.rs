//! Subsystem server.
//!
//! Runs a file-transfer engine over an accepted channel's byte stream as an
//! independent task and classifies how it ended. Engine faults stay inside
//! the task; they are logged and reported, never propagated to the session.

use crate::metrics::Metrics;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

/// How an engine run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The engine finished on its own.
    Completed,
    /// The peer ended the stream.
    EndOfStream,
}

/// Subsystem-scoped errors.
#[derive(Debug, Error)]
pub enum SubsystemError {
    #[error("failed to start engine: {0}")]
    Start(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A protocol engine that serves one channel stream to completion.
pub trait SubsystemEngine: Send + Sync + 'static {
    /// Subsystem name the engine implements.
    fn name(&self) -> &'static str;

    /// Serves the stream until the engine stops.
    fn serve<S>(
        &self,
        stream: S,
    ) -> impl Future<Output = Result<EngineOutcome, SubsystemError>> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// Final state of a subsystem task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Engine returned without error.
    Clean,
    /// Peer ended the stream; the channel was closed.
    PeerClosed,
    /// Engine failed; the channel was closed and nothing else is affected.
    Fault(String),
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Clean => "clean",
            Termination::PeerClosed => "peer_closed",
            Termination::Fault(_) => "fault",
        }
    }
}

/// Starts engines on channels and reports their termination.
pub struct SubsystemServer<E> {
    engine: Arc<E>,
    metrics: Option<Arc<Metrics>>,
}

impl<E> Clone for SubsystemServer<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E: SubsystemEngine> SubsystemServer<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the subsystem name served.
    pub fn name(&self) -> &'static str {
        self.engine.name()
    }

    /// Spawns the engine over `stream`.
    ///
    /// `close` runs when the peer ends the stream or the engine fails, so the
    /// channel is torn down explicitly. The returned handle resolves to the
    /// termination.
    pub fn spawn<S, C, F>(&self, label: String, stream: S, close: C) -> JoinHandle<Termination>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        if let Some(ref m) = metrics {
            m.engines_active.inc();
        }
        tracing::info!("[{}] {} engine started", label, engine.name());

        tokio::spawn(async move {
            let termination = match engine.serve(stream).await {
                Ok(EngineOutcome::Completed) => {
                    tracing::info!("[{}] {} engine finished", label, engine.name());
                    Termination::Clean
                }
                Ok(EngineOutcome::EndOfStream) => {
                    close().await;
                    tracing::info!("[{}] {} stream ended by peer, channel closed", label, engine.name());
                    Termination::PeerClosed
                }
                Err(e) => {
                    tracing::warn!("[{}] {} engine failed: {}", label, engine.name(), e);
                    close().await;
                    Termination::Fault(e.to_string())
                }
            };

            if let Some(ref m) = metrics {
                m.engines_active.dec();
                m.engine_terminations_total
                    .with_label_values(&[termination.as_str()])
                    .inc();
            }
            termination
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Echoes lines until EOF, then reports end-of-stream.
    struct EchoEngine;

    impl SubsystemEngine for EchoEngine {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn serve<S>(&self, mut stream: S) -> Result<EngineOutcome, SubsystemError>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(EngineOutcome::EndOfStream);
                }
                stream.write_all(&buf[..n]).await?;
            }
        }
    }

    /// Returns immediately with a fixed result.
    struct FixedEngine(fn() -> Result<EngineOutcome, SubsystemError>);

    impl SubsystemEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn serve<S>(&self, _stream: S) -> Result<EngineOutcome, SubsystemError>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            (self.0)()
        }
    }

    fn counting_close(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    fn pipe() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(256)
    }

    #[tokio::test]
    async fn test_clean_completion_does_not_close() {
        let server = SubsystemServer::new(Arc::new(FixedEngine(|| Ok(EngineOutcome::Completed))));
        let closes = Arc::new(AtomicUsize::new(0));
        let (local, _peer) = pipe();

        let termination = server
            .spawn("t".into(), local, counting_close(&closes))
            .await
            .unwrap();

        assert_eq!(termination, Termination::Clean);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_channel() {
        let server = SubsystemServer::new(Arc::new(EchoEngine));
        let closes = Arc::new(AtomicUsize::new(0));
        let (local, mut peer) = pipe();

        let handle = server.spawn("t".into(), local, counting_close(&closes));

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(peer);

        assert_eq!(handle.await.unwrap(), Termination::PeerClosed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_error_is_contained() {
        let server = SubsystemServer::new(Arc::new(FixedEngine(|| {
            Err(SubsystemError::Start("no root".into()))
        })));
        let closes = Arc::new(AtomicUsize::new(0));
        let (local, _peer) = pipe();

        let termination = server
            .spawn("t".into(), local, counting_close(&closes))
            .await
            .unwrap();

        assert!(matches!(termination, Termination::Fault(ref msg) if msg.contains("no root")));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fault_in_one_channel_leaves_others_running() {
        let healthy = SubsystemServer::new(Arc::new(EchoEngine));
        let failing = SubsystemServer::new(Arc::new(FixedEngine(|| {
            Err(SubsystemError::Io(std::io::ErrorKind::ConnectionReset.into()))
        })));
        let closes = Arc::new(AtomicUsize::new(0));

        let (a_local, mut a_peer) = pipe();
        let (b_local, _b_peer) = pipe();
        let a = healthy.spawn("a".into(), a_local, counting_close(&closes));
        let b = failing.spawn("b".into(), b_local, counting_close(&closes));

        assert!(matches!(b.await.unwrap(), Termination::Fault(_)));

        a_peer.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
        assert!(!a.is_finished());

        drop(a_peer);
        assert_eq!(a.await.unwrap(), Termination::PeerClosed);
    }

    #[tokio::test]
    async fn test_metrics_track_engines() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let server = SubsystemServer::new(Arc::new(FixedEngine(|| Ok(EngineOutcome::Completed))))
            .with_metrics(Some(metrics.clone()));
        let (local, _peer) = pipe();

        server.spawn("t".into(), local, || async {}).await.unwrap();

        assert_eq!(metrics.engines_active.get(), 0.0);
        assert_eq!(
            metrics
                .engine_terminations_total
                .with_label_values(&["clean"])
                .get(),
            1.0
        );
    }
}
