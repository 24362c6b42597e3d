//! TCP server implementation.

use crate::auth::Authenticator;
use crate::config::{AcceptPolicy, Config};
use crate::error::ServerError;
use crate::identity::ServerIdentity;
use crate::metrics::Metrics;
use crate::session::SessionHandler;
use crate::sftp::SftpEngine;
use crate::subsystem::{SubsystemEngine, SubsystemServer};
use russh::{Disconnect, MethodKind, MethodSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout handed to the SSH engine.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// What to do when accepting a connection fails.
    pub accept_policy: AcceptPolicy,
    /// Authentication attempts allowed per connection.
    pub max_auth_attempts: usize,
    /// Delay before a failed authentication is answered.
    pub auth_rejection_delay: Duration,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("accept_policy", &self.accept_policy)
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("auth_rejection_delay", &self.auth_rejection_delay)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2022)),
            idle_timeout: None,
            max_connections: 1000,
            accept_policy: AcceptPolicy::Resilient,
            max_auth_attempts: 6,
            auth_rejection_delay: Duration::from_secs(1),
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server settings from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            accept_policy: config.network.accept_policy,
            max_auth_attempts: config.auth.max_attempts,
            auth_rejection_delay: config.auth.rejection_delay(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// SSH server exposing the SFTP subsystem.
pub struct Server<E: SubsystemEngine = SftpEngine> {
    config: ServerConfig,
    ssh: Arc<russh::server::Config>,
    fingerprint: String,
    authenticator: Arc<Authenticator>,
    subsystems: SubsystemServer<E>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
}

impl<E: SubsystemEngine> Server<E> {
    /// Creates a new server.
    ///
    /// The identity and credentials are fixed for the server's lifetime and
    /// shared read-only by every session.
    pub fn new(
        config: ServerConfig,
        identity: &ServerIdentity,
        authenticator: Authenticator,
        engine: E,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let subsystems =
            SubsystemServer::new(Arc::new(engine)).with_metrics(config.metrics.clone());
        Self {
            ssh: Arc::new(ssh_config(&config, identity)),
            fingerprint: identity.fingerprint(),
            config,
            authenticator: Arc::new(authenticator),
            subsystems,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            local_addr: OnceLock::new(),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {} (host key {}, accept policy {:?})",
            addr,
            self.fingerprint,
            self.config.accept_policy
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        let result = loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, peer)) => self.dispatch(tcp_stream, peer),
                        Err(e) => {
                            if let Err(e) = on_accept_error(self.config.accept_policy, e) {
                                break Err(e);
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break Ok(());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Hands an accepted connection to its own task.
    fn dispatch(&self, tcp_stream: TcpStream, peer: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", peer);
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.config.metrics {
                metrics.connections_rejected_total.inc();
            }
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        tracing::debug!("Accepted connection from {}", peer);

        let handler = SessionHandler::new(
            Some(peer),
            self.authenticator.clone(),
            self.subsystems.clone(),
            self.config.metrics.clone(),
        );
        let ssh = self.ssh.clone();
        let stats = self.stats.clone();
        let metrics = self.config.metrics.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(tcp_stream, ssh, handler, &mut conn_shutdown).await
            {
                tracing::warn!("[{}] connection abandoned: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = metrics {
                    record_connection_error(metrics, &e);
                }
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = metrics {
                metrics.connections_active.dec();
            }
            tracing::info!("Client disconnected: {}", peer);
        });
    }

    /// Runs one SSH session to completion.
    async fn handle_connection(
        stream: TcpStream,
        ssh: Arc<russh::server::Config>,
        handler: SessionHandler<E>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let session = russh::server::run_stream(ssh, stream, handler)
            .await
            .map_err(|e| ServerError::Handshake(e.to_string()))?;
        let handle = session.handle();

        tokio::select! {
            result = session => result,
            _ = shutdown.recv() => {
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "server shutting down".to_string(),
                        "en".to_string(),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the bound address once the server is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Applies the accept policy to a failed accept.
fn on_accept_error(policy: AcceptPolicy, e: std::io::Error) -> Result<(), ServerError> {
    match policy {
        AcceptPolicy::Resilient => {
            tracing::error!("Accept error: {}", e);
            Ok(())
        }
        AcceptPolicy::FailFast => {
            tracing::error!("Accept error, stopping server: {}", e);
            Err(ServerError::Io(e))
        }
    }
}

/// Counts a failed connection as a handshake failure or a session error.
fn record_connection_error(metrics: &Metrics, e: &ServerError) {
    match e {
        ServerError::Handshake(_) => metrics.handshake_failures_total.inc(),
        _ => metrics.session_errors_total.inc(),
    }
}

/// Builds the SSH engine configuration.
fn ssh_config(config: &ServerConfig, identity: &ServerIdentity) -> russh::server::Config {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);
    russh::server::Config {
        keys: vec![identity.private_key().clone()],
        methods,
        auth_rejection_time: config.auth_rejection_delay,
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: config.idle_timeout,
        max_auth_attempts: config.max_auth_attempts,
        ..Default::default()
    }
}
