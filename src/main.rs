//! sftpd - single-identity SFTP server
//!
//! Accepts SSH connections, authenticates one username/password pair and
//! serves the sftp subsystem on session channels.

use clap::Parser;
use sftpd_server::{
    run_metrics_server, AcceptPolicy, Authenticator, Config, Metrics, Server, ServerConfig,
    ServerIdentity, SftpEngine,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sftpd")]
#[command(about = "SFTP server for a single password-authenticated identity")]
#[command(version)]
struct Cli {
    /// Username clients must authenticate as
    #[arg(long)]
    id: Option<String>,

    /// Password clients must present
    #[arg(long)]
    password: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// YAML configuration file
    #[arg(short, long, env = "SFTPD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory served to clients
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Refuse every mutating SFTP operation
    #[arg(long)]
    read_only: bool,

    /// Stop the server on the first accept error
    #[arg(long)]
    fail_fast: bool,
}

impl Cli {
    /// Applies command line flags on top of file and environment settings.
    fn apply(self, config: &mut Config) {
        if let Some(id) = self.id {
            config.auth.username = id;
        }
        if let Some(password) = self.password {
            config.auth.set_password(password);
        }
        if let Some(port) = self.port {
            config.network.bind_addr = SocketAddr::new(config.network.bind_addr.ip(), port);
        }
        if let Some(root_dir) = self.root_dir {
            config.sftp.root_dir = root_dir;
        }
        if self.read_only {
            config.sftp.read_only = true;
        }
        if self.fail_fast {
            config.network.accept_policy = AcceptPolicy::FailFast;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match Config::load_from(cli.config.as_deref()) {
        Ok(c) => {
            if let Some(ref path) = cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting sftpd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  User: {}", config.auth.username);
    tracing::info!("  Root directory: {}", config.sftp.root_dir.display());
    tracing::info!("  Accept policy: {:?}", config.network.accept_policy);
    if config.sftp.read_only {
        tracing::info!("  Read-only: enabled");
    }

    // No identity, no server
    let identity = match ServerIdentity::generate(&config.host_key) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!("Failed to generate host key: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!("  Host key: {:?}", identity);

    let authenticator = Authenticator::from_config(&config.auth)?;

    let mut server_config = ServerConfig::from_config(&config);
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled on {}", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(
        server_config,
        &identity,
        authenticator,
        SftpEngine::new(config.sftp.clone()),
    ));

    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let rx = metrics_shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_metrics = metrics_shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = shutdown_metrics.send(());
    });

    // Run server (blocks until shutdown)
    let result = server.run().await;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    match result {
        Err(e) if e.is_fatal() => {
            tracing::error!("Server failed to start: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            tracing::error!("Server stopped with error: {}", e);
            return Err(e.into());
        }
        Ok(()) => {}
    }

    tracing::info!("Server stopped");
    Ok(())
}
