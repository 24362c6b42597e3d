//! # sftpd-server
//!
//! SSH server exposing the SFTP subsystem for a single password identity.
//!
//! This crate provides:
//! - TCP accept loop with resilient or fail-fast error policy
//! - Host key generation and password authentication
//! - Channel admission limited to `session` channels
//! - In-band request filtering with exactly one reply per request
//! - Per-channel SFTP engines over a filesystem backend
//! - Optional Prometheus metrics

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod server;
pub mod session;
pub mod sftp;
pub mod stream;
pub mod subsystem;

pub use auth::Authenticator;
pub use config::{
    AcceptPolicy, AuthConfig, Config, ConfigError, HostKeyConfig, MetricsConfig, NetworkConfig,
    SftpConfig,
};
pub use error::ServerError;
pub use identity::ServerIdentity;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::SessionHandler;
pub use sftp::{FsBackend, SftpEngine};
pub use subsystem::{EngineOutcome, SubsystemEngine, SubsystemError, SubsystemServer, Termination};
