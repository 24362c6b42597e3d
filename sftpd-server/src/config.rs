//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SFTPD_CONFIG or --config)
//! 3. Environment variables
//! 4. Command line flags (applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Credential configuration.
    pub auth: AuthConfig,
    /// Host key configuration.
    pub host_key: HostKeyConfig,
    /// SFTP subsystem configuration.
    pub sftp: SftpConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from an explicit file (if any), then applies
    /// environment variable overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.host_key.apply_env_overrides();
        self.sftp.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Validates the configuration before the server starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.auth.validate()?;
        self.host_key.validate()?;
        self.sftp.validate()?;
        Ok(())
    }
}

/// What the accept loop does when accepting a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptPolicy {
    /// Log the error and keep accepting.
    #[default]
    Resilient,
    /// Stop the server on the first accept error.
    FailFast,
}

impl std::str::FromStr for AcceptPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "resilient" => Ok(AcceptPolicy::Resilient),
            "fail_fast" | "fail-fast" | "failfast" => Ok(AcceptPolicy::FailFast),
            other => Err(ConfigError::ValidationError(format!(
                "unknown accept policy '{}'",
                other
            ))),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to. A zero port means no port was configured.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds (0 = no timeout).
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Accept loop error policy.
    pub accept_policy: AcceptPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout_secs: 0,
            max_connections: 1000,
            accept_policy: AcceptPolicy::Resilient,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SFTPD_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(port) = std::env::var("SFTPD_PORT") {
            if let Ok(port) = port.parse() {
                self.bind_addr.set_port(port);
            }
        }

        if let Ok(timeout) = std::env::var("SFTPD_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("SFTPD_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(policy) = std::env::var("SFTPD_ACCEPT_POLICY") {
            if let Ok(policy) = policy.parse() {
                self.accept_policy = policy;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.port() == 0 {
            return Err(ConfigError::ValidationError(
                "listening port not configured".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns idle timeout as Duration, if one is set.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Credential configuration for the single accepted identity.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected username.
    pub username: String,
    /// Expected password in plaintext.
    pub password: Option<String>,
    /// Expected password as a SHA-256 hex digest.
    /// Generate with: `printf %s '<password>' | sha256sum`
    pub password_sha256: Option<String>,
    /// Password attempts allowed per connection before it is dropped.
    pub max_attempts: usize,
    /// Delay before answering a rejected attempt, in milliseconds.
    pub rejection_delay_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: None,
            password_sha256: None,
            max_attempts: 6,
            rejection_delay_ms: 1000,
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_sha256", &self.password_sha256)
            .field("max_attempts", &self.max_attempts)
            .field("rejection_delay_ms", &self.rejection_delay_ms)
            .finish()
    }
}

impl AuthConfig {
    /// Sets a plaintext password, replacing any configured digest.
    pub fn set_password(&mut self, password: String) {
        self.password = Some(password);
        self.password_sha256 = None;
    }

    /// Sets a password digest, replacing any configured plaintext password.
    pub fn set_password_sha256(&mut self, hash: String) {
        self.password_sha256 = Some(hash);
        self.password = None;
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("SFTPD_USER") {
            self.username = user;
        }

        if let Ok(password) = std::env::var("SFTPD_PASSWORD") {
            self.set_password(password);
        }

        if let Ok(hash) = std::env::var("SFTPD_PASSWORD_SHA256") {
            if !hash.is_empty() {
                self.set_password_sha256(hash);
            }
        }

        if let Ok(max) = std::env::var("SFTPD_MAX_AUTH_ATTEMPTS") {
            if let Ok(n) = max.parse() {
                self.max_attempts = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.username not set".to_string(),
            ));
        }
        match (&self.password, &self.password_sha256) {
            (None, None) => {
                return Err(ConfigError::ValidationError(
                    "neither auth.password nor auth.password_sha256 is set".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::ValidationError(
                    "auth.password and auth.password_sha256 are mutually exclusive".to_string(),
                ))
            }
            (None, Some(hash)) => {
                if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ConfigError::ValidationError(
                        "auth.password_sha256 must be 64 hex characters".to_string(),
                    ));
                }
            }
            (Some(_), None) => {}
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "auth.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the rejection delay as Duration.
    pub fn rejection_delay(&self) -> Duration {
        Duration::from_millis(self.rejection_delay_ms)
    }
}

/// Host key algorithm used for the server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyAlgorithm {
    #[default]
    Ed25519,
    Rsa,
}

/// Host key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostKeyConfig {
    /// Key algorithm.
    pub algorithm: HostKeyAlgorithm,
    /// Modulus size in bits, used when algorithm is `rsa`.
    pub rsa_bits: usize,
}

/// Smallest RSA modulus accepted for a host key.
pub const MIN_RSA_BITS: usize = 2048;

impl Default for HostKeyConfig {
    fn default() -> Self {
        Self {
            algorithm: HostKeyAlgorithm::Ed25519,
            rsa_bits: 4096,
        }
    }
}

impl HostKeyConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(alg) = std::env::var("SFTPD_HOST_KEY_ALGORITHM") {
            match alg.to_lowercase().as_str() {
                "ed25519" => self.algorithm = HostKeyAlgorithm::Ed25519,
                "rsa" => self.algorithm = HostKeyAlgorithm::Rsa,
                _ => {}
            }
        }

        if let Ok(bits) = std::env::var("SFTPD_RSA_BITS") {
            if let Ok(n) = bits.parse() {
                self.rsa_bits = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.algorithm == HostKeyAlgorithm::Rsa && self.rsa_bits < MIN_RSA_BITS {
            return Err(ConfigError::ValidationError(format!(
                "host_key.rsa_bits must be at least {}",
                MIN_RSA_BITS
            )));
        }
        Ok(())
    }
}

/// SFTP subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    /// Directory exposed as `/` to clients.
    pub root_dir: PathBuf,
    /// Reject every mutating operation.
    pub read_only: bool,
    /// Largest payload returned by a single read.
    pub max_read_size: u32,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/"),
            read_only: false,
            max_read_size: 64 * 1024,
        }
    }
}

impl SftpConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SFTPD_ROOT") {
            self.root_dir = PathBuf::from(dir);
        }

        if let Ok(ro) = std::env::var("SFTPD_READ_ONLY") {
            self.read_only = ro == "1" || ro.to_lowercase() == "true";
        }

        if let Ok(size) = std::env::var("SFTPD_MAX_READ_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_read_size = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_dir.is_dir() {
            return Err(ConfigError::ValidationError(format!(
                "sftp.root_dir '{}' is not a directory",
                self.root_dir.display()
            )));
        }
        if self.max_read_size == 0 {
            return Err(ConfigError::ValidationError(
                "sftp.max_read_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SFTPD_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("SFTPD_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
