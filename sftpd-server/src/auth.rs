//! Password authentication against the single configured identity.
//!
//! The expected password is held only as a SHA-256 digest and compared in
//! constant time.

use crate::config::{AuthConfig, ConfigError};
use crate::error::ServerError;
use sha2::{Digest, Sha256};

/// Validates username/password pairs against one configured identity.
///
/// Stateless: every attempt is judged on its own, so a single instance can
/// be shared by any number of concurrent handshakes.
#[derive(Clone)]
pub struct Authenticator {
    username: String,
    password_hash: [u8; 32],
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Creates an authenticator from a plaintext password.
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            password_hash: Self::digest(password),
        }
    }

    /// Creates an authenticator from a SHA-256 hex digest of the password.
    pub fn with_hash(username: impl Into<String>, hash_hex: &str) -> Result<Self, ConfigError> {
        let bytes = hex::decode(hash_hex)
            .map_err(|e| ConfigError::ValidationError(format!("invalid password hash: {}", e)))?;
        let password_hash: [u8; 32] = bytes.try_into().map_err(|_| {
            ConfigError::ValidationError("password hash must be 32 bytes".to_string())
        })?;
        Ok(Self {
            username: username.into(),
            password_hash,
        })
    }

    /// Builds the authenticator described by the auth config section.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        match (&config.password, &config.password_sha256) {
            (Some(password), None) => Ok(Self::new(config.username.clone(), password)),
            (None, Some(hash)) => Self::with_hash(config.username.clone(), hash),
            _ => Err(ConfigError::ValidationError(
                "exactly one of auth.password or auth.password_sha256 must be set".to_string(),
            )),
        }
    }

    /// Returns the configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Checks a claimed username and password.
    ///
    /// Succeeds only when both match exactly; there is no partial success.
    pub fn verify(&self, user: &str, password: &str) -> Result<(), ServerError> {
        let user_ok = user == self.username;
        let password_ok = constant_time_eq(&Self::digest(password), &self.password_hash);
        if user_ok && password_ok {
            Ok(())
        } else {
            Err(ServerError::IdentityMismatch(user.to_string()))
        }
    }

    /// Hashes a password using SHA-256, returning a lowercase hex string.
    pub fn hash_password(password: &str) -> String {
        hex::encode(Self::digest(password))
    }

    fn digest(password: &str) -> [u8; 32] {
        Sha256::digest(password.as_bytes()).into()
    }
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_correct_credentials() {
        let auth = Authenticator::new("alice", "s3cret");
        auth.verify("alice", "s3cret").unwrap();
    }

    #[test]
    fn test_wrong_password() {
        let auth = Authenticator::new("alice", "s3cret");
        let err = auth.verify("alice", "S3cret").unwrap_err();
        assert!(matches!(err, ServerError::IdentityMismatch(ref u) if u == "alice"));
    }

    #[test]
    fn test_wrong_user() {
        let auth = Authenticator::new("alice", "s3cret");
        assert!(auth.verify("bob", "s3cret").is_err());
        assert!(auth.verify("Alice", "s3cret").is_err());
        assert!(auth.verify("alice ", "s3cret").is_err());
    }

    #[test]
    fn test_empty_password() {
        let auth = Authenticator::new("alice", "");
        auth.verify("alice", "").unwrap();
        assert!(auth.verify("alice", " ").is_err());
    }

    #[test]
    fn test_hash_password() {
        let hash = Authenticator::hash_password("s3cret");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, Authenticator::hash_password("s3cret"));
        assert_ne!(hash, Authenticator::hash_password("s3cret2"));
    }

    #[test]
    fn test_with_hash_matches_plaintext() {
        let hash = Authenticator::hash_password("s3cret");
        let auth = Authenticator::with_hash("alice", &hash).unwrap();
        auth.verify("alice", "s3cret").unwrap();
        assert!(auth.verify("alice", &hash).is_err());
    }

    #[test]
    fn test_with_hash_rejects_malformed() {
        assert!(Authenticator::with_hash("alice", "zz").is_err());
        assert!(Authenticator::with_hash("alice", "abcd").is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = AuthConfig {
            username: "alice".to_string(),
            password: Some("s3cret".to_string()),
            ..Default::default()
        };
        let auth = Authenticator::from_config(&config).unwrap();
        assert_eq!(auth.username(), "alice");
        auth.verify("alice", "s3cret").unwrap();

        config.password = None;
        assert!(Authenticator::from_config(&config).is_err());
    }

    #[test]
    fn test_debug_hides_hash() {
        let auth = Authenticator::new("alice", "s3cret");
        let debug = format!("{:?}", auth);
        assert!(debug.contains("alice"));
        assert!(!debug.contains(&Authenticator::hash_password("s3cret")));
    }

    proptest! {
        #[test]
        fn prop_success_iff_exact_match(
            user in "[a-z]{1,8}",
            password in ".{0,16}",
            claimed_user in "[a-z]{1,8}",
            claimed_password in ".{0,16}",
        ) {
            let auth = Authenticator::new(user.clone(), &password);
            let expected = claimed_user == user && claimed_password == password;
            prop_assert_eq!(auth.verify(&claimed_user, &claimed_password).is_ok(), expected);
            prop_assert!(auth.verify(&user, &password).is_ok());
        }
    }
}
