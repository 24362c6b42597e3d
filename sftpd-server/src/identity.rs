//! Server host identity.
//!
//! One signing key is generated when the process starts and handed to every
//! handshake. It is never rotated or persisted.

use crate::config::{HostKeyAlgorithm, HostKeyConfig, MIN_RSA_BITS};
use crate::error::ServerError;
use rand::rngs::OsRng;
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::HashAlg;
use russh::keys::{Algorithm, PrivateKey};

/// The server's long-lived signing identity.
#[derive(Clone)]
pub struct ServerIdentity {
    key: PrivateKey,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("algorithm", &self.key.algorithm().as_str())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl ServerIdentity {
    /// Generates a fresh identity as described by the host key config.
    pub fn generate(config: &HostKeyConfig) -> Result<Self, ServerError> {
        let key = match config.algorithm {
            HostKeyAlgorithm::Ed25519 => PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                .map_err(|e| ServerError::KeyGeneration(e.to_string()))?,
            HostKeyAlgorithm::Rsa => Self::generate_rsa(config.rsa_bits)?,
        };
        Ok(Self { key })
    }

    /// Generates a fresh Ed25519 identity.
    pub fn ed25519() -> Result<Self, ServerError> {
        Self::generate(&HostKeyConfig::default())
    }

    fn generate_rsa(bits: usize) -> Result<PrivateKey, ServerError> {
        if bits < MIN_RSA_BITS {
            return Err(ServerError::KeyGeneration(format!(
                "RSA key size {} is below the minimum of {}",
                bits, MIN_RSA_BITS
            )));
        }
        let keypair = RsaKeypair::random(&mut OsRng, bits)
            .map_err(|e| ServerError::KeyGeneration(e.to_string()))?;
        PrivateKey::new(KeypairData::from(keypair), "")
            .map_err(|e| ServerError::KeyGeneration(e.to_string()))
    }

    /// Returns the SHA-256 fingerprint of the public half.
    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }

    /// Returns the signing key for the SSH engine.
    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }
}
