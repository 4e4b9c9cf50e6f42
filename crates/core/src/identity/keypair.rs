use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Ed25519 host key. Its public half is the source key a node announces
/// when it asks another node to join a tunnel.
#[derive(Clone)]
pub struct HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl HostKey {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load the key stored at `path`, or create and store a new one
    pub fn load_or_generate(path: &Path) -> Result<Self, HostKeyError> {
        if path.exists() {
            let key = Self::load(path)?;
            info!("Loaded host key {} from {:?}", key.public_hex(), path);
            return Ok(key);
        }

        let key = Self::generate();
        key.save(path)?;
        info!("Generated host key {} at {:?}", key.public_hex(), path);
        Ok(key)
    }

    /// Read a hex-encoded secret key
    pub fn load(path: &Path) -> Result<Self, HostKeyError> {
        let contents = std::fs::read_to_string(path)?;
        let bytes = hex::decode(contents.trim())
            .map_err(|e| HostKeyError::InvalidSecretKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| HostKeyError::InvalidSecretKey(format!("{} bytes", b.len())))?;

        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn save(&self, path: &Path) -> Result<(), HostKeyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, hex::encode(self.secret_bytes()))?;
        Ok(())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.verifying_key
            .verify(message, &Signature::from_bytes(signature))
            .is_ok()
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey")
            .field("public_key", &self.public_hex())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("Host key IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HostKeyError> for onionmesh_common::OnionError {
    fn from(err: HostKeyError) -> Self {
        onionmesh_common::OnionError::initialization_caused_by("cannot load host key", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_secret_bytes() {
        let key = HostKey::generate();
        let restored = HostKey::from_secret_bytes(&key.secret_bytes());
        assert_eq!(key.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = HostKey::generate();
        let signature = key.sign(b"extend me");

        assert!(key.verify(b"extend me", &signature));
        assert!(!key.verify(b"extend you", &signature));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("hostkey");

        let first = HostKey::load_or_generate(&path).unwrap();
        let second = HostKey::load_or_generate(&path).unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());
    }

    #[test]
    fn test_corrupt_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostkey");
        std::fs::write(&path, "abcd").unwrap();

        assert!(matches!(
            HostKey::load(&path),
            Err(HostKeyError::InvalidSecretKey(_))
        ));
    }
}
