//! Payload encryption beneath the transport framing.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const TUNNEL_INFO: &[u8] = b"vxproto-tunnel-v1";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("tunnel key derivation failed")]
    KeyDerivation,

    #[error("tunnel encryption failed")]
    Encrypt,

    /// Wrong key, tampered frame, or a frame shorter than its nonce.
    #[error("tunnel decryption failed")]
    Decrypt,
}

/// Encrypts encoded packets before they are framed, and decrypts them after.
pub trait PackEncryptor: Send + Sync + 'static {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Passes packets through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainEncryptor;

impl PackEncryptor for PlainEncryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(data.to_vec())
    }
}

/// ChaCha20-Poly1305 tunnel keyed per connection.
///
/// Output layout: `nonce (12 bytes) || ciphertext || tag`.
pub struct ChaChaEncryptor {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChaChaEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaEncryptor").finish_non_exhaustive()
    }
}

impl ChaChaEncryptor {
    /// Derives the connection key with HKDF-SHA256 from a shared secret,
    /// salted with the connection's token pair.
    pub fn derive(secret: &[u8], atoken: &str, stoken: &str) -> Result<Self, CryptoError> {
        let salt = format!("{}:{}", atoken, stoken);
        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), secret);
        let mut key = [0u8; 32];
        hk.expand(TUNNEL_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self { cipher })
    }
}

impl PackEncryptor for ChaChaEncryptor {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = chacha20poly1305::Nonce::from(nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_ends_derive_the_same_key() {
        let server = ChaChaEncryptor::derive(b"secret", "a".repeat(40).as_str(), "b").unwrap();
        let agent = ChaChaEncryptor::derive(b"secret", "a".repeat(40).as_str(), "b").unwrap();

        let sealed = server.encrypt(b"packet bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"packet bytes");
        assert_eq!(agent.decrypt(&sealed).unwrap(), b"packet bytes");
    }

    #[test]
    fn other_connection_cannot_decrypt() {
        let a = ChaChaEncryptor::derive(b"secret", "atoken-1", "stoken").unwrap();
        let b = ChaChaEncryptor::derive(b"secret", "atoken-2", "stoken").unwrap();
        let sealed = a.encrypt(b"x").unwrap();
        assert!(b.decrypt(&sealed).is_err());
        assert!(a.decrypt(&sealed[..4]).is_err());
    }

    #[test]
    fn plain_is_identity() {
        assert_eq!(PlainEncryptor.encrypt(b"abc").unwrap(), b"abc");
        assert_eq!(PlainEncryptor.decrypt(b"abc").unwrap(), b"abc");
    }
}
