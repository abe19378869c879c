use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const ENVELOPE_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("unsupported credential envelope")]
    UnsupportedEnvelope,
}

/// Black-box protection of stored credentials.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, envelope: &str) -> Result<String, CipherError>;
}

/// ChaCha20-Poly1305 under a SHA-256-derived key. Envelopes look like
/// `v1:<base64(nonce || ciphertext)>`.
pub struct ChaChaCipher {
    key: [u8; 32],
}

impl ChaChaCipher {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: derive_key(secret),
        }
    }
}

impl CredentialCipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{ENVELOPE_PREFIX}{}", STANDARD.encode(payload)))
    }

    fn decrypt(&self, envelope: &str) -> Result<String, CipherError> {
        let encoded = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CipherError::UnsupportedEnvelope)?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| CipherError::Decryption)?;
        if data.len() <= NONCE_LEN {
            return Err(CipherError::Decryption);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decryption)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Decryption)
    }
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let digest = Sha256::digest(secret);
    key.copy_from_slice(&digest);
    key
}
