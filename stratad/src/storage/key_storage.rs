use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use keyring::Entry;
use rand_core::{OsRng, RngCore};
use strata_integrations::ids::{KEYRING_MASTER_KEY_USER, KEYRING_SERVICE};
use thiserror::Error;

const MASTER_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyStorageError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("master key is empty")]
    Empty,
}

/// Source of the secret the credential cipher derives its key from.
pub enum MasterKeyStorage {
    Env(String),
    Keyring(Entry),
}

impl MasterKeyStorage {
    /// Prefers an explicit secret (from `STRATA_MASTER_KEY`), else the session
    /// keyring.
    pub fn new(explicit: Option<String>) -> Result<Self, KeyStorageError> {
        match explicit {
            Some(secret) if secret.trim().is_empty() => Err(KeyStorageError::Empty),
            Some(secret) => Ok(Self::Env(secret)),
            None => Ok(Self::Keyring(Entry::new(
                KEYRING_SERVICE,
                KEYRING_MASTER_KEY_USER,
            )?)),
        }
    }

    /// Returns the secret, generating and storing one in the keyring on first use.
    pub fn load_or_create(&self) -> Result<Vec<u8>, KeyStorageError> {
        match self {
            MasterKeyStorage::Env(secret) => Ok(secret.as_bytes().to_vec()),
            MasterKeyStorage::Keyring(entry) => match entry.get_password() {
                Ok(secret) if !secret.is_empty() => Ok(secret.into_bytes()),
                Ok(_) | Err(keyring::Error::NoEntry) => {
                    let secret = generate_secret();
                    entry.set_password(&secret)?;
                    tracing::info!("generated new master key in the session keyring");
                    Ok(secret.into_bytes())
                }
                Err(err) => Err(KeyStorageError::Keyring(err)),
            },
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; MASTER_KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_secret_wins() {
        let storage = MasterKeyStorage::new(Some("from-env".into())).unwrap();
        assert_eq!(storage.load_or_create().unwrap(), b"from-env");
    }

    #[test]
    fn blank_explicit_secret_is_rejected() {
        assert!(matches!(
            MasterKeyStorage::new(Some("  ".into())),
            Err(KeyStorageError::Empty)
        ));
    }

    #[test]
    fn generated_secrets_are_random() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert_eq!(STANDARD.decode(a).unwrap().len(), MASTER_KEY_LEN);
    }
}
