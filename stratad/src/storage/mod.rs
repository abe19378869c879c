mod credential_cipher;
mod key_storage;

pub use credential_cipher::{ChaChaCipher, CipherError, CredentialCipher};
pub use key_storage::{KeyStorageError, MasterKeyStorage};
