//! Encryption at rest for webhook secrets and channel bearer tokens.
//!
//! Not present in the retrieved pack (filtered out of the source repo), so
//! authored fresh against the crate's existing `aes-gcm`/`rand` dependency
//! group and the `SecretsError` taxonomy in [`crate::error`].

use crate::error::SecretsError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

pub const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

pub struct Encrypted {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

impl SecretBox {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Encrypted, SecretsError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SecretsError::Encrypt)?;

        Ok(Encrypted {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, SecretsError> {
        if nonce.len() != NONCE_LEN {
            return Err(SecretsError::Decrypt);
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretsError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_secret() {
        let key = [7u8; 32];
        let vault = SecretBox::new(&key);
        let encrypted = vault.encrypt(b"webhook-secret-123").unwrap();
        let decrypted = vault.decrypt(&encrypted.ciphertext, &encrypted.nonce).unwrap();
        assert_eq!(decrypted, b"webhook-secret-123");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = [7u8; 32];
        let vault = SecretBox::new(&key);
        let mut encrypted = vault.encrypt(b"secret").unwrap();
        encrypted.ciphertext[0] ^= 0xff;
        assert!(vault.decrypt(&encrypted.ciphertext, &encrypted.nonce).is_err());
    }

    #[test]
    fn different_keys_cannot_decrypt_each_others_secrets() {
        let vault_a = SecretBox::new(&[1u8; 32]);
        let vault_b = SecretBox::new(&[2u8; 32]);
        let encrypted = vault_a.encrypt(b"secret").unwrap();
        assert!(vault_b.decrypt(&encrypted.ciphertext, &encrypted.nonce).is_err());
    }
}
