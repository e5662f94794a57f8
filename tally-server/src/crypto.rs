//! AES-256-GCM credential encryption
//!
//! Format: base64(nonce_12bytes || ciphertext || tag_16bytes)

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("invalid base64")]
    Encoding,
    #[error("ciphertext too short")]
    Truncated,
    #[error("decryption failed (wrong key or tampered data)")]
    Decrypt,
    #[error("decrypted data is not valid UTF-8")]
    Utf8,
}

/// Vault encryption key (32 bytes for AES-256-GCM)
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Use `material` directly when it is exactly 32 bytes, otherwise its SHA-256 digest
    pub fn from_material(material: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        if material.len() == KEY_LEN {
            key.copy_from_slice(material);
        } else {
            let mut digest = Sha256::digest(material);
            key.copy_from_slice(&digest);
            digest.as_mut_slice().zeroize();
        }
        Self { key }
    }

    /// Encrypt plaintext → base64(nonce || ciphertext || tag)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::Encrypt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&result))
    }

    /// Decrypt base64(nonce || ciphertext || tag) → plaintext
    pub fn decrypt(&self, encrypted_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|_| CryptoError::Encoding)?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::Decrypt)?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);

        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_string(&self, encrypted_b64: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt(encrypted_b64)?;
        String::from_utf8(bytes).map_err(|e| {
            let mut raw = e.into_bytes();
            raw.zeroize();
            CryptoError::Utf8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_any_utf8() {
        let key = MasterKey::from_material(b"short passphrase");
        for plaintext in ["", "secret", "한글 비밀번호 🔑", &"x".repeat(4096)] {
            let blob = key.encrypt_string(plaintext).unwrap();
            assert_eq!(key.decrypt_string(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_is_random_and_prepended() {
        let key = MasterKey::from_material(&[7u8; 32]);
        let a = key.encrypt_string("same").unwrap();
        let b = key.encrypt_string("same").unwrap();
        assert_ne!(a, b);

        let raw = base64::engine::general_purpose::STANDARD.decode(&a).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + "same".len() + TAG_LEN);
    }

    #[test]
    fn test_32_byte_material_is_used_verbatim() {
        let material = [42u8; 32];
        let direct = MasterKey::from_material(&material);
        let blob = direct.encrypt_string("v").unwrap();

        let hashed = MasterKey::from_material(&material[..31]);
        assert_eq!(hashed.decrypt_string(&blob), Err(CryptoError::Decrypt));
        assert_eq!(direct.decrypt_string(&blob).unwrap(), "v");
    }

    #[test]
    fn test_tampered_and_malformed_input() {
        let key = MasterKey::from_material(b"k");
        let blob = key.encrypt_string("payload").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(&raw);

        assert_eq!(key.decrypt(&tampered), Err(CryptoError::Decrypt));
        assert_eq!(key.decrypt("not base64!"), Err(CryptoError::Encoding));
        assert_eq!(key.decrypt("AAAA"), Err(CryptoError::Truncated));
    }
}
