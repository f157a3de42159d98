//! Cryptographic primitives for `Arcanum`.
//!
//! Provides AES-256-GCM and ChaCha20-Poly1305 authenticated encryption,
//! HKDF-SHA256 key derivation, and zeroize-on-drop key newtypes. All key
//! material is automatically cleared from memory when dropped.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`,
//!   for both ciphers.
//! - Key derivation uses HKDF-SHA256 with a unique `info` per purpose.
//! - All key types derive `Zeroize` + `ZeroizeOnDrop`.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for both AEADs (96 bits).
const NONCE_LEN: usize = 12;

/// Minimum ciphertext length: 12-byte nonce + 16-byte tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + 16;

/// A 256-bit symmetric key that is zeroized on drop.
///
/// Used for the master key, the key-encryption key, per-purpose derived keys
/// and transit key material. The inner bytes are never exposed in `Debug`
/// output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, which must be exactly 32 bytes long.
    ///
    /// Returns `None` on a length mismatch.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care: the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The AEAD construction used for a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    /// AES-256 in Galois/Counter Mode.
    Aes256Gcm,
    /// ChaCha20 stream cipher with a Poly1305 authenticator.
    ChaCha20Poly1305,
}

fn seal<C: KeyInit + Aead + AeadCore>(
    key: &EncryptionKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::Encryption {
        reason: e.to_string(),
    })?;
    let nonce = C::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

fn open<C: KeyInit + Aead>(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = C::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::Decryption {
        reason: e.to_string(),
    })?;

    cipher
        .decrypt(Nonce::<C>::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Encrypt plaintext with the given cipher and a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt_with(
    cipher: Cipher,
    key: &EncryptionKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match cipher {
        Cipher::Aes256Gcm => seal::<Aes256Gcm>(key, plaintext),
        Cipher::ChaCha20Poly1305 => seal::<ChaCha20Poly1305>(key, plaintext),
    }
}

/// Decrypt ciphertext produced by [`encrypt_with`] using the same cipher.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input is shorter than
/// 28 bytes, or [`CryptoError::Decryption`] if authentication fails.
pub fn decrypt_with(
    cipher: Cipher,
    key: &EncryptionKey,
    combined: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match cipher {
        Cipher::Aes256Gcm => open::<Aes256Gcm>(key, combined),
        Cipher::ChaCha20Poly1305 => open::<ChaCha20Poly1305>(key, combined),
    }
}

/// Encrypt plaintext using AES-256-GCM with a fresh random nonce.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt_with(Cipher::Aes256Gcm, key, plaintext)
}

/// Decrypt AES-256-GCM ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input is shorter than
/// 28 bytes (nonce + tag minimum).
///
/// Returns [`CryptoError::Decryption`] if authentication fails (wrong key,
/// corrupted data, or tampered tag).
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt_with(Cipher::Aes256Gcm, key, combined)
}

/// Derive a subkey from a parent key using HKDF-SHA256.
///
/// The `info` string must be unique per purpose (e.g. `b"arcanum-kv-v1"`).
/// Transit derived keys pass the caller's context as `salt`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails (should
/// only happen if output length exceeds 255 * hash length).
pub fn derive_key(
    parent: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, parent.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Fill a fresh buffer of `len` bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext = b"secret data for arcanum";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn chacha_roundtrip_and_cipher_separation() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt_with(Cipher::ChaCha20Poly1305, &key, b"payload").unwrap();
        assert_eq!(
            decrypt_with(Cipher::ChaCha20Poly1305, &key, &ciphertext).unwrap(),
            b"payload"
        );
        assert!(decrypt_with(Cipher::Aes256Gcm, &key, &ciphertext).is_err());
    }

    #[test]
    fn encrypt_decrypt_empty_plaintext() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"").unwrap();
        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();
        let ciphertext = encrypt(&key1, b"secret").unwrap();
        assert!(decrypt(&key2, &ciphertext).is_err());
    }

    #[test]
    fn decrypt_too_short_fails() {
        let key = EncryptionKey::generate();
        let result = decrypt(&key, &[0u8; 10]);
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut ciphertext = encrypt(&key, b"secret").unwrap();
        if let Some(byte) = ciphertext.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        let result = decrypt(&key, &ciphertext);
        assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn two_encryptions_produce_different_ciphertext() {
        let key = EncryptionKey::generate();
        let ct1 = encrypt(&key, b"same data").unwrap();
        let ct2 = encrypt(&key, b"same data").unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn derive_key_is_deterministic_per_info() {
        let root = EncryptionKey::generate();
        let k1 = derive_key(&root, None, b"arcanum-kv-v1").unwrap();
        let k2 = derive_key(&root, None, b"arcanum-kv-v1").unwrap();
        let k3 = derive_key(&root, None, b"arcanum-pki-v1").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn derive_key_salt_changes_output() {
        let root = EncryptionKey::generate();
        let a = derive_key(&root, Some(b"tenant-a"), b"transit").unwrap();
        let b = derive_key(&root, Some(b"tenant-b"), b"transit").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(EncryptionKey::from_slice(&[7u8; 32]).is_some());
        assert!(EncryptionKey::from_slice(&[7u8; 31]).is_none());
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let key = EncryptionKey::from_bytes([0xAB; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("171"));
    }
}
