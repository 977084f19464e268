//! Room crypto: key derivation, authenticated encryption and message
//! signing.
//!
//! Keys are derived with HKDF-SHA256. Payloads are sealed with AES-256-GCM
//! and travel as standard base64 of `nonce || ciphertext || tag`. Signatures
//! are base64 HMAC-SHA256.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Length of a derived room key in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Errors from the crypto capability.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Ciphertext too short ({0} bytes)")]
    Truncated(usize),

    /// Tag mismatch: wrong key or tampered ciphertext.
    #[error("Authentication failed")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid key length")]
    InvalidKey,

    #[error("Decrypted payload is not valid UTF-8")]
    Utf8,
}

/// A symmetric room key.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; KEY_LEN]);

impl RoomKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Derive a 32-byte key from a passphrase. `salt` is typically the room
/// name, so the same passphrase yields different keys in different rooms.
pub fn derive_key(passphrase: &str, salt: &str) -> Result<RoomKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), passphrase.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(&[], &mut okm).map_err(|_| CryptoError::KeyDerivation)?;
    Ok(RoomKey(okm))
}

/// Encrypt `plaintext` under a fresh random nonce.
pub fn encrypt(key: &RoomKey, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encryption)?;

    // Prepend nonce to ciphertext
    let mut sealed = nonce_bytes.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(sealed))
}

/// Decrypt text produced by [`encrypt`]. Any modification of the input is
/// reported as an error, never as altered plaintext.
pub fn decrypt(key: &RoomKey, text: &str) -> Result<String, CryptoError> {
    let data = STANDARD.decode(text.trim())?;
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Truncated(data.len()));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

/// Base64 HMAC-SHA256 of `message`.
pub fn sign(key: &RoomKey, message: &str) -> Result<String, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&key.0).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check a signature produced by [`sign`] in constant time. Malformed
/// signatures simply fail verification.
pub fn verify(key: &RoomKey, message: &str, signature: &str) -> bool {
    let Ok(expected) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&key.0) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RoomKey {
        derive_key("correct horse battery staple", "secret-room").unwrap()
    }

    // ---- key derivation ----

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(key(), key());
    }

    #[test]
    fn derive_key_depends_on_salt_and_passphrase() {
        let a = derive_key("pass", "room-a").unwrap();
        let b = derive_key("pass", "room-b").unwrap();
        let c = derive_key("other", "room-a").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn room_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", key()), "RoomKey(..)");
    }

    // ---- encrypt / decrypt ----

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let k = key();
        let long = "x".repeat(10_000);
        for plaintext in ["hello", "", "Hello \u{1f30d} \u{4e16}\u{754c}", long.as_str()] {
            let sealed = encrypt(&k, plaintext).unwrap();
            assert_eq!(decrypt(&k, &sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn encrypt_uses_fresh_nonce() {
        let k = key();
        assert_ne!(encrypt(&k, "same").unwrap(), encrypt(&k, "same").unwrap());
    }

    #[test]
    fn every_bit_flip_is_detected() {
        let k = key();
        let sealed = encrypt(&k, "attack at dawn").unwrap();
        let bytes = STANDARD.decode(&sealed).unwrap();
        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[i] ^= 1 << bit;
                let result = decrypt(&k, &STANDARD.encode(&tampered));
                assert!(
                    matches!(result, Err(CryptoError::Authentication)),
                    "flip of byte {i} bit {bit} was not detected"
                );
            }
        }
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let sealed = encrypt(&key(), "secret").unwrap();
        let other = derive_key("wrong", "secret-room").unwrap();
        assert!(matches!(decrypt(&other, &sealed), Err(CryptoError::Authentication)));
    }

    #[test]
    fn decrypt_rejects_bad_input() {
        let k = key();
        assert!(matches!(decrypt(&k, "not base64 !!"), Err(CryptoError::Encoding(_))));
        assert!(matches!(decrypt(&k, "AAAA"), Err(CryptoError::Truncated(3))));
        // A nonce with no tag cannot authenticate.
        let nonce_only = STANDARD.encode([0u8; NONCE_LEN]);
        assert!(matches!(decrypt(&k, &nonce_only), Err(CryptoError::Authentication)));
    }

    // ---- sign / verify ----

    #[test]
    fn sign_verify_roundtrip() {
        let k = key();
        let sig = sign(&k, "1|id|from|global|0|chat|hi").unwrap();
        assert!(verify(&k, "1|id|from|global|0|chat|hi", &sig));
    }

    #[test]
    fn verify_rejects_changed_message_or_key() {
        let k = key();
        let sig = sign(&k, "payload").unwrap();
        assert!(!verify(&k, "payload2", &sig));
        assert!(!verify(&derive_key("x", "y").unwrap(), "payload", &sig));
    }

    #[test]
    fn verify_rejects_malformed_signature() {
        let k = key();
        assert!(!verify(&k, "payload", "%%%"));
        assert!(!verify(&k, "payload", ""));
    }

    #[test]
    fn signature_is_base64_hmac_sha256() {
        let k = RoomKey::from_bytes([0x0b; KEY_LEN]);
        let sig = sign(&k, "Hi There").unwrap();
        let raw = STANDARD.decode(&sig).unwrap();
        assert_eq!(raw.len(), 32);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&[0x0b; KEY_LEN]).unwrap();
        mac.update(b"Hi There");
        assert_eq!(raw, mac.finalize().into_bytes().to_vec());
    }
}
