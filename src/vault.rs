//! Symmetric encrypt/decrypt boundary for stored server secrets.
//!
//! Ciphertexts are tagged with a one-byte format prefix so that `decrypt`
//! can transparently read both the current AES-256-GCM envelope and the
//! legacy unauthenticated envelope the registry may still hold on disk.

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use argon2::Argon2;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{GatewayError, Result};

const SALT: &[u8] = b"dbgateway-vault-salt-v1";
const FORMAT_GCM: u8 = 1;
const FORMAT_LEGACY_XOR: u8 = 0;

/// A derived 32-byte key, zeroized on drop.
struct DerivedKey([u8; 32]);

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn derive_key(secret: &str) -> Result<DerivedKey> {
    let mut out = [0u8; 32];
    Argon2::default()
        .hash_password_into(secret.as_bytes(), SALT, &mut out)
        .map_err(|_| GatewayError::Auth)?;
    Ok(DerivedKey(out))
}

/// Encrypt `plaintext` under `secret`. Always produces the current
/// AES-256-GCM envelope: `[FORMAT_GCM][12-byte nonce][ciphertext]`,
/// base64-encoded.
pub fn encrypt(plaintext: &str, secret: &str) -> Result<String> {
    let key = derive_key(secret)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key.0));

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| GatewayError::Auth)?;

    let mut payload = Vec::with_capacity(1 + 12 + ciphertext.len());
    payload.push(FORMAT_GCM);
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(payload))
}

/// Decrypt a ciphertext produced by `encrypt`, or a legacy-format
/// ciphertext inherited from an older store.
pub fn decrypt(ciphertext: &str, secret: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(ciphertext)
        .map_err(|_| GatewayError::Auth)?;

    if raw.is_empty() {
        return Err(GatewayError::Auth);
    }

    match raw[0] {
        FORMAT_GCM => decrypt_gcm(&raw[1..], secret),
        FORMAT_LEGACY_XOR => decrypt_legacy(&raw[1..], secret),
        _ => Err(GatewayError::Auth),
    }
}

fn decrypt_gcm(body: &[u8], secret: &str) -> Result<String> {
    if body.len() < 12 {
        return Err(GatewayError::Auth);
    }
    let key = derive_key(secret)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key.0));
    let (nonce_bytes, ciphertext) = body.split_at(12);
    let nonce = GenericArray::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| GatewayError::Auth)?;
    String::from_utf8(plaintext).map_err(|_| GatewayError::Auth)
}

/// Decode the legacy unauthenticated stream-cipher format: a keystream
/// derived from the secret, XORed byte-for-byte against the plaintext.
/// This exists only so ciphertexts written before the switch to
/// AES-256-GCM still decrypt; `encrypt` never produces this format.
fn decrypt_legacy(body: &[u8], secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Err(GatewayError::Auth);
    }
    let key_bytes = secret.as_bytes();
    let plain: Vec<u8> = body
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key_bytes[i % key_bytes.len()])
        .collect();
    String::from_utf8(plain).map_err(|_| GatewayError::Auth)
}

/// Encode `plaintext` using the legacy format. Only used by tests to
/// construct fixtures that exercise the backward-compatible decode path.
#[cfg(test)]
fn encrypt_legacy(plaintext: &str, secret: &str) -> String {
    let key_bytes = secret.as_bytes();
    let body: Vec<u8> = plaintext
        .as_bytes()
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key_bytes[i % key_bytes.len()])
        .collect();
    let mut payload = vec![FORMAT_LEGACY_XOR];
    payload.extend(body);
    base64::engine::general_purpose::STANDARD.encode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ct = encrypt("hunter2", "my-vault-key").unwrap();
        assert_eq!(decrypt(&ct, "my-vault-key").unwrap(), "hunter2");
    }

    #[test]
    fn wrong_secret_fails() {
        let ct = encrypt("hunter2", "my-vault-key").unwrap();
        assert!(decrypt(&ct, "wrong-key").is_err());
    }

    #[test]
    fn nonce_differs_across_calls() {
        let a = encrypt("same-plaintext", "k").unwrap();
        let b = encrypt("same-plaintext", "k").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_format_still_decrypts() {
        let ct = encrypt_legacy("old-password", "k");
        assert_eq!(decrypt(&ct, "k").unwrap(), "old-password");
    }
}
