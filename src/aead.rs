//! AEAD: AES-256-GCM

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;

use crate::error::CipherError;
use crate::wire::NONCE_BYTES;

/// Generate a random 12-byte nonce. Called once per encryption.
pub fn nonce() -> Result<[u8; NONCE_BYTES], CipherError> {
    let mut n = [0u8; NONCE_BYTES];
    getrandom(&mut n).map_err(|e| CipherError::Encryption(format!("nonce: {}", e)))?;
    Ok(n)
}

/// AEAD seal (encrypt path). Output is ciphertext || 16-byte tag.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CipherError::Encryption("key init".into()))?;
    let n = Nonce::from_slice(nonce);
    cipher
        .encrypt(n, plaintext)
        .map_err(|_| CipherError::Encryption("seal".into()))
}

/// AEAD open (decrypt path). Any tag mismatch is a `Decryption` error.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_BYTES],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::Decryption)?;
    let n = Nonce::from_slice(nonce);
    cipher.decrypt(n, ciphertext).map_err(|_| CipherError::Decryption)
}
