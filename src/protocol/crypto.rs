//! Symmetric crypto primitives: AES-128-ECB with zero padding and
//! HMAC-SHA256 truncated to 2 bytes, composed as encrypt-then-MAC.
//!
//! The 2-byte MAC truncation is part of the wire protocol and must not be
//! widened. ECB mode carries no chaining or authenticated-mode semantics;
//! authentication comes solely from the truncated HMAC over the ciphertext.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// AES key length used from the front of the supplied key material.
pub const AES_KEY_SIZE: usize = 16;
/// AES block length.
pub const AES_BLOCK_SIZE: usize = 16;
/// Truncated MAC length prepended to ciphertext.
pub const CIPHER_MAC_SIZE: usize = 2;
/// Full shared-secret length used as the MAC key.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Errors from [`mac_then_decrypt`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The truncated MAC did not match the ciphertext.
    #[error("message authentication failed")]
    Auth,
    /// Input shorter than MAC plus one cipher block.
    #[error("encrypted input too short")]
    TooShort,
}

/// Pad to the next AES block boundary with zeros. Empty input pads to one
/// all-zero block.
fn zero_pad(data: &[u8]) -> Vec<u8> {
    let mut padded_len = data.len().div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    if padded_len == 0 {
        padded_len = AES_BLOCK_SIZE;
    }
    let mut out = data.to_vec();
    out.resize(padded_len, 0);
    out
}

/// HMAC-SHA256 truncated to [`CIPHER_MAC_SIZE`] bytes.
pub fn compute_hmac(key: &[u8], data: &[u8]) -> [u8; CIPHER_MAC_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    [full[0], full[1]]
}

/// Verify a truncated MAC in constant time.
pub fn verify_hmac(tag: &[u8], key: &[u8], data: &[u8]) -> bool {
    if tag.len() != CIPHER_MAC_SIZE {
        return false;
    }
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.verify_truncated_left(tag).is_ok()
}

/// AES-128-ECB encrypt, block by block, zero-padded. Uses the first 16 bytes
/// of `key`.
pub fn encrypt_ecb(plaintext: &[u8], key: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(&key[..AES_KEY_SIZE]));
    let padded = zero_pad(plaintext);
    let mut out = Vec::with_capacity(padded.len());
    for chunk in padded.chunks_exact(AES_BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    out
}

/// AES-128-ECB decrypt over complete blocks. Uses the first 16 bytes of
/// `key`.
pub fn decrypt_ecb(ciphertext: &[u8], key: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(&key[..AES_KEY_SIZE]));
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks_exact(AES_BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    out
}

/// Encrypt-then-MAC: `[MAC:2][ciphertext]`.
///
/// `key` supplies the AES key (first 16 bytes); `mac_key` is the full shared
/// secret.
pub fn encrypt_then_mac(plaintext: &[u8], key: &[u8], mac_key: &[u8]) -> Vec<u8> {
    let ciphertext = encrypt_ecb(plaintext, key);
    let mac = compute_hmac(mac_key, &ciphertext);
    let mut out = Vec::with_capacity(CIPHER_MAC_SIZE + ciphertext.len());
    out.extend_from_slice(&mac);
    out.extend_from_slice(&ciphertext);
    out
}

/// Verify the leading MAC, then decrypt. No plaintext is returned on a MAC
/// mismatch.
pub fn mac_then_decrypt(data: &[u8], key: &[u8], mac_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < CIPHER_MAC_SIZE + AES_BLOCK_SIZE {
        return Err(CryptoError::TooShort);
    }
    let (mac, ciphertext) = data.split_at(CIPHER_MAC_SIZE);
    if !verify_hmac(mac, mac_key, ciphertext) {
        return Err(CryptoError::Auth);
    }
    Ok(decrypt_ecb(ciphertext, key))
}
