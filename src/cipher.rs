//! AES-128 in counter mode plus the MAC-keyed obfuscation layer used by the
//! encrypted scale family.
//!
//! The two layers are independent: obfuscation frames every command body of
//! that family, encryption only wraps the bodies that carry user data.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;

use crate::error::{Result, ScaleError};
use crate::framing::xor_with_key;

/// AES block and key size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Counter runs over the whole 16-byte block, big-endian
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Counter block from an IV; short IVs are zero-padded on the right, long ones truncated
#[must_use]
pub fn pad_iv(iv: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    let len = iv.len().min(BLOCK_SIZE);
    block[..len].copy_from_slice(&iv[..len]);
    block
}

fn apply_keystream(data: &[u8], key: &[u8; BLOCK_SIZE], iv: &[u8]) -> Vec<u8> {
    let counter = pad_iv(iv);
    let mut cipher = Aes128Ctr::new(key.into(), (&counter).into());
    let mut output = data.to_vec();
    cipher.apply_keystream(&mut output);
    output
}

/// AES-128-CTR encrypt without padding; output length equals input length
#[must_use]
pub fn encrypt(plaintext: &[u8], key: &[u8; BLOCK_SIZE], iv: &[u8]) -> Vec<u8> {
    apply_keystream(plaintext, key, iv)
}

/// AES-128-CTR decrypt, the inverse of [`encrypt`]
#[must_use]
pub fn decrypt(ciphertext: &[u8], key: &[u8; BLOCK_SIZE], iv: &[u8]) -> Vec<u8> {
    apply_keystream(ciphertext, key, iv)
}

/// Repeating XOR key derived from the device address (display order, reversed)
#[must_use]
pub fn mac_key(mac: &[u8; 6]) -> [u8; 6] {
    let mut key = *mac;
    key.reverse();
    key
}

/// XOR a buffer against the MAC-derived key. Applying it twice restores the input.
#[must_use]
pub fn obfuscate(data: &[u8], mac: &[u8; 6]) -> Vec<u8> {
    xor_with_key(data, &mac_key(mac))
}

/// Per-session AES key, derived after a successful authentication
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; BLOCK_SIZE]);

impl SessionKey {
    /// Obfuscated authentication code followed by the matching suffix of the initial key
    ///
    /// # Errors
    ///
    /// [`ScaleError::Cipher`] if the authentication code is empty or longer
    /// than a key.
    pub fn derive(
        auth_code: &[u8],
        mac: &[u8; 6],
        initial_key: &[u8; BLOCK_SIZE],
    ) -> Result<Self> {
        if auth_code.is_empty() || auth_code.len() > BLOCK_SIZE {
            return Err(ScaleError::Cipher(format!(
                "authentication code must be 1..={BLOCK_SIZE} bytes, got {}",
                auth_code.len()
            )));
        }

        let mut key = [0u8; BLOCK_SIZE];
        key[..auth_code.len()].copy_from_slice(&obfuscate(auth_code, mac));
        key[auth_code.len()..].copy_from_slice(&initial_key[auth_code.len()..]);
        Ok(Self(key))
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    /// Encrypt with this key
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> Vec<u8> {
        encrypt(plaintext, &self.0, iv)
    }

    /// Decrypt with this key
    #[must_use]
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Vec<u8> {
        decrypt(ciphertext, &self.0, iv)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}
