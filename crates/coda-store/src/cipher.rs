//! At-rest encryption for provider API keys.
//!
//! A random 32-byte key lives in a dotfile next to the database. Values are
//! encrypted with a SHA-256-derived keystream under a fresh random nonce and
//! stored hex-encoded. This keeps secrets out of casual `strings`/backup
//! exposure; it is not meant to resist an attacker who can read the key file.

use std::path::Path;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::StoreError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl SecretCipher {
    /// Load the key file, creating it with fresh random bytes on first use.
    pub fn load_or_create(key_file: &Path) -> Result<Self, StoreError> {
        if key_file.exists() {
            let raw = std::fs::read_to_string(key_file)?;
            let bytes = hex::decode(raw.trim())
                .map_err(|e| StoreError::Cipher(format!("invalid key file: {}", e)))?;
            if bytes.len() != KEY_LEN {
                return Err(StoreError::Cipher(format!(
                    "key file has {} bytes, expected {}",
                    bytes.len(),
                    KEY_LEN
                )));
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            return Ok(Self { key });
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        std::fs::write(key_file, hex::encode(key))?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext.as_bytes());
        self.apply_keystream(&nonce, &mut out[NONCE_LEN..]);
        hex::encode(out)
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, StoreError> {
        let raw = hex::decode(encoded.trim())
            .map_err(|e| StoreError::Cipher(format!("invalid ciphertext: {}", e)))?;
        if raw.len() < NONCE_LEN {
            return Err(StoreError::Cipher("ciphertext too short".to_string()));
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let mut plain = body.to_vec();
        self.apply_keystream(nonce, &mut plain);
        String::from_utf8(plain)
            .map_err(|e| StoreError::Cipher(format!("decrypted value is not utf-8: {}", e)))
    }

    /// XOR with SHA256(key || nonce || block_index) blocks.
    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        let mut block_index: u64 = 0;
        let mut offset = 0;
        while offset < data.len() {
            let mut hasher = Sha256::new();
            hasher.update(self.key);
            hasher.update(nonce);
            hasher.update(block_index.to_le_bytes());
            let block = hasher.finalize();
            for byte in block.iter() {
                if offset >= data.len() {
                    break;
                }
                data[offset] ^= byte;
                offset += 1;
            }
            block_index += 1;
        }
    }
}
