//! AES-128-CBC sensor payload codec
//!
//! Parameters are dictated by the device firmware and must not change:
//! - key = first 16 bytes of the ECDH shared secret
//! - IV  = 16 zero bytes, reused for every message
//! - padding = zero bytes up to the next block boundary (a full extra
//!   block when the plaintext is already aligned)
//!
//! Known weaknesses, kept for wire compatibility: the fixed IV leaks
//! equality of leading plaintext blocks across messages under the same
//! key, and zero padding is ambiguous for plaintexts that legitimately
//! end in zero bytes (`decrypt` strips them along with the padding).

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::SharedSecret;
use crate::error::EngineError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const BLOCK_SIZE: usize = 16;
const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Per-device symmetric codec, built from an ECDH shared secret and
/// stored alongside the device's public key in the key store.
#[derive(Clone)]
pub struct SensorCrypto {
    key: [u8; BLOCK_SIZE],
}

impl SensorCrypto {
    /// Build a codec from a derived shared secret (AES-128: only the
    /// first 16 bytes of the secret are used).
    pub fn new(shared_secret: &SharedSecret) -> Self {
        let mut key = [0u8; BLOCK_SIZE];
        key.copy_from_slice(&shared_secret[..BLOCK_SIZE]);
        Self { key }
    }

    /// Encrypt a payload. Output length is always a non-zero multiple of
    /// the block size.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        // Matches the peer exactly: pad_len is 16 when already aligned.
        let pad_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
        let mut padded = Vec::with_capacity(plaintext.len() + pad_len);
        padded.extend_from_slice(plaintext);
        padded.resize(plaintext.len() + pad_len, 0);

        Aes128CbcEnc::new(&self.key.into(), &ZERO_IV.into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded)
    }

    /// Decrypt a payload and strip the trailing zero padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EngineError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(EngineError::Decrypt(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        let mut plaintext = Aes128CbcDec::new(&self.key.into(), &ZERO_IV.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| EngineError::Decrypt(e.to_string()))?;

        while plaintext.last() == Some(&0) {
            plaintext.pop();
        }
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SensorCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SensorCrypto(aes-128-cbc)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SensorCrypto {
        let mut secret = [0u8; 32];
        for (i, b) in secret.iter_mut().enumerate() {
            *b = i as u8;
        }
        SensorCrypto::new(&secret)
    }

    #[test]
    fn test_roundtrip_sensor_reading() {
        let sc = codec();
        let ct = sc.encrypt(b"23.5C");
        assert_eq!(ct.len() % 16, 0);
        assert_eq!(sc.decrypt(&ct).unwrap(), b"23.5C");
    }

    #[test]
    fn test_roundtrip_multi_block() {
        let sc = codec();
        let msg = b"temperature=23.5;humidity=61;battery=3.7";
        assert_eq!(sc.decrypt(&sc.encrypt(msg)).unwrap(), msg);
    }

    #[test]
    fn test_aligned_plaintext_gains_full_pad_block() {
        let sc = codec();
        let msg = [0x41u8; 16];
        let ct = sc.encrypt(&msg);
        // The peer implementation always appends padding, so an aligned
        // plaintext grows by a whole block.
        assert_eq!(ct.len(), 32);
        assert_eq!(sc.decrypt(&ct).unwrap(), msg);
    }

    #[test]
    fn test_trailing_zero_bytes_are_lost() {
        // Round-trip only holds for plaintexts that do not end in zero
        // bytes; the padding scheme cannot distinguish them.
        let sc = codec();
        let msg = [0x42, 0x00, 0x00];
        let out = sc.decrypt(&sc.encrypt(&msg)).unwrap();
        assert_eq!(out, vec![0x42]);
    }

    #[test]
    fn test_interior_zero_bytes_survive() {
        let sc = codec();
        let msg = [0x00, 0x42, 0x00, 0x43];
        let out = sc.decrypt(&sc.encrypt(&msg)).unwrap();
        assert_eq!(out, msg);
    }

    #[test]
    fn test_unaligned_ciphertext_rejected() {
        let sc = codec();
        assert!(matches!(
            sc.decrypt(&[0u8; 17]),
            Err(EngineError::Decrypt(_))
        ));
        assert!(matches!(sc.decrypt(&[]), Err(EngineError::Decrypt(_))));
    }

    #[test]
    fn test_same_key_same_ciphertext() {
        // Consequence of the fixed IV: identical plaintexts under the
        // same key produce identical ciphertexts. Documented weakness.
        let sc = codec();
        assert_eq!(sc.encrypt(b"hello"), sc.encrypt(b"hello"));
    }
}
