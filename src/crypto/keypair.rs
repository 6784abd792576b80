//! Gateway ECDH key pair generation on NIST P-256

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;

use super::PUBLIC_KEY_LEN;
use crate::error::EngineError;

/// A gateway ECDH key pair. Regenerated wholesale on every rotation;
/// the previous pair is dropped and never reused.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    ///
    /// Randomness is drawn fallibly: if the OS source fails we must not
    /// continue producing key material, so the error is surfaced instead
    /// of panicking inside the RNG.
    pub fn generate() -> Result<Self, EngineError> {
        let mut rng = OsRng;

        // A uniformly random 32-byte string is a valid P-256 scalar with
        // overwhelming probability; retry the negligible rejection cases.
        for _ in 0..8 {
            let mut bytes = [0u8; 32];
            rng.try_fill_bytes(&mut bytes)
                .map_err(|e| EngineError::RandomSource(e.to_string()))?;

            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                let public = secret.public_key();
                return Ok(Self { secret, public });
            }
        }

        Err(EngineError::RandomSource(
            "could not produce a valid P-256 scalar".to_string(),
        ))
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Public key as the 65-byte uncompressed SEC1 point (0x04 || X || Y).
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.public.to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Public key as lowercase hex (130 characters), the on-air encoding
    /// used by the `UA_PUBKEY:` broadcast.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log private key material.
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_hex())
            .finish()
    }
}
