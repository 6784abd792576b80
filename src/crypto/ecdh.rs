//! ECDH shared secret derivation
//!
//! Both sides derive the same secret independently: the gateway combines
//! its private key with the device's public key, the device does the
//! mirror image. The raw x-coordinate is used directly as key material
//! (no KDF) because that is what the device firmware does.

use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::{ecdh, EncodedPoint, PublicKey, SecretKey};

use super::{SharedSecret, PUBLIC_KEY_LEN};
use crate::error::EngineError;

/// Derive the ECDH shared secret from our private key and a peer's
/// uncompressed SEC1 public key.
///
/// The peer key must be exactly 65 bytes and a well-formed point on
/// P-256; anything else is `InvalidPeerKey` and the caller keeps
/// whatever key it had before.
pub fn derive_shared_secret(
    secret: &SecretKey,
    peer_public: &[u8],
) -> Result<SharedSecret, EngineError> {
    if peer_public.len() != PUBLIC_KEY_LEN {
        return Err(EngineError::InvalidPeerKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LEN,
            peer_public.len()
        )));
    }

    let encoded = EncodedPoint::from_bytes(peer_public)
        .map_err(|e| EngineError::InvalidPeerKey(format!("malformed SEC1 encoding: {}", e)))?;

    let peer: PublicKey = Option::from(PublicKey::from_encoded_point(&encoded))
        .ok_or_else(|| EngineError::InvalidPeerKey("not a point on P-256".to_string()))?;

    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_ecdh_symmetry() {
        let gateway = KeyPair::generate().unwrap();
        let device = KeyPair::generate().unwrap();

        let a = derive_shared_secret(gateway.secret(), &device.public_key_bytes()).unwrap();
        let b = derive_shared_secret(device.secret(), &gateway.public_key_bytes()).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let gateway = KeyPair::generate().unwrap();
        let device = KeyPair::generate().unwrap();

        let a = derive_shared_secret(gateway.secret(), &device.public_key_bytes()).unwrap();
        let b = derive_shared_secret(gateway.secret(), &device.public_key_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let gateway = KeyPair::generate().unwrap();
        let result = derive_shared_secret(gateway.secret(), &[0x04; 33]);
        assert!(matches!(result, Err(EngineError::InvalidPeerKey(_))));
    }

    #[test]
    fn test_non_point_rejected() {
        let gateway = KeyPair::generate().unwrap();
        // Correct length, uncompressed tag, but coordinates not on the curve
        let mut bogus = [0xFFu8; 65];
        bogus[0] = 0x04;
        let result = derive_shared_secret(gateway.secret(), &bogus);
        assert!(matches!(result, Err(EngineError::InvalidPeerKey(_))));
    }
}
