//! Cryptographic core: P-256 ECDH key agreement and the AES-128-CBC
//! sensor payload codec.
//!
//! The symmetric parameters (zero IV, zero padding, raw x-coordinate as
//! key material) are fixed by the embedded peer firmware this gateway
//! must interoperate with. See `cipher.rs` for the caveats.

pub mod cipher;
pub mod ecdh;
pub mod keypair;

pub use cipher::SensorCrypto;
pub use ecdh::derive_shared_secret;
pub use keypair::KeyPair;

/// Raw ECDH shared secret: the x-coordinate of the shared point.
pub type SharedSecret = [u8; 32];

/// Uncompressed SEC1 point length (0x04 || X || Y) on P-256.
pub const PUBLIC_KEY_LEN: usize = 65;

/// Hex length of an uncompressed public key.
pub const PUBLIC_KEY_HEX_LEN: usize = PUBLIC_KEY_LEN * 2;
