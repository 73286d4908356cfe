//! Cryptographic primitives for device pairing.
//!
//! This crate wraps the RustCrypto implementations used by the pairing
//! handshakes behind small, length-checked functions:
//!
//! - **P-256**: key generation, ECDH, ECDSA-SHA256 ([`KeyPair`], [`verify`])
//! - **KDFs**: SHA-256, HMAC-SHA256, HKDF-SHA256, PBKDF2-HMAC-SHA256
//! - **AEAD**: AES-128 with 13-byte nonces and 16-byte tags
//! - **SPAKE2+**: prover and verifier halves plus passcode verifiers
//!
//! Secret material is returned in `Zeroizing` wrappers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keypair;
pub mod spake2p;

use rand::RngCore;
use subtle::ConstantTimeEq;

pub use error::{CryptoError, Result};
pub use kdf::{hkdf_sha256, hmac_sha256, pbkdf2_sha256, sha256};
pub use keypair::{parse_public_key, verify, KeyPair};
pub use spake2p::{
    validate_passcode, PasscodeSecrets, PasscodeVerifier, Spake2pKeys, Spake2pProver,
    Spake2pVerifier,
};

/// SHA-256 output length
pub const HASH_LEN: usize = 32;

/// P-256 scalar / coordinate length
pub const GROUP_SIZE: usize = 32;

/// Uncompressed P-256 public key length
pub const PUBLIC_KEY_LEN: usize = 65;

/// Raw ECDSA signature length
pub const SIGNATURE_LEN: usize = 64;

/// AEAD key length
pub const SYMMETRIC_KEY_LEN: usize = 16;

/// AEAD authentication tag length
pub const AEAD_MIC_LEN: usize = 16;

/// AEAD nonce length
pub const AEAD_NONCE_LEN: usize = 13;

/// Compare two byte strings without early exit
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Fill a fixed-size array from the OS RNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }
}
