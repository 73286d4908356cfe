//! P-256 key pairs: ECDH and ECDSA-SHA256.
//!
//! Public keys are uncompressed SEC1 points (0x04 || x || y, 65 bytes);
//! signatures are raw `r || s` (64 bytes).

use crate::{CryptoError, Result, GROUP_SIZE, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use p256::ecdh::diffie_hellman;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// P-256 key pair with cached public key bytes
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &&self.public_key[..8])
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a random key pair
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Restore a key pair from a 32-byte big-endian private scalar
    pub fn from_private(private_key: &[u8]) -> Result<Self> {
        if private_key.len() != GROUP_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: GROUP_SIZE,
                actual: private_key.len(),
            });
        }
        let secret_key = SecretKey::from_slice(private_key)
            .map_err(|_| CryptoError::InvalidPrivateKey("scalar out of range".into()))?;
        Ok(Self::from_secret(secret_key))
    }

    fn from_secret(secret_key: SecretKey) -> Self {
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(secret_key.public_key().to_encoded_point(false).as_bytes());
        Self {
            secret_key,
            public_key,
        }
    }

    /// Uncompressed public key
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// Private scalar, big-endian
    pub fn private_key(&self) -> Zeroizing<[u8; GROUP_SIZE]> {
        let mut out = Zeroizing::new([0u8; GROUP_SIZE]);
        out.copy_from_slice(&self.secret_key.to_bytes());
        out
    }

    /// ECDH shared secret (x coordinate) with a peer public key
    pub fn ecdh(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; GROUP_SIZE]>> {
        let peer = parse_public_key(peer_public)?;
        let shared = diffie_hellman(self.secret_key.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new([0u8; GROUP_SIZE]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }

    /// ECDSA-SHA256 signature over `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signing_key = SigningKey::from(&self.secret_key);
        let signature: Signature = signing_key.sign(message);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

/// Verify an ECDSA-SHA256 signature made by `public_key`
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidLength {
            expected: SIGNATURE_LEN,
            actual: signature.len(),
        });
    }
    parse_public_key(public_key)?;
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| CryptoError::InvalidPublicKey("not a P-256 point".into()))?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::Signature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::Signature)
}

/// Parse and validate an uncompressed public key
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidLength {
            expected: PUBLIC_KEY_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != 0x04 {
        return Err(CryptoError::InvalidPublicKey(
            "public key must be uncompressed".into(),
        ));
    }
    let point = EncodedPoint::from_bytes(bytes)
        .map_err(|_| CryptoError::InvalidPublicKey("malformed SEC1 encoding".into()))?;
    Option::from(PublicKey::from_encoded_point(&point))
        .ok_or_else(|| CryptoError::InvalidPublicKey("point not on curve".into()))
}
