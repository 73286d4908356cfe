//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type alias for cryptographic operations
pub type Result<T> = core::result::Result<T, CryptoError>;

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Input has the wrong length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Public key not a valid curve point
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Private key out of range
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// AEAD encryption failed
    #[error("encryption failed")]
    Encryption,

    /// AEAD authentication failed
    #[error("decryption failed: message authentication check failed")]
    Decryption,

    /// Signature did not verify
    #[error("signature verification failed")]
    Signature,

    /// Passcode rejected by policy
    #[error("invalid passcode")]
    InvalidPasscode,

    /// Group arithmetic produced an unusable point
    #[error("invalid group element: {0}")]
    InvalidPoint(&'static str),
}
