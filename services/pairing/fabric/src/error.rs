//! Fabric error types.

use crate::FabricIndex;
use pairing_crypto::CryptoError;
use pairing_storage::StorageError;
use pairing_tlv::ValidationError;
use thiserror::Error;

/// Operational certificate errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CertificateError {
    /// TLV encoding does not match the certificate schema
    #[error("malformed certificate: {0}")]
    Encoding(#[from] ValidationError),

    /// Signature does not verify under the issuer key
    #[error("{0} certificate signature is invalid")]
    Signature(&'static str),

    /// Certificate must (or must not) be a CA
    #[error("{0} certificate has wrong CA flag")]
    CaFlag(&'static str),

    /// Root certificate issuer differs from its subject
    #[error("root certificate is not self-issued")]
    NotSelfIssued,

    /// Issuer name does not match the signing certificate's subject
    #[error("{0} certificate issuer does not match its signer")]
    IssuerMismatch(&'static str),

    /// A required identity attribute is missing
    #[error("certificate subject missing {0}")]
    MissingIdentity(&'static str),

    /// Root forbids intermediate CAs
    #[error("root certificate path length forbids an intermediate CA")]
    PathLength,

    /// Certificates in the chain name different fabrics
    #[error("fabric id mismatch in certificate chain")]
    FabricMismatch,

    /// Public key is not a valid P-256 point
    #[error("certificate public key invalid: {0}")]
    PublicKey(CryptoError),
}

/// Fabric table errors
#[derive(Error, Debug)]
pub enum FabricError {
    /// A fabric already occupies this index
    #[error("Fabric with index {0} already exists.")]
    DuplicateIndex(FabricIndex),

    /// Remove/revoke of an index that holds no fabric
    #[error("Fabric with index {0} cannot be removed because it does not exist.")]
    NotFound(FabricIndex),

    /// Update of an index that holds no fabric
    #[error("Fabric with index {0} does not exist.")]
    Unknown(FabricIndex),

    /// Every index in 1..=254 is taken
    #[error("No free fabric index available.")]
    TableFull,

    /// Index outside 1..=254
    #[error("fabric index {0} out of range 1..=254")]
    InvalidIndex(u64),

    /// The same root and fabric id are already present under another index
    #[error("fabric {fabric_id:016x} is already present at index {existing}")]
    Conflict {
        /// Fabric id
        fabric_id: u64,
        /// Index already holding it
        existing: FabricIndex,
    },

    /// Label longer than allowed
    #[error("fabric label exceeds {0} characters")]
    InvalidLabel(usize),

    /// Label used by another fabric
    #[error("fabric label \"{0}\" is already in use")]
    LabelConflict(String),

    /// Builder input missing
    #[error("fabric is missing {0}")]
    Incomplete(&'static str),

    /// Operational key does not match the NOC public key
    #[error("operational key does not match the node operational certificate")]
    KeyMismatch,

    /// Certificate chain rejected
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Crypto failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Persisted record cannot be restored
    #[error("corrupt fabric record: {0}")]
    Corrupt(String),
}
