//! Fabrics and the persistent fabric table.
//!
//! A fabric is one independent trust domain a device belongs to: a root CA,
//! an optional intermediate CA, the device's node operational certificate
//! and key, and an identity protection key used to address the device
//! without revealing which fabric is being contacted.
//!
//! [`FabricManager`] owns the table of up to 254 fabrics, allocates fabric
//! indices and persists the table through a [`pairing_storage::StorageContext`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cert;
pub mod error;
pub mod fabric;
pub mod manager;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use cert::{verify_chain, Certificate, CertificateAuthority, DistinguishedName, OperationalIdentity};
pub use error::{CertificateError, FabricError};
pub use fabric::{Fabric, FabricBuilder, FabricRecord, MAX_LABEL_LEN};
pub use manager::{FabricEvent, FabricManager, FABRICS_KEY, NEXT_INDEX_KEY};

/// Table slot of a fabric (1..=254, 0 reserved)
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FabricIndex(u8);

impl FabricIndex {
    /// Lowest assignable index
    pub const MIN: u8 = 1;
    /// Highest assignable index
    pub const MAX: u8 = 254;

    /// Validate and wrap an index
    pub fn new(value: u8) -> Result<Self, FabricError> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(FabricError::InvalidIndex(value as u64));
        }
        Ok(Self(value))
    }

    /// Raw index value
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for FabricIndex {
    type Error = FabricError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FabricIndex> for u8 {
    fn from(index: FabricIndex) -> u8 {
        index.0
    }
}

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fabric identifier chosen by the fabric's administrator
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FabricId(pub u64);

impl fmt::Display for FabricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Operational node identifier within a fabric
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Vendor identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VendorId(pub u16);

impl fmt::Display for VendorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_index_range() {
        assert!(FabricIndex::new(0).is_err());
        assert!(FabricIndex::new(255).is_err());
        assert_eq!(FabricIndex::new(254).unwrap().get(), 254);
    }

    #[test]
    fn test_fabric_index_serde_validates() {
        assert_eq!(serde_json::to_string(&FabricIndex::new(7).unwrap()).unwrap(), "7");
        assert!(serde_json::from_str::<FabricIndex>("0").is_err());
        assert_eq!(serde_json::from_str::<FabricIndex>("3").unwrap().get(), 3);
    }
}
