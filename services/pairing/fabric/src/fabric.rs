//! A single fabric: credentials, derived identifiers and scoped data.

use crate::cert::{verify_chain, Certificate, OperationalIdentity};
use crate::{CertificateError, FabricError, FabricId, FabricIndex, NodeId, VendorId};
use pairing_crypto::{
    constant_time_eq, hkdf_sha256, hmac_sha256, CryptoError, KeyPair, HASH_LEN, PUBLIC_KEY_LEN,
    SIGNATURE_LEN, SYMMETRIC_KEY_LEN,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Maximum fabric label length in characters
pub const MAX_LABEL_LEN: usize = 32;

/// Compressed fabric identifier length
pub const COMPRESSED_FABRIC_ID_LEN: usize = 8;

const COMPRESSED_FABRIC_INFO: &[u8] = b"CompressedFabric";
const GROUP_KEY_INFO: &[u8] = b"GroupKey v1.0";

/// Compressed fabric id: HKDF over the root public key (without the SEC1
/// prefix), salted with the big-endian fabric id
pub fn compressed_fabric_id(
    root_public_key: &[u8; PUBLIC_KEY_LEN],
    fabric_id: FabricId,
) -> Result<[u8; COMPRESSED_FABRIC_ID_LEN], CryptoError> {
    let okm = hkdf_sha256(
        &root_public_key[1..],
        &fabric_id.0.to_be_bytes(),
        COMPRESSED_FABRIC_INFO,
        COMPRESSED_FABRIC_ID_LEN,
    )?;
    let mut out = [0u8; COMPRESSED_FABRIC_ID_LEN];
    out.copy_from_slice(&okm);
    Ok(out)
}

/// Operational identity protection key derived from the epoch key
pub fn operational_ipk(
    epoch_key: &[u8; SYMMETRIC_KEY_LEN],
    compressed_fabric_id: &[u8; COMPRESSED_FABRIC_ID_LEN],
) -> Result<[u8; SYMMETRIC_KEY_LEN], CryptoError> {
    let okm = hkdf_sha256(epoch_key, compressed_fabric_id, GROUP_KEY_INFO, SYMMETRIC_KEY_LEN)?;
    let mut out = [0u8; SYMMETRIC_KEY_LEN];
    out.copy_from_slice(&okm);
    Ok(out)
}

/// One trust domain the node belongs to
#[derive(Clone)]
pub struct Fabric {
    index: FabricIndex,
    fabric_id: FabricId,
    node_id: NodeId,
    root_node_id: NodeId,
    root_vendor_id: VendorId,
    root_cert: Certificate,
    intermediate_ca_cert: Option<Certificate>,
    operational_cert: Certificate,
    operational_key: KeyPair,
    epoch_key: [u8; SYMMETRIC_KEY_LEN],
    ipk: [u8; SYMMETRIC_KEY_LEN],
    operational_id: [u8; COMPRESSED_FABRIC_ID_LEN],
    label: String,
    scoped_data: BTreeMap<String, Value>,
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("index", &self.index)
            .field("fabric_id", &self.fabric_id)
            .field("node_id", &self.node_id)
            .field("root_node_id", &self.root_node_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Fabric {
    /// Table index
    pub fn index(&self) -> FabricIndex {
        self.index
    }

    /// Fabric id
    pub fn fabric_id(&self) -> FabricId {
        self.fabric_id
    }

    /// This node's id in the fabric
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Root CA id
    pub fn root_node_id(&self) -> NodeId {
        self.root_node_id
    }

    /// Vendor that commissioned the fabric
    pub fn root_vendor_id(&self) -> VendorId {
        self.root_vendor_id
    }

    /// Root CA public key
    pub fn root_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.root_cert.public_key
    }

    /// Root CA certificate
    pub fn root_certificate(&self) -> &Certificate {
        &self.root_cert
    }

    /// Intermediate CA certificate, if the chain has one
    pub fn intermediate_certificate(&self) -> Option<&Certificate> {
        self.intermediate_ca_cert.as_ref()
    }

    /// Node operational certificate
    pub fn operational_certificate(&self) -> &Certificate {
        &self.operational_cert
    }

    /// Operational key pair
    pub fn operational_key(&self) -> &KeyPair {
        &self.operational_key
    }

    /// Operational identity protection key
    pub fn identity_protection_key(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.ipk
    }

    /// Compressed fabric id
    pub fn operational_id(&self) -> &[u8; COMPRESSED_FABRIC_ID_LEN] {
        &self.operational_id
    }

    /// User-visible label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Fabric-scoped value stored under `key`
    pub fn scoped_data(&self, key: &str) -> Option<&Value> {
        self.scoped_data.get(key)
    }

    pub(crate) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    pub(crate) fn set_scoped_data(&mut self, key: String, value: Option<Value>) {
        match value {
            Some(value) => self.scoped_data.insert(key, value),
            None => self.scoped_data.remove(&key),
        };
    }

    pub(crate) fn copy_scoped_data_from(&mut self, other: &Fabric) {
        self.scoped_data = other.scoped_data.clone();
    }

    /// Same root key and fabric id, i.e. the same trust domain
    pub fn same_trust_domain(&self, other: &Fabric) -> bool {
        self.fabric_id == other.fabric_id && self.root_public_key() == other.root_public_key()
    }

    /// Destination id an initiator sends to reach `target` in this fabric:
    /// HMAC(IPK, random || rootPublicKey || fabricId LE || nodeId LE)
    pub fn destination_id(
        &self,
        initiator_random: &[u8],
        target: NodeId,
    ) -> Result<[u8; HASH_LEN], CryptoError> {
        hmac_sha256(
            &self.ipk,
            &[
                initiator_random,
                self.root_public_key(),
                &self.fabric_id.0.to_le_bytes(),
                &target.0.to_le_bytes(),
            ],
        )
    }

    /// Whether a received destination id addresses this node in this fabric
    pub fn matches_destination_id(&self, destination_id: &[u8], initiator_random: &[u8]) -> bool {
        match self.destination_id(initiator_random, self.node_id) {
            Ok(expected) => constant_time_eq(&expected, destination_id),
            Err(_) => false,
        }
    }

    /// Verify a peer's certificates against this fabric's root
    pub fn verify_peer(
        &self,
        noc: &[u8],
        icac: Option<&[u8]>,
    ) -> Result<OperationalIdentity, FabricError> {
        let noc = Certificate::from_bytes(noc)?;
        let icac = icac.map(Certificate::from_bytes).transpose()?;
        let identity = verify_chain(&self.root_cert, icac.as_ref(), &noc)?;
        if identity.fabric_id != self.fabric_id.0 {
            return Err(CertificateError::FabricMismatch.into());
        }
        Ok(identity)
    }

    /// Sign with the operational key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.operational_key.sign(message)
    }

    /// Persistable form
    pub fn to_record(&self) -> FabricRecord {
        FabricRecord {
            fabric_index: self.index,
            fabric_id: self.fabric_id,
            node_id: self.node_id,
            root_node_id: self.root_node_id,
            root_vendor_id: self.root_vendor_id,
            root_public_key: self.root_public_key().to_vec(),
            root_cert: self.root_cert.to_bytes(),
            intermediate_ca_cert: self.intermediate_ca_cert.as_ref().map(Certificate::to_bytes),
            operational_cert: self.operational_cert.to_bytes(),
            operational_key: self.operational_key.private_key().to_vec(),
            identity_protection_key: self.epoch_key.to_vec(),
            label: self.label.clone(),
            scoped_cluster_data: self.scoped_data.clone(),
        }
    }

    /// Restore from a persisted record, re-verifying the certificate chain
    pub fn from_record(record: &FabricRecord) -> Result<Self, FabricError> {
        let corrupt = |what: &str, e: &dyn fmt::Display| {
            FabricError::Corrupt(format!("fabric {}: {}: {}", record.fabric_index, what, e))
        };

        let key = KeyPair::from_private(&record.operational_key)
            .map_err(|e| corrupt("operationalKey", &e))?;
        let root = Certificate::from_bytes(&record.root_cert).map_err(|e| corrupt("rootCert", &e))?;
        let icac = record
            .intermediate_ca_cert
            .as_deref()
            .map(Certificate::from_bytes)
            .transpose()
            .map_err(|e| corrupt("intermediateCaCert", &e))?;
        let noc = Certificate::from_bytes(&record.operational_cert)
            .map_err(|e| corrupt("operationalCert", &e))?;
        let epoch_key: [u8; SYMMETRIC_KEY_LEN] = record
            .identity_protection_key
            .as_slice()
            .try_into()
            .map_err(|_| corrupt("identityProtectionKey", &"wrong length"))?;

        let mut fabric = FabricBuilder::new(key)
            .index(record.fabric_index)
            .root_vendor_id(record.root_vendor_id)
            .identity_protection_key(epoch_key)
            .root_certificate(root)
            .intermediate_certificate(icac)
            .operational_certificate(noc)
            .label(record.label.clone())
            .build()
            .map_err(|e| corrupt("credentials", &e))?;

        if fabric.fabric_id != record.fabric_id
            || fabric.node_id != record.node_id
            || fabric.root_public_key()[..] != record.root_public_key[..]
        {
            return Err(corrupt("identity", &"does not match certificates"));
        }
        fabric.scoped_data = record.scoped_cluster_data.clone();
        Ok(fabric)
    }
}

/// Assembles and validates a [`Fabric`] from AddNOC inputs
pub struct FabricBuilder {
    operational_key: KeyPair,
    index: Option<FabricIndex>,
    root_vendor_id: VendorId,
    epoch_key: Option<[u8; SYMMETRIC_KEY_LEN]>,
    root_cert: Option<Certificate>,
    intermediate_ca_cert: Option<Certificate>,
    operational_cert: Option<Certificate>,
    label: String,
}

impl FabricBuilder {
    /// Start from the node's operational key pair
    pub fn new(operational_key: KeyPair) -> Self {
        Self {
            operational_key,
            index: None,
            root_vendor_id: VendorId(0),
            epoch_key: None,
            root_cert: None,
            intermediate_ca_cert: None,
            operational_cert: None,
            label: String::new(),
        }
    }

    /// Table index
    pub fn index(mut self, index: FabricIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Admin vendor id
    pub fn root_vendor_id(mut self, vendor: VendorId) -> Self {
        self.root_vendor_id = vendor;
        self
    }

    /// Identity protection epoch key
    pub fn identity_protection_key(mut self, epoch_key: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        self.epoch_key = Some(epoch_key);
        self
    }

    /// Trusted root certificate
    pub fn root_certificate(mut self, cert: Certificate) -> Self {
        self.root_cert = Some(cert);
        self
    }

    /// Optional intermediate CA certificate
    pub fn intermediate_certificate(mut self, cert: Option<Certificate>) -> Self {
        self.intermediate_ca_cert = cert;
        self
    }

    /// Node operational certificate
    pub fn operational_certificate(mut self, cert: Certificate) -> Self {
        self.operational_cert = Some(cert);
        self
    }

    /// Label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Verify the chain and key, derive identifiers
    pub fn build(self) -> Result<Fabric, FabricError> {
        let index = self.index.ok_or(FabricError::Incomplete("fabric index"))?;
        let epoch_key = self
            .epoch_key
            .ok_or(FabricError::Incomplete("identity protection key"))?;
        let root_cert = self
            .root_cert
            .ok_or(FabricError::Incomplete("root certificate"))?;
        let operational_cert = self
            .operational_cert
            .ok_or(FabricError::Incomplete("operational certificate"))?;
        if self.label.chars().count() > MAX_LABEL_LEN {
            return Err(FabricError::InvalidLabel(MAX_LABEL_LEN));
        }

        let identity = verify_chain(
            &root_cert,
            self.intermediate_ca_cert.as_ref(),
            &operational_cert,
        )?;
        if &identity.public_key != self.operational_key.public_key() {
            return Err(FabricError::KeyMismatch);
        }

        let fabric_id = FabricId(identity.fabric_id);
        let operational_id = compressed_fabric_id(&root_cert.public_key, fabric_id)?;
        let ipk = operational_ipk(&epoch_key, &operational_id)?;

        Ok(Fabric {
            index,
            fabric_id,
            node_id: NodeId(identity.node_id),
            root_node_id: NodeId(identity.root_node_id),
            root_vendor_id: self.root_vendor_id,
            root_cert,
            intermediate_ca_cert: self.intermediate_ca_cert,
            operational_cert,
            operational_key: self.operational_key,
            epoch_key,
            ipk,
            operational_id,
            label: self.label,
            scoped_data: BTreeMap::new(),
        })
    }
}

/// Stored form of a fabric (JSON, camelCase keys)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FabricRecord {
    /// Table index
    pub fabric_index: FabricIndex,
    /// Fabric id
    pub fabric_id: FabricId,
    /// Node id
    pub node_id: NodeId,
    /// Root CA id
    pub root_node_id: NodeId,
    /// Admin vendor id
    pub root_vendor_id: VendorId,
    /// Root public key
    pub root_public_key: Vec<u8>,
    /// Root certificate (TLV)
    pub root_cert: Vec<u8>,
    /// Intermediate CA certificate (TLV)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_ca_cert: Option<Vec<u8>>,
    /// Node operational certificate (TLV)
    pub operational_cert: Vec<u8>,
    /// Operational private key
    pub operational_key: Vec<u8>,
    /// Identity protection epoch key
    pub identity_protection_key: Vec<u8>,
    /// Label
    pub label: String,
    /// Fabric-scoped data
    #[serde(default)]
    pub scoped_cluster_data: BTreeMap<String, Value>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cert::CertificateAuthority;

    pub(crate) const FABRIC_ID: u64 = 0x2906_C908_D115_D362;
    pub(crate) const EPOCH_KEY: [u8; 16] = [
        0x4a, 0x71, 0xcd, 0xd7, 0xb2, 0xa3, 0xca, 0x90, 0x24, 0xf9, 0x6f, 0x3c, 0x96, 0xa1, 0x9d,
        0xee,
    ];

    pub(crate) fn build_fabric(ca: &CertificateAuthority, index: u8, node_id: u64) -> Fabric {
        let key = KeyPair::generate();
        let noc = ca.issue_node(key.public_key(), node_id, FABRIC_ID).unwrap();
        FabricBuilder::new(key)
            .index(FabricIndex::new(index).unwrap())
            .root_vendor_id(VendorId(0xFFF1))
            .identity_protection_key(EPOCH_KEY)
            .root_certificate(ca.certificate().clone())
            .operational_certificate(noc)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_derives_identity() {
        let ca = CertificateAuthority::new_root(1, None);
        let fabric = build_fabric(&ca, 1, 0x1234);
        assert_eq!(fabric.node_id(), NodeId(0x1234));
        assert_eq!(fabric.fabric_id(), FabricId(FABRIC_ID));
        assert_eq!(fabric.root_node_id(), NodeId(1));
        assert_eq!(
            fabric.operational_id(),
            &compressed_fabric_id(&ca.certificate().public_key, FabricId(FABRIC_ID)).unwrap()
        );
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let ca = CertificateAuthority::new_root(1, None);
        let noc = ca
            .issue_node(KeyPair::generate().public_key(), 1, FABRIC_ID)
            .unwrap();
        let err = FabricBuilder::new(KeyPair::generate())
            .index(FabricIndex::new(1).unwrap())
            .identity_protection_key(EPOCH_KEY)
            .root_certificate(ca.certificate().clone())
            .operational_certificate(noc)
            .build()
            .unwrap_err();
        assert!(matches!(err, FabricError::KeyMismatch));
    }

    #[test]
    fn test_destination_id_matching() {
        let ca = CertificateAuthority::new_root(1, None);
        let fabric = build_fabric(&ca, 1, 0x1234);
        let random = [7u8; 32];

        let dest = fabric.destination_id(&random, NodeId(0x1234)).unwrap();
        assert!(fabric.matches_destination_id(&dest, &random));
        assert!(!fabric.matches_destination_id(&dest, &[8u8; 32]));

        let other_node = fabric.destination_id(&random, NodeId(0x9999)).unwrap();
        assert!(!fabric.matches_destination_id(&other_node, &random));
    }

    #[test]
    fn test_record_roundtrip() {
        let ca = CertificateAuthority::new_root(1, None);
        let mut fabric = build_fabric(&ca, 3, 0x1234);
        fabric.set_label("kitchen".into());
        fabric.set_scoped_data("acl".into(), Some(serde_json::json!([1, 2])));

        let record = fabric.to_record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["fabricIndex"], 3);
        assert!(json.get("intermediateCaCert").is_none());

        let restored = Fabric::from_record(&record).unwrap();
        assert_eq!(restored.to_record(), record);
        assert_eq!(restored.identity_protection_key(), fabric.identity_protection_key());
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let ca = CertificateAuthority::new_root(1, None);
        let mut record = build_fabric(&ca, 3, 0x1234).to_record();
        record.node_id = NodeId(1);
        assert!(matches!(Fabric::from_record(&record), Err(FabricError::Corrupt(_))));

        let mut record = build_fabric(&ca, 3, 0x1234).to_record();
        record.operational_cert.truncate(10);
        assert!(matches!(Fabric::from_record(&record), Err(FabricError::Corrupt(_))));
    }

    #[test]
    fn test_verify_peer_in_same_fabric() {
        let ca = CertificateAuthority::new_root(1, None);
        let fabric = build_fabric(&ca, 1, 1);
        let peer_key = KeyPair::generate();
        let peer_noc = ca.issue_node(peer_key.public_key(), 2, FABRIC_ID).unwrap();

        let identity = fabric.verify_peer(&peer_noc.to_bytes(), None).unwrap();
        assert_eq!(identity.node_id, 2);
        assert_eq!(&identity.public_key, peer_key.public_key());

        let foreign = ca.issue_node(peer_key.public_key(), 2, FABRIC_ID + 1).unwrap();
        assert!(matches!(
            fabric.verify_peer(&foreign.to_bytes(), None),
            Err(FabricError::Certificate(CertificateError::FabricMismatch))
        ));
    }
}
