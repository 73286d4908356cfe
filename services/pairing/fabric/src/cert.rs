//! Operational certificates in TLV form.
//!
//! ```text
//! Certificate (structure)
//!   1  serialNumber   bytes (1..=20)
//!   3  issuer         DistinguishedName
//!   4  notBefore      u32 (seconds, 0 = unspecified)
//!   5  notAfter       u32 (seconds, 0 = no expiry)
//!   6  subject        DistinguishedName
//!   9  ecPublicKey    bytes (65, uncompressed P-256)
//!   10 extensions     { 1 isCa bool, 2 pathLen u8? }
//!   11 signature      bytes (64, ECDSA-SHA256 over the TLV of tags 1..=10)
//!
//! DistinguishedName (structure, all optional u64)
//!   17 nodeId   19 icacId   20 rcacId   21 fabricId
//! ```

use crate::CertificateError;
use bytes::Bytes;
use pairing_crypto::{parse_public_key, random_bytes, CryptoError, KeyPair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use pairing_tlv::{
    encode, Element, Field, Schema, StructBuilder, StructView, TlvObject, ValidationError, Value,
};
use tracing::debug;

const TAG_SERIAL: u8 = 1;
const TAG_ISSUER: u8 = 3;
const TAG_NOT_BEFORE: u8 = 4;
const TAG_NOT_AFTER: u8 = 5;
const TAG_SUBJECT: u8 = 6;
const TAG_PUBLIC_KEY: u8 = 9;
const TAG_EXTENSIONS: u8 = 10;
const TAG_SIGNATURE: u8 = 11;

const TAG_IS_CA: u8 = 1;
const TAG_PATH_LEN: u8 = 2;

const TAG_NODE_ID: u8 = 17;
const TAG_ICAC_ID: u8 = 19;
const TAG_RCAC_ID: u8 = 20;
const TAG_FABRIC_ID: u8 = 21;

/// Subject or issuer name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    /// Operational node id
    pub node_id: Option<u64>,
    /// Intermediate CA id
    pub icac_id: Option<u64>,
    /// Root CA id
    pub rcac_id: Option<u64>,
    /// Fabric id
    pub fabric_id: Option<u64>,
}

impl DistinguishedName {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::optional(TAG_NODE_ID, "nodeId", Schema::uint64()),
            Field::optional(TAG_ICAC_ID, "icacId", Schema::uint64()),
            Field::optional(TAG_RCAC_ID, "rcacId", Schema::uint64()),
            Field::optional(TAG_FABRIC_ID, "fabricId", Schema::uint64()),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .opt_uint(TAG_NODE_ID, self.node_id)
            .opt_uint(TAG_ICAC_ID, self.icac_id)
            .opt_uint(TAG_RCAC_ID, self.rcac_id)
            .opt_uint(TAG_FABRIC_ID, self.fabric_id)
            .build()
    }

    fn from_view(view: StructView<'_>) -> Result<Self, ValidationError> {
        Ok(Self {
            node_id: view.opt_uint(TAG_NODE_ID, "nodeId")?,
            icac_id: view.opt_uint(TAG_ICAC_ID, "icacId")?,
            rcac_id: view.opt_uint(TAG_RCAC_ID, "rcacId")?,
            fabric_id: view.opt_uint(TAG_FABRIC_ID, "fabricId")?,
        })
    }
}

/// Root, intermediate or node operational certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Serial number
    pub serial_number: Vec<u8>,
    /// Issuer name
    pub issuer: DistinguishedName,
    /// Start of validity
    pub not_before: u32,
    /// End of validity, 0 for none
    pub not_after: u32,
    /// Subject name
    pub subject: DistinguishedName,
    /// Subject public key
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// Whether the subject may issue certificates
    pub is_ca: bool,
    /// Maximum number of CAs below this one
    pub path_len: Option<u8>,
    /// Issuer signature over [`Certificate::tbs`]
    pub signature: [u8; SIGNATURE_LEN],
}

impl Certificate {
    fn unsigned_fields(&self) -> StructBuilder {
        let extensions = StructBuilder::new()
            .bool(TAG_IS_CA, self.is_ca)
            .opt_uint(TAG_PATH_LEN, self.path_len.map(u64::from))
            .build();
        StructBuilder::new()
            .bytes(TAG_SERIAL, &self.serial_number)
            .value(TAG_ISSUER, self.issuer.to_tlv())
            .uint(TAG_NOT_BEFORE, self.not_before as u64)
            .uint(TAG_NOT_AFTER, self.not_after as u64)
            .value(TAG_SUBJECT, self.subject.to_tlv())
            .bytes(TAG_PUBLIC_KEY, &self.public_key)
            .value(TAG_EXTENSIONS, extensions)
    }

    /// Signed portion: the TLV encoding of every field except the signature
    pub fn tbs(&self) -> Bytes {
        encode(&Element::anonymous(self.unsigned_fields().build()))
    }

    /// Parse TLV bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertificateError> {
        Ok(Self::decode(bytes)?)
    }

    /// TLV bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().to_vec()
    }

    /// Check the signature against an issuer public key
    pub fn verify_signature(
        &self,
        issuer_public_key: &[u8],
        role: &'static str,
    ) -> Result<(), CertificateError> {
        pairing_crypto::verify(issuer_public_key, &self.tbs(), &self.signature).map_err(|e| {
            match e {
                CryptoError::Signature => CertificateError::Signature(role),
                other => CertificateError::PublicKey(other),
            }
        })
    }
}

impl TlvObject for Certificate {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(TAG_SERIAL, "serialNumber", Schema::bytes_between(1, 20)),
            Field::required(TAG_ISSUER, "issuer", DistinguishedName::schema()),
            Field::required(TAG_NOT_BEFORE, "notBefore", Schema::uint32()),
            Field::required(TAG_NOT_AFTER, "notAfter", Schema::uint32()),
            Field::required(TAG_SUBJECT, "subject", DistinguishedName::schema()),
            Field::required(TAG_PUBLIC_KEY, "ecPublicKey", Schema::bytes(PUBLIC_KEY_LEN)),
            Field::required(
                TAG_EXTENSIONS,
                "extensions",
                Schema::object(vec![
                    Field::required(TAG_IS_CA, "isCa", Schema::Boolean),
                    Field::optional(TAG_PATH_LEN, "pathLen", Schema::uint8()),
                ]),
            ),
            Field::required(TAG_SIGNATURE, "signature", Schema::bytes(SIGNATURE_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        self.unsigned_fields()
            .bytes(TAG_SIGNATURE, &self.signature)
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        let extensions = view.structure(TAG_EXTENSIONS, "extensions")?;
        Ok(Self {
            serial_number: view.bytes(TAG_SERIAL, "serialNumber")?.to_vec(),
            issuer: DistinguishedName::from_view(view.structure(TAG_ISSUER, "issuer")?)?,
            not_before: view.uint_as(TAG_NOT_BEFORE, "notBefore")?,
            not_after: view.uint_as(TAG_NOT_AFTER, "notAfter")?,
            subject: DistinguishedName::from_view(view.structure(TAG_SUBJECT, "subject")?)?,
            public_key: view.byte_array(TAG_PUBLIC_KEY, "ecPublicKey")?,
            is_ca: extensions.bool(TAG_IS_CA, "isCa")?,
            path_len: extensions.opt_uint_as(TAG_PATH_LEN, "pathLen")?,
            signature: view.byte_array(TAG_SIGNATURE, "signature")?,
        })
    }
}

/// Identity proven by a verified certificate chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationalIdentity {
    /// Node id from the NOC subject
    pub node_id: u64,
    /// Fabric id from the NOC subject
    pub fabric_id: u64,
    /// Root CA id from the root subject
    pub root_node_id: u64,
    /// NOC public key
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// Verify root → (intermediate) → node operational certificate
pub fn verify_chain(
    root: &Certificate,
    icac: Option<&Certificate>,
    noc: &Certificate,
) -> Result<OperationalIdentity, CertificateError> {
    if !root.is_ca {
        return Err(CertificateError::CaFlag("root"));
    }
    if root.issuer != root.subject {
        return Err(CertificateError::NotSelfIssued);
    }
    let root_node_id = root
        .subject
        .rcac_id
        .ok_or(CertificateError::MissingIdentity("rcac id"))?;
    root.verify_signature(&root.public_key, "root")?;

    let (signer_key, signer_subject) = match icac {
        Some(icac) => {
            if root.path_len == Some(0) {
                return Err(CertificateError::PathLength);
            }
            if !icac.is_ca {
                return Err(CertificateError::CaFlag("intermediate"));
            }
            if icac.issuer != root.subject {
                return Err(CertificateError::IssuerMismatch("intermediate"));
            }
            icac.subject
                .icac_id
                .ok_or(CertificateError::MissingIdentity("icac id"))?;
            icac.verify_signature(&root.public_key, "intermediate")?;
            (&icac.public_key, &icac.subject)
        }
        None => (&root.public_key, &root.subject),
    };

    if noc.is_ca {
        return Err(CertificateError::CaFlag("node operational"));
    }
    if &noc.issuer != signer_subject {
        return Err(CertificateError::IssuerMismatch("node operational"));
    }
    let node_id = noc
        .subject
        .node_id
        .ok_or(CertificateError::MissingIdentity("node id"))?;
    let fabric_id = noc
        .subject
        .fabric_id
        .ok_or(CertificateError::MissingIdentity("fabric id"))?;
    for ca in std::iter::once(root).chain(icac) {
        if ca.subject.fabric_id.is_some_and(|f| f != fabric_id) {
            return Err(CertificateError::FabricMismatch);
        }
    }
    noc.verify_signature(signer_key, "node operational")?;

    Ok(OperationalIdentity {
        node_id,
        fabric_id,
        root_node_id,
        public_key: noc.public_key,
    })
}

/// A root or intermediate CA able to issue certificates
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    key: KeyPair,
    certificate: Certificate,
}

impl CertificateAuthority {
    /// Generate a self-signed root CA
    pub fn new_root(rcac_id: u64, fabric_id: Option<u64>) -> Self {
        let key = KeyPair::generate();
        let subject = DistinguishedName {
            rcac_id: Some(rcac_id),
            fabric_id,
            ..Default::default()
        };
        let mut certificate = Certificate {
            serial_number: random_bytes::<8>().to_vec(),
            issuer: subject.clone(),
            not_before: 0,
            not_after: 0,
            subject,
            public_key: *key.public_key(),
            is_ca: true,
            path_len: Some(1),
            signature: [0u8; SIGNATURE_LEN],
        };
        certificate.signature = key.sign(&certificate.tbs());
        debug!("Generated root CA {:016X}", rcac_id);
        Self { key, certificate }
    }

    /// Restore from a stored key and certificate
    pub fn from_parts(key: KeyPair, certificate: Certificate) -> Self {
        Self { key, certificate }
    }

    /// This CA's certificate
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// This CA's signing key
    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// Create an intermediate CA signed by this CA
    pub fn new_intermediate(&self, icac_id: u64) -> Result<Self, CertificateError> {
        let key = KeyPair::generate();
        let subject = DistinguishedName {
            icac_id: Some(icac_id),
            fabric_id: self.certificate.subject.fabric_id,
            ..Default::default()
        };
        let certificate = self.issue(subject, key.public_key(), true, Some(0))?;
        Ok(Self { key, certificate })
    }

    /// Issue a node operational certificate for `public_key`
    pub fn issue_node(
        &self,
        public_key: &[u8],
        node_id: u64,
        fabric_id: u64,
    ) -> Result<Certificate, CertificateError> {
        let subject = DistinguishedName {
            node_id: Some(node_id),
            fabric_id: Some(fabric_id),
            ..Default::default()
        };
        self.issue(subject, public_key, false, None)
    }

    fn issue(
        &self,
        subject: DistinguishedName,
        public_key: &[u8],
        is_ca: bool,
        path_len: Option<u8>,
    ) -> Result<Certificate, CertificateError> {
        parse_public_key(public_key).map_err(CertificateError::PublicKey)?;
        let mut key_bytes = [0u8; PUBLIC_KEY_LEN];
        key_bytes.copy_from_slice(public_key);

        let mut certificate = Certificate {
            serial_number: random_bytes::<8>().to_vec(),
            issuer: self.certificate.subject.clone(),
            not_before: 0,
            not_after: 0,
            subject,
            public_key: key_bytes,
            is_ca,
            path_len,
            signature: [0u8; SIGNATURE_LEN],
        };
        certificate.signature = self.key.sign(&certificate.tbs());
        Ok(certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FABRIC: u64 = 0x2906_C908_D115_D362;

    #[test]
    fn test_certificate_tlv_roundtrip() {
        let root = CertificateAuthority::new_root(1, Some(FABRIC));
        let bytes = root.certificate().to_bytes();
        assert_eq!(&Certificate::from_bytes(&bytes).unwrap(), root.certificate());
    }

    #[test]
    fn test_chain_without_intermediate() {
        let root = CertificateAuthority::new_root(1, None);
        let node_key = KeyPair::generate();
        let noc = root.issue_node(node_key.public_key(), 0x1122, FABRIC).unwrap();

        let identity = verify_chain(root.certificate(), None, &noc).unwrap();
        assert_eq!(identity.node_id, 0x1122);
        assert_eq!(identity.fabric_id, FABRIC);
        assert_eq!(identity.root_node_id, 1);
    }

    #[test]
    fn test_chain_with_intermediate() {
        let root = CertificateAuthority::new_root(1, Some(FABRIC));
        let icac = root.new_intermediate(2).unwrap();
        let noc = icac
            .issue_node(KeyPair::generate().public_key(), 7, FABRIC)
            .unwrap();

        verify_chain(root.certificate(), Some(icac.certificate()), &noc).unwrap();
        assert_eq!(
            verify_chain(root.certificate(), None, &noc).unwrap_err(),
            CertificateError::IssuerMismatch("node operational")
        );
    }

    #[test]
    fn test_tampered_noc_rejected() {
        let root = CertificateAuthority::new_root(1, None);
        let mut noc = root
            .issue_node(KeyPair::generate().public_key(), 7, FABRIC)
            .unwrap();
        noc.subject.node_id = Some(8);
        assert_eq!(
            verify_chain(root.certificate(), None, &noc).unwrap_err(),
            CertificateError::Signature("node operational")
        );
    }

    #[test]
    fn test_foreign_root_rejected() {
        let root = CertificateAuthority::new_root(1, None);
        let other = CertificateAuthority::new_root(1, None);
        let noc = other
            .issue_node(KeyPair::generate().public_key(), 7, FABRIC)
            .unwrap();
        assert_eq!(
            verify_chain(root.certificate(), None, &noc).unwrap_err(),
            CertificateError::Signature("node operational")
        );
    }

    #[test]
    fn test_fabric_mismatch_rejected() {
        let root = CertificateAuthority::new_root(1, Some(FABRIC));
        let noc = root
            .issue_node(KeyPair::generate().public_key(), 7, FABRIC + 1)
            .unwrap();
        assert_eq!(
            verify_chain(root.certificate(), None, &noc).unwrap_err(),
            CertificateError::FabricMismatch
        );
    }

    #[test]
    fn test_ca_as_leaf_rejected() {
        let root = CertificateAuthority::new_root(1, Some(FABRIC));
        let icac = root.new_intermediate(2).unwrap();
        assert_eq!(
            verify_chain(root.certificate(), None, icac.certificate()).unwrap_err(),
            CertificateError::CaFlag("node operational")
        );
    }

    #[test]
    fn test_malformed_bytes_rejected() {
        assert!(matches!(
            Certificate::from_bytes(&[0x15, 0x18]),
            Err(CertificateError::Encoding(_))
        ));
    }
}
