//! Secure channel message opcodes, TLV payloads and status reports.
//!
//! Context tags below are part of the wire contract.

use crate::params::SessionParameters;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pairing_crypto::spake2p::{PBKDF_MAX_ITERATIONS, PBKDF_MIN_ITERATIONS};
use pairing_crypto::{AEAD_MIC_LEN, HASH_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use pairing_tlv::{Field, Schema, StructBuilder, StructView, TlvObject, ValidationError, Value};
use std::fmt;

/// Handshake random length
pub const RANDOM_LEN: usize = 32;
/// Resumption id length
pub const RESUMPTION_ID_LEN: usize = 16;
/// Certificates larger than this are rejected
pub const MAX_CERT_LEN: usize = 400;
/// Minimum PBKDF salt length
pub const MIN_SALT_LEN: usize = 16;
/// Maximum PBKDF salt length
pub const MAX_SALT_LEN: usize = 32;

/// Secure channel opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// PASE step 1
    PbkdfParamRequest = 0x20,
    /// PASE step 2
    PbkdfParamResponse = 0x21,
    /// SPAKE2+ prover share
    Pake1 = 0x22,
    /// SPAKE2+ verifier share and confirmation
    Pake2 = 0x23,
    /// SPAKE2+ prover confirmation
    Pake3 = 0x24,
    /// CASE step 1
    Sigma1 = 0x30,
    /// CASE step 2
    Sigma2 = 0x31,
    /// CASE step 3
    Sigma3 = 0x32,
    /// CASE resumption answer
    Sigma2Resume = 0x33,
    /// Outcome of a handshake
    StatusReport = 0x40,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::HandshakeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x20 => Ok(MessageType::PbkdfParamRequest),
            0x21 => Ok(MessageType::PbkdfParamResponse),
            0x22 => Ok(MessageType::Pake1),
            0x23 => Ok(MessageType::Pake2),
            0x24 => Ok(MessageType::Pake3),
            0x30 => Ok(MessageType::Sigma1),
            0x31 => Ok(MessageType::Sigma2),
            0x32 => Ok(MessageType::Sigma3),
            0x33 => Ok(MessageType::Sigma2Resume),
            0x40 => Ok(MessageType::StatusReport),
            _ => Err(crate::HandshakeError::UnknownMessageType(value)),
        }
    }
}

fn random_schema() -> Schema {
    Schema::bytes(RANDOM_LEN)
}

fn cert_schema() -> Schema {
    Schema::bytes_between(1, MAX_CERT_LEN)
}

fn params_field(tag: u8) -> Field {
    Field::optional(tag, "sessionParams", SessionParameters::schema())
}

/// PBKDF parameters the responder dictates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbkdfParameters {
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// PBKDF2 salt
    pub salt: Vec<u8>,
}

impl PbkdfParameters {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(
                1,
                "iterations",
                Schema::UInt {
                    min: PBKDF_MIN_ITERATIONS as u64,
                    max: PBKDF_MAX_ITERATIONS as u64,
                },
            ),
            Field::required(2, "salt", Schema::bytes_between(MIN_SALT_LEN, MAX_SALT_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .uint(1, self.iterations as u64)
            .bytes(2, &self.salt)
            .build()
    }

    fn from_view(view: StructView<'_>) -> Result<Self, ValidationError> {
        Ok(Self {
            iterations: view.uint_as(1, "iterations")?,
            salt: view.bytes(2, "salt")?.to_vec(),
        })
    }

    /// Whether iterations and salt length are within protocol bounds
    pub fn is_valid(&self) -> bool {
        (PBKDF_MIN_ITERATIONS..=PBKDF_MAX_ITERATIONS).contains(&self.iterations)
            && (MIN_SALT_LEN..=MAX_SALT_LEN).contains(&self.salt.len())
    }
}

/// PASE step 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbkdfParamRequest {
    /// Initiator random
    pub initiator_random: [u8; RANDOM_LEN],
    /// Initiator's local session id
    pub initiator_session_id: u16,
    /// Passcode id, 0 for the default passcode
    pub passcode_id: u16,
    /// Initiator already knows the PBKDF parameters
    pub has_pbkdf_parameters: bool,
    /// Initiator session parameters
    pub session_params: Option<SessionParameters>,
}

impl TlvObject for PbkdfParamRequest {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "initiatorRandom", random_schema()),
            Field::required(2, "initiatorSessionId", Schema::uint16()),
            Field::required(3, "passcodeId", Schema::uint16()),
            Field::required(4, "hasPbkdfParameters", Schema::Boolean),
            params_field(5),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.initiator_random)
            .uint(2, self.initiator_session_id as u64)
            .uint(3, self.passcode_id as u64)
            .bool(4, self.has_pbkdf_parameters)
            .opt_value(5, self.session_params.map(|p| p.to_tlv()))
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            initiator_random: view.byte_array(1, "initiatorRandom")?,
            initiator_session_id: view.uint_as(2, "initiatorSessionId")?,
            passcode_id: view.uint_as(3, "passcodeId")?,
            has_pbkdf_parameters: view.bool(4, "hasPbkdfParameters")?,
            session_params: SessionParameters::from_optional(view.get(5))?,
        })
    }
}

/// PASE step 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbkdfParamResponse {
    /// Echo of the initiator random
    pub initiator_random: [u8; RANDOM_LEN],
    /// Responder random
    pub responder_random: [u8; RANDOM_LEN],
    /// Responder's local session id
    pub responder_session_id: u16,
    /// Present unless the initiator said it already has them
    pub pbkdf_parameters: Option<PbkdfParameters>,
    /// Responder session parameters
    pub session_params: Option<SessionParameters>,
}

impl TlvObject for PbkdfParamResponse {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "initiatorRandom", random_schema()),
            Field::required(2, "responderRandom", random_schema()),
            Field::required(3, "responderSessionId", Schema::uint16()),
            Field::optional(4, "pbkdfParameters", PbkdfParameters::schema()),
            params_field(5),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.initiator_random)
            .bytes(2, &self.responder_random)
            .uint(3, self.responder_session_id as u64)
            .opt_value(4, self.pbkdf_parameters.as_ref().map(PbkdfParameters::to_tlv))
            .opt_value(5, self.session_params.map(|p| p.to_tlv()))
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            initiator_random: view.byte_array(1, "initiatorRandom")?,
            responder_random: view.byte_array(2, "responderRandom")?,
            responder_session_id: view.uint_as(3, "responderSessionId")?,
            pbkdf_parameters: view
                .opt_structure(4, "pbkdfParameters")?
                .map(PbkdfParameters::from_view)
                .transpose()?,
            session_params: SessionParameters::from_optional(view.get(5))?,
        })
    }
}

/// SPAKE2+ prover share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pake1 {
    /// X
    pub x: [u8; PUBLIC_KEY_LEN],
}

impl TlvObject for Pake1 {
    fn schema() -> Schema {
        Schema::object(vec![Field::required(1, "x", Schema::bytes(PUBLIC_KEY_LEN))])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new().bytes(1, &self.x).build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        Ok(Self {
            x: StructView::new(value)?.byte_array(1, "x")?,
        })
    }
}

/// SPAKE2+ verifier share and confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pake2 {
    /// Y
    pub y: [u8; PUBLIC_KEY_LEN],
    /// cB
    pub verifier: [u8; HASH_LEN],
}

impl TlvObject for Pake2 {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "y", Schema::bytes(PUBLIC_KEY_LEN)),
            Field::required(2, "verifier", Schema::bytes(HASH_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.y)
            .bytes(2, &self.verifier)
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            y: view.byte_array(1, "y")?,
            verifier: view.byte_array(2, "verifier")?,
        })
    }
}

/// SPAKE2+ prover confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pake3 {
    /// cA
    pub verifier: [u8; HASH_LEN],
}

impl TlvObject for Pake3 {
    fn schema() -> Schema {
        Schema::object(vec![Field::required(1, "verifier", Schema::bytes(HASH_LEN))])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new().bytes(1, &self.verifier).build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        Ok(Self {
            verifier: StructView::new(value)?.byte_array(1, "verifier")?,
        })
    }
}

/// CASE step 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sigma1 {
    /// Initiator random
    pub initiator_random: [u8; RANDOM_LEN],
    /// Initiator's local session id
    pub initiator_session_id: u16,
    /// HMAC naming the target fabric and node
    pub destination_id: [u8; HASH_LEN],
    /// Initiator ephemeral public key
    pub initiator_eph_public_key: [u8; PUBLIC_KEY_LEN],
    /// Initiator session parameters
    pub session_params: Option<SessionParameters>,
    /// Resumption id from an earlier session
    pub resumption_id: Option<[u8; RESUMPTION_ID_LEN]>,
    /// Proof of the earlier shared secret
    pub initiator_resume_mic: Option<[u8; AEAD_MIC_LEN]>,
}

impl TlvObject for Sigma1 {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "initiatorRandom", random_schema()),
            Field::required(2, "initiatorSessionId", Schema::uint16()),
            Field::required(3, "destinationId", Schema::bytes(HASH_LEN)),
            Field::required(4, "initiatorEphPublicKey", Schema::bytes(PUBLIC_KEY_LEN)),
            params_field(5),
            Field::optional(6, "resumptionId", Schema::bytes(RESUMPTION_ID_LEN)),
            Field::optional(7, "initiatorResumeMic", Schema::bytes(AEAD_MIC_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.initiator_random)
            .uint(2, self.initiator_session_id as u64)
            .bytes(3, &self.destination_id)
            .bytes(4, &self.initiator_eph_public_key)
            .opt_value(5, self.session_params.map(|p| p.to_tlv()))
            .opt_bytes(6, self.resumption_id.as_ref().map(|b| &b[..]))
            .opt_bytes(7, self.initiator_resume_mic.as_ref().map(|b| &b[..]))
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            initiator_random: view.byte_array(1, "initiatorRandom")?,
            initiator_session_id: view.uint_as(2, "initiatorSessionId")?,
            destination_id: view.byte_array(3, "destinationId")?,
            initiator_eph_public_key: view.byte_array(4, "initiatorEphPublicKey")?,
            session_params: SessionParameters::from_optional(view.get(5))?,
            resumption_id: opt_array(&view, 6, "resumptionId")?,
            initiator_resume_mic: opt_array(&view, 7, "initiatorResumeMic")?,
        })
    }
}

/// CASE step 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sigma2 {
    /// Responder random
    pub responder_random: [u8; RANDOM_LEN],
    /// Responder's local session id
    pub responder_session_id: u16,
    /// Responder ephemeral public key
    pub responder_eph_public_key: [u8; PUBLIC_KEY_LEN],
    /// AEAD-sealed [`EncryptedDataSigma2`]
    pub encrypted: Vec<u8>,
    /// Responder session parameters
    pub session_params: Option<SessionParameters>,
}

impl TlvObject for Sigma2 {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "responderRandom", random_schema()),
            Field::required(2, "responderSessionId", Schema::uint16()),
            Field::required(3, "responderEphPublicKey", Schema::bytes(PUBLIC_KEY_LEN)),
            Field::required(4, "encrypted2", Schema::bytes_between(AEAD_MIC_LEN, 1024)),
            params_field(5),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.responder_random)
            .uint(2, self.responder_session_id as u64)
            .bytes(3, &self.responder_eph_public_key)
            .bytes(4, &self.encrypted)
            .opt_value(5, self.session_params.map(|p| p.to_tlv()))
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            responder_random: view.byte_array(1, "responderRandom")?,
            responder_session_id: view.uint_as(2, "responderSessionId")?,
            responder_eph_public_key: view.byte_array(3, "responderEphPublicKey")?,
            encrypted: view.bytes(4, "encrypted2")?.to_vec(),
            session_params: SessionParameters::from_optional(view.get(5))?,
        })
    }
}

/// CASE resumption answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sigma2Resume {
    /// Fresh resumption id for the next resumption
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    /// Proof of the shared secret
    pub resume_mic: [u8; AEAD_MIC_LEN],
    /// Responder's local session id
    pub responder_session_id: u16,
}

impl TlvObject for Sigma2Resume {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "resumptionId", Schema::bytes(RESUMPTION_ID_LEN)),
            Field::required(2, "sigma2ResumeMic", Schema::bytes(AEAD_MIC_LEN)),
            Field::required(3, "responderSessionId", Schema::uint16()),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.resumption_id)
            .bytes(2, &self.resume_mic)
            .uint(3, self.responder_session_id as u64)
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            resumption_id: view.byte_array(1, "resumptionId")?,
            resume_mic: view.byte_array(2, "sigma2ResumeMic")?,
            responder_session_id: view.uint_as(3, "responderSessionId")?,
        })
    }
}

/// CASE step 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sigma3 {
    /// AEAD-sealed [`EncryptedDataSigma3`]
    pub encrypted: Vec<u8>,
}

impl TlvObject for Sigma3 {
    fn schema() -> Schema {
        Schema::object(vec![Field::required(
            1,
            "encrypted3",
            Schema::bytes_between(AEAD_MIC_LEN, 1024),
        )])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new().bytes(1, &self.encrypted).build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        Ok(Self {
            encrypted: StructView::new(value)?.bytes(1, "encrypted3")?.to_vec(),
        })
    }
}

/// Data each CASE party signs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedData {
    /// Signer NOC
    pub node_op_cert: Vec<u8>,
    /// Signer ICAC
    pub intermediate_ca_cert: Option<Vec<u8>>,
    /// Signer ephemeral key
    pub eph_public_key: [u8; PUBLIC_KEY_LEN],
    /// Other party's ephemeral key
    pub peer_eph_public_key: [u8; PUBLIC_KEY_LEN],
}

impl TlvObject for SignedData {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "nodeOpCert", cert_schema()),
            Field::optional(2, "intermediateCACert", cert_schema()),
            Field::required(3, "ecdhPublicKey", Schema::bytes(PUBLIC_KEY_LEN)),
            Field::required(4, "peerEcdhPublicKey", Schema::bytes(PUBLIC_KEY_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.node_op_cert)
            .opt_bytes(2, self.intermediate_ca_cert.as_deref())
            .bytes(3, &self.eph_public_key)
            .bytes(4, &self.peer_eph_public_key)
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            node_op_cert: view.bytes(1, "nodeOpCert")?.to_vec(),
            intermediate_ca_cert: view.opt_bytes(2, "intermediateCACert")?.map(<[u8]>::to_vec),
            eph_public_key: view.byte_array(3, "ecdhPublicKey")?,
            peer_eph_public_key: view.byte_array(4, "peerEcdhPublicKey")?,
        })
    }
}

/// Encrypted part of Sigma2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDataSigma2 {
    /// Responder NOC
    pub node_op_cert: Vec<u8>,
    /// Responder ICAC
    pub intermediate_ca_cert: Option<Vec<u8>>,
    /// Signature over [`SignedData`]
    pub signature: [u8; SIGNATURE_LEN],
    /// Resumption id for this session
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
}

impl TlvObject for EncryptedDataSigma2 {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "nodeOpCert", cert_schema()),
            Field::optional(2, "intermediateCACert", cert_schema()),
            Field::required(3, "signature", Schema::bytes(SIGNATURE_LEN)),
            Field::required(4, "resumptionId", Schema::bytes(RESUMPTION_ID_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.node_op_cert)
            .opt_bytes(2, self.intermediate_ca_cert.as_deref())
            .bytes(3, &self.signature)
            .bytes(4, &self.resumption_id)
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            node_op_cert: view.bytes(1, "nodeOpCert")?.to_vec(),
            intermediate_ca_cert: view.opt_bytes(2, "intermediateCACert")?.map(<[u8]>::to_vec),
            signature: view.byte_array(3, "signature")?,
            resumption_id: view.byte_array(4, "resumptionId")?,
        })
    }
}

/// Encrypted part of Sigma3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedDataSigma3 {
    /// Initiator NOC
    pub node_op_cert: Vec<u8>,
    /// Initiator ICAC
    pub intermediate_ca_cert: Option<Vec<u8>>,
    /// Signature over [`SignedData`]
    pub signature: [u8; SIGNATURE_LEN],
}

impl TlvObject for EncryptedDataSigma3 {
    fn schema() -> Schema {
        Schema::object(vec![
            Field::required(1, "nodeOpCert", cert_schema()),
            Field::optional(2, "intermediateCACert", cert_schema()),
            Field::required(3, "signature", Schema::bytes(SIGNATURE_LEN)),
        ])
    }

    fn to_tlv(&self) -> Value {
        StructBuilder::new()
            .bytes(1, &self.node_op_cert)
            .opt_bytes(2, self.intermediate_ca_cert.as_deref())
            .bytes(3, &self.signature)
            .build()
    }

    fn from_tlv(value: &Value) -> Result<Self, ValidationError> {
        let view = StructView::new(value)?;
        Ok(Self {
            node_op_cert: view.bytes(1, "nodeOpCert")?.to_vec(),
            intermediate_ca_cert: view.opt_bytes(2, "intermediateCACert")?.map(<[u8]>::to_vec),
            signature: view.byte_array(3, "signature")?,
        })
    }
}

fn opt_array<const N: usize>(
    view: &StructView<'_>,
    tag: u8,
    name: &'static str,
) -> Result<Option<[u8; N]>, ValidationError> {
    match view.get(tag) {
        None => Ok(None),
        Some(_) => view.byte_array(tag, name).map(Some),
    }
}

/// Secure channel protocol id
pub const SECURE_CHANNEL_PROTOCOL_ID: u32 = 0x0000;

/// General status codes used by this crate
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralCode {
    /// Operation succeeded
    Success = 0,
    /// Operation failed
    Failure = 1,
    /// Peer is busy
    Busy = 8,
}

impl TryFrom<u16> for GeneralCode {
    type Error = crate::HandshakeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GeneralCode::Success),
            1 => Ok(GeneralCode::Failure),
            8 => Ok(GeneralCode::Busy),
            _ => Err(crate::HandshakeError::Protocol("unknown general status code")),
        }
    }
}

/// Secure channel protocol status codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCode {
    /// Session established
    SessionEstablishmentSuccess = 0,
    /// No fabric matches the destination id
    NoSharedTrustRoots = 1,
    /// Message rejected
    InvalidParameter = 2,
    /// Peer closes the session
    CloseSession = 3,
    /// Peer is busy
    Busy = 4,
}

impl TryFrom<u16> for ProtocolCode {
    type Error = crate::HandshakeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolCode::SessionEstablishmentSuccess),
            1 => Ok(ProtocolCode::NoSharedTrustRoots),
            2 => Ok(ProtocolCode::InvalidParameter),
            3 => Ok(ProtocolCode::CloseSession),
            4 => Ok(ProtocolCode::Busy),
            _ => Err(crate::HandshakeError::Protocol("unknown secure channel status code")),
        }
    }
}

/// Status report: `generalCode (u16 LE) || protocolId (u32 LE) || protocolCode (u16 LE)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// General code
    pub general_code: GeneralCode,
    /// Protocol id
    pub protocol_id: u32,
    /// Protocol-specific code
    pub protocol_code: ProtocolCode,
}

impl StatusReport {
    /// Encoded length
    pub const LEN: usize = 8;

    /// Handshake completed
    pub fn success() -> Self {
        Self {
            general_code: GeneralCode::Success,
            protocol_id: SECURE_CHANNEL_PROTOCOL_ID,
            protocol_code: ProtocolCode::SessionEstablishmentSuccess,
        }
    }

    /// Handshake failed with `code`
    pub fn failure(code: ProtocolCode) -> Self {
        Self {
            general_code: GeneralCode::Failure,
            protocol_id: SECURE_CHANNEL_PROTOCOL_ID,
            protocol_code: code,
        }
    }

    /// Responder cannot take the handshake now
    pub fn busy() -> Self {
        Self {
            general_code: GeneralCode::Busy,
            protocol_id: SECURE_CHANNEL_PROTOCOL_ID,
            protocol_code: ProtocolCode::Busy,
        }
    }

    /// Whether this reports success
    pub fn is_success(&self) -> bool {
        self.general_code == GeneralCode::Success
            && self.protocol_code == ProtocolCode::SessionEstablishmentSuccess
    }

    /// Wire form
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16_le(self.general_code as u16);
        buf.put_u32_le(self.protocol_id);
        buf.put_u16_le(self.protocol_code as u16);
        buf.freeze()
    }

    /// Parse the wire form; trailing protocol data is ignored
    pub fn decode(mut buf: &[u8]) -> Result<Self, crate::HandshakeError> {
        if buf.len() < Self::LEN {
            return Err(crate::HandshakeError::Protocol("status report too short"));
        }
        let general_code = GeneralCode::try_from(buf.get_u16_le())?;
        let protocol_id = buf.get_u32_le();
        let protocol_code = ProtocolCode::try_from(buf.get_u16_le())?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status {:?}/{:?} (protocol 0x{:04x})",
            self.general_code, self.protocol_code, self.protocol_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes() {
        assert_eq!(MessageType::PbkdfParamRequest as u8, 0x20);
        assert_eq!(MessageType::Sigma2Resume as u8, 0x33);
        assert_eq!(MessageType::try_from(0x40).unwrap(), MessageType::StatusReport);
        assert!(MessageType::try_from(0x25).is_err());
    }

    #[test]
    fn test_status_report_wire_format() {
        let report = StatusReport::failure(ProtocolCode::NoSharedTrustRoots);
        assert_eq!(&report.encode()[..], &[1, 0, 0, 0, 0, 0, 1, 0]);
        assert_eq!(StatusReport::decode(&report.encode()).unwrap(), report);
        assert!(StatusReport::success().is_success());
        assert!(StatusReport::decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_response_params_optional() {
        let response = PbkdfParamResponse {
            initiator_random: [1; 32],
            responder_random: [2; 32],
            responder_session_id: 7,
            pbkdf_parameters: None,
            session_params: None,
        };
        let decoded = PbkdfParamResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_pbkdf_iteration_bounds_enforced() {
        let response = PbkdfParamResponse {
            initiator_random: [1; 32],
            responder_random: [2; 32],
            responder_session_id: 7,
            pbkdf_parameters: Some(PbkdfParameters {
                iterations: 10,
                salt: vec![0; 16],
            }),
            session_params: None,
        };
        let err = PbkdfParamResponse::decode(&response.encode()).unwrap_err();
        assert!(matches!(err.root_cause(), ValidationError::OutOfBounds { .. }));
        assert!(err.to_string().starts_with("pbkdfParameters: iterations:"));
    }

    #[test]
    fn test_sigma1_resumption_fields() {
        let sigma1 = Sigma1 {
            initiator_random: [3; 32],
            initiator_session_id: 9,
            destination_id: [4; 32],
            initiator_eph_public_key: [5; 65],
            session_params: Some(SessionParameters {
                idle_interval_ms: Some(5000),
                ..Default::default()
            }),
            resumption_id: Some([6; 16]),
            initiator_resume_mic: Some([7; 16]),
        };
        let decoded = Sigma1::decode(&sigma1.encode()).unwrap();
        assert_eq!(decoded, sigma1);

        let plain = Sigma1 {
            resumption_id: None,
            initiator_resume_mic: None,
            ..sigma1
        };
        assert!(Sigma1::decode(&plain.encode()).unwrap().resumption_id.is_none());
    }

    #[test]
    fn test_wrong_length_field_rejected() {
        let value = StructBuilder::new().bytes(1, &[0u8; 10]).build();
        let bytes = pairing_tlv::encode(&pairing_tlv::Element::anonymous(value));
        let err = Pake1::decode(&bytes).unwrap_err();
        assert!(matches!(err.root_cause(), ValidationError::Length { len: 10, .. }));
    }
}
