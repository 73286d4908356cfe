//! Certificate-authenticated session establishment (SIGMA with resumption).
//!
//! ```text
//! Full handshake                              Resumption
//!   I -> R  Sigma1                              I -> R  Sigma1 {resumptionId, resumeMic}
//!   R -> I  Sigma2 {TBE2 under S2K}             R -> I  Sigma2Resume {newId, mic}
//!   I -> R  Sigma3 {TBE3 under S3K}             I -> R  StatusReport (success)
//!   R -> I  StatusReport (success)
//! ```
//!
//! The responder resolves the destination id against every local fabric.
//! A known resumption id with a bad MIC is fatal; an unknown id falls back to
//! the full handshake. Nothing here mutates the fabric table.

use crate::messages::{
    EncryptedDataSigma2, EncryptedDataSigma3, Sigma1, Sigma2, Sigma2Resume, Sigma3, SignedData,
    StatusReport, RANDOM_LEN, RESUMPTION_ID_LEN,
};
use crate::params::SessionParameters;
use crate::resumption::{ResumptionRecord, ResumptionStore};
use crate::secure::SessionKeys;
use crate::{HandshakeError, Result};
use bytes::Bytes;
use pairing_crypto::{
    aead, hkdf_sha256, random_bytes, sha256, verify, CryptoError, KeyPair, AEAD_MIC_LEN,
    AEAD_NONCE_LEN, GROUP_SIZE, PUBLIC_KEY_LEN, SYMMETRIC_KEY_LEN,
};
use pairing_fabric::{Fabric, FabricIndex, NodeId};
use pairing_tlv::TlvObject;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const SIGMA2_INFO: &[u8] = b"Sigma2";
const SIGMA3_INFO: &[u8] = b"Sigma3";
const SIGMA1_RESUME_INFO: &[u8] = b"Sigma1_Resume";
const SIGMA2_RESUME_INFO: &[u8] = b"Sigma2_Resume";
const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";
const RESUMPTION_KEYS_INFO: &[u8] = b"SessionResumptionKeys";

const SIGMA2_NONCE: &[u8; AEAD_NONCE_LEN] = b"NCASE_Sigma2N";
const SIGMA3_NONCE: &[u8; AEAD_NONCE_LEN] = b"NCASE_Sigma3N";
const SIGMA1_RESUME_NONCE: &[u8; AEAD_NONCE_LEN] = b"NCASE_SigmaS1";
const SIGMA2_RESUME_NONCE: &[u8; AEAD_NONCE_LEN] = b"NCASE_SigmaS2";

/// CASE handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    /// Nothing sent or received
    Idle,
    /// Initiator sent Sigma1
    Sigma1Sent,
    /// Responder received Sigma1
    Sigma1Received,
    /// Responder sent Sigma2
    Sigma2Sent,
    /// Initiator received Sigma2
    Sigma2Received,
    /// Initiator sent Sigma3
    Sigma3Sent,
    /// Responder received Sigma3
    Sigma3Received,
    /// Responder sent Sigma2Resume
    Sigma2ResumeSent,
    /// Initiator received Sigma2Resume
    Sigma2ResumeReceived,
    /// Keys derived, session usable
    Established,
    /// Terminal failure
    Failed,
}

fn expect_state(actual: CaseState, expected: CaseState) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    Err(HandshakeError::InvalidState(match actual {
        CaseState::Idle => "idle",
        CaseState::Established => "already established",
        CaseState::Failed => "failed",
        _ => "in the wrong state",
    }))
}

/// Result of a successful CASE handshake
#[derive(Debug)]
pub struct CaseEstablished {
    /// Derived session keys
    pub keys: SessionKeys,
    /// Our session id
    pub local_session_id: u16,
    /// Peer's session id
    pub peer_session_id: u16,
    /// Fabric the session runs on
    pub fabric_index: FabricIndex,
    /// Our node id
    pub local_node_id: NodeId,
    /// Authenticated peer node id
    pub peer_node_id: NodeId,
    /// Peer timing hints
    pub peer_params: SessionParameters,
    /// Record to cache for the next resumption
    pub resumption: ResumptionRecord,
    /// Established through resumption
    pub resumed: bool,
}

fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; SYMMETRIC_KEY_LEN]>> {
    let okm = hkdf_sha256(ikm, salt, info, SYMMETRIC_KEY_LEN)?;
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    key.copy_from_slice(&okm);
    Ok(key)
}

fn sigma2_key(
    shared: &[u8],
    ipk: &[u8],
    responder_random: &[u8],
    responder_eph: &[u8],
    sigma1: &[u8],
) -> Result<Zeroizing<[u8; SYMMETRIC_KEY_LEN]>> {
    let salt = [ipk, responder_random, responder_eph, &sha256(&[sigma1])].concat();
    derive_key(shared, &salt, SIGMA2_INFO)
}

fn sigma3_key(
    shared: &[u8],
    ipk: &[u8],
    sigma1: &[u8],
    sigma2: &[u8],
) -> Result<Zeroizing<[u8; SYMMETRIC_KEY_LEN]>> {
    let salt = [ipk, &sha256(&[sigma1, sigma2])].concat();
    derive_key(shared, &salt, SIGMA3_INFO)
}

fn full_session_keys(
    shared: &[u8],
    ipk: &[u8],
    sigma1: &[u8],
    sigma2: &[u8],
    sigma3: &[u8],
) -> Result<SessionKeys> {
    let salt = [ipk, &sha256(&[sigma1, sigma2, sigma3])].concat();
    SessionKeys::derive(shared, &salt, SESSION_KEYS_INFO)
}

fn resumption_session_keys(
    shared: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
) -> Result<SessionKeys> {
    let salt = [initiator_random, resumption_id].concat();
    SessionKeys::derive(shared, &salt, RESUMPTION_KEYS_INFO)
}

/// MIC proving knowledge of the previous shared secret
fn resume_mic(
    shared: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
    info: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN],
) -> Result<[u8; AEAD_MIC_LEN]> {
    let salt = [initiator_random, resumption_id].concat();
    let key = derive_key(shared, &salt, info)?;
    let tag = aead::encrypt(&key[..], nonce, &[], &[])?;
    tag.as_slice()
        .try_into()
        .map_err(|_| HandshakeError::Crypto(CryptoError::Encryption))
}

fn check_resume_mic(
    shared: &[u8],
    initiator_random: &[u8],
    resumption_id: &[u8],
    info: &[u8],
    nonce: &[u8; AEAD_NONCE_LEN],
    mic: &[u8],
) -> Result<()> {
    let salt = [initiator_random, resumption_id].concat();
    let key = derive_key(shared, &salt, info)?;
    aead::decrypt(&key[..], nonce, mic, &[]).map_err(|_| HandshakeError::ResumptionMic)?;
    Ok(())
}

fn own_certificates(fabric: &Fabric) -> (Vec<u8>, Option<Vec<u8>>) {
    (
        fabric.operational_certificate().to_bytes(),
        fabric.intermediate_certificate().map(|c| c.to_bytes()),
    )
}

fn shared_secret(key: &KeyPair, peer: &[u8]) -> Result<Zeroizing<[u8; GROUP_SIZE]>> {
    Ok(key.ecdh(peer)?)
}

/// Dialling side
pub struct CaseInitiator {
    state: CaseState,
    fabric: Fabric,
    peer_node_id: NodeId,
    local_session_id: u16,
    local_params: SessionParameters,
    random: [u8; RANDOM_LEN],
    eph: KeyPair,
    resumption: Option<ResumptionRecord>,
    sigma1: Option<Bytes>,
    sigma2: Option<Bytes>,
    sigma3: Option<Bytes>,
    shared: Option<Zeroizing<[u8; GROUP_SIZE]>>,
    responder_resumption_id: Option<[u8; RESUMPTION_ID_LEN]>,
    peer_session_id: u16,
    peer_params: SessionParameters,
}

impl CaseInitiator {
    /// Dial `peer_node_id` in `fabric`, offering resumption when a record is given
    pub fn new(
        fabric: Fabric,
        peer_node_id: NodeId,
        local_session_id: u16,
        local_params: SessionParameters,
        resumption: Option<ResumptionRecord>,
    ) -> Self {
        let resumption =
            resumption.filter(|r| r.fabric_index == fabric.index() && r.peer_node_id == peer_node_id);
        Self {
            state: CaseState::Idle,
            fabric,
            peer_node_id,
            local_session_id,
            local_params,
            random: random_bytes(),
            eph: KeyPair::generate(),
            resumption,
            sigma1: None,
            sigma2: None,
            sigma3: None,
            shared: None,
            responder_resumption_id: None,
            peer_session_id: 0,
            peer_params: SessionParameters::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> CaseState {
        self.state
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = CaseState::Failed;
            self.shared = None;
        }
        result
    }

    /// Mark the handshake failed
    pub fn fail(&mut self) {
        let _ = self.guard::<()>(Err(HandshakeError::InvalidState("failed")));
    }

    /// Build Sigma1
    pub fn start(&mut self) -> Result<Bytes> {
        let result = self.on_start();
        self.guard(result)
    }

    fn on_start(&mut self) -> Result<Bytes> {
        expect_state(self.state, CaseState::Idle)?;
        let destination_id = self.fabric.destination_id(&self.random, self.peer_node_id)?;

        let (resumption_id, initiator_resume_mic) = match &self.resumption {
            Some(record) => {
                let mic = resume_mic(
                    &record.shared_secret[..],
                    &self.random,
                    &record.resumption_id,
                    SIGMA1_RESUME_INFO,
                    SIGMA1_RESUME_NONCE,
                )?;
                (Some(record.resumption_id), Some(mic))
            }
            None => (None, None),
        };

        let sigma1 = Sigma1 {
            initiator_random: self.random,
            initiator_session_id: self.local_session_id,
            destination_id,
            initiator_eph_public_key: *self.eph.public_key(),
            session_params: Some(self.local_params),
            resumption_id,
            initiator_resume_mic,
        }
        .encode();
        self.sigma1 = Some(sigma1.clone());
        self.state = CaseState::Sigma1Sent;
        debug!(
            "CASE initiator {} sent Sigma1 to node {} (resumption: {})",
            self.local_session_id,
            self.peer_node_id,
            resumption_id.is_some()
        );
        Ok(sigma1)
    }

    /// Handle Sigma2, returning Sigma3
    pub fn handle_sigma2(&mut self, payload: &[u8]) -> Result<Bytes> {
        let result = self.on_sigma2(payload);
        self.guard(result)
    }

    fn on_sigma2(&mut self, payload: &[u8]) -> Result<Bytes> {
        expect_state(self.state, CaseState::Sigma1Sent)?;
        self.state = CaseState::Sigma2Received;
        let sigma2 = Sigma2::decode(payload)?;
        let sigma1 = self
            .sigma1
            .clone()
            .ok_or(HandshakeError::InvalidState("missing Sigma1"))?;
        let ipk = *self.fabric.identity_protection_key();

        let shared = shared_secret(&self.eph, &sigma2.responder_eph_public_key)?;
        let s2k = sigma2_key(
            &shared[..],
            &ipk,
            &sigma2.responder_random,
            &sigma2.responder_eph_public_key,
            &sigma1,
        )?;
        let tbe2 = aead::decrypt(&s2k[..], SIGMA2_NONCE, &sigma2.encrypted, &[])?;
        let tbe2 = EncryptedDataSigma2::decode(&tbe2)?;

        let identity = self
            .fabric
            .verify_peer(&tbe2.node_op_cert, tbe2.intermediate_ca_cert.as_deref())?;
        if identity.node_id != self.peer_node_id.0 {
            return Err(HandshakeError::PeerMismatch {
                expected: self.peer_node_id.0,
                actual: identity.node_id,
            });
        }
        let signed2 = SignedData {
            node_op_cert: tbe2.node_op_cert.clone(),
            intermediate_ca_cert: tbe2.intermediate_ca_cert.clone(),
            eph_public_key: sigma2.responder_eph_public_key,
            peer_eph_public_key: *self.eph.public_key(),
        }
        .encode();
        verify(&identity.public_key, &signed2, &tbe2.signature)
            .map_err(|_| HandshakeError::Signature)?;

        let (noc, icac) = own_certificates(&self.fabric);
        let signed3 = SignedData {
            node_op_cert: noc.clone(),
            intermediate_ca_cert: icac.clone(),
            eph_public_key: *self.eph.public_key(),
            peer_eph_public_key: sigma2.responder_eph_public_key,
        }
        .encode();
        let tbe3 = EncryptedDataSigma3 {
            node_op_cert: noc,
            intermediate_ca_cert: icac,
            signature: self.fabric.sign(&signed3),
        }
        .encode();
        let s3k = sigma3_key(&shared[..], &ipk, &sigma1, payload)?;
        let sigma3 = Sigma3 {
            encrypted: aead::encrypt(&s3k[..], SIGMA3_NONCE, &tbe3, &[])?,
        }
        .encode();

        self.sigma2 = Some(Bytes::copy_from_slice(payload));
        self.sigma3 = Some(sigma3.clone());
        self.shared = Some(shared);
        self.responder_resumption_id = Some(tbe2.resumption_id);
        self.peer_session_id = sigma2.responder_session_id;
        self.peer_params = sigma2.session_params.unwrap_or_default();
        self.state = CaseState::Sigma3Sent;
        debug!("CASE initiator {} sent Sigma3", self.local_session_id);
        Ok(sigma3)
    }

    /// Handle Sigma2Resume, returning the success status report and the session
    pub fn handle_sigma2_resume(&mut self, payload: &[u8]) -> Result<(Bytes, CaseEstablished)> {
        let result = self.on_sigma2_resume(payload);
        self.guard(result)
    }

    fn on_sigma2_resume(&mut self, payload: &[u8]) -> Result<(Bytes, CaseEstablished)> {
        expect_state(self.state, CaseState::Sigma1Sent)?;
        self.state = CaseState::Sigma2ResumeReceived;
        let resume = Sigma2Resume::decode(payload)?;
        let record = self
            .resumption
            .take()
            .ok_or(HandshakeError::Protocol("resumption was not offered"))?;

        check_resume_mic(
            &record.shared_secret[..],
            &self.random,
            &resume.resumption_id,
            SIGMA2_RESUME_INFO,
            SIGMA2_RESUME_NONCE,
            &resume.resume_mic,
        )?;
        let keys = resumption_session_keys(
            &record.shared_secret[..],
            &self.random,
            &resume.resumption_id,
        )?;

        self.state = CaseState::Established;
        info!(
            "CASE session {} resumed with node {} on fabric {}",
            self.local_session_id, self.peer_node_id, record.fabric_index
        );
        let established = CaseEstablished {
            keys,
            local_session_id: self.local_session_id,
            peer_session_id: resume.responder_session_id,
            fabric_index: self.fabric.index(),
            local_node_id: self.fabric.node_id(),
            peer_node_id: self.peer_node_id,
            peer_params: record.peer_params,
            resumption: ResumptionRecord {
                resumption_id: resume.resumption_id,
                ..record
            },
            resumed: true,
        };
        Ok((StatusReport::success().encode(), established))
    }

    /// Handle the responder's final status report after Sigma3
    pub fn handle_status(&mut self, payload: &[u8]) -> Result<CaseEstablished> {
        let result = self.on_status(payload);
        self.guard(result)
    }

    fn on_status(&mut self, payload: &[u8]) -> Result<CaseEstablished> {
        expect_state(self.state, CaseState::Sigma3Sent)?;
        let report = StatusReport::decode(payload)?;
        if !report.is_success() {
            return Err(HandshakeError::PeerStatus(report));
        }
        let missing = || HandshakeError::InvalidState("missing handshake state");
        let shared = self.shared.take().ok_or_else(missing)?;
        let sigma1 = self.sigma1.as_ref().ok_or_else(missing)?;
        let sigma2 = self.sigma2.as_ref().ok_or_else(missing)?;
        let sigma3 = self.sigma3.as_ref().ok_or_else(missing)?;
        let resumption_id = self.responder_resumption_id.ok_or_else(missing)?;
        let keys = full_session_keys(
            &shared[..],
            self.fabric.identity_protection_key(),
            sigma1,
            sigma2,
            sigma3,
        )?;

        self.state = CaseState::Established;
        info!(
            "CASE session {} established with node {} on fabric {}",
            self.local_session_id,
            self.peer_node_id,
            self.fabric.index()
        );
        Ok(CaseEstablished {
            keys,
            local_session_id: self.local_session_id,
            peer_session_id: self.peer_session_id,
            fabric_index: self.fabric.index(),
            local_node_id: self.fabric.node_id(),
            peer_node_id: self.peer_node_id,
            peer_params: self.peer_params,
            resumption: ResumptionRecord {
                resumption_id,
                shared_secret: shared,
                fabric_index: self.fabric.index(),
                peer_node_id: self.peer_node_id,
                peer_params: self.peer_params,
            },
            resumed: false,
        })
    }
}

/// What the responder sends after Sigma1
#[derive(Debug)]
pub enum Sigma1Reply {
    /// Full handshake continues with Sigma2
    Sigma2(Bytes),
    /// Resumption accepted
    Sigma2Resume(Bytes),
}

/// Listening side
pub struct CaseResponder {
    state: CaseState,
    local_session_id: u16,
    local_params: SessionParameters,
    random: [u8; RANDOM_LEN],
    eph: KeyPair,
    fabric: Option<Fabric>,
    initiator_random: [u8; RANDOM_LEN],
    initiator_eph: [u8; PUBLIC_KEY_LEN],
    sigma1: Option<Bytes>,
    sigma2: Option<Bytes>,
    shared: Option<Zeroizing<[u8; GROUP_SIZE]>>,
    resumption_id: [u8; RESUMPTION_ID_LEN],
    peer_session_id: u16,
    peer_params: SessionParameters,
    resumed: Option<CaseEstablished>,
}

impl CaseResponder {
    /// New responder
    pub fn new(local_session_id: u16, local_params: SessionParameters) -> Self {
        Self {
            state: CaseState::Idle,
            local_session_id,
            local_params,
            random: random_bytes(),
            eph: KeyPair::generate(),
            fabric: None,
            initiator_random: [0; RANDOM_LEN],
            initiator_eph: [0; PUBLIC_KEY_LEN],
            sigma1: None,
            sigma2: None,
            shared: None,
            resumption_id: random_bytes(),
            peer_session_id: 0,
            peer_params: SessionParameters::default(),
            resumed: None,
        }
    }

    /// Current state
    pub fn state(&self) -> CaseState {
        self.state
    }

    /// Random from the initiator's Sigma1, once received
    pub fn initiator_random(&self) -> Option<&[u8; RANDOM_LEN]> {
        (self.state != CaseState::Idle).then_some(&self.initiator_random)
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = CaseState::Failed;
            self.shared = None;
            self.resumed = None;
        }
        result
    }

    /// Mark the handshake failed
    pub fn fail(&mut self) {
        let _ = self.guard::<()>(Err(HandshakeError::InvalidState("failed")));
    }

    /// Handle Sigma1 against the local fabrics and resumption records
    pub fn handle_sigma1(
        &mut self,
        payload: &[u8],
        fabrics: &[Fabric],
        resumption: &ResumptionStore,
    ) -> Result<Sigma1Reply> {
        let result = self.on_sigma1(payload, fabrics, resumption);
        self.guard(result)
    }

    fn on_sigma1(
        &mut self,
        payload: &[u8],
        fabrics: &[Fabric],
        resumption: &ResumptionStore,
    ) -> Result<Sigma1Reply> {
        expect_state(self.state, CaseState::Idle)?;
        self.state = CaseState::Sigma1Received;
        let sigma1 = Sigma1::decode(payload)?;
        self.initiator_random = sigma1.initiator_random;
        self.initiator_eph = sigma1.initiator_eph_public_key;
        self.peer_session_id = sigma1.initiator_session_id;
        self.peer_params = sigma1.session_params.unwrap_or_default();
        self.sigma1 = Some(Bytes::copy_from_slice(payload));

        match (sigma1.resumption_id, sigma1.initiator_resume_mic) {
            (Some(id), Some(mic)) => {
                if let Some(reply) = self.try_resume(&id, &mic, fabrics, resumption)? {
                    return Ok(reply);
                }
                debug!(
                    "CASE responder {}: unknown resumption id, full handshake",
                    self.local_session_id
                );
            }
            (None, None) => {}
            _ => return Err(HandshakeError::Protocol("resumption id and MIC must come together")),
        }

        let fabric = fabrics
            .iter()
            .find(|f| f.matches_destination_id(&sigma1.destination_id, &sigma1.initiator_random))
            .cloned()
            .ok_or_else(|| {
                warn!(
                    "CASE responder {}: destination id matches no fabric",
                    self.local_session_id
                );
                HandshakeError::NoSharedTrustRoots
            })?;

        let shared = shared_secret(&self.eph, &sigma1.initiator_eph_public_key)?;
        let (noc, icac) = own_certificates(&fabric);
        let signed2 = SignedData {
            node_op_cert: noc.clone(),
            intermediate_ca_cert: icac.clone(),
            eph_public_key: *self.eph.public_key(),
            peer_eph_public_key: sigma1.initiator_eph_public_key,
        }
        .encode();
        let tbe2 = EncryptedDataSigma2 {
            node_op_cert: noc,
            intermediate_ca_cert: icac,
            signature: fabric.sign(&signed2),
            resumption_id: self.resumption_id,
        }
        .encode();
        let s2k = sigma2_key(
            &shared[..],
            fabric.identity_protection_key(),
            &self.random,
            self.eph.public_key(),
            payload,
        )?;
        let sigma2 = Sigma2 {
            responder_random: self.random,
            responder_session_id: self.local_session_id,
            responder_eph_public_key: *self.eph.public_key(),
            encrypted: aead::encrypt(&s2k[..], SIGMA2_NONCE, &tbe2, &[])?,
            session_params: Some(self.local_params),
        }
        .encode();

        debug!(
            "CASE responder {} matched fabric {}, sent Sigma2",
            self.local_session_id,
            fabric.index()
        );
        self.fabric = Some(fabric);
        self.shared = Some(shared);
        self.sigma2 = Some(sigma2.clone());
        self.state = CaseState::Sigma2Sent;
        Ok(Sigma1Reply::Sigma2(sigma2))
    }

    fn try_resume(
        &mut self,
        resumption_id: &[u8; RESUMPTION_ID_LEN],
        mic: &[u8; AEAD_MIC_LEN],
        fabrics: &[Fabric],
        resumption: &ResumptionStore,
    ) -> Result<Option<Sigma1Reply>> {
        let Some(record) = resumption.get_by_id(resumption_id) else {
            return Ok(None);
        };
        check_resume_mic(
            &record.shared_secret[..],
            &self.initiator_random,
            resumption_id,
            SIGMA1_RESUME_INFO,
            SIGMA1_RESUME_NONCE,
            mic,
        )?;
        let Some(fabric) = fabrics.iter().find(|f| f.index() == record.fabric_index) else {
            return Ok(None);
        };

        let new_id = self.resumption_id;
        let resume_mic = resume_mic(
            &record.shared_secret[..],
            &self.initiator_random,
            &new_id,
            SIGMA2_RESUME_INFO,
            SIGMA2_RESUME_NONCE,
        )?;
        let keys = resumption_session_keys(&record.shared_secret[..], &self.initiator_random, &new_id)?;
        let reply = Sigma2Resume {
            resumption_id: new_id,
            resume_mic,
            responder_session_id: self.local_session_id,
        }
        .encode();

        self.resumed = Some(CaseEstablished {
            keys,
            local_session_id: self.local_session_id,
            peer_session_id: self.peer_session_id,
            fabric_index: fabric.index(),
            local_node_id: fabric.node_id(),
            peer_node_id: record.peer_node_id,
            peer_params: self.peer_params,
            resumption: ResumptionRecord {
                resumption_id: new_id,
                peer_params: self.peer_params,
                ..record
            },
            resumed: true,
        });
        self.fabric = Some(fabric.clone());
        self.state = CaseState::Sigma2ResumeSent;
        debug!(
            "CASE responder {} resuming session with node {}",
            self.local_session_id, record.peer_node_id
        );
        Ok(Some(Sigma1Reply::Sigma2Resume(reply)))
    }

    /// Handle Sigma3, returning the success status report and the session
    pub fn handle_sigma3(&mut self, payload: &[u8]) -> Result<(Bytes, CaseEstablished)> {
        let result = self.on_sigma3(payload);
        self.guard(result)
    }

    fn on_sigma3(&mut self, payload: &[u8]) -> Result<(Bytes, CaseEstablished)> {
        expect_state(self.state, CaseState::Sigma2Sent)?;
        self.state = CaseState::Sigma3Received;
        let sigma3 = Sigma3::decode(payload)?;
        let missing = || HandshakeError::InvalidState("missing handshake state");
        let fabric = self.fabric.clone().ok_or_else(missing)?;
        let shared = self.shared.take().ok_or_else(missing)?;
        let sigma1 = self.sigma1.clone().ok_or_else(missing)?;
        let sigma2 = self.sigma2.clone().ok_or_else(missing)?;
        let ipk = *fabric.identity_protection_key();

        let s3k = sigma3_key(&shared[..], &ipk, &sigma1, &sigma2)?;
        let tbe3 = aead::decrypt(&s3k[..], SIGMA3_NONCE, &sigma3.encrypted, &[])?;
        let tbe3 = EncryptedDataSigma3::decode(&tbe3)?;

        let identity =
            fabric.verify_peer(&tbe3.node_op_cert, tbe3.intermediate_ca_cert.as_deref())?;
        let signed3 = SignedData {
            node_op_cert: tbe3.node_op_cert,
            intermediate_ca_cert: tbe3.intermediate_ca_cert,
            eph_public_key: self.initiator_eph,
            peer_eph_public_key: *self.eph.public_key(),
        }
        .encode();
        verify(&identity.public_key, &signed3, &tbe3.signature)
            .map_err(|_| HandshakeError::Signature)?;

        let keys = full_session_keys(&shared[..], &ipk, &sigma1, &sigma2, payload)?;
        let peer_node_id = NodeId(identity.node_id);
        self.state = CaseState::Established;
        info!(
            "CASE session {} established with node {} on fabric {}",
            self.local_session_id,
            peer_node_id,
            fabric.index()
        );
        Ok((
            StatusReport::success().encode(),
            CaseEstablished {
                keys,
                local_session_id: self.local_session_id,
                peer_session_id: self.peer_session_id,
                fabric_index: fabric.index(),
                local_node_id: fabric.node_id(),
                peer_node_id,
                peer_params: self.peer_params,
                resumption: ResumptionRecord {
                    resumption_id: self.resumption_id,
                    shared_secret: shared,
                    fabric_index: fabric.index(),
                    peer_node_id,
                    peer_params: self.peer_params,
                },
                resumed: false,
            },
        ))
    }

    /// Handle the initiator's status report after Sigma2Resume
    pub fn handle_status(&mut self, payload: &[u8]) -> Result<CaseEstablished> {
        let result = self.on_status(payload);
        self.guard(result)
    }

    fn on_status(&mut self, payload: &[u8]) -> Result<CaseEstablished> {
        expect_state(self.state, CaseState::Sigma2ResumeSent)?;
        let report = StatusReport::decode(payload)?;
        if !report.is_success() {
            return Err(HandshakeError::PeerStatus(report));
        }
        let established = self
            .resumed
            .take()
            .ok_or(HandshakeError::InvalidState("missing resumed session"))?;
        self.state = CaseState::Established;
        info!(
            "CASE session {} resumed with node {} on fabric {}",
            self.local_session_id, established.peer_node_id, established.fabric_index
        );
        Ok(established)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairing_fabric::{CertificateAuthority, FabricBuilder, FabricIndex, VendorId};

    const FABRIC_ID: u64 = 0x2906_C908_D115_D362;
    const EPOCH_KEY: [u8; 16] = [0x4a; 16];

    fn fabric(ca: &CertificateAuthority, index: u8, node_id: u64) -> Fabric {
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

    struct Pair {
        initiator_fabric: Fabric,
        responder_fabric: Fabric,
    }

    fn pair() -> Pair {
        let ca = CertificateAuthority::new_root(1, None);
        Pair {
            initiator_fabric: fabric(&ca, 1, 0x11),
            responder_fabric: fabric(&ca, 2, 0x22),
        }
    }

    fn full_handshake(
        pair: &Pair,
        store: &ResumptionStore,
    ) -> (CaseEstablished, CaseEstablished) {
        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            1,
            SessionParameters::default(),
            None,
        );
        let mut responder = CaseResponder::new(2, SessionParameters::default());

        let sigma1 = initiator.start().unwrap();
        let fabrics = [pair.responder_fabric.clone()];
        let Sigma1Reply::Sigma2(sigma2) = responder.handle_sigma1(&sigma1, &fabrics, store).unwrap()
        else {
            panic!("expected Sigma2");
        };
        let sigma3 = initiator.handle_sigma2(&sigma2).unwrap();
        let (status, responder_session) = responder.handle_sigma3(&sigma3).unwrap();
        let initiator_session = initiator.handle_status(&status).unwrap();
        (initiator_session, responder_session)
    }

    #[test]
    fn test_full_handshake() {
        let pair = pair();
        let (i, r) = full_handshake(&pair, &ResumptionStore::new());

        assert_eq!(i.keys.i2r(), r.keys.i2r());
        assert_eq!(i.keys.r2i(), r.keys.r2i());
        assert_eq!(i.keys.attestation_challenge(), r.keys.attestation_challenge());
        assert_eq!((i.local_session_id, i.peer_session_id), (1, 2));
        assert_eq!((r.local_session_id, r.peer_session_id), (2, 1));
        assert_eq!(i.peer_node_id, NodeId(0x22));
        assert_eq!(r.peer_node_id, NodeId(0x11));
        assert_eq!(r.fabric_index, FabricIndex::new(2).unwrap());
        assert_eq!(i.resumption.resumption_id, r.resumption.resumption_id);
        assert_eq!(&i.resumption.shared_secret[..], &r.resumption.shared_secret[..]);
        assert!(!i.resumed && !r.resumed);
    }

    #[test]
    fn test_resumption() {
        let pair = pair();
        let store = ResumptionStore::new();
        let (first_i, first_r) = full_handshake(&pair, &store);
        let previous_id = first_r.resumption.resumption_id;
        store.insert(first_r.resumption);

        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            3,
            SessionParameters::default(),
            Some(first_i.resumption),
        );
        let mut responder = CaseResponder::new(4, SessionParameters::default());
        let sigma1 = initiator.start().unwrap();
        let fabrics = [pair.responder_fabric.clone()];
        let Sigma1Reply::Sigma2Resume(resume) =
            responder.handle_sigma1(&sigma1, &fabrics, &store).unwrap()
        else {
            panic!("expected Sigma2Resume");
        };
        assert_eq!(responder.state(), CaseState::Sigma2ResumeSent);

        let (status, i) = initiator.handle_sigma2_resume(&resume).unwrap();
        let r = responder.handle_status(&status).unwrap();
        assert!(i.resumed && r.resumed);
        assert_eq!(i.keys.i2r(), r.keys.i2r());
        assert_eq!(i.peer_session_id, 4);
        assert_eq!(r.peer_session_id, 3);
        assert_eq!(r.peer_node_id, NodeId(0x11));
        assert_ne!(i.resumption.resumption_id, previous_id);
        assert_eq!(i.resumption.resumption_id, r.resumption.resumption_id);
    }

    #[test]
    fn test_unknown_resumption_id_falls_back() {
        let pair = pair();
        let (first_i, _) = full_handshake(&pair, &ResumptionStore::new());

        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            3,
            SessionParameters::default(),
            Some(first_i.resumption),
        );
        let mut responder = CaseResponder::new(4, SessionParameters::default());
        let sigma1 = initiator.start().unwrap();
        let fabrics = [pair.responder_fabric.clone()];
        let reply = responder
            .handle_sigma1(&sigma1, &fabrics, &ResumptionStore::new())
            .unwrap();
        let Sigma1Reply::Sigma2(sigma2) = reply else {
            panic!("expected Sigma2");
        };
        let sigma3 = initiator.handle_sigma2(&sigma2).unwrap();
        let (status, r) = responder.handle_sigma3(&sigma3).unwrap();
        let i = initiator.handle_status(&status).unwrap();
        assert!(!i.resumed);
        assert_eq!(i.keys.r2i(), r.keys.r2i());
    }

    #[test]
    fn test_bad_resume_mic_is_fatal() {
        let pair = pair();
        let store = ResumptionStore::new();
        let (first_i, first_r) = full_handshake(&pair, &store);
        store.insert(first_r.resumption);

        let mut forged = first_i.resumption;
        forged.shared_secret = Zeroizing::new([0x55; GROUP_SIZE]);
        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            3,
            SessionParameters::default(),
            Some(forged),
        );
        let mut responder = CaseResponder::new(4, SessionParameters::default());
        let sigma1 = initiator.start().unwrap();
        let err = responder
            .handle_sigma1(&sigma1, &[pair.responder_fabric.clone()], &store)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ResumptionMic));
        assert_eq!(responder.state(), CaseState::Failed);
    }

    #[test]
    fn test_no_shared_trust_root() {
        let pair = pair();
        let stranger = fabric(&CertificateAuthority::new_root(9, None), 1, 0x22);
        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            1,
            SessionParameters::default(),
            None,
        );
        let mut responder = CaseResponder::new(2, SessionParameters::default());
        let sigma1 = initiator.start().unwrap();
        let err = responder
            .handle_sigma1(&sigma1, &[stranger], &ResumptionStore::new())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::NoSharedTrustRoots));
        assert!(err.status_report().is_some());
    }

    #[test]
    fn test_tampered_sigma3_rejected() {
        let pair = pair();
        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            1,
            SessionParameters::default(),
            None,
        );
        let mut responder = CaseResponder::new(2, SessionParameters::default());
        let sigma1 = initiator.start().unwrap();
        let Sigma1Reply::Sigma2(sigma2) = responder
            .handle_sigma1(&sigma1, &[pair.responder_fabric.clone()], &ResumptionStore::new())
            .unwrap()
        else {
            panic!("expected Sigma2");
        };
        let sigma3 = initiator.handle_sigma2(&sigma2).unwrap();
        let mut decoded = Sigma3::decode(&sigma3).unwrap();
        decoded.encrypted[0] ^= 0xFF;

        assert!(responder.handle_sigma3(&decoded.encode()).is_err());
        assert_eq!(responder.state(), CaseState::Failed);
    }

    /// Run Sigma1 and Sigma2 between fresh machines dialling node 0x22
    fn to_sigma2(pair: &Pair) -> (CaseInitiator, CaseResponder, Bytes, Bytes) {
        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            1,
            SessionParameters::default(),
            None,
        );
        let mut responder = CaseResponder::new(2, SessionParameters::default());
        let sigma1 = initiator.start().unwrap();
        let Sigma1Reply::Sigma2(sigma2) = responder
            .handle_sigma1(&sigma1, &[pair.responder_fabric.clone()], &ResumptionStore::new())
            .unwrap()
        else {
            panic!("expected Sigma2");
        };
        (initiator, responder, sigma1, sigma2)
    }

    /// Re-seal Sigma2 under the responder's real key after editing its payload
    fn reseal_sigma2(
        responder: &CaseResponder,
        sigma1: &[u8],
        sigma2: &[u8],
        edit: impl FnOnce(&mut EncryptedDataSigma2, &[u8; PUBLIC_KEY_LEN]),
    ) -> Bytes {
        let mut outer = Sigma2::decode(sigma2).unwrap();
        let shared = responder.shared.as_ref().unwrap();
        let ipk = responder.fabric.as_ref().unwrap().identity_protection_key();
        let s2k = sigma2_key(
            &shared[..],
            ipk,
            &outer.responder_random,
            &outer.responder_eph_public_key,
            sigma1,
        )
        .unwrap();
        let plain = aead::decrypt(&s2k[..], SIGMA2_NONCE, &outer.encrypted, &[]).unwrap();
        let mut tbe2 = EncryptedDataSigma2::decode(&plain).unwrap();
        edit(&mut tbe2, &responder.initiator_eph);
        outer.encrypted = aead::encrypt(&s2k[..], SIGMA2_NONCE, &tbe2.encode(), &[]).unwrap();
        outer.encode()
    }

    #[test]
    fn test_bad_sigma2_signature_rejected() {
        let pair = pair();
        let before = pair.initiator_fabric.to_record();
        let (mut initiator, responder, sigma1, sigma2) = to_sigma2(&pair);
        let forged = reseal_sigma2(&responder, &sigma1, &sigma2, |tbe2, _| {
            tbe2.signature[10] ^= 0x01;
        });

        let err = initiator.handle_sigma2(&forged).unwrap_err();
        assert!(matches!(err, HandshakeError::Signature));
        assert_eq!(initiator.state(), CaseState::Failed);
        assert!(initiator.shared.is_none());
        assert_eq!(pair.initiator_fabric.to_record(), before);
    }

    #[test]
    fn test_sigma2_from_other_node_rejected() {
        let ca = CertificateAuthority::new_root(1, None);
        let pair = Pair {
            initiator_fabric: fabric(&ca, 1, 0x11),
            responder_fabric: fabric(&ca, 2, 0x22),
        };
        // Same trust root, different node
        let impostor = fabric(&ca, 2, 0x33);
        let (mut initiator, responder, sigma1, sigma2) = to_sigma2(&pair);
        let responder_eph = Sigma2::decode(&sigma2).unwrap().responder_eph_public_key;
        let forged = reseal_sigma2(&responder, &sigma1, &sigma2, |tbe2, initiator_eph| {
            tbe2.node_op_cert = impostor.operational_certificate().to_bytes();
            let signed = SignedData {
                node_op_cert: tbe2.node_op_cert.clone(),
                intermediate_ca_cert: None,
                eph_public_key: responder_eph,
                peer_eph_public_key: *initiator_eph,
            }
            .encode();
            tbe2.signature = impostor.sign(&signed);
        });

        let err = initiator.handle_sigma2(&forged).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::PeerMismatch {
                expected: 0x22,
                actual: 0x33
            }
        ));
        assert_eq!(initiator.state(), CaseState::Failed);
    }

    #[test]
    fn test_bad_sigma3_signature_rejected() {
        let pair = pair();
        let before = pair.responder_fabric.to_record();
        let (mut initiator, mut responder, _, sigma2) = to_sigma2(&pair);
        let sigma3 = initiator.handle_sigma2(&sigma2).unwrap();

        let shared = initiator.shared.as_ref().unwrap();
        let s3k = sigma3_key(
            &shared[..],
            initiator.fabric.identity_protection_key(),
            initiator.sigma1.as_ref().unwrap(),
            initiator.sigma2.as_ref().unwrap(),
        )
        .unwrap();
        let mut outer = Sigma3::decode(&sigma3).unwrap();
        let plain = aead::decrypt(&s3k[..], SIGMA3_NONCE, &outer.encrypted, &[]).unwrap();
        let mut tbe3 = EncryptedDataSigma3::decode(&plain).unwrap();
        tbe3.signature[10] ^= 0x01;
        outer.encrypted = aead::encrypt(&s3k[..], SIGMA3_NONCE, &tbe3.encode(), &[]).unwrap();

        let err = responder.handle_sigma3(&outer.encode()).unwrap_err();
        assert!(matches!(err, HandshakeError::Signature));
        assert_eq!(responder.state(), CaseState::Failed);
        assert!(responder.shared.is_none());
        assert_eq!(pair.responder_fabric.to_record(), before);
    }

    #[test]
    fn test_out_of_order_message() {
        let pair = pair();
        let mut initiator = CaseInitiator::new(
            pair.initiator_fabric.clone(),
            NodeId(0x22),
            1,
            SessionParameters::default(),
            None,
        );
        let err = initiator
            .handle_status(&StatusReport::success().encode())
            .unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidState(_)));
        assert!(initiator.start().is_err());
    }
}
