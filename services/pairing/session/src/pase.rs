//! Passcode-authenticated session establishment (SPAKE2+).
//!
//! Both roles are sans-IO: each step takes the received payload and returns
//! the payload to send. Any error moves the machine to `Failed`, after which
//! every call fails; a machine is never restarted.
//!
//! ```text
//! Initiator                                   Responder
//!   PbkdfParamRequest  -------------------->
//!                      <--------------------  PbkdfParamResponse
//!   Pake1 {X}          -------------------->
//!                      <--------------------  Pake2 {Y, cB}
//!   Pake3 {cA}         -------------------->
//!                      <--------------------  StatusReport (success)
//! ```

use crate::messages::{
    Pake1, Pake2, Pake3, PbkdfParamRequest, PbkdfParamResponse, PbkdfParameters, StatusReport,
    RANDOM_LEN,
};
use crate::params::SessionParameters;
use crate::secure::SessionKeys;
use crate::{HandshakeError, Result};
use bytes::Bytes;
use pairing_crypto::{
    random_bytes, sha256, validate_passcode, PasscodeSecrets, PasscodeVerifier, Spake2pKeys,
    Spake2pProver, Spake2pVerifier, HASH_LEN,
};
use pairing_tlv::TlvObject;
use tracing::{debug, warn};

const CONTEXT_PREFIX: &[u8] = b"CHIP PAKE V1 Commissioning";
const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";

/// PASE handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaseState {
    /// Nothing sent or received
    Idle,
    /// Initiator sent PbkdfParamRequest
    PbkdfRequested,
    /// PBKDF parameters exchanged
    PbkdfParamsExchanged,
    /// Initiator sent Pake1
    Pake1Sent,
    /// Responder received Pake1
    Pake1Received,
    /// Responder sent Pake2
    Pake2Sent,
    /// Initiator received Pake2
    Pake2Received,
    /// Initiator sent Pake3
    Pake3Sent,
    /// Responder received Pake3
    Pake3Received,
    /// Keys derived, session usable
    Established,
    /// Terminal failure
    Failed,
}

impl PaseState {
    fn name(self) -> &'static str {
        match self {
            PaseState::Idle => "idle",
            PaseState::Established => "already established",
            PaseState::Failed => "failed",
            _ => "in the wrong state",
        }
    }
}

/// Result of a successful PASE handshake
#[derive(Debug)]
pub struct PaseEstablished {
    /// Derived session keys
    pub keys: SessionKeys,
    /// Our session id
    pub local_session_id: u16,
    /// Peer's session id
    pub peer_session_id: u16,
    /// Peer timing hints
    pub peer_params: SessionParameters,
}

fn context_hash(request: &[u8], response: &[u8]) -> [u8; HASH_LEN] {
    sha256(&[CONTEXT_PREFIX, request, response])
}

fn derive_session_keys(keys: &Spake2pKeys) -> Result<SessionKeys> {
    SessionKeys::derive(keys.ke(), &[], SESSION_KEYS_INFO)
}

fn expect_state(actual: PaseState, expected: PaseState) -> Result<()> {
    if actual != expected {
        return Err(HandshakeError::InvalidState(actual.name()));
    }
    Ok(())
}

/// Commissioner side
pub struct PaseInitiator {
    state: PaseState,
    passcode: u32,
    local_session_id: u16,
    local_params: SessionParameters,
    random: [u8; RANDOM_LEN],
    known_parameters: Option<PbkdfParameters>,
    request: Option<Bytes>,
    prover: Option<Spake2pProver>,
    keys: Option<Spake2pKeys>,
    peer_session_id: u16,
    peer_params: SessionParameters,
}

impl PaseInitiator {
    /// New initiator for `passcode`
    pub fn new(passcode: u32, local_session_id: u16, local_params: SessionParameters) -> Result<Self> {
        validate_passcode(passcode)?;
        Ok(Self {
            state: PaseState::Idle,
            passcode,
            local_session_id,
            local_params,
            random: random_bytes(),
            known_parameters: None,
            request: None,
            prover: None,
            keys: None,
            peer_session_id: 0,
            peer_params: SessionParameters::default(),
        })
    }

    /// Use PBKDF parameters learned out of band; the responder must then omit them
    pub fn with_pbkdf_parameters(mut self, parameters: PbkdfParameters) -> Self {
        self.known_parameters = Some(parameters);
        self
    }

    /// Current state
    pub fn state(&self) -> PaseState {
        self.state
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = PaseState::Failed;
            self.prover = None;
            self.keys = None;
        }
        result
    }

    /// Build PbkdfParamRequest
    pub fn start(&mut self) -> Result<Bytes> {
        expect_state(self.state, PaseState::Idle)?;
        let request = PbkdfParamRequest {
            initiator_random: self.random,
            initiator_session_id: self.local_session_id,
            passcode_id: 0,
            has_pbkdf_parameters: self.known_parameters.is_some(),
            session_params: Some(self.local_params),
        }
        .encode();
        self.request = Some(request.clone());
        self.state = PaseState::PbkdfRequested;
        debug!("PASE initiator {} sent PbkdfParamRequest", self.local_session_id);
        Ok(request)
    }

    /// Handle PbkdfParamResponse, returning Pake1
    pub fn handle_pbkdf_response(&mut self, payload: &[u8]) -> Result<Bytes> {
        let result = self.on_pbkdf_response(payload);
        self.guard(result)
    }

    fn on_pbkdf_response(&mut self, payload: &[u8]) -> Result<Bytes> {
        expect_state(self.state, PaseState::PbkdfRequested)?;
        let response = PbkdfParamResponse::decode(payload)?;
        if response.initiator_random != self.random {
            return Err(HandshakeError::Protocol("response does not echo initiator random"));
        }

        let parameters = match (&self.known_parameters, response.pbkdf_parameters) {
            (Some(known), None) => known.clone(),
            (None, Some(sent)) => sent,
            (Some(_), Some(_)) => {
                return Err(HandshakeError::Protocol("unrequested PBKDF parameters"))
            }
            (None, None) => return Err(HandshakeError::Protocol("missing PBKDF parameters")),
        };
        if !parameters.is_valid() {
            return Err(HandshakeError::Protocol("PBKDF parameters out of range"));
        }

        let request = self
            .request
            .as_ref()
            .ok_or(HandshakeError::InvalidState("missing request"))?;
        let context = context_hash(request, payload);
        let secrets = PasscodeSecrets::derive(self.passcode, &parameters.salt, parameters.iterations)?;
        let prover = Spake2pProver::new(context, &secrets)?;
        let pake1 = Pake1 { x: *prover.share() }.encode();

        self.peer_session_id = response.responder_session_id;
        self.peer_params = response.session_params.unwrap_or_default();
        self.prover = Some(prover);
        self.state = PaseState::Pake1Sent;
        debug!(
            "PASE initiator {} sent Pake1 (peer session {})",
            self.local_session_id, self.peer_session_id
        );
        Ok(pake1)
    }

    /// Handle Pake2, verify cB and return Pake3
    pub fn handle_pake2(&mut self, payload: &[u8]) -> Result<Bytes> {
        let result = self.on_pake2(payload);
        self.guard(result)
    }

    fn on_pake2(&mut self, payload: &[u8]) -> Result<Bytes> {
        expect_state(self.state, PaseState::Pake1Sent)?;
        let pake2 = Pake2::decode(payload)?;
        let prover = self
            .prover
            .take()
            .ok_or(HandshakeError::InvalidState("missing prover"))?;
        self.state = PaseState::Pake2Received;

        let keys = prover.finish(&pake2.y)?;
        if !keys.check_verifier_confirmation(&pake2.verifier)? {
            warn!("PASE initiator {}: verifier confirmation mismatch", self.local_session_id);
            return Err(HandshakeError::Confirmation("verifier"));
        }
        let pake3 = Pake3 {
            verifier: keys.prover_confirmation()?,
        }
        .encode();
        self.keys = Some(keys);
        self.state = PaseState::Pake3Sent;
        Ok(pake3)
    }

    /// Handle the responder's final status report
    pub fn handle_status(&mut self, payload: &[u8]) -> Result<PaseEstablished> {
        let result = self.on_status(payload);
        self.guard(result)
    }

    fn on_status(&mut self, payload: &[u8]) -> Result<PaseEstablished> {
        expect_state(self.state, PaseState::Pake3Sent)?;
        let report = StatusReport::decode(payload)?;
        if !report.is_success() {
            return Err(HandshakeError::PeerStatus(report));
        }
        let keys = self
            .keys
            .take()
            .ok_or(HandshakeError::InvalidState("missing keys"))?;
        let session_keys = derive_session_keys(&keys)?;
        self.state = PaseState::Established;
        debug!("PASE initiator {} established", self.local_session_id);
        Ok(PaseEstablished {
            keys: session_keys,
            local_session_id: self.local_session_id,
            peer_session_id: self.peer_session_id,
            peer_params: self.peer_params,
        })
    }

    /// Mark the handshake failed, e.g. on a peer status report
    pub fn fail(&mut self) {
        let _ = self.guard::<()>(Err(HandshakeError::InvalidState("failed")));
    }
}

/// Commissionee side
pub struct PaseResponder {
    state: PaseState,
    verifier: PasscodeVerifier,
    parameters: PbkdfParameters,
    local_session_id: u16,
    local_params: SessionParameters,
    random: [u8; RANDOM_LEN],
    initiator_random: Option<[u8; RANDOM_LEN]>,
    spake: Option<Spake2pVerifier>,
    keys: Option<Spake2pKeys>,
    peer_session_id: u16,
    peer_params: SessionParameters,
}

impl PaseResponder {
    /// New responder holding the passcode verifier and its PBKDF parameters
    pub fn new(
        verifier: PasscodeVerifier,
        parameters: PbkdfParameters,
        local_session_id: u16,
        local_params: SessionParameters,
    ) -> Result<Self> {
        if !parameters.is_valid() {
            return Err(HandshakeError::Protocol("PBKDF parameters out of range"));
        }
        Ok(Self {
            state: PaseState::Idle,
            verifier,
            parameters,
            local_session_id,
            local_params,
            random: random_bytes(),
            initiator_random: None,
            spake: None,
            keys: None,
            peer_session_id: 0,
            peer_params: SessionParameters::default(),
        })
    }

    /// Current state
    pub fn state(&self) -> PaseState {
        self.state
    }

    /// Random from the initiator's request, once received
    pub fn initiator_random(&self) -> Option<&[u8; RANDOM_LEN]> {
        self.initiator_random.as_ref()
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = PaseState::Failed;
            self.spake = None;
            self.keys = None;
        }
        result
    }

    /// Handle PbkdfParamRequest, returning PbkdfParamResponse
    pub fn handle_pbkdf_request(&mut self, payload: &[u8]) -> Result<Bytes> {
        let result = self.on_pbkdf_request(payload);
        self.guard(result)
    }

    fn on_pbkdf_request(&mut self, payload: &[u8]) -> Result<Bytes> {
        expect_state(self.state, PaseState::Idle)?;
        let request = PbkdfParamRequest::decode(payload)?;
        if request.passcode_id != 0 {
            return Err(HandshakeError::Protocol("unknown passcode id"));
        }

        let response = PbkdfParamResponse {
            initiator_random: request.initiator_random,
            responder_random: self.random,
            responder_session_id: self.local_session_id,
            pbkdf_parameters: (!request.has_pbkdf_parameters).then(|| self.parameters.clone()),
            session_params: Some(self.local_params),
        }
        .encode();

        let context = context_hash(payload, &response);
        self.spake = Some(Spake2pVerifier::new(context, &self.verifier)?);
        self.initiator_random = Some(request.initiator_random);
        self.peer_session_id = request.initiator_session_id;
        self.peer_params = request.session_params.unwrap_or_default();
        self.state = PaseState::PbkdfParamsExchanged;
        debug!(
            "PASE responder {} answered PbkdfParamRequest from session {}",
            self.local_session_id, self.peer_session_id
        );
        Ok(response)
    }

    /// Handle Pake1, returning Pake2
    pub fn handle_pake1(&mut self, payload: &[u8]) -> Result<Bytes> {
        let result = self.on_pake1(payload);
        self.guard(result)
    }

    fn on_pake1(&mut self, payload: &[u8]) -> Result<Bytes> {
        expect_state(self.state, PaseState::PbkdfParamsExchanged)?;
        let pake1 = Pake1::decode(payload)?;
        self.state = PaseState::Pake1Received;
        let spake = self
            .spake
            .take()
            .ok_or(HandshakeError::InvalidState("missing verifier"))?;
        let y = *spake.share();
        let keys = spake.finish(&pake1.x)?;
        let pake2 = Pake2 {
            y,
            verifier: keys.verifier_confirmation()?,
        }
        .encode();
        self.keys = Some(keys);
        self.state = PaseState::Pake2Sent;
        Ok(pake2)
    }

    /// Handle Pake3, returning the success status report and the session
    pub fn handle_pake3(&mut self, payload: &[u8]) -> Result<(Bytes, PaseEstablished)> {
        let result = self.on_pake3(payload);
        self.guard(result)
    }

    fn on_pake3(&mut self, payload: &[u8]) -> Result<(Bytes, PaseEstablished)> {
        expect_state(self.state, PaseState::Pake2Sent)?;
        let pake3 = Pake3::decode(payload)?;
        self.state = PaseState::Pake3Received;
        let keys = self
            .keys
            .take()
            .ok_or(HandshakeError::InvalidState("missing keys"))?;
        if !keys.check_prover_confirmation(&pake3.verifier)? {
            warn!("PASE responder {}: prover confirmation mismatch", self.local_session_id);
            return Err(HandshakeError::Confirmation("prover"));
        }
        let session_keys = derive_session_keys(&keys)?;
        self.state = PaseState::Established;
        debug!("PASE responder {} established", self.local_session_id);
        Ok((
            StatusReport::success().encode(),
            PaseEstablished {
                keys: session_keys,
                local_session_id: self.local_session_id,
                peer_session_id: self.peer_session_id,
                peer_params: self.peer_params,
            },
        ))
    }

    /// Mark the handshake failed, e.g. on a peer status report
    pub fn fail(&mut self) {
        let _ = self.guard::<()>(Err(HandshakeError::InvalidState("failed")));
    }
}
