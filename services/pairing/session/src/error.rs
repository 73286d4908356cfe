//! Handshake and secure session errors.

use crate::messages::{MessageType, ProtocolCode, StatusReport};
use pairing_crypto::CryptoError;
use pairing_fabric::FabricError;
use pairing_tlv::ValidationError;
use std::time::Duration;
use thiserror::Error;

/// Errors from PASE, CASE, secure sessions and exchange plumbing
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Message failed TLV decoding or schema validation
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// Message type not valid in the current state
    #[error("expected {expected:?}, received {actual:?}")]
    UnexpectedMessage {
        /// Message the state machine waits for
        expected: MessageType,
        /// Message that arrived
        actual: MessageType,
    },

    /// Unknown opcode on the wire
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// Peer broke a protocol rule
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Operation not allowed in the current state
    #[error("handshake is {0}")]
    InvalidState(&'static str),

    /// SPAKE2+ key confirmation failed
    #[error("{0} key confirmation failed")]
    Confirmation(&'static str),

    /// No local fabric matches the destination id
    #[error("no shared trust roots")]
    NoSharedTrustRoots,

    /// Peer certificate chain or identity rejected
    #[error("peer credentials rejected: {0}")]
    Fabric(#[from] FabricError),

    /// Peer NOC names a different node than the one we dialled
    #[error("peer is node {actual:016X}, expected {expected:016X}")]
    PeerMismatch {
        /// Node id we expected
        expected: u64,
        /// Node id in the peer certificate
        actual: u64,
    },

    /// Peer signature over the handshake transcript is invalid
    #[error("peer signature invalid")]
    Signature,

    /// Resumption MIC does not verify
    #[error("resumption MIC invalid")]
    ResumptionMic,

    /// Responder already saw this initiator random
    #[error("replayed initiator random")]
    ReplayedRandom,

    /// Peer ended the handshake with a failure status
    #[error("peer reported {0}")]
    PeerStatus(StatusReport),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Handshake or waiter deadline passed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transport or exchange closed
    #[error("channel closed")]
    ChannelClosed,

    /// A waiter is already registered under this key
    #[error("exchange {0} already has a waiter")]
    WaiterBusy(String),

    /// All session ids are in use
    #[error("no free session id")]
    SessionIdsExhausted,

    /// Message header malformed
    #[error("malformed message header: {0}")]
    Header(&'static str),

    /// Message addressed to another session
    #[error("message for session {actual}, this is session {expected}")]
    WrongSession {
        /// Local session id
        expected: u16,
        /// Session id in the header
        actual: u16,
    },

    /// Counter already seen or outside the window
    #[error("message counter {0} rejected as duplicate")]
    Duplicate(u32),

    /// Outbound counter would wrap
    #[error("message counter exhausted")]
    CounterExhausted,

    /// Session was closed
    #[error("session closed")]
    SessionClosed,
}

impl HandshakeError {
    /// Status report to send to the peer for this failure, if any.
    /// Transport failures and peer-reported failures get none.
    pub fn status_report(&self) -> Option<StatusReport> {
        match self {
            HandshakeError::NoSharedTrustRoots => {
                Some(StatusReport::failure(ProtocolCode::NoSharedTrustRoots))
            }
            HandshakeError::SessionIdsExhausted => Some(StatusReport::busy()),
            HandshakeError::Timeout(_)
            | HandshakeError::ChannelClosed
            | HandshakeError::PeerStatus(_)
            | HandshakeError::SessionClosed => None,
            _ => Some(StatusReport::failure(ProtocolCode::InvalidParameter)),
        }
    }
}

/// Result alias for this crate
pub type Result<T> = std::result::Result<T, HandshakeError>;
