//! Established secure sessions: keys, message protection and late binding.
//!
//! ## Message format
//!
//! ```text
//! +-------+------------+----------------+-----------+----------------+-------------------+
//! | flags | session id | security flags |  counter  | source node id | ciphertext || MIC |
//! | (u8)  |  (u16 LE)  |      (u8)      | (u32 LE)  | (u64 LE, opt.) |                   |
//! +-------+------------+----------------+-----------+----------------+-------------------+
//! ```
//!
//! The header is the AEAD associated data. The nonce is
//! `security flags || counter (LE) || sender node id (LE)`.
//!
//! A session starts unbound: sealed packets queue up until [`SecureSession::bind`]
//! attaches the transport sink, then drain in order.

use crate::params::SessionParameters;
use crate::{HandshakeError, Result};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pairing_crypto::{aead, hkdf_sha256, AEAD_NONCE_LEN, SYMMETRIC_KEY_LEN};
use pairing_fabric::{FabricIndex, NodeId};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

/// Length of I2R key, R2I key and attestation challenge
pub const SESSION_KEY_MATERIAL_LEN: usize = 3 * SYMMETRIC_KEY_LEN;

/// Width of the duplicate detection window
pub const REPLAY_WINDOW: u32 = 32;

/// Initial outbound counters stay below this so they have room to grow
const INITIAL_COUNTER_MASK: u32 = 0x0FFF_FFFF;

/// Symmetric keys of one secure session
pub struct SessionKeys {
    i2r: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
    r2i: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
    attestation_challenge: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    /// HKDF-SHA256 the key material and split it into I2R, R2I and challenge
    pub fn derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Self> {
        let okm = hkdf_sha256(ikm, salt, info, SESSION_KEY_MATERIAL_LEN)?;
        let mut keys = Self {
            i2r: Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]),
            r2i: Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]),
            attestation_challenge: Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]),
        };
        keys.i2r.copy_from_slice(&okm[..SYMMETRIC_KEY_LEN]);
        keys.r2i
            .copy_from_slice(&okm[SYMMETRIC_KEY_LEN..2 * SYMMETRIC_KEY_LEN]);
        keys.attestation_challenge
            .copy_from_slice(&okm[2 * SYMMETRIC_KEY_LEN..]);
        Ok(keys)
    }

    /// Initiator-to-responder key
    pub fn i2r(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.i2r
    }

    /// Responder-to-initiator key
    pub fn r2i(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.r2i
    }

    /// Attestation challenge
    pub fn attestation_challenge(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.attestation_challenge
    }
}

/// Side of the handshake this node played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Sent the first handshake message
    Initiator,
    /// Answered it
    Responder,
}

/// How the session was established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Passcode-authenticated commissioning session
    Pase,
    /// Certificate-authenticated operational session
    Case {
        /// Fabric the session belongs to
        fabric_index: FabricIndex,
        /// Established through resumption
        resumed: bool,
    },
}

bitflags! {
    /// Message header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// Source node id field present
        const SOURCE_NODE_ID = 1 << 2;
    }
}

bitflags! {
    /// Security flags, also the first nonce byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityFlags: u8 {
        /// Privacy obfuscation requested
        const PRIVACY = 1 << 7;
        /// Control message
        const CONTROL = 1 << 6;
        /// Extensions present
        const EXTENSIONS = 1 << 5;
    }
}

/// Cleartext message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Header flags
    pub flags: MessageFlags,
    /// Receiver's session id
    pub session_id: u16,
    /// Security flags
    pub security_flags: SecurityFlags,
    /// Message counter
    pub counter: u32,
    /// Sender node id
    pub source_node_id: Option<u64>,
}

impl MessageHeader {
    const MIN_LEN: usize = 8;

    /// Encoded length
    pub fn encoded_len(&self) -> usize {
        Self::MIN_LEN + if self.source_node_id.is_some() { 8 } else { 0 }
    }

    /// Append the wire form
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut flags = self.flags;
        flags.set(MessageFlags::SOURCE_NODE_ID, self.source_node_id.is_some());
        buf.put_u8(flags.bits());
        buf.put_u16_le(self.session_id);
        buf.put_u8(self.security_flags.bits());
        buf.put_u32_le(self.counter);
        if let Some(node_id) = self.source_node_id {
            buf.put_u64_le(node_id);
        }
    }

    /// Parse a header, returning it and the remaining bytes
    pub fn decode(mut buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < Self::MIN_LEN {
            return Err(HandshakeError::Header("truncated"));
        }
        let flags = MessageFlags::from_bits_truncate(buf.get_u8());
        let session_id = buf.get_u16_le();
        let security_flags = SecurityFlags::from_bits_truncate(buf.get_u8());
        let counter = buf.get_u32_le();
        let source_node_id = if flags.contains(MessageFlags::SOURCE_NODE_ID) {
            if buf.len() < 8 {
                return Err(HandshakeError::Header("truncated source node id"));
            }
            Some(buf.get_u64_le())
        } else {
            None
        };
        Ok((
            Self {
                flags,
                session_id,
                security_flags,
                counter,
                source_node_id,
            },
            buf,
        ))
    }
}

/// Build the 13-byte AEAD nonce
pub fn message_nonce(
    security_flags: SecurityFlags,
    counter: u32,
    node_id: u64,
) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[0] = security_flags.bits();
    nonce[1..5].copy_from_slice(&counter.to_le_bytes());
    nonce[5..].copy_from_slice(&node_id.to_le_bytes());
    nonce
}

/// Sliding duplicate window over received counters
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    max_counter: Option<u32>,
    /// Bit `n` set means `max_counter - 1 - n` was received
    bitmap: u32,
}

impl ReplayWindow {
    /// Whether `counter` would be accepted
    pub fn check(&self, counter: u32) -> Result<()> {
        let Some(max) = self.max_counter else {
            return Ok(());
        };
        if counter > max {
            return Ok(());
        }
        if counter == max {
            return Err(HandshakeError::Duplicate(counter));
        }
        let offset = max - counter - 1;
        if offset >= REPLAY_WINDOW || self.bitmap & (1 << offset) != 0 {
            return Err(HandshakeError::Duplicate(counter));
        }
        Ok(())
    }

    /// Record `counter`; call only after [`check`](Self::check) passed
    pub fn commit(&mut self, counter: u32) {
        match self.max_counter {
            None => {
                self.max_counter = Some(counter);
                self.bitmap = 0;
            }
            Some(max) if counter > max => {
                let shift = counter - max;
                // Old max becomes bit shift-1
                self.bitmap = if shift >= REPLAY_WINDOW {
                    0
                } else {
                    (self.bitmap << shift) | (1 << (shift - 1))
                };
                self.max_counter = Some(counter);
            }
            Some(max) => {
                let offset = max - counter - 1;
                if offset < REPLAY_WINDOW {
                    self.bitmap |= 1 << offset;
                }
            }
        }
    }
}

enum Binding {
    Unbound(VecDeque<Bytes>),
    Bound(mpsc::Sender<Bytes>),
    Closed,
}

struct SessionState {
    next_counter: u32,
    replay: ReplayWindow,
    binding: Binding,
}

/// Parameters fixed when a handshake completes
#[derive(Debug)]
pub struct SessionSetup {
    /// Role played in the handshake
    pub role: SessionRole,
    /// PASE or CASE
    pub kind: SessionKind,
    /// Our session id (peer puts it in headers it sends us)
    pub local_session_id: u16,
    /// Peer's session id
    pub peer_session_id: u16,
    /// Our operational node id, 0 for PASE
    pub local_node_id: NodeId,
    /// Peer operational node id, 0 for PASE
    pub peer_node_id: NodeId,
    /// Derived keys
    pub keys: SessionKeys,
    /// Peer timing hints
    pub peer_params: SessionParameters,
}

/// An established session protecting application messages
pub struct SecureSession {
    role: SessionRole,
    kind: SessionKind,
    local_session_id: u16,
    peer_session_id: u16,
    local_node_id: NodeId,
    peer_node_id: NodeId,
    keys: SessionKeys,
    peer_params: SessionParameters,
    state: Mutex<SessionState>,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("local_session_id", &self.local_session_id)
            .field("peer_session_id", &self.peer_session_id)
            .field("peer_node_id", &self.peer_node_id)
            .finish_non_exhaustive()
    }
}

impl SecureSession {
    /// Unbound session with a random initial counter
    pub fn new(setup: SessionSetup) -> Self {
        let initial = (rand::random::<u32>() & INITIAL_COUNTER_MASK) + 1;
        Self::with_initial_counter(setup, initial)
    }

    /// Unbound session with a chosen initial counter
    pub fn with_initial_counter(setup: SessionSetup, initial_counter: u32) -> Self {
        Self {
            role: setup.role,
            kind: setup.kind,
            local_session_id: setup.local_session_id,
            peer_session_id: setup.peer_session_id,
            local_node_id: setup.local_node_id,
            peer_node_id: setup.peer_node_id,
            keys: setup.keys,
            peer_params: setup.peer_params,
            state: Mutex::new(SessionState {
                next_counter: initial_counter,
                replay: ReplayWindow::default(),
                binding: Binding::Unbound(VecDeque::new()),
            }),
        }
    }

    /// Our session id
    pub fn local_session_id(&self) -> u16 {
        self.local_session_id
    }

    /// Peer's session id
    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }

    /// Role in the handshake
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// PASE or CASE
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Fabric of a CASE session
    pub fn fabric_index(&self) -> Option<FabricIndex> {
        match self.kind {
            SessionKind::Case { fabric_index, .. } => Some(fabric_index),
            SessionKind::Pase => None,
        }
    }

    /// Peer node id
    pub fn peer_node_id(&self) -> NodeId {
        self.peer_node_id
    }

    /// Our node id
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Peer timing hints
    pub fn peer_params(&self) -> &SessionParameters {
        &self.peer_params
    }

    /// Attestation challenge for device attestation
    pub fn attestation_challenge(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        self.keys.attestation_challenge()
    }

    fn encrypt_key(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        match self.role {
            SessionRole::Initiator => self.keys.i2r(),
            SessionRole::Responder => self.keys.r2i(),
        }
    }

    fn decrypt_key(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        match self.role {
            SessionRole::Initiator => self.keys.r2i(),
            SessionRole::Responder => self.keys.i2r(),
        }
    }

    fn seal_with_counter(&self, counter: u32, payload: &[u8]) -> Result<Bytes> {
        let header = MessageHeader {
            flags: MessageFlags::empty(),
            session_id: self.peer_session_id,
            security_flags: SecurityFlags::empty(),
            counter,
            source_node_id: match self.kind {
                SessionKind::Pase => None,
                SessionKind::Case { .. } => Some(self.local_node_id.0),
            },
        };
        let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len() + 16);
        header.encode_into(&mut buf);
        let nonce = message_nonce(header.security_flags, counter, self.local_node_id.0);
        let ciphertext = aead::encrypt(self.encrypt_key(), &nonce, payload, &buf)?;
        buf.extend_from_slice(&ciphertext);
        Ok(buf.freeze())
    }

    fn take_counter(state: &mut SessionState) -> Result<u32> {
        let counter = state.next_counter;
        state.next_counter = counter
            .checked_add(1)
            .ok_or(HandshakeError::CounterExhausted)?;
        Ok(counter)
    }

    /// Encrypt a payload into a packet without sending it
    pub async fn seal(&self, payload: &[u8]) -> Result<Bytes> {
        let mut state = self.state.lock().await;
        if matches!(state.binding, Binding::Closed) {
            return Err(HandshakeError::SessionClosed);
        }
        let counter = Self::take_counter(&mut state)?;
        self.seal_with_counter(counter, payload)
    }

    /// Encrypt and send, or queue the packet until the session is bound
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(state.binding, Binding::Closed) {
            return Err(HandshakeError::SessionClosed);
        }
        let counter = Self::take_counter(&mut state)?;
        let packet = self.seal_with_counter(counter, payload)?;
        match &mut state.binding {
            Binding::Unbound(queue) => {
                trace!(
                    "Session {} unbound, queued counter {}",
                    self.local_session_id,
                    counter
                );
                queue.push_back(packet);
                Ok(())
            }
            Binding::Bound(sink) => sink
                .send(packet)
                .await
                .map_err(|_| HandshakeError::ChannelClosed),
            Binding::Closed => Err(HandshakeError::SessionClosed),
        }
    }

    /// Attach the transport sink and flush queued packets in order
    pub async fn bind(&self, sink: mpsc::Sender<Bytes>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let queued = match std::mem::replace(&mut state.binding, Binding::Bound(sink.clone())) {
            Binding::Unbound(queue) => queue,
            Binding::Bound(_) => VecDeque::new(),
            Binding::Closed => {
                state.binding = Binding::Closed;
                return Err(HandshakeError::SessionClosed);
            }
        };

        let flushed = queued.len();
        for packet in queued {
            sink.send(packet)
                .await
                .map_err(|_| HandshakeError::ChannelClosed)?;
        }
        debug!(
            "Session {} bound, flushed {} queued packets",
            self.local_session_id, flushed
        );
        Ok(flushed)
    }

    /// Whether a sink is attached
    pub async fn is_bound(&self) -> bool {
        matches!(self.state.lock().await.binding, Binding::Bound(_))
    }

    /// Authenticate and decrypt a packet addressed to this session
    pub async fn open(&self, packet: &[u8]) -> Result<(MessageHeader, Zeroizing<Vec<u8>>)> {
        let (header, ciphertext) = MessageHeader::decode(packet)?;
        if header.session_id != self.local_session_id {
            return Err(HandshakeError::WrongSession {
                expected: self.local_session_id,
                actual: header.session_id,
            });
        }

        let mut state = self.state.lock().await;
        if matches!(state.binding, Binding::Closed) {
            return Err(HandshakeError::SessionClosed);
        }
        state.replay.check(header.counter)?;

        let aad = &packet[..header.encoded_len()];
        let nonce = message_nonce(header.security_flags, header.counter, self.peer_node_id.0);
        let plaintext = aead::decrypt(self.decrypt_key(), &nonce, ciphertext, aad).map_err(|e| {
            warn!(
                "Session {} dropped message {}: {}",
                self.local_session_id, header.counter, e
            );
            HandshakeError::Crypto(e)
        })?;

        // Only authenticated counters move the window
        state.replay.commit(header.counter);
        Ok((header, plaintext))
    }

    /// Stop sending and receiving; queued packets are discarded
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !matches!(state.binding, Binding::Closed) {
            debug!("Session {} closed", self.local_session_id);
        }
        state.binding = Binding::Closed;
    }

    /// Whether [`close`](Self::close) was called
    pub async fn is_closed(&self) -> bool {
        matches!(self.state.lock().await.binding, Binding::Closed)
    }
}
