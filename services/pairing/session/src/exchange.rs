//! Handshake transport: channels, waiters and exchange multiplexing.
//!
//! ## Exchange frame
//!
//! ```text
//! +-------+-------------+--------------+---------+
//! | flags | exchange id | message type | payload |
//! | (u8)  |  (u16 LE)   |     (u8)     |         |
//! +-------+-------------+--------------+---------+
//! ```
//!
//! `flags` bit 0 is set when the sender opened the exchange, so both ends
//! can allocate exchange ids independently.

use crate::messages::MessageType;
use crate::{HandshakeError, Result};
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Bidirectional message pipe a handshake runs over
#[async_trait]
pub trait HandshakeChannel: Send {
    /// Send one handshake message
    async fn send(&mut self, message_type: MessageType, payload: Bytes) -> Result<()>;

    /// Receive the next handshake message
    async fn recv(&mut self) -> Result<(MessageType, Bytes)>;
}

/// In-process channel end, used for tests and loopback
pub struct MemoryChannel {
    tx: mpsc::Sender<(MessageType, Bytes)>,
    rx: mpsc::Receiver<(MessageType, Bytes)>,
}

/// Two connected in-memory channel ends
pub fn memory_channel_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryChannel { tx: a_tx, rx: b_rx },
        MemoryChannel { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl HandshakeChannel for MemoryChannel {
    async fn send(&mut self, message_type: MessageType, payload: Bytes) -> Result<()> {
        self.tx
            .send((message_type, payload))
            .await
            .map_err(|_| HandshakeError::ChannelClosed)
    }

    async fn recv(&mut self) -> Result<(MessageType, Bytes)> {
        self.rx.recv().await.ok_or(HandshakeError::ChannelClosed)
    }
}

/// Sender and receiver of one raw link end
pub type LinkEnd = (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>);

/// Two connected raw links for an [`ExchangeDispatcher`] pair
pub fn link_pair(capacity: usize) -> (LinkEnd, LinkEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    ((a_tx, b_rx), (b_tx, a_rx))
}

struct Slot<V> {
    generation: u64,
    tx: oneshot::Sender<V>,
}

/// Cancellable one-shot waiters keyed by id.
///
/// At most one waiter per key. Dropping a [`Waiter`] unregisters it, so a
/// timed-out or abandoned wait leaves nothing behind.
pub struct WaiterRegistry<K, V> {
    slots: Arc<DashMap<K, Slot<V>>>,
    generation: Arc<AtomicU64>,
}

impl<K, V> Clone for WaiterRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<K: Eq + Hash, V> Default for WaiterRegistry<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K, V> WaiterRegistry<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`
    pub fn register(&self, key: K) -> Result<Waiter<K, V>> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => Err(HandshakeError::WaiterBusy(format!("{key:?}"))),
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                vacant.insert(Slot { generation, tx });
                Ok(Waiter {
                    key,
                    generation,
                    rx,
                    slots: Arc::clone(&self.slots),
                })
            }
        }
    }

    /// Hand `value` to the waiter for `key`, or give it back if none waits
    pub fn resolve(&self, key: &K, value: V) -> std::result::Result<(), V> {
        match self.slots.remove(key) {
            Some((_, slot)) => slot.tx.send(value),
            None => Err(value),
        }
    }

    /// Wake the waiter for `key` with [`HandshakeError::ChannelClosed`]
    pub fn cancel(&self, key: &K) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Number of registered waiters
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Pending wait on a [`WaiterRegistry`] key
pub struct Waiter<K: Eq + Hash, V> {
    key: K,
    generation: u64,
    rx: oneshot::Receiver<V>,
    slots: Arc<DashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash, V> Waiter<K, V> {
    /// Wait for the value, up to `timeout` when given
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<V> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.rx)
                .await
                .map_err(|_| HandshakeError::Timeout(limit))?,
            None => (&mut self.rx).await,
        };
        received.map_err(|_| HandshakeError::ChannelClosed)
    }
}

impl<K: Eq + Hash, V> Drop for Waiter<K, V> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.slots
            .remove_if(&self.key, |_, slot| slot.generation == generation);
    }
}

bitflags! {
    /// Exchange frame flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExchangeFlags: u8 {
        /// Sender opened this exchange
        const INITIATOR = 1 << 0;
    }
}

const EXCHANGE_HEADER_LEN: usize = 4;

/// Exchange id plus which side opened it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    /// Exchange id chosen by the opener
    pub id: u16,
    /// Opened by this end of the link
    pub local: bool,
}

fn encode_frame(key: ExchangeKey, message_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXCHANGE_HEADER_LEN + payload.len());
    let flags = if key.local {
        ExchangeFlags::INITIATOR
    } else {
        ExchangeFlags::empty()
    };
    buf.put_u8(flags.bits());
    buf.put_u16_le(key.id);
    buf.put_u8(message_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a frame into the receiver's view of the exchange key
fn decode_frame(mut frame: Bytes) -> Result<(ExchangeKey, MessageType, Bytes)> {
    if frame.len() < EXCHANGE_HEADER_LEN {
        return Err(HandshakeError::Header("exchange frame too short"));
    }
    let flags = ExchangeFlags::from_bits(frame.get_u8())
        .ok_or(HandshakeError::Header("unknown exchange flags"))?;
    let id = frame.get_u16_le();
    let message_type = MessageType::try_from(frame.get_u8())?;
    let key = ExchangeKey {
        id,
        local: !flags.contains(ExchangeFlags::INITIATOR),
    };
    Ok((key, message_type, frame))
}

/// Only a handshake's first message may open a peer exchange; anything
/// else on an unknown id is a late frame for an exchange already dropped
fn opens_exchange(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::PbkdfParamRequest | MessageType::Sigma1
    )
}

type Inbox = VecDeque<(MessageType, Bytes)>;

struct DispatcherShared {
    link_tx: mpsc::Sender<Bytes>,
    exchanges: DashMap<ExchangeKey, Inbox>,
    waiters: WaiterRegistry<ExchangeKey, (MessageType, Bytes)>,
    next_id: AtomicU16,
    closed: AtomicBool,
}

impl DispatcherShared {
    fn deliver(&self, key: ExchangeKey, message: (MessageType, Bytes)) -> bool {
        let Some(mut inbox) = self.exchanges.get_mut(&key) else {
            return false;
        };
        if let Err(message) = self.waiters.resolve(&key, message) {
            inbox.push_back(message);
        }
        true
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let keys: Vec<ExchangeKey> = self.exchanges.iter().map(|e| *e.key()).collect();
        for key in keys {
            // Serialize with a concurrent recv on the same exchange
            let _guard = self.exchanges.get_mut(&key);
            self.waiters.cancel(&key);
        }
    }
}

/// Multiplexes many handshake exchanges over one link.
///
/// Must be created inside a tokio runtime; a router task reads the link
/// until it closes.
#[derive(Clone)]
pub struct ExchangeDispatcher {
    shared: Arc<DispatcherShared>,
}

impl ExchangeDispatcher {
    /// Start dispatching over a link; peer-opened exchanges arrive on the
    /// returned receiver
    pub fn new(
        link_tx: mpsc::Sender<Bytes>,
        link_rx: mpsc::Receiver<Bytes>,
    ) -> (Self, mpsc::Receiver<ExchangeChannel>) {
        let shared = Arc::new(DispatcherShared {
            link_tx,
            exchanges: DashMap::new(),
            waiters: WaiterRegistry::new(),
            next_id: AtomicU16::new(rand::random()),
            closed: AtomicBool::new(false),
        });
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        tokio::spawn(Self::route(Arc::clone(&shared), link_rx, incoming_tx));
        (Self { shared }, incoming_rx)
    }

    async fn route(
        shared: Arc<DispatcherShared>,
        mut link_rx: mpsc::Receiver<Bytes>,
        incoming_tx: mpsc::Sender<ExchangeChannel>,
    ) {
        while let Some(frame) = link_rx.recv().await {
            let (key, message_type, payload) = match decode_frame(frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Dropping malformed exchange frame: {}", e);
                    continue;
                }
            };
            trace!("Exchange {:?} received {:?}", key, message_type);

            if shared.deliver(key, (message_type, payload.clone())) {
                continue;
            }
            if key.local || !opens_exchange(message_type) {
                debug!("Dropping {:?} for closed exchange {}", message_type, key.id);
                continue;
            }

            let mut inbox = Inbox::new();
            inbox.push_back((message_type, payload));
            shared.exchanges.insert(key, inbox);
            debug!("Peer opened exchange {} with {:?}", key.id, message_type);
            let channel = ExchangeChannel::new(Arc::clone(&shared), key);
            if incoming_tx.send(channel).await.is_err() {
                debug!("No listener for incoming exchanges");
            }
        }
        debug!("Exchange link closed");
        shared.shutdown();
    }

    /// Open a new exchange towards the peer
    pub fn open_exchange(&self) -> Result<ExchangeChannel> {
        if self.is_closed() {
            return Err(HandshakeError::ChannelClosed);
        }
        for _ in 0..=u16::MAX {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            let key = ExchangeKey { id, local: true };
            if let Entry::Vacant(vacant) = self.shared.exchanges.entry(key) {
                vacant.insert(Inbox::new());
                return Ok(ExchangeChannel::new(Arc::clone(&self.shared), key));
            }
        }
        Err(HandshakeError::Protocol("no free exchange id"))
    }

    /// Number of open exchanges
    pub fn open_exchanges(&self) -> usize {
        self.shared.exchanges.len()
    }

    /// Whether the link has closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// One exchange on an [`ExchangeDispatcher`] link
pub struct ExchangeChannel {
    shared: Arc<DispatcherShared>,
    key: ExchangeKey,
    recv_timeout: Option<Duration>,
}

impl ExchangeChannel {
    fn new(shared: Arc<DispatcherShared>, key: ExchangeKey) -> Self {
        Self {
            shared,
            key,
            recv_timeout: None,
        }
    }

    /// Bound every receive by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Exchange id
    pub fn exchange_id(&self) -> u16 {
        self.key.id
    }
}

#[async_trait]
impl HandshakeChannel for ExchangeChannel {
    async fn send(&mut self, message_type: MessageType, payload: Bytes) -> Result<()> {
        let frame = encode_frame(self.key, message_type, &payload);
        self.shared
            .link_tx
            .send(frame)
            .await
            .map_err(|_| HandshakeError::ChannelClosed)
    }

    async fn recv(&mut self) -> Result<(MessageType, Bytes)> {
        let waiter = {
            let mut inbox = self
                .shared
                .exchanges
                .get_mut(&self.key)
                .ok_or(HandshakeError::ChannelClosed)?;
            if let Some(message) = inbox.pop_front() {
                return Ok(message);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(HandshakeError::ChannelClosed);
            }
            self.shared.waiters.register(self.key)?
        };
        waiter.wait(self.recv_timeout).await
    }
}

impl Drop for ExchangeChannel {
    fn drop(&mut self) {
        self.shared.waiters.cancel(&self.key);
        self.shared.exchanges.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let registry: WaiterRegistry<u16, u32> = WaiterRegistry::new();
        let waiter = registry.register(7).unwrap();
        assert!(matches!(
            registry.register(7),
            Err(HandshakeError::WaiterBusy(_))
        ));
        registry.resolve(&7, 42).unwrap();
        assert_eq!(waiter.wait(None).await.unwrap(), 42);
        assert!(registry.is_empty());
        assert_eq!(registry.resolve(&7, 1), Err(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_up() {
        let registry: WaiterRegistry<u16, u32> = WaiterRegistry::new();
        let waiter = registry.register(1).unwrap();
        let err = waiter
            .wait(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
        assert_eq!(registry.len(), 0);
        assert!(registry.register(1).is_ok());
    }

    #[tokio::test]
    async fn test_cancel() {
        let registry: WaiterRegistry<u16, u32> = WaiterRegistry::new();
        let waiter = registry.register(3).unwrap();
        assert!(registry.cancel(&3));
        assert!(matches!(
            waiter.wait(None).await,
            Err(HandshakeError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_stale_waiter_drop_keeps_new_registration() {
        let registry: WaiterRegistry<u16, u32> = WaiterRegistry::new();
        let stale = registry.register(5).unwrap();
        registry.cancel(&5);
        let fresh = registry.register(5).unwrap();
        drop(stale);
        assert_eq!(registry.len(), 1);
        registry.resolve(&5, 9).unwrap();
        assert_eq!(fresh.wait(None).await.unwrap(), 9);
    }

    #[test]
    fn test_frame_roundtrip_flips_locality() {
        let frame = encode_frame(
            ExchangeKey { id: 0x1234, local: true },
            MessageType::Sigma1,
            b"abc",
        );
        assert_eq!(&frame[..4], &[0x01, 0x34, 0x12, 0x30]);
        let (key, message_type, payload) = decode_frame(frame).unwrap();
        assert_eq!(key, ExchangeKey { id: 0x1234, local: false });
        assert_eq!(message_type, MessageType::Sigma1);
        assert_eq!(&payload[..], b"abc");

        assert!(decode_frame(Bytes::from_static(&[0x01, 0x00])).is_err());
        assert!(decode_frame(Bytes::from_static(&[0x01, 0, 0, 0x99])).is_err());
    }

    #[tokio::test]
    async fn test_memory_channel() {
        let (mut a, mut b) = memory_channel_pair(4);
        a.send(MessageType::Pake1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let (message_type, payload) = b.recv().await.unwrap();
        assert_eq!(message_type, MessageType::Pake1);
        assert_eq!(&payload[..], b"x");
        drop(a);
        assert!(matches!(b.recv().await, Err(HandshakeError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dispatcher_exchanges() {
        let (left, right) = link_pair(16);
        let (alice, _alice_incoming) = ExchangeDispatcher::new(left.0, left.1);
        let (_bob, mut bob_incoming) = ExchangeDispatcher::new(right.0, right.1);

        let mut first = alice.open_exchange().unwrap();
        let mut second = alice.open_exchange().unwrap();
        first
            .send(MessageType::Sigma1, Bytes::from_static(b"one"))
            .await
            .unwrap();
        second
            .send(MessageType::PbkdfParamRequest, Bytes::from_static(b"two"))
            .await
            .unwrap();

        let mut bob_first = bob_incoming.recv().await.unwrap();
        let mut bob_second = bob_incoming.recv().await.unwrap();
        assert_eq!(bob_first.exchange_id(), first.exchange_id());
        assert_eq!(
            bob_second.recv().await.unwrap(),
            (MessageType::PbkdfParamRequest, Bytes::from_static(b"two"))
        );
        assert_eq!(
            bob_first.recv().await.unwrap(),
            (MessageType::Sigma1, Bytes::from_static(b"one"))
        );

        bob_second
            .send(MessageType::PbkdfParamResponse, Bytes::from_static(b"reply"))
            .await
            .unwrap();
        assert_eq!(
            second.recv().await.unwrap(),
            (MessageType::PbkdfParamResponse, Bytes::from_static(b"reply"))
        );
        assert_eq!(alice.open_exchanges(), 2);
        drop(first);
        assert_eq!(alice.open_exchanges(), 1);
    }

    #[tokio::test]
    async fn test_late_frame_for_dropped_exchange_is_discarded() {
        let (left, right) = link_pair(16);
        let (alice, _alice_incoming) = ExchangeDispatcher::new(left.0, left.1);
        let (_bob, mut bob_incoming) = ExchangeDispatcher::new(right.0, right.1);

        let mut first = alice.open_exchange().unwrap();
        first
            .send(MessageType::Sigma1, Bytes::from_static(b"one"))
            .await
            .unwrap();
        let bob_first = bob_incoming.recv().await.unwrap();
        drop(bob_first);

        first
            .send(MessageType::StatusReport, Bytes::from_static(b"late"))
            .await
            .unwrap();
        let mut second = alice.open_exchange().unwrap();
        second
            .send(MessageType::PbkdfParamRequest, Bytes::from_static(b"two"))
            .await
            .unwrap();

        let mut next = bob_incoming.recv().await.unwrap();
        assert_eq!(next.exchange_id(), second.exchange_id());
        assert_eq!(
            next.recv().await.unwrap(),
            (MessageType::PbkdfParamRequest, Bytes::from_static(b"two"))
        );
        assert!(bob_incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_link_close_wakes_receivers() {
        let ((tx, rx), (peer_tx, peer_rx)) = link_pair(4);
        let (dispatcher, _incoming) = ExchangeDispatcher::new(tx, rx);
        let mut exchange = dispatcher.open_exchange().unwrap();

        let pending = tokio::spawn(async move { exchange.recv().await });
        tokio::task::yield_now().await;
        drop(peer_tx);
        drop(peer_rx);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::ChannelClosed)));
        assert!(dispatcher.is_closed());
        assert!(dispatcher.open_exchange().is_err());
    }
}
