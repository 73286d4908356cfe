//! Session manager: drives handshakes over channels and owns live sessions.

use crate::case::{CaseEstablished, CaseInitiator, CaseResponder, Sigma1Reply};
use crate::exchange::HandshakeChannel;
use crate::messages::{MessageType, PbkdfParameters, StatusReport, RANDOM_LEN};
use crate::params::SessionParameters;
use crate::pase::{PaseEstablished, PaseInitiator, PaseResponder};
use crate::resumption::ResumptionStore;
use crate::secure::{SecureSession, SessionKind, SessionRole, SessionSetup};
use crate::{HandshakeError, Result};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use pairing_crypto::spake2p::PasscodeVerifier;
use pairing_fabric::{FabricError, FabricEvent, FabricIndex, FabricManager, NodeId};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default handshake deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of initiator randoms remembered for replay detection
pub const DEFAULT_RANDOM_CACHE: usize = 128;

/// Session manager settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whole-handshake deadline
    pub handshake_timeout: Duration,
    /// Timing hints advertised to peers
    pub local_params: SessionParameters,
    /// Initiator randoms remembered by responders
    pub random_cache_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            local_params: SessionParameters::default(),
            random_cache_size: DEFAULT_RANDOM_CACHE,
        }
    }
}

/// Bounded FIFO set of recently seen initiator randoms
struct RandomCache {
    capacity: usize,
    order: VecDeque<[u8; RANDOM_LEN]>,
    seen: HashSet<[u8; RANDOM_LEN]>,
}

impl RandomCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// False when the random was already seen
    fn insert(&mut self, random: [u8; RANDOM_LEN]) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(random) {
            return false;
        }
        self.order.push_back(random);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Receive the next message, requiring `expected`; a status report in its
/// place ends the handshake with the peer's status
async fn expect<C: HandshakeChannel + ?Sized>(
    channel: &mut C,
    expected: MessageType,
) -> Result<Bytes> {
    let (actual, payload) = channel.recv().await?;
    if actual == expected {
        return Ok(payload);
    }
    if actual == MessageType::StatusReport {
        return Err(HandshakeError::PeerStatus(StatusReport::decode(&payload)?));
    }
    Err(HandshakeError::UnexpectedMessage { expected, actual })
}

/// Runs PASE and CASE handshakes and tracks the resulting sessions
pub struct SessionManager {
    fabrics: Arc<FabricManager>,
    resumption: ResumptionStore,
    sessions: DashMap<u16, Arc<SecureSession>>,
    session_ids: DashSet<u16>,
    next_session_id: AtomicU16,
    seen_randoms: Mutex<RandomCache>,
    config: SessionConfig,
}

impl SessionManager {
    /// New manager over a fabric table
    pub fn new(fabrics: Arc<FabricManager>, config: SessionConfig) -> Self {
        Self {
            fabrics,
            resumption: ResumptionStore::new(),
            sessions: DashMap::new(),
            session_ids: DashSet::new(),
            next_session_id: AtomicU16::new(rand::random::<u16>().max(1)),
            seen_randoms: Mutex::new(RandomCache::new(config.random_cache_size)),
            config,
        }
    }

    /// Fabric table
    pub fn fabrics(&self) -> &Arc<FabricManager> {
        &self.fabrics
    }

    /// Resumption records
    pub fn resumption(&self) -> &ResumptionStore {
        &self.resumption
    }

    /// Settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Reserve a non-zero session id not used by any pending or live session
    pub fn allocate_session_id(&self) -> Result<u16> {
        for _ in 0..=u16::MAX {
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && self.session_ids.insert(id) {
                return Ok(id);
            }
        }
        Err(HandshakeError::SessionIdsExhausted)
    }

    fn release_session_id(&self, id: u16) {
        self.session_ids.remove(&id);
    }

    /// Live session by local session id
    pub fn session(&self, local_session_id: u16) -> Option<Arc<SecureSession>> {
        self.sessions.get(&local_session_id).map(|s| Arc::clone(&s))
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close and forget a session
    pub async fn remove_session(&self, local_session_id: u16) -> Option<Arc<SecureSession>> {
        let (_, session) = self.sessions.remove(&local_session_id)?;
        self.release_session_id(local_session_id);
        session.close().await;
        debug!("Removed session {}", local_session_id);
        Some(session)
    }

    async fn check_initiator_random(&self, random: Option<&[u8; RANDOM_LEN]>) -> Result<()> {
        let random = random.ok_or(HandshakeError::InvalidState("missing initiator random"))?;
        if self.seen_randoms.lock().await.insert(*random) {
            Ok(())
        } else {
            Err(HandshakeError::ReplayedRandom)
        }
    }

    fn register(&self, setup: SessionSetup) -> Arc<SecureSession> {
        let id = setup.local_session_id;
        let session = Arc::new(SecureSession::new(setup));
        self.sessions.insert(id, Arc::clone(&session));
        session
    }

    async fn deadline<T>(&self, handshake: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.handshake_timeout;
        match tokio::time::timeout(limit, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HandshakeError::Timeout(limit)),
        }
    }

    /// On failure tell the peer where the protocol allows and give the
    /// session id back
    async fn settle<C, T>(&self, channel: &mut C, local_session_id: u16, outcome: Result<T>) -> Result<T>
    where
        C: HandshakeChannel + ?Sized,
    {
        if let Err(e) = &outcome {
            warn!("Handshake for session {} failed: {}", local_session_id, e);
            if let Some(report) = e.status_report() {
                if let Err(send_err) = channel.send(MessageType::StatusReport, report.encode()).await {
                    debug!("Could not send status report: {}", send_err);
                }
            }
            self.release_session_id(local_session_id);
        }
        outcome
    }

    /// Commission a device over PASE using its passcode
    pub async fn pase_commission<C>(
        &self,
        channel: &mut C,
        passcode: u32,
    ) -> Result<Arc<SecureSession>>
    where
        C: HandshakeChannel + ?Sized,
    {
        let local_session_id = self.allocate_session_id()?;
        let outcome = match PaseInitiator::new(passcode, local_session_id, self.config.local_params) {
            Ok(mut pase) => {
                self.deadline(drive_pase_initiator(&mut *channel, &mut pase))
                    .await
            }
            Err(e) => Err(e),
        };
        let established = self.settle(channel, local_session_id, outcome).await?;
        Ok(self.register_pase(SessionRole::Initiator, established))
    }

    /// Accept a PASE commissioning attempt as the device
    pub async fn pase_accept<C>(
        &self,
        channel: &mut C,
        verifier: PasscodeVerifier,
        parameters: PbkdfParameters,
    ) -> Result<Arc<SecureSession>>
    where
        C: HandshakeChannel + ?Sized,
    {
        let local_session_id = self.allocate_session_id()?;
        let outcome = match PaseResponder::new(
            verifier,
            parameters,
            local_session_id,
            self.config.local_params,
        ) {
            Ok(mut pase) => {
                self.deadline(self.drive_pase_responder(&mut *channel, &mut pase))
                    .await
            }
            Err(e) => Err(e),
        };
        let established = self.settle(channel, local_session_id, outcome).await?;
        Ok(self.register_pase(SessionRole::Responder, established))
    }

    fn register_pase(&self, role: SessionRole, established: PaseEstablished) -> Arc<SecureSession> {
        info!(
            "PASE session {} registered ({:?})",
            established.local_session_id, role
        );
        self.register(SessionSetup {
            role,
            kind: SessionKind::Pase,
            local_session_id: established.local_session_id,
            peer_session_id: established.peer_session_id,
            local_node_id: NodeId(0),
            peer_node_id: NodeId(0),
            keys: established.keys,
            peer_params: established.peer_params,
        })
    }

    async fn drive_pase_responder<C>(
        &self,
        channel: &mut C,
        pase: &mut PaseResponder,
    ) -> Result<PaseEstablished>
    where
        C: HandshakeChannel + ?Sized,
    {
        let request = expect(channel, MessageType::PbkdfParamRequest).await?;
        let response = pase.handle_pbkdf_request(&request)?;
        if let Err(e) = self.check_initiator_random(pase.initiator_random()).await {
            pase.fail();
            return Err(e);
        }
        channel.send(MessageType::PbkdfParamResponse, response).await?;

        let pake1 = expect(channel, MessageType::Pake1).await?;
        channel
            .send(MessageType::Pake2, pase.handle_pake1(&pake1)?)
            .await?;

        let pake3 = expect(channel, MessageType::Pake3).await?;
        let (status, established) = pase.handle_pake3(&pake3)?;
        channel.send(MessageType::StatusReport, status).await?;
        Ok(established)
    }

    /// Open an operational session to `peer_node_id` on a local fabric,
    /// resuming when a record for that peer is cached
    pub async fn case_connect<C>(
        &self,
        channel: &mut C,
        fabric_index: FabricIndex,
        peer_node_id: NodeId,
    ) -> Result<Arc<SecureSession>>
    where
        C: HandshakeChannel + ?Sized,
    {
        let fabric = self
            .fabrics
            .fabric(fabric_index)
            .await
            .ok_or(HandshakeError::Fabric(FabricError::Unknown(fabric_index)))?;
        let local_session_id = self.allocate_session_id()?;
        let record = self.resumption.get_by_peer(fabric_index, peer_node_id);
        let mut case = CaseInitiator::new(
            fabric,
            peer_node_id,
            local_session_id,
            self.config.local_params,
            record,
        );

        let outcome = self
            .deadline(drive_case_initiator(&mut *channel, &mut case))
            .await;
        let established = self.settle(channel, local_session_id, outcome).await?;
        self.register_case(SessionRole::Initiator, established).await
    }

    /// Answer an incoming CASE handshake
    pub async fn case_accept<C>(&self, channel: &mut C) -> Result<Arc<SecureSession>>
    where
        C: HandshakeChannel + ?Sized,
    {
        let local_session_id = self.allocate_session_id()?;
        let mut case = CaseResponder::new(local_session_id, self.config.local_params);

        let outcome = self
            .deadline(self.drive_case_responder(&mut *channel, &mut case))
            .await;
        let established = self.settle(channel, local_session_id, outcome).await?;
        self.register_case(SessionRole::Responder, established).await
    }

    async fn drive_case_responder<C>(
        &self,
        channel: &mut C,
        case: &mut CaseResponder,
    ) -> Result<CaseEstablished>
    where
        C: HandshakeChannel + ?Sized,
    {
        let sigma1 = expect(channel, MessageType::Sigma1).await?;
        let fabrics = self.fabrics.fabrics().await;
        let reply = case.handle_sigma1(&sigma1, &fabrics, &self.resumption)?;
        if let Err(e) = self.check_initiator_random(case.initiator_random()).await {
            case.fail();
            return Err(e);
        }

        match reply {
            Sigma1Reply::Sigma2(sigma2) => {
                channel.send(MessageType::Sigma2, sigma2).await?;
                let sigma3 = expect(channel, MessageType::Sigma3).await?;
                let (status, established) = case.handle_sigma3(&sigma3)?;
                channel.send(MessageType::StatusReport, status).await?;
                Ok(established)
            }
            Sigma1Reply::Sigma2Resume(resume) => {
                channel.send(MessageType::Sigma2Resume, resume).await?;
                let status = expect(channel, MessageType::StatusReport).await?;
                case.handle_status(&status)
            }
        }
    }

    async fn register_case(
        &self,
        role: SessionRole,
        established: CaseEstablished,
    ) -> Result<Arc<SecureSession>> {
        let CaseEstablished {
            keys,
            local_session_id,
            peer_session_id,
            fabric_index,
            local_node_id,
            peer_node_id,
            peer_params,
            resumption,
            resumed,
        } = established;

        // The fabric may have gone away while the handshake ran
        if self.fabrics.fabric(fabric_index).await.is_none() {
            self.release_session_id(local_session_id);
            return Err(HandshakeError::Fabric(FabricError::Unknown(fabric_index)));
        }

        self.resumption.insert(resumption);
        info!(
            "CASE session {} registered with node {} on fabric {} ({:?}, resumed: {})",
            local_session_id, peer_node_id, fabric_index, role, resumed
        );
        Ok(self.register(SessionSetup {
            role,
            kind: SessionKind::Case {
                fabric_index,
                resumed,
            },
            local_session_id,
            peer_session_id,
            local_node_id,
            peer_node_id,
            keys,
            peer_params,
        }))
    }

    /// Drop sessions and resumption records of a fabric that went away.
    /// Returns the number of sessions closed.
    pub async fn handle_fabric_event(&self, event: FabricEvent) -> usize {
        match event {
            FabricEvent::Removed(index) | FabricEvent::Revoked(index) => {
                self.drop_fabric(index).await
            }
            FabricEvent::Added(_) | FabricEvent::Updated(_) => 0,
        }
    }

    async fn drop_fabric(&self, index: FabricIndex) -> usize {
        let records = self.resumption.remove_fabric(index);
        let ids: Vec<u16> = self
            .sessions
            .iter()
            .filter(|s| s.fabric_index() == Some(index))
            .map(|s| *s.key())
            .collect();
        for id in &ids {
            self.remove_session(*id).await;
        }
        if records > 0 || !ids.is_empty() {
            info!(
                "Fabric {} gone: closed {} sessions, dropped {} resumption records",
                index,
                ids.len(),
                records
            );
        }
        ids.len()
    }

    /// Drop sessions and records of every fabric no longer in the table
    pub async fn prune_orphans(&self) -> usize {
        let live: HashSet<FabricIndex> =
            self.fabrics.fabrics().await.iter().map(|f| f.index()).collect();
        let mut closed = 0;
        for index in (FabricIndex::MIN..=FabricIndex::MAX).filter_map(|i| FabricIndex::new(i).ok()) {
            if !live.contains(&index) {
                closed += self.drop_fabric(index).await;
            }
        }
        closed
    }

    /// Follow fabric table events until the manager or the table goes away
    pub fn watch_fabrics(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.fabrics.subscribe();
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => {
                        manager.handle_fabric_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} fabric events, pruning orphaned sessions", missed);
                        manager.prune_orphans().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Fabric watcher stopped");
        })
    }
}

async fn drive_pase_initiator<C>(channel: &mut C, pase: &mut PaseInitiator) -> Result<PaseEstablished>
where
    C: HandshakeChannel + ?Sized,
{
    channel
        .send(MessageType::PbkdfParamRequest, pase.start()?)
        .await?;

    let response = expect(channel, MessageType::PbkdfParamResponse).await?;
    channel
        .send(MessageType::Pake1, pase.handle_pbkdf_response(&response)?)
        .await?;

    let pake2 = expect(channel, MessageType::Pake2).await?;
    channel
        .send(MessageType::Pake3, pase.handle_pake2(&pake2)?)
        .await?;

    let status = expect(channel, MessageType::StatusReport).await?;
    pase.handle_status(&status)
}

async fn drive_case_initiator<C>(channel: &mut C, case: &mut CaseInitiator) -> Result<CaseEstablished>
where
    C: HandshakeChannel + ?Sized,
{
    channel.send(MessageType::Sigma1, case.start()?).await?;

    let (message_type, payload) = channel.recv().await?;
    match message_type {
        MessageType::Sigma2 => {
            let sigma3 = case.handle_sigma2(&payload)?;
            channel.send(MessageType::Sigma3, sigma3).await?;
            let status = expect(channel, MessageType::StatusReport).await?;
            case.handle_status(&status)
        }
        MessageType::Sigma2Resume => {
            let (status, established) = case.handle_sigma2_resume(&payload)?;
            channel.send(MessageType::StatusReport, status).await?;
            Ok(established)
        }
        MessageType::StatusReport => {
            case.fail();
            Err(HandshakeError::PeerStatus(StatusReport::decode(&payload)?))
        }
        actual => {
            case.fail();
            Err(HandshakeError::UnexpectedMessage {
                expected: MessageType::Sigma2,
                actual,
            })
        }
    }
}
