//! PASE and CASE session establishment, resumption and secure sessions.
//!
//! This crate turns a passcode or a fabric's operational credentials into
//! an authenticated, encrypted session with a peer.
//!
//! ## Features
//!
//! - **PASE**: SPAKE2+ commissioning from a setup passcode ([`pase`])
//! - **CASE**: SIGMA exchange over operational certificates ([`case`])
//! - **Resumption**: short two-message CASE path from a cached secret
//! - **Secure sessions**: AEAD message protection with replay detection
//!   and late transport binding ([`SecureSession`])
//! - **Exchanges**: handshake channels, cancellable waiters and exchange
//!   multiplexing over one link ([`exchange`])
//! - **Session manager**: drivers with timeouts, session id allocation and
//!   cleanup when fabrics go away ([`SessionManager`])
//!
//! ## Handshake framing
//!
//! ```text
//! PASE: PbkdfParamRequest -> PbkdfParamResponse -> Pake1 -> Pake2 -> Pake3 -> StatusReport
//! CASE: Sigma1 -> Sigma2 -> Sigma3 -> StatusReport
//!       Sigma1 (resumption) -> Sigma2Resume -> StatusReport
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use pairing_session::{memory_channel_pair, SessionConfig, SessionManager};
//! use pairing_fabric::{FabricIndex, FabricManager, NodeId};
//! use std::sync::Arc;
//!
//! # async fn example(fabrics: Arc<FabricManager>) -> Result<(), pairing_session::HandshakeError> {
//! let manager = Arc::new(SessionManager::new(fabrics, SessionConfig::default()));
//! let _watcher = manager.watch_fabrics();
//!
//! let (mut channel, _peer) = memory_channel_pair(8);
//! let session = manager
//!     .case_connect(&mut channel, FabricIndex::new(1)?, NodeId(0x22))
//!     .await?;
//! println!("session {} to node {}", session.local_session_id(), session.peer_node_id());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod case;
pub mod error;
pub mod exchange;
pub mod manager;
pub mod messages;
pub mod params;
pub mod pase;
pub mod resumption;
pub mod secure;

pub use case::{CaseEstablished, CaseInitiator, CaseResponder, CaseState, Sigma1Reply};
pub use error::{HandshakeError, Result};
pub use exchange::{
    link_pair, memory_channel_pair, ExchangeChannel, ExchangeDispatcher, HandshakeChannel,
    MemoryChannel, Waiter, WaiterRegistry,
};
pub use manager::{SessionConfig, SessionManager};
pub use messages::{MessageType, PbkdfParameters, ProtocolCode, StatusReport};
pub use params::SessionParameters;
pub use pase::{PaseEstablished, PaseInitiator, PaseResponder, PaseState};
pub use resumption::{ResumptionRecord, ResumptionStore};
pub use secure::{SecureSession, SessionKeys, SessionKind, SessionRole, SessionSetup};
