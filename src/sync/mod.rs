//! Peer synchronization: connection state machines, the peer HTTP API and
//! the registry tying discovery to both
//!
//! One [`SyncHandler`] per tracked peer runs a resolve loop that probes the
//! peer, keeps an authenticated session alive and reports its
//! [`ConnectionState`]. [`SyncManager`] owns the handlers and answers the
//! callbacks raised by the local [`SyncServer`].

pub mod backoff;
pub mod client;
pub mod handler;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod state;
pub mod token;

use crate::discovery::HostCandidate;
use crate::session::{SecureChannel, SessionError};
use crate::storage::{Database, StorageError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub use client::{ClientError, ClientTimeouts, HttpPeerClient, PeerClient, PeerTarget};
pub use handler::SyncHandler;
pub use manager::SyncManager;
pub use protocol::{ErrorCode, SyncInfo, PROTOCOL_VERSION};
pub use server::{FsResourceProvider, ResourceProvider, ServerCallbacks, SyncServer};
pub use state::{ConnectionState, PeerRuntimeInfo};
pub use token::TokenService;

/// Events published to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A peer moved to a new connection state
    StateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    /// A peer asked us to display our pairing token
    ShowToken { requested_by: String, token: String },
    /// A peer stopped being tracked
    PeerRemoved { peer_id: String },
}

/// Sync layer errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// No handler or discovery record for the peer
    #[error("CM010: Unknown device '{0}'. Make sure it is online and discoverable on your network.")]
    UnknownPeer(String),

    /// Peer is on the blacklist
    #[error("CM011: Device '{0}' is blocked. Run 'unblock {0}' first.")]
    Blocked(String),

    /// No reachable address for the peer
    #[error("CM012: Device '{0}' is not reachable right now.")]
    Unreachable(String),

    /// Handler was shut down
    #[error("CM013: Device '{0}' is no longer tracked.")]
    Closed(String),

    /// Request to the peer failed
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Session failure
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding failure
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Tunables of the resolve loop
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Delay between cycles while connected
    pub base_refresh: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            base_refresh: backoff::BASE_REFRESH,
        }
    }
}

/// Everything a handler needs besides its own peer record
pub struct SyncContext {
    /// What we tell peers about ourselves
    pub local: SyncInfo,
    /// Our interface addresses, used to prefer same-subnet candidates
    pub local_hosts: Vec<HostCandidate>,
    pub channel: Arc<SecureChannel>,
    pub client: Arc<dyn PeerClient>,
    pub db: Arc<Database>,
    pub events: broadcast::Sender<SyncEvent>,
    pub settings: SyncSettings,
}

impl SyncContext {
    /// Publish an event; having no subscriber is fine
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}
