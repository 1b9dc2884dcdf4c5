//! Per-peer connection state machine
//!
//! Each tracked peer gets one [`SyncHandler`]. Its background loop runs a
//! resolve cycle, then sleeps until the recommended refresh time published
//! on a watch channel. The cycle itself always runs under the handler's
//! resolve mutex, so user-triggered resolves and the loop never overlap.
//!
//! ```text
//! Disconnected --probe ok--> Connecting --heartbeat/handshake ok--> Connected
//!      ^                        |   |
//!      |  transport failure     |   +--peer requires pairing--> Unverified
//!      +------------------------+   +--session rejected-------> Unmatched
//! ```

use crate::discovery::{HostCandidate, PeerRecord};
use crate::sync::client::{ClientError, PeerTarget};
use crate::sync::protocol::{
    CreateSessionRequest, HeartbeatRequest, NoticeKind, NoticeRequest, PROTOCOL_VERSION,
};
use crate::sync::state::{ConnectionState, PeerRuntimeInfo};
use crate::sync::{backoff, Result, SyncContext, SyncError, SyncEvent};
use chrono::Utc;
use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of the protocol step of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connected,
    /// Address now answers as another instance
    Moved,
    Unreachable,
    Rejected,
    Unverified,
}

impl Step {
    fn from_error(err: &ClientError) -> Self {
        if err.is_identity_mismatch() {
            Self::Moved
        } else if err.is_transport() {
            Self::Unreachable
        } else {
            Self::Rejected
        }
    }
}

#[derive(Debug, Default)]
struct ResolveState {
    failures: u32,
    token_requested: bool,
}

struct HandlerInner {
    peer_id: String,
    ctx: Arc<SyncContext>,
    info: RwLock<PeerRuntimeInfo>,
    resolve: Mutex<ResolveState>,
    refresh_at: watch::Sender<Instant>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// Connection state machine for one peer
#[derive(Clone)]
pub struct SyncHandler {
    inner: Arc<HandlerInner>,
}

impl std::fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandler")
            .field("peer_id", &self.inner.peer_id)
            .finish()
    }
}

impl SyncHandler {
    fn new(ctx: Arc<SyncContext>, info: PeerRuntimeInfo) -> Self {
        let (refresh_at, _) = watch::channel(Instant::now());
        Self {
            inner: Arc::new(HandlerInner {
                peer_id: info.instance_id.clone(),
                ctx,
                info: RwLock::new(info),
                resolve: Mutex::new(ResolveState::default()),
                refresh_at,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a handler and start its resolve loop
    pub fn spawn(ctx: Arc<SyncContext>, info: PeerRuntimeInfo) -> Self {
        let handler = Self::new(ctx, info);
        let runner = handler.clone();
        tokio::spawn(async move { runner.run().await });
        handler
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Snapshot of the runtime record
    pub async fn info(&self) -> PeerRuntimeInfo {
        self.inner.info.read().await.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.info.read().await.state
    }

    /// Whether `notify_exit` or `clear_context` ran
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ask the loop to resolve as soon as possible
    pub fn trigger(&self) {
        self.inner.refresh_at.send_replace(Instant::now());
    }

    async fn run(self) {
        let mut refresh_rx = self.inner.refresh_at.subscribe();
        debug!("Resolve loop started for {}", self.inner.peer_id);

        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }
            self.resolve(false).await;

            let deadline = *refresh_rx.borrow_and_update();
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
                changed = refresh_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Resolve loop stopped for {}", self.inner.peer_id);
    }

    /// Run a cycle now, ignoring the recommended refresh time
    pub async fn force_resolve(&self) -> ConnectionState {
        self.resolve(true).await
    }

    async fn resolve(&self, force: bool) -> ConnectionState {
        let mut resolve = self.inner.resolve.lock().await;
        self.resolve_locked(&mut resolve, force).await
    }

    async fn resolve_locked(&self, resolve: &mut ResolveState, force: bool) -> ConnectionState {
        if self.is_closed() {
            return self.state().await;
        }
        if !force && *self.inner.refresh_at.borrow() > Instant::now() {
            return self.state().await;
        }

        let end = self.run_cycle(resolve).await;
        let base = self.inner.ctx.settings.base_refresh;
        let delay = match end {
            ConnectionState::Connected => {
                resolve.failures = 0;
                base
            }
            // Waiting on the user, not failing
            ConnectionState::Unverified => base,
            _ => {
                resolve.failures = resolve.failures.saturating_add(1);
                backoff::next_delay(false, resolve.failures, base)
            }
        };
        if end != ConnectionState::Unverified {
            resolve.token_requested = false;
        }

        debug!(
            "Resolved {} as {}; next in {:?} (failures: {})",
            self.inner.peer_id, end, delay, resolve.failures
        );
        self.inner.refresh_at.send_replace(Instant::now() + delay);
        end
    }

    async fn run_cycle(&self, resolve: &mut ResolveState) -> ConnectionState {
        let info = self.info().await;
        let peer_id = &self.inner.peer_id;

        if !info.compatible {
            warn!(
                "Peer {} speaks protocol {}, we speak {}",
                peer_id, info.protocol_version, PROTOCOL_VERSION
            );
            return self.set_state(ConnectionState::Disconnected).await;
        }

        if info.state == ConnectionState::Unmatched {
            debug!("Rebuilding session with {}", peer_id);
            if let Err(e) = self.inner.ctx.channel.remove_session(peer_id).await {
                error!("Failed to drop stale session with {}: {}", peer_id, e);
            }
        }

        if info.state == ConnectionState::Disconnected || info.connect_host.is_none() {
            match self.probe(&info).await {
                Some(host) => {
                    let state = self
                        .update(|i| {
                            i.connect_host = Some(host);
                            i.state = ConnectionState::Connecting;
                        })
                        .await;
                    if state != ConnectionState::Connecting {
                        return state;
                    }
                }
                None => {
                    debug!("No candidate of {} answered", peer_id);
                    return self.set_state(ConnectionState::Disconnected).await;
                }
            }
        } else if matches!(
            info.state,
            ConnectionState::Unverified | ConnectionState::Unmatched
        ) {
            self.set_state(ConnectionState::Connecting).await;
        }

        let Some(target) = self.current_target().await else {
            return self.set_state(ConnectionState::Disconnected).await;
        };

        let step = match self.inner.ctx.channel.has_session(peer_id).await {
            Ok(true) => self.heartbeat(&target).await,
            Ok(false) => self.handshake(&target, resolve).await,
            Err(e) => {
                error!("Failed to look up session with {}: {}", peer_id, e);
                Step::Unreachable
            }
        };

        match step {
            Step::Connected => self.set_state(ConnectionState::Connected).await,
            Step::Moved => {
                info!("Address of {} now answers as another instance", peer_id);
                self.update(|i| {
                    i.connect_host = None;
                    i.state = ConnectionState::Disconnected;
                })
                .await
            }
            Step::Unreachable => self.set_state(ConnectionState::Disconnected).await,
            Step::Rejected => self.set_state(ConnectionState::Unmatched).await,
            Step::Unverified => self.set_state(ConnectionState::Unverified).await,
        }
    }

    /// Probe all candidates at once, preferring ones on a local subnet
    async fn probe(&self, info: &PeerRuntimeInfo) -> Option<HostCandidate> {
        let ctx = &self.inner.ctx;
        let mut candidates = info.hosts.clone();
        candidates.sort_by_key(|c| !ctx.local_hosts.iter().any(|local| local.contains(c.ip)));

        let probes = candidates.iter().map(|candidate| {
            let addr = SocketAddr::new(candidate.ip, info.port);
            async move { (*candidate, ctx.client.probe(addr).await) }
        });
        join_all(probes)
            .await
            .into_iter()
            .find(|(_, reachable)| *reachable)
            .map(|(candidate, _)| candidate)
    }

    async fn heartbeat(&self, target: &PeerTarget) -> Step {
        let ctx = &self.inner.ctx;
        let payload = match serde_json::to_vec(&ctx.local) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode sync info: {}", e);
                return Step::Rejected;
            }
        };
        let envelope = match ctx.channel.encrypt(&self.inner.peer_id, &payload).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Cannot encrypt heartbeat for {}: {}", self.inner.peer_id, e);
                return Step::Rejected;
            }
        };

        let request = HeartbeatRequest {
            sync_info: ctx.local.clone(),
            envelope,
        };
        match ctx.client.heartbeat(target, &request).await {
            Ok(()) => Step::Connected,
            Err(e) => {
                debug!("Heartbeat to {} failed: {}", self.inner.peer_id, e);
                Step::from_error(&e)
            }
        }
    }

    async fn handshake(&self, target: &PeerTarget, resolve: &mut ResolveState) -> Step {
        let ctx = &self.inner.ctx;
        let peer_id = &self.inner.peer_id;
        let store = ctx.channel.store();

        let local = match store.identity().await {
            Ok(local) => local,
            Err(e) => {
                error!("Local identity unavailable: {}", e);
                return Step::Rejected;
            }
        };

        match ctx.client.is_trust(target, &local.public()).await {
            Ok(true) => {}
            Ok(false) => {
                self.request_token(target, resolve).await;
                return Step::Unverified;
            }
            Err(e) => return Step::from_error(&e),
        }

        let bundle = match ctx.client.pre_key_bundle(target).await {
            Ok(bundle) => bundle,
            Err(e) => return Step::from_error(&e),
        };
        match store.trusted_identity(peer_id).await {
            Ok(Some(trusted)) if trusted == bundle.identity => {}
            Ok(Some(_)) => {
                warn!("Identity of {} changed; pairing required", peer_id);
                self.request_token(target, resolve).await;
                return Step::Unverified;
            }
            Ok(None) => {
                info!("{} trusts us but was never paired here", peer_id);
                self.request_token(target, resolve).await;
                return Step::Unverified;
            }
            Err(e) => {
                error!("Failed to read trust for {}: {}", peer_id, e);
                return Step::Rejected;
            }
        }

        let payload = match serde_json::to_vec(&ctx.local) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode sync info: {}", e);
                return Step::Rejected;
            }
        };
        let (pending, bootstrap) = match ctx.channel.initiate(peer_id, &bundle, &payload).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Cannot build session with {}: {}", peer_id, e);
                return Step::Rejected;
            }
        };

        // Stored before the peer learns of it, so its first heartbeat can be decrypted
        if let Err(e) = ctx.channel.commit(peer_id, pending).await {
            error!("Failed to store session with {}: {}", peer_id, e);
            return Step::Rejected;
        }

        let request = CreateSessionRequest {
            sync_info: ctx.local.clone(),
            bootstrap,
        };
        match ctx.client.create_session(target, &request).await {
            Ok(()) => Step::Connected,
            Err(e) => {
                debug!("Session create with {} failed: {}", peer_id, e);
                if let Err(e) = ctx.channel.remove_session(peer_id).await {
                    warn!("Failed to drop session with {}: {}", peer_id, e);
                }
                Step::from_error(&e)
            }
        }
    }

    /// Ask the peer to show its token, once per entry into Unverified
    async fn request_token(&self, target: &PeerTarget, resolve: &mut ResolveState) {
        if resolve.token_requested {
            return;
        }
        resolve.token_requested = true;
        if let Err(e) = self.inner.ctx.client.show_token(target).await {
            debug!("Peer {} could not show its token: {}", self.inner.peer_id, e);
        }
    }

    async fn set_state(&self, state: ConnectionState) -> ConnectionState {
        self.update(|i| i.state = state).await
    }

    /// Persist a modified record, then expose it
    async fn update<F: FnOnce(&mut PeerRuntimeInfo)>(&self, f: F) -> ConnectionState {
        let mut info = self.inner.info.write().await;
        let mut next = info.clone();
        f(&mut next);
        if next == *info {
            return info.state;
        }
        next.modified_at = Utc::now();

        if let Err(e) = self.inner.ctx.db.save_peer(&self.inner.peer_id, &next).await {
            error!("Failed to persist state of {}: {}", self.inner.peer_id, e);
            return info.state;
        }

        let previous = info.state;
        *info = next;
        let state = info.state;
        drop(info);

        if previous != state {
            info!("Peer {}: {} -> {}", self.inner.peer_id, previous, state);
            self.inner.ctx.publish(SyncEvent::StateChanged {
                peer_id: self.inner.peer_id.clone(),
                state,
            });
        }
        state
    }

    async fn current_target(&self) -> Option<PeerTarget> {
        self.info()
            .await
            .connect_address()
            .map(|addr| PeerTarget::new(addr, self.inner.peer_id.clone()))
    }

    /// Cached resolved address, resolving once under the mutex when absent
    pub async fn connect_host_address(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.info().await.connect_address() {
            return Some(addr);
        }

        let mut resolve = self.inner.resolve.lock().await;
        if let Some(addr) = self.info().await.connect_address() {
            return Some(addr);
        }
        self.resolve_locked(&mut resolve, true).await;
        self.info().await.connect_address()
    }

    /// Target for requests, resolving if necessary
    pub async fn connect_target(&self) -> Result<PeerTarget> {
        self.connect_host_address()
            .await
            .map(|addr| PeerTarget::new(addr, self.inner.peer_id.clone()))
            .ok_or_else(|| SyncError::Unreachable(self.inner.peer_id.clone()))
    }

    /// Merge a newer discovery record and resolve soon
    pub async fn update_from_discovery(&self, record: &PeerRecord) {
        self.update(|i| i.apply_record(record, PROTOCOL_VERSION))
            .await;
        self.trigger();
    }

    /// Ask the peer to display its pairing token
    pub async fn show_token(&self) -> Result<()> {
        self.ensure_open()?;
        let target = self.connect_target().await?;
        self.inner.ctx.client.show_token(&target).await?;
        Ok(())
    }

    /// Complete pairing with the token the peer displays
    pub async fn trust_by_token(&self, token: &str) -> Result<ConnectionState> {
        self.ensure_open()?;
        let target = self.connect_target().await?;
        let store = self.inner.ctx.channel.store();
        let local = store.identity().await?;

        let remote = self
            .inner
            .ctx
            .client
            .trust(&target, token, &local.public())
            .await?;
        store.trust_identity(&self.inner.peer_id, &remote).await?;
        info!(
            "Paired with {} ({})",
            self.inner.peer_id,
            remote.fingerprint()
        );

        Ok(self.force_resolve().await)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Closed(self.inner.peer_id.clone()));
        }
        Ok(())
    }

    /// Seal a notice with our session so the peer knows it came from us
    async fn seal_notice(&self, kind: NoticeKind) -> Option<NoticeRequest> {
        let payload = serde_json::to_vec(&kind).ok()?;
        match self.inner.ctx.channel.encrypt(&self.inner.peer_id, &payload).await {
            Ok(envelope) => Some(NoticeRequest { envelope }),
            Err(e) => {
                debug!("Cannot seal {:?} notice for {}: {}", kind, self.inner.peer_id, e);
                None
            }
        }
    }

    /// Tell a connected peer we are leaving and stop the loop. One-shot.
    pub async fn notify_exit(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let info = self.info().await;
        if info.state == ConnectionState::Connected {
            if let Some(addr) = info.connect_address() {
                if let Some(notice) = self.seal_notice(NoticeKind::Exit).await {
                    let target = PeerTarget::new(addr, self.inner.peer_id.clone());
                    if let Err(e) = self.inner.ctx.client.notify_exit(&target, &notice).await {
                        debug!("Exit notice to {} failed: {}", self.inner.peer_id, e);
                    }
                }
            }
        }
    }

    /// Stop tracking the peer and discard everything known about it. One-shot.
    pub async fn clear_context(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        // Wait out an in-flight cycle so it cannot re-save the record
        let _resolve = self.inner.resolve.lock().await;
        let ctx = &self.inner.ctx;
        let peer_id = &self.inner.peer_id;

        // Sealed while the session still exists, sent once it is gone so the
        // peer cannot rebuild a session with us
        let notice = self.seal_notice(NoticeKind::Remove).await;
        if let Err(e) = ctx.channel.remove_session(peer_id).await {
            error!("Failed to drop session with {}: {}", peer_id, e);
        }
        if let Err(e) = ctx.channel.store().remove_trusted_identity(peer_id).await {
            error!("Failed to drop trust for {}: {}", peer_id, e);
        }

        if let (Some(addr), Some(notice)) = (self.info().await.connect_address(), notice) {
            let target = PeerTarget::new(addr, peer_id.clone());
            if let Err(e) = ctx.client.notify_remove(&target, &notice).await {
                debug!("Removal notice to {} failed: {}", peer_id, e);
            }
        }
        if let Err(e) = ctx.db.delete_peer(peer_id).await {
            error!("Failed to delete record of {}: {}", peer_id, e);
        }

        info!("Stopped tracking {}", peer_id);
        ctx.publish(SyncEvent::PeerRemoved {
            peer_id: peer_id.clone(),
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::{IdentityPublic, PreKeyBundle};
    use crate::session::{SecureChannel, SecureSessionStore};
    use crate::storage::{Database, MemorySecretStore};
    use crate::sync::client::PeerClient;
    use crate::sync::protocol::{ErrorCode, PullFileRequest, ResourceStat, SyncInfo};
    use crate::sync::SyncSettings;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::broadcast;

    pub(crate) const PAIRING_TOKEN: &str = "246810";

    /// In-process stand-in for a remote instance that knows us as "local"
    pub(crate) struct FakePeer {
        pub channel: Arc<SecureChannel>,
        pub reachable: AtomicBool,
        pub forced_error: std::sync::Mutex<Option<ErrorCode>>,
        pub probe_delay: Duration,
        pub probes: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub token_requests: AtomicUsize,
    }

    impl FakePeer {
        pub async fn new(probe_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                channel: channel().await,
                reachable: AtomicBool::new(true),
                forced_error: std::sync::Mutex::new(None),
                probe_delay,
                probes: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                token_requests: AtomicUsize::new(0),
            })
        }

        fn check(&self) -> std::result::Result<(), ClientError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("connection refused".into()));
            }
            match *self.forced_error.lock().unwrap() {
                Some(code) => Err(ClientError::Rejected {
                    code,
                    message: "forced".into(),
                }),
                None => Ok(()),
            }
        }

        fn rejected(code: ErrorCode, e: impl ToString) -> ClientError {
            ClientError::Rejected {
                code,
                message: e.to_string(),
            }
        }
    }

    #[async_trait]
    impl PeerClient for FakePeer {
        async fn probe(&self, _addr: SocketAddr) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.probe_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.reachable.load(Ordering::SeqCst)
        }

        async fn heartbeat(
            &self,
            _target: &PeerTarget,
            request: &HeartbeatRequest,
        ) -> std::result::Result<(), ClientError> {
            self.check()?;
            self.channel
                .decrypt("local", &request.envelope)
                .await
                .map(|_| ())
                .map_err(|e| Self::rejected(ErrorCode::DecryptFail, e))
        }

        async fn is_trust(
            &self,
            _target: &PeerTarget,
            identity: &IdentityPublic,
        ) -> std::result::Result<bool, ClientError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(ClientError::Timeout);
            }
            let trusted = self.channel.store().trusted_identity("local").await.unwrap();
            Ok(trusted.as_ref() == Some(identity))
        }

        async fn pre_key_bundle(
            &self,
            _target: &PeerTarget,
        ) -> std::result::Result<PreKeyBundle, ClientError> {
            Ok(self.channel.store().prekey_bundle().await.unwrap())
        }

        async fn create_session(
            &self,
            _target: &PeerTarget,
            request: &CreateSessionRequest,
        ) -> std::result::Result<(), ClientError> {
            self.check()?;
            self.channel
                .decrypt_bootstrap("local", &request.bootstrap)
                .await
                .map(|_| ())
                .map_err(|e| Self::rejected(ErrorCode::DecryptFail, e))
        }

        async fn trust(
            &self,
            _target: &PeerTarget,
            token: &str,
            identity: &IdentityPublic,
        ) -> std::result::Result<IdentityPublic, ClientError> {
            if token != PAIRING_TOKEN {
                return Err(Self::rejected(ErrorCode::TokenMismatch, "bad token"));
            }
            let store = self.channel.store();
            store.trust_identity("local", identity).await.unwrap();
            Ok(store.identity().await.unwrap().public())
        }

        async fn show_token(&self, _target: &PeerTarget) -> std::result::Result<(), ClientError> {
            self.token_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stat_file(
            &self,
            _target: &PeerTarget,
            _resource_id: &str,
        ) -> std::result::Result<ResourceStat, ClientError> {
            Err(ClientError::Decode("not served".into()))
        }

        async fn pull_file(
            &self,
            _target: &PeerTarget,
            _request: &PullFileRequest,
        ) -> std::result::Result<Bytes, ClientError> {
            Err(ClientError::Decode("not served".into()))
        }

        async fn pull_icon(
            &self,
            _target: &PeerTarget,
            _key: &str,
        ) -> std::result::Result<Bytes, ClientError> {
            Err(ClientError::Decode("not served".into()))
        }

        async fn notify_exit(
            &self,
            _target: &PeerTarget,
            _request: &NoticeRequest,
        ) -> std::result::Result<(), ClientError> {
            Ok(())
        }

        async fn notify_remove(
            &self,
            _target: &PeerTarget,
            _request: &NoticeRequest,
        ) -> std::result::Result<(), ClientError> {
            Ok(())
        }
    }

    async fn channel() -> Arc<SecureChannel> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let store = SecureSessionStore::new(db, &MemorySecretStore::new()).unwrap();
        Arc::new(SecureChannel::new(Arc::new(store)))
    }

    pub(crate) async fn context(client: Arc<dyn PeerClient>) -> Arc<SyncContext> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let store = SecureSessionStore::new(db.clone(), &MemorySecretStore::new()).unwrap();
        let (events, _) = broadcast::channel(64);
        Arc::new(SyncContext {
            local: SyncInfo {
                instance_id: "local".to_string(),
                device_name: "local".to_string(),
                app_version: "0.1.0".to_string(),
                protocol_version: PROTOCOL_VERSION,
                platform: "linux".to_string(),
                port: 7000,
            },
            local_hosts: Vec::new(),
            channel: Arc::new(SecureChannel::new(Arc::new(store))),
            client,
            db,
            events,
            settings: SyncSettings::default(),
        })
    }

    pub(crate) fn remote_record() -> PeerRecord {
        PeerRecord {
            instance_id: "remote".to_string(),
            device_name: "remote".to_string(),
            app_version: "0.1.0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            platform: "linux".to_string(),
            hosts: vec!["127.0.0.1/8".parse().unwrap()],
            port: 7001,
        }
    }

    async fn pair(ctx: &SyncContext, peer: &FakePeer) {
        let local = ctx.channel.store().identity().await.unwrap().public();
        let remote = peer.channel.store().identity().await.unwrap().public();
        ctx.channel.store().trust_identity("remote", &remote).await.unwrap();
        peer.channel.store().trust_identity("local", &local).await.unwrap();
    }

    fn handler(ctx: &Arc<SyncContext>) -> SyncHandler {
        SyncHandler::new(
            ctx.clone(),
            PeerRuntimeInfo::from_record(&remote_record(), PROTOCOL_VERSION),
        )
    }

    fn drain_states(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_paired_peers_connect_through_connecting() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let mut rx = ctx.events.subscribe();

        let handler = handler(&ctx);
        assert_eq!(handler.force_resolve().await, ConnectionState::Connected);
        assert_eq!(
            drain_states(&mut rx),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        // Next cycle is a heartbeat over the new session
        assert_eq!(handler.force_resolve().await, ConnectionState::Connected);
        let stored: PeerRuntimeInfo = ctx.db.load_peer("remote").await.unwrap().unwrap();
        assert_eq!(stored.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_identity_mismatch_clears_host() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let handler = handler(&ctx);
        assert_eq!(handler.force_resolve().await, ConnectionState::Connected);

        *peer.forced_error.lock().unwrap() = Some(ErrorCode::NotMatchAppInstanceId);
        assert_eq!(handler.force_resolve().await, ConnectionState::Disconnected);
        assert_eq!(handler.info().await.connect_host, None);
    }

    #[tokio::test]
    async fn test_rejected_session_is_rebuilt() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let handler = handler(&ctx);
        handler.force_resolve().await;

        // Peer lost its session
        peer.channel.remove_session("local").await.unwrap();
        assert_eq!(handler.force_resolve().await, ConnectionState::Unmatched);
        assert_eq!(handler.force_resolve().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_refused_bootstrap_leaves_no_session() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let handler = handler(&ctx);

        *peer.forced_error.lock().unwrap() = Some(ErrorCode::PrekeyConsumed);
        assert_eq!(handler.force_resolve().await, ConnectionState::Unmatched);
        assert!(!ctx.channel.has_session("remote").await.unwrap());

        *peer.forced_error.lock().unwrap() = None;
        assert_eq!(handler.force_resolve().await, ConnectionState::Connected);
        assert!(ctx.channel.has_session("remote").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_backs_off() {
        let peer = FakePeer::new(Duration::ZERO).await;
        peer.reachable.store(false, Ordering::SeqCst);
        let ctx = context(peer.clone()).await;
        let handler = handler(&ctx);

        let before = Instant::now();
        assert_eq!(handler.force_resolve().await, ConnectionState::Disconnected);
        let first = *handler.inner.refresh_at.borrow() - before;
        handler.force_resolve().await;
        let second = *handler.inner.refresh_at.borrow() - before;

        assert!(first >= Duration::from_millis(1_040));
        assert!(second > first);
        assert_eq!(handler.inner.resolve.lock().await.failures, 2);
    }

    #[tokio::test]
    async fn test_unpaired_peer_is_unverified_until_token() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        let handler = handler(&ctx);

        assert_eq!(handler.force_resolve().await, ConnectionState::Unverified);
        assert_eq!(handler.force_resolve().await, ConnectionState::Unverified);
        assert_eq!(peer.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(handler.inner.resolve.lock().await.failures, 0);

        assert!(matches!(
            handler.trust_by_token("000000").await,
            Err(SyncError::Client(ClientError::Rejected {
                code: ErrorCode::TokenMismatch,
                ..
            }))
        ));
        assert_eq!(
            handler.trust_by_token(PAIRING_TOKEN).await.unwrap(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_changed_identity_requires_pairing() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let impostor = channel().await;
        let other = impostor.store().identity().await.unwrap().public();
        ctx.channel.store().trust_identity("remote", &other).await.unwrap();

        let handler = handler(&ctx);
        assert_eq!(handler.force_resolve().await, ConnectionState::Unverified);
        assert!(!ctx.channel.has_session("remote").await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_time_gates_unforced_resolve() {
        let peer = FakePeer::new(Duration::ZERO).await;
        peer.reachable.store(false, Ordering::SeqCst);
        let ctx = context(peer.clone()).await;
        let handler = handler(&ctx);

        handler.force_resolve().await;
        assert_eq!(peer.probes.load(Ordering::SeqCst), 1);
        handler.resolve(false).await;
        assert_eq!(peer.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_resolve_never_overlaps_loop() {
        let peer = FakePeer::new(Duration::from_millis(50)).await;
        peer.reachable.store(false, Ordering::SeqCst);
        let ctx = context(peer.clone()).await;
        let handler = SyncHandler::spawn(
            ctx.clone(),
            PeerRuntimeInfo::from_record(&remote_record(), PROTOCOL_VERSION),
        );

        let forced = (0..4).map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.trigger();
                handler.force_resolve().await
            })
        });
        for task in forced {
            assert_eq!(task.await.unwrap(), ConnectionState::Disconnected);
        }

        assert!(peer.probes.load(Ordering::SeqCst) >= 4);
        assert_eq!(peer.max_in_flight.load(Ordering::SeqCst), 1);
        handler.notify_exit().await;
    }

    #[tokio::test]
    async fn test_connect_host_address_resolves_once() {
        let peer = FakePeer::new(Duration::from_millis(30)).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let handler = handler(&ctx);

        let (a, b) = tokio::join!(handler.connect_host_address(), handler.connect_host_address());
        let expected: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        assert_eq!(a, Some(expected));
        assert_eq!(b, Some(expected));
        assert_eq!(peer.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_context_is_one_shot() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        pair(&ctx, &peer).await;
        let handler = handler(&ctx);
        handler.force_resolve().await;
        let mut rx = ctx.events.subscribe();

        handler.clear_context().await;
        handler.clear_context().await;
        handler.notify_exit().await;

        assert!(!ctx.channel.has_session("remote").await.unwrap());
        assert!(ctx
            .channel
            .store()
            .trusted_identity("remote")
            .await
            .unwrap()
            .is_none());
        assert!(ctx
            .db
            .load_peer::<PeerRuntimeInfo>("remote")
            .await
            .unwrap()
            .is_none());

        let mut removed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::PeerRemoved { .. }) {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);

        // Closed handlers no longer run cycles
        let probes = peer.probes.load(Ordering::SeqCst);
        handler.force_resolve().await;
        assert_eq!(peer.probes.load(Ordering::SeqCst), probes);
        assert!(matches!(
            handler.show_token().await,
            Err(SyncError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_incompatible_peer_stays_disconnected() {
        let peer = FakePeer::new(Duration::ZERO).await;
        let ctx = context(peer.clone()).await;
        let mut record = remote_record();
        record.protocol_version = PROTOCOL_VERSION + 1;
        let handler = SyncHandler::new(
            ctx.clone(),
            PeerRuntimeInfo::from_record(&record, PROTOCOL_VERSION),
        );

        assert_eq!(handler.force_resolve().await, ConnectionState::Disconnected);
        assert_eq!(peer.probes.load(Ordering::SeqCst), 0);
    }
}
