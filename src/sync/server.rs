//! Sync server answering peers' requests
//!
//! Every request names its sender in [`INSTANCE_HEADER`]; a request whose
//! [`TARGET_HEADER`] names another instance is refused with
//! `NOT_MATCH_APP_INSTANCE_ID` so the caller learns its cached address is
//! stale.

use crate::session::{SecureChannel, SessionError};
use crate::sync::protocol::{
    ApiResponse, CreateSessionRequest, ErrorCode, HeartbeatRequest, IsTrustRequest, NoticeKind,
    NoticeRequest, PullFileRequest, ResourceStat, SyncInfo, TrustRequest, INSTANCE_HEADER,
    TARGET_HEADER,
};
use crate::sync::token::TokenService;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest chunk a peer may request
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Hooks into the peer registry, raised after a request was accepted
#[async_trait]
pub trait ServerCallbacks: Send + Sync {
    async fn on_heartbeat(&self, sender: &str, info: &SyncInfo, remote: IpAddr);
    async fn on_session_created(&self, sender: &str, info: &SyncInfo, remote: IpAddr);
    async fn on_peer_exit(&self, sender: &str);
    async fn on_peer_removed(&self, sender: &str);
}

/// Source of the bytes served by the pull endpoints
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Total size of a file resource
    async fn stat(&self, resource_id: &str) -> io::Result<u64>;
    /// Up to `len` bytes starting at `offset`
    async fn read_chunk(&self, resource_id: &str, offset: u64, len: u64) -> io::Result<Bytes>;
    async fn read_icon(&self, key: &str) -> io::Result<Bytes>;
}

/// Serves files from one directory and icons from another
#[derive(Debug, Clone)]
pub struct FsResourceProvider {
    files: PathBuf,
    icons: PathBuf,
}

impl FsResourceProvider {
    pub fn new(files: PathBuf, icons: PathBuf) -> Self {
        Self { files, icons }
    }

    fn resolve(dir: &std::path::Path, name: &str) -> io::Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid resource name: {}", name),
            ));
        }
        Ok(dir.join(name))
    }
}

#[async_trait]
impl ResourceProvider for FsResourceProvider {
    async fn stat(&self, resource_id: &str) -> io::Result<u64> {
        let path = Self::resolve(&self.files, resource_id)?;
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn read_chunk(&self, resource_id: &str, offset: u64, len: u64) -> io::Result<Bytes> {
        let path = Self::resolve(&self.files, resource_id)?;
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len.min(MAX_CHUNK_SIZE) as usize);
        file.take(len).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn read_icon(&self, key: &str) -> io::Result<Bytes> {
        let path = Self::resolve(&self.icons, key)?;
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }
}

type Reply<T> = Json<ApiResponse<T>>;

fn ok<T>(data: T) -> Reply<T> {
    Json(ApiResponse::ok(data))
}

fn fail<T>(code: ErrorCode, message: impl Into<String>) -> Reply<T> {
    Json(ApiResponse::fail(code, message))
}

fn fail_response(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Response {
    (status, fail::<()>(code, message)).into_response()
}

struct ServerState {
    local_id: String,
    channel: Arc<SecureChannel>,
    tokens: Arc<TokenService>,
    callbacks: Arc<dyn ServerCallbacks>,
    resources: Arc<dyn ResourceProvider>,
}

impl ServerState {
    /// Sender id, after checking the request was meant for us
    fn authorize(&self, headers: &HeaderMap) -> Result<String, (ErrorCode, String)> {
        let sender = headers
            .get(INSTANCE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or((ErrorCode::BadRequest, "missing sender".to_string()))?;

        if let Some(target) = headers.get(TARGET_HEADER).and_then(|v| v.to_str().ok()) {
            if target != self.local_id {
                debug!("Request from {} addressed to {}", sender, target);
                return Err((
                    ErrorCode::NotMatchAppInstanceId,
                    format!("this is {}, not {}", self.local_id, target),
                ));
            }
        }
        Ok(sender.to_string())
    }

    /// Pull endpoints serve only peers holding a session with us
    async fn authorize_pull(&self, headers: &HeaderMap) -> Result<String, Response> {
        let sender = self
            .authorize(headers)
            .map_err(|(code, message)| fail_response(StatusCode::BAD_REQUEST, code, message))?;
        match self.channel.has_session(&sender).await {
            Ok(true) => Ok(sender),
            Ok(false) => Err(fail_response(
                StatusCode::FORBIDDEN,
                ErrorCode::NoSession,
                "no session",
            )),
            Err(e) => Err(fail_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::Internal,
                e.to_string(),
            )),
        }
    }
}

impl ServerState {
    /// Open a sealed notice and check it announces `kind`
    async fn open_notice(
        &self,
        sender: &str,
        req: &NoticeRequest,
        kind: NoticeKind,
    ) -> Result<(), (ErrorCode, String)> {
        let plaintext = match self.channel.decrypt(sender, &req.envelope).await {
            Ok(plaintext) => plaintext,
            Err(SessionError::NoSession(_)) => {
                return Err((ErrorCode::NoSession, "no session".to_string()))
            }
            Err(e) => return Err((ErrorCode::DecryptFail, e.to_string())),
        };
        match serde_json::from_slice::<NoticeKind>(&plaintext) {
            Ok(sealed) if sealed == kind => Ok(()),
            _ => Err((
                ErrorCode::DecryptFail,
                "envelope does not match notice".to_string(),
            )),
        }
    }
}

macro_rules! authorized {
    ($state:expr, $headers:expr) => {
        match $state.authorize(&$headers) {
            Ok(sender) => sender,
            Err((code, message)) => return fail(code, message),
        }
    };
}

/// HTTP front of the sync protocol
#[derive(Clone)]
pub struct SyncServer {
    state: Arc<ServerState>,
}

impl SyncServer {
    pub fn new(
        local_id: impl Into<String>,
        channel: Arc<SecureChannel>,
        tokens: Arc<TokenService>,
        callbacks: Arc<dyn ServerCallbacks>,
        resources: Arc<dyn ResourceProvider>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                local_id: local_id.into(),
                channel,
                tokens,
                callbacks,
                resources,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/sync/heartbeat", post(heartbeat))
            .route("/sync/is-trust", post(is_trust))
            .route("/sync/pre-key-bundle", get(pre_key_bundle))
            .route("/sync/create-session", post(create_session))
            .route("/sync/trust", post(trust))
            .route("/sync/show-token", post(show_token))
            .route("/sync/notify-exit", post(notify_exit))
            .route("/sync/notify-remove", post(notify_remove))
            .route("/pull/stat/:resource_id", get(stat_file))
            .route("/pull/file", post(pull_file))
            .route("/pull/icon/:key", get(pull_icon))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        info!("Sync server listening on {}", listener.local_addr()?);
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    }
}

async fn heartbeat(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Reply<()> {
    let sender = authorized!(state, headers);
    if req.sync_info.instance_id != sender {
        return fail(ErrorCode::BadRequest, "sync info names another instance");
    }

    match state.channel.decrypt(&sender, &req.envelope).await {
        Ok(plaintext) => match serde_json::from_slice::<SyncInfo>(&plaintext) {
            Ok(inner) if inner == req.sync_info => {}
            _ => return fail(ErrorCode::DecryptFail, "envelope does not match sync info"),
        },
        Err(SessionError::NoSession(_)) => return fail(ErrorCode::NoSession, "no session"),
        Err(e) => {
            debug!("Heartbeat from {} rejected: {}", sender, e);
            return fail(ErrorCode::DecryptFail, e.to_string());
        }
    }

    state
        .callbacks
        .on_heartbeat(&sender, &req.sync_info, remote.ip())
        .await;
    ok(())
}

async fn is_trust(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<IsTrustRequest>,
) -> Reply<bool> {
    let sender = authorized!(state, headers);
    match state.channel.store().trusted_identity(&sender).await {
        Ok(trusted) => ok(trusted.as_ref() == Some(&req.identity)),
        Err(e) => fail(ErrorCode::Internal, e.to_string()),
    }
}

async fn pre_key_bundle(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Reply<crate::crypto::PreKeyBundle> {
    let _sender = authorized!(state, headers);
    match state.channel.store().prekey_bundle().await {
        Ok(bundle) => ok(bundle),
        Err(e) => fail(ErrorCode::Internal, e.to_string()),
    }
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Reply<()> {
    let sender = authorized!(state, headers);
    if req.sync_info.instance_id != sender {
        return fail(ErrorCode::BadRequest, "sync info names another instance");
    }

    let plaintext = match state.channel.decrypt_bootstrap(&sender, &req.bootstrap).await {
        Ok(plaintext) => plaintext,
        Err(e) => {
            warn!("Session bootstrap from {} rejected: {}", sender, e);
            let code = match e {
                SessionError::UntrustedIdentity(_) => ErrorCode::NotTrusted,
                SessionError::PreKeyConsumed(_) | SessionError::UnknownPreKey(_) => {
                    ErrorCode::PrekeyConsumed
                }
                _ => ErrorCode::DecryptFail,
            };
            return fail(code, e.to_string());
        }
    };

    match serde_json::from_slice::<SyncInfo>(&plaintext) {
        Ok(inner) if inner == req.sync_info => {}
        _ => {
            if let Err(e) = state.channel.remove_session(&sender).await {
                warn!("Failed to drop bogus session with {}: {}", sender, e);
            }
            return fail(ErrorCode::DecryptFail, "bootstrap does not match sync info");
        }
    }

    state
        .callbacks
        .on_session_created(&sender, &req.sync_info, remote.ip())
        .await;
    ok(())
}

async fn trust(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<TrustRequest>,
) -> Reply<crate::crypto::IdentityPublic> {
    let sender = authorized!(state, headers);
    if !state.tokens.verify(&req.token).await {
        return fail(ErrorCode::TokenMismatch, "pairing token does not match");
    }

    let store = state.channel.store();
    if let Err(e) = store.trust_identity(&sender, &req.identity).await {
        return fail(ErrorCode::Internal, e.to_string());
    }
    info!(
        "Paired with {} ({})",
        sender,
        req.identity.fingerprint()
    );
    match store.identity().await {
        Ok(local) => ok(local.public()),
        Err(e) => fail(ErrorCode::Internal, e.to_string()),
    }
}

async fn show_token(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Reply<()> {
    let sender = authorized!(state, headers);
    state.tokens.show_token(&sender).await;
    ok(())
}

async fn notify_exit(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<NoticeRequest>,
) -> Reply<()> {
    let sender = authorized!(state, headers);
    if let Err((code, message)) = state.open_notice(&sender, &req, NoticeKind::Exit).await {
        debug!("Exit notice from {} rejected: {}", sender, message);
        return fail(code, message);
    }
    debug!("{} is exiting", sender);
    state.callbacks.on_peer_exit(&sender).await;
    ok(())
}

async fn notify_remove(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<NoticeRequest>,
) -> Reply<()> {
    let sender = authorized!(state, headers);
    if let Err((code, message)) = state.open_notice(&sender, &req, NoticeKind::Remove).await {
        debug!("Removal notice from {} rejected: {}", sender, message);
        return fail(code, message);
    }
    info!("{} removed us", sender);
    state.callbacks.on_peer_removed(&sender).await;
    ok(())
}

async fn stat_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(resource_id): Path<String>,
) -> Response {
    if let Err(response) = state.authorize_pull(&headers).await {
        return response;
    }
    match state.resources.stat(&resource_id).await {
        Ok(size) => ok(ResourceStat { size }).into_response(),
        Err(e) => fail::<()>(ErrorCode::NotFound, e.to_string()).into_response(),
    }
}

async fn pull_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<PullFileRequest>,
) -> Response {
    if let Err(response) = state.authorize_pull(&headers).await {
        return response;
    }
    if req.chunk_size == 0 || req.chunk_size > MAX_CHUNK_SIZE {
        return fail_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest,
            format!("chunk size {} out of range", req.chunk_size),
        );
    }
    let Some(offset) = req.chunk_index.checked_mul(req.chunk_size) else {
        return fail_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, "offset overflow");
    };

    match state
        .resources
        .read_chunk(&req.resource_id, offset, req.chunk_size)
        .await
    {
        Ok(bytes) => bytes_response(bytes),
        Err(e) => fail_response(StatusCode::NOT_FOUND, ErrorCode::NotFound, e.to_string()),
    }
}

async fn pull_icon(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if let Err(response) = state.authorize_pull(&headers).await {
        return response;
    }
    match state.resources.read_icon(&key).await {
        Ok(bytes) => bytes_response(bytes),
        Err(e) => fail_response(StatusCode::NOT_FOUND, ErrorCode::NotFound, e.to_string()),
    }
}

fn bytes_response(bytes: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response()
}
