//! Outbound calls to a peer's sync server

use crate::crypto::{IdentityPublic, PreKeyBundle};
use crate::sync::protocol::{
    ApiResponse, CreateSessionRequest, ErrorCode, HeartbeatRequest, IsTrustRequest,
    NoticeRequest, PullFileRequest, ResourceStat, TrustRequest, INSTANCE_HEADER, TARGET_HEADER,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::trace;

/// Client errors with user-facing messages
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused, reset or unreachable
    #[error("CM001: Network error talking to peer: {0}. Check that the device is online and on the same network.")]
    Transport(String),

    /// No answer within the request timeout
    #[error("CM002: Peer did not answer in time.")]
    Timeout,

    /// Peer answered with a `fail` envelope
    #[error("CM003: Peer rejected the request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// Response could not be decoded
    #[error("CM004: Unexpected response from peer: {0}. The devices may run incompatible versions.")]
    Decode(String),

    /// Body longer than the caller asked for
    #[error("CM005: Peer sent more than {limit} bytes.")]
    Oversized { limit: u64 },
}

/// Largest icon body accepted from a peer
pub const MAX_ICON_SIZE: u64 = 16 * 1024 * 1024;

impl ClientError {
    /// Network-level failure rather than a protocol answer
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }

    /// The address now belongs to another instance
    pub fn is_identity_mismatch(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                code: ErrorCode::NotMatchAppInstanceId,
                ..
            }
        )
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Address and expected identity of a peer's sync server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub addr: SocketAddr,
    pub instance_id: String,
}

impl PeerTarget {
    pub fn new(addr: SocketAddr, instance_id: impl Into<String>) -> Self {
        Self {
            addr,
            instance_id: instance_id.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Calls a peer's sync API
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// TCP reachability check, no protocol exchange
    async fn probe(&self, addr: SocketAddr) -> bool;

    async fn heartbeat(
        &self,
        target: &PeerTarget,
        request: &HeartbeatRequest,
    ) -> Result<(), ClientError>;

    /// Whether the peer trusts `identity` for handshakes
    async fn is_trust(
        &self,
        target: &PeerTarget,
        identity: &IdentityPublic,
    ) -> Result<bool, ClientError>;

    async fn pre_key_bundle(&self, target: &PeerTarget) -> Result<PreKeyBundle, ClientError>;

    async fn create_session(
        &self,
        target: &PeerTarget,
        request: &CreateSessionRequest,
    ) -> Result<(), ClientError>;

    /// Present the pairing token; the peer answers with its identity
    async fn trust(
        &self,
        target: &PeerTarget,
        token: &str,
        identity: &IdentityPublic,
    ) -> Result<IdentityPublic, ClientError>;

    /// Ask the peer to display its pairing token
    async fn show_token(&self, target: &PeerTarget) -> Result<(), ClientError>;

    async fn stat_file(
        &self,
        target: &PeerTarget,
        resource_id: &str,
    ) -> Result<ResourceStat, ClientError>;

    async fn pull_file(
        &self,
        target: &PeerTarget,
        request: &PullFileRequest,
    ) -> Result<Bytes, ClientError>;

    async fn pull_icon(&self, target: &PeerTarget, key: &str) -> Result<Bytes, ClientError>;

    async fn notify_exit(
        &self,
        target: &PeerTarget,
        request: &NoticeRequest,
    ) -> Result<(), ClientError>;

    async fn notify_remove(
        &self,
        target: &PeerTarget,
        request: &NoticeRequest,
    ) -> Result<(), ClientError>;
}

/// Timeouts applied by [`HttpPeerClient`]
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub probe: Duration,
    pub heartbeat: Duration,
    pub request: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_millis(800),
            heartbeat: Duration::from_secs(1),
            request: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed [`PeerClient`]
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
    local_id: String,
    timeouts: ClientTimeouts,
}

impl HttpPeerClient {
    pub fn new(local_id: impl Into<String>, timeouts: ClientTimeouts) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.request)
            .no_proxy()
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self {
            http,
            local_id: local_id.into(),
            timeouts,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        target: &PeerTarget,
        path: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        trace!("{} {} -> {}", method, path, target.instance_id);
        self.http
            .request(method, target.url(path))
            .header(INSTANCE_HEADER, &self.local_id)
            .header(TARGET_HEADER, &target.instance_id)
            .timeout(timeout)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = builder.send().await.map_err(ClientError::from_reqwest)?;
        let envelope: ApiResponse<T> = response.json().await.map_err(ClientError::from_reqwest)?;
        match envelope {
            ApiResponse::Ok { data } => Ok(data),
            ApiResponse::Fail { code, message } => Err(ClientError::Rejected { code, message }),
        }
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        target: &PeerTarget,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let builder = self
            .request(reqwest::Method::POST, target, path, self.timeouts.request)
            .json(body);
        self.send(builder).await
    }

    async fn bytes(
        &self,
        builder: reqwest::RequestBuilder,
        limit: u64,
    ) -> Result<Bytes, ClientError> {
        let mut response = builder.send().await.map_err(ClientError::from_reqwest)?;
        if response.status().is_success() {
            if response.content_length().is_some_and(|len| len > limit) {
                return Err(ClientError::Oversized { limit });
            }
            let mut body = BytesMut::new();
            while let Some(chunk) = response.chunk().await.map_err(ClientError::from_reqwest)? {
                if body.len() as u64 + chunk.len() as u64 > limit {
                    return Err(ClientError::Oversized { limit });
                }
                body.extend_from_slice(&chunk);
            }
            return Ok(body.freeze());
        }
        match response.json::<ApiResponse<()>>().await {
            Ok(ApiResponse::Fail { code, message }) => Err(ClientError::Rejected { code, message }),
            Ok(ApiResponse::Ok { .. }) => Err(ClientError::Decode(
                "error status with ok envelope".to_string(),
            )),
            Err(e) => Err(ClientError::from_reqwest(e)),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn probe(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.timeouts.probe, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn heartbeat(
        &self,
        target: &PeerTarget,
        request: &HeartbeatRequest,
    ) -> Result<(), ClientError> {
        let builder = self
            .request(
                reqwest::Method::POST,
                target,
                "/sync/heartbeat",
                self.timeouts.heartbeat,
            )
            .json(request);
        self.send(builder).await
    }

    async fn is_trust(
        &self,
        target: &PeerTarget,
        identity: &IdentityPublic,
    ) -> Result<bool, ClientError> {
        let body = IsTrustRequest {
            identity: identity.clone(),
        };
        self.post(target, "/sync/is-trust", &body).await
    }

    async fn pre_key_bundle(&self, target: &PeerTarget) -> Result<PreKeyBundle, ClientError> {
        let builder = self.request(
            reqwest::Method::GET,
            target,
            "/sync/pre-key-bundle",
            self.timeouts.request,
        );
        self.send(builder).await
    }

    async fn create_session(
        &self,
        target: &PeerTarget,
        request: &CreateSessionRequest,
    ) -> Result<(), ClientError> {
        self.post(target, "/sync/create-session", request).await
    }

    async fn trust(
        &self,
        target: &PeerTarget,
        token: &str,
        identity: &IdentityPublic,
    ) -> Result<IdentityPublic, ClientError> {
        let body = TrustRequest {
            token: token.to_string(),
            identity: identity.clone(),
        };
        self.post(target, "/sync/trust", &body).await
    }

    async fn show_token(&self, target: &PeerTarget) -> Result<(), ClientError> {
        self.post(target, "/sync/show-token", &()).await
    }

    async fn stat_file(
        &self,
        target: &PeerTarget,
        resource_id: &str,
    ) -> Result<ResourceStat, ClientError> {
        let builder = self.request(
            reqwest::Method::GET,
            target,
            &format!("/pull/stat/{}", resource_id),
            self.timeouts.request,
        );
        self.send(builder).await
    }

    async fn pull_file(
        &self,
        target: &PeerTarget,
        request: &PullFileRequest,
    ) -> Result<Bytes, ClientError> {
        let builder = self
            .request(reqwest::Method::POST, target, "/pull/file", self.timeouts.request)
            .json(request);
        self.bytes(builder, request.chunk_size).await
    }

    async fn pull_icon(&self, target: &PeerTarget, key: &str) -> Result<Bytes, ClientError> {
        let builder = self.request(
            reqwest::Method::GET,
            target,
            &format!("/pull/icon/{}", key),
            self.timeouts.request,
        );
        self.bytes(builder, MAX_ICON_SIZE).await
    }

    async fn notify_exit(
        &self,
        target: &PeerTarget,
        request: &NoticeRequest,
    ) -> Result<(), ClientError> {
        self.post(target, "/sync/notify-exit", request).await
    }

    async fn notify_remove(
        &self,
        target: &PeerTarget,
        request: &NoticeRequest,
    ) -> Result<(), ClientError> {
        self.post(target, "/sync/notify-remove", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_error_classification() {
        assert!(ClientError::Timeout.is_transport());
        assert!(ClientError::Transport("refused".into()).is_transport());

        let mismatch = ClientError::Rejected {
            code: ErrorCode::NotMatchAppInstanceId,
            message: String::new(),
        };
        assert!(mismatch.is_identity_mismatch());
        assert!(!mismatch.is_transport());
        assert!(mismatch.to_string().starts_with("CM003"));
    }

    #[test]
    fn test_ipv6_url() {
        let target = PeerTarget::new("[fe80::1]:7000".parse().unwrap(), "x");
        assert_eq!(target.url("/sync/heartbeat"), "http://[fe80::1]:7000/sync/heartbeat");
    }

    #[tokio::test]
    async fn test_probe() {
        let client = HttpPeerClient::new("me", ClientTimeouts::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(client.probe(addr).await);

        drop(listener);
        assert!(!client.probe(addr).await);
    }

    async fn serve_bodies() -> SocketAddr {
        use axum::body::Body;
        use axum::routing::{get, post};
        use futures_util::stream;

        let app = axum::Router::new()
            .route("/pull/file", post(|| async { vec![7u8; 64] }))
            .route(
                "/pull/icon/:key",
                get(|| async {
                    let parts = stream::iter(
                        (0..5).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![1u8; 8]))),
                    );
                    Body::from_stream(parts)
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    #[tokio::test]
    async fn test_body_longer_than_chunk_rejected() {
        let addr = serve_bodies().await;
        let client = HttpPeerClient::new("me", ClientTimeouts::default()).unwrap();
        let target = PeerTarget::new(addr, "peer");

        let mut request = PullFileRequest {
            resource_id: "a.bin".to_string(),
            chunk_index: 0,
            chunk_size: 16,
        };
        let err = client.pull_file(&target, &request).await.unwrap_err();
        assert!(matches!(err, ClientError::Oversized { limit: 16 }));
        assert!(err.to_string().starts_with("CM005"));

        request.chunk_size = 64;
        let body = client.pull_file(&target, &request).await.unwrap();
        assert_eq!(body.len(), 64);
    }

    #[tokio::test]
    async fn test_streamed_body_limit() {
        let addr = serve_bodies().await;
        let client = HttpPeerClient::new("me", ClientTimeouts::default()).unwrap();
        let target = PeerTarget::new(addr, "peer");

        let body = client.pull_icon(&target, "app.png").await.unwrap();
        assert_eq!(body.len(), 40);

        let builder = client.request(
            reqwest::Method::GET,
            &target,
            "/pull/icon/app.png",
            Duration::from_secs(5),
        );
        let err = client.bytes(builder, 20).await.unwrap_err();
        assert!(matches!(err, ClientError::Oversized { limit: 20 }));
    }
}
