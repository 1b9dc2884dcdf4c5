//! Wire types for the peer HTTP API
//!
//! Every JSON response is an [`ApiResponse`] envelope tagged `ok` or `fail`.
//! Pull endpoints answer raw bytes on success and a `fail` envelope
//! otherwise.

use crate::crypto::{IdentityPublic, RatchetMessage};
use crate::session::BootstrapMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sync protocol version; peers must match to connect
pub const PROTOCOL_VERSION: u32 = 1;

/// Header naming the sending instance
pub const INSTANCE_HEADER: &str = "x-clipmesh-instance-id";

/// Header naming the instance a request is meant for
pub const TARGET_HEADER: &str = "x-clipmesh-target-id";

/// Failure codes carried in `fail` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The request reached an instance other than the one addressed
    NotMatchAppInstanceId,
    /// Envelope failed to decrypt or decode
    DecryptFail,
    /// No session with the sender
    NoSession,
    /// Sender identity is not trusted
    NotTrusted,
    /// Bootstrap named a one-time prekey that is gone
    PrekeyConsumed,
    /// Pairing token was wrong or expired
    TokenMismatch,
    /// Sender headers missing or malformed
    BadRequest,
    /// Requested resource does not exist
    NotFound,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotMatchAppInstanceId => "NOT_MATCH_APP_INSTANCE_ID",
            Self::DecryptFail => "DECRYPT_FAIL",
            Self::NoSession => "NO_SESSION",
            Self::NotTrusted => "NOT_TRUSTED",
            Self::PrekeyConsumed => "PREKEY_CONSUMED",
            Self::TokenMismatch => "TOKEN_MISMATCH",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Tagged response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiResponse<T> {
    Ok { data: T },
    Fail { code: ErrorCode, message: String },
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::Ok { data }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Fail {
            code,
            message: message.into(),
        }
    }
}

/// Descriptor an instance sends about itself in sync requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub instance_id: String,
    pub device_name: String,
    pub app_version: String,
    pub protocol_version: u32,
    pub platform: String,
    /// Port our own sync server listens on
    pub port: u16,
}

/// Authenticated liveness check over an existing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub sync_info: SyncInfo,
    /// `sync_info` encrypted with the session
    pub envelope: RatchetMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsTrustRequest {
    pub identity: IdentityPublic,
}

/// Session bootstrap; the embedded payload is the sender's [`SyncInfo`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub sync_info: SyncInfo,
    pub bootstrap: BootstrapMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRequest {
    pub token: String,
    pub identity: IdentityPublic,
}

/// What a [`NoticeRequest`] announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Exit,
    Remove,
}

/// Exit or removal notice, sealed with the session so it cannot be forged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeRequest {
    /// The [`NoticeKind`] encrypted with the session
    pub envelope: RatchetMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullFileRequest {
    pub resource_id: String,
    pub chunk_index: u64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStat {
    pub size: u64,
}
