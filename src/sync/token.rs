//! Pairing tokens shown to the user on request of a peer

use crate::sync::SyncEvent;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// How long a displayed token stays valid
pub const TOKEN_TTL: Duration = Duration::from_secs(300);

struct ActiveToken {
    value: String,
    expires_at: Instant,
}

/// Issues and checks six-digit pairing tokens. A token is valid for
/// [`TOKEN_TTL`] and is consumed by the first successful check.
pub struct TokenService {
    current: Mutex<Option<ActiveToken>>,
    events: broadcast::Sender<SyncEvent>,
}

impl TokenService {
    pub fn new(events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            current: Mutex::new(None),
            events,
        }
    }

    /// Display a token, reusing the live one if any
    pub async fn show_token(&self, requested_by: &str) -> String {
        let mut current = self.current.lock().await;
        let now = Instant::now();
        let token = match current.as_ref() {
            Some(active) if active.expires_at > now => active.value.clone(),
            _ => {
                let value = format!("{:06}", rand::random_range(0..1_000_000u32));
                *current = Some(ActiveToken {
                    value: value.clone(),
                    expires_at: now + TOKEN_TTL,
                });
                value
            }
        };
        drop(current);

        info!("Pairing token for {}: {}", requested_by, token);
        let _ = self.events.send(SyncEvent::ShowToken {
            requested_by: requested_by.to_string(),
            token: token.clone(),
        });
        token
    }

    /// Check and consume a token
    pub async fn verify(&self, token: &str) -> bool {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(active) if active.expires_at <= Instant::now() => {
                debug!("Pairing token expired");
                *current = None;
                false
            }
            Some(active) if active.value == token.trim() => {
                *current = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_single_use() {
        let (tx, mut rx) = broadcast::channel(4);
        let tokens = TokenService::new(tx);

        let token = tokens.show_token("peer").await;
        assert_eq!(token.len(), 6);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::ShowToken { token: shown, .. } if shown == token
        ));

        assert!(!tokens.verify("not-it").await);
        assert!(tokens.verify(&token).await);
        assert!(!tokens.verify(&token).await);
    }

    #[tokio::test]
    async fn test_live_token_reused() {
        let (tx, _rx) = broadcast::channel(4);
        let tokens = TokenService::new(tx);
        let first = tokens.show_token("a").await;
        assert_eq!(tokens.show_token("b").await, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expires() {
        let (tx, _rx) = broadcast::channel(4);
        let tokens = TokenService::new(tx);
        let token = tokens.show_token("peer").await;

        tokio::time::advance(TOKEN_TTL + Duration::from_secs(1)).await;
        assert!(!tokens.verify(&token).await);
    }
}
