//! Credential sources consulted before every connect attempt.

use std::sync::RwLock;

use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use tracing::warn;

use super::TransportError;

/// Supplies the token presented when opening a link. `None` means the
/// user is not authenticated and no attempt should be made.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Option<String>;

    /// Whether a token can be produced, without spending one. Sources
    /// that mint single-use tokens override this.
    async fn has_token(&self) -> bool {
        self.token().await.is_some()
    }
}

/// A fixed token the host can swap or clear (e.g. on logout).
#[derive(Debug, Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: RwLock::new(Some(token.into())) }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

/// Exchanges a session cookie for a one-time websocket ticket on every
/// attempt, via `POST {base_url}/api/auth/ws-ticket`.
pub struct SessionTicketSource {
    client: reqwest::Client,
    base_url: String,
    session_token: String,
}

impl SessionTicketSource {
    #[must_use]
    pub fn new(base_url: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            session_token: session_token.into(),
        }
    }

    /// Fetch one ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Ticket`] on HTTP failure or a missing `ticket` field.
    pub async fn fetch_ticket(&self) -> Result<String, TransportError> {
        let mut headers = HeaderMap::new();
        let cookie = HeaderValue::from_str(&format!("session_token={}", self.session_token))
            .map_err(|e| TransportError::Ticket(e.to_string()))?;
        headers.insert(COOKIE, cookie);

        let url = format!("{}/api/auth/ws-ticket", self.base_url.trim_end_matches('/'));
        let body = self
            .client
            .post(url)
            .headers(headers)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TransportError::Ticket(e.to_string()))?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TransportError::Ticket(e.to_string()))?;

        body.get("ticket")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| TransportError::Ticket("response missing ticket".into()))
    }
}

#[async_trait::async_trait]
impl TokenSource for SessionTicketSource {
    async fn token(&self) -> Option<String> {
        match self.fetch_ticket().await {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                warn!(error = %e, "transport: ws ticket unavailable");
                None
            }
        }
    }

    /// Tickets are one-time; a session is enough to try.
    async fn has_token(&self) -> bool {
        !self.session_token.is_empty()
    }
}
