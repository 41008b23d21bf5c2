//! OAuth2 client-credentials token cache.
//!
//! The access token lives behind an async mutex. Holding the lock across the
//! refresh request means concurrent callers wait for one refresh instead of
//! issuing their own.

use crate::config::OAuthSettings;
use crate::transport::{self, CallGuard};
use crate::{Error, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Refresh once the token is this close to expiry.
const REFRESH_MARGIN_MS: i64 = 2 * 60 * 1000;

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at_ms: i64,
}

impl CachedToken {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms - REFRESH_MARGIN_MS
    }
}

/// Bearer token obtained with a Basic auth key and refreshed near expiry.
pub struct TokenCache {
    settings: OAuthSettings,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(settings: OAuthSettings, http: reqwest::Client) -> Self {
        Self {
            settings,
            http,
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, fetching a new one when missing or about to expire.
    pub async fn token(&self, guard: &CallGuard) -> Result<String> {
        let mut cached = guard.run(self.cached.lock()).await?;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now_ms())) {
            return Ok(token.token.clone());
        }

        let fresh = self.fetch(guard).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token; the next call fetches a new one.
    pub async fn invalidate(&self) {
        debug!("Invalidating cached access token");
        *self.cached.lock().await = None;
    }

    async fn fetch(&self, guard: &CallGuard) -> Result<CachedToken> {
        let auth_key = self
            .settings
            .auth_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::config("oauth.auth_key is required to obtain a token"))?;

        let request = self
            .http
            .post(&self.settings.auth_url)
            .header("Authorization", format!("Basic {auth_key}"))
            .header("RqUID", uuid::Uuid::new_v4().to_string())
            .header("Accept", "application/json")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!("scope={}", self.settings.scope));

        let response = transport::send(guard, request).await?;
        let body: TokenResponse = guard.run(response.json()).await??;
        let expires_at_ms = body.expires_at_ms();
        info!(
            scope = %self.settings.scope,
            expires_in_secs = (expires_at_ms - now_ms()) / 1000,
            "Obtained new access token"
        );
        Ok(CachedToken {
            token: body.access_token,
            expires_at_ms,
        })
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("auth_url", &self.settings.auth_url)
            .field("scope", &self.settings.scope)
            .finish_non_exhaustive()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Absolute expiry, epoch milliseconds.
    #[serde(default)]
    expires_at: Option<i64>,
    /// Relative lifetime in seconds, used by some gateways instead.
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn expires_at_ms(&self) -> i64 {
        match (self.expires_at, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => now_ms() + secs * 1000,
            // Unknown lifetime: treat as already expiring so the next call refreshes.
            (None, None) => now_ms(),
        }
    }
}
