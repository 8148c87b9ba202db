//! OAuth2 refresh-token exchange for XOAUTH2 SMTP authentication.

use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Refresh this long before the provider's expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

/// Exchanges a refresh token for access tokens and caches them.
pub struct TokenSource {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    refresh_token: SecretString,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        refresh_token: SecretString,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            refresh_token,
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, refreshed if the cached one is about to expire.
    pub async fn access_token(&self) -> Result<SecretString, TransportError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref()
            && Instant::now() < c.refresh_at
        {
            return Ok(c.token.clone());
        }

        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self) -> Result<CachedToken, TransportError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", self.refresh_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| TransportError::network(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::network(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "OAuth2 token refresh rejected");
            return Err(TransportError::auth(format!(
                "token refresh rejected ({status}): {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransportError::auth(format!("malformed token response: {e}")))?;

        let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(3600));
        debug!(expires_in = lifetime.as_secs(), "OAuth2 access token refreshed");

        Ok(CachedToken {
            token: SecretString::from(parsed.access_token),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[tokio::test]
    async fn unreachable_endpoint_is_network_class() {
        // Port 9 on localhost: nothing listens, the connection is refused.
        let source = TokenSource::new(
            "http://127.0.0.1:9/token",
            "cid",
            SecretString::from("secret"),
            SecretString::from("refresh"),
        );
        let err = source.access_token().await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Network);
    }
}
