use crate::clock::{Clock, SystemClock};
use crate::config::SpotifyCredentials;
use crate::error::{AlarmError, Result};
use crate::types::{CloudDevice, PlaybackState};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Default Web API base URL
pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";

/// Default accounts (token) service base URL
pub const DEFAULT_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// Per-request budget for cloud API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Refresh the access token this long before its reported expiry
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Owns the OAuth refresh flow and the cached access token.
///
/// `ensure_fresh` is called before every cloud request; the cached token is
/// returned until it nears expiry, then replaced in one swap under the lock
/// so an in-flight authenticated call never observes a half-updated state.
pub struct TokenManager {
    http: reqwest::Client,
    accounts_base: String,
    credentials: SpotifyCredentials,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl TokenManager {
    pub fn new(
        credentials: SpotifyCredentials,
        accounts_base: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            accounts_base: accounts_base.into(),
            credentials,
            clock,
            cached: Mutex::new(None),
        }
    }

    /// User name sent with register-user calls
    pub fn user_name(&self) -> &str {
        self.credentials.username.as_deref().unwrap_or("wakeify")
    }

    /// Return a valid access token, refreshing it if it nears expiry
    pub async fn ensure_fresh(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();

        if let Some(token) = cached.as_ref() {
            if now + REFRESH_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        tracing::debug!("Refreshing access token");
        let response = self
            .http
            .post(format!("{}/api/token", self.accounts_base))
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.as_str()),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AlarmError::Api {
                status: status.as_u16(),
                detail: format!("token refresh failed: {}", detail),
            });
        }

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: now + Duration::from_secs(token.expires_in),
        });

        Ok(access_token)
    }
}

/// Client for the remote playback-service API.
///
/// Thin wrapper over the handful of player endpoints the engine needs;
/// every call refreshes the bearer token through the [`TokenManager`]
/// first.
pub struct SpotifyApi {
    http: reqwest::Client,
    api_base: String,
    tokens: Arc<TokenManager>,
}

/// Builder for [`SpotifyApi`]; base URLs are overridable so tests can point
/// the client at a local mock server.
pub struct SpotifyApiBuilder {
    credentials: SpotifyCredentials,
    clock: Option<Arc<dyn Clock>>,
    api_base: String,
    accounts_base: String,
}

impl SpotifyApiBuilder {
    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn accounts_base(mut self, base: impl Into<String>) -> Self {
        self.accounts_base = base.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> SpotifyApi {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let tokens = Arc::new(TokenManager::new(
            self.credentials,
            self.accounts_base,
            clock,
        ));
        SpotifyApi {
            http: reqwest::Client::new(),
            api_base: self.api_base,
            tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    id: Option<String>,
    name: String,
    #[serde(default)]
    is_active: bool,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    is_restricted: bool,
    volume_percent: Option<u8>,
}

impl SpotifyApi {
    pub fn builder(credentials: SpotifyCredentials) -> SpotifyApiBuilder {
        SpotifyApiBuilder {
            credentials,
            clock: None,
            api_base: DEFAULT_API_BASE.to_string(),
            accounts_base: DEFAULT_ACCOUNTS_BASE.to_string(),
        }
    }

    /// Access to the token manager, for components that need a raw token
    /// (the register-user call sends it to the device directly)
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// List the devices currently visible to the account.
    ///
    /// Restricted entries without an id cannot be targeted and are dropped.
    pub async fn devices(&self) -> Result<Vec<CloudDevice>> {
        let token = self.tokens.ensure_fresh().await?;
        let response = self
            .http
            .get(format!("{}/me/player/devices", self.api_base))
            .bearer_auth(&token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = check(response).await?;

        let parsed: DevicesResponse = response.json().await?;
        Ok(parsed
            .devices
            .into_iter()
            .filter_map(|d| {
                let id = d.id?;
                Some(CloudDevice {
                    id,
                    name: d.name,
                    is_active: d.is_active,
                    device_type: d.device_type,
                    is_restricted: d.is_restricted,
                    volume_percent: d.volume_percent,
                })
            })
            .collect())
    }

    /// Transfer playback to a device, optionally starting it immediately
    pub async fn transfer(&self, device_id: &str, play: bool) -> Result<()> {
        let token = self.tokens.ensure_fresh().await?;
        let response = self
            .http
            .put(format!("{}/me/player", self.api_base))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "device_ids": [device_id], "play": play }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn set_volume(&self, device_id: &str, percent: u8) -> Result<()> {
        let token = self.tokens.ensure_fresh().await?;
        let response = self
            .http
            .put(format!("{}/me/player/volume", self.api_base))
            .bearer_auth(&token)
            .query(&[
                ("volume_percent", percent.to_string()),
                ("device_id", device_id.to_string()),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn set_shuffle(&self, device_id: &str, state: bool) -> Result<()> {
        let token = self.tokens.ensure_fresh().await?;
        let response = self
            .http
            .put(format!("{}/me/player/shuffle", self.api_base))
            .bearer_auth(&token)
            .query(&[
                ("state", state.to_string()),
                ("device_id", device_id.to_string()),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Start playing a context (playlist, album, artist) on a device
    pub async fn start_context(&self, device_id: &str, context_uri: &str) -> Result<()> {
        let token = self.tokens.ensure_fresh().await?;
        let response = self
            .http
            .put(format!("{}/me/player/play", self.api_base))
            .bearer_auth(&token)
            .query(&[("device_id", device_id)])
            .json(&serde_json::json!({ "context_uri": context_uri }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Read the current playback state; `None` when nothing is active
    /// (the API answers 204 in that case)
    pub async fn playback_state(&self) -> Result<Option<PlaybackState>> {
        let token = self.tokens.ensure_fresh().await?;
        let response = self
            .http
            .get(format!("{}/me/player", self.api_base))
            .bearer_auth(&token)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = check(response).await?;
        let state: PlaybackState = response.json().await?;
        Ok(Some(state))
    }
}

/// Map non-success responses to [`AlarmError::Api`], extracting the error
/// message from the body when one is present.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("no detail")
            .to_string(),
        Err(_) => "no detail".to_string(),
    };

    Err(AlarmError::Api {
        status: status.as_u16(),
        detail,
    })
}
