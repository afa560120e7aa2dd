use crate::error::{AlarmError, Result};
use crate::types::{DeviceAddress, DeviceInfo};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Budget for the health probe run by the discovery cache
const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

/// ZeroConf status code devices answer on success
const STATUS_OK: i64 = 101;

/// Client for the local HTTP control endpoint of a device.
///
/// Speaks the two-request protocol every Connect-style receiver exposes: a
/// `getInfo` read (which doubles as the wake call) and an `addUser` write
/// that registers the device for an account. No session state is held
/// between calls.
#[derive(Debug, Clone)]
pub struct ZeroconfClient {
    http: reqwest::Client,
}

/// Form body for the register-user call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserRequest {
    action: &'static str,
    user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_key: Option<String>,
}

impl AddUserRequest {
    /// Register with an OAuth access token
    pub fn access_token(user_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            action: "addUser",
            user_name: user_name.into(),
            access_token: Some(token.into()),
            token_type: Some("accesstoken".to_string()),
            blob: None,
            client_key: None,
        }
    }

    /// Register with a pre-provisioned credential blob and client key
    pub fn key_blob(
        user_name: impl Into<String>,
        blob: impl Into<String>,
        client_key: impl Into<String>,
    ) -> Self {
        Self {
            action: "addUser",
            user_name: user_name.into(),
            access_token: None,
            token_type: None,
            blob: Some(blob.into()),
            client_key: Some(client_key.into()),
        }
    }
}

/// Result of a bounded health probe
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub responding: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

impl ZeroconfClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Read the device-info endpoint.
    ///
    /// Also used as the wake call: reaching the endpoint at all is enough
    /// to rouse most receivers from low-power state.
    pub async fn get_info(&self, addr: &DeviceAddress, timeout: Duration) -> Result<DeviceInfo> {
        let url = format!("{}/?action=getInfo", addr.endpoint());
        tracing::debug!("getInfo {}", url);

        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            return Err(AlarmError::InvalidResponse(format!(
                "getInfo returned status {}",
                response.status()
            )));
        }

        let info: DeviceInfo = response.json().await.map_err(classify)?;
        Ok(info)
    }

    /// Wake call: a bounded getInfo whose payload is discarded
    pub async fn wake(&self, addr: &DeviceAddress, timeout: Duration) -> Result<()> {
        self.get_info(addr, timeout).await.map(|_| ())
    }

    /// Register the account on the device.
    ///
    /// Devices answer HTTP 200 with a JSON status field; anything other
    /// than the OK status code is a rejection.
    pub async fn add_user(
        &self,
        addr: &DeviceAddress,
        request: &AddUserRequest,
        timeout: Duration,
    ) -> Result<()> {
        let url = addr.endpoint();
        tracing::debug!("addUser {} (user {})", url, request.user_name);

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .form(request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlarmError::AuthRejected(format!(
                "addUser returned HTTP {}",
                status
            )));
        }

        // Lenient parse: some devices answer 200 with an empty body.
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        match body.get("status").and_then(|v| v.as_i64()) {
            None | Some(STATUS_OK) => Ok(()),
            Some(code) => {
                let detail = body
                    .get("statusString")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                Err(AlarmError::AuthRejected(format!(
                    "device answered status {} ({})",
                    code, detail
                )))
            }
        }
    }

    /// Bounded health probe, measuring response latency.
    ///
    /// Never fails: an unreachable device is reported, not raised.
    pub async fn check_health(&self, addr: &DeviceAddress) -> HealthReport {
        let start = Instant::now();
        match self.get_info(addr, HEALTH_TIMEOUT).await {
            Ok(_) => HealthReport {
                responding: true,
                latency: Some(start.elapsed()),
                error: None,
            },
            Err(e) => HealthReport {
                responding: false,
                latency: None,
                error: Some(e.to_string()),
            },
        }
    }
}

impl Default for ZeroconfClient {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(e: reqwest::Error) -> AlarmError {
    if e.is_timeout() {
        AlarmError::Timeout
    } else {
        AlarmError::Http(e)
    }
}
