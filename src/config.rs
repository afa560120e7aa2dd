use crate::error::{AlarmError, Result};
use crate::types::{AuthMode, Capability, DeviceProfile, FallbackPolicy};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Deserialize a duration given as a (possibly fractional) number of
/// seconds. Negative or non-finite values are a configuration error.
pub(crate) fn de_duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom(
            "duration must be a non-negative number of seconds",
        ));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Timeline configuration for an orchestration run.
///
/// All values are durations expressed in seconds in configuration files.
/// Negative values are rejected at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Discovery phase offset before the fire instant
    #[serde(deserialize_with = "de_duration_secs")]
    pub prewarm_lead: Duration,

    /// Wake phase offset before the fire instant
    #[serde(deserialize_with = "de_duration_secs")]
    pub wake_lead: Duration,

    /// Auth phase offset before the fire instant
    #[serde(deserialize_with = "de_duration_secs")]
    pub auth_lead: Duration,

    /// Synchronous discovery wait allowed on a cold cache
    #[serde(deserialize_with = "de_duration_secs")]
    pub discovery_timeout: Duration,

    /// Budget for the local device-info (wake) call
    #[serde(deserialize_with = "de_duration_secs")]
    pub wake_timeout: Duration,

    /// Budget for the local register-user call
    #[serde(deserialize_with = "de_duration_secs")]
    pub auth_timeout: Duration,

    /// Settle delay after a successful register-user call
    #[serde(deserialize_with = "de_duration_secs")]
    pub adduser_settle: Duration,

    /// Cloud poll cadence right after auth
    #[serde(deserialize_with = "de_duration_secs")]
    pub poll_fast_interval: Duration,

    /// Cloud poll cadence once the fast period has elapsed
    #[serde(deserialize_with = "de_duration_secs")]
    pub poll_slow_interval: Duration,

    /// How long the fast cadence lasts
    #[serde(deserialize_with = "de_duration_secs")]
    pub poll_fast_period: Duration,

    /// Cloud poll budget from phase start
    #[serde(deserialize_with = "de_duration_secs")]
    pub total_poll_deadline: Duration,

    /// Added to the poll budget iff the auth phase succeeded
    #[serde(deserialize_with = "de_duration_secs")]
    pub poll_deadline_extension: Duration,

    /// Debounce delay after the device is first seen in the cloud list
    #[serde(deserialize_with = "de_duration_secs")]
    pub debounce_after_seen: Duration,

    /// Fixed delay before the single not-found transfer retry
    #[serde(deserialize_with = "de_duration_secs")]
    pub retry_404_delay: Duration,

    /// Confirmation-loop sleep interval
    #[serde(deserialize_with = "de_duration_secs")]
    pub confirm_poll_interval: Duration,

    /// Failover trigger delay after playback start
    #[serde(deserialize_with = "de_duration_secs")]
    pub failover_fire_after: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            prewarm_lead: Duration::from_secs(60),
            wake_lead: Duration::from_secs(30),
            auth_lead: Duration::from_secs(10),
            discovery_timeout: Duration::from_millis(1500),
            wake_timeout: Duration::from_millis(1500),
            auth_timeout: Duration::from_millis(2500),
            adduser_settle: Duration::from_secs(5),
            poll_fast_interval: Duration::from_millis(500),
            poll_slow_interval: Duration::from_secs(1),
            poll_fast_period: Duration::from_secs(5),
            total_poll_deadline: Duration::from_secs(20),
            poll_deadline_extension: Duration::from_secs(15),
            debounce_after_seen: Duration::from_secs(1),
            retry_404_delay: Duration::from_millis(700),
            confirm_poll_interval: Duration::from_millis(200),
            failover_fire_after: Duration::from_secs(2),
        }
    }
}

/// OAuth client credentials and refresh token.
///
/// Long-term credential storage is external; the values land here from
/// whatever store the embedding application uses.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// User name sent with register-user calls
    #[serde(default)]
    pub username: Option<String>,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Context to start at fire time (playlist, album or artist URI)
    pub context_uri: String,

    #[serde(default)]
    pub shuffle: bool,

    #[serde(default)]
    pub timings: Timings,

    pub spotify: SpotifyCredentials,

    /// Alarm target profiles, keyed by their `name`
    #[serde(default)]
    pub targets: Vec<DeviceProfile>,
}

impl EngineConfig {
    /// Parse a YAML configuration document and validate it
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig =
            serde_yaml::from_str(s).map_err(|e| AlarmError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.context_uri.trim().is_empty() {
            return Err(AlarmError::Config("context_uri must not be empty".into()));
        }
        for profile in &self.targets {
            validate_profile(profile)?;
        }
        Ok(())
    }
}

fn validate_profile(profile: &DeviceProfile) -> Result<()> {
    if profile.name.trim().is_empty() {
        return Err(AlarmError::Config("device profile with empty name".into()));
    }
    if profile.volume_preset > 100 {
        return Err(AlarmError::Config(format!(
            "volume preset {} for '{}' is out of range (0-100)",
            profile.volume_preset, profile.name
        )));
    }
    let wants_receiver = matches!(
        profile.fallback_policy,
        FallbackPolicy::AlwaysOnReceiverOnly | FallbackPolicy::Both
    );
    if wants_receiver && profile.always_on_receiver.is_none() {
        return Err(AlarmError::Config(format!(
            "fallback policy for '{}' names an always-on receiver but none is configured",
            profile.name
        )));
    }
    let wants_secondary = matches!(
        profile.fallback_policy,
        FallbackPolicy::SecondaryOutputOnly | FallbackPolicy::Both
    );
    if wants_secondary && !profile.has_capability(Capability::SecondaryOutput) {
        return Err(AlarmError::Config(format!(
            "fallback policy for '{}' requires the secondary-output capability",
            profile.name
        )));
    }
    if profile.auth_mode == AuthMode::KeyBlob
        && (profile.auth_blob.is_none() || profile.auth_client_key.is_none())
    {
        return Err(AlarmError::Config(format!(
            "'{}' uses key-blob auth but has no blob/client key configured",
            profile.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
context_uri: "spotify:playlist:morning"
spotify:
  client_id: "id"
  client_secret: "secret"
  refresh_token: "refresh"
"#;

    #[test]
    fn defaults_applied_for_missing_timings() {
        let cfg = EngineConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(cfg.timings.prewarm_lead, Duration::from_secs(60));
        assert_eq!(cfg.timings.total_poll_deadline, Duration::from_secs(20));
        assert_eq!(cfg.timings.retry_404_delay, Duration::from_millis(700));
        assert!(!cfg.shuffle);
    }

    #[test]
    fn negative_duration_is_a_config_error() {
        let yaml = format!("{}timings:\n  wake_lead: -3.0\n", MINIMAL);
        let err = EngineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, AlarmError::Config(_)));
    }

    #[test]
    fn fractional_seconds_parse() {
        let yaml = format!("{}timings:\n  poll_fast_interval: 0.25\n", MINIMAL);
        let cfg = EngineConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(cfg.timings.poll_fast_interval, Duration::from_millis(250));
    }

    #[test]
    fn volume_out_of_range_rejected() {
        let yaml = format!(
            "{}targets:\n  - name: Kitchen\n    volume_preset: 130\n",
            MINIMAL
        );
        let err = EngineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, AlarmError::Config(_)));
    }

    #[test]
    fn receiver_policy_requires_receiver_name() {
        let yaml = format!(
            "{}targets:\n  - name: Kitchen\n    fallback_policy: always_on_receiver_only\n",
            MINIMAL
        );
        let err = EngineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, AlarmError::Config(_)));
    }

    #[test]
    fn secondary_policy_requires_capability() {
        let ok = format!(
            "{}targets:\n  - name: Kitchen\n    fallback_policy: secondary_output_only\n    capabilities: [connect, secondary-output]\n",
            MINIMAL
        );
        assert!(EngineConfig::from_yaml_str(&ok).is_ok());

        let bad = format!(
            "{}targets:\n  - name: Kitchen\n    fallback_policy: secondary_output_only\n",
            MINIMAL
        );
        assert!(EngineConfig::from_yaml_str(&bad).is_err());
    }
}
