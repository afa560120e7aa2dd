use crate::config::de_duration_secs;
use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default control path used when an advertisement reports none (or "/")
pub const DEFAULT_CPATH: &str = "/spotifyconnect/zeroconf";

fn default_volume_preset() -> u8 {
    30
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Connect]
}

fn default_max_wake_wait() -> Duration {
    Duration::from_secs(22)
}

/// Authentication mode used for the register-user call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Skip the register-user call entirely
    None,
    /// Register with the account's OAuth access token
    #[default]
    AccessToken,
    /// Register with a pre-provisioned credential blob and client key
    KeyBlob,
}

/// Delivery capabilities a device profile may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Spotify-Connect-style receiver reachable through the cloud API
    Connect,
    /// A secondary local audio-output path exists for this target
    SecondaryOutput,
}

/// Which alternate delivery paths the fallback cascade may substitute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Run the generic cascade steps only
    #[default]
    None,
    SecondaryOutputOnly,
    AlwaysOnReceiverOnly,
    /// Both substitutes; secondary output is tried before the receiver
    Both,
}

/// Identity and policy for one alarm target.
///
/// Created from configuration and immutable for the duration of a run.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    /// Friendly device name, the stable key for this target
    pub name: String,

    /// mDNS instance identifier, if known ahead of discovery
    #[serde(default)]
    pub instance_name: Option<String>,

    /// Static address; when present, discovery is bypassed
    #[serde(default)]
    pub address: Option<String>,

    /// Static port for the local control endpoint
    #[serde(default)]
    pub port: Option<u16>,

    /// Static control path for the local control endpoint
    #[serde(default)]
    pub cpath: Option<String>,

    /// Volume preset applied when staging playback (0-100)
    #[serde(default = "default_volume_preset")]
    pub volume_preset: u8,

    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Credential blob for [`AuthMode::KeyBlob`]; provisioning is external
    #[serde(default)]
    pub auth_blob: Option<String>,

    /// Client key paired with the credential blob
    #[serde(default)]
    pub auth_client_key: Option<String>,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,

    #[serde(default)]
    pub fallback_policy: FallbackPolicy,

    /// Designated always-available receiver for fallback delivery
    #[serde(default)]
    pub always_on_receiver: Option<String>,

    /// How long wake/auth may go unanswered before the device is treated
    /// as deep-sleeping
    #[serde(default = "default_max_wake_wait", deserialize_with = "de_duration_secs")]
    pub max_wake_wait: Duration,
}

impl DeviceProfile {
    /// Create a minimal profile with default policy for the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_name: None,
            address: None,
            port: None,
            cpath: None,
            volume_preset: default_volume_preset(),
            auth_mode: AuthMode::default(),
            auth_blob: None,
            auth_client_key: None,
            capabilities: default_capabilities(),
            fallback_policy: FallbackPolicy::default(),
            always_on_receiver: None,
            max_wake_wait: default_max_wake_wait(),
        }
    }

    /// Static control endpoint from the profile, when configured
    pub fn static_address(&self) -> Option<DeviceAddress> {
        self.address.as_ref().map(|addr| {
            DeviceAddress::new(addr.clone(), self.port.unwrap_or(80), self.cpath.as_deref())
        })
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Local control endpoint of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub address: String,
    pub port: u16,
    pub cpath: String,
}

impl DeviceAddress {
    /// Build an address, normalizing the control path.
    ///
    /// Devices report `cpath` inconsistently: some advertise "/", some an
    /// empty string, some omit the leading slash. All of those collapse to
    /// a usable path here.
    pub fn new(address: String, port: u16, cpath: Option<&str>) -> Self {
        let cpath = normalize_cpath(cpath);
        Self {
            address,
            port,
            cpath,
        }
    }

    /// Base URL of the control endpoint
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}{}", self.address, self.port, self.cpath)
    }
}

fn normalize_cpath(cpath: Option<&str>) -> String {
    let raw = cpath.unwrap_or("").trim();
    if raw.is_empty() || raw == "/" {
        return DEFAULT_CPATH.to_string();
    }
    let mut path = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

/// Ephemeral discovery result, owned by the discovery cache
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Resolved friendly name
    pub name: String,
    /// Raw mDNS instance identifier
    pub instance_name: String,
    pub addr: DeviceAddress,
    /// Whether the health probe got an answer
    pub online: bool,
    pub last_seen: Instant,
    /// Last health-probe response latency
    pub latency: Option<Duration>,
    pub last_error: Option<String>,
}

/// Read-only device status row for presentation layers
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub online: bool,
    /// Seconds since the device was last seen by discovery
    pub last_seen_secs: u64,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// A device as reported by the cloud device-list endpoint
#[derive(Debug, Clone)]
pub struct CloudDevice {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub device_type: String,
    pub is_restricted: bool,
    pub volume_percent: Option<u8>,
}

/// Parsed device-info response from the local control endpoint.
///
/// Only the fields the engine consumes are modeled; devices return many
/// more.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub status: Option<i64>,
    pub status_string: Option<String>,
    pub spotify_error: Option<i64>,
    pub device_id: Option<String>,
    pub remote_name: Option<String>,
    pub display_name: Option<String>,
    pub name: Option<String>,
    pub device_name: Option<String>,
    pub model_display_name: Option<String>,
    pub active_user: Option<String>,
}

impl DeviceInfo {
    /// Name strings usable for cloud-list matching, most reliable first:
    /// the device's own remote name, then display/name variants, with the
    /// model name as a last resort.
    pub fn alternate_names(&self) -> Vec<&str> {
        [
            self.remote_name.as_deref(),
            self.display_name.as_deref(),
            self.name.as_deref(),
            self.device_name.as_deref(),
            self.model_display_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
    }
}

/// Current playback state as reported by the cloud API
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackState {
    pub device: PlaybackDevice,
    pub is_playing: bool,
}

/// Device section of a playback-state response
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackDevice {
    pub id: Option<String>,
    pub name: String,
}

/// State-machine label for an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Unknown,
    Discovered,
    LocalAwake,
    LoggedIn,
    CloudVisible,
    Staged,
    /// Terminal success
    Playing,
    /// Wake/auth never produced a responsive device within its window
    DeepSleepSuspected,
    /// Primary path expired; the fallback cascade is running
    FallbackActive,
    /// Terminal failure
    Failed,
}

impl RunState {
    /// Happy-path progression rank, used to track the furthest state a run
    /// reached. Escape states carry no progress of their own.
    pub(crate) fn progress(self) -> Option<u8> {
        match self {
            RunState::Unknown => Some(0),
            RunState::Discovered => Some(1),
            RunState::LocalAwake => Some(2),
            RunState::LoggedIn => Some(3),
            RunState::CloudVisible => Some(4),
            RunState::Staged => Some(5),
            RunState::Playing => Some(6),
            RunState::DeepSleepSuspected | RunState::FallbackActive | RunState::Failed => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Unknown => "UNKNOWN",
            RunState::Discovered => "DISCOVERED",
            RunState::LocalAwake => "LOCAL_AWAKE",
            RunState::LoggedIn => "LOGGED_IN",
            RunState::CloudVisible => "CLOUD_VISIBLE",
            RunState::Staged => "STAGED",
            RunState::Playing => "PLAYING",
            RunState::DeepSleepSuspected => "DEEP_SLEEP_SUSPECTED",
            RunState::FallbackActive => "FALLBACK_ACTIVE",
            RunState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Which delivery branch a run ended up taking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// Device was already cloud-visible; discovery/wake/auth skipped
    FastPath,
    /// Full discovery/wake/auth/poll sequence
    FullPath,
    /// Primary path failed; delivery went through the fallback cascade
    FallbackPath,
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Branch::FastPath => "fast_path",
            Branch::FullPath => "full_path",
            Branch::FallbackPath => "fallback_path",
        };
        write!(f, "{}", s)
    }
}

/// Duration and success flag for one completed phase
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PhaseRecord {
    pub duration: Duration,
    pub ok: bool,
}

/// Per-phase measurements accumulated over a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseMetrics {
    pub discovery: Option<PhaseRecord>,
    pub wake: Option<PhaseRecord>,
    pub auth: Option<PhaseRecord>,
    pub cloud_poll: Option<PhaseRecord>,
    pub stage: Option<PhaseRecord>,
    pub play: Option<PhaseRecord>,
    pub confirm: Option<PhaseRecord>,
    /// First failure recorded on the primary path
    pub first_error: Option<FailureKind>,
    /// True when the open circuit pre-failed discovery/wake/auth
    pub circuit_bypassed: bool,
}

/// Structured result of one orchestration run
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub device: String,
    pub run_id: Uuid,
    pub branch: Branch,
    pub success: bool,
    /// Terminal error kind; `None` on success
    pub failure: Option<FailureKind>,
    /// Furthest happy-path state the run reached
    pub furthest: RunState,
    pub metrics: PhaseMetrics,
    pub total: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpath_normalization() {
        assert_eq!(
            DeviceAddress::new("10.0.0.2".into(), 80, None).cpath,
            DEFAULT_CPATH
        );
        assert_eq!(
            DeviceAddress::new("10.0.0.2".into(), 80, Some("/")).cpath,
            DEFAULT_CPATH
        );
        assert_eq!(
            DeviceAddress::new("10.0.0.2".into(), 80, Some("zc/")).cpath,
            "/zc"
        );
        assert_eq!(
            DeviceAddress::new("10.0.0.2".into(), 80, Some("/zc")).endpoint(),
            "http://10.0.0.2:80/zc"
        );
    }

    #[test]
    fn alternate_names_priority_and_filtering() {
        let info = DeviceInfo {
            remote_name: Some("Kitchen Speaker".into()),
            display_name: Some("  ".into()),
            model_display_name: Some("Beam".into()),
            ..Default::default()
        };
        assert_eq!(info.alternate_names(), vec!["Kitchen Speaker", "Beam"]);
    }

    #[test]
    fn static_address_uses_profile_port_and_cpath() {
        let mut profile = DeviceProfile::new("Kitchen");
        assert!(profile.static_address().is_none());

        profile.address = Some("192.168.1.40".into());
        profile.cpath = Some("/zc".into());
        let addr = profile.static_address().unwrap();
        assert_eq!(addr.port, 80);
        assert_eq!(addr.endpoint(), "http://192.168.1.40:80/zc");
    }
}
