use crate::types::RunState;
use serde::Serialize;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, AlarmError>;

/// Errors that can occur while driving an alarm run
#[derive(Error, Debug)]
pub enum AlarmError {
    /// HTTP transport error (local device or cloud API)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote API answered with a non-success status
    #[error("API error ({status}): {detail}")]
    Api {
        /// HTTP status code returned by the API
        status: u16,
        /// Error detail message, best-effort extracted from the body
        detail: String,
    },

    /// A bounded call did not complete within its budget
    #[error("Request timeout")]
    Timeout,

    /// The target device could not be resolved on the local network
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device rejected the register-user call
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Service discovery transport error
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Invalid or unexpected response from a device or the API
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid configuration (bad timings, bad device profile)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested target has no device profile
    #[error("Unknown target device: {0}")]
    UnknownDevice(String),

    /// The run was aborted by its owner
    #[error("Run cancelled")]
    Cancelled,

    /// Every fallback step failed; the run is terminally lost
    #[error("All fallback steps failed for {device} (furthest state: {furthest})")]
    FallbackExhausted {
        /// Name of the device the run targeted
        device: String,
        /// Furthest state the run reached before giving up
        furthest: RunState,
    },
}

impl AlarmError {
    /// True for "device not found"-class API errors (the transient class
    /// that earns the single transfer retry).
    pub fn is_not_found(&self) -> bool {
        matches!(self, AlarmError::Api { status: 404, .. })
    }

    /// True when the error is a timeout, either our own deadline or the
    /// HTTP client's per-request budget.
    pub fn is_timeout(&self) -> bool {
        match self {
            AlarmError::Timeout => true,
            AlarmError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Classified failure kind carried in a run's outcome.
///
/// Phase-local failures are recorded under one of these kinds; raw transport
/// errors never cross the public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    DiscoveryTimeout,
    DiscoveryNotFound,
    /// Non-fatal: the wake call went unanswered. Recorded, never raised.
    WakeTimeout,
    AuthFailure,
    AuthTimeout,
    CloudVisibilityTimeout,
    PlaybackTransferError,
    /// Transfer was accepted but playing state was never observed.
    PlaybackConfirmationTimeout,
    FallbackExhausted,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::DiscoveryTimeout => "discovery_timeout",
            FailureKind::DiscoveryNotFound => "discovery_not_found",
            FailureKind::WakeTimeout => "wake_timeout",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::AuthTimeout => "auth_timeout",
            FailureKind::CloudVisibilityTimeout => "cloud_visibility_timeout",
            FailureKind::PlaybackTransferError => "playback_transfer_error",
            FailureKind::PlaybackConfirmationTimeout => "playback_confirmation_timeout",
            FailureKind::FallbackExhausted => "fallback_exhausted",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}
