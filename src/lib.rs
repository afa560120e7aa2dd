//! Rust library for waking Spotify Connect speakers and starting playback
//! at a scheduled instant
//!
//! This library provides an async engine that drives a network audio device
//! from possibly-asleep to actively playing at a target fire instant, with
//! bounded-time fallback when the primary path fails. It supports:
//!
//! - Local-network device discovery with a TTL cache and background refresh
//! - Device wake and account registration over the local HTTP endpoint
//! - Cloud-visibility polling with adaptive cadence and deadlines
//! - Playback transfer, volume preset, shuffle and start-context calls
//! - Confirmation polling: a run only succeeds on observed playing state
//! - Per-device circuit breaker with timed self-recovery
//! - An ordered fallback cascade, with per-device substitute outputs
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//! use wakeify::{AlarmEngine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_yaml_str(
//!         r#"
//! context_uri: "spotify:playlist:37i9dQZF1DXc5e2bJhV6pu"
//! spotify:
//!   client_id: "your-client-id"
//!   client_secret: "your-client-secret"
//!   refresh_token: "your-refresh-token"
//! targets:
//!   - name: "Kitchen Speaker"
//!     volume_preset: 40
//! "#,
//!     )?;
//!
//!     let engine = AlarmEngine::builder(config).build()?;
//!
//!     // Fire one minute from now; phases run at offsets before it.
//!     let fire_at = Instant::now() + Duration::from_secs(60);
//!     let outcome = engine.run("Kitchen Speaker", fire_at).await?;
//!
//!     println!(
//!         "branch: {}, success: {}, total: {:?}",
//!         outcome.branch, outcome.success, outcome.total
//!     );
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The engine is organized into several layers:
//!
//! - **Orchestrator**: the deadline-driven state machine sequencing all
//!   phases relative to the fire instant
//! - **Discovery**: TTL cache over the local service-discovery transport
//! - **Zeroconf**: local HTTP wake (`getInfo`) and register (`addUser`) calls
//! - **Spotify**: cloud API client and token refresh
//! - **Playback**: transfer/volume/start calls and the confirmation loop
//! - **Breaker**: per-device failure gate with probe-after-cooldown recovery
//! - **Fallback**: ordered recovery cascade
//!
//! Phase deadlines, cache TTLs and recovery windows are all evaluated
//! against an injected [`Clock`], so the entire timeline can be tested
//! without real time passing.

mod breaker;
mod clock;
mod config;
mod discovery;
mod error;
mod fallback;
mod mdns;
mod orchestrator;
mod playback;
mod session;
mod spotify;
mod types;
mod zeroconf;

// Public exports
pub use breaker::{BreakerSnapshot, CircuitBreaker, FAILURE_THRESHOLD, RECOVERY_WINDOW};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, SpotifyCredentials, Timings};
pub use discovery::{
    DeviceResolver, DiscoveryCache, ServiceAdvert, ServiceBrowser, CACHE_TTL,
};
pub use error::{AlarmError, FailureKind, Result};
pub use fallback::SecondaryOutput;
pub use mdns::{MdnsBrowser, SPOTIFY_CONNECT_SERVICE};
pub use orchestrator::{AlarmEngine, AlarmEngineBuilder, TargetStatus};
pub use playback::PlaybackController;
pub use spotify::{SpotifyApi, SpotifyApiBuilder, TokenManager};
pub use types::{
    AuthMode, Branch, Capability, CloudDevice, DeviceAddress, DeviceInfo, DeviceProfile,
    DeviceStatus, DiscoveredDevice, FallbackPolicy, Outcome, PhaseMetrics, PhaseRecord,
    PlaybackState, RunState, DEFAULT_CPATH,
};
pub use zeroconf::{AddUserRequest, HealthReport, ZeroconfClient};
