use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, Timings};
use crate::discovery::{normalize_key, DeviceResolver, DiscoveryCache};
use crate::error::{AlarmError, FailureKind, Result};
use crate::fallback::{FallbackCascade, SecondaryOutput};
use crate::mdns::MdnsBrowser;
use crate::playback::PlaybackController;
use crate::session::{Phase, RunEvent, Session};
use crate::spotify::SpotifyApi;
use crate::types::{
    AuthMode, Branch, CloudDevice, DeviceAddress, DeviceProfile, DeviceStatus, Outcome, RunState,
};
use crate::zeroconf::{AddUserRequest, ZeroconfClient};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Candidate-name set used to match a target against the cloud device
/// list. Matching is case-insensitive trimmed equality, never addresses:
/// the cloud API does not expose local endpoints.
pub(crate) struct CandidateNames {
    names: Vec<String>,
}

impl CandidateNames {
    pub fn new(profile: &DeviceProfile, learned: &[String]) -> Self {
        let mut candidates = Self { names: Vec::new() };
        candidates.add(&profile.name);
        if let Some(instance) = &profile.instance_name {
            candidates.add(instance);
        }
        for name in learned {
            candidates.add(name);
        }
        candidates
    }

    pub fn add(&mut self, name: &str) {
        let key = normalize_key(name);
        if !key.is_empty() && !self.names.contains(&key) {
            self.names.push(key);
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.names.contains(&normalize_key(name))
    }

    pub fn summary(&self) -> String {
        self.names.join(", ")
    }
}

/// Exact-match lookup of a target in the cloud device list
pub(crate) fn pick_device<'a>(
    devices: &'a [CloudDevice],
    candidates: &CandidateNames,
) -> Option<&'a CloudDevice> {
    devices.iter().find(|d| candidates.matches(&d.name))
}

/// Status view for one configured target
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub profile: DeviceProfile,
    pub breaker: BreakerSnapshot,
}

/// How the primary path ended
enum PrimaryEnd {
    Played,
    Failed {
        kind: FailureKind,
        addr: Option<DeviceAddress>,
    },
}

/// Top-level orchestration engine.
///
/// Owns the process-wide discovery cache and circuit breaker, and drives
/// one deadline-based state machine per alarm fire. Runs for different
/// devices proceed concurrently; runs for the same device are serialized
/// through a per-name lock.
pub struct AlarmEngine {
    context_uri: String,
    shuffle: bool,
    timings: Timings,
    profiles: HashMap<String, DeviceProfile>,
    api: Arc<SpotifyApi>,
    playback: PlaybackController,
    zeroconf: ZeroconfClient,
    resolver: Arc<dyn DeviceResolver>,
    owned_cache: Option<Arc<DiscoveryCache>>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    secondary: Option<Arc<dyn SecondaryOutput>>,
    /// Cloud names learned per target, matched on future runs
    learned: RwLock<HashMap<String, Vec<String>>>,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Builder for [`AlarmEngine`].
///
/// The clock, resolver and API base URLs are overridable so the whole
/// timeline can be driven against fakes and mock servers in tests.
pub struct AlarmEngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    resolver: Option<Arc<dyn DeviceResolver>>,
    secondary: Option<Arc<dyn SecondaryOutput>>,
    api_base: Option<String>,
    accounts_base: Option<String>,
}

impl AlarmEngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn DeviceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn secondary_output(mut self, secondary: Arc<dyn SecondaryOutput>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = Some(base.into());
        self
    }

    pub fn accounts_base(mut self, base: impl Into<String>) -> Self {
        self.accounts_base = Some(base.into());
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// Must be called from within a tokio runtime: when no resolver
    /// override is given, the default discovery cache starts its
    /// background refresh task here.
    pub fn build(self) -> Result<AlarmEngine> {
        self.config.validate()?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut api_builder =
            SpotifyApi::builder(self.config.spotify.clone()).clock(clock.clone());
        if let Some(base) = self.api_base {
            api_builder = api_builder.api_base(base);
        }
        if let Some(base) = self.accounts_base {
            api_builder = api_builder.accounts_base(base);
        }
        let api = Arc::new(api_builder.build());

        let playback = PlaybackController::new(api.clone(), clock.clone(), &self.config.timings);
        let zeroconf = ZeroconfClient::new();

        let (resolver, owned_cache) = match self.resolver {
            Some(resolver) => (resolver, None),
            None => {
                let cache = Arc::new(DiscoveryCache::new(
                    Arc::new(MdnsBrowser::new()),
                    zeroconf.clone(),
                    clock.clone(),
                    self.config.timings.discovery_timeout,
                ));
                cache.clone().start();
                (cache.clone() as Arc<dyn DeviceResolver>, Some(cache))
            }
        };

        let profiles = self
            .config
            .targets
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        tracing::info!(
            "Alarm engine initialized with {} target device(s)",
            self.config.targets.len()
        );

        Ok(AlarmEngine {
            context_uri: self.config.context_uri,
            shuffle: self.config.shuffle,
            timings: self.config.timings,
            profiles,
            api,
            playback,
            zeroconf,
            resolver,
            owned_cache,
            breaker: CircuitBreaker::new(clock.clone()),
            clock,
            secondary: self.secondary,
            learned: RwLock::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        })
    }
}

impl AlarmEngine {
    pub fn builder(config: EngineConfig) -> AlarmEngineBuilder {
        AlarmEngineBuilder {
            config,
            clock: None,
            resolver: None,
            secondary: None,
            api_base: None,
            accounts_base: None,
        }
    }

    /// Run the wake-and-play timeline for a named target.
    ///
    /// `fire_at` is the instant playback should begin; phases run at fixed
    /// offsets before it, or back-to-back when it is already in the past.
    pub async fn run(&self, target: &str, fire_at: Instant) -> Result<Outcome> {
        self.run_with_cancel(target, fire_at, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), with an abort signal.
    ///
    /// Cancellation is observed at every suspension point; a cancelled run
    /// releases its per-device lock and reports a cancelled outcome, not a
    /// failure.
    pub async fn run_with_cancel(
        &self,
        target: &str,
        fire_at: Instant,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let profile = self
            .profiles
            .get(target)
            .cloned()
            .ok_or_else(|| AlarmError::UnknownDevice(target.to_string()))?;

        let lock = self.run_lock(&profile.name);
        let _guard = lock.lock().await;

        let mut session = Session::new(&profile.name, self.clock.now());
        tracing::info!("Starting alarm run {} for {}", session.id, profile.name);

        let result = self.drive(&profile, fire_at, cancel, &mut session).await;
        let total = self.clock.now().saturating_duration_since(session.started);

        let outcome = match result {
            Ok(()) => {
                tracing::info!(
                    "Alarm run for {} completed via {} in {:?}",
                    profile.name,
                    session.branch,
                    total
                );
                session.outcome(true, None, total)
            }
            Err(AlarmError::Cancelled) => {
                tracing::info!("Alarm run for {} cancelled", profile.name);
                session.outcome(false, Some(FailureKind::Cancelled), total)
            }
            Err(AlarmError::FallbackExhausted { .. }) => {
                tracing::error!(
                    "Alarm run for {} failed: fallback exhausted (furthest state {})",
                    profile.name,
                    session.furthest
                );
                session.outcome(false, Some(FailureKind::FallbackExhausted), total)
            }
            Err(e) => {
                tracing::error!("Alarm run for {} failed: {}", profile.name, e);
                let kind = session
                    .metrics
                    .first_error
                    .unwrap_or(FailureKind::FallbackExhausted);
                session.outcome(false, Some(kind), total)
            }
        };

        Ok(outcome)
    }

    /// Read-only device list backed by the discovery cache
    pub fn device_list(&self) -> Vec<DeviceStatus> {
        self.resolver.device_list()
    }

    /// Profile and circuit-breaker view for one configured target
    pub fn device_status(&self, target: &str) -> Result<TargetStatus> {
        let profile = self
            .profiles
            .get(target)
            .cloned()
            .ok_or_else(|| AlarmError::UnknownDevice(target.to_string()))?;
        let breaker = self.breaker.snapshot(target);
        Ok(TargetStatus { profile, breaker })
    }

    /// Close a device's circuit and clear its failure history
    pub fn reset_circuit_breaker(&self, target: &str) -> Result<()> {
        if !self.profiles.contains_key(target) {
            return Err(AlarmError::UnknownDevice(target.to_string()));
        }
        self.breaker.reset(target);
        Ok(())
    }

    /// Stop the background discovery refresh, if this engine owns one
    pub async fn shutdown(&self) {
        if let Some(cache) = &self.owned_cache {
            cache.stop().await;
        }
    }

    fn run_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn learned_names(&self, name: &str) -> Vec<String> {
        let learned = self.learned.read().unwrap();
        learned.get(name).cloned().unwrap_or_default()
    }

    fn learn_name(&self, profile: &DeviceProfile, cloud_name: &str, candidates: &mut CandidateNames) {
        candidates.add(cloud_name);
        let mut learned = self.learned.write().unwrap();
        let names = learned.entry(profile.name.clone()).or_default();
        if !names.iter().any(|n| n.eq_ignore_ascii_case(cloud_name)) {
            tracing::info!("Learned cloud name '{}' for {}", cloud_name, profile.name);
            names.push(cloud_name.to_string());
        }
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        with_cancel(cancel, self.clock.sleep(duration)).await
    }

    async fn pause_until(&self, deadline: Instant, cancel: &CancellationToken) -> Result<()> {
        with_cancel(cancel, self.clock.sleep_until(deadline)).await
    }

    async fn drive(
        &self,
        profile: &DeviceProfile,
        fire_at: Instant,
        cancel: &CancellationToken,
        session: &mut Session,
    ) -> Result<()> {
        let learned = self.learned_names(&profile.name);
        let mut candidates = CandidateNames::new(profile, &learned);

        let end = self
            .primary_path(profile, fire_at, cancel, session, &mut candidates)
            .await?;
        let (kind, mut addr) = match end {
            PrimaryEnd::Played => {
                self.breaker.record_success(&profile.name);
                return Ok(());
            }
            PrimaryEnd::Failed { kind, addr } => (kind, addr),
        };

        session.record_failure_kind(kind);
        self.breaker.record_failure(&profile.name);
        session.apply(RunEvent::PrimaryExpired);
        session.branch = Branch::FallbackPath;

        let cascade = FallbackCascade {
            api: &self.api,
            playback: &self.playback,
            zeroconf: &self.zeroconf,
            resolver: self.resolver.as_ref(),
            clock: self.clock.as_ref(),
            timings: &self.timings,
            secondary: self.secondary.as_deref(),
            context_uri: &self.context_uri,
            shuffle: self.shuffle,
        };
        let delivered = with_cancel(
            cancel,
            cascade.run(profile, &mut candidates, &mut addr, session.last_cloud_id.clone()),
        )
        .await?;

        if delivered {
            session.apply(RunEvent::FallbackSucceeded);
            Ok(())
        } else {
            session.apply(RunEvent::FallbackFailed);
            Err(AlarmError::FallbackExhausted {
                device: profile.name.clone(),
                furthest: session.furthest,
            })
        }
    }

    /// The discovery -> wake -> auth -> poll -> play sequence, including
    /// the fast-path bypass and the circuit-breaker skip
    async fn primary_path(
        &self,
        profile: &DeviceProfile,
        fire_at: Instant,
        cancel: &CancellationToken,
        session: &mut Session,
        candidates: &mut CandidateNames,
    ) -> Result<PrimaryEnd> {
        // Fast path: a device that is already cloud-visible needs none of
        // the local ceremony and no debounce.
        let check_start = self.clock.now();
        match with_cancel(cancel, self.api.devices()).await? {
            Ok(devices) => {
                if let Some(device) = pick_device(&devices, candidates).cloned() {
                    tracing::info!("{} already cloud-visible, taking fast path", profile.name);
                    session.branch = Branch::FastPath;
                    session.apply(RunEvent::SeenInCloud);
                    session.record_phase(Phase::CloudPoll, check_start, self.clock.now(), true);
                    self.learn_name(profile, &device.name, candidates);
                    session.last_cloud_id = Some(device.id.clone());
                    return match self
                        .stage_play_confirm(&device, profile, fire_at, cancel, session)
                        .await?
                    {
                        None => Ok(PrimaryEnd::Played),
                        Some(kind) => Ok(PrimaryEnd::Failed {
                            kind,
                            addr: profile.static_address(),
                        }),
                    };
                }
                tracing::debug!("{} not cloud-visible yet, running full path", profile.name);
            }
            Err(e) => tracing::warn!("Fast-path device check failed: {}", e),
        }

        let mut addr = profile.static_address();
        let mut wake_ok = false;
        let mut auth_ok = false;
        let mut wake_window_start = None;

        if self.breaker.should_bypass_primary(&profile.name) {
            tracing::warn!(
                "Circuit open for {}: skipping discovery/wake/auth",
                profile.name
            );
            session.metrics.circuit_bypassed = true;
        } else {
            // Discovery at T-60s.
            self.pause_until(offset_before(fire_at, self.timings.prewarm_lead, check_start), cancel)
                .await?;
            let started = self.clock.now();
            if addr.is_some() {
                tracing::debug!("Static address configured for {}, discovery bypassed", profile.name);
                session.apply(RunEvent::DeviceDiscovered);
                session.record_phase(Phase::Discovery, started, self.clock.now(), true);
            } else {
                match with_cancel(cancel, self.resolver.resolve(&profile.name)).await? {
                    Ok(device) => {
                        candidates.add(&device.name);
                        candidates.add(&device.instance_name);
                        tracing::info!(
                            "Discovered {} at {}",
                            profile.name,
                            device.addr.endpoint()
                        );
                        addr = Some(device.addr);
                        session.apply(RunEvent::DeviceDiscovered);
                        session.record_phase(Phase::Discovery, started, self.clock.now(), true);
                    }
                    Err(e) => {
                        let kind = if e.is_timeout() {
                            FailureKind::DiscoveryTimeout
                        } else {
                            FailureKind::DiscoveryNotFound
                        };
                        tracing::warn!("Discovery failed for {}: {}", profile.name, e);
                        session.record_failure_kind(kind);
                        session.record_phase(Phase::Discovery, started, self.clock.now(), false);
                    }
                }
            }

            // Wake at T-30s. Failure is non-fatal and only recorded.
            self.pause_until(offset_before(fire_at, self.timings.wake_lead, started), cancel)
                .await?;
            wake_window_start = Some(self.clock.now());
            if let Some(a) = &addr {
                let started = self.clock.now();
                match with_cancel(cancel, self.zeroconf.wake(a, self.timings.wake_timeout)).await? {
                    Ok(()) => {
                        wake_ok = true;
                        session.apply(RunEvent::WakeAcknowledged);
                        session.record_phase(Phase::Wake, started, self.clock.now(), true);
                    }
                    Err(e) => {
                        tracing::warn!("Wake call for {} went unanswered: {}", profile.name, e);
                        session.record_phase(Phase::Wake, started, self.clock.now(), false);
                    }
                }
            } else {
                tracing::debug!("No address for {}, wake skipped", profile.name);
            }

            // Auth at T-10s.
            self.pause_until(offset_before(fire_at, self.timings.auth_lead, check_start), cancel)
                .await?;
            if let Some(a) = &addr {
                if profile.auth_mode == AuthMode::None {
                    tracing::debug!("Auth mode none for {}, register-user skipped", profile.name);
                } else {
                    let started = self.clock.now();
                    match with_cancel(cancel, self.authenticate(a, profile)).await? {
                        Ok(()) => {
                            auth_ok = true;
                            session.apply(RunEvent::AuthAccepted);
                            session.record_phase(Phase::Auth, started, self.clock.now(), true);

                            // Let the registration settle, then harvest the
                            // device's own name strings for cloud matching.
                            self.pause(self.timings.adduser_settle, cancel).await?;
                            let followup = with_cancel(
                                cancel,
                                self.zeroconf.get_info(a, self.timings.wake_timeout),
                            )
                            .await?;
                            if let Ok(info) = followup {
                                for name in info.alternate_names() {
                                    candidates.add(name);
                                }
                            }
                        }
                        Err(e) => {
                            let kind = if e.is_timeout() {
                                FailureKind::AuthTimeout
                            } else {
                                FailureKind::AuthFailure
                            };
                            tracing::warn!("Register-user failed for {}: {}", profile.name, e);
                            session.record_failure_kind(kind);
                            session.record_phase(Phase::Auth, started, self.clock.now(), false);
                        }
                    }
                }
            }
        }

        // Cloud-visibility polling, T-10s onward. The deadline stretches
        // only for devices we actually managed to register.
        let poll_start = self.clock.now();
        let mut deadline = poll_start + self.timings.total_poll_deadline;
        if auth_ok {
            deadline += self.timings.poll_deadline_extension;
        }
        let fast_until = poll_start + self.timings.poll_fast_period;
        let mut found: Option<CloudDevice> = None;
        let mut first_attempt = true;

        loop {
            match with_cancel(cancel, self.api.devices()).await? {
                Ok(devices) => {
                    if first_attempt {
                        let visible: Vec<&str> =
                            devices.iter().map(|d| d.name.as_str()).collect();
                        tracing::debug!(
                            "Cloud devices: [{}]; matching against: [{}]",
                            visible.join(", "),
                            candidates.summary()
                        );
                        first_attempt = false;
                    }
                    if let Some(device) = pick_device(&devices, candidates) {
                        found = Some(device.clone());
                        break;
                    }
                }
                Err(e) => tracing::warn!("Cloud poll failed: {}", e),
            }

            let now = self.clock.now();
            if now >= deadline {
                break;
            }

            if let (Some(window_start), Some(_)) = (wake_window_start, addr.as_ref()) {
                if !wake_ok
                    && !auth_ok
                    && session.state == RunState::Discovered
                    && now.duration_since(window_start) >= profile.max_wake_wait
                {
                    tracing::warn!("{} looks deep-asleep: wake and auth unanswered", profile.name);
                    session.apply(RunEvent::WakeWindowExpired);
                }
            }

            let interval = if now < fast_until {
                self.timings.poll_fast_interval
            } else {
                self.timings.poll_slow_interval
            };
            self.pause(interval.min(deadline - now), cancel).await?;
        }

        let Some(device) = found else {
            session.record_phase(Phase::CloudPoll, poll_start, self.clock.now(), false);
            tracing::warn!(
                "{} did not appear in the cloud device list within its deadline",
                profile.name
            );
            return Ok(PrimaryEnd::Failed {
                kind: FailureKind::CloudVisibilityTimeout,
                addr,
            });
        };

        session.apply(RunEvent::SeenInCloud);
        session.record_phase(Phase::CloudPoll, poll_start, self.clock.now(), true);
        self.learn_name(profile, &device.name, candidates);
        session.last_cloud_id = Some(device.id.clone());

        // Debounce before trusting the freshly-appeared device.
        self.pause(self.timings.debounce_after_seen, cancel).await?;

        match self
            .stage_play_confirm(&device, profile, fire_at, cancel, session)
            .await?
        {
            None => Ok(PrimaryEnd::Played),
            Some(kind) => Ok(PrimaryEnd::Failed { kind, addr }),
        }
    }

    /// Stage, hold until the fire instant, start, then confirm within the
    /// failover window. Returns the failure kind when the device never
    /// reached playing state.
    async fn stage_play_confirm(
        &self,
        device: &CloudDevice,
        profile: &DeviceProfile,
        fire_at: Instant,
        cancel: &CancellationToken,
        session: &mut Session,
    ) -> Result<Option<FailureKind>> {
        let started = self.clock.now();
        match with_cancel(cancel, self.playback.stage(&device.id, profile.volume_preset)).await? {
            Ok(()) => {
                session.apply(RunEvent::TransferAccepted);
                session.record_phase(Phase::Stage, started, self.clock.now(), true);
            }
            Err(e) => {
                tracing::warn!("Staging {} failed: {}", profile.name, e);
                session.record_phase(Phase::Stage, started, self.clock.now(), false);
                return Ok(Some(FailureKind::PlaybackTransferError));
            }
        }

        // Play lands on the fire instant; a no-op when it already passed.
        self.pause_until(fire_at, cancel).await?;

        let started = self.clock.now();
        match with_cancel(
            cancel,
            self.playback.start(&device.id, &self.context_uri, self.shuffle),
        )
        .await?
        {
            Ok(()) => session.record_phase(Phase::Play, started, self.clock.now(), true),
            Err(e) => {
                tracing::warn!("Playback start on {} failed: {}", profile.name, e);
                session.record_phase(Phase::Play, started, self.clock.now(), false);
                return Ok(Some(FailureKind::PlaybackTransferError));
            }
        }

        let deadline = self.clock.now() + self.timings.failover_fire_after;
        let started = self.clock.now();
        match with_cancel(cancel, self.playback.confirm_playing(&device.id, deadline)).await? {
            Ok(()) => {
                session.apply(RunEvent::PlaybackConfirmed);
                session.record_phase(Phase::Confirm, started, self.clock.now(), true);
                Ok(None)
            }
            Err(_) => {
                session.record_phase(Phase::Confirm, started, self.clock.now(), false);
                Ok(Some(FailureKind::PlaybackConfirmationTimeout))
            }
        }
    }

    /// Register-user, bracketed by token refreshes so the device receives
    /// a token that will not go stale the moment it is used
    async fn authenticate(&self, addr: &DeviceAddress, profile: &DeviceProfile) -> Result<()> {
        let token = self.api.tokens().ensure_fresh().await?;
        let user = self.api.tokens().user_name().to_string();

        let request = match profile.auth_mode {
            AuthMode::None => return Ok(()),
            AuthMode::AccessToken => AddUserRequest::access_token(&user, token),
            AuthMode::KeyBlob => {
                let (blob, key) = profile
                    .auth_blob
                    .as_deref()
                    .zip(profile.auth_client_key.as_deref())
                    .ok_or_else(|| {
                        AlarmError::Config(format!(
                            "profile {} uses key-blob auth without credentials",
                            profile.name
                        ))
                    })?;
                AddUserRequest::key_blob(&user, blob, key)
            }
        };

        self.zeroconf
            .add_user(addr, &request, self.timings.auth_timeout)
            .await?;
        self.api.tokens().ensure_fresh().await?;
        Ok(())
    }
}

/// Race a future against cancellation
async fn with_cancel<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(AlarmError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Phase start instant: `fire_at - lead`, clamped to `now` when the
/// offset underflows the clock's epoch
fn offset_before(fire_at: Instant, lead: Duration, now: Instant) -> Instant {
    fire_at.checked_sub(lead).unwrap_or(now)
}
