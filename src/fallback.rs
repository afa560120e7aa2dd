use crate::clock::Clock;
use crate::config::Timings;
use crate::discovery::DeviceResolver;
use crate::error::Result;
use crate::orchestrator::{pick_device, CandidateNames};
use crate::playback::PlaybackController;
use crate::spotify::SpotifyApi;
use crate::types::{DeviceAddress, DeviceProfile, FallbackPolicy};
use crate::zeroconf::{AddUserRequest, ZeroconfClient};
use async_trait::async_trait;
use std::time::Duration;

/// Budget for the TCP reachability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Local secondary audio-output path, supplied by the embedding
/// application. The engine only asks it to start the context; what that
/// means (a pipe, a local player, another protocol) is its business.
#[async_trait]
pub trait SecondaryOutput: Send + Sync {
    async fn play(&self, context_uri: &str) -> Result<()>;
}

/// Ordered recovery cascade, engaged when the primary path has not reached
/// playing by its deadline (or immediately when the circuit is open).
///
/// Steps, each attempted only if the previous did not deliver:
/// 1. quick re-check of cloud visibility;
/// 2. generic wake round (local HTTP probe, discovery re-query, TCP
///    reachability probe);
/// 3. a second wake round;
/// 4. register-user retry with the current access token;
/// 5. forced playback transfer against the last known cloud id;
/// 6. terminal failure, reported by the orchestrator.
///
/// A profile's fallback policy substitutes steps 2-5 with the configured
/// alternate outputs; the secondary output is tried before the always-on
/// receiver.
pub(crate) struct FallbackCascade<'a> {
    pub api: &'a SpotifyApi,
    pub playback: &'a PlaybackController,
    pub zeroconf: &'a ZeroconfClient,
    pub resolver: &'a dyn DeviceResolver,
    pub clock: &'a dyn Clock,
    pub timings: &'a Timings,
    pub secondary: Option<&'a dyn SecondaryOutput>,
    pub context_uri: &'a str,
    pub shuffle: bool,
}

impl FallbackCascade<'_> {
    /// Run the cascade; true means audio is playing somewhere acceptable
    pub async fn run(
        &self,
        profile: &DeviceProfile,
        candidates: &mut CandidateNames,
        addr: &mut Option<DeviceAddress>,
        last_cloud_id: Option<String>,
    ) -> bool {
        tracing::warn!("Fallback cascade engaged for {}", profile.name);

        // Step 1: the device may have appeared on its own.
        if self.try_cloud_play(profile, candidates).await {
            tracing::info!("Fallback step 1 delivered: {} became cloud-visible", profile.name);
            return true;
        }

        match profile.fallback_policy {
            FallbackPolicy::None => {}
            policy => return self.run_substitutes(profile, policy).await,
        }

        // Step 2: generic wake round.
        self.generic_wake_round(profile, candidates, addr).await;
        if self.try_cloud_play(profile, candidates).await {
            tracing::info!("Fallback step 2 delivered after generic wake");
            return true;
        }

        // Step 3: once more; slow devices often need the second nudge.
        self.generic_wake_round(profile, candidates, addr).await;
        if self.try_cloud_play(profile, candidates).await {
            tracing::info!("Fallback step 3 delivered after second wake round");
            return true;
        }

        // Step 4: register-user retry with the current access token.
        if let Some(a) = addr.as_ref() {
            match self.api.tokens().ensure_fresh().await {
                Ok(token) => {
                    let request =
                        AddUserRequest::access_token(self.api.tokens().user_name(), token);
                    match self
                        .zeroconf
                        .add_user(a, &request, self.timings.auth_timeout)
                        .await
                    {
                        Ok(()) => {
                            self.clock.sleep(self.timings.adduser_settle).await;
                            if self.try_cloud_play(profile, candidates).await {
                                tracing::info!("Fallback step 4 delivered after auth retry");
                                return true;
                            }
                        }
                        Err(e) => tracing::warn!("Fallback auth retry failed: {}", e),
                    }
                }
                Err(e) => tracing::warn!("Token refresh for fallback auth failed: {}", e),
            }
        }

        // Step 5: forced transfer against the last known cloud id.
        if let Some(id) = last_cloud_id {
            tracing::warn!(
                "Forcing playback transfer to {} (id {}) without visibility confirmation",
                profile.name,
                id
            );
            if self.play_on(&id, profile.volume_preset).await {
                tracing::info!("Fallback step 5 delivered via forced transfer");
                return true;
            }
        } else {
            tracing::debug!("No cloud id ever seen for {}, skipping forced transfer", profile.name);
        }

        false
    }

    /// Policy-configured substitutes for the generic steps. Deterministic
    /// precedence: secondary output first, always-on receiver second.
    async fn run_substitutes(&self, profile: &DeviceProfile, policy: FallbackPolicy) -> bool {
        if matches!(
            policy,
            FallbackPolicy::SecondaryOutputOnly | FallbackPolicy::Both
        ) {
            if let Some(secondary) = self.secondary {
                match secondary.play(self.context_uri).await {
                    Ok(()) => {
                        tracing::info!("Fallback delivered via secondary output");
                        return true;
                    }
                    Err(e) => tracing::warn!("Secondary output failed: {}", e),
                }
            } else {
                tracing::warn!(
                    "Profile {} wants a secondary output but none is wired into the engine",
                    profile.name
                );
            }
        }

        if matches!(
            policy,
            FallbackPolicy::AlwaysOnReceiverOnly | FallbackPolicy::Both
        ) {
            if let Some(receiver) = &profile.always_on_receiver {
                if self.try_receiver_play(receiver, profile).await {
                    tracing::info!("Fallback delivered via always-on receiver {}", receiver);
                    return true;
                }
            }
        }

        false
    }

    /// Re-check cloud visibility and, on a match, stage/start/confirm
    async fn try_cloud_play(&self, profile: &DeviceProfile, candidates: &CandidateNames) -> bool {
        let devices = match self.api.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Cloud re-check failed: {}", e);
                return false;
            }
        };
        let Some(device) = pick_device(&devices, candidates) else {
            return false;
        };
        let id = device.id.clone();
        self.play_on(&id, profile.volume_preset).await
    }

    /// Deliver to the designated receiver by exact name
    async fn try_receiver_play(&self, receiver: &str, profile: &DeviceProfile) -> bool {
        let devices = match self.api.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Receiver lookup failed: {}", e);
                return false;
            }
        };
        let Some(device) = devices
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(receiver))
        else {
            tracing::warn!("Always-on receiver {} is not cloud-visible", receiver);
            return false;
        };
        let id = device.id.clone();
        self.play_on(&id, profile.volume_preset).await
    }

    /// Stage, start and confirm on a known device id
    async fn play_on(&self, device_id: &str, volume: u8) -> bool {
        if let Err(e) = self.playback.stage(device_id, volume).await {
            tracing::warn!("Fallback staging failed for {}: {}", device_id, e);
            return false;
        }
        if let Err(e) = self
            .playback
            .start(device_id, self.context_uri, self.shuffle)
            .await
        {
            tracing::warn!("Fallback playback start failed for {}: {}", device_id, e);
            return false;
        }
        let deadline = self.clock.now() + self.timings.failover_fire_after;
        self.playback.confirm_playing(device_id, deadline).await.is_ok()
    }

    /// One generic wake round: local HTTP probe, discovery re-query and a
    /// TCP reachability probe. No device-specific logic.
    async fn generic_wake_round(
        &self,
        profile: &DeviceProfile,
        candidates: &mut CandidateNames,
        addr: &mut Option<DeviceAddress>,
    ) {
        if let Some(a) = addr.as_ref() {
            if let Err(e) = self.zeroconf.wake(a, self.timings.wake_timeout).await {
                tracing::debug!("Fallback wake probe for {} failed: {}", profile.name, e);
            }
        }

        self.resolver.force_refresh().await;
        match self.resolver.resolve(&profile.name).await {
            Ok(device) => {
                candidates.add(&device.name);
                candidates.add(&device.instance_name);
                *addr = Some(device.addr);
            }
            Err(e) => tracing::debug!("Fallback re-discovery for {} failed: {}", profile.name, e),
        }

        if let Some(a) = addr.as_ref() {
            let reachable = probe_reachable(&a.address, a.port).await;
            tracing::debug!(
                "Reachability probe for {}:{}: {}",
                a.address,
                a.port,
                if reachable { "reachable" } else { "unreachable" }
            );
        }
    }
}

/// Bounded TCP connect used as a network-reachability probe
async fn probe_reachable(address: &str, port: u16) -> bool {
    let target = format!("{}:{}", address, port);
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(&target)).await,
        Ok(Ok(_))
    )
}
