use crate::clock::Clock;
use crate::config::Timings;
use crate::error::{AlarmError, Result};
use crate::spotify::SpotifyApi;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives the remote playback calls for one target device.
///
/// Staging (transfer + volume) and starting are kept separate so the
/// orchestrator can hold a staged device until the fire instant.
pub struct PlaybackController {
    api: Arc<SpotifyApi>,
    clock: Arc<dyn Clock>,
    retry_404_delay: Duration,
    confirm_poll_interval: Duration,
}

impl PlaybackController {
    pub fn new(api: Arc<SpotifyApi>, clock: Arc<dyn Clock>, timings: &Timings) -> Self {
        Self {
            api,
            clock,
            retry_404_delay: timings.retry_404_delay,
            confirm_poll_interval: timings.confirm_poll_interval,
        }
    }

    /// Transfer playback to the device and apply its volume preset.
    ///
    /// A not-found answer to the transfer gets exactly one retry after a
    /// short fixed delay; it absorbs the race between a device appearing
    /// in the cloud list and actually accepting transfers. A second
    /// not-found is terminal. Volume failures are tolerated: some
    /// receivers simply do not expose volume control.
    pub async fn stage(&self, device_id: &str, volume: u8) -> Result<()> {
        tracing::debug!("Staging device {} (volume {})", device_id, volume);

        match self.api.transfer(device_id, false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "Transfer to {} answered not-found, retrying once in {:?}",
                    device_id,
                    self.retry_404_delay
                );
                self.clock.sleep(self.retry_404_delay).await;
                self.api.transfer(device_id, false).await?;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.api.set_volume(device_id, volume).await {
            tracing::warn!("Volume control not supported for {}: {}", device_id, e);
        }

        Ok(())
    }

    /// Start the configured context on the device
    pub async fn start(&self, device_id: &str, context_uri: &str, shuffle: bool) -> Result<()> {
        tracing::info!(
            "Starting playback on {} with context {} (shuffle: {})",
            device_id,
            context_uri,
            shuffle
        );
        if shuffle {
            if let Err(e) = self.api.set_shuffle(device_id, true).await {
                tracing::warn!("Shuffle not supported for {}: {}", device_id, e);
            }
        }
        self.api.start_context(device_id, context_uri).await
    }

    /// Poll playback state until the device reports actively playing.
    ///
    /// An accepted transfer alone never counts: only observed playing
    /// state does. Errors during individual polls are retried until the
    /// deadline.
    pub async fn confirm_playing(&self, device_id: &str, deadline: Instant) -> Result<()> {
        loop {
            match self.api.playback_state().await {
                Ok(Some(state))
                    if state.is_playing && state.device.id.as_deref() == Some(device_id) =>
                {
                    tracing::info!("Playback confirmed on {}", device_id);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Confirmation check failed: {}", e),
            }
            if self.clock.now() >= deadline {
                tracing::error!("Playback not confirmed on {} by deadline", device_id);
                return Err(AlarmError::Timeout);
            }
            self.clock.sleep(self.confirm_poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SpotifyCredentials;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> SpotifyCredentials {
        SpotifyCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: "refresh".into(),
            username: None,
        }
    }

    async fn mock_token_endpoint(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "token",
                "token_type": "Bearer",
                "expires_in": 3600,
            })))
            .mount(server)
            .await;
    }

    async fn make_controller(server: &MockServer, clock: Arc<ManualClock>) -> PlaybackController {
        let api = SpotifyApi::builder(credentials())
            .api_base(server.uri())
            .accounts_base(server.uri())
            .clock(clock.clone())
            .build();
        PlaybackController::new(Arc::new(api), clock, &Timings::default())
    }

    #[tokio::test]
    async fn transfer_not_found_is_retried_exactly_once() {
        let server = MockServer::start().await;
        mock_token_endpoint(&server).await;

        Mock::given(method("PUT"))
            .and(path("/me/player"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": { "status": 404, "message": "Device not found" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/me/player"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/me/player/volume"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let controller = make_controller(&server, Arc::new(ManualClock::new())).await;
        controller.stage("dev1", 40).await.unwrap();
    }

    #[tokio::test]
    async fn second_not_found_is_terminal() {
        let server = MockServer::start().await;
        mock_token_endpoint(&server).await;

        Mock::given(method("PUT"))
            .and(path("/me/player"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": { "status": 404, "message": "Device not found" }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let controller = make_controller(&server, Arc::new(ManualClock::new())).await;
        let err = controller.stage("dev1", 40).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn volume_failure_does_not_fail_staging() {
        let server = MockServer::start().await;
        mock_token_endpoint(&server).await;

        Mock::given(method("PUT"))
            .and(path("/me/player"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/me/player/volume"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": { "status": 403, "message": "Cannot control volume" }
            })))
            .mount(&server)
            .await;

        let controller = make_controller(&server, Arc::new(ManualClock::new())).await;
        controller.stage("dev1", 40).await.unwrap();
    }

    #[tokio::test]
    async fn confirmation_requires_observed_playing_state() {
        let server = MockServer::start().await;
        mock_token_endpoint(&server).await;

        // Playback state reports a different device: never confirms.
        Mock::given(method("GET"))
            .and(path("/me/player"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device": { "id": "other", "name": "Other" },
                "is_playing": true,
            })))
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new());
        let controller = make_controller(&server, clock.clone()).await;
        let deadline = clock.now() + Duration::from_secs(2);
        let err = controller.confirm_playing("dev1", deadline).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn confirmation_succeeds_when_device_plays() {
        let server = MockServer::start().await;
        mock_token_endpoint(&server).await;

        Mock::given(method("GET"))
            .and(path("/me/player"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device": { "id": "dev1", "name": "Kitchen" },
                "is_playing": true,
            })))
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new());
        let controller = make_controller(&server, clock.clone()).await;
        let deadline = clock.now() + Duration::from_secs(2);
        controller.confirm_playing("dev1", deadline).await.unwrap();
    }
}
