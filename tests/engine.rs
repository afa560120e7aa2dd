//! End-to-end orchestration tests against a mocked cloud API and mocked
//! local device endpoints, with the timeline driven by a virtual clock.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wakeify::{
    AlarmEngine, AlarmError, Branch, Clock, DeviceProfile, DeviceResolver, DeviceStatus,
    DiscoveredDevice, EngineConfig, FailureKind, ManualClock, Result, RunState,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Resolver that never finds anything: the "device never advertises" case
struct EmptyResolver;

#[async_trait]
impl DeviceResolver for EmptyResolver {
    async fn resolve(&self, name: &str) -> Result<DiscoveredDevice> {
        Err(AlarmError::DeviceNotFound(name.to_string()))
    }

    async fn force_refresh(&self) {}

    fn device_list(&self) -> Vec<DeviceStatus> {
        Vec::new()
    }
}

fn base_config(targets: Vec<DeviceProfile>) -> EngineConfig {
    let mut cfg = EngineConfig::from_yaml_str(
        r#"
context_uri: "spotify:playlist:morning"
spotify:
  client_id: "id"
  client_secret: "secret"
  refresh_token: "refresh"
"#,
    )
    .unwrap();
    cfg.targets = targets;
    cfg
}

fn engine_against(
    server: &MockServer,
    clock: Arc<ManualClock>,
    targets: Vec<DeviceProfile>,
) -> AlarmEngine {
    AlarmEngine::builder(base_config(targets))
        .api_base(server.uri())
        .accounts_base(server.uri())
        .clock(clock)
        .resolver(Arc::new(EmptyResolver))
        .build()
        .unwrap()
}

async fn mount_token_endpoint(server: &MockServer) {
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

async fn mount_playback_endpoints(server: &MockServer, playing_device_id: &str) {
    Mock::given(method("PUT"))
        .and(path("/me/player"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/me/player/volume"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/me/player/play"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "device": { "id": playing_device_id, "name": "whatever" },
            "is_playing": true,
        })))
        .mount(server)
        .await;
}

fn device_list_body(entries: &[(&str, &str)]) -> serde_json::Value {
    serde_json::json!({
        "devices": entries
            .iter()
            .map(|(id, name)| {
                serde_json::json!({
                    "id": id,
                    "name": name,
                    "type": "Speaker",
                    "is_active": false,
                    "is_restricted": false,
                    "volume_percent": 30,
                })
            })
            .collect::<Vec<_>>(),
    })
}

#[tokio::test]
async fn fast_path_when_device_already_cloud_visible() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    mount_playback_endpoints(&server, "dev-kitchen").await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(device_list_body(&[("dev-kitchen", "Kitchen")])),
        )
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![DeviceProfile::new("Kitchen")]);

    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.branch, Branch::FastPath);
    assert_eq!(outcome.furthest, RunState::Playing);
    assert!(outcome.failure.is_none());
    // Discovery, wake and auth are never invoked on the fast path.
    assert!(outcome.metrics.discovery.is_none());
    assert!(outcome.metrics.wake.is_none());
    assert!(outcome.metrics.auth.is_none());
    // No debounce either: the whole run fits well under two seconds.
    assert!(outcome.total < Duration::from_secs(2));
}

#[tokio::test]
async fn full_path_matches_via_harvested_name_then_learns_it() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    mount_playback_endpoints(&server, "dev-ks").await;

    // Local control endpoint: device answers info and registration.
    Mock::given(method("GET"))
        .and(path("/zc/"))
        .and(query_param("action", "getInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": 101,
            "statusString": "OK",
            "remoteName": "Kitchen Speaker",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/zc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": 101,
            "statusString": "OK",
        })))
        .mount(&server)
        .await;

    // The fast-path check sees an empty list; from then on the device is
    // visible under its cloud name, which only the harvested info matches.
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body(&[])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(device_list_body(&[("dev-ks", "Kitchen Speaker")])),
        )
        .mount(&server)
        .await;

    let mut profile = DeviceProfile::new("Kitchen");
    profile.address = Some("127.0.0.1".to_string());
    profile.port = Some(server.address().port());
    profile.cpath = Some("/zc".to_string());

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![profile]);

    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.branch, Branch::FullPath);
    assert_eq!(outcome.furthest, RunState::Playing);
    assert!(outcome.metrics.auth.unwrap().ok);
    assert!(outcome.metrics.wake.unwrap().ok);

    // The cloud name was learned: the next run takes the fast path.
    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.branch, Branch::FastPath);
}

#[tokio::test]
async fn poll_deadline_extended_only_after_successful_auth() {
    // Auth succeeds but the device never appears: polling must run for
    // the base deadline plus the extension before fallback fires.
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/zc/"))
        .and(query_param("action", "getInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": 101,
            "remoteName": "Kitchen",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/zc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": 101,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body(&[])))
        .mount(&server)
        .await;

    let mut profile = DeviceProfile::new("Kitchen");
    profile.address = Some("127.0.0.1".to_string());
    profile.port = Some(server.address().port());
    profile.cpath = Some("/zc".to_string());

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![profile]);

    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::FallbackExhausted));

    let poll = outcome.metrics.cloud_poll.unwrap();
    assert!(!poll.ok);
    assert!(
        poll.duration >= Duration::from_secs(35) && poll.duration < Duration::from_secs(36),
        "expected extended 35s deadline, got {:?}",
        poll.duration
    );
}

#[tokio::test]
async fn poll_deadline_stays_at_base_when_auth_fails() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/zc/"))
        .and(query_param("action", "getInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": 101,
            "remoteName": "Kitchen",
        })))
        .mount(&server)
        .await;
    // Registration is rejected: the device is not worth the longer wait.
    Mock::given(method("POST"))
        .and(path("/zc"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body(&[])))
        .mount(&server)
        .await;

    let mut profile = DeviceProfile::new("Kitchen");
    profile.address = Some("127.0.0.1".to_string());
    profile.port = Some(server.address().port());
    profile.cpath = Some("/zc".to_string());

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![profile]);

    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.metrics.first_error, Some(FailureKind::AuthFailure));

    let poll = outcome.metrics.cloud_poll.unwrap();
    assert!(
        poll.duration >= Duration::from_secs(20) && poll.duration < Duration::from_secs(21),
        "expected base 20s deadline, got {:?}",
        poll.duration
    );
}

#[tokio::test]
async fn never_advertising_device_exhausts_fallback_from_unknown() {
    // No local presence, no cloud visibility, nothing configured: every
    // phase degrades to a no-op and the cascade runs dry.
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body(&[])))
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![DeviceProfile::new("Kitchen")]);

    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.branch, Branch::FallbackPath);
    assert_eq!(outcome.failure, Some(FailureKind::FallbackExhausted));
    assert_eq!(outcome.furthest, RunState::Unknown);
    assert_eq!(
        outcome.metrics.first_error,
        Some(FailureKind::DiscoveryNotFound)
    );
    assert!(!outcome.metrics.discovery.unwrap().ok);
    // Wake and auth never ran: there was no address to call.
    assert!(outcome.metrics.wake.is_none());
    assert!(outcome.metrics.auth.is_none());
}

#[tokio::test]
async fn fourth_run_bypasses_local_phases_after_three_failures() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body(&[])))
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![DeviceProfile::new("Kitchen")]);

    for _ in 0..3 {
        let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
        assert!(!outcome.success);
        assert!(!outcome.metrics.circuit_bypassed);
    }
    assert!(engine.device_status("Kitchen").unwrap().breaker.is_open);

    // Within the recovery window the fourth run skips discovery/wake/auth
    // outright, whatever the network looks like.
    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
    assert!(outcome.metrics.circuit_bypassed);
    assert!(outcome.metrics.discovery.is_none());
    assert!(outcome.metrics.wake.is_none());
    assert!(outcome.metrics.auth.is_none());
    // And the poll deadline gets no auth extension.
    let poll = outcome.metrics.cloud_poll.unwrap();
    assert!(poll.duration < Duration::from_secs(21));
}

#[tokio::test]
async fn cancelled_run_reports_cancelled_not_failed() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/me/player/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body(&[])))
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![DeviceProfile::new("Kitchen")]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = engine
        .run_with_cancel("Kitchen", clock.now(), &cancel)
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::Cancelled));

    // The per-device lock was released: a fresh run proceeds normally.
    let outcome = engine.run("Kitchen", clock.now()).await.unwrap();
    assert_eq!(outcome.failure, Some(FailureKind::FallbackExhausted));
}

#[tokio::test]
async fn unknown_target_is_a_configuration_error() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    let clock = Arc::new(ManualClock::new());
    let engine = engine_against(&server, clock.clone(), vec![]);

    let err = engine.run("Ghost", clock.now()).await.unwrap_err();
    assert!(matches!(err, AlarmError::UnknownDevice(_)));
}
