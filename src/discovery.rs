use crate::clock::Clock;
use crate::error::{AlarmError, Result};
use crate::types::{DeviceAddress, DeviceStatus, DiscoveredDevice};
use crate::zeroconf::ZeroconfClient;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// How long a cache entry stays fresh; also the background refresh period
pub const CACHE_TTL: Duration = Duration::from_secs(120);

/// Budget for the per-device info probe run during a refresh
const INFO_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// TXT record keys that may carry a friendly name, in priority order
const TXT_NAME_FIELDS: &[&str] = &["CN", "Name", "DisplayName", "FriendlyName"];

/// TXT record key carrying the control path
pub const TXT_CPATH: &str = "CPath";

/// One service advertisement seen on the local network
#[derive(Debug, Clone)]
pub struct ServiceAdvert {
    /// Raw instance identifier, service-type suffix stripped
    pub instance: String,
    pub address: String,
    pub port: u16,
    /// Advertisement metadata key/value pairs
    pub txt: HashMap<String, String>,
}

/// Transport seam for the local service-discovery protocol.
///
/// The engine never touches the mDNS library directly; it consumes
/// advertisement snapshots through this trait and owns all caching and
/// naming policy around them.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Collect advertisements for up to `window`
    async fn browse(&self, window: Duration) -> Result<Vec<ServiceAdvert>>;
}

/// Read surface of the discovery cache, as consumed by the orchestrator
/// and the device-list query
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// Resolve a friendly device name to its last-known local endpoint
    async fn resolve(&self, name: &str) -> Result<DiscoveredDevice>;

    /// Run one full browse/probe cycle now
    async fn force_refresh(&self);

    /// Snapshot of everything currently cached
    fn device_list(&self) -> Vec<DeviceStatus>;
}

/// TTL cache over the discovery transport.
///
/// A background task refreshes the cache on the TTL period and whenever a
/// reader nudges it. Readers never wait on a refresh: a stale value is
/// returned immediately and the nudge happens on the side. Only a cache
/// that has never completed a refresh performs a synchronous browse,
/// bounded by the configured discovery timeout.
pub struct DiscoveryCache {
    entries: RwLock<HashMap<String, DiscoveredDevice>>,
    browser: Arc<dyn ServiceBrowser>,
    probe: ZeroconfClient,
    clock: Arc<dyn Clock>,
    browse_window: Duration,
    cold: AtomicBool,
    refresh_tx: mpsc::Sender<()>,
    refresh_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryCache {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        probe: ZeroconfClient,
        clock: Arc<dyn Clock>,
        browse_window: Duration,
    ) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        Self {
            entries: RwLock::new(HashMap::new()),
            browser,
            probe,
            clock,
            browse_window,
            cold: AtomicBool::new(true),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            stop_tx: Mutex::new(None),
            task_handle: Mutex::new(None),
        }
    }

    /// Start the background refresh task.
    ///
    /// Must be called from within a tokio runtime. Idempotent: calling
    /// start on a running cache is a no-op.
    pub fn start(self: Arc<Self>) {
        let mut rx_slot = self.refresh_rx.lock().unwrap();
        let Some(mut refresh_rx) = rx_slot.take() else {
            return;
        };
        drop(rx_slot);

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let cache = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            cache.refresh_once().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("Discovery cache refresh stopped");
                        break;
                    }
                    _ = cache.clock.sleep(CACHE_TTL) => {}
                    nudge = refresh_rx.recv() => {
                        if nudge.is_none() {
                            break;
                        }
                    }
                }
                cache.refresh_once().await;
            }
        });
        *self.task_handle.lock().unwrap() = Some(handle);
    }

    /// Stop the background refresh task. Cached entries stay readable.
    pub async fn stop(&self) {
        let tx = self.stop_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let handle = self.task_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }

    /// One full browse + probe + cache-write cycle
    async fn refresh_once(&self) {
        let adverts = match self.browser.browse(self.browse_window).await {
            Ok(adverts) => adverts,
            Err(e) => {
                tracing::warn!("Discovery browse failed: {}", e);
                return;
            }
        };
        tracing::debug!("Discovery browse returned {} advert(s)", adverts.len());

        let probes = adverts.into_iter().map(|advert| self.inspect(advert));
        let devices = join_all(probes).await;

        let mut entries = self.entries.write().unwrap();
        for device in devices {
            let name_key = normalize_key(&device.name);
            let instance_key = normalize_key(&device.instance_name);
            if instance_key != name_key {
                entries.insert(instance_key, device.clone());
            }
            entries.insert(name_key, device);
        }
        drop(entries);
        self.cold.store(false, Ordering::Release);
    }

    /// Probe one advertisement and build its cache entry.
    ///
    /// The device's own info endpoint is the preferred name source; an
    /// unreachable device still gets an entry, named from its
    /// advertisement, flagged offline.
    async fn inspect(&self, advert: ServiceAdvert) -> DiscoveredDevice {
        let addr = DeviceAddress::new(
            advert.address.clone(),
            advert.port,
            advert.txt.get(TXT_CPATH).map(String::as_str),
        );

        let started = Instant::now();
        let (info, online, latency, last_error) =
            match self.probe.get_info(&addr, INFO_PROBE_TIMEOUT).await {
                Ok(info) => (Some(info), true, Some(started.elapsed()), None),
                Err(e) => (None, false, None, Some(e.to_string())),
            };

        let name = resolve_friendly_name(info.as_ref(), &advert);
        tracing::debug!(
            "Discovered {} at {} (online: {})",
            name,
            addr.endpoint(),
            online
        );

        DiscoveredDevice {
            name,
            instance_name: advert.instance,
            addr,
            online,
            last_seen: self.clock.now(),
            latency,
            last_error,
        }
    }

    fn lookup(&self, key: &str) -> Option<DiscoveredDevice> {
        let entries = self.entries.read().unwrap();
        entries.get(key).cloned()
    }

    fn nudge_refresh(&self) {
        // Full channel means a refresh is already queued.
        let _ = self.refresh_tx.try_send(());
    }

    #[cfg(test)]
    pub(crate) fn take_refresh_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.refresh_rx.lock().unwrap().take()
    }
}

#[async_trait]
impl DeviceResolver for DiscoveryCache {
    async fn resolve(&self, name: &str) -> Result<DiscoveredDevice> {
        let key = normalize_key(name);

        if let Some(found) = self.lookup(&key) {
            if self.clock.now().duration_since(found.last_seen) > CACHE_TTL {
                tracing::debug!("Cache entry for {} is stale, scheduling refresh", name);
                self.nudge_refresh();
            }
            return Ok(found);
        }

        if self.cold.load(Ordering::Acquire) {
            // Cold cache: the one case a reader waits on discovery.
            tracing::debug!("Cold cache, inline discovery for {}", name);
            self.refresh_once().await;
            if let Some(found) = self.lookup(&key) {
                return Ok(found);
            }
        } else {
            self.nudge_refresh();
        }

        Err(AlarmError::DeviceNotFound(name.to_string()))
    }

    async fn force_refresh(&self) {
        self.refresh_once().await;
    }

    fn device_list(&self) -> Vec<DeviceStatus> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut list: Vec<DeviceStatus> = entries
            .values()
            .filter(|d| seen.insert(d.name.clone()))
            .map(|d| DeviceStatus {
                name: d.name.clone(),
                address: d.addr.address.clone(),
                port: d.addr.port,
                online: d.online,
                last_seen_secs: now.saturating_duration_since(d.last_seen).as_secs(),
                latency_ms: d.latency.map(|l| l.as_millis() as u64),
                error: d.last_error.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

pub(crate) fn normalize_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Friendly-name resolution priority: device-reported remote name, then
/// display name, then advertisement TXT fields, then the instance id with
/// technical suffixes stripped, then the raw instance id.
fn resolve_friendly_name(info: Option<&crate::types::DeviceInfo>, advert: &ServiceAdvert) -> String {
    if let Some(info) = info {
        for candidate in [info.remote_name.as_deref(), info.display_name.as_deref()] {
            if let Some(name) = nonempty(candidate) {
                return name;
            }
        }
    }
    for field in TXT_NAME_FIELDS {
        if let Some(name) = nonempty(advert.txt.get(*field).map(String::as_str)) {
            return name;
        }
    }
    if let Some(cleaned) = clean_instance_name(&advert.instance) {
        return cleaned;
    }
    advert.instance.clone()
}

fn nonempty(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Strip common technical suffixes from an mDNS instance identifier
fn clean_instance_name(instance: &str) -> Option<String> {
    const SUFFIXES: &[&str] = &[
        "._spotify-connect._tcp.local.",
        "._spotify-connect._tcp.local",
        "._spotify-connect",
        "_spotify-connect",
        ".spotify-connect",
        "._tcp.local.",
        "._tcp.local",
    ];
    let lower = instance.to_lowercase();
    for suffix in SUFFIXES {
        if lower.ends_with(suffix) {
            let cleaned = instance[..instance.len() - suffix.len()]
                .trim_matches('.')
                .trim();
            if cleaned.len() >= 3 {
                return Some(cleaned.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    /// Browser returning a fixed advert set, counting calls
    struct FakeBrowser {
        adverts: Vec<ServiceAdvert>,
        calls: AtomicUsize,
    }

    impl FakeBrowser {
        fn new(adverts: Vec<ServiceAdvert>) -> Self {
            Self {
                adverts,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServiceBrowser for FakeBrowser {
        async fn browse(&self, _window: Duration) -> Result<Vec<ServiceAdvert>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.adverts.clone())
        }
    }

    fn kitchen_advert() -> ServiceAdvert {
        let mut txt = HashMap::new();
        txt.insert("CN".to_string(), "Kitchen".to_string());
        txt.insert(TXT_CPATH.to_string(), "/zc".to_string());
        ServiceAdvert {
            instance: "kitchen-9f2a._spotify-connect._tcp.local.".to_string(),
            // Port 1 on loopback refuses connections immediately, so the
            // info probe fails fast and the entry lands offline.
            address: "127.0.0.1".to_string(),
            port: 1,
            txt,
        }
    }

    fn cache_with(browser: Arc<FakeBrowser>, clock: Arc<ManualClock>) -> Arc<DiscoveryCache> {
        Arc::new(DiscoveryCache::new(
            browser,
            ZeroconfClient::new(),
            clock,
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn cold_cache_does_inline_discovery() {
        let browser = Arc::new(FakeBrowser::new(vec![kitchen_advert()]));
        let cache = cache_with(browser.clone(), Arc::new(ManualClock::new()));

        let device = cache.resolve("Kitchen").await.unwrap();
        assert_eq!(device.name, "Kitchen");
        assert_eq!(device.addr.cpath, "/zc");
        assert!(!device.online);
        assert_eq!(browser.calls(), 1);
    }

    #[tokio::test]
    async fn stale_entry_returned_immediately_with_refresh_nudge() {
        let browser = Arc::new(FakeBrowser::new(vec![kitchen_advert()]));
        let clock = Arc::new(ManualClock::new());
        let cache = cache_with(browser.clone(), clock.clone());
        let mut nudges = cache.take_refresh_rx().unwrap();

        cache.resolve("Kitchen").await.unwrap();
        assert_eq!(browser.calls(), 1);

        clock.advance(CACHE_TTL + Duration::from_secs(1));

        // Past TTL: the reader still gets the old value without waiting,
        // and a background refresh is queued.
        let device = cache.resolve("Kitchen").await.unwrap();
        assert_eq!(device.name, "Kitchen");
        assert_eq!(browser.calls(), 1);
        assert!(nudges.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_name_on_warm_cache_fails_without_browsing() {
        let browser = Arc::new(FakeBrowser::new(vec![kitchen_advert()]));
        let cache = cache_with(browser.clone(), Arc::new(ManualClock::new()));

        cache.resolve("Kitchen").await.unwrap();
        let err = cache.resolve("Bedroom").await.unwrap_err();
        assert!(matches!(err, AlarmError::DeviceNotFound(_)));
        assert_eq!(browser.calls(), 1);
    }

    #[tokio::test]
    async fn instance_alias_resolves_to_same_entry() {
        let browser = Arc::new(FakeBrowser::new(vec![kitchen_advert()]));
        let cache = cache_with(browser, Arc::new(ManualClock::new()));

        let by_name = cache.resolve("kitchen").await.unwrap();
        let by_instance = cache
            .resolve("kitchen-9f2a._spotify-connect._tcp.local.")
            .await
            .unwrap();
        assert_eq!(by_name.name, by_instance.name);
    }

    #[tokio::test]
    async fn device_list_reports_cached_entries_once() {
        let browser = Arc::new(FakeBrowser::new(vec![kitchen_advert()]));
        let cache = cache_with(browser, Arc::new(ManualClock::new()));

        cache.resolve("Kitchen").await.unwrap();
        let list = cache.device_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "Kitchen");
        assert!(!list[0].online);
        assert!(list[0].error.is_some());
    }

    #[test]
    fn instance_cleanup_strips_technical_suffixes() {
        assert_eq!(
            clean_instance_name("Living Room._spotify-connect._tcp.local."),
            Some("Living Room".to_string())
        );
        assert_eq!(
            clean_instance_name("soundbar_spotify-connect"),
            Some("soundbar".to_string())
        );
        assert_eq!(clean_instance_name("Living Room"), None);
    }
}
