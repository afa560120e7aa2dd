use crate::discovery::{ServiceAdvert, ServiceBrowser};
use crate::error::{AlarmError, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::time::Duration;

/// Service type Connect-style receivers advertise under
pub const SPOTIFY_CONNECT_SERVICE: &str = "_spotify-connect._tcp.local.";

/// TXT keys the engine consumes from advertisements
const TXT_KEYS: &[&str] = &["CPath", "VERSION", "CN", "Name", "DisplayName", "FriendlyName"];

/// mDNS-backed [`ServiceBrowser`] (no system daemon dependency).
///
/// Each browse spins up a short-lived daemon, collects resolved services
/// for the window, and tears everything down again.
pub struct MdnsBrowser {
    service_type: String,
}

impl MdnsBrowser {
    pub fn new() -> Self {
        Self {
            service_type: SPOTIFY_CONNECT_SERVICE.to_string(),
        }
    }

    /// Browse a different service type (e.g. for tests against a local
    /// dummy service)
    pub fn with_service_type(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
        }
    }
}

impl Default for MdnsBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn browse(&self, window: Duration) -> Result<Vec<ServiceAdvert>> {
        let daemon = ServiceDaemon::new().map_err(|e| AlarmError::Discovery(e.to_string()))?;
        let receiver = match daemon.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = daemon.shutdown();
                return Err(AlarmError::Discovery(e.to_string()));
            }
        };

        let deadline = tokio::time::Instant::now() + window;
        let mut by_instance: HashMap<String, ServiceAdvert> = HashMap::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(service))) => {
                    if let Some(advert) = advert_from_resolved(&service, &self.service_type) {
                        by_instance.insert(advert.instance.clone(), advert);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }

        if let Err(e) = daemon.stop_browse(&self.service_type) {
            tracing::debug!("Failed to stop mDNS browse cleanly: {}", e);
        }
        let _ = daemon.shutdown();

        Ok(by_instance.into_values().collect())
    }
}

fn advert_from_resolved(
    service: &mdns_sd::ServiceInfo,
    service_type: &str,
) -> Option<ServiceAdvert> {
    // Prefer IPv4: the local control endpoints bind v4 on most receivers.
    let mut v4_addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    v4_addresses.sort();
    let address = v4_addresses.first().map(ToString::to_string)?;

    let port = service.get_port();
    let instance = instance_from_fullname(service.get_fullname(), service_type);

    let mut txt = HashMap::new();
    for key in TXT_KEYS {
        if let Some(value) = service.get_property_val_str(key) {
            let value = value.trim();
            if !value.is_empty() {
                txt.insert((*key).to_string(), value.to_string());
            }
        }
    }

    Some(ServiceAdvert {
        instance,
        address,
        port,
        txt,
    })
}

fn instance_from_fullname(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type);
    fullname
        .trim()
        .strip_suffix(suffix.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_from_fullname(
                "Kitchen._spotify-connect._tcp.local.",
                SPOTIFY_CONNECT_SERVICE
            ),
            "Kitchen"
        );
        assert_eq!(
            instance_from_fullname("Kitchen", SPOTIFY_CONNECT_SERVICE),
            "Kitchen"
        );
    }
}
