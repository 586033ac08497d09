//! Service discovery: multicast browsing, unicast DNS-SD lookup, and node
//! advertisement.

pub mod unicast;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use shared::protocol::{ApiVersion, Protocol, ResourceKind, ServiceType, TXT_API_AUTH, TXT_API_PROTO, TXT_API_VER};
use crate::error::DiscoveryError;
use crate::mdns::MdnsBrowser;
use crate::service::ServiceRecord;
pub use crate::mdns::{BrowserEvent, ServiceWatch};
pub use unicast::{DnsResolver, SrvTarget, SystemResolver};

/// Produces candidate service records.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Listen for announcements until none has arrived for `quiet_window`.
    async fn browse_multicast(
        &self,
        service: ServiceType,
        protocol: Protocol,
        quiet_window: Duration,
        known: &[ServiceRecord],
    ) -> Result<Vec<ServiceRecord>, DiscoveryError>;

    /// One-shot PTR lookup under `domain`, resolving each instance.
    async fn browse_unicast(
        &self,
        service: ServiceType,
        protocol: Protocol,
        domain: &str,
    ) -> Result<Vec<ServiceRecord>, DiscoveryError>;

    /// Continuous multicast announcements for a service type.
    fn watch(&self, service: ServiceType, protocol: Protocol) -> Result<ServiceWatch, DiscoveryError>;

    fn stop(&self, service: ServiceType, protocol: Protocol);
}

/// Publishes this node for peer-to-peer discovery.
#[async_trait]
pub trait Advertiser: Send + Sync {
    /// Announce, replacing any active advertisement.
    async fn advertise(&self, advert: &NodeAdvertisement) -> Result<(), DiscoveryError>;

    async fn withdraw(&self) -> Result<(), DiscoveryError>;
}

/// What a node announces about itself while in peer-to-peer mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAdvertisement {
    pub instance: String,
    pub port: u16,
    pub api_proto: String,
    pub api_versions: Vec<ApiVersion>,
    pub api_auth: bool,
    /// Per-kind version counters, indexed by `ResourceKind::index`
    pub versions: [u8; 6],
}

impl NodeAdvertisement {
    pub fn txt_records(&self) -> Vec<(String, String)> {
        let api_ver = self
            .api_versions
            .iter()
            .map(ApiVersion::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut records = vec![
            (TXT_API_PROTO.to_string(), self.api_proto.clone()),
            (TXT_API_VER.to_string(), api_ver),
            (TXT_API_AUTH.to_string(), self.api_auth.to_string()),
        ];
        records.extend(ResourceKind::ALL.iter().map(|kind| {
            (
                kind.version_txt_key().to_string(),
                self.versions[kind.index()].to_string(),
            )
        }));
        records
    }
}

/// DNS-SD discovery over mDNS and, when configured, unicast DNS.
pub struct DnsSdDiscovery {
    mdns: Option<Arc<MdnsBrowser>>,
    resolver: Option<Arc<dyn DnsResolver>>,
}

impl DnsSdDiscovery {
    pub fn new(mdns: Option<Arc<MdnsBrowser>>, resolver: Option<Arc<dyn DnsResolver>>) -> Self {
        Self { mdns, resolver }
    }

    fn mdns(&self) -> Result<&MdnsBrowser, DiscoveryError> {
        self.mdns.as_deref().ok_or(DiscoveryError::MulticastDisabled)
    }
}

#[async_trait]
impl Discovery for DnsSdDiscovery {
    async fn browse_multicast(
        &self,
        service: ServiceType,
        protocol: Protocol,
        quiet_window: Duration,
        known: &[ServiceRecord],
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        self.mdns()?
            .browse(&service.mdns_type(protocol), quiet_window, known)
            .await
    }

    async fn browse_unicast(
        &self,
        service: ServiceType,
        protocol: Protocol,
        domain: &str,
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let resolver = self.resolver.as_deref().ok_or(DiscoveryError::UnicastUnavailable)?;
        unicast::browse_unicast(resolver, service, protocol, domain).await
    }

    fn watch(&self, service: ServiceType, protocol: Protocol) -> Result<ServiceWatch, DiscoveryError> {
        self.mdns()?.watch(&service.mdns_type(protocol))
    }

    fn stop(&self, service: ServiceType, protocol: Protocol) {
        if let Some(mdns) = &self.mdns {
            mdns.stop(&service.mdns_type(protocol));
        }
    }
}

/// How a component looks for one kind of service.
#[derive(Debug, Clone)]
pub struct DiscoveryPlan {
    pub service: ServiceType,
    pub protocol: Protocol,
    pub search_domain: Option<String>,
    pub multicast: bool,
    pub quiet_window: Duration,
}

/// Build the candidate list for one discovery round.
///
/// `multicast_known` is the caller's running set of multicast records; it is
/// refreshed by a browse when `refresh` is set or it is empty. Lookup
/// failures are logged and contribute no candidates.
pub async fn gather_candidates(
    discovery: &dyn Discovery,
    plan: &DiscoveryPlan,
    multicast_known: &mut Vec<ServiceRecord>,
    refresh: bool,
) -> Vec<ServiceRecord> {
    let mut candidates = Vec::new();

    if let Some(domain) = &plan.search_domain {
        match discovery.browse_unicast(plan.service, plan.protocol, domain).await {
            Ok(records) => candidates.extend(records),
            Err(e) => tracing::warn!("Unicast discovery of {} under {} failed: {}", plan.service.name(), domain, e),
        }
    }

    if plan.multicast {
        if refresh || multicast_known.is_empty() {
            match discovery
                .browse_multicast(plan.service, plan.protocol, plan.quiet_window, multicast_known)
                .await
            {
                Ok(records) => *multicast_known = records,
                Err(e) => tracing::warn!("Multicast discovery of {} failed: {}", plan.service.name(), e),
            }
        }
        multicast_known.retain(|r| !r.is_expired());
        candidates.extend(multicast_known.iter().cloned());
    }

    let mut unique: Vec<ServiceRecord> = Vec::with_capacity(candidates.len());
    for record in candidates {
        if record.is_expired() || unique.iter().any(|r| r.name == record.name) {
            continue;
        }
        unique.push(record);
    }
    unique
}

/// Add a multicast announcement to `known` unless an instance with the same
/// name is already present. Returns true if it was added.
pub fn merge_announcement(known: &mut Vec<ServiceRecord>, record: ServiceRecord) -> bool {
    if known.iter().any(|r| r.name == record.name) {
        return false;
    }
    known.push(record);
    true
}

/// Next event from an optional watch; pends forever without one.
pub async fn next_event(watch: &mut Option<ServiceWatch>) -> Option<BrowserEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDiscovery;

    fn plan(domain: Option<&str>) -> DiscoveryPlan {
        DiscoveryPlan {
            service: ServiceType::Register,
            protocol: Protocol::Tcp,
            search_domain: domain.map(str::to_string),
            multicast: true,
            quiet_window: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_advertisement_txt_records() {
        let advert = NodeAdvertisement {
            instance: "node-1".to_string(),
            port: 3212,
            api_proto: "http".to_string(),
            api_versions: vec![ApiVersion::new(1, 2), ApiVersion::new(1, 3)],
            api_auth: false,
            versions: [1, 2, 3, 4, 5, 255],
        };
        let txt = advert.txt_records();
        let get = |k: &str| txt.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("api_ver"), Some("v1.2,v1.3"));
        assert_eq!(get("api_auth"), Some("false"));
        assert_eq!(get("ver_slf"), Some("1"));
        assert_eq!(get("ver_dvc"), Some("2"));
        assert_eq!(get("ver_src"), Some("3"));
        assert_eq!(get("ver_flw"), Some("4"));
        assert_eq!(get("ver_snd"), Some("5"));
        assert_eq!(get("ver_rcv"), Some("255"));
    }

    #[test]
    fn test_merge_announcement_is_idempotent() {
        let mut known = Vec::new();
        assert!(merge_announcement(&mut known, ServiceRecord::new("a", "h", 1)));
        assert!(!merge_announcement(&mut known, ServiceRecord::new("a", "h", 1)));
        assert_eq!(known.len(), 1);
    }

    #[tokio::test]
    async fn test_gather_merges_unicast_and_multicast_without_duplicates() {
        let discovery = FakeDiscovery::new();
        discovery.set_unicast(ServiceType::Register, vec![
            ServiceRecord::new("shared", "10.0.0.1", 80),
            ServiceRecord::new("unicast-only", "10.0.0.2", 80),
        ]);
        discovery.set_multicast(ServiceType::Register, vec![
            ServiceRecord::new("shared", "10.0.0.1", 80),
            ServiceRecord::new("multicast-only", "10.0.0.3", 80),
        ]);

        let mut known = Vec::new();
        let candidates = gather_candidates(&discovery, &plan(Some("example.com")), &mut known, false).await;
        let names: Vec<&str> = candidates.iter().map(|r| r.name.as_str()).collect();

        assert_eq!(names, vec!["shared", "unicast-only", "multicast-only"]);
        assert_eq!(known.len(), 2);
    }

    #[tokio::test]
    async fn test_gather_survives_unicast_failure() {
        let discovery = FakeDiscovery::new();
        discovery.fail_unicast(true);
        discovery.set_multicast(ServiceType::Register, vec![ServiceRecord::new("m", "10.0.0.3", 80)]);

        let mut known = Vec::new();
        let candidates = gather_candidates(&discovery, &plan(Some("example.com")), &mut known, false).await;
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_gather_drops_expired_records() {
        let discovery = FakeDiscovery::new();
        let expired = ServiceRecord::new("old", "10.0.0.1", 80)
            .with_expiry(chrono::Utc::now() - chrono::Duration::seconds(5));
        let mut known = vec![expired];

        let candidates = gather_candidates(&discovery, &plan(None), &mut known, false).await;
        assert!(candidates.is_empty());
        assert!(known.is_empty());
    }
}
