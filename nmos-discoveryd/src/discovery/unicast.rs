//! Unicast DNS-SD: PTR enumeration followed by SRV and TXT resolution.

use std::time::Instant;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use shared::protocol::{Protocol, ServiceType};
use crate::error::DiscoveryError;
use crate::service::{Metadata, ServiceRecord};

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The three lookups DNS-SD needs. An empty answer is not an error.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn ptr(&self, name: &str) -> Result<Vec<String>, DiscoveryError>;

    async fn srv(&self, name: &str) -> Result<Vec<SrvTarget>, DiscoveryError>;

    /// Each character-string of every TXT record, in answer order.
    async fn txt(&self, name: &str) -> Result<Vec<String>, DiscoveryError>;
}

/// Resolver using the host's DNS configuration.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, DiscoveryError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| DiscoveryError::lookup("system resolver configuration", e))?;
        Ok(Self { inner })
    }
}

fn absolute(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

fn no_records(e: &ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn wall_clock(valid_until: Instant) -> Option<DateTime<Utc>> {
    let remaining = valid_until.saturating_duration_since(Instant::now());
    chrono::Duration::from_std(remaining).ok().map(|d| Utc::now() + d)
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn ptr(&self, name: &str) -> Result<Vec<String>, DiscoveryError> {
        let name = absolute(name);
        match self.inner.lookup(name.as_str(), RecordType::PTR).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::PTR(ptr) => Some(ptr.0.to_utf8()),
                    _ => None,
                })
                .collect()),
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(DiscoveryError::lookup(name, e)),
        }
    }

    async fn srv(&self, name: &str) -> Result<Vec<SrvTarget>, DiscoveryError> {
        let name = absolute(name);
        match self.inner.srv_lookup(name.as_str()).await {
            Ok(lookup) => {
                let expires_at = wall_clock(lookup.as_lookup().valid_until());
                Ok(lookup
                    .iter()
                    .map(|srv| SrvTarget {
                        priority: srv.priority(),
                        weight: srv.weight(),
                        port: srv.port(),
                        target: srv.target().to_utf8(),
                        expires_at,
                    })
                    .collect())
            }
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(DiscoveryError::lookup(name, e)),
        }
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>, DiscoveryError> {
        let name = absolute(name);
        match self.inner.txt_lookup(name.as_str()).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .flat_map(|txt| txt.txt_data().iter())
                .map(|data| String::from_utf8_lossy(data).into_owned())
                .collect()),
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(DiscoveryError::lookup(name, e)),
        }
    }
}

/// Parse TXT character-strings. Exact duplicate keys keep the first value;
/// a bare key is a boolean attribute with value "1".
pub fn parse_txt<'a>(entries: impl IntoIterator<Item = &'a str>) -> Metadata {
    entries
        .into_iter()
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key, value),
            None => (entry, "1"),
        })
        .collect()
}

/// Resolve one instance into a record. None if it has no SRV answer.
async fn resolve_instance(
    resolver: &dyn DnsResolver,
    instance: &str,
) -> Result<Option<ServiceRecord>, DiscoveryError> {
    let (srv, txt) = futures::join!(resolver.srv(instance), resolver.txt(instance));

    let Some(target) = srv?
        .into_iter()
        .min_by_key(|t| (t.priority, std::cmp::Reverse(t.weight)))
    else {
        return Ok(None);
    };

    let txt = txt?;
    let metadata = parse_txt(txt.iter().map(String::as_str));

    let mut record = ServiceRecord::new(instance, target.target, target.port)
        .with_priority(target.priority)
        .with_weight(u32::from(target.weight))
        .with_metadata(metadata);
    if let Some(expires_at) = target.expires_at {
        record = record.with_expiry(expires_at);
    }
    Ok(Some(record))
}

/// Enumerate `_<service>._<proto>.<domain>` and resolve every instance
/// concurrently.
///
/// Instances that fail to resolve are skipped; the first failure is returned
/// only when none resolved.
pub async fn browse_unicast(
    resolver: &dyn DnsResolver,
    service: ServiceType,
    protocol: Protocol,
    domain: &str,
) -> Result<Vec<ServiceRecord>, DiscoveryError> {
    let ptr_name = service.dns_sd_name(protocol, domain);
    let instances = resolver.ptr(&ptr_name).await?;
    tracing::debug!("{} lists {} instances", ptr_name, instances.len());

    let results = join_all(instances.iter().map(|i| resolve_instance(resolver, i))).await;

    let mut records = Vec::new();
    let mut first_error = None;
    for (instance, result) in instances.iter().zip(results) {
        match result {
            Ok(Some(record)) => {
                if !records.iter().any(|r: &ServiceRecord| r.name == record.name) {
                    records.push(record);
                }
            }
            Ok(None) => tracing::debug!("{} has no SRV record", instance),
            Err(e) => {
                tracing::warn!("Failed to resolve {}: {}", instance, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if records.is_empty() => Err(e),
        _ => Ok(records),
    }
}
