use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::protocol::{ApiVersion, TXT_API_AUTH, TXT_API_PROTO, TXT_API_VER};

/// TXT record key/value pairs in arrival order.
///
/// Lookups are case-insensitive; inserting an exact key that is already
/// present keeps the first value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.0.iter().any(|(k, _)| *k == key) {
            return false;
        }
        self.0.push((key, value.into()));
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// A discovered network endpoint for one service instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRecord {
    /// Unique instance name, e.g. "reg1._nmos-register._tcp.local."
    pub name: String,

    /// Address or hostname the service is reachable at
    pub host: String,

    pub port: u16,

    /// Lower is preferred
    pub priority: u16,

    /// Relative share within a priority tier
    pub weight: u32,

    pub metadata: Metadata,

    /// End of the advertisement lease
    pub expires_at: Option<DateTime<Utc>>,

    ignored_until: Option<DateTime<Utc>>,
    ignore_reason: Option<String>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            priority: 0,
            weight: 0,
            metadata: Metadata::new(),
            expires_at: None,
            ignored_until: None,
            ignore_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_ignored_at(&self, now: DateTime<Utc>) -> bool {
        self.ignored_until.is_some_and(|until| now < until)
    }

    pub fn is_ignored(&self) -> bool {
        self.is_ignored_at(Utc::now())
    }

    pub fn ignored_until(&self) -> Option<DateTime<Utc>> {
        self.ignored_until
    }

    pub fn ignore_reason(&self) -> Option<&str> {
        self.ignore_reason.as_deref()
    }

    /// Exclude this record from selection for `duration`.
    ///
    /// An exclusion that is still active is left untouched.
    pub fn ignore(&mut self, reason: impl Into<String>, duration: Duration) {
        self.ignore_at(reason, duration, Utc::now());
    }

    pub fn ignore_at(&mut self, reason: impl Into<String>, duration: Duration, now: DateTime<Utc>) {
        if self.is_ignored_at(now) {
            return;
        }
        let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        self.ignored_until = Some(now.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.ignore_reason = Some(reason.into());
    }

    /// Carry an exclusion over to a freshly discovered copy of this record.
    pub fn ignore_until(&mut self, until: DateTime<Utc>, reason: impl Into<String>) {
        if self.ignored_until.map_or(true, |current| current < until) {
            self.ignored_until = Some(until);
            self.ignore_reason = Some(reason.into());
        }
    }

    pub fn api_proto(&self) -> &str {
        self.metadata.get(TXT_API_PROTO).unwrap_or("http")
    }

    pub fn api_versions(&self) -> Vec<ApiVersion> {
        self.metadata
            .get(TXT_API_VER)
            .map(ApiVersion::parse_list)
            .unwrap_or_default()
    }

    pub fn best_version(&self, max: ApiVersion) -> Option<ApiVersion> {
        ApiVersion::negotiate(&self.api_versions(), max)
    }

    pub fn api_auth(&self) -> bool {
        self.metadata
            .get(TXT_API_AUTH)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// "{api_proto}://{host}:{port}"
    pub fn base_url(&self) -> String {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{}]", addr),
            _ => self.host.trim_end_matches('.').to_string(),
        };
        format!("{}://{}:{}", self.api_proto(), host, self.port)
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.name, self.base_url())?;
        if let Some(ver) = self.metadata.get(TXT_API_VER) {
            write!(f, " ({})", ver)?;
        }
        Ok(())
    }
}
