use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// TXT record keys consumed from registry/query advertisements
pub const TXT_API_PROTO: &str = "api_proto";
pub const TXT_API_VER: &str = "api_ver";
pub const TXT_API_AUTH: &str = "api_auth";
pub const TXT_PRIORITY: &str = "pri";

/// TXT record keys produced by peer-to-peer node advertisement
pub const TXT_VER_SELF: &str = "ver_slf";
pub const TXT_VER_SOURCES: &str = "ver_src";
pub const TXT_VER_FLOWS: &str = "ver_flw";
pub const TXT_VER_DEVICES: &str = "ver_dvc";
pub const TXT_VER_SENDERS: &str = "ver_snd";
pub const TXT_VER_RECEIVERS: &str = "ver_rcv";

/// API path prefixes
pub const NODE_API_PREFIX: &str = "/x-nmos/node";
pub const QUERY_API_PREFIX: &str = "/x-nmos/query";
pub const REGISTRATION_API_PREFIX: &str = "/x-nmos/registration";

/// Highest API version this implementation speaks
pub const MAX_API_VERSION: ApiVersion = ApiVersion { major: 1, minor: 3 };

/// Service types discovered or advertised over DNS-SD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Register,
    Query,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl ServiceType {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceType::Register => "nmos-register",
            ServiceType::Query => "nmos-query",
            ServiceType::Node => "nmos-node",
        }
    }

    /// Service type under `domain`, e.g. "_nmos-register._tcp.example.com"
    pub fn dns_sd_name(&self, protocol: Protocol, domain: &str) -> String {
        format!(
            "_{}._{}.{}",
            self.name(),
            protocol.as_str(),
            domain.trim_end_matches('.')
        )
    }

    /// Multicast service type, e.g. "_nmos-register._tcp.local."
    pub fn mdns_type(&self, protocol: Protocol) -> String {
        format!("{}.", self.dns_sd_name(protocol, "local"))
    }
}

/// The resource types that make up a node's resource graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Node,
    Device,
    Source,
    Flow,
    Sender,
    Receiver,
}

impl ResourceKind {
    /// Child resource kinds in registration order
    pub const CHILDREN: [ResourceKind; 5] = [
        ResourceKind::Device,
        ResourceKind::Source,
        ResourceKind::Flow,
        ResourceKind::Sender,
        ResourceKind::Receiver,
    ];

    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Node,
        ResourceKind::Device,
        ResourceKind::Source,
        ResourceKind::Flow,
        ResourceKind::Sender,
        ResourceKind::Receiver,
    ];

    /// Singular name used in registration request bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Node => "node",
            ResourceKind::Device => "device",
            ResourceKind::Source => "source",
            ResourceKind::Flow => "flow",
            ResourceKind::Sender => "sender",
            ResourceKind::Receiver => "receiver",
        }
    }

    /// Plural name used in URL paths
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Node => "nodes",
            ResourceKind::Device => "devices",
            ResourceKind::Source => "sources",
            ResourceKind::Flow => "flows",
            ResourceKind::Sender => "senders",
            ResourceKind::Receiver => "receivers",
        }
    }

    /// TXT key carrying this kind's version counter in node advertisements
    pub fn version_txt_key(&self) -> &'static str {
        match self {
            ResourceKind::Node => TXT_VER_SELF,
            ResourceKind::Device => TXT_VER_DEVICES,
            ResourceKind::Source => TXT_VER_SOURCES,
            ResourceKind::Flow => TXT_VER_FLOWS,
            ResourceKind::Sender => TXT_VER_SENDERS,
            ResourceKind::Receiver => TXT_VER_RECEIVERS,
        }
    }

    pub fn from_plural(plural: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.plural() == plural)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An API version such as "v1.3"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse an `api_ver` TXT value ("v1.0,v1.1,v1.2,v1.3"), skipping
    /// entries that do not parse.
    pub fn parse_list(value: &str) -> Vec<ApiVersion> {
        value
            .split(',')
            .filter_map(|v| v.trim().parse().ok())
            .collect()
    }

    /// Highest version in `advertised` that a client supporting up to `max` can speak
    pub fn negotiate(advertised: &[ApiVersion], max: ApiVersion) -> Option<ApiVersion> {
        advertised
            .iter()
            .copied()
            .filter(|v| v.major == max.major && v.minor <= max.minor)
            .max()
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(pub String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid API version '{}'", self.0)
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for ApiVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let rest = s.strip_prefix('v').ok_or_else(err)?;
        let (major, minor) = rest.split_once('.').ok_or_else(err)?;
        Ok(ApiVersion {
            major: major.parse().map_err(|_| err())?,
            minor: minor.parse().map_err(|_| err())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_names() {
        assert_eq!(
            ServiceType::Register.mdns_type(Protocol::Tcp),
            "_nmos-register._tcp.local."
        );
        assert_eq!(
            ServiceType::Query.dns_sd_name(Protocol::Tcp, "example.com."),
            "_nmos-query._tcp.example.com"
        );
    }

    #[test]
    fn test_parse_version_list() {
        let versions = ApiVersion::parse_list("v1.0, v1.1,bogus,v1.3");
        assert_eq!(
            versions,
            vec![ApiVersion::new(1, 0), ApiVersion::new(1, 1), ApiVersion::new(1, 3)]
        );
    }

    #[test]
    fn test_negotiate_picks_highest_supported() {
        let advertised = ApiVersion::parse_list("v1.2,v1.3,v1.4,v2.0");
        assert_eq!(
            ApiVersion::negotiate(&advertised, MAX_API_VERSION),
            Some(ApiVersion::new(1, 3))
        );
        assert_eq!(
            ApiVersion::negotiate(&ApiVersion::parse_list("v2.0"), MAX_API_VERSION),
            None
        );
    }

    #[test]
    fn test_kind_from_plural() {
        assert_eq!(ResourceKind::from_plural("flows"), Some(ResourceKind::Flow));
        assert_eq!(ResourceKind::from_plural("widgets"), None);
    }
}
