//! Error types for discovery, registration and query.

use std::time::Duration;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures talking to a registry or query service.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// HTTP 5xx. Transient: the service is expected to recover.
    #[error("Server error: {status} from {url}: {body}")]
    Server { status: u16, url: String, body: String },

    /// HTTP 4xx. The request itself was rejected and must not be retried blindly.
    #[error("Client error: {status} from {url}: {body}")]
    Client { status: u16, url: String, body: String },

    /// The response body could not be understood.
    #[error("Protocol error from {url}: {reason}")]
    Protocol { url: String, reason: String },

    /// The call did not complete within its deadline and was cancelled.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The advertised service cannot be used by this client.
    #[error("Unacceptable service {name}: {reason}")]
    Unacceptable { name: String, reason: String },
}

impl RegistryError {
    /// Client errors are terminal; everything else is recovered by reselection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistryError::Client { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Client { status: 404, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RegistryError::Server { status, .. } | RegistryError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// DNS or mDNS lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("DNS lookup of {name} failed: {reason}")]
    Lookup { name: String, reason: String },

    #[error("Multicast discovery is disabled")]
    MulticastDisabled,

    #[error("Unicast discovery is not configured")]
    UnicastUnavailable,
}

impl DiscoveryError {
    pub fn lookup(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Lookup {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Registration was requested before a node resource was set.
    #[error("Cannot register until a node has been set")]
    NoNode,

    /// The node cannot be replaced while it is registered.
    #[error("Cannot change the node after it has been registered")]
    NodeRegistered,

    #[error("Unknown resource {0}; add it before updating it")]
    UnknownResource(String),

    /// The controller or aggregator task is no longer running.
    #[error("Background task has stopped")]
    ControllerClosed,

    /// Neither a query service nor peer-to-peer aggregation is available.
    #[error("No query service available")]
    NoQueryService,
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Registry(e) => e.is_fatal(),
            _ => true,
        }
    }
}
