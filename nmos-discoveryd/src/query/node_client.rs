use std::collections::BTreeMap;
use serde_json::Value;
use shared::protocol::{ResourceKind, NODE_API_PREFIX};
use crate::error::RegistryError;
use crate::registry::client::{api_base, check_status, parse_body};
use crate::service::ServiceRecord;

/// Everything one node exposes through its Node API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSnapshot {
    pub node: Value,
    pub children: BTreeMap<ResourceKind, Vec<Value>>,
}

/// Reads a peer's Node API.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    base: String,
}

impl NodeClient {
    pub fn accept(http: reqwest::Client, record: &ServiceRecord) -> Result<Self, RegistryError> {
        let (base, _) = api_base(record, NODE_API_PREFIX)?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn fetch(&self, path: &str) -> Result<Value, RegistryError> {
        let url = format!("{}/{}", self.base, path);
        let response = self.http.get(&url).send().await?;
        let response = check_status(&url, response).await?;
        parse_body(&url, response).await
    }

    async fn fetch_list(&self, kind: ResourceKind) -> Result<(ResourceKind, Vec<Value>), RegistryError> {
        let url = format!("{}/{}", self.base, kind.plural());
        let response = self.http.get(&url).send().await?;
        let response = check_status(&url, response).await?;
        Ok((kind, parse_body(&url, response).await?))
    }

    /// `self` plus every child collection, fetched concurrently.
    pub async fn snapshot(&self) -> Result<NodeSnapshot, RegistryError> {
        let (node, devices, sources, flows, senders, receivers) = futures::try_join!(
            self.fetch("self"),
            self.fetch_list(ResourceKind::Device),
            self.fetch_list(ResourceKind::Source),
            self.fetch_list(ResourceKind::Flow),
            self.fetch_list(ResourceKind::Sender),
            self.fetch_list(ResourceKind::Receiver),
        )?;

        Ok(NodeSnapshot {
            node,
            children: [devices, sources, flows, senders, receivers].into_iter().collect(),
        })
    }
}
