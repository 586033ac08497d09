use reqwest::Method;
use serde_json::Value;
use shared::protocol::{ApiVersion, ResourceKind, QUERY_API_PREFIX};
use crate::error::RegistryError;
use crate::registry::client::{api_base, check_status, parse_body};
use crate::service::ServiceRecord;

/// Query API calls against one centralized query service.
#[derive(Debug, Clone)]
pub struct QueryClient {
    http: reqwest::Client,
    record: ServiceRecord,
    base: String,
    version: ApiVersion,
}

impl QueryClient {
    pub fn accept(http: reqwest::Client, record: ServiceRecord) -> Result<Self, RegistryError> {
        let (base, version) = api_base(&record, QUERY_API_PREFIX)?;
        Ok(Self {
            http,
            record,
            base,
            version,
        })
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    /// `GET {base}/{kinds}?params`
    pub async fn query(&self, kind: ResourceKind, params: &[(String, String)]) -> Result<Vec<Value>, RegistryError> {
        let url = format!("{}/{}", self.base, kind.plural());
        let response = self.http.request(Method::GET, &url).query(params).send().await?;
        let response = check_status(&url, response).await?;
        parse_body(&url, response).await
    }

    /// `GET {base}/{kinds}/{id}`; None if the service does not know it.
    pub async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Value>, RegistryError> {
        let url = format!("{}/{}/{}", self.base, kind.plural(), id);
        let response = self.http.request(Method::GET, &url).send().await?;
        match check_status(&url, response).await {
            Ok(response) => parse_body(&url, response).await.map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
