use std::time::Duration;
use reqwest::header::LOCATION;
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::protocol::{ApiVersion, ResourceKind, MAX_API_VERSION, REGISTRATION_API_PREFIX};
use shared::types::Resource;
use crate::error::RegistryError;
use crate::service::ServiceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// 201: the registry created the resource
    Registered,
    /// 200: the registry already held a resource with this id
    AlreadyRegistered,
}

#[derive(Debug, Clone)]
pub struct RegisterResponse {
    pub status: RegistrationStatus,
    pub location: Option<String>,
    pub resource: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    /// Registry-side timestamp of the last heartbeat
    pub health: Value,
}

/// Check that a discovered service speaks a protocol and version this client
/// supports, returning the API base URL and negotiated version.
pub(crate) fn api_base(record: &ServiceRecord, prefix: &str) -> Result<(String, ApiVersion), RegistryError> {
    let reject = |reason: String| RegistryError::Unacceptable {
        name: record.name.clone(),
        reason,
    };

    let proto = record.api_proto();
    if !proto.eq_ignore_ascii_case("http") && !proto.eq_ignore_ascii_case("https") {
        return Err(reject(format!("unsupported api_proto '{}'", proto)));
    }
    if record.api_auth() {
        return Err(reject("authorization is required but not supported".to_string()));
    }
    let version = record
        .best_version(MAX_API_VERSION)
        .ok_or_else(|| reject(format!("no API version compatible with {}", MAX_API_VERSION)))?;

    Ok((format!("{}{}/{}", record.base_url(), prefix, version), version))
}

/// Map non-success statuses to errors.
pub(crate) async fn check_status(url: &str, response: Response) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let url = url.to_string();
    let status = status.as_u16();
    if status >= 500 {
        Err(RegistryError::Server { status, url, body })
    } else if status >= 400 {
        Err(RegistryError::Client { status, url, body })
    } else {
        Err(RegistryError::Protocol {
            url,
            reason: format!("unexpected status {}", status),
        })
    }
}

pub(crate) async fn parse_body<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, RegistryError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RegistryError::Protocol {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Registration API calls against one registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    record: ServiceRecord,
    base: String,
    version: ApiVersion,
}

impl RegistryClient {
    /// Build a client for `record`, or reject it as unusable.
    pub fn accept(http: reqwest::Client, record: ServiceRecord) -> Result<Self, RegistryError> {
        let (base, version) = api_base(&record, REGISTRATION_API_PREFIX)?;
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

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response, RegistryError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        check_status(url, response).await
    }

    pub async fn register(&self, resource: &Resource) -> Result<RegisterResponse, RegistryError> {
        let url = format!("{}/resource", self.base);
        let body = json!({
            "type": resource.kind().as_str(),
            "data": resource.to_value(),
        });

        let response = self.send(Method::POST, &url, Some(&body)).await?;
        let status = match response.status().as_u16() {
            200 => RegistrationStatus::AlreadyRegistered,
            201 => RegistrationStatus::Registered,
            other => {
                return Err(RegistryError::Protocol {
                    url,
                    reason: format!("unexpected status {} for registration", other),
                })
            }
        };
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        let resource = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|e| RegistryError::Protocol {
                url: url.clone(),
                reason: e.to_string(),
            })?
        };

        tracing::debug!("Registered {} {} at {}: {:?}", resource_kind(&body), resource_id(&body), self.record.name, status);
        Ok(RegisterResponse {
            status,
            location,
            resource,
        })
    }

    pub async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/resource/{}/{}", self.base, kind.plural(), id);
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    /// Heartbeat, abandoning the request if it has not completed within `timeout`.
    pub async fn heartbeat(&self, node_id: &str, timeout: Duration) -> Result<Health, RegistryError> {
        let url = format!("{}/health/nodes/{}", self.base, node_id);
        let call = async {
            let response = self.send(Method::POST, &url, None).await?;
            parse_body(&url, response).await
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| RegistryError::Timeout(timeout))?
    }

    pub async fn health(&self, node_id: &str) -> Result<Health, RegistryError> {
        let url = format!("{}/health/nodes/{}", self.base, node_id);
        let response = self.send(Method::GET, &url, None).await?;
        parse_body(&url, response).await
    }

    /// A registered resource as the registry holds it, None if unknown.
    pub async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Value>, RegistryError> {
        let url = format!("{}/resource/{}/{}", self.base, kind.plural(), id);
        match self.send(Method::GET, &url, None).await {
            Ok(response) => parse_body(&url, response).await.map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn resource_kind(body: &Value) -> &str {
    body["type"].as_str().unwrap_or_default()
}

fn resource_id(body: &Value) -> &str {
    body["data"]["id"].as_str().unwrap_or_default()
}
