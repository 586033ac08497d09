use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::Value;
use shared::protocol::{ApiVersion, ResourceKind, MAX_API_VERSION};
use crate::error::Error;
use crate::query::QueryHandle;
use crate::resources::SharedResources;

/// API versions served, oldest first
const SERVED_VERSIONS: [ApiVersion; 2] = [ApiVersion::new(1, 2), MAX_API_VERSION];

#[derive(Clone)]
pub struct AppState {
    pub resources: SharedResources,
    /// Query API backend; the Query API is not served without one
    pub query: Option<QueryHandle>,
}

impl AppState {
    pub fn new(resources: SharedResources) -> Self {
        Self { resources, query: None }
    }

    pub fn with_query(mut self, query: QueryHandle) -> Self {
        self.query = Some(query);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/x-nmos", get(get_apis))
        .route("/x-nmos/", get(get_apis))
        .route("/x-nmos/node", get(get_versions))
        .route("/x-nmos/node/", get(get_versions))
        .route("/x-nmos/node/:version", get(get_node_root))
        .route("/x-nmos/node/:version/", get(get_node_root))
        .route("/x-nmos/node/:version/self", get(get_self))
        .route("/x-nmos/node/:version/:plural", get(list_local))
        .route("/x-nmos/node/:version/:plural/:id", get(get_local))
        .route("/x-nmos/query", get(get_versions))
        .route("/x-nmos/query/", get(get_versions))
        .route("/x-nmos/query/:version", get(get_query_root))
        .route("/x-nmos/query/:version/", get(get_query_root))
        .route("/x-nmos/query/:version/:plural", get(query_resources))
        .route("/x-nmos/query/:version/:plural/:id", get(query_resource))
        .with_state(state)
}

fn check_version(version: &str) -> Result<ApiVersion, StatusCode> {
    version
        .parse::<ApiVersion>()
        .ok()
        .filter(|v| SERVED_VERSIONS.contains(v))
        .ok_or(StatusCode::NOT_FOUND)
}

fn child_kind(plural: &str) -> Result<ResourceKind, StatusCode> {
    ResourceKind::from_plural(plural)
        .filter(|kind| *kind != ResourceKind::Node)
        .ok_or(StatusCode::NOT_FOUND)
}

fn any_kind(plural: &str) -> Result<ResourceKind, StatusCode> {
    ResourceKind::from_plural(plural).ok_or(StatusCode::NOT_FOUND)
}

fn listing<I: IntoIterator<Item = S>, S: std::fmt::Display>(entries: I) -> Json<Vec<String>> {
    Json(entries.into_iter().map(|e| format!("{}/", e)).collect())
}

async fn get_apis(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut apis = vec!["node"];
    if state.query.is_some() {
        apis.push("query");
    }
    listing(apis)
}

async fn get_versions() -> Json<Vec<String>> {
    listing(SERVED_VERSIONS)
}

async fn get_node_root(Path(version): Path<String>) -> Result<Json<Vec<String>>, StatusCode> {
    check_version(&version)?;
    let entries = std::iter::once("self").chain(ResourceKind::CHILDREN.iter().map(|k| k.plural()));
    Ok(listing(entries))
}

async fn get_self(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    check_version(&version)?;
    let store = state.resources.read();
    let node = store.node().ok_or(StatusCode::NOT_FOUND)?;
    serde_json::to_value(node).map(Json).map_err(|e| {
        tracing::error!("Failed to serialize node: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn list_local(
    State(state): State<AppState>,
    Path((version, plural)): Path<(String, String)>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    check_version(&version)?;
    let kind = child_kind(&plural)?;
    let resources = state.resources.read().list(kind);
    Ok(Json(resources.iter().map(|r| r.to_value()).collect()))
}

async fn get_local(
    State(state): State<AppState>,
    Path((version, plural, id)): Path<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    check_version(&version)?;
    let kind = child_kind(&plural)?;
    state
        .resources
        .read()
        .get(&id)
        .filter(|r| r.kind() == kind)
        .map(|r| Json(r.to_value()))
        .ok_or(StatusCode::NOT_FOUND)
}

fn query_backend(state: &AppState) -> Result<&QueryHandle, StatusCode> {
    state.query.as_ref().ok_or(StatusCode::NOT_FOUND)
}

fn query_status(e: Error) -> StatusCode {
    tracing::error!("Query failed: {}", e);
    match e {
        Error::NoQueryService | Error::ControllerClosed => StatusCode::SERVICE_UNAVAILABLE,
        Error::Registry(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_query_root(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    query_backend(&state)?;
    check_version(&version)?;
    Ok(listing(ResourceKind::ALL.iter().map(|k| k.plural())))
}

async fn query_resources(
    State(state): State<AppState>,
    Path((version, plural)): Path<(String, String)>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    let query = query_backend(&state)?;
    check_version(&version)?;
    let kind = any_kind(&plural)?;
    query.query(kind, params).await.map(Json).map_err(query_status)
}

async fn query_resource(
    State(state): State<AppState>,
    Path((version, plural, id)): Path<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let query = query_backend(&state)?;
    check_version(&version)?;
    let kind = any_kind(&plural)?;
    query
        .get(kind, &id)
        .await
        .map_err(query_status)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
