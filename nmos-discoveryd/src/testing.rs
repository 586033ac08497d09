//! Fixtures and test doubles for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use shared::protocol::{ResourceKind, ServiceType};
use shared::types::{
    Device, Flow, FlowFormat, Node, NodeApiInfo, Receiver, ReceiverCaps, ReceiverFormat, ResourceCore,
    Sender, Source, SourceFormat, VideoFlow,
};
use crate::discovery::{Advertiser, BrowserEvent, Discovery, NodeAdvertisement, ServiceWatch};
use crate::error::DiscoveryError;
use crate::service::{Metadata, ServiceRecord};
use shared::protocol::Protocol;

pub fn node(id: &str) -> Node {
    Node {
        core: ResourceCore::new(id, format!("node {}", id)),
        href: "http://127.0.0.1:3212/".to_string(),
        api: NodeApiInfo {
            versions: vec!["v1.3".to_string()],
            endpoints: Vec::new(),
        },
        ..Default::default()
    }
}

pub fn device(id: &str, node_id: &str) -> Device {
    Device {
        core: ResourceCore::new(id, format!("device {}", id)),
        device_type: "urn:x-nmos:device:generic".to_string(),
        node_id: node_id.to_string(),
        ..Default::default()
    }
}

pub fn source(id: &str, device_id: &str) -> Source {
    Source {
        core: ResourceCore::new(id, format!("source {}", id)),
        grain_rate: None,
        caps: Default::default(),
        device_id: device_id.to_string(),
        parents: Vec::new(),
        clock_name: None,
        format: SourceFormat::Video,
    }
}

pub fn flow(id: &str, source_id: &str, device_id: &str) -> Flow {
    Flow {
        core: ResourceCore::new(id, format!("flow {}", id)),
        grain_rate: None,
        source_id: source_id.to_string(),
        device_id: device_id.to_string(),
        parents: Vec::new(),
        format: FlowFormat::Video(VideoFlow {
            media_type: "video/raw".to_string(),
            frame_width: 1920,
            frame_height: 1080,
            interlace_mode: None,
            colorspace: "BT709".to_string(),
            transfer_characteristic: None,
            components: None,
        }),
    }
}

pub fn sender(id: &str, device_id: &str, flow_id: Option<&str>) -> Sender {
    Sender {
        core: ResourceCore::new(id, format!("sender {}", id)),
        flow_id: flow_id.map(str::to_string),
        transport: "urn:x-nmos:transport:rtp".to_string(),
        device_id: device_id.to_string(),
        ..Default::default()
    }
}

pub fn receiver(id: &str, device_id: &str) -> Receiver {
    Receiver {
        core: ResourceCore::new(id, format!("receiver {}", id)),
        device_id: device_id.to_string(),
        transport: "urn:x-nmos:transport:rtp".to_string(),
        interface_bindings: Vec::new(),
        subscription: Default::default(),
        format: ReceiverFormat::Video {
            caps: ReceiverCaps {
                media_types: vec!["video/raw".to_string()],
            },
        },
    }
}

/// A record pointing at a local test server.
pub fn service_record(name: &str, service: ServiceType, addr: SocketAddr) -> ServiceRecord {
    let metadata: Metadata = [("api_proto", "http"), ("api_ver", "v1.2,v1.3")].into_iter().collect();
    ServiceRecord::new(
        format!("{}.{}", name, service.mdns_type(Protocol::Tcp)),
        addr.ip().to_string(),
        addr.port(),
    )
    .with_weight(100)
    .with_metadata(metadata)
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

/// Wait until the watched value satisfies `f`.
pub async fn wait_until<T: Clone>(rx: &mut watch::Receiver<T>, f: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
        .clone()
}

/// Poll `f` until it holds.
pub async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..250 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct FakeDiscoveryState {
    multicast: HashMap<ServiceType, Vec<ServiceRecord>>,
    unicast: HashMap<ServiceType, Vec<ServiceRecord>>,
    fail_unicast: bool,
    feeds: HashMap<ServiceType, broadcast::Sender<BrowserEvent>>,
}

/// Discovery whose answers are set by the test.
#[derive(Default)]
pub struct FakeDiscovery {
    state: Mutex<FakeDiscoveryState>,
}

impl FakeDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_multicast(&self, service: ServiceType, records: Vec<ServiceRecord>) {
        lock(&self.state).multicast.insert(service, records);
    }

    pub fn set_unicast(&self, service: ServiceType, records: Vec<ServiceRecord>) {
        lock(&self.state).unicast.insert(service, records);
    }

    pub fn fail_unicast(&self, fail: bool) {
        lock(&self.state).fail_unicast = fail;
    }

    /// A multicast announcement, visible to browses and watches.
    pub fn announce(&self, service: ServiceType, record: ServiceRecord) {
        let mut state = lock(&self.state);
        let list = state.multicast.entry(service).or_default();
        list.retain(|r| r.name != record.name);
        list.push(record.clone());
        if let Some(tx) = state.feeds.get(&service) {
            let _ = tx.send(BrowserEvent::Resolved(record));
        }
    }

    pub fn withdraw(&self, service: ServiceType, name: &str) {
        let mut state = lock(&self.state);
        if let Some(list) = state.multicast.get_mut(&service) {
            list.retain(|r| r.name != name);
        }
        if let Some(tx) = state.feeds.get(&service) {
            let _ = tx.send(BrowserEvent::Removed(name.to_string()));
        }
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn browse_multicast(
        &self,
        service: ServiceType,
        _protocol: Protocol,
        _quiet_window: Duration,
        _known: &[ServiceRecord],
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        Ok(lock(&self.state).multicast.get(&service).cloned().unwrap_or_default())
    }

    async fn browse_unicast(
        &self,
        service: ServiceType,
        _protocol: Protocol,
        domain: &str,
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let state = lock(&self.state);
        if state.fail_unicast {
            return Err(DiscoveryError::lookup(domain, "SERVFAIL"));
        }
        Ok(state.unicast.get(&service).cloned().unwrap_or_default())
    }

    fn watch(&self, service: ServiceType, _protocol: Protocol) -> Result<ServiceWatch, DiscoveryError> {
        let mut state = lock(&self.state);
        let live = state.multicast.get(&service).cloned().unwrap_or_default();
        let tx = state
            .feeds
            .entry(service)
            .or_insert_with(|| broadcast::channel(64).0);
        Ok(ServiceWatch::new(live, tx.subscribe()))
    }

    fn stop(&self, service: ServiceType, _protocol: Protocol) {
        lock(&self.state).feeds.remove(&service);
    }
}

#[derive(Default)]
struct FakeAdvertiserState {
    active: Option<NodeAdvertisement>,
    advertised: usize,
    withdrawn: usize,
}

#[derive(Default)]
pub struct FakeAdvertiser {
    state: Mutex<FakeAdvertiserState>,
}

impl FakeAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<NodeAdvertisement> {
        lock(&self.state).active.clone()
    }

    pub fn is_advertising(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    pub fn advertised(&self) -> usize {
        lock(&self.state).advertised
    }

    pub fn withdrawn(&self) -> usize {
        lock(&self.state).withdrawn
    }
}

#[async_trait]
impl Advertiser for FakeAdvertiser {
    async fn advertise(&self, advert: &NodeAdvertisement) -> Result<(), DiscoveryError> {
        let mut state = lock(&self.state);
        state.active = Some(advert.clone());
        state.advertised += 1;
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), DiscoveryError> {
        let mut state = lock(&self.state);
        state.active = None;
        state.withdrawn += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    #[default]
    Ok,
    Status(u16),
    /// Never respond
    Hang,
    /// 200 with a body that is not JSON
    Garbage,
}

#[derive(Debug, Default)]
pub struct MockRegistryState {
    /// One entry per request, e.g. "register device d1"
    pub calls: Vec<String>,
    /// Registered resources by id
    pub registered: HashMap<String, Value>,
    /// Fail every registration with this status
    pub register_status: Option<u16>,
    pub heartbeat: HeartbeatMode,
}

type SharedRegistry = Arc<Mutex<MockRegistryState>>;

/// A registration API on an ephemeral localhost port.
pub struct MockRegistry {
    name: String,
    addr: SocketAddr,
    state: SharedRegistry,
}

impl MockRegistry {
    pub async fn start() -> Self {
        Self::named("mock-registry").await
    }

    pub async fn named(name: &str) -> Self {
        let state = SharedRegistry::default();
        let app = Router::new()
            .route("/x-nmos/registration/:version/resource", post(mock_register))
            .route(
                "/x-nmos/registration/:version/resource/:plural/:id",
                get(mock_get).delete(mock_delete),
            )
            .route(
                "/x-nmos/registration/:version/health/nodes/:id",
                post(mock_heartbeat).get(mock_health),
            )
            .with_state(Arc::clone(&state));
        let addr = serve(app).await;
        Self {
            name: name.to_string(),
            addr,
            state,
        }
    }

    pub fn record(&self) -> ServiceRecord {
        service_record(&self.name, ServiceType::Register, self.addr)
    }

    pub fn state(&self) -> MutexGuard<'_, MockRegistryState> {
        lock(&self.state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn mock_register(
    State(state): State<SharedRegistry>,
    Path(version): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let kind: ResourceKind = match serde_json::from_value(body["type"].clone()) {
        Ok(kind) => kind,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let data = body["data"].clone();
    let id = data["id"].as_str().unwrap_or_default().to_string();

    let mut state = lock(&state);
    state.calls.push(format!("register {} {}", kind, id));
    if let Some(code) = state.register_status {
        return (status(code), Json(json!({ "code": code, "error": "mock failure" }))).into_response();
    }

    let code = if state.registered.insert(id.clone(), data.clone()).is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let location = format!("/x-nmos/registration/{}/resource/{}/{}", version, kind.plural(), id);
    (code, [(header::LOCATION, location)], Json(data)).into_response()
}

async fn mock_get(
    State(state): State<SharedRegistry>,
    Path((_version, plural, id)): Path<(String, String, String)>,
) -> Response {
    let mut state = lock(&state);
    state.calls.push(format!("get {} {}", plural, id));
    match state.registered.get(&id) {
        Some(data) => Json(data.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn mock_delete(
    State(state): State<SharedRegistry>,
    Path((_version, plural, id)): Path<(String, String, String)>,
) -> StatusCode {
    let mut state = lock(&state);
    state.calls.push(format!("delete {} {}", plural, id));
    match state.registered.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn mock_heartbeat(
    State(state): State<SharedRegistry>,
    Path((_version, id)): Path<(String, String)>,
) -> Response {
    let (mode, known) = {
        let mut state = lock(&state);
        state.calls.push(format!("heartbeat {}", id));
        (state.heartbeat, state.registered.contains_key(&id))
    };

    match mode {
        HeartbeatMode::Ok if known => Json(json!({ "health": chrono::Utc::now().timestamp().to_string() })).into_response(),
        HeartbeatMode::Ok => StatusCode::NOT_FOUND.into_response(),
        HeartbeatMode::Status(code) => status(code).into_response(),
        HeartbeatMode::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        HeartbeatMode::Garbage => (StatusCode::OK, "not json").into_response(),
    }
}

async fn mock_health(
    State(state): State<SharedRegistry>,
    Path((_version, id)): Path<(String, String)>,
) -> Response {
    let mut state = lock(&state);
    state.calls.push(format!("health {}", id));
    if state.registered.contains_key(&id) {
        Json(json!({ "health": chrono::Utc::now().timestamp().to_string() })).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

#[derive(Debug, Default)]
pub struct MockQueryState {
    /// One entry per request, e.g. "query nodes label=cam"
    pub calls: Vec<String>,
    /// Resources served per plural kind
    pub resources: HashMap<String, Vec<Value>>,
    /// Fail every request with this status
    pub fail_status: Option<u16>,
}

type SharedQuery = Arc<Mutex<MockQueryState>>;

/// A query API on an ephemeral localhost port.
pub struct MockQuery {
    name: String,
    addr: SocketAddr,
    state: SharedQuery,
}

impl MockQuery {
    pub async fn named(name: &str) -> Self {
        let state = SharedQuery::default();
        let app = Router::new()
            .route("/x-nmos/query/:version/:plural", get(mock_query_list))
            .route("/x-nmos/query/:version/:plural/:id", get(mock_query_one))
            .with_state(Arc::clone(&state));
        let addr = serve(app).await;
        Self {
            name: name.to_string(),
            addr,
            state,
        }
    }

    pub fn record(&self) -> ServiceRecord {
        service_record(&self.name, ServiceType::Query, self.addr)
    }

    pub fn state(&self) -> MutexGuard<'_, MockQueryState> {
        lock(&self.state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

async fn mock_query_list(
    State(state): State<SharedQuery>,
    Path((_version, plural)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = lock(&state);
    let mut params: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    params.sort();
    state.calls.push(format!("query {} {}", plural, params.join("&")).trim_end().to_string());
    if let Some(code) = state.fail_status {
        return status(code).into_response();
    }
    Json(state.resources.get(&plural).cloned().unwrap_or_default()).into_response()
}

async fn mock_query_one(
    State(state): State<SharedQuery>,
    Path((_version, plural, id)): Path<(String, String, String)>,
) -> Response {
    let mut state = lock(&state);
    state.calls.push(format!("get {} {}", plural, id));
    if let Some(code) = state.fail_status {
        return status(code).into_response();
    }
    let found = state
        .resources
        .get(&plural)
        .and_then(|list| list.iter().find(|r| r["id"] == id.as_str()))
        .cloned();
    match found {
        Some(resource) => Json(resource).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
