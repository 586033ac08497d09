//! Read access to the resource graph.
//!
//! Queries go to a centralized query service when one is discovered and
//! accepted. Otherwise the aggregator browses for nodes itself, polls each
//! one's Node API and answers from what it has gathered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::{Protocol, ResourceKind, ServiceType};
use crate::discovery::{gather_candidates, merge_announcement, next_event, BrowserEvent, Discovery, DiscoveryPlan, ServiceWatch};
use crate::error::{Error, RegistryError, Result};
use crate::query::cache::NodeCache;
use crate::query::client::QueryClient;
use crate::query::node_client::{NodeClient, NodeSnapshot};
use crate::selector::Selector;
use crate::service::ServiceRecord;
use crate::timer::Deadline;

/// Reselections made while answering one call
const MAX_FAILOVERS: usize = 3;

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub search_domain: Option<String>,
    pub allow_multicast: bool,
    /// Aggregate directly from nodes when no query service is available
    pub allow_peer_to_peer: bool,
    pub freshness_window: Duration,
    /// Bound on one node poll
    pub request_timeout: Duration,
    pub quiet_window: Duration,
    pub service_cooldown: Duration,
    pub rediscovery_interval: Duration,
    pub reaction_delay: Duration,
    pub reaction_grace: Duration,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            search_domain: None,
            allow_multicast: true,
            allow_peer_to_peer: true,
            freshness_window: Duration::from_millis(10_000),
            request_timeout: Duration::from_millis(5000),
            quiet_window: Duration::from_millis(2000),
            service_cooldown: Duration::from_millis(45_000),
            rediscovery_interval: Duration::from_millis(60_000),
            reaction_delay: Duration::from_millis(1000),
            reaction_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryMode {
    Discovering,
    Central { service: String },
    PeerToPeer,
    /// No query service and peer-to-peer aggregation is not permitted
    Unavailable,
}

enum Backend {
    Central(QueryClient),
    PeerToPeer,
    Unavailable,
}

enum Command {
    Query {
        kind: ResourceKind,
        params: Vec<(String, String)>,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
    Get {
        kind: ResourceKind,
        id: String,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
}

type PollResult = (String, std::result::Result<NodeSnapshot, RegistryError>);

/// Handle to the query aggregator task.
#[derive(Clone)]
pub struct QueryHandle {
    tx: mpsc::Sender<Command>,
    mode: watch::Receiver<QueryMode>,
}

impl QueryHandle {
    /// Resources of `kind` matching `params`.
    pub async fn query(&self, kind: ResourceKind, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Query { kind, params, reply })
            .await
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    pub async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        let id = id.to_string();
        self.tx
            .send(Command::Get { kind, id, reply })
            .await
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    pub async fn query_nodes(&self, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        self.query(ResourceKind::Node, params).await
    }

    pub async fn query_devices(&self, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        self.query(ResourceKind::Device, params).await
    }

    pub async fn query_sources(&self, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        self.query(ResourceKind::Source, params).await
    }

    pub async fn query_flows(&self, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        self.query(ResourceKind::Flow, params).await
    }

    pub async fn query_senders(&self, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        self.query(ResourceKind::Sender, params).await
    }

    pub async fn query_receivers(&self, params: Vec<(String, String)>) -> Result<Vec<Value>> {
        self.query(ResourceKind::Receiver, params).await
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Value>> {
        self.get(ResourceKind::Node, id).await
    }

    pub async fn get_device(&self, id: &str) -> Result<Option<Value>> {
        self.get(ResourceKind::Device, id).await
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<Value>> {
        self.get(ResourceKind::Source, id).await
    }

    pub async fn get_flow(&self, id: &str) -> Result<Option<Value>> {
        self.get(ResourceKind::Flow, id).await
    }

    pub async fn get_sender(&self, id: &str) -> Result<Option<Value>> {
        self.get(ResourceKind::Sender, id).await
    }

    pub async fn get_receiver(&self, id: &str) -> Result<Option<Value>> {
        self.get(ResourceKind::Receiver, id).await
    }

    pub fn mode(&self) -> QueryMode {
        self.mode.borrow().clone()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<QueryMode> {
        self.mode.clone()
    }
}

pub struct QueryAggregator {
    settings: QuerySettings,
    discovery: Arc<dyn Discovery>,
    http: reqwest::Client,
    selector: Selector,
    mode: watch::Sender<QueryMode>,

    backend: Backend,
    multicast_known: Vec<ServiceRecord>,
    penalties: HashMap<String, (DateTime<Utc>, String)>,
    cache: NodeCache,
    /// Nodes with a poll in flight
    polling: HashSet<String>,

    rediscover: Deadline,
    reaction: Deadline,
}

impl QueryAggregator {
    pub fn new(settings: QuerySettings, discovery: Arc<dyn Discovery>, http: reqwest::Client) -> Self {
        let (mode, _) = watch::channel(QueryMode::Discovering);
        Self {
            settings,
            discovery,
            http,
            selector: Selector::new(),
            mode,
            backend: Backend::Unavailable,
            multicast_known: Vec::new(),
            penalties: HashMap::new(),
            cache: NodeCache::new(),
            polling: HashSet::new(),
            rediscover: Deadline::default(),
            reaction: Deadline::default(),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    /// Start the aggregator task. Discovery begins immediately.
    pub fn spawn(self, cancel: CancellationToken) -> (QueryHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let handle = QueryHandle {
            tx,
            mode: self.mode.subscribe(),
        };
        let task = tokio::spawn(self.run(rx, cancel));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let (poll_tx, mut poll_rx) = mpsc::channel::<PollResult>(64);

        let mut service_watch = if self.settings.allow_multicast {
            match self.discovery.watch(ServiceType::Query, Protocol::Tcp) {
                Ok(watch) => Some(watch),
                Err(e) => {
                    tracing::warn!("Cannot watch for query services: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let mut node_watch: Option<ServiceWatch> = None;

        self.select_backend(false).await;
        self.sync_node_watch(&mut node_watch);

        loop {
            let (rediscover, reaction) = (self.rediscover, self.reaction);

            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command, &poll_tx).await;
                }

                event = next_event(&mut service_watch) => {
                    match event {
                        Some(event) => self.on_service_event(event).await,
                        None => {
                            tracing::warn!("Query service watch ended");
                            service_watch = None;
                        }
                    }
                }

                event = next_event(&mut node_watch) => {
                    match event {
                        Some(event) => self.on_node_event(event, &poll_tx),
                        None => {
                            tracing::warn!("Node watch ended");
                            node_watch = None;
                        }
                    }
                }

                Some((name, result)) = poll_rx.recv() => self.on_polled(name, result),

                // A fired deadline stays disarmed until a handler re-arms it
                _ = rediscover.expired() => {
                    self.rediscover.cancel();
                    self.on_rediscover().await;
                }
                _ = reaction.expired() => {
                    self.reaction.cancel();
                    self.on_reaction().await;
                }

                _ = cancel.cancelled() => {
                    tracing::info!("Query aggregator shutting down");
                    break;
                }
            }

            self.sync_node_watch(&mut node_watch);
        }

        if service_watch.is_some() {
            self.discovery.stop(ServiceType::Query, Protocol::Tcp);
        }
        if node_watch.is_some() {
            self.discovery.stop(ServiceType::Node, Protocol::Tcp);
        }
    }

    async fn handle_command(&mut self, command: Command, poll_tx: &mpsc::Sender<PollResult>) {
        match command {
            Command::Query { kind, params, reply } => {
                let result = self.query(kind, &params, poll_tx).await;
                let _ = reply.send(result);
            }
            Command::Get { kind, id, reply } => {
                let result = self.get(kind, &id, poll_tx).await;
                let _ = reply.send(result);
            }
        }
    }

    fn set_mode(&self, mode: QueryMode) {
        self.mode.send_replace(mode);
    }

    fn is_central(&self) -> bool {
        matches!(self.backend, Backend::Central(_))
    }

    /// Browse nodes exactly while aggregating peer-to-peer.
    fn sync_node_watch(&mut self, node_watch: &mut Option<ServiceWatch>) {
        let wanted = matches!(self.backend, Backend::PeerToPeer);
        if wanted && node_watch.is_none() {
            match self.discovery.watch(ServiceType::Node, Protocol::Tcp) {
                Ok(watch) => *node_watch = Some(watch),
                Err(e) => tracing::warn!("Cannot watch for nodes: {}", e),
            }
        } else if !wanted && node_watch.is_some() {
            *node_watch = None;
            self.discovery.stop(ServiceType::Node, Protocol::Tcp);
            self.cache.clear();
            self.polling.clear();
        }
    }

    fn plan(&self) -> DiscoveryPlan {
        DiscoveryPlan {
            service: ServiceType::Query,
            protocol: Protocol::Tcp,
            search_domain: self.settings.search_domain.clone(),
            multicast: self.settings.allow_multicast,
            quiet_window: self.settings.quiet_window,
        }
    }

    async fn select_service(&mut self, refresh: bool) -> Option<QueryClient> {
        let plan = self.plan();
        let mut candidates =
            gather_candidates(self.discovery.as_ref(), &plan, &mut self.multicast_known, refresh).await;

        let now = Utc::now();
        self.penalties.retain(|_, (until, _)| *until > now);
        for record in &mut candidates {
            if let Some((until, reason)) = self.penalties.get(&record.name) {
                record.ignore_until(*until, reason.clone());
            }
        }

        let http = self.http.clone();
        self.selector
            .select_with(&mut candidates, move |record| {
                let http = http.clone();
                async move { QueryClient::accept(http, record) }
            })
            .await
    }

    async fn select_backend(&mut self, refresh: bool) {
        self.reaction.cancel();

        if let Some(client) = self.select_service(refresh).await {
            tracing::info!("Using query service {}", client.record());
            self.set_mode(QueryMode::Central {
                service: client.record().name.clone(),
            });
            self.backend = Backend::Central(client);
            self.rediscover.cancel();
            return;
        }

        if self.settings.allow_peer_to_peer && self.settings.allow_multicast {
            if !matches!(self.backend, Backend::PeerToPeer) {
                tracing::info!("No query service found, aggregating from nodes directly");
            }
            self.backend = Backend::PeerToPeer;
            self.set_mode(QueryMode::PeerToPeer);
        } else {
            tracing::warn!("No query service available");
            self.backend = Backend::Unavailable;
            self.set_mode(QueryMode::Unavailable);
        }
        self.rediscover.arm(self.settings.rediscovery_interval);
    }

    fn penalize(&mut self, record: &ServiceRecord, error: &RegistryError) {
        let cooldown = chrono::Duration::from_std(self.settings.service_cooldown).unwrap_or_default();
        self.penalties
            .insert(record.name.clone(), (Utc::now() + cooldown, error.to_string()));
    }

    async fn service_failed(&mut self, record: &ServiceRecord, error: &RegistryError) {
        tracing::warn!("Query service {} failed: {}", record.name, error);
        self.penalize(record, error);
        self.select_backend(false).await;
    }

    async fn query(
        &mut self,
        kind: ResourceKind,
        params: &[(String, String)],
        poll_tx: &mpsc::Sender<PollResult>,
    ) -> Result<Vec<Value>> {
        for _ in 0..=MAX_FAILOVERS {
            let client = match &self.backend {
                Backend::Central(client) => Some(client.clone()),
                Backend::PeerToPeer => None,
                Backend::Unavailable => return Err(Error::NoQueryService),
            };
            let Some(client) = client else {
                self.refresh_stale(poll_tx);
                return Ok(self.cache.query(kind, params));
            };

            match client.query(kind, params).await {
                Ok(resources) => return Ok(resources),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => self.service_failed(client.record(), &e).await,
            }
        }
        Err(Error::NoQueryService)
    }

    async fn get(
        &mut self,
        kind: ResourceKind,
        id: &str,
        poll_tx: &mpsc::Sender<PollResult>,
    ) -> Result<Option<Value>> {
        for _ in 0..=MAX_FAILOVERS {
            let client = match &self.backend {
                Backend::Central(client) => Some(client.clone()),
                Backend::PeerToPeer => None,
                Backend::Unavailable => return Err(Error::NoQueryService),
            };
            let Some(client) = client else {
                self.refresh_stale(poll_tx);
                return Ok(self.cache.find(kind, id));
            };

            match client.get(kind, id).await {
                Ok(resource) => return Ok(resource),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => self.service_failed(client.record(), &e).await,
            }
        }
        Err(Error::NoQueryService)
    }

    /// Re-poll entries older than the freshness window. The current answer
    /// still comes from the cache.
    fn refresh_stale(&mut self, poll_tx: &mpsc::Sender<PollResult>) {
        for record in self.cache.stale(Utc::now(), self.settings.freshness_window) {
            self.spawn_poll(record, poll_tx);
        }
    }

    fn spawn_poll(&mut self, record: ServiceRecord, poll_tx: &mpsc::Sender<PollResult>) {
        if self.polling.contains(&record.name) {
            return;
        }
        let client = match NodeClient::accept(self.http.clone(), &record) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!("Not polling {}: {}", record.name, e);
                return;
            }
        };
        self.polling.insert(record.name.clone());

        let tx = poll_tx.clone();
        let timeout = self.settings.request_timeout;
        let name = record.name;
        tokio::spawn(async move {
            tracing::debug!("Polling node {} at {}", name, client.base_url());
            let result = match tokio::time::timeout(timeout, client.snapshot()).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout(timeout)),
            };
            let _ = tx.send((name, result)).await;
        });
    }

    fn on_polled(&mut self, name: String, result: std::result::Result<NodeSnapshot, RegistryError>) {
        self.polling.remove(&name);
        match result {
            Ok(snapshot) => {
                if self.cache.apply(&name, snapshot, Utc::now()) {
                    tracing::debug!("Updated node {}", name);
                } else {
                    tracing::debug!("Discarding poll of departed node {}", name);
                }
            }
            Err(e) => tracing::warn!("Failed to poll node {}: {}", name, e),
        }
    }

    fn on_node_event(&mut self, event: BrowserEvent, poll_tx: &mpsc::Sender<PollResult>) {
        match event {
            BrowserEvent::Resolved(record) => {
                if self.cache.observe(record.clone(), Utc::now(), self.settings.freshness_window) {
                    self.spawn_poll(record, poll_tx);
                }
            }
            BrowserEvent::Removed(name) => {
                if self.cache.evict(&name).is_some() {
                    tracing::info!("Node {} went away", name);
                }
            }
        }
    }

    async fn on_service_event(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::Resolved(record) => {
                tracing::debug!("Query service announced: {}", record);
                let added = merge_announcement(&mut self.multicast_known, record);
                if added && !self.is_central() {
                    let grace_ms = self.settings.reaction_grace.as_millis() as u64;
                    let grace = Duration::from_millis(rand::thread_rng().gen_range(0..=grace_ms));
                    self.reaction.arm_if_idle(self.settings.reaction_delay + grace);
                }
            }
            BrowserEvent::Removed(name) => {
                tracing::debug!("Query service withdrawn: {}", name);
                self.multicast_known.retain(|r| r.name != name);
                let active = match &self.backend {
                    Backend::Central(client) => client.record().name == name,
                    _ => false,
                };
                if active {
                    tracing::warn!("Active query service {} withdrawn, reselecting", name);
                    self.select_backend(false).await;
                }
            }
        }
    }

    async fn on_rediscover(&mut self) {
        if self.is_central() {
            return;
        }
        tracing::debug!("Looking for a query service");
        self.select_backend(true).await;
    }

    async fn on_reaction(&mut self) {
        if self.is_central() {
            return;
        }
        self.select_backend(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::api::{router, AppState};
    use crate::resources::SharedResources;
    use crate::testing::{device, node, serve, service_record, wait_until, FakeDiscovery, MockQuery};

    fn settings() -> QuerySettings {
        QuerySettings {
            quiet_window: Duration::from_millis(10),
            reaction_delay: Duration::from_millis(50),
            reaction_grace: Duration::from_millis(50),
            ..Default::default()
        }
    }

    struct Harness {
        handle: QueryHandle,
        discovery: Arc<FakeDiscovery>,
        cancel: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn start_with(settings: QuerySettings, services: Vec<ServiceRecord>) -> Harness {
        let discovery = Arc::new(FakeDiscovery::new());
        discovery.set_multicast(ServiceType::Query, services);
        let cancel = CancellationToken::new();
        let aggregator = QueryAggregator::new(settings, discovery.clone(), reqwest::Client::new());
        let (handle, _task) = aggregator.spawn(cancel.clone());
        Harness {
            handle,
            discovery,
            cancel,
        }
    }

    fn start(services: Vec<ServiceRecord>) -> Harness {
        start_with(settings(), services)
    }

    /// A peer serving its Node API from a local store.
    async fn peer(name: &str, node_id: &str, devices: &[&str]) -> ServiceRecord {
        let resources = SharedResources::new();
        {
            let mut store = resources.write();
            store.set_node(node(node_id));
            for id in devices {
                store.add(device(id, node_id).into());
            }
        }
        let addr = serve(router(AppState::new(resources))).await;
        service_record(name, ServiceType::Node, addr)
    }

    async fn query_until(handle: &QueryHandle, kind: ResourceKind, len: usize) -> Vec<Value> {
        for _ in 0..250 {
            let found = handle.query(kind, Vec::new()).await.unwrap();
            if found.len() == len {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} {}", len, kind.plural());
    }

    fn params(key: &str, value: &str) -> Vec<(String, String)> {
        vec![(key.to_string(), value.to_string())]
    }

    #[tokio::test]
    async fn test_forwards_to_central_service() {
        let service = MockQuery::named("central").await;
        service
            .state()
            .resources
            .insert("senders".to_string(), vec![json!({ "id": "s1", "label": "cam" })]);
        let harness = start(vec![service.record()]);

        let senders = harness.handle.query_senders(params("label", "cam")).await.unwrap();
        assert_eq!(senders, vec![json!({ "id": "s1", "label": "cam" })]);
        assert_eq!(harness.handle.get_sender("s1").await.unwrap(), Some(json!({ "id": "s1", "label": "cam" })));
        assert_eq!(harness.handle.get_sender("s2").await.unwrap(), None);
        assert_eq!(
            harness.handle.mode(),
            QueryMode::Central {
                service: service.record().name
            }
        );
        assert_eq!(service.calls(), vec!["query senders label=cam", "get senders s1", "get senders s2"]);
    }

    #[tokio::test]
    async fn test_transient_failure_answers_from_next_service() {
        let failing = MockQuery::named("failing").await;
        failing.state().fail_status = Some(503);
        let spare = MockQuery::named("spare").await;
        spare.state().resources.insert("flows".to_string(), vec![json!({ "id": "f1" })]);
        let harness = start(vec![failing.record(), spare.record().with_priority(10)]);

        let flows = harness.handle.query_flows(Vec::new()).await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(failing.calls(), vec!["query flows"]);
        assert_eq!(spare.calls(), vec!["query flows"]);
        assert_eq!(
            harness.handle.mode(),
            QueryMode::Central {
                service: spare.record().name
            }
        );
    }

    #[tokio::test]
    async fn test_client_error_is_returned() {
        let service = MockQuery::named("strict").await;
        service.state().fail_status = Some(400);
        let harness = start(vec![service.record()]);

        let err = harness.handle.query_nodes(Vec::new()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Registry(RegistryError::Client { status: 400, .. })));
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_without_peer_to_peer() {
        let harness = start_with(
            QuerySettings {
                allow_peer_to_peer: false,
                ..settings()
            },
            Vec::new(),
        );
        let err = harness.handle.query_devices(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::NoQueryService));
        assert_eq!(harness.handle.mode(), QueryMode::Unavailable);
    }

    #[tokio::test]
    async fn test_peer_to_peer_aggregates_nodes() {
        let harness = start(Vec::new());
        let mut mode = harness.handle.subscribe_mode();
        wait_until(&mut mode, |m| *m == QueryMode::PeerToPeer).await;

        harness.discovery.announce(ServiceType::Node, peer("a", "n1", &["d1"]).await);
        harness.discovery.announce(ServiceType::Node, peer("b", "n2", &["d2", "d3"]).await);

        let nodes = query_until(&harness.handle, ResourceKind::Node, 2).await;
        let mut ids: Vec<&str> = nodes.iter().filter_map(|n| n["id"].as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["n1", "n2"]);

        query_until(&harness.handle, ResourceKind::Device, 3).await;
        let filtered = harness.handle.query_devices(params("node_id", "n2")).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(harness.handle.get_device("d1").await.unwrap().unwrap()["node_id"], "n1");
        assert_eq!(harness.handle.get_device("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_departed_node_is_evicted() {
        let harness = start(Vec::new());
        let mut mode = harness.handle.subscribe_mode();
        wait_until(&mut mode, |m| *m == QueryMode::PeerToPeer).await;

        let record = peer("a", "n1", &["d1"]).await;
        let name = record.name.clone();
        harness.discovery.announce(ServiceType::Node, record);
        query_until(&harness.handle, ResourceKind::Device, 1).await;

        harness.discovery.withdraw(ServiceType::Node, &name);
        query_until(&harness.handle, ResourceKind::Device, 0).await;
        query_until(&harness.handle, ResourceKind::Node, 0).await;
    }

    #[tokio::test]
    async fn test_switches_to_central_service_when_one_appears() {
        let harness = start(Vec::new());
        let mut mode = harness.handle.subscribe_mode();
        wait_until(&mut mode, |m| *m == QueryMode::PeerToPeer).await;

        let service = MockQuery::named("late").await;
        service.state().resources.insert("nodes".to_string(), vec![json!({ "id": "remote" })]);
        harness.discovery.announce(ServiceType::Query, service.record());

        wait_until(&mut mode, |m| matches!(m, QueryMode::Central { .. })).await;
        let nodes = harness.handle.query_nodes(Vec::new()).await.unwrap();
        assert_eq!(nodes, vec![json!({ "id": "remote" })]);
    }
}
