//! Registration lifecycle for the local node.
//!
//! A single task owns all controller state. Handles feed it commands; it
//! reacts to those, to multicast registry announcements and to its own
//! deadlines, one event at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::{Protocol, ResourceKind, ServiceType};
use shared::types::{Device, Flow, Node, Receiver, Resource, Sender, Source};
use crate::discovery::{
    gather_candidates, merge_announcement, next_event, Advertiser, BrowserEvent, Discovery, DiscoveryPlan,
    NodeAdvertisement,
};
use crate::error::{Error, RegistryError, Result};
use crate::registry::client::{RegistrationStatus, RegistryClient};
use crate::resources::SharedResources;
use crate::selector::Selector;
use crate::service::ServiceRecord;
use crate::timer::Deadline;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub search_domain: Option<String>,
    pub allow_multicast: bool,
    pub heartbeat_interval: Duration,
    pub registry_cooldown: Duration,
    pub rediscovery_interval: Duration,
    pub quiet_window: Duration,
    pub max_registration_attempts: u32,
    pub max_reregistrations: u32,
    pub retry_backoff: Duration,
    /// Wait after a registry appears before trying it
    pub reaction_delay: Duration,
    /// Upper bound of the random delay added to `reaction_delay`
    pub reaction_grace: Duration,
    /// Peer-to-peer advertisement; version counters are filled in when sent
    pub advertisement: NodeAdvertisement,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            search_domain: None,
            allow_multicast: true,
            heartbeat_interval: Duration::from_millis(5000),
            registry_cooldown: Duration::from_millis(45_000),
            rediscovery_interval: Duration::from_millis(60_000),
            quiet_window: Duration::from_millis(2000),
            max_registration_attempts: 5,
            max_reregistrations: 3,
            retry_backoff: Duration::from_millis(500),
            reaction_delay: Duration::from_millis(1000),
            reaction_grace: Duration::from_millis(500),
            advertisement: NodeAdvertisement {
                instance: "nmos-node".to_string(),
                port: 3212,
                api_proto: "http".to_string(),
                api_versions: vec![shared::protocol::MAX_API_VERSION],
                api_auth: false,
                versions: [0; 6],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Discovering,
    Registered { registry: String },
    PeerToPeer,
    Failed(String),
}

enum Command {
    Register(oneshot::Sender<Result<()>>),
    Unregister(oneshot::Sender<Result<()>>),
    /// A local resource changed
    Changed(String),
}

/// Handle to the registration controller task.
#[derive(Clone)]
pub struct RegistrationHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<RegistrationState>,
    resources: SharedResources,
}

impl RegistrationHandle {
    /// Set the node resource. Not allowed while registered.
    pub async fn set_node(&self, node: Node) -> Result<()> {
        if matches!(*self.status.borrow(), RegistrationState::Registered { .. }) {
            return Err(Error::NodeRegistered);
        }
        let id = node.core.id.clone();
        self.resources.write().set_node(node);
        self.notify(id).await
    }

    pub async fn add_device(&self, device: Device) -> Result<()> {
        self.add(device.into()).await
    }

    pub async fn add_source(&self, source: Source) -> Result<()> {
        self.add(source.into()).await
    }

    pub async fn add_flow(&self, flow: Flow) -> Result<()> {
        self.add(flow.into()).await
    }

    pub async fn add_sender(&self, sender: Sender) -> Result<()> {
        self.add(sender.into()).await
    }

    pub async fn add_receiver(&self, receiver: Receiver) -> Result<()> {
        self.add(receiver.into()).await
    }

    async fn add(&self, resource: Resource) -> Result<()> {
        let id = resource.id().to_string();
        self.resources.write().add(resource);
        self.notify(id).await
    }

    /// Replace a previously added resource.
    pub async fn update_resource(&self, resource: Resource) -> Result<()> {
        let id = resource.id().to_string();
        self.resources.write().update(resource)?;
        self.notify(id).await
    }

    async fn notify(&self, id: String) -> Result<()> {
        self.tx
            .send(Command::Changed(id))
            .await
            .map_err(|_| Error::ControllerClosed)
    }

    /// Find a registry and register. Resolves once registered or running
    /// peer-to-peer; only fatal errors are returned.
    pub async fn register(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register(reply))
            .await
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    /// Delete every registered resource, best-effort, and stop.
    pub async fn unregister(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Unregister(reply))
            .await
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    pub fn status(&self) -> RegistrationState {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RegistrationState> {
        self.status.clone()
    }

    pub fn resources(&self) -> SharedResources {
        self.resources.clone()
    }
}

pub struct RegistrationController {
    settings: ControllerSettings,
    discovery: Arc<dyn Discovery>,
    advertiser: Arc<dyn Advertiser>,
    http: reqwest::Client,
    resources: SharedResources,
    selector: Selector,
    status: watch::Sender<RegistrationState>,

    /// register() has been requested and not undone
    enabled: bool,
    registry: Option<RegistryClient>,
    /// Registry whose registration may still be alive after losing contact
    previous: Option<String>,
    advertising: bool,
    multicast_known: Vec<ServiceRecord>,
    penalties: HashMap<String, (DateTime<Utc>, String)>,

    heartbeat: Deadline,
    rediscover: Deadline,
    expiry: Deadline,
    reaction: Deadline,
}

impl RegistrationController {
    pub fn new(
        settings: ControllerSettings,
        discovery: Arc<dyn Discovery>,
        advertiser: Arc<dyn Advertiser>,
        http: reqwest::Client,
        resources: SharedResources,
    ) -> Self {
        let (status, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            settings,
            discovery,
            advertiser,
            http,
            resources,
            selector: Selector::new(),
            status,
            enabled: false,
            registry: None,
            previous: None,
            advertising: false,
            multicast_known: Vec::new(),
            penalties: HashMap::new(),
            heartbeat: Deadline::default(),
            rediscover: Deadline::default(),
            expiry: Deadline::default(),
            reaction: Deadline::default(),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    /// Start the controller task.
    pub fn spawn(self, cancel: CancellationToken) -> (RegistrationHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let handle = RegistrationHandle {
            tx,
            status: self.status.subscribe(),
            resources: self.resources.clone(),
        };
        let task = tokio::spawn(self.run(rx, cancel));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut registry_watch = if self.settings.allow_multicast {
            match self.discovery.watch(ServiceType::Register, Protocol::Tcp) {
                Ok(watch) => Some(watch),
                Err(e) => {
                    tracing::warn!("Cannot watch for registries: {}", e);
                    None
                }
            }
        } else {
            None
        };

        loop {
            let (heartbeat, rediscover, expiry, reaction) =
                (self.heartbeat, self.rediscover, self.expiry, self.reaction);

            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }

                event = next_event(&mut registry_watch) => {
                    match event {
                        Some(event) => self.on_registry_event(event).await,
                        None => {
                            tracing::warn!("Registry watch ended");
                            registry_watch = None;
                        }
                    }
                }

                // A fired deadline stays disarmed until a handler re-arms it
                _ = heartbeat.expired() => {
                    self.heartbeat.cancel();
                    self.on_heartbeat().await;
                }
                _ = rediscover.expired() => {
                    self.rediscover.cancel();
                    self.on_rediscover().await;
                }
                _ = expiry.expired() => {
                    self.expiry.cancel();
                    self.on_expiry();
                }
                _ = reaction.expired() => {
                    self.reaction.cancel();
                    self.on_reaction().await;
                }

                _ = cancel.cancelled() => {
                    tracing::info!("Registration controller shutting down");
                    break;
                }
            }
        }

        if registry_watch.is_some() {
            self.discovery.stop(ServiceType::Register, Protocol::Tcp);
        }
        self.withdraw().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register(reply) => {
                let result = self.register().await;
                let _ = reply.send(result);
            }
            Command::Unregister(reply) => {
                self.unregister().await;
                let _ = reply.send(Ok(()));
            }
            Command::Changed(id) => self.push(&id).await,
        }
    }

    fn set_status(&self, state: RegistrationState) {
        self.status.send_replace(state);
    }

    fn node_id(&self) -> Option<String> {
        self.resources.read().node_id().map(str::to_string)
    }

    async fn register(&mut self) -> Result<()> {
        if self.resources.read().node().is_none() {
            return Err(Error::NoNode);
        }
        self.enabled = true;
        if self.registry.is_some() {
            return Ok(());
        }
        self.acquire(false).await
    }

    /// Select registries and register with the first that succeeds, falling
    /// back to peer-to-peer once none is left. Only fatal errors escape.
    async fn acquire(&mut self, refresh: bool) -> Result<()> {
        self.reaction.cancel();
        self.set_status(RegistrationState::Discovering);

        for attempt in 1..=self.settings.max_registration_attempts.max(1) {
            let Some(client) = self.select_registry(refresh && attempt == 1).await else {
                tracing::info!("No registry available");
                break;
            };
            tracing::info!("Selected registry {}", client.record());

            match self.resume_or_register(&client).await {
                Ok(()) => {
                    self.enter_registered(client).await;
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Registration with {} failed: {}", client.record().name, e);
                    self.penalize(client.record(), &e);
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
            }
        }

        self.enter_peer_to_peer().await;
        Ok(())
    }

    fn plan(&self) -> DiscoveryPlan {
        DiscoveryPlan {
            service: ServiceType::Register,
            protocol: Protocol::Tcp,
            search_domain: self.settings.search_domain.clone(),
            multicast: self.settings.allow_multicast,
            quiet_window: self.settings.quiet_window,
        }
    }

    async fn select_registry(&mut self, refresh: bool) -> Option<RegistryClient> {
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
                async move { RegistryClient::accept(http, record) }
            })
            .await
    }

    fn penalize(&mut self, record: &ServiceRecord, error: &Error) {
        let cooldown = chrono::Duration::from_std(self.settings.registry_cooldown).unwrap_or_default();
        self.penalties
            .insert(record.name.clone(), (Utc::now() + cooldown, error.to_string()));
    }

    /// Pick up a registration that may still be alive at `client`, or
    /// register from scratch.
    async fn resume_or_register(&mut self, client: &RegistryClient) -> Result<()> {
        if self.expiry.is_armed() && self.previous.as_deref() == Some(client.record().name.as_str()) {
            let node_id = self.node_id().ok_or(Error::NoNode)?;
            match client.heartbeat(&node_id, self.settings.heartbeat_interval).await {
                Ok(_) => {
                    tracing::info!("Resuming registration with {}", client.record().name);
                    return self.push_all(client).await;
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!("Previous registration with {} has expired", client.record().name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.register_all(client).await
    }

    /// Register the node then every child in dependency order. An
    /// already-registered node is deleted and the sequence restarted.
    async fn register_all(&mut self, client: &RegistryClient) -> Result<()> {
        let mut reregistrations = 0;

        loop {
            let (node, children) = {
                let store = self.resources.read();
                (store.node().cloned(), store.registration_order())
            };
            let node = node.ok_or(Error::NoNode)?;
            let node_id = node.core.id.clone();

            let response = client.register(&Resource::Node(node)).await?;
            if response.status == RegistrationStatus::AlreadyRegistered {
                if reregistrations >= self.settings.max_reregistrations {
                    return Err(RegistryError::Protocol {
                        url: client.base_url().to_string(),
                        reason: format!("node {} still reported as already registered", node_id),
                    }
                    .into());
                }
                reregistrations += 1;
                tracing::info!("Node {} already registered with {}, re-registering", node_id, client.record().name);
                client.delete(ResourceKind::Node, &node_id).await?;
                continue;
            }

            for resource in &children {
                client.register(resource).await?;
            }
            tracing::info!("Registered node {} and {} resources", node_id, children.len());
            return Ok(());
        }
    }

    /// Send every resource as an update.
    async fn push_all(&mut self, client: &RegistryClient) -> Result<()> {
        let (node, children) = {
            let store = self.resources.read();
            (store.node().cloned(), store.registration_order())
        };
        let node = node.ok_or(Error::NoNode)?;
        client.register(&Resource::Node(node)).await?;
        for resource in &children {
            client.register(resource).await?;
        }
        Ok(())
    }

    async fn enter_registered(&mut self, client: RegistryClient) {
        tracing::info!("Registered with {}", client.record());
        self.set_status(RegistrationState::Registered {
            registry: client.record().name.clone(),
        });
        self.registry = Some(client);
        self.previous = None;
        self.heartbeat.arm(self.settings.heartbeat_interval);
        self.rediscover.cancel();
        self.expiry.cancel();
        self.reaction.cancel();
        self.withdraw().await;
    }

    async fn enter_peer_to_peer(&mut self) {
        if *self.status.borrow() != RegistrationState::PeerToPeer {
            tracing::info!("Falling back to peer-to-peer operation");
        }
        self.registry = None;
        self.heartbeat.cancel();
        self.set_status(RegistrationState::PeerToPeer);
        if !self.advertising {
            self.advertise().await;
        }
        self.rediscover.arm(self.settings.rediscovery_interval);
    }

    async fn fail(&mut self, error: &Error) {
        tracing::error!("Registration failed: {}", error);
        self.registry = None;
        self.previous = None;
        self.enabled = false;
        self.heartbeat.cancel();
        self.rediscover.cancel();
        self.expiry.cancel();
        self.reaction.cancel();
        self.withdraw().await;
        self.set_status(RegistrationState::Failed(error.to_string()));
    }

    /// The active registry stopped working: fail fatally or move on.
    async fn registry_failed(&mut self, error: Error) {
        if error.is_fatal() {
            self.fail(&error).await;
            return;
        }

        tracing::warn!("Registry error: {}", error);
        if let Some(record) = self.registry.as_ref().map(|c| c.record().clone()) {
            self.penalize(&record, &error);
        }
        self.lose_registry().await;
    }

    async fn lose_registry(&mut self) {
        let Some(client) = self.registry.take() else {
            return;
        };
        self.heartbeat.cancel();
        self.previous = Some(client.record().name.clone());
        self.expiry.arm(self.settings.heartbeat_interval * 2);
        if let Err(e) = self.acquire(false).await {
            tracing::error!("Failover failed: {}", e);
        }
    }

    async fn on_heartbeat(&mut self) {
        let Some(client) = self.registry.clone() else {
            return;
        };
        let Some(node_id) = self.node_id() else {
            return;
        };

        match client.heartbeat(&node_id, self.settings.heartbeat_interval).await {
            Ok(_) => {
                tracing::trace!("Heartbeat to {} ok", client.record().name);
                self.heartbeat.arm(self.settings.heartbeat_interval);
            }
            // 404 means the registry expired the node; re-register rather than fail
            // like other 4xx responses
            Err(e) if e.is_not_found() => {
                tracing::warn!("Registry {} no longer knows node {}, re-registering", client.record().name, node_id);
                match self.register_all(&client).await {
                    Ok(()) => self.heartbeat.arm(self.settings.heartbeat_interval),
                    Err(e) => self.registry_failed(e).await,
                }
            }
            Err(e) => self.registry_failed(e.into()).await,
        }
    }

    async fn on_rediscover(&mut self) {
        if !self.enabled || self.registry.is_some() {
            return;
        }
        tracing::debug!("Looking for a registry");
        if let Err(e) = self.acquire(true).await {
            tracing::error!("Rediscovery failed: {}", e);
        }
    }

    fn on_expiry(&mut self) {
        self.expiry.cancel();
        if let Some(name) = self.previous.take() {
            tracing::info!("Registration with {} has lapsed", name);
        }
    }

    async fn on_reaction(&mut self) {
        if !self.enabled || self.registry.is_some() {
            return;
        }
        if let Err(e) = self.acquire(false).await {
            tracing::error!("Registration failed: {}", e);
        }
    }

    async fn on_registry_event(&mut self, event: BrowserEvent) {
        match event {
            BrowserEvent::Resolved(record) => {
                tracing::debug!("Registry announced: {}", record);
                let added = merge_announcement(&mut self.multicast_known, record);
                if added && self.enabled && self.registry.is_none() {
                    let grace_ms = self.settings.reaction_grace.as_millis() as u64;
                    let grace = Duration::from_millis(rand::thread_rng().gen_range(0..=grace_ms));
                    self.reaction.arm_if_idle(self.settings.reaction_delay + grace);
                }
            }
            BrowserEvent::Removed(name) => {
                tracing::debug!("Registry withdrawn: {}", name);
                self.multicast_known.retain(|r| r.name != name);
                if self.registry.as_ref().is_some_and(|c| c.record().name == name) {
                    tracing::warn!("Active registry {} withdrawn, reselecting", name);
                    self.lose_registry().await;
                }
            }
        }
    }

    async fn push(&mut self, id: &str) {
        let resource = self.resources.read().get(id);
        let Some(resource) = resource else {
            return;
        };

        if let Some(client) = self.registry.clone() {
            if let Err(e) = client.register(&resource).await {
                self.registry_failed(e.into()).await;
            }
        } else if self.advertising {
            self.advertise().await;
        }
    }

    async fn advertise(&mut self) {
        let mut advert = self.settings.advertisement.clone();
        advert.versions = self.resources.read().versions();
        match self.advertiser.advertise(&advert).await {
            Ok(()) => self.advertising = true,
            Err(e) => tracing::warn!("Failed to advertise node: {}", e),
        }
    }

    async fn withdraw(&mut self) {
        if !self.advertising {
            return;
        }
        self.advertising = false;
        if let Err(e) = self.advertiser.withdraw().await {
            tracing::warn!("Failed to withdraw node advertisement: {}", e);
        }
    }

    async fn unregister(&mut self) {
        self.enabled = false;
        self.heartbeat.cancel();
        self.rediscover.cancel();
        self.expiry.cancel();
        self.reaction.cancel();
        self.previous = None;

        if let Some(client) = self.registry.take() {
            let (node_id, children) = {
                let store = self.resources.read();
                (store.node_id().map(str::to_string), store.registration_order())
            };
            for resource in children.iter().rev() {
                if let Err(e) = client.delete(resource.kind(), resource.id()).await {
                    tracing::warn!("Failed to delete {} {}: {}", resource.kind(), resource.id(), e);
                }
            }
            if let Some(node_id) = node_id {
                if let Err(e) = client.delete(ResourceKind::Node, &node_id).await {
                    tracing::warn!("Failed to delete node {}: {}", node_id, e);
                }
            }
            tracing::info!("Unregistered from {}", client.record().name);
        }

        self.withdraw().await;
        self.set_status(RegistrationState::Unregistered);
    }
}
