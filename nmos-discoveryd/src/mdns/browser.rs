use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::protocol::TXT_PRIORITY;
use crate::error::DiscoveryError;
use crate::service::{Metadata, ServiceRecord};

/// mdns-sd doesn't expose record TTLs
const DEFAULT_TTL_SECS: i64 = 4500;

/// Multicast announcements carry no SRV weight; all instances share equally
const MULTICAST_WEIGHT: u32 = 100;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum BrowserEvent {
    Resolved(ServiceRecord),
    Removed(String),
}

/// A continuous stream of announcements for one service type.
///
/// Services already live when the watch was created are replayed first.
pub struct ServiceWatch {
    replay: VecDeque<ServiceRecord>,
    rx: broadcast::Receiver<BrowserEvent>,
}

impl ServiceWatch {
    pub fn new(live: Vec<ServiceRecord>, rx: broadcast::Receiver<BrowserEvent>) -> Self {
        Self {
            replay: live.into(),
            rx,
        }
    }

    /// Next event, or None once the underlying browse has stopped.
    pub async fn next(&mut self) -> Option<BrowserEvent> {
        if let Some(record) = self.replay.pop_front() {
            return Some(BrowserEvent::Resolved(record));
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Service watch lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

type LiveSet = Arc<Mutex<HashMap<String, ServiceRecord>>>;

struct Feed {
    tx: broadcast::Sender<BrowserEvent>,
    live: LiveSet,
    stop: CancellationToken,
}

/// Shares one mDNS browse per service type between any number of watchers
/// and one-shot browses.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    feeds: Mutex<HashMap<String, Feed>>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MdnsBrowser {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self {
            daemon,
            feeds: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to a service type, starting the daemon browse on first use.
    fn subscribe(
        &self,
        service_type: &str,
    ) -> Result<(broadcast::Receiver<BrowserEvent>, Vec<ServiceRecord>), DiscoveryError> {
        let mut feeds = lock(&self.feeds);

        if let Some(feed) = feeds.get(service_type) {
            if !feed.stop.is_cancelled() {
                let rx = feed.tx.subscribe();
                let live = lock(&feed.live).values().cloned().collect();
                return Ok((rx, live));
            }
        }

        tracing::info!("Starting mDNS browse for {}", service_type);
        let receiver = self.daemon.browse(service_type)?;

        let (tx, rx) = broadcast::channel(EVENT_BUFFER);
        let live: LiveSet = Arc::default();
        let stop = self.cancel.child_token();

        tokio::spawn(pump(
            service_type.to_string(),
            receiver,
            tx.clone(),
            Arc::clone(&live),
            stop.clone(),
        ));

        feeds.insert(service_type.to_string(), Feed { tx, live, stop });
        Ok((rx, Vec::new()))
    }

    pub fn watch(&self, service_type: &str) -> Result<ServiceWatch, DiscoveryError> {
        let (rx, live) = self.subscribe(service_type)?;
        Ok(ServiceWatch::new(live, rx))
    }

    /// Collect announcements until none has arrived for `quiet_window`.
    pub async fn browse(
        &self,
        service_type: &str,
        quiet_window: Duration,
        known: &[ServiceRecord],
    ) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let (mut rx, live) = self.subscribe(service_type)?;
        let seed = known.iter().cloned().chain(live);
        Ok(collect_until_quiet(&mut rx, seed, quiet_window).await)
    }

    pub fn stop(&self, service_type: &str) {
        let Some(feed) = lock(&self.feeds).remove(service_type) else {
            return;
        };
        feed.stop.cancel();
        if let Err(e) = self.daemon.stop_browse(service_type) {
            tracing::warn!("Failed to stop browsing {}: {}", service_type, e);
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        let types: Vec<String> = lock(&self.feeds).drain().map(|(ty, _)| ty).collect();
        for service_type in types {
            if let Err(e) = self.daemon.stop_browse(&service_type) {
                tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
            }
        }
    }
}

/// Forward daemon events for one service type to subscribers, keeping the
/// live set current.
async fn pump(
    service_type: String,
    receiver: flume::Receiver<ServiceEvent>,
    tx: broadcast::Sender<BrowserEvent>,
    live: LiveSet,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(record) = convert_service_info(&info) {
                            tracing::debug!("Resolved service: {}", record);
                            lock(&live).insert(record.name.clone(), record.clone());
                            // No subscribers is fine; the live set still tracks it
                            let _ = tx.send(BrowserEvent::Resolved(record));
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        tracing::debug!("Service removed: {}", fullname);
                        lock(&live).remove(&fullname);
                        let _ = tx.send(BrowserEvent::Removed(fullname));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Browser for {} disconnected: {}", service_type, e);
                        break;
                    }
                }
            }

            _ = stop.cancelled() => {
                tracing::info!("mDNS browse for {} stopped", service_type);
                break;
            }
        }
    }
}

/// Trailing-debounce collection: each previously unseen instance restarts
/// the quiet window.
pub(crate) async fn collect_until_quiet(
    rx: &mut broadcast::Receiver<BrowserEvent>,
    seed: impl IntoIterator<Item = ServiceRecord>,
    quiet_window: Duration,
) -> Vec<ServiceRecord> {
    let mut found: Vec<ServiceRecord> = Vec::new();
    for record in seed {
        if !found.iter().any(|r| r.name == record.name) {
            found.push(record);
        }
    }

    let quiet = tokio::time::sleep(quiet_window);
    tokio::pin!(quiet);

    loop {
        tokio::select! {
            _ = &mut quiet => break,
            event = rx.recv() => {
                match event {
                    Ok(BrowserEvent::Resolved(record)) => {
                        if !found.iter().any(|r| r.name == record.name) {
                            found.push(record);
                            quiet.as_mut().reset(Instant::now() + quiet_window);
                        }
                    }
                    Ok(BrowserEvent::Removed(name)) => {
                        found.retain(|r| r.name != name);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Browse lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    found
}

/// Convert an mdns-sd ServiceInfo to a ServiceRecord
fn convert_service_info(info: &ServiceInfo) -> Option<ServiceRecord> {
    // Prefer IPv4 so URLs stay readable; fall back to any IPv6 address
    let addresses = info.get_addresses();
    let host = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
        .map(IpAddr::to_string);

    let Some(host) = host else {
        tracing::debug!("Skipping service {} - no addresses", info.get_fullname());
        return None;
    };

    let metadata: Metadata = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    let priority = metadata
        .get(TXT_PRIORITY)
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);

    Some(
        ServiceRecord::new(info.get_fullname(), host, info.get_port())
            .with_priority(priority)
            .with_weight(MULTICAST_WEIGHT)
            .with_metadata(metadata)
            .with_expiry(Utc::now() + chrono::Duration::seconds(DEFAULT_TTL_SECS)),
    )
}
