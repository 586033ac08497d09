use std::collections::HashMap;
use std::sync::Mutex;
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use shared::protocol::{Protocol, ServiceType};
use crate::discovery::{Advertiser, NodeAdvertisement};
use crate::error::DiscoveryError;

/// Advertises the local node as `_nmos-node._tcp` for peer-to-peer discovery.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    hostname: String,
    current: Mutex<Option<String>>,
}

impl MdnsAdvertiser {
    pub fn new(daemon: ServiceDaemon, hostname: impl Into<String>) -> Self {
        Self {
            daemon,
            hostname: hostname.into(),
            current: Mutex::new(None),
        }
    }

    fn take_current(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn unregister(&self, fullname: &str) -> Result<(), DiscoveryError> {
        self.daemon.unregister(fullname)?;
        Ok(())
    }
}

#[async_trait]
impl Advertiser for MdnsAdvertiser {
    async fn advertise(&self, advert: &NodeAdvertisement) -> Result<(), DiscoveryError> {
        // mDNS records are immutable once announced; replace the whole service
        if let Some(fullname) = self.take_current() {
            tracing::info!("P2P: Updating node advertisement...");
            self.unregister(&fullname)?;
        } else {
            tracing::info!("P2P: Advertising node...");
        }

        let host = format!("{}.local.", self.hostname.trim_end_matches(".local."));
        let txt_records: HashMap<String, String> = advert.txt_records().into_iter().collect();

        let service_info = ServiceInfo::new(
            &ServiceType::Node.mdns_type(Protocol::Tcp),
            &advert.instance,
            &host,
            "",
            advert.port,
            txt_records,
        )?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info)?;

        tracing::info!(
            "Registered {} as {} on port {}",
            ServiceType::Node.mdns_type(Protocol::Tcp),
            advert.instance,
            advert.port
        );

        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(fullname);
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.take_current() {
            tracing::info!("P2P: Stopping node advertisement {}", fullname);
            self.unregister(&fullname)?;
        }
        Ok(())
    }
}
