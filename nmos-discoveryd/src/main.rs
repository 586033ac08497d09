use std::sync::Arc;
use std::time::Duration;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use shared::protocol::{ApiVersion, MAX_API_VERSION};
use shared::types::{Endpoint, Node, NodeApiInfo, ResourceCore};
use nmos_discoveryd::api::{self, AppState};
use nmos_discoveryd::config::Config;
use nmos_discoveryd::discovery::{Discovery, DnsResolver, DnsSdDiscovery, NodeAdvertisement, SystemResolver};
use nmos_discoveryd::mdns::{MdnsAdvertiser, MdnsBrowser};
use nmos_discoveryd::query::QueryAggregator;
use nmos_discoveryd::registry::RegistrationController;
use nmos_discoveryd::resources::SharedResources;
use tokio_util::sync::CancellationToken;

const API_VERSIONS: [ApiVersion; 2] = [ApiVersion::new(1, 2), MAX_API_VERSION];

fn local_node(config: &Config, hostname: &str, port: u16) -> Node {
    let mut core = ResourceCore::new(uuid::Uuid::new_v4().to_string(), config.node.label.clone());
    core.description = config.node.description.clone();

    Node {
        core,
        href: format!("http://{}:{}/", hostname, port),
        hostname: Some(hostname.to_string()),
        api: NodeApiInfo {
            versions: API_VERSIONS.iter().map(ApiVersion::to_string).collect(),
            endpoints: vec![Endpoint {
                host: hostname.to_string(),
                port,
                protocol: "http".to_string(),
                authorization: None,
            }],
        },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nmos_discoveryd=info"))
        )
        .init();

    tracing::info!("Starting nmos-discoveryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/nmos/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let hostname = match &config.node.hostname {
        Some(hostname) => hostname.clone(),
        None => hostname::get()
            .context("Failed to read system hostname")?
            .to_string_lossy()
            .into_owned(),
    };
    let api_port = config.api.port();

    // Create mDNS daemon, optionally bound to one interface
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.mdns.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    // Unicast DNS-SD only when a search domain is configured
    let wants_unicast = config.registration.search_domain.is_some() || config.query.search_domain.is_some();
    let resolver: Option<Arc<dyn DnsResolver>> = if wants_unicast {
        match SystemResolver::from_system_conf() {
            Ok(resolver) => Some(Arc::new(resolver)),
            Err(e) => {
                tracing::warn!("Unicast discovery disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let browser = Arc::new(MdnsBrowser::new(mdns_daemon.clone()));
    let discovery: Arc<dyn Discovery> = Arc::new(DnsSdDiscovery::new(Some(Arc::clone(&browser)), resolver));
    let advertiser = Arc::new(MdnsAdvertiser::new(mdns_daemon.clone(), hostname.clone()));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.query.request_timeout_ms))
        .build()
        .context("Failed to build HTTP client")?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    let resources = SharedResources::new();

    // Spawn registration controller
    let mut settings = config.registration.controller_settings();
    settings.advertisement = NodeAdvertisement {
        instance: config.node.label.clone(),
        port: api_port,
        api_proto: "http".to_string(),
        api_versions: API_VERSIONS.to_vec(),
        api_auth: false,
        versions: [0; 6],
    };
    let (registration, controller_handle) =
        RegistrationController::new(settings, Arc::clone(&discovery), advertiser, http.clone(), resources.clone())
            .spawn(cancel.clone());

    let node = local_node(&config, &hostname, api_port);
    tracing::info!("Local node {} ({})", node.core.id, hostname);
    registration.set_node(node).await?;

    // Spawn query aggregator
    let mut app_state = AppState::new(resources.clone());
    let aggregator_handle = if config.query.enabled {
        let (query, task) = QueryAggregator::new(config.query.query_settings(), Arc::clone(&discovery), http.clone())
            .spawn(cancel.clone());
        app_state = app_state.with_query(query);
        Some(task)
    } else {
        None
    };

    let app = api::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    if config.registration.enabled {
        let registration = registration.clone();
        tokio::spawn(async move {
            if let Err(e) = registration.register().await {
                tracing::error!("Registration failed: {}", e);
            }
        });
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    if let Err(e) = registration.unregister().await {
        tracing::error!("Failed to unregister: {}", e);
    }

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(controller_handle, server_handle);
    if let Some(task) = aggregator_handle {
        let _ = task.await;
    }

    browser.shutdown();

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
