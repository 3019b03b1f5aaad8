mod config;

use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Backend, Cli, Settings};
use pkg_cluster::kubernetes::KubeCluster;
use pkg_cluster::leader::{ConfigMapLock, LeaderElection, new_identity};
use pkg_constants::state::LEADER_LOCK_NAME;
use pkg_controllers::idle::IdleController;
use pkg_controllers::ingress::IngressController;
use pkg_network::dns::DnsServer;
use pkg_pki::Certificates;
use pkg_pki::acme::AcmeCertificates;
use pkg_pki::ca::{CaCertificates, ClusterCA};
use pkg_pki::cache::KvCertCache;
use pkg_proxy::ProxyConfig;
use pkg_router::{Router, RouterIps};
use pkg_storage::Storage;
use pkg_storage::kv::KvStore;
use pkg_storage::memory::MemoryStorage;
use pkg_storage::slate::SlateStorage;
use pkg_types::config::{RouterConfigFile, load_config_file};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn certificates(
    settings: &Settings,
    cluster: &KubeCluster,
    stores: &mut Vec<KvStore>,
) -> anyhow::Result<Arc<dyn Certificates>> {
    if settings.autocert {
        let kv = KvStore::open(&settings.router_cache).await?;
        stores.push(kv.clone());
        info!(directory = %settings.acme_directory, "Using ACME certificates");
        return Ok(Arc::new(AcmeCertificates::new(
            Arc::new(KvCertCache::new(kv)),
            &settings.acme_directory,
            settings.acme_email.as_deref(),
        )));
    }

    let ca = match cluster.load_ca_secret(&settings.ca_secret).await {
        Ok((crt, key)) => ClusterCA::from_pem(&crt, &key)?,
        Err(e) => {
            warn!(secret = %settings.ca_secret, error = %e, "CA secret unavailable, generating a root CA");
            ClusterCA::new()?
        }
    };
    info!("Using cluster CA certificates");
    Ok(Arc::new(CaCertificates::new(ca)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: RouterConfigFile = load_config_file(&cli.config)?;
    let config_path = cli.config.clone();
    let settings = Settings::resolve(cli, file_cfg)?;

    init_tracing(settings.json_logs);
    info!(config = %config_path, "Starting router");
    info!("  Backend:   {:?}", settings.backend);
    info!("  Autocert:  {}", settings.autocert);
    info!("  Namespace: {}", settings.namespace);
    info!("  HTTPS:     {}", settings.https_port);
    info!("  HTTP:      {}", settings.http_port);
    info!("  DNS:       {}", settings.dns_addr);

    let mut stores: Vec<KvStore> = Vec::new();

    // 1. Route table
    let storage: Arc<dyn Storage> = match settings.backend {
        Backend::External => {
            let kv = KvStore::open(&settings.router_routes).await?;
            stores.push(kv.clone());
            Arc::new(SlateStorage::new(kv))
        }
        Backend::Memory => Arc::new(MemoryStorage::new()),
    };

    // 2. Cluster access and certificates
    let cluster = KubeCluster::try_default(&settings.namespace, &settings.service_name).await?;
    let certs = certificates(&settings, &cluster, &mut stores).await?;

    // 3. Idle controller and router facade
    let idle = Arc::new(IdleController::new(
        storage.clone(),
        Arc::new(cluster.clone()),
    ));
    let idle_handle = idle.clone().start();

    let ips = RouterIps::resolve(
        &cluster,
        settings.service_host.as_deref(),
        settings.pod_ip.as_deref(),
    )
    .await;
    let router = Arc::new(Router::new(storage, certs, idle, ips));

    // 4. Listeners
    let dns = DnsServer::new(router.clone(), settings.dns_addr, settings.dns_upstream);
    let (dns_addr, dns_handle) = dns.start().await?;
    info!(addr = %dns_addr, "DNS server listening");

    pkg_proxy::start(
        router.clone(),
        ProxyConfig {
            https_port: settings.https_port,
            http_port: settings.http_port,
            unidle_timeout: settings.unidle_timeout,
        },
    )?;

    // 5. Leader election and ingress reconciliation
    let lock = ConfigMapLock::new(cluster.client(), &settings.namespace, LEADER_LOCK_NAME);
    let election = LeaderElection::new(Box::new(lock), new_identity());
    let (leader_handle, leader_rx) = election.start();

    let (tx, rx) = mpsc::channel(64);
    let watch_cluster = cluster.clone();
    let watch_handle = tokio::spawn(async move {
        if let Err(e) = watch_cluster.watch_ingresses(tx).await {
            error!(stage = "ingress-watch", error = %e, "Ingress watch stopped");
        }
    });

    let controller = Arc::new(IngressController::new(router.clone(), Arc::new(cluster)));
    let controller_handle = tokio::spawn(controller.run(rx, leader_rx));

    info!("Router is running");
    shutdown_signal().await;
    info!("Shutting down");

    watch_handle.abort();
    controller_handle.abort();
    leader_handle.abort();
    idle_handle.abort();
    dns_handle.abort();

    for kv in stores {
        if let Err(e) = kv.close().await {
            warn!(error = %e, "Failed to close store");
        }
    }

    Ok(())
}
