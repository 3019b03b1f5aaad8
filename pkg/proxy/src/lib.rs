//! Pingora listeners: the TLS-terminating HTTPS proxy and the port-80
//! redirector / ACME responder.

pub mod error;
pub mod handler;
pub mod headers;
pub mod tls;

use pingora::listeners::tls::TlsSettings;
use pingora::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use pkg_constants::idle::DEFAULT_UNIDLE_TIMEOUT_SECS;
use pkg_constants::network::{DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT};
use pkg_router::Router;

pub use handler::{Listener, RouterProxy};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub https_port: u16,
    pub http_port: u16,
    /// Deadline for waking an idle host before answering 502.
    pub unidle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            https_port: DEFAULT_HTTPS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            unidle_timeout: Duration::from_secs(DEFAULT_UNIDLE_TIMEOUT_SECS),
        }
    }
}

/// Start both listeners on a background Pingora server.
pub fn start(router: Arc<Router>, config: ProxyConfig) -> anyhow::Result<()> {
    info!(
        https_port = config.https_port,
        http_port = config.http_port,
        "Starting Pingora listeners"
    );

    let mut server = Server::new(None)?;
    server.bootstrap();

    let https = RouterProxy::new(
        router.clone(),
        Listener::Https,
        config.https_port,
        config.unidle_timeout,
    );
    let mut https_service = http_proxy_service(&server.configuration, https);
    let mut settings = TlsSettings::with_callbacks(Box::new(tls::SniCertificates::new(
        router.clone(),
    )))?;
    settings.enable_h2();
    https_service.add_tls_with_settings(
        &format!("0.0.0.0:{}", config.https_port),
        None,
        settings,
    );

    let http = RouterProxy::new(
        router,
        Listener::Http,
        config.http_port,
        config.unidle_timeout,
    );
    let mut http_service = http_proxy_service(&server.configuration, http);
    http_service.add_tcp(&format!("0.0.0.0:{}", config.http_port));

    server.add_service(https_service);
    server.add_service(http_service);

    tokio::task::spawn_blocking(move || {
        server.run_forever();
    });

    info!(
        https_port = config.https_port,
        http_port = config.http_port,
        "Listeners are running"
    );
    Ok(())
}
