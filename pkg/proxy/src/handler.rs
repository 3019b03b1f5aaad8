use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::*;
use pingora::proxy::FailToProxy;
use pingora::{ErrorSource, ErrorType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pkg_pki::challenge::ChallengeManager;
use pkg_router::Router;
use pkg_types::target::Target;

use crate::error::RouteError;
use crate::headers::{
    X_FORWARDED_PROTO, apply_forwarded_headers, header_str, redirect_location, request_host,
};

/// Which listener a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// TLS-terminating listener.
    Https,
    /// Plain listener: ACME challenges, then redirect to HTTPS unless a
    /// terminator in front already set `X-Forwarded-Proto: https`.
    Http,
}

impl Listener {
    fn proto(self) -> &'static str {
        match self {
            Listener::Https => "https",
            Listener::Http => "http",
        }
    }
}

/// Outcome of the port-80 checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlainHttp {
    /// Answer an HTTP-01 challenge with this key authorization.
    Challenge(String),
    /// TLS was terminated in front of us; route normally.
    PassThrough,
    /// 301 to this `https://` location.
    Redirect(String),
}

#[derive(Debug, Default)]
pub struct RequestCtx {
    pub host: String,
    /// `request_begin` ran; `request_end` is owed.
    pub began: bool,
    pub target: Option<Target>,
}

/// Pingora `ProxyHttp` handler for routed hosts.
pub struct RouterProxy {
    router: Arc<Router>,
    listener: Listener,
    port: u16,
    unidle_timeout: Duration,
}

impl RouterProxy {
    pub fn new(router: Arc<Router>, listener: Listener, port: u16, unidle_timeout: Duration) -> Self {
        Self {
            router,
            listener,
            port,
            unidle_timeout,
        }
    }

    /// Wake the host if idle, count the request and pick a target.
    pub async fn prepare(&self, host: &str, ctx: &mut RequestCtx) -> Result<Target, RouteError> {
        if self.router.idle_get(host).await.map_err(RouteError::Storage)? {
            match tokio::time::timeout(self.unidle_timeout, self.router.unidle(host)).await {
                Err(_) => return Err(RouteError::UnidleTimeout),
                Ok(Err(e)) => return Err(RouteError::Unidle(e)),
                Ok(Ok(())) => {}
            }
        }

        self.router
            .request_begin(host)
            .await
            .map_err(RouteError::Storage)?;
        ctx.began = true;

        let raw = self
            .router
            .route(host)
            .await
            .map_err(RouteError::Storage)?
            .ok_or(RouteError::NoRoute)?;
        Target::parse(&raw).map_err(|error| RouteError::InvalidTarget { target: raw, error })
    }

    /// What the plain listener does with `req` before routing.
    pub fn plain_http_action(&self, host: &str, req: &RequestHeader) -> PlainHttp {
        // Unknown tokens fall through to the redirect.
        if let Some(key_auth) = ChallengeManager::extract_token(req.uri.path())
            .and_then(|t| self.router.challenge_response(t))
        {
            return PlainHttp::Challenge(key_auth);
        }
        if header_str(req, X_FORWARDED_PROTO) == Some("https") {
            return PlainHttp::PassThrough;
        }
        PlainHttp::Redirect(redirect_location(host, req))
    }

    /// Port-80 behaviour. `Ok(true)` means a response was written.
    async fn http_filter(&self, session: &mut Session, host: &str) -> Result<bool> {
        match self.plain_http_action(host, session.req_header()) {
            PlainHttp::Challenge(key_auth) => {
                info!(host = %host, "Answering ACME challenge");
                respond(session, 200, &[], Bytes::from(key_auth)).await?;
                Ok(true)
            }
            PlainHttp::PassThrough => Ok(false),
            PlainHttp::Redirect(location) => {
                respond(session, 301, &[("Location", location)], Bytes::new()).await?;
                Ok(true)
            }
        }
    }
}

/// Write a complete plain-text response.
async fn respond(
    session: &mut Session,
    status: u16,
    headers: &[(&str, String)],
    body: Bytes,
) -> Result<()> {
    let mut resp = ResponseHeader::build(status, Some(headers.len() + 2))?;
    resp.insert_header("Content-Type", "text/plain; charset=utf-8")?;
    resp.insert_header("Content-Length", body.len().to_string())?;
    for (name, value) in headers {
        resp.insert_header(name.to_string(), value.as_str())?;
    }
    session.write_response_header(Box::new(resp), false).await?;
    session.write_response_body(Some(body), true).await?;
    Ok(())
}

/// Resolve a target and build its upstream peer. Upstream certificates are
/// not verified.
pub async fn peer_for(target: &Target) -> Result<HttpPeer> {
    let addr = tokio::net::lookup_host(target.authority())
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            pingora::Error::explain(
                ErrorType::ConnectNoRoute,
                format!("cannot resolve {}", target.authority()),
            )
        })?;

    let mut peer = HttpPeer::new(addr, target.is_tls(), target.host.clone());
    if target.is_tls() {
        peer.options.verify_cert = false;
        peer.options.verify_hostname = false;
    }
    Ok(peer)
}

#[async_trait]
impl ProxyHttp for RouterProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let host = request_host(session.req_header());
        ctx.host = host.clone();

        if self.listener == Listener::Http && self.http_filter(session, &host).await? {
            return Ok(true);
        }

        match self.prepare(&host, ctx).await {
            Ok(target) => {
                ctx.target = Some(target);
                Ok(false)
            }
            Err(err) => {
                warn!(host = %host, stage = "route", error = %err, "Request not routed");
                respond(session, err.status(), &[], Bytes::from(err.body())).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let target = ctx
            .target
            .as_ref()
            .ok_or_else(|| pingora::Error::new(ErrorType::ConnectNoRoute))?;
        Ok(Box::new(peer_for(target).await?))
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        let client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip().to_string());
        apply_forwarded_headers(
            upstream_request,
            client_ip.as_deref(),
            self.port,
            self.listener.proto(),
        )
    }

    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &pingora::Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy {
        // The client went away: nothing to answer.
        let code = match e.esource() {
            ErrorSource::Downstream => 0,
            _ => 502,
        };

        if code > 0 {
            warn!(
                host = %ctx.host,
                target = ?ctx.target.as_ref().map(Target::to_string),
                stage = "upstream",
                error = %e,
                "Upstream request failed"
            );
            let body = Bytes::from(format!("{}\n", e));
            let _ = respond(session, code, &[], body).await;
        }

        FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    async fn logging(&self, session: &mut Session, _e: Option<&pingora::Error>, ctx: &mut Self::CTX) {
        if ctx.began {
            if let Err(e) = self.router.request_end(&ctx.host).await {
                warn!(host = %ctx.host, stage = "request-end", error = %e, "Failed to record request end");
            }
        }

        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let req = session.req_header();
        info!(
            method = %req.method,
            host = %ctx.host,
            path = %req.uri.path(),
            status,
            target = ?ctx.target.as_ref().map(Target::to_string),
            "request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cluster::memory::MemoryCluster;
    use pkg_controllers::idle::IdleController;
    use pkg_controllers::ingress::RouteTable;
    use pkg_pki::Certificates;
    use pkg_pki::acme::AcmeCertificates;
    use pkg_pki::ca::{CaCertificates, ClusterCA};
    use pkg_pki::cache::MemoryCertCache;
    use pkg_router::RouterIps;
    use pkg_storage::Storage;
    use pkg_storage::memory::MemoryStorage;
    use pkg_types::deployment::DeploymentSummary;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        cluster: Arc<MemoryCluster>,
        router: Arc<Router>,
    }

    fn fixture() -> Fixture {
        fixture_with_certs(Arc::new(CaCertificates::new(ClusterCA::new().unwrap())))
    }

    fn fixture_with_certs(certs: Arc<dyn Certificates>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let cluster = Arc::new(MemoryCluster::new());
        let idle = Arc::new(IdleController::new(storage.clone(), cluster.clone()));
        let router = Arc::new(Router::new(
            storage.clone(),
            certs,
            idle,
            RouterIps::default(),
        ));
        Fixture {
            storage,
            cluster,
            router,
        }
    }

    fn proxy(router: &Arc<Router>, timeout: Duration) -> RouterProxy {
        RouterProxy::new(router.clone(), Listener::Https, 443, timeout)
    }

    #[tokio::test]
    async fn test_prepare_routes_known_host() {
        let f = fixture();
        f.router
            .target_add("svc.example.com", "http://api.default.svc.cluster.local:80")
            .await
            .unwrap();

        let mut ctx = RequestCtx::default();
        let target = proxy(&f.router, Duration::from_secs(1))
            .prepare("svc.example.com", &mut ctx)
            .await
            .unwrap();

        assert_eq!(target.authority(), "api.default.svc.cluster.local:80");
        assert!(ctx.began);
        let activity = f.storage.activity_get("svc.example.com").await.unwrap().unwrap();
        assert_eq!(activity.active, 1);
    }

    #[tokio::test]
    async fn test_prepare_unknown_host_is_no_route() {
        let f = fixture();
        let mut ctx = RequestCtx::default();
        let err = proxy(&f.router, Duration::from_secs(1))
            .prepare("unknown.example.com", &mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, RouteError::NoRoute));
        assert_eq!(err.body(), "no route\n");
        // The request was counted, so logging owes a request_end.
        assert!(ctx.began);
    }

    #[tokio::test]
    async fn test_prepare_wakes_idle_host() {
        let f = fixture();
        f.cluster
            .add_deployment(DeploymentSummary {
                namespace: "app".to_string(),
                name: "web".to_string(),
                labels: BTreeMap::from([("system".to_string(), "convox".to_string())]),
                replicas: 0,
                ready_replicas: 0,
            })
            .await;
        f.router
            .target_add("web.example.com", "http://web.app.svc.cluster.local:3000")
            .await
            .unwrap();
        f.storage.idle_set("web.example.com", true).await.unwrap();

        let mut ctx = RequestCtx::default();
        proxy(&f.router, Duration::from_secs(5))
            .prepare("web.example.com", &mut ctx)
            .await
            .unwrap();

        assert!(!f.storage.idle_get("web.example.com").await.unwrap());
        assert_eq!(f.cluster.deployment("app", "web").await.unwrap().replicas, 1);
    }

    #[tokio::test]
    async fn test_prepare_unidle_deadline() {
        let f = fixture();
        f.cluster
            .add_deployment(DeploymentSummary {
                namespace: "app".to_string(),
                name: "web".to_string(),
                labels: BTreeMap::from([("system".to_string(), "convox".to_string())]),
                replicas: 0,
                ready_replicas: 0,
            })
            .await;
        f.cluster.set_ready_on_scale(false).await;
        f.router
            .target_add("web.example.com", "http://web.app.svc.cluster.local:3000")
            .await
            .unwrap();
        f.storage.idle_set("web.example.com", true).await.unwrap();

        let mut ctx = RequestCtx::default();
        let err = proxy(&f.router, Duration::from_millis(300))
            .prepare("web.example.com", &mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, RouteError::UnidleTimeout));
        assert!(!ctx.began);
        assert!(f.storage.idle_get("web.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_for_tls_target_skips_verification() {
        let target = Target::parse("https://127.0.0.1:8443").unwrap();
        let peer = peer_for(&target).await.unwrap();
        assert!(!peer.options.verify_cert);
        assert!(!peer.options.verify_hostname);
        assert_eq!(peer.sni, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_peer_for_unresolvable_target() {
        let target = Target::parse("http://does-not-exist.invalid:80").unwrap();
        assert!(peer_for(&target).await.is_err());
    }

    fn plain(router: &Arc<Router>) -> RouterProxy {
        RouterProxy::new(router.clone(), Listener::Http, 80, Duration::from_secs(1))
    }

    fn get(path: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        for (k, v) in headers {
            req.insert_header(k.to_string(), *v).unwrap();
        }
        req
    }

    #[test]
    fn test_plain_http_redirect_keeps_host_path_and_query() {
        let f = fixture();
        let req = get("/a/b?x=1&y=2", &[("Host", "svc.example.com")]);
        assert_eq!(
            plain(&f.router).plain_http_action("svc.example.com", &req),
            PlainHttp::Redirect("https://svc.example.com/a/b?x=1&y=2".to_string())
        );
    }

    #[test]
    fn test_plain_http_passes_through_terminated_tls() {
        let f = fixture();
        let req = get("/", &[("Host", "svc.example.com"), ("X-Forwarded-Proto", "https")]);
        assert_eq!(
            plain(&f.router).plain_http_action("svc.example.com", &req),
            PlainHttp::PassThrough
        );

        let req = get("/", &[("Host", "svc.example.com"), ("X-Forwarded-Proto", "http")]);
        assert!(matches!(
            plain(&f.router).plain_http_action("svc.example.com", &req),
            PlainHttp::Redirect(_)
        ));
    }

    #[test]
    fn test_plain_http_answers_pending_challenge() {
        let acme = Arc::new(AcmeCertificates::new(
            Arc::new(MemoryCertCache::new()),
            "http://127.0.0.1:1/directory",
            None,
        ));
        acme.challenges().add_challenge("tok", "tok.thumb");
        let f = fixture_with_certs(acme);
        let handler = plain(&f.router);

        // Takes precedence over the terminated-TLS pass-through.
        let req = get(
            "/.well-known/acme-challenge/tok",
            &[("Host", "svc.example.com"), ("X-Forwarded-Proto", "https")],
        );
        assert_eq!(
            handler.plain_http_action("svc.example.com", &req),
            PlainHttp::Challenge("tok.thumb".to_string())
        );

        let req = get("/.well-known/acme-challenge/other", &[("Host", "svc.example.com")]);
        assert_eq!(
            handler.plain_http_action("svc.example.com", &req),
            PlainHttp::Redirect("https://svc.example.com/.well-known/acme-challenge/other".to_string())
        );
    }

    /// Run `handler` on a plain TCP Pingora listener and return its port.
    async fn serve(handler: RouterProxy) -> u16 {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let mut server = Server::new(None).unwrap();
        server.bootstrap();
        let mut service = http_proxy_service(&server.configuration, handler);
        service.add_tcp(&format!("127.0.0.1:{}", port));
        server.add_service(service);
        std::thread::spawn(move || {
            server.run_forever();
        });

        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return port;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("listener on {} never came up", port);
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
        head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    fn status(head: &str) -> u16 {
        head.split_whitespace().nth(1).unwrap().parse().unwrap()
    }

    /// One-connection upstream that answers 200 "valid" and hands back the
    /// request head it saw.
    async fn upstream() -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nvalid")
                .await
                .unwrap();
            let _ = tx.send(head);
        });
        (port, rx)
    }

    async fn send(port: u16, request: &str) -> (String, String) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut stream).await;
        let len: usize = header(&head, "content-length")
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (head, String::from_utf8(body).unwrap())
    }

    async fn wait_requests_finished(storage: &MemoryStorage, host: &str) {
        for _ in 0..100 {
            let active = storage.activity_get(host).await.unwrap().map(|a| a.active);
            if active == Some(0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("request_end never ran for {}", host);
    }

    #[tokio::test]
    async fn test_proxied_request_carries_forwarded_headers() {
        let f = fixture();
        let (up, seen) = upstream().await;
        f.router
            .target_add("svc.example.com", &format!("http://127.0.0.1:{}", up))
            .await
            .unwrap();
        let port = serve(proxy(&f.router, Duration::from_secs(5))).await;

        let (head, body) = send(
            port,
            "GET /hello HTTP/1.1\r\nHost: svc.example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status(&head), 200);
        assert_eq!(body, "valid");

        let upstream_head = seen.await.unwrap();
        assert!(upstream_head.starts_with("GET /hello "));
        assert_eq!(header(&upstream_head, "x-forwarded-for"), Some("127.0.0.1"));
        assert_eq!(header(&upstream_head, "x-forwarded-port"), Some("443"));
        assert_eq!(header(&upstream_head, "x-forwarded-proto"), Some("https"));

        wait_requests_finished(&f.storage, "svc.example.com").await;
    }

    #[tokio::test]
    async fn test_client_forwarded_headers_reach_upstream_unchanged() {
        let f = fixture();
        let (up, seen) = upstream().await;
        f.router
            .target_add("svc.example.com", &format!("http://127.0.0.1:{}", up))
            .await
            .unwrap();
        let port = serve(proxy(&f.router, Duration::from_secs(5))).await;

        let (head, _) = send(
            port,
            "GET / HTTP/1.1\r\nHost: svc.example.com\r\nX-Forwarded-Port: 5000\r\n\
             X-Forwarded-Proto: foo\r\nX-Forwarded-For: 192.0.2.7\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status(&head), 200);

        let upstream_head = seen.await.unwrap();
        assert_eq!(header(&upstream_head, "x-forwarded-port"), Some("5000"));
        assert_eq!(header(&upstream_head, "x-forwarded-proto"), Some("foo"));
        assert_eq!(
            header(&upstream_head, "x-forwarded-for"),
            Some("192.0.2.7, 127.0.0.1")
        );
    }

    #[tokio::test]
    async fn test_unknown_host_gets_502_on_the_wire() {
        let f = fixture();
        let port = serve(proxy(&f.router, Duration::from_secs(5))).await;

        let (head, body) = send(
            port,
            "GET / HTTP/1.1\r\nHost: unknown.example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status(&head), 502);
        assert_eq!(body, "no route\n");
        wait_requests_finished(&f.storage, "unknown.example.com").await;
    }

    #[tokio::test]
    async fn test_websocket_upgrade_is_tunnelled() {
        const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

        let f = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = listener.local_addr().unwrap().port();
        let (tx, seen) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            let _ = tx.send(head);
            stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                      Connection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
                )
                .await
                .unwrap();
            let mut input = [0u8; 5];
            stream.read_exact(&mut input).await.unwrap();
            assert_eq!(&input, b"input");
            stream.write_all(b"output").await.unwrap();
        });
        f.router
            .target_add("svc.example.com", &format!("http://127.0.0.1:{}", up))
            .await
            .unwrap();
        let port = serve(proxy(&f.router, Duration::from_secs(5))).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!(
                    "GET /ws HTTP/1.1\r\nHost: svc.example.com\r\nUpgrade: websocket\r\n\
                     Connection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
                    KEY
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let head = read_head(&mut client).await;
        assert_eq!(status(&head), 101);
        assert_eq!(header(&seen.await.unwrap(), "sec-websocket-key"), Some(KEY));

        client.write_all(b"input").await.unwrap();
        let mut output = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut output))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&output, b"output");
    }

    #[tokio::test]
    async fn test_plain_listener_redirects_on_the_wire() {
        let f = fixture();
        let port = serve(plain(&f.router)).await;

        let (head, body) = send(
            port,
            "GET /a/b?x=1 HTTP/1.1\r\nHost: svc.example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status(&head), 301);
        assert_eq!(header(&head, "location"), Some("https://svc.example.com/a/b?x=1"));
        assert!(body.is_empty());
        // Redirects are not counted as routed requests.
        assert!(f.storage.activity_get("svc.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plain_listener_proxies_terminated_tls() {
        let f = fixture();
        let (up, seen) = upstream().await;
        f.router
            .target_add("svc.example.com", &format!("http://127.0.0.1:{}", up))
            .await
            .unwrap();
        let port = serve(plain(&f.router)).await;

        let (head, body) = send(
            port,
            "GET / HTTP/1.1\r\nHost: svc.example.com\r\nX-Forwarded-Proto: https\r\n\
             Connection: close\r\n\r\n",
        )
        .await;
        assert_eq!(status(&head), 200);
        assert_eq!(body, "valid");

        let upstream_head = seen.await.unwrap();
        assert_eq!(header(&upstream_head, "x-forwarded-proto"), Some("https"));
        assert_eq!(header(&upstream_head, "x-forwarded-port"), Some("80"));
    }
}
