//! Pingora-based gateway service.
//!
//! Forwards every inbound request to the configured origin. On the way in,
//! the forwarded-for, real-ip, and forwarded-proto headers are rewritten; on
//! the way out, headers that leak origin implementation details are stripped
//! and the cache-invalidation signal header is handed to the dispatcher
//! without delaying the response. All proxying failures funnel through
//! `fail_to_proxy`, which invalidates the resolver entry for the origin and
//! answers with the static maintenance page when nothing has been sent yet.

use crate::config::{AppConfig, OriginTarget};
use crate::invalidation::InvalidationDispatcher;
use crate::pages::MAINTENANCE_PAGE;
use crate::resolver::{AddressFamily, ResolvingCache};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use http::{header, Method, Uri};
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Response header the origin uses to announce changed URL patterns.
const INVALIDATION_HEADER: &str = "x-cache-invalidate";

/// Request headers consulted, in order, for the effective client IP.
const CLIENT_IP_HEADERS: [&str; 2] = ["x-original-forwarded-for", "x-forwarded-for"];

/// Response headers that would leak origin implementation details.
const STRIPPED_RESPONSE_HEADERS: [&str; 4] = [
    "x-powered-by",
    "server",
    "x-aspnet-version",
    "x-aspnetmvc-version",
];

/// Error marker for failures inside origin name resolution. These keep their
/// short-lived failure marker in the cache instead of invalidating it.
const RESOLUTION_FAILED: &str = "origin resolution failed";

/// Path answered by the gateway itself.
const HEALTH_PATH: &str = "/health";

/// Context maintained across the request lifecycle.
pub struct GatewayContext {
    /// Effective client IP forwarded to the origin.
    pub client_ip: String,

    /// Whether the gateway answered this request without proxying.
    pub served_locally: bool,
}

impl Default for GatewayContext {
    fn default() -> Self {
        Self {
            client_ip: String::new(),
            served_locally: false,
        }
    }
}

/// The gateway proxy service.
pub struct GatewayService {
    config: Arc<AppConfig>,

    /// Connection target derived from the origin URL.
    origin: OriginTarget,

    /// Set when the origin host is an IP literal; skips resolution entirely.
    origin_ip: Option<IpAddr>,

    /// Address cache consulted when building upstream peers.
    resolver: ResolvingCache,

    /// Receives invalidation signals detected on origin responses.
    dispatcher: InvalidationDispatcher,
}

impl GatewayService {
    /// Creates the service from a validated configuration.
    pub fn new(
        config: Arc<AppConfig>,
        resolver: ResolvingCache,
        dispatcher: InvalidationDispatcher,
    ) -> crate::error::Result<Self> {
        let origin = config.origin.target()?;
        let origin_ip = origin.host.parse::<IpAddr>().ok();

        Ok(Self {
            config,
            origin,
            origin_ip,
            resolver,
            dispatcher,
        })
    }

    /// Answers the health probe without touching the origin.
    async fn respond_health(&self, session: &mut Session) -> Result<()> {
        let body = serde_json::json!({
            "status": "ok",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "service": "cms-gateway",
        })
        .to_string();

        let mut resp = ResponseHeader::build(200, Some(2))?;
        resp.insert_header("Content-Type", "application/json")?;
        resp.insert_header("Content-Length", body.len().to_string())?;
        session.write_response_header(Box::new(resp), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(())
    }

    /// Sends the static 503 maintenance page.
    async fn respond_maintenance(&self, session: &mut Session) {
        let mut resp = match ResponseHeader::build(503, Some(2)) {
            Ok(resp) => resp,
            Err(err) => {
                error!(error = %err, "Failed to build maintenance response");
                return;
            }
        };
        resp.insert_header("Content-Type", "text/html; charset=utf-8")
            .ok();
        resp.insert_header("Content-Length", MAINTENANCE_PAGE.len().to_string())
            .ok();

        if let Err(err) = session.write_response_header(Box::new(resp), false).await {
            error!(error = %err, "Failed to write maintenance response header");
            return;
        }
        if let Err(err) = session
            .write_response_body(Some(Bytes::from_static(MAINTENANCE_PAGE.as_bytes())), true)
            .await
        {
            error!(error = %err, "Failed to write maintenance response body");
        }
    }
}

/// Computes the effective client IP: an already-present original-forwarded-for
/// header wins, then forwarded-for, then the socket peer address.
fn effective_client_ip(headers: &http::HeaderMap, peer_addr: Option<String>) -> String {
    for name in CLIENT_IP_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    peer_addr.unwrap_or_default()
}

/// Strips response headers that identify the origin's server stack.
fn filter_response_headers(resp: &mut ResponseHeader) {
    for name in STRIPPED_RESPONSE_HEADERS {
        resp.remove_header(name);
    }
}

/// Collapses runs of slashes in a request path.
fn collapse_duplicate_slashes(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_slash {
                collapsed.push(c);
            }
            last_was_slash = true;
        } else {
            collapsed.push(c);
            last_was_slash = false;
        }
    }
    collapsed
}

#[async_trait]
impl ProxyHttp for GatewayService {
    type CTX = GatewayContext;

    fn new_ctx(&self) -> Self::CTX {
        GatewayContext::default()
    }

    /// Normalizes the request path before any routing decisions.
    async fn early_request_filter(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        let req = session.req_header_mut();
        if req.uri.path().contains("//") {
            let collapsed = collapse_duplicate_slashes(req.uri.path());
            let path_and_query = match req.uri.query() {
                Some(query) => format!("{}?{}", collapsed, query),
                None => collapsed,
            };
            if let Ok(uri) = Uri::builder().path_and_query(path_and_query.as_str()).build() {
                req.set_uri(uri);
            }
        }
        Ok(())
    }

    /// Answers gateway-owned endpoints; everything else is proxied.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let req = session.req_header();
        if req.method == Method::GET && req.uri.path() == HEALTH_PATH {
            ctx.served_locally = true;
            self.respond_health(session).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolves the origin and builds the upstream peer.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let address = match self.origin_ip {
            Some(ip) => ip,
            None => {
                let addresses = self
                    .resolver
                    .lookup(&self.origin.host, AddressFamily::Any)
                    .await
                    .map_err(|e| {
                        Error::new(ErrorType::Custom(RESOLUTION_FAILED))
                            .more_context(e.to_string())
                    })?;
                *addresses
                    .first()
                    .ok_or_else(|| Error::new(ErrorType::Custom(RESOLUTION_FAILED)))?
            }
        };

        trace!(
            host = %self.origin.host,
            address = %address,
            port = self.origin.port,
            "Building upstream peer"
        );

        let mut peer = HttpPeer::new(
            (address, self.origin.port),
            self.origin.use_tls,
            self.origin.host.clone(),
        );

        if self.origin.use_tls {
            peer.sni = self.origin.host.clone();
        }

        let origin_cfg = &self.config.origin;
        peer.options.connection_timeout = Some(origin_cfg.connect_timeout());
        peer.options.read_timeout = Some(origin_cfg.read_timeout());
        peer.options.write_timeout = Some(origin_cfg.write_timeout());
        peer.options.idle_timeout = Some(origin_cfg.keep_alive());

        Ok(Box::new(peer))
    }

    /// Rewrites request headers before sending to the origin.
    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let peer_addr = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip().to_string());
        let client_ip = effective_client_ip(&upstream_request.headers, peer_addr);

        upstream_request.insert_header("x-forwarded-for", client_ip.as_str())?;
        upstream_request.insert_header("x-real-ip", client_ip.as_str())?;
        // The gateway sits at the TLS boundary; the origin always sees https.
        upstream_request.insert_header("x-forwarded-proto", "https")?;
        upstream_request.insert_header(header::HOST, self.origin.authority())?;

        ctx.client_ip = client_ip;

        trace!(
            method = %upstream_request.method,
            uri = %upstream_request.uri,
            "Forwarding request to origin"
        );

        Ok(())
    }

    /// Filters response headers and picks up the invalidation signal.
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        // Header lookup is case-insensitive by construction.
        let signal = upstream_response
            .headers
            .get(INVALIDATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(pattern) = signal {
            info!(pattern = %pattern, "Invalidation signal detected on origin response");
            // Fire and forget: accumulation is synchronous and cheap, the
            // delivery runs on a detached task that logs its own failures.
            self.dispatcher.debounce_invalidate(&pattern);
        }

        filter_response_headers(upstream_response);

        trace!(status = %upstream_response.status, "Relaying origin response");

        Ok(())
    }

    /// Single funnel for all proxying failures.
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        // A dead cached address must not outlive the connection that exposed
        // it. Resolution failures are the exception: their short-lived
        // failure marker is the re-query schedule, so it stays.
        let resolution_failure =
            matches!(e.etype(), ErrorType::Custom(msg) if *msg == RESOLUTION_FAILED);
        if !resolution_failure && self.origin_ip.is_none() {
            self.resolver.invalidate(&self.origin.host);
        }

        error!(
            error = %e,
            host = %self.origin.host,
            client_ip = %ctx.client_ip,
            "Proxying failed"
        );

        if session.response_written().is_none() {
            self.respond_maintenance(session).await;
        } else {
            warn!("Origin failed mid-response; closing the client connection");
        }

        FailToProxy {
            error_code: 503,
            can_reuse_downstream: false,
        }
    }

    /// Access log after request completion.
    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);

        debug!(
            method = %session.req_header().method,
            path = %session.req_header().uri.path(),
            status = status,
            client_ip = %ctx.client_ip,
            local = ctx.served_locally,
            failed = e.is_some(),
            "Request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;

    fn create_test_service() -> GatewayService {
        let config = AppConfig {
            webhook: WebhookConfig {
                url: "http://127.0.0.1:9/hooks/purge".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolver = ResolvingCache::new(&config.resolver);
        let dispatcher =
            InvalidationDispatcher::new(config.webhook.clone(), config.origin.public_url.clone());
        GatewayService::new(Arc::new(config), resolver, dispatcher).unwrap()
    }

    #[test]
    fn test_service_creation() {
        let service = create_test_service();
        assert_eq!(service.origin.host, "localhost");
        assert_eq!(service.origin.port, 2368);
        assert!(!service.origin.use_tls);
        assert!(service.origin_ip.is_none());

        let ctx = service.new_ctx();
        assert!(ctx.client_ip.is_empty());
        assert!(!ctx.served_locally);
    }

    #[test]
    fn test_literal_ip_origin_skips_resolution() {
        let config = AppConfig {
            origin: crate::config::OriginConfig {
                url: "http://10.0.0.5:2368".to_string(),
                ..Default::default()
            },
            webhook: WebhookConfig {
                url: "http://127.0.0.1:9/hooks/purge".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolver = ResolvingCache::new(&config.resolver);
        let dispatcher =
            InvalidationDispatcher::new(config.webhook.clone(), None);
        let service = GatewayService::new(Arc::new(config), resolver, dispatcher).unwrap();

        assert_eq!(service.origin_ip, Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_effective_client_ip_preference() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        headers.insert("x-original-forwarded-for", "198.51.100.4".parse().unwrap());

        // Original-forwarded-for wins over forwarded-for.
        assert_eq!(
            effective_client_ip(&headers, Some("192.0.2.1".to_string())),
            "198.51.100.4"
        );

        headers.remove("x-original-forwarded-for");
        assert_eq!(
            effective_client_ip(&headers, Some("192.0.2.1".to_string())),
            "203.0.113.9"
        );

        // Falls back to the socket peer, then to empty.
        headers.remove("x-forwarded-for");
        assert_eq!(
            effective_client_ip(&headers, Some("192.0.2.1".to_string())),
            "192.0.2.1"
        );
        assert_eq!(effective_client_ip(&headers, None), "");
    }

    #[test]
    fn test_response_headers_stripped() {
        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.insert_header("X-Powered-By", "Express").unwrap();
        resp.insert_header("Server", "nginx/1.24").unwrap();
        resp.insert_header("X-AspNet-Version", "4.0.30319").unwrap();
        resp.insert_header("X-AspNetMvc-Version", "5.2").unwrap();
        resp.insert_header("Content-Type", "text/html").unwrap();

        filter_response_headers(&mut resp);

        for name in STRIPPED_RESPONSE_HEADERS {
            assert!(resp.headers.get(name).is_none(), "{} should be stripped", name);
        }
        assert!(resp.headers.get("content-type").is_some());
    }

    #[test]
    fn test_collapse_duplicate_slashes() {
        assert_eq!(collapse_duplicate_slashes("/a//b"), "/a/b");
        assert_eq!(collapse_duplicate_slashes("//a///b////c"), "/a/b/c");
        assert_eq!(collapse_duplicate_slashes("/already/clean"), "/already/clean");
        assert_eq!(collapse_duplicate_slashes("/"), "/");
    }
}
