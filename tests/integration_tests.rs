//! Integration tests for cms-gateway.
//!
//! These tests verify the behavior of the gateway components working
//! together: configuration loading, invalidation debouncing and delivery
//! against a local capture server, and the resolver cache.

use cms_gateway::config::{AppConfig, WebhookConfig};
use cms_gateway::error::GatewayError;
use cms_gateway::invalidation::InvalidationDispatcher;
use cms_gateway::resolver::{AddressFamily, ResolvingCache};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Helper to create a temporary config file.
fn create_temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A minimal local HTTP server that records webhook deliveries.
mod capture_server {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub struct CaptureServer {
        pub addr: SocketAddr,
        hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl CaptureServer {
        pub fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        pub fn bodies(&self) -> Vec<String> {
            self.bodies.lock().unwrap().clone()
        }
    }

    fn headers_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    fn content_length(head: &str) -> usize {
        for line in head.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    return value.trim().parse().unwrap_or(0);
                }
            }
        }
        0
    }

    /// Binds a throwaway listener that answers every request with `status`.
    pub async fn spawn(status: u16) -> CaptureServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let hits_task = hits.clone();
        let bodies_task = bodies.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = hits_task.clone();
                let bodies = bodies_task.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let (head_len, body_len) = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(end) = headers_end(&buf) {
                            let head = String::from_utf8_lossy(&buf[..end]).to_string();
                            break (end, content_length(&head));
                        }
                    };

                    while buf.len() < head_len + body_len {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let body = String::from_utf8_lossy(&buf[head_len..]).to_string();
                    hits.fetch_add(1, Ordering::SeqCst);
                    bodies.lock().unwrap().push(body);

                    let response = format!(
                        "HTTP/1.1 {} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        CaptureServer { addr, hits, bodies }
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_full_config_load() {
        let yaml = r#"
server:
  listen: "127.0.0.1:8080"
  workers: 4

origin:
  url: "http://ghost.internal:2368"
  public_url: "https://blog.example.com"
  pool_size: 64
  keep_alive_secs: 30
  connect_timeout_secs: 5

webhook:
  url: "https://purge.example.com/hooks/cache"
  method: "POST"
  secret: "purge-key"
  headers:
    x-purge-key: "Bearer ${secret}"
  retry_count: 4
  retry_delay_ms: 500
  timeout_secs: 10
  debounce_ms: 5000

resolver:
  max_ttl_secs: 20
  failure_ttl_secs: 3

logging:
  level: "debug"
  output: "stderr"
  format: "json"
  include_target: false
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.workers, 4);

        assert_eq!(config.origin.url, "http://ghost.internal:2368");
        assert_eq!(
            config.origin.public_url.as_deref(),
            Some("https://blog.example.com")
        );
        assert_eq!(config.origin.pool_size, 64);
        assert_eq!(config.origin.keep_alive_secs, 30);

        assert_eq!(config.webhook.secret.as_deref(), Some("purge-key"));
        assert_eq!(
            config.webhook.headers.get("x-purge-key").unwrap(),
            "Bearer ${secret}"
        );
        assert_eq!(config.webhook.retry_count, 4);
        assert_eq!(config.webhook.debounce_ms, 5000);

        assert_eq!(config.resolver.max_ttl_secs, 20);
        assert_eq!(config.resolver.failure_ttl_secs, 3);

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.include_target);
    }

    #[test]
    fn test_webhook_url_is_required() {
        let yaml = r#"
origin:
  url: "http://localhost:2368"
"#;
        let file = create_temp_config(yaml);
        let result = AppConfig::load(file.path());
        match result {
            Err(GatewayError::ConfigValidation { message }) => {
                assert!(message.contains("webhook.url"));
            }
            other => panic!("Expected ConfigValidation error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_malformed_template_is_fatal_at_load() {
        let yaml = r#"
webhook:
  url: "https://purge.example.com/hooks/cache"
  body_template: '{"urls": ${urls}, "nested": {'
"#;
        let file = create_temp_config(yaml);
        let result = AppConfig::load(file.path());
        assert!(matches!(result, Err(GatewayError::Template { .. })));
    }

    #[test]
    fn test_failure_ttl_validation() {
        let yaml = r#"
webhook:
  url: "https://purge.example.com/hooks/cache"
resolver:
  max_ttl_secs: 5
  failure_ttl_secs: 30
"#;
        let file = create_temp_config(yaml);
        assert!(AppConfig::load(file.path()).is_err());
    }
}

mod invalidation_tests {
    use super::*;

    fn dispatcher_for(url: String, debounce_ms: u64, retry_count: u32) -> InvalidationDispatcher {
        let webhook = WebhookConfig {
            url,
            debounce_ms,
            retry_count,
            retry_delay_ms: 50,
            timeout_secs: 5,
            ..Default::default()
        };
        InvalidationDispatcher::new(webhook, None)
    }

    #[tokio::test]
    async fn test_one_window_one_dispatch_with_union() {
        let server = capture_server::spawn(200).await;
        let dispatcher = dispatcher_for(server.url("/hooks/purge"), 100, 1);

        // A burst of signals inside one window, with a duplicate.
        dispatcher.debounce_invalidate("/post-1");
        dispatcher.debounce_invalidate("/post-1, /rss");
        dispatcher.debounce_invalidate("/page/2");

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(server.hits(), 1, "burst must coalesce into one delivery");

        let bodies = server.bodies();
        let value: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(
            value["urls"],
            serde_json::json!(["/page/2", "/post-1", "/rss"])
        );
        assert_eq!(value["purgeAll"], false);
    }

    #[tokio::test]
    async fn test_full_purge_sentinel_wins_in_window() {
        let server = capture_server::spawn(200).await;
        let dispatcher = dispatcher_for(server.url("/hooks/purge"), 100, 1);

        dispatcher.debounce_invalidate("/post-1");
        dispatcher.debounce_invalidate("/$/");

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(server.hits(), 1);
        let value: serde_json::Value = serde_json::from_str(&server.bodies()[0]).unwrap();
        assert_eq!(value["urls"], serde_json::json!(["/*"]));
        assert_eq!(value["purgeAll"], true);
    }

    #[tokio::test]
    async fn test_cycles_are_independent() {
        let server = capture_server::spawn(200).await;
        let dispatcher = dispatcher_for(server.url("/hooks/purge"), 100, 1);

        dispatcher.debounce_invalidate("/first");
        tokio::time::sleep(Duration::from_millis(400)).await;

        dispatcher.debounce_invalidate("/second");
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(server.hits(), 2, "separate windows dispatch separately");
        let first: serde_json::Value = serde_json::from_str(&server.bodies()[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&server.bodies()[1]).unwrap();
        assert_eq!(first["urls"], serde_json::json!(["/first"]));
        assert_eq!(second["urls"], serde_json::json!(["/second"]));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_counts_attempts() {
        let server = capture_server::spawn(500).await;
        let dispatcher = dispatcher_for(server.url("/hooks/purge"), 100, 3);

        let descriptor = dispatcher.parse_pattern("/post-1");
        let result = dispatcher.dispatch(&descriptor).await;

        assert_eq!(server.hits(), 3, "exactly retry_count attempts, no 4th");
        match result {
            Err(GatewayError::WebhookDelivery { attempts, message }) => {
                assert_eq!(attempts, 3);
                assert!(message.contains("500"), "failure reason: {}", message);
            }
            other => panic!("Expected WebhookDelivery error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_success_stops_retrying() {
        let server = capture_server::spawn(200).await;
        let dispatcher = dispatcher_for(server.url("/hooks/purge"), 100, 3);

        let descriptor = dispatcher.parse_pattern("/post-1");
        dispatcher.dispatch(&descriptor).await.unwrap();

        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn test_public_url_absolutization() {
        let webhook = WebhookConfig {
            url: "http://127.0.0.1:9/hooks/purge".to_string(),
            ..Default::default()
        };
        let dispatcher =
            InvalidationDispatcher::new(webhook, Some("https://example.com".to_string()));

        let descriptor = dispatcher.parse_pattern("/post-1, /rss");
        assert_eq!(
            descriptor.urls,
            vec!["https://example.com/post-1", "https://example.com/rss"]
        );
        assert!(!descriptor.purge_all);
        assert_eq!(descriptor.pattern, "/post-1, /rss");
    }
}

mod resolver_tests {
    use super::*;

    fn create_cache() -> ResolvingCache {
        ResolvingCache::new(&cms_gateway::config::ResolverConfig::default())
    }

    #[tokio::test]
    async fn test_localhost_resolution() {
        let cache = create_cache();

        let addresses = cache.lookup("localhost", AddressFamily::Any).await;
        let addresses = addresses.expect("localhost should resolve");
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(|a| a.is_loopback()));

        // Second lookup is served from the cache.
        let cached = cache.lookup("localhost", AddressFamily::Any).await.unwrap();
        assert_eq!(cached, addresses);
    }

    #[tokio::test]
    async fn test_invalidate_then_resolve_again() {
        let cache = create_cache();

        let before = cache
            .lookup("localhost", AddressFamily::Any)
            .await
            .expect("localhost should resolve");

        cache.invalidate("localhost");

        let after = cache
            .lookup("localhost", AddressFamily::Any)
            .await
            .expect("localhost should resolve after invalidation");
        assert_eq!(before, after);
    }

    #[test]
    fn test_invalidate_unknown_host_is_noop() {
        let cache = create_cache();
        cache.invalidate("never.seen.test");
    }
}
