//! Configuration management for the gateway.
//!
//! Loads and validates the YAML configuration file. The configuration is
//! immutable for the lifetime of the process: it is loaded once in `main`,
//! validated, and passed by reference into the core components. Anything that
//! can be rejected (bad URLs, bad header names, malformed templates) is
//! rejected here, at startup, never at request time.

use crate::error::{GatewayError, Result};
use http::Uri;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,

    /// Number of worker threads (0 = CPU cores).
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            workers: 0,
        }
    }
}

/// Resolved connection target for the origin, derived from the origin URL.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginTarget {
    /// Hostname (or IP literal) of the origin.
    pub host: String,

    /// Port, defaulted from the URL scheme when absent.
    pub port: u16,

    /// Whether upstream connections use TLS.
    pub use_tls: bool,
}

impl OriginTarget {
    /// The authority string used for the upstream Host header.
    pub fn authority(&self) -> String {
        let default_port = if self.use_tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Origin (upstream) configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL of the origin server.
    pub url: String,

    /// Public base URL of the site, used to absolutize invalidation paths.
    pub public_url: Option<String>,

    /// Upstream keep-alive connection pool size.
    pub pool_size: usize,

    /// Keep-alive duration for idle pooled connections, in seconds.
    pub keep_alive_secs: u64,

    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Read timeout in seconds.
    pub read_timeout_secs: u64,

    /// Write timeout in seconds.
    pub write_timeout_secs: u64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:2368".to_string(),
            public_url: None,
            pool_size: 100,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
        }
    }
}

impl OriginConfig {
    /// Validates the origin section.
    pub fn validate(&self) -> Result<()> {
        parse_http_url(&self.url, "origin.url")?;
        if let Some(ref public) = self.public_url {
            parse_http_url(public, "origin.public_url")?;
        }
        if self.pool_size == 0 {
            return Err(GatewayError::config_validation(
                "origin.pool_size must be at least 1",
            ));
        }
        Ok(())
    }

    /// Derives the upstream connection target from the origin URL.
    ///
    /// Only valid after `validate()` has passed.
    pub fn target(&self) -> Result<OriginTarget> {
        let uri = parse_http_url(&self.url, "origin.url")?;
        let use_tls = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .ok_or_else(|| GatewayError::config_validation("origin.url is missing a host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if use_tls { 443 } else { 80 });

        Ok(OriginTarget { host, port, use_tls })
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Write timeout as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Idle keep-alive duration as a `Duration`.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Webhook (purge endpoint) configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    /// Target URL for invalidation deliveries.
    pub url: String,

    /// HTTP method for deliveries.
    pub method: String,

    /// Shared secret substituted into header templates.
    pub secret: Option<String>,

    /// Custom header templates; values may contain `${secret}`.
    pub headers: HashMap<String, String>,

    /// Body template with `${urls}`, `${purgeAll}`, `${timestamp}`,
    /// `${pattern}` placeholders.
    pub body_template: String,

    /// Maximum delivery attempts per invalidation cycle.
    pub retry_count: u32,

    /// Delay between failed attempts, in milliseconds.
    pub retry_delay_ms: u64,

    /// Per-attempt delivery timeout, in seconds.
    pub timeout_secs: u64,

    /// Debounce window for coalescing invalidation signals, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "POST".to_string(),
            secret: None,
            headers: HashMap::new(),
            body_template:
                r#"{"urls": ${urls}, "timestamp": "${timestamp}", "purgeAll": ${purgeAll}}"#
                    .to_string(),
            retry_count: 3,
            retry_delay_ms: 1000,
            timeout_secs: 30,
            debounce_ms: 10_000,
        }
    }
}

impl WebhookConfig {
    /// Validates the webhook section.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(GatewayError::config_validation(
                "webhook.url must be configured",
            ));
        }
        parse_http_url(&self.url, "webhook.url")?;

        self.method
            .parse::<http::Method>()
            .map_err(|_| {
                GatewayError::config_validation(format!(
                    "Invalid webhook.method: {}",
                    self.method
                ))
            })?;

        for name in self.headers.keys() {
            name.parse::<http::header::HeaderName>().map_err(|_| {
                GatewayError::config_validation(format!("Invalid webhook header name: {}", name))
            })?;
        }

        if self.retry_count == 0 {
            return Err(GatewayError::config_validation(
                "webhook.retry_count must be at least 1",
            ));
        }

        validate_template(&self.body_template)?;

        Ok(())
    }

    /// Whether the body template references any of the recognized
    /// placeholders. Used for a startup warning only.
    pub fn template_uses_placeholders(&self) -> bool {
        const PLACEHOLDERS: [&str; 4] = ["${urls}", "${purgeAll}", "${timestamp}", "${pattern}"];
        PLACEHOLDERS
            .iter()
            .any(|p| self.body_template.contains(p))
    }

    /// Delay between failed attempts as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Per-attempt timeout as a `Duration`.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Debounce window as a `Duration`.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Resolver cache configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Cap on how long a successful resolution may be cached, in seconds.
    /// The effective entry TTL is min(DNS TTL, this cap).
    pub max_ttl_secs: u64,

    /// Lifetime of a cached resolution failure, in seconds. Must be shorter
    /// than `max_ttl_secs` so failures always re-query before successes
    /// would.
    pub failure_ttl_secs: u64,

    /// Explicit nameservers; empty means the system configuration.
    pub nameservers: Vec<SocketAddr>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_ttl_secs: 30,
            failure_ttl_secs: 5,
            nameservers: Vec::new(),
        }
    }
}

impl ResolverConfig {
    /// Validates the resolver section.
    pub fn validate(&self) -> Result<()> {
        if self.max_ttl_secs == 0 {
            return Err(GatewayError::config_validation(
                "resolver.max_ttl_secs must be at least 1",
            ));
        }
        if self.failure_ttl_secs >= self.max_ttl_secs {
            return Err(GatewayError::config_validation(format!(
                "resolver.failure_ttl_secs ({}) must be shorter than resolver.max_ttl_secs ({})",
                self.failure_ttl_secs, self.max_ttl_secs
            )));
        }
        Ok(())
    }

    /// Success-entry TTL cap as a `Duration`.
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// Failure-entry TTL as a `Duration`.
    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_ttl_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Origin (upstream) configuration.
    pub origin: OriginConfig,

    /// Webhook configuration.
    pub webhook: WebhookConfig,

    /// Resolver cache configuration.
    pub resolver: ResolverConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(GatewayError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let mut config: AppConfig = serde_yaml::from_str(&contents)
            .map_err(|e| GatewayError::config_parse(e.to_string()))?;

        config.normalize();
        config.validate()?;

        Ok(config)
    }

    /// Strips trailing slashes from the base URLs so path joining is
    /// unambiguous.
    fn normalize(&mut self) {
        while self.origin.url.ends_with('/') {
            self.origin.url.pop();
        }
        if let Some(ref mut public) = self.origin.public_url {
            while public.ends_with('/') {
                public.pop();
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(GatewayError::config_validation(
                "Server listen address cannot be empty",
            ));
        }

        self.origin.validate()?;
        self.webhook.validate()?;
        self.resolver.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(GatewayError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }
}

/// Parses a URL expected to be absolute http(s), with a config-field name for
/// error messages.
fn parse_http_url(value: &str, field: &str) -> Result<Uri> {
    let uri: Uri = value
        .parse()
        .map_err(|_| GatewayError::config_validation(format!("Invalid URL in {}: {}", field, value)))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(GatewayError::config_validation(format!(
                "{} must use http or https: {}",
                field, value
            )))
        }
    }

    if uri.host().is_none() {
        return Err(GatewayError::config_validation(format!(
            "{} is missing a host: {}",
            field, value
        )));
    }

    Ok(uri)
}

/// Checks that a body template has balanced braces. Placeholder substitution
/// itself never fails, so this is the whole well-formedness contract.
fn validate_template(template: &str) -> Result<()> {
    let open = template.matches('{').count();
    let close = template.matches('}').count();

    if open != close {
        return Err(GatewayError::template(format!(
            "Unbalanced braces ({} opening, {} closing)",
            open, close
        )));
    }

    Ok(())
}
