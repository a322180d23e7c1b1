//! Cache-invalidation debouncing and webhook delivery.
//!
//! The origin announces changed content with a response header carrying a
//! comma-separated list of path patterns. Signals arrive in bursts (a single
//! editorial action can touch many pages), so they are coalesced: every
//! signal unions its tokens into a pending set and re-arms the debounce
//! window for its full duration. When the window finally elapses the set is
//! snapshotted, cleared, and delivered to the configured purge webhook with
//! bounded retries. A delivery in flight never blocks the next cycle from
//! accumulating.
//!
//! Delivery is best effort: once the retry budget is exhausted the cycle is
//! logged and dropped. There is no persistent queue.

use crate::config::WebhookConfig;
use crate::error::{GatewayError, Result};
use chrono::{SecondsFormat, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Sentinel the origin sends for a whole-site purge, regex form.
const PURGE_ALL_REGEX_FORM: &str = "/$/";

/// Sentinel the origin sends for a whole-site purge, wildcard form.
const PURGE_ALL_WILDCARD: &str = "/*";

/// One invalidation ready for delivery. Produced per dispatch, consumed
/// immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationDescriptor {
    /// URLs to purge, absolutized against the public base URL when one is
    /// configured.
    pub urls: Vec<String>,

    /// Whether the entire site is to be purged.
    pub purge_all: bool,

    /// The composite raw pattern this descriptor was parsed from.
    pub pattern: String,

    /// Dispatch time, ISO-8601.
    pub timestamp: String,
}

/// Accumulated tokens for the currently armed debounce window.
#[derive(Default)]
struct PendingBatch {
    tokens: BTreeSet<String>,
    /// Bumped on every signal; a sleeper that wakes under a stale generation
    /// was superseded and returns without firing, so at most one timer is
    /// logically armed.
    generation: u64,
    armed: bool,
}

/// Debounces invalidation signals and delivers them to the purge webhook.
#[derive(Clone)]
pub struct InvalidationDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    webhook: WebhookConfig,
    public_url: Option<String>,
    client: reqwest::Client,
    batch: Mutex<PendingBatch>,
}

impl InvalidationDispatcher {
    /// Creates a dispatcher for a validated webhook configuration.
    pub fn new(webhook: WebhookConfig, public_url: Option<String>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                webhook,
                public_url,
                client: reqwest::Client::new(),
                batch: Mutex::new(PendingBatch::default()),
            }),
        }
    }

    /// Registers an invalidation signal and (re)arms the debounce window.
    ///
    /// Tokens from the raw pattern are unioned into the pending set;
    /// duplicates collapse. Each call restarts the window for its full
    /// duration, so an unbroken stream of signals keeps postponing dispatch.
    /// Returns immediately; parsing and delivery happen on a detached task
    /// that logs its own failures.
    pub fn debounce_invalidate(&self, raw: &str) {
        let generation = {
            let mut batch = self.inner.batch.lock().unwrap();
            for token in raw.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    batch.tokens.insert(token.to_string());
                }
            }
            if batch.tokens.is_empty() {
                return;
            }
            batch.generation += 1;
            batch.armed = true;
            batch.generation
        };

        debug!(pattern = %raw, "Invalidation signal registered; debounce window armed");

        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dispatcher.inner.webhook.debounce_window()).await;

            let snapshot = {
                let mut batch = dispatcher.inner.batch.lock().unwrap();
                if batch.generation != generation {
                    // A later signal re-armed the window.
                    return;
                }
                batch.armed = false;
                std::mem::take(&mut batch.tokens)
            };

            if snapshot.is_empty() {
                return;
            }

            // The batch is already Idle: a new cycle may accumulate while
            // this delivery runs.
            let joined = snapshot.into_iter().collect::<Vec<_>>().join(", ");
            let descriptor = dispatcher.parse_pattern(&joined);
            if let Err(e) = dispatcher.dispatch(&descriptor).await {
                error!(
                    error = %e,
                    pattern = %descriptor.pattern,
                    "Dropping invalidation cycle"
                );
            }
        });
    }

    /// Parses a raw pattern into an invalidation descriptor.
    ///
    /// A full-purge sentinel anywhere in the pattern wins outright: the
    /// descriptor is a pure whole-site purge and any partial tokens are
    /// discarded.
    pub fn parse_pattern(&self, raw: &str) -> InvalidationDescriptor {
        let tokens: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();

        let purge_all = tokens
            .iter()
            .any(|t| *t == PURGE_ALL_REGEX_FORM || *t == PURGE_ALL_WILDCARD);

        let urls = if purge_all {
            vec![PURGE_ALL_WILDCARD.to_string()]
        } else {
            tokens.iter().map(|t| self.absolutize(t)).collect()
        };

        InvalidationDescriptor {
            urls,
            purge_all,
            pattern: raw.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Prefixes site-relative tokens with the public base URL, when one is
    /// configured. Absolute tokens pass through unchanged.
    fn absolutize(&self, token: &str) -> String {
        match &self.inner.public_url {
            Some(base) if token.starts_with('/') => format!("{}{}", base, token),
            _ => token.to_string(),
        }
    }

    /// Delivers one invalidation to the webhook, retrying on failure.
    ///
    /// Every attempt gets a fresh timeout; a previous attempt's elapsed time
    /// never eats into a later attempt's budget. A non-success status, a
    /// transport error, and a timeout all count as a failed attempt.
    pub async fn dispatch(&self, descriptor: &InvalidationDescriptor) -> Result<()> {
        let webhook = &self.inner.webhook;

        let method: http::Method = webhook.method.parse().map_err(|_| {
            GatewayError::WebhookDelivery {
                attempts: 0,
                message: format!("invalid method: {}", webhook.method),
            }
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in render_headers(&webhook.headers, webhook.secret.as_deref()) {
            let name: HeaderName = name.parse().map_err(|_| GatewayError::WebhookDelivery {
                attempts: 0,
                message: format!("invalid header name: {}", name),
            })?;
            let value = HeaderValue::from_str(&value).map_err(|_| {
                GatewayError::WebhookDelivery {
                    attempts: 0,
                    message: "header value contains invalid characters".to_string(),
                }
            })?;
            headers.insert(name, value);
        }

        let body = render_body(&webhook.body_template, descriptor);

        let mut last_failure = String::new();
        for attempt in 1..=webhook.retry_count {
            let request = self
                .inner
                .client
                .request(method.clone(), &webhook.url)
                .headers(headers.clone())
                .body(body.clone())
                .timeout(webhook.attempt_timeout());

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        attempt,
                        urls = descriptor.urls.len(),
                        purge_all = descriptor.purge_all,
                        "Invalidation webhook delivered"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_failure = format!("HTTP {}", response.status());
                    warn!(
                        attempt,
                        max_attempts = webhook.retry_count,
                        status = %response.status(),
                        "Webhook attempt failed"
                    );
                }
                Err(e) => {
                    last_failure = e.to_string();
                    warn!(
                        attempt,
                        max_attempts = webhook.retry_count,
                        error = %e,
                        "Webhook attempt failed"
                    );
                }
            }

            if attempt < webhook.retry_count {
                tokio::time::sleep(webhook.retry_delay()).await;
            }
        }

        Err(GatewayError::WebhookDelivery {
            attempts: webhook.retry_count,
            message: last_failure,
        })
    }

    #[cfg(test)]
    fn pending(&self) -> (Vec<String>, bool) {
        let batch = self.inner.batch.lock().unwrap();
        (batch.tokens.iter().cloned().collect(), batch.armed)
    }
}

/// Renders the body template against a descriptor.
///
/// Exactly four placeholders are recognized: `${urls}` becomes a JSON array,
/// `${purgeAll}` a JSON boolean, `${timestamp}` the bare ISO-8601 string, and
/// `${pattern}` a JSON-quoted string. Anything else is left verbatim.
pub fn render_body(template: &str, descriptor: &InvalidationDescriptor) -> String {
    let urls = serde_json::to_string(&descriptor.urls).unwrap_or_else(|_| "[]".to_string());
    let pattern =
        serde_json::to_string(&descriptor.pattern).unwrap_or_else(|_| "\"\"".to_string());

    template
        .replace("${urls}", &urls)
        .replace("${purgeAll}", if descriptor.purge_all { "true" } else { "false" })
        .replace("${timestamp}", &descriptor.timestamp)
        .replace("${pattern}", &pattern)
}

/// Renders the configured header templates, substituting `${secret}`.
/// Headers without the placeholder are copied unchanged.
pub fn render_headers(
    templates: &HashMap<String, String>,
    secret: Option<&str>,
) -> HashMap<String, String> {
    templates
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                value.replace("${secret}", secret.unwrap_or("")),
            )
        })
        .collect()
}
