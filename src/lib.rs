//! # CMS Gateway
//!
//! A reverse-proxy gateway that sits in front of a content-management origin
//! server. It forwards all inbound traffic to the origin and handles two
//! things the origin cannot: surviving origin address changes at runtime, and
//! turning the origin's fire-and-forget cache-invalidation header into
//! reliable webhook delivery.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup
//! - [`proxy`]: The Pingora-based forwarding service
//! - [`resolver`]: Bounded-TTL origin address cache
//! - [`invalidation`]: Invalidation debouncing and webhook delivery
//! - [`pages`]: Static response documents
//!
//! ## Request flow
//!
//! 1. An inbound request is forwarded to the origin over a pooled connection;
//!    the origin address comes from [`resolver::ResolvingCache`], which caps
//!    every cached resolution at a configurable TTL.
//! 2. The origin response is relayed after implementation-detail headers are
//!    stripped. If it carries an `x-cache-invalidate` header, the raw pattern
//!    goes to [`invalidation::InvalidationDispatcher`] without delaying the
//!    response.
//! 3. The dispatcher coalesces signals inside a debounce window, then
//!    delivers one webhook call with bounded retries.
//! 4. If the origin is unreachable, the resolver entry is invalidated and the
//!    client receives a static maintenance page with status 503.

pub mod config;
pub mod error;
pub mod invalidation;
pub mod logging;
pub mod pages;
pub mod proxy;
pub mod resolver;

pub use config::{AppConfig, OriginConfig, ResolverConfig, ServerConfig, WebhookConfig};
pub use error::{GatewayError, Result};
pub use invalidation::{InvalidationDescriptor, InvalidationDispatcher};
pub use proxy::GatewayService;
pub use resolver::{AddressFamily, ResolvingCache};
