//! # CMS Gateway
//!
//! A reverse-proxy gateway for a content-management origin with resilient
//! address resolution and debounced cache-invalidation webhooks.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default config path
//! cms-gateway
//!
//! # Run with custom config
//! cms-gateway -c /path/to/config.yaml
//!
//! # Override the listen address
//! cms-gateway -l 0.0.0.0:8080
//!
//! # Increase verbosity
//! cms-gateway -vvv  # trace level
//! ```
//!
//! ## Configuration
//!
//! See `config.yaml` for all available options. The webhook URL is the only
//! required setting.

mod config;
mod error;
mod invalidation;
mod logging;
mod pages;
mod proxy;
mod resolver;

use crate::config::AppConfig;
use crate::invalidation::InvalidationDispatcher;
use crate::proxy::GatewayService;
use crate::resolver::ResolvingCache;
use clap::Parser;
use pingora_core::server::configuration::ServerConf;
use pingora_core::server::Server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A reverse-proxy gateway for a CMS origin with resilient address resolution
/// and debounced cache-invalidation webhooks.
#[derive(Parser, Debug)]
#[command(name = "cms-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None, // Use config default
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()), // 4+ also traces dependencies
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

/// Application entry point. Pingora owns the runtimes; this thread blocks in
/// `run_forever`.
fn main() {
    let args = Args::parse();

    let (mut config, config_path) = load_config(&args);

    if let Some(ref listen) = args.listen {
        config.server.listen = listen.clone();
    }

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps())
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %config_path.display(),
        "Starting cms-gateway"
    );
    info!(origin = %config.origin.url, "Proxying to origin");
    if let Some(ref public) = config.origin.public_url {
        info!(public_url = %public, "Public site URL configured");
    }
    info!(webhook = %config.webhook.url, "Invalidation webhook configured");

    if !config.webhook.template_uses_placeholders() {
        warn!(
            "Webhook body template contains none of the expected placeholders \
             (${{urls}}, ${{purgeAll}}, ${{timestamp}}, ${{pattern}})"
        );
    }

    let mut server_conf = ServerConf::default();
    server_conf.threads = if config.server.workers > 0 {
        config.server.workers
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };
    server_conf.upstream_keepalive_pool_size = config.origin.pool_size;

    let mut server = Server::new_with_opt_and_conf(None, server_conf);
    server.bootstrap();

    let config = Arc::new(config);
    let resolver = ResolvingCache::new(&config.resolver);
    let dispatcher =
        InvalidationDispatcher::new(config.webhook.clone(), config.origin.public_url.clone());

    let service = match GatewayService::new(config.clone(), resolver, dispatcher) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Failed to assemble gateway service");
            std::process::exit(1);
        }
    };

    let mut gateway = pingora_proxy::http_proxy_service(&server.configuration, service);
    gateway.add_tcp(&config.server.listen);
    server.add_service(gateway);

    info!(listen = %config.server.listen, "Gateway listening");
    server.run_forever();
}

/// Locates and loads the configuration file.
///
/// The webhook URL has no usable default, so a missing configuration is fatal
/// rather than silently falling back to defaults.
fn load_config(args: &Args) -> (AppConfig, PathBuf) {
    let config_path = args.config.clone().or_else(|| {
        let defaults = [
            "./config.yaml",
            "./config.yml",
            "/etc/cms-gateway/config.yaml",
        ];
        defaults.iter().map(PathBuf::from).find(|p| p.exists())
    });

    let Some(path) = config_path else {
        eprintln!(
            "Error: no configuration file found (looked for ./config.yaml, \
             ./config.yml, /etc/cms-gateway/config.yaml); webhook.url must be configured"
        );
        std::process::exit(1);
    };

    match AppConfig::load(&path) {
        Ok(config) => (config, path),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
