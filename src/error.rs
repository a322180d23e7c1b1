//! Error types for the gateway.
//!
//! Configuration and template problems are fatal at startup; resolution and
//! webhook-delivery failures are runtime conditions handled (and logged) at
//! their call sites.

use thiserror::Error;

/// Main error type for the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// Webhook body or header template is malformed.
    #[error("Invalid webhook template: {message}")]
    Template { message: String },

    /// Name resolution failed for the origin host.
    #[error("Resolution failed for {hostname}: {message}")]
    Resolution { hostname: String, message: String },

    /// Webhook delivery exhausted its retry budget.
    #[error("Webhook delivery failed after {attempts} attempt(s): {message}")]
    WebhookDelivery { attempts: u32, message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new template error.
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Creates a new resolution error.
    pub fn resolution(hostname: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            hostname: hostname.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
