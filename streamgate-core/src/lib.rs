//! Streamgate Core - Tunnel delivery engine and cookie rotation
//!
//! This crate provides the fundamental building blocks for the media-retrieval
//! gateway: the rotating per-service cookie store with cluster replication,
//! upstream request header construction, the ffmpeg subprocess pipeline that
//! streams processed media into an HTTP response, and the direct reverse-proxy
//! tunnel used when no transformation is needed.

pub mod config;
pub mod cookies;
pub mod estimate;
pub mod headers;
pub mod tunnel;

// Re-export main types for convenient access
pub use config::GatewayConfig;
pub use cookies::{Cookie, CookieError, CookieStore};
pub use estimate::{LengthProbe, estimate_total};
pub use tunnel::{StreamDescriptor, TunnelError, TunnelPlan};

/// Core errors that can bubble up from any Streamgate subsystem.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Cookie error: {0}")]
    Cookie(#[from] CookieError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Cookie(e) => match e {
                CookieError::UnknownService { service } => {
                    format!("Unknown cookie service: {service}")
                }
                CookieError::NoCookieAvailable { service } => {
                    format!("No cookie available for {service}")
                }
                _ => "Cookie error occurred".to_string(),
            },
            GatewayError::Tunnel(e) => match e {
                TunnelError::WrongInputCount { expected, got } => {
                    format!("Expected {expected} input URLs, got {got}")
                }
                TunnelError::UnsupportedMetadataTag { tag } => {
                    format!("Unsupported metadata tag: {tag}")
                }
                _ => "Delivery error occurred".to_string(),
            },
            GatewayError::Configuration { .. } => "Configuration error occurred".to_string(),
            GatewayError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Tunnel(TunnelError::WrongInputCount { .. })
                | GatewayError::Tunnel(TunnelError::UnsupportedMetadataTag { .. })
                | GatewayError::Cookie(CookieError::UnknownService { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
