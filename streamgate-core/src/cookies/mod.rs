//! Rotating per-service authentication cookies.
//!
//! Upstream origins require session cookies that are periodically refreshed
//! by their Set-Cookie responses. This module owns the process-wide cookie
//! table: loading it from a JSON file, serving random entries per service,
//! folding upstream refreshes back in, flushing dirty state to disk, and
//! keeping every process of a clustered deployment converged through a
//! small tagged-message protocol.

pub mod cookie;
pub mod refresh;
pub mod store;
pub mod sync;

pub use cookie::{Cookie, CookieOrigin};
pub use store::{CookieStore, RECOGNIZED_SERVICES};
pub use sync::{ChannelBus, ClusterBus, SyncMessage};

/// Errors that can occur in the cookie subsystem.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    /// Service name is not in the recognized set.
    #[error("Unknown cookie service: {service}")]
    UnknownService { service: String },

    /// Service is recognized but has no loaded entries.
    #[error("No cookie available for service: {service}")]
    NoCookieAvailable { service: String },

    /// Cookie file did not contain a JSON object.
    #[error("Invalid cookie file: {reason}")]
    InvalidFile { reason: String },

    /// Underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cookie file could not be parsed or serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
