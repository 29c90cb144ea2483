//! Streamgate Web - JSON API server
//!
//! HTTP surface of the gateway: accepts delivery descriptors and serves
//! the resulting media streams, plus a health endpoint for deployment
//! checks.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]

pub mod handlers;
pub mod server;

pub use server::{AppState, run_server};
