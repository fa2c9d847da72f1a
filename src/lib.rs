//! Profilegate - A reverse proxy that records the traffic it forwards
//!
//! This library provides a transparent reverse proxy that:
//! - Forwards every request to a single backend origin
//! - Captures method, URL, headers, client address, browser and receive time
//!   of each request into a JSON record store
//! - Records either inline before forwarding (fail-closed) or through a
//!   bounded queue and background writer (fail-open)
//! - Drains and flushes captured records on shutdown

pub mod browser;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod pool;
pub mod proxy;
pub mod record;
pub mod recorder;
pub mod store;

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
