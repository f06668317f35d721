//! HTTP server exposing the cache.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE streaming of analytics reports
//! - [`metrics`]: Prometheus text exposition

pub mod api;
pub mod metrics;
pub mod streaming;
