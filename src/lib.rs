//! predictive-cache: an in-memory key/value cache that learns access patterns.
//!
//! Items are tiered by how often they are read, compressed adaptively and
//! evicted by a blended priority/probability/recency score. Keys predicted to
//! follow a hit are prefetched through registered loaders, and a periodic
//! analytics loop tunes compression and prediction sensitivity.

pub mod cache;
pub mod config;
pub mod server;
