//! Shared utilities for the voicelink binaries.
//!
//! This crate provides the observability layer (tracing init, Prometheus
//! metrics with an optional scrape endpoint) and CLI policy shared by the
//! client binaries. Protocol code lives in `voicelink-transport`.

pub mod cli;
pub mod observability;

pub use cli::ColorWhen;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
