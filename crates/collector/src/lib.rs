//! API Sentinel collector
//!
//! Hosts the ingestion gateway over HTTP, runs the detection workers and the
//! alert dispatcher, and exposes health and metrics endpoints.

pub mod api;
pub mod config;
pub mod pipeline;
