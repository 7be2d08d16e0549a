//! Duoroute - Hybrid dual-backend chat orchestrator
//!
//! This library routes each chat request to one of two execution engines (a
//! multi-step tool agent or a lower-latency direct model) based on query
//! classification, with one-shot fallback to the other engine, gradual A/B
//! rollout with automatic rollback, and TTL-bounded prompt and resource
//! caches.

pub mod backends;
pub mod brain;
pub mod cli;
pub mod config;
pub mod error;
pub mod experiment;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod prompts;
pub mod request_log;
pub mod resources;
pub mod telemetry;
