//! Axum middleware layers

pub mod correlation_id;
