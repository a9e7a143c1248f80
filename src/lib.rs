//! Turnstile - Token-Aware HTTP Rate Limiting Service
//!
//! This crate implements an HTTP service that rate limits callers with
//! per-identity token buckets. Identities come from an API-key header or,
//! when absent, the client address.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
