//! Turnstile - Request Admission and Rate Limiting
//!
//! This crate decides, per incoming HTTP request, whether the caller is still
//! within its rate limit. Counting state lives in a pluggable
//! [`store::CounterStore`] so that replicas sharing a store share limits.
//! Three window algorithms are provided (fixed window, sliding log and
//! bucketed sliding counter), along with per-plan tiers and a tower layer
//! that attaches rate limit headers and applies fail-open or fail-closed
//! behavior when the store is unavailable.

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
